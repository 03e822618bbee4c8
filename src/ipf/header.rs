//! Raw local-header access.
//!
//! The central directory does not carry the name bytes this format relies on,
//! so they are read straight from each entry's local header.

use byteorder::{ByteOrder, LittleEndian};
use std::path::{Component, Path};

use crate::error::{DecodeSkip, IpfError, Result};
use crate::io::ReadAt;

use super::structures::{LFH_NAME_LEN_OFFSET, LFH_SIGNATURE, LFH_SIZE, MAX_NAME_LEN};

/// Read the stored (encrypted) name of the local header at `offset`.
///
/// Never mutates the source. Any failure is reported as a [`DecodeSkip`] so the
/// caller can fall back for this entry alone.
pub async fn read_stored_name<R: ReadAt + ?Sized>(
    reader: &R,
    offset: u64,
) -> std::result::Result<Vec<u8>, DecodeSkip> {
    let size = reader.size();
    if offset.saturating_add(LFH_SIZE as u64) > size {
        return Err(DecodeSkip::OutOfBounds { offset });
    }

    let mut header = [0u8; LFH_SIZE];
    reader
        .read_exact_at(offset, &mut header)
        .await
        .map_err(|e| DecodeSkip::Read(e.to_string()))?;

    if &header[0..4] != LFH_SIGNATURE {
        return Err(DecodeSkip::BadSignature { offset });
    }

    let name_len = LittleEndian::read_u16(&header[LFH_NAME_LEN_OFFSET..]);
    if name_len == 0 || name_len > MAX_NAME_LEN {
        return Err(DecodeSkip::NameLength(name_len));
    }

    let name_start = offset + LFH_SIZE as u64;
    if name_start + name_len as u64 > size {
        return Err(DecodeSkip::OutOfBounds { offset });
    }

    let mut name = vec![0u8; name_len as usize];
    reader
        .read_exact_at(name_start, &mut name)
        .await
        .map_err(|e| DecodeSkip::Read(e.to_string()))?;
    Ok(name)
}

/// Offset of the first payload byte for the local header at `offset`.
///
/// The local name and extra lengths may differ from the directory's, so the
/// local header is the only reliable source.
pub async fn data_offset<R: ReadAt + ?Sized>(reader: &R, offset: u64) -> Result<u64> {
    let mut header = [0u8; LFH_SIZE];
    reader
        .read_exact_at(offset, &mut header)
        .await
        .map_err(|e| IpfError::io(format!("reading local header at {}", offset), e))?;

    if &header[0..4] != LFH_SIGNATURE {
        return Err(IpfError::Format(format!(
            "invalid local header at offset {}",
            offset
        )));
    }

    let file_name_length = LittleEndian::read_u16(&header[LFH_NAME_LEN_OFFSET..]) as u64;
    let extra_field_length = LittleEndian::read_u16(&header[LFH_NAME_LEN_OFFSET + 2..]) as u64;

    Ok(offset + LFH_SIZE as u64 + file_name_length + extra_field_length)
}

/// Whether `name` names a file strictly inside whatever root it is joined onto.
///
/// Both `/` and `\` count as separators, since archives built on Windows
/// store either. Names ending in a separator denote directories and fail.
pub fn is_safe_relative_path(name: &str) -> bool {
    if name.is_empty() || name.contains('\0') {
        return false;
    }
    if name.starts_with(['/', '\\']) || name.ends_with(['/', '\\']) {
        return false;
    }

    let mut depth = 0usize;
    for part in name.split(['/', '\\']) {
        match part {
            "" | "." => continue,
            ".." => return false,
            // drive prefixes like C:
            p if p.contains(':') => return false,
            _ => depth += 1,
        }
    }
    if depth == 0 {
        return false;
    }

    Path::new(name)
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}
