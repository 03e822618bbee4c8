//! Low-level directory parser.
//!
//! Reads the end-of-central-directory record (and its 64-bit variant) and the
//! central directory from any source implementing [`ReadAt`].
//!
//! ## Parsing Strategy
//!
//! 1. Find the End of Central Directory (EOCD) at the file's end
//! 2. If ZIP64, read the ZIP64 EOCD for large archive support
//! 3. Read the Central Directory to get sizes, methods, checksums and
//!    local header offsets for all entries
//!
//! Names in the directory are skipped: the local header holds the stored name.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read};
use std::sync::Arc;

use crate::error::{IpfError, Result};
use crate::io::ReadAt;

use super::structures::*;

/// Maximum comment size allowed by the format (65535 bytes).
///
/// This limits the search area when looking for EOCD with a comment.
const MAX_COMMENT_SIZE: u64 = 65535;

/// Location and size of the central directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectoryLocation {
    pub offset: u64,
    pub size: u64,
    pub entries: u64,
}

/// Central directory parser.
///
/// Typically used through [`IpfArchive`](super::IpfArchive) rather than
/// directly.
pub struct DirectoryParser<R: ReadAt> {
    reader: Arc<R>,
    size: u64,
}

impl<R: ReadAt> DirectoryParser<R> {
    pub fn new(reader: Arc<R>) -> Self {
        let size = reader.size();
        Self { reader, size }
    }

    async fn read_exact_at(&self, offset: u64, buf: &mut [u8], what: &str) -> Result<()> {
        self.reader
            .read_exact_at(offset, buf)
            .await
            .map_err(|e| IpfError::io(format!("reading {} at offset {}", what, offset), e))
    }

    /// Find and parse the End of Central Directory record.
    ///
    /// Tries the comment-less position first, then searches backwards.
    ///
    /// # Returns
    ///
    /// A tuple of (EOCD record, offset of EOCD in file).
    pub async fn find_eocd(&self) -> Result<(EndOfCentralDirectory, u64)> {
        let eocd_size = EndOfCentralDirectory::SIZE as u64;
        if self.size < eocd_size {
            return Err(IpfError::Format(
                "file too small to hold a directory".into(),
            ));
        }

        let offset = self.size - eocd_size;
        let mut buf = vec![0u8; EndOfCentralDirectory::SIZE];
        self.read_exact_at(offset, &mut buf, "end record").await?;

        // Check for signature and zero-length comment
        if &buf[0..4] == EndOfCentralDirectory::SIGNATURE && &buf[20..22] == b"\x00\x00" {
            let eocd = EndOfCentralDirectory::from_bytes(&buf)?;
            return Ok((eocd, offset));
        }

        // The EOCD could be earlier if there's a comment.
        let search_size = (MAX_COMMENT_SIZE + eocd_size).min(self.size);
        let search_start = self.size - search_size;

        let mut buf = vec![0u8; search_size as usize];
        self.read_exact_at(search_start, &mut buf, "archive tail")
            .await?;

        for i in (0..=buf.len() - EndOfCentralDirectory::SIZE).rev() {
            if &buf[i..i + 4] == EndOfCentralDirectory::SIGNATURE {
                // The comment length field must account for every trailing byte.
                let comment_len = u16::from_le_bytes([buf[i + 20], buf[i + 21]]) as usize;

                if comment_len == buf.len() - i - EndOfCentralDirectory::SIZE {
                    let eocd = EndOfCentralDirectory::from_bytes(
                        &buf[i..i + EndOfCentralDirectory::SIZE],
                    )?;
                    return Ok((eocd, search_start + i as u64));
                }
            }
        }

        Err(IpfError::Format("end of central directory not found".into()))
    }

    /// Read the ZIP64 End of Central Directory record.
    ///
    /// Called when the regular EOCD has saturated fields.
    pub async fn read_zip64_eocd(&self, eocd_offset: u64) -> Result<Zip64EOCD> {
        // The locator sits immediately before the regular EOCD
        let locator_offset = eocd_offset
            .checked_sub(Zip64EOCDLocator::SIZE as u64)
            .ok_or_else(|| IpfError::Format("missing zip64 end locator".into()))?;
        let mut locator_buf = vec![0u8; Zip64EOCDLocator::SIZE];
        self.read_exact_at(locator_offset, &mut locator_buf, "zip64 locator")
            .await?;

        let locator = Zip64EOCDLocator::from_bytes(&locator_buf)?;
        locator
            .eocd64_offset
            .checked_add(Zip64EOCD::MIN_SIZE as u64)
            .filter(|&end| end <= locator_offset)
            .ok_or_else(|| IpfError::Format("zip64 end record out of bounds".into()))?;

        let mut eocd64_buf = vec![0u8; Zip64EOCD::MIN_SIZE];
        self.read_exact_at(locator.eocd64_offset, &mut eocd64_buf, "zip64 end record")
            .await?;

        Zip64EOCD::from_bytes(&eocd64_buf)
    }

    /// Resolve where the central directory lives and how many entries it holds.
    pub async fn locate_directory(&self) -> Result<DirectoryLocation> {
        let (eocd, eocd_offset) = self.find_eocd().await?;

        let location = if eocd.is_zip64() {
            let eocd64 = self.read_zip64_eocd(eocd_offset).await?;
            DirectoryLocation {
                offset: eocd64.cd_offset,
                size: eocd64.cd_size,
                entries: eocd64.total_entries,
            }
        } else {
            DirectoryLocation {
                offset: eocd.cd_offset as u64,
                size: eocd.cd_size as u64,
                entries: eocd.total_entries as u64,
            }
        };

        if location.offset.saturating_add(location.size) > eocd_offset {
            return Err(IpfError::Format(format!(
                "central directory ({} bytes at {}) overlaps the end record",
                location.size, location.offset
            )));
        }

        Ok(location)
    }

    /// Read every directory record in directory order.
    ///
    /// The entry count is checked against the sanity bound before the
    /// directory is fetched, so a corrupt count cannot trigger a huge read.
    pub async fn read_directory(&self) -> Result<Vec<DirectoryRecord>> {
        let location = self.locate_directory().await?;

        if location.entries == 0 {
            return Err(IpfError::Format("archive has no entries".into()));
        }
        if location.entries > MAX_ENTRIES as u64 {
            return Err(IpfError::Capacity(format!(
                "{} entries exceeds the limit of {}",
                location.entries, MAX_ENTRIES
            )));
        }
        if location.size < location.entries * CDFH_MIN_SIZE as u64 {
            return Err(IpfError::Format(format!(
                "central directory of {} bytes cannot hold {} entries",
                location.size, location.entries
            )));
        }

        // Read the entire Central Directory in one request
        let mut cd_data = vec![0u8; location.size as usize];
        self.read_exact_at(location.offset, &mut cd_data, "central directory")
            .await?;

        let mut records = Vec::with_capacity(location.entries as usize);
        let mut cursor = Cursor::new(cd_data.as_slice());

        for index in 0..location.entries {
            let record = parse_cdfh(&mut cursor).map_err(|e| match e {
                IpfError::Format(msg) => {
                    IpfError::Format(format!("directory record {}: {}", index, msg))
                }
                other => other,
            })?;
            records.push(record);
        }

        Ok(records)
    }
}

/// Parse one Central Directory File Header from a cursor.
fn parse_cdfh(cursor: &mut Cursor<&[u8]>) -> Result<DirectoryRecord> {
    parse_cdfh_fields(cursor).map_err(|e| match e {
        ParseFailure::Truncated => IpfError::Format("truncated central directory".into()),
        ParseFailure::Signature => {
            IpfError::Format("invalid central directory file header".into())
        }
    })
}

enum ParseFailure {
    Truncated,
    Signature,
}

impl From<std::io::Error> for ParseFailure {
    fn from(_: std::io::Error) -> Self {
        ParseFailure::Truncated
    }
}

fn parse_cdfh_fields(cursor: &mut Cursor<&[u8]>) -> std::result::Result<DirectoryRecord, ParseFailure> {
    let mut sig = [0u8; 4];
    cursor.read_exact(&mut sig)?;
    if sig != CDFH_SIGNATURE {
        return Err(ParseFailure::Signature);
    }

    let _version_made_by = cursor.read_u16::<LittleEndian>()?;
    let _version_needed = cursor.read_u16::<LittleEndian>()?;
    let _flags = cursor.read_u16::<LittleEndian>()?;
    let compression_method = cursor.read_u16::<LittleEndian>()?;
    let last_mod_time = cursor.read_u16::<LittleEndian>()?;
    let last_mod_date = cursor.read_u16::<LittleEndian>()?;
    let crc32 = cursor.read_u32::<LittleEndian>()?;
    let mut compressed_size = cursor.read_u32::<LittleEndian>()? as u64;
    let mut uncompressed_size = cursor.read_u32::<LittleEndian>()? as u64;
    let file_name_length = cursor.read_u16::<LittleEndian>()?;
    let extra_field_length = cursor.read_u16::<LittleEndian>()?;
    let file_comment_length = cursor.read_u16::<LittleEndian>()?;
    let _disk_number_start = cursor.read_u16::<LittleEndian>()?;
    let _internal_attrs = cursor.read_u16::<LittleEndian>()?;
    let _external_attrs = cursor.read_u32::<LittleEndian>()?;
    let mut lfh_offset = cursor.read_u32::<LittleEndian>()? as u64;

    // The directory copy of the name is not authoritative here
    skip(cursor, file_name_length as u64)?;

    let extra_field_end = cursor.position() + extra_field_length as u64;
    if extra_field_end > cursor.get_ref().len() as u64 {
        return Err(ParseFailure::Truncated);
    }

    while cursor.position() + 4 <= extra_field_end {
        let header_id = cursor.read_u16::<LittleEndian>()?;
        let field_size = cursor.read_u16::<LittleEndian>()?;
        let field_end = (cursor.position() + field_size as u64).min(extra_field_end);

        if header_id == ZIP64_EXTRA_ID {
            // Fields are present only if the corresponding header field is saturated
            if uncompressed_size == 0xFFFFFFFF && cursor.position() + 8 <= field_end {
                uncompressed_size = cursor.read_u64::<LittleEndian>()?;
            }
            if compressed_size == 0xFFFFFFFF && cursor.position() + 8 <= field_end {
                compressed_size = cursor.read_u64::<LittleEndian>()?;
            }
            if lfh_offset == 0xFFFFFFFF && cursor.position() + 8 <= field_end {
                lfh_offset = cursor.read_u64::<LittleEndian>()?;
            }
        }
        cursor.set_position(field_end);
    }

    cursor.set_position(extra_field_end);
    skip(cursor, file_comment_length as u64)?;

    Ok(DirectoryRecord {
        compression_method: CompressionMethod::from_u16(compression_method),
        compressed_size,
        uncompressed_size,
        crc32,
        lfh_offset,
        last_mod_time,
        last_mod_date,
    })
}

fn skip(cursor: &mut Cursor<&[u8]>, len: u64) -> std::result::Result<(), ParseFailure> {
    let target = cursor.position() + len;
    if target > cursor.get_ref().len() as u64 {
        return Err(ParseFailure::Truncated);
    }
    cursor.set_position(target);
    Ok(())
}
