//! Archive creation.
//!
//! Output is written to a temporary file beside the target and only renamed
//! into place once the end record is on disk, so a failed, cancelled or
//! panicking run never leaves a truncated archive behind.
//!
//! Each file is compressed into memory on a blocking thread before it is
//! appended, so peak memory is roughly `workers` times the largest compressed
//! file. Entries are capped below 4 GiB anyway.

use byteorder::{LittleEndian, WriteBytesExt};
use flate2::Compression;
use flate2::write::DeflateEncoder;
use log::{debug, info};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::BufWriter;
use tokio::task::JoinHandle;
use walkdir::WalkDir;

use crate::config::CreateConfig;
use crate::error::{IpfError, Result};

use super::archive::join_outcome;
use super::cipher::NameCipher;
use super::extractor::CHUNK_SIZE;
use super::structures::*;

/// What [`create`] produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateSummary {
    pub entries: usize,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

/// A file scheduled for packing.
#[derive(Debug, Clone)]
pub(crate) struct InputFile {
    /// `/`-separated path relative to the input folder.
    pub(crate) name: String,
    pub(crate) path: PathBuf,
}

struct CompressedFile {
    data: Vec<u8>,
    crc32: u32,
    uncompressed_size: u64,
}

struct CentralRecord {
    name: Vec<u8>,
    name_len: u16,
    flags: u16,
    crc32: u32,
    compressed_size: u32,
    uncompressed_size: u32,
    lfh_offset: u64,
}

/// Build an archive from `config.folder` at `config.output`.
///
/// Options are checked before anything is read or written. Entries appear in
/// lexical order of their relative paths and carry fixed timestamps, so equal
/// inputs give byte-identical archives.
pub async fn create(config: &CreateConfig, cipher: Arc<dyn NameCipher>) -> Result<CreateSummary> {
    config.validate()?;

    let metadata = tokio::fs::metadata(&config.folder)
        .await
        .map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => IpfError::NotFound(config.folder.clone()),
            _ => IpfError::io(format!("inspecting {}", config.folder.display()), e),
        })?;
    if !metadata.is_dir() {
        return Err(IpfError::Config(format!(
            "{} is not a directory",
            config.folder.display()
        )));
    }

    let folder = config.folder.clone();
    let inputs = join_outcome(tokio::task::spawn_blocking(move || collect_inputs(&folder)).await)??;
    info!(
        "Packing {} files from {} (level {}, names {})",
        inputs.len(),
        config.folder.display(),
        config.compression_level,
        if config.encrypt_names { "encrypted" } else { "plain" }
    );

    write_archive(inputs, config, cipher).await
}

/// Walk `folder` and return its regular files sorted by relative path.
pub(crate) fn collect_inputs(folder: &Path) -> Result<Vec<InputFile>> {
    let mut inputs = Vec::new();
    for item in WalkDir::new(folder) {
        let item = item.map_err(|e| {
            let context = format!(
                "walking {}",
                e.path().unwrap_or(folder).display()
            );
            IpfError::io(context, e.into())
        })?;
        if !item.file_type().is_file() {
            continue;
        }

        let relative = item
            .path()
            .strip_prefix(folder)
            .map_err(|_| IpfError::Config(format!("{} escapes the input folder", item.path().display())))?;
        let mut parts = Vec::new();
        for component in relative.components() {
            let part = component.as_os_str().to_str().ok_or_else(|| {
                IpfError::Config(format!("{} is not valid UTF-8", item.path().display()))
            })?;
            parts.push(part);
        }
        let name = parts.join("/");
        if name.len() > MAX_NAME_LEN as usize {
            return Err(IpfError::Config(format!(
                "relative path {} is longer than {} bytes",
                name, MAX_NAME_LEN
            )));
        }

        inputs.push(InputFile {
            name,
            path: item.path().to_path_buf(),
        });
    }

    if inputs.is_empty() {
        return Err(IpfError::Config(format!(
            "{} contains no files",
            folder.display()
        )));
    }
    if inputs.len() > MAX_ENTRIES {
        return Err(IpfError::Capacity(format!(
            "{} files exceeds the limit of {}",
            inputs.len(),
            MAX_ENTRIES
        )));
    }

    inputs.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(inputs)
}

pub(crate) async fn write_archive(
    inputs: Vec<InputFile>,
    config: &CreateConfig,
    cipher: Arc<dyn NameCipher>,
) -> Result<CreateSummary> {
    use tokio::io::AsyncWriteExt;

    config.validate()?;

    // Stored names are fixed before any output exists
    let mut names = Vec::with_capacity(inputs.len());
    for input in &inputs {
        let stored = if config.encrypt_names {
            cipher.encrypt(&input.name)
        } else {
            input.name.as_bytes().to_vec()
        };
        let len = stored_name_len(&stored, &input.name)?;
        names.push((stored, len));
    }

    let output = config.output.as_path();
    let parent = match output.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let temp = tempfile::Builder::new()
        .prefix(".ipfkit-")
        .suffix(".tmp")
        .tempfile_in(&parent)
        .map_err(|e| IpfError::io(format!("creating temporary file in {}", parent.display()), e))?;
    let handle = temp
        .as_file()
        .try_clone()
        .map_err(|e| IpfError::io("duplicating output handle", e))?;
    let mut out = BufWriter::with_capacity(CHUNK_SIZE, tokio::fs::File::from_std(handle));

    let level = Compression::new(config.compression_level as u32);
    let flags = if config.encrypt_names { 0 } else { FLAG_UTF8 };
    let workers = config.workers.max(1);

    let mut offset = 0u64;
    let mut bytes_in = 0u64;
    let mut records = Vec::with_capacity(inputs.len());
    let mut pending: VecDeque<(InputFile, (Vec<u8>, u16), JoinHandle<Result<CompressedFile>>)> =
        VecDeque::new();
    let mut queue = inputs.into_iter().zip(names);

    loop {
        while pending.len() < workers {
            let Some((input, name)) = queue.next() else { break };
            let path = input.path.clone();
            pending.push_back((
                input,
                name,
                tokio::task::spawn_blocking(move || compress_file(&path, level)),
            ));
        }

        // Results are consumed in path order, whatever order they finish in
        let Some((input, (name, name_len), task)) = pending.pop_front() else { break };
        let compressed = join_outcome(task.await)??;

        let record = CentralRecord {
            name,
            name_len,
            flags,
            crc32: compressed.crc32,
            compressed_size: fit_u32(compressed.data.len() as u64, &input.name)?,
            uncompressed_size: fit_u32(compressed.uncompressed_size, &input.name)?,
            lfh_offset: offset,
        };

        let header = local_header(&record).map_err(|e| IpfError::io("encoding local header", e))?;
        write_all(&mut out, &header).await?;
        write_all(&mut out, &compressed.data).await?;
        offset += header.len() as u64 + compressed.data.len() as u64;
        bytes_in += compressed.uncompressed_size;

        debug!(
            "Packed {} ({} -> {} bytes)",
            input.name,
            compressed.uncompressed_size,
            compressed.data.len()
        );
        records.push(record);
    }

    let cd_offset = offset;
    let mut directory = Vec::new();
    for record in &records {
        central_header(record, &mut directory).map_err(|e| IpfError::io("encoding directory", e))?;
    }
    let cd_size = directory.len() as u64;
    end_records(records.len() as u64, cd_offset, cd_size, &mut directory)
        .map_err(|e| IpfError::io("encoding end record", e))?;
    write_all(&mut out, &directory).await?;
    let bytes_out = offset + directory.len() as u64;

    out.flush()
        .await
        .map_err(|e| IpfError::io(format!("writing {}", output.display()), e))?;
    let file = out.into_inner();
    file.sync_all()
        .await
        .map_err(|e| IpfError::io(format!("syncing {}", output.display()), e))?;
    drop(file);

    temp.persist(output)
        .map_err(|e| IpfError::io(format!("moving archive into {}", output.display()), e.error))?;

    info!(
        "Wrote {} ({} entries, {} bytes)",
        output.display(),
        records.len(),
        bytes_out
    );
    Ok(CreateSummary {
        entries: records.len(),
        bytes_in,
        bytes_out,
    })
}

async fn write_all<W: tokio::io::AsyncWrite + Unpin>(out: &mut W, data: &[u8]) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    out.write_all(data)
        .await
        .map_err(|e| IpfError::io("writing archive", e))
}

/// Length of a stored name, which the reader only accepts in `1..=MAX_NAME_LEN`.
fn stored_name_len(stored: &[u8], relative: &str) -> Result<u16> {
    match u16::try_from(stored.len()) {
        Ok(len) if len > 0 && len <= MAX_NAME_LEN => Ok(len),
        _ => Err(IpfError::Config(format!(
            "stored name for {} is {} bytes; names must be 1 to {} bytes",
            relative,
            stored.len(),
            MAX_NAME_LEN
        ))),
    }
}

fn fit_u32(value: u64, name: &str) -> Result<u32> {
    if value >= u32::MAX as u64 {
        return Err(IpfError::Capacity(format!(
            "{} is {} bytes; entries must stay below 4 GiB",
            name, value
        )));
    }
    Ok(value as u32)
}

/// Deflate one file in fixed-size reads.
fn compress_file(path: &Path, level: Compression) -> Result<CompressedFile> {
    let mut file = std::fs::File::open(path)
        .map_err(|e| IpfError::io(format!("opening {}", path.display()), e))?;
    let mut encoder = DeflateEncoder::new(Vec::new(), level);
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;

    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| IpfError::io(format!("reading {}", path.display()), e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        encoder
            .write_all(&buf[..n])
            .map_err(|e| IpfError::io("compressing", e))?;
        total += n as u64;
    }

    let data = encoder
        .finish()
        .map_err(|e| IpfError::io("compressing", e))?;
    Ok(CompressedFile {
        data,
        crc32: hasher.finalize(),
        uncompressed_size: total,
    })
}

fn local_header(record: &CentralRecord) -> io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(LFH_SIZE + record.name.len());
    buf.write_all(LFH_SIGNATURE)?;
    buf.write_u16::<LittleEndian>(VERSION_DEFLATE)?;
    buf.write_u16::<LittleEndian>(record.flags)?;
    buf.write_u16::<LittleEndian>(CompressionMethod::Deflate.as_u16())?;
    buf.write_u16::<LittleEndian>(DOS_EPOCH_TIME)?;
    buf.write_u16::<LittleEndian>(DOS_EPOCH_DATE)?;
    buf.write_u32::<LittleEndian>(record.crc32)?;
    buf.write_u32::<LittleEndian>(record.compressed_size)?;
    buf.write_u32::<LittleEndian>(record.uncompressed_size)?;
    buf.write_u16::<LittleEndian>(record.name_len)?;
    buf.write_u16::<LittleEndian>(0)?;
    buf.write_all(&record.name)?;
    Ok(buf)
}

fn central_header(record: &CentralRecord, buf: &mut Vec<u8>) -> io::Result<()> {
    let zip64_offset = record.lfh_offset >= u32::MAX as u64;
    let version = if zip64_offset { VERSION_ZIP64 } else { VERSION_DEFLATE };

    buf.write_all(CDFH_SIGNATURE)?;
    buf.write_u16::<LittleEndian>(version)?;
    buf.write_u16::<LittleEndian>(version)?;
    buf.write_u16::<LittleEndian>(record.flags)?;
    buf.write_u16::<LittleEndian>(CompressionMethod::Deflate.as_u16())?;
    buf.write_u16::<LittleEndian>(DOS_EPOCH_TIME)?;
    buf.write_u16::<LittleEndian>(DOS_EPOCH_DATE)?;
    buf.write_u32::<LittleEndian>(record.crc32)?;
    buf.write_u32::<LittleEndian>(record.compressed_size)?;
    buf.write_u32::<LittleEndian>(record.uncompressed_size)?;
    buf.write_u16::<LittleEndian>(record.name_len)?;
    buf.write_u16::<LittleEndian>(if zip64_offset { 12 } else { 0 })?;
    buf.write_u16::<LittleEndian>(0)?; // comment
    buf.write_u16::<LittleEndian>(0)?; // disk
    buf.write_u16::<LittleEndian>(0)?; // internal attributes
    buf.write_u32::<LittleEndian>(0)?; // external attributes
    if zip64_offset {
        buf.write_u32::<LittleEndian>(0xFFFFFFFF)?;
    } else {
        buf.write_u32::<LittleEndian>(record.lfh_offset as u32)?;
    }
    buf.write_all(&record.name)?;
    if zip64_offset {
        buf.write_u16::<LittleEndian>(ZIP64_EXTRA_ID)?;
        buf.write_u16::<LittleEndian>(8)?;
        buf.write_u64::<LittleEndian>(record.lfh_offset)?;
    }
    Ok(())
}

/// Append the end record, preceded by the zip64 pair when a field overflows.
fn end_records(entries: u64, cd_offset: u64, cd_size: u64, buf: &mut Vec<u8>) -> io::Result<()> {
    let needs_zip64 =
        entries >= 0xFFFF || cd_offset >= 0xFFFFFFFF || cd_size >= 0xFFFFFFFF;

    if needs_zip64 {
        let eocd64_offset = cd_offset + cd_size;
        Zip64EOCD {
            eocd64_size: (Zip64EOCD::MIN_SIZE - 12) as u64,
            version_made_by: VERSION_ZIP64,
            version_needed: VERSION_ZIP64,
            disk_number: 0,
            disk_with_cd: 0,
            disk_entries: entries,
            total_entries: entries,
            cd_size,
            cd_offset,
        }
        .write_to(buf)?;
        Zip64EOCDLocator {
            disk_with_eocd64: 0,
            eocd64_offset,
            total_disks: 1,
        }
        .write_to(buf)?;
    }

    let entries16 = entries.min(0xFFFF) as u16;
    EndOfCentralDirectory {
        disk_number: 0,
        disk_with_cd: 0,
        disk_entries: entries16,
        total_entries: entries16,
        cd_size: cd_size.min(0xFFFFFFFF) as u32,
        cd_offset: cd_offset.min(0xFFFFFFFF) as u32,
        comment_len: 0,
    }
    .write_to(buf)
}
