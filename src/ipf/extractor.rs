use flate2::{Decompress, FlushDecompress, Status};
use log::{debug, info, warn};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::task::JoinSet;

use crate::error::{IpfError, Result};
use crate::io::ReadAt;

use super::archive::{IpfArchive, join_outcome};
use super::header::{data_offset, is_safe_relative_path};
use super::structures::{CompressionMethod, IpfEntry};
use super::validate::validate;

/// Bytes read from the archive, and inflated, per step.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Outcome of [`IpfExtractor::extract_all`].
#[derive(Debug, Default)]
pub struct ExtractReport {
    pub extracted: usize,
    pub bytes_written: u64,
    pub failures: Vec<EntryFailure>,
}

impl ExtractReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// An entry that could not be extracted.
#[derive(Debug)]
pub struct EntryFailure {
    pub index: usize,
    pub name: String,
    pub error: IpfError,
}

/// Entry extractor
pub struct IpfExtractor<'a, R: ReadAt> {
    archive: &'a IpfArchive<R>,
    workers: usize,
}

impl<'a, R: ReadAt + 'static> IpfExtractor<'a, R> {
    pub fn new(archive: &'a IpfArchive<R>, workers: usize) -> Self {
        Self {
            archive,
            workers: workers.max(1),
        }
    }

    /// Extract entry data to memory
    pub async fn extract_to_memory(&self, entry: &IpfEntry) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(entry.uncompressed_size.min(CHUNK_SIZE as u64) as usize);
        stream_entry(&**self.archive.reader(), entry, &mut buf, Path::new("memory")).await?;
        Ok(buf)
    }

    /// Extract one entry below `dest_root`, returning the written path.
    ///
    /// Unlike [`extract_all`](Self::extract_all) this does not run the
    /// [`validate`] gate or check for name collisions; the archive is expected
    /// to come from [`IpfArchive::load`] or to have been validated already.
    pub async fn extract_one(&self, entry: &IpfEntry, dest_root: &Path) -> Result<PathBuf> {
        let output_path = resolve_output_path(entry, dest_root);
        write_entry(&**self.archive.reader(), entry, &output_path).await?;
        Ok(output_path)
    }

    /// Extract every entry below `dest_root`.
    ///
    /// Fails up front if the archive does not validate or the destination
    /// cannot be created. After that, a failing entry is recorded in the report
    /// and the rest continue, unless the failure shows the destination itself
    /// is unusable.
    pub async fn extract_all(&self, dest_root: &Path) -> Result<ExtractReport> {
        validate(self.archive)?;
        fs::create_dir_all(dest_root)
            .await
            .map_err(|e| IpfError::io(format!("creating {}", dest_root.display()), e))?;

        let entries = self.archive.entries();
        let outputs = plan_outputs(entries, dest_root);
        info!(
            "Extracting {} entries to {} with {} workers",
            entries.len(),
            dest_root.display(),
            self.workers
        );

        let mut report = ExtractReport::default();
        let mut tasks = JoinSet::new();

        for (entry, output_path) in entries.iter().zip(outputs) {
            if tasks.len() >= self.workers {
                if let Some(done) = tasks.join_next().await {
                    record(&mut report, join_outcome(done)?)?;
                }
            }

            let reader = self.archive.reader().clone();
            let entry = entry.clone();
            tasks.spawn(async move {
                let result = write_entry(&*reader, &entry, &output_path).await;
                (entry, result)
            });
        }

        while let Some(done) = tasks.join_next().await {
            record(&mut report, join_outcome(done)?)?;
        }

        report.failures.sort_by_key(|f| f.index);
        info!(
            "Extracted {} of {} entries ({} bytes)",
            report.extracted,
            entries.len(),
            report.bytes_written
        );
        Ok(report)
    }
}

fn record(report: &mut ExtractReport, (entry, result): (IpfEntry, Result<u64>)) -> Result<()> {
    match result {
        Ok(bytes) => {
            report.extracted += 1;
            report.bytes_written += bytes;
            Ok(())
        }
        Err(e) if e.is_destination_fatal() => Err(e),
        Err(e) => {
            warn!("Failed to extract {}: {}", entry.display_name(), e);
            report.failures.push(EntryFailure {
                index: entry.index,
                name: entry.display_name(),
                error: e,
            });
            Ok(())
        }
    }
}

/// Where an entry lands below `dest_root`.
///
/// Uses the decrypted name when it is present and safe, otherwise the
/// fallback name.
pub fn resolve_output_path(entry: &IpfEntry, dest_root: &Path) -> PathBuf {
    match entry.decrypted_name.as_deref() {
        Some(name) if is_safe_relative_path(name) => {
            let mut path = dest_root.to_path_buf();
            for part in name.split(['/', '\\']).filter(|p| !p.is_empty() && *p != ".") {
                path.push(part);
            }
            path
        }
        _ => dest_root.join(entry.fallback_name()),
    }
}

/// Output path for every entry, one distinct file each.
///
/// A path already claimed by an earlier entry sends the later one to its
/// fallback name, and if that is taken too, to `file_NNNN.K.bin` with the
/// first free `K`.
fn plan_outputs(entries: &[IpfEntry], dest_root: &Path) -> Vec<PathBuf> {
    let mut claimed = HashSet::with_capacity(entries.len());
    entries
        .iter()
        .map(|entry| {
            let path = resolve_output_path(entry, dest_root);
            if claimed.insert(path.clone()) {
                return path;
            }

            let fallback = dest_root.join(entry.fallback_name());
            let unique = if claimed.insert(fallback.clone()) {
                fallback
            } else {
                let mut n = 1usize;
                loop {
                    let candidate = dest_root.join(format!("file_{:04}.{}.bin", entry.index, n));
                    if claimed.insert(candidate.clone()) {
                        break candidate;
                    }
                    n += 1;
                }
            };
            warn!(
                "Entry {} repeats {}; writing it as {}",
                entry.index,
                path.display(),
                unique.display()
            );
            unique
        })
        .collect()
}

/// Removes a partially written output unless disarmed.
struct PartialOutput<'a> {
    path: &'a Path,
    armed: bool,
}

impl Drop for PartialOutput<'_> {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(self.path);
        }
    }
}

async fn write_entry<R: ReadAt + ?Sized>(
    reader: &R,
    entry: &IpfEntry,
    output_path: &Path,
) -> Result<u64> {
    if let Some(parent) = output_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| IpfError::io(format!("creating {}", parent.display()), e))?;
        }
    }

    let file = fs::File::create(output_path)
        .await
        .map_err(|e| IpfError::io(format!("creating {}", output_path.display()), e))?;
    let mut guard = PartialOutput {
        path: output_path,
        armed: true,
    };

    let mut out = BufWriter::with_capacity(CHUNK_SIZE, file);
    let written = stream_entry(reader, entry, &mut out, output_path).await?;
    drop(out);

    guard.armed = false;
    debug!("Extracted {} -> {}", entry.display_name(), output_path.display());
    Ok(written)
}

/// Copy one entry's payload into `out`, inflating as needed.
///
/// Memory use is two fixed chunks regardless of entry size. The size and
/// CRC-32 recorded in the directory are checked at the end.
async fn stream_entry<R, W>(reader: &R, entry: &IpfEntry, out: &mut W, target: &Path) -> Result<u64>
where
    R: ReadAt + ?Sized,
    W: AsyncWrite + Unpin,
{
    let start = data_offset(reader, entry.lfh_offset).await?;
    let end = start
        .checked_add(entry.compressed_size)
        .filter(|&end| end <= reader.size())
        .ok_or_else(|| {
            IpfError::Format(format!(
                "entry {} data ({} bytes at {}) runs past end of file",
                entry.index, entry.compressed_size, start
            ))
        })?;

    let mut sink = Sink {
        out,
        target,
        hasher: crc32fast::Hasher::new(),
        written: 0,
    };

    match entry.compression_method {
        CompressionMethod::Stored => copy_stored(reader, start, end, &mut sink).await?,
        CompressionMethod::Deflate => inflate(reader, entry, start, end, &mut sink).await?,
        CompressionMethod::Unknown(method) => {
            return Err(IpfError::Format(format!(
                "entry {} uses unsupported compression method {}",
                entry.index, method
            )));
        }
    }

    sink.out
        .flush()
        .await
        .map_err(|e| IpfError::io(format!("writing {}", target.display()), e))?;

    if sink.written != entry.uncompressed_size {
        return Err(IpfError::Format(format!(
            "entry {} inflated to {} bytes, directory says {}",
            entry.index, sink.written, entry.uncompressed_size
        )));
    }
    let crc = sink.hasher.finalize();
    if crc != entry.crc32 {
        return Err(IpfError::Format(format!(
            "entry {} checksum mismatch: {:08x} != {:08x}",
            entry.index, crc, entry.crc32
        )));
    }

    Ok(sink.written)
}

struct Sink<'a, W> {
    out: &'a mut W,
    target: &'a Path,
    hasher: crc32fast::Hasher,
    written: u64,
}

impl<W: AsyncWrite + Unpin> Sink<'_, W> {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.hasher.update(data);
        self.out
            .write_all(data)
            .await
            .map_err(|e| IpfError::io(format!("writing {}", self.target.display()), e))?;
        self.written += data.len() as u64;
        Ok(())
    }
}

async fn read_chunk<R: ReadAt + ?Sized>(reader: &R, offset: u64, buf: &mut [u8]) -> Result<()> {
    reader
        .read_exact_at(offset, buf)
        .await
        .map_err(|e| IpfError::io(format!("reading archive at offset {}", offset), e))
}

async fn copy_stored<R, W>(reader: &R, start: u64, end: u64, sink: &mut Sink<'_, W>) -> Result<()>
where
    R: ReadAt + ?Sized,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut pos = start;
    while pos < end {
        let n = (end - pos).min(CHUNK_SIZE as u64) as usize;
        read_chunk(reader, pos, &mut buf[..n]).await?;
        sink.write(&buf[..n]).await?;
        pos += n as u64;
    }
    Ok(())
}

async fn inflate<R, W>(
    reader: &R,
    entry: &IpfEntry,
    start: u64,
    end: u64,
    sink: &mut Sink<'_, W>,
) -> Result<()>
where
    R: ReadAt + ?Sized,
    W: AsyncWrite + Unpin,
{
    let mut inflater = Decompress::new(false);
    let mut input = vec![0u8; CHUNK_SIZE];
    let mut output = vec![0u8; CHUNK_SIZE];
    let mut pos = start;
    let mut pending = 0..0;

    loop {
        if pending.is_empty() && pos < end {
            let n = (end - pos).min(CHUNK_SIZE as u64) as usize;
            read_chunk(reader, pos, &mut input[..n]).await?;
            pos += n as u64;
            pending = 0..n;
        }

        let flush = if pos == end {
            FlushDecompress::Finish
        } else {
            FlushDecompress::None
        };
        let before_in = inflater.total_in();
        let before_out = inflater.total_out();
        let status = inflater
            .decompress(&input[pending.clone()], &mut output, flush)
            .map_err(|e| {
                IpfError::Format(format!("entry {} has a corrupt deflate stream: {}", entry.index, e))
            })?;
        let consumed = (inflater.total_in() - before_in) as usize;
        let produced = (inflater.total_out() - before_out) as usize;
        pending.start += consumed;

        if produced > 0 {
            sink.write(&output[..produced]).await?;
        }

        if status == Status::StreamEnd {
            return Ok(());
        }
        if consumed == 0 && produced == 0 && (!pending.is_empty() || pos == end) {
            return Err(IpfError::Format(format!(
                "entry {} has a truncated deflate stream",
                entry.index
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipf::cipher::PlainNameCipher;
    use crate::ipf::structures::{DOS_EPOCH_DATE, DOS_EPOCH_TIME, DirectoryRecord};
    use crate::ipf::testutil::RawArchive;
    use std::sync::Arc;

    fn entry_named(index: usize, name: Option<&str>) -> IpfEntry {
        let mut entry = IpfEntry::from_directory(
            index,
            DirectoryRecord {
                compression_method: CompressionMethod::Stored,
                compressed_size: 0,
                uncompressed_size: 0,
                crc32: 0,
                lfh_offset: 0,
                last_mod_time: DOS_EPOCH_TIME,
                last_mod_date: DOS_EPOCH_DATE,
            },
        );
        entry.decrypted_name = name.map(str::to_string);
        entry
    }

    #[test]
    fn output_path_prefers_safe_decoded_name() {
        let root = Path::new("/out");
        assert_eq!(
            resolve_output_path(&entry_named(0, Some("xml/item.xml")), root),
            Path::new("/out/xml/item.xml")
        );
        assert_eq!(
            resolve_output_path(&entry_named(1, Some("ui\\frame.tga")), root),
            Path::new("/out/ui/frame.tga")
        );
        assert_eq!(
            resolve_output_path(&entry_named(2, None), root),
            Path::new("/out/file_0002.bin")
        );
        assert_eq!(
            resolve_output_path(&entry_named(3, Some("../../etc/passwd")), root),
            Path::new("/out/file_0003.bin")
        );
    }

    #[test]
    fn duplicate_names_get_fallbacks() {
        let entries = vec![
            entry_named(0, Some("a.txt")),
            entry_named(1, Some("b.txt")),
            entry_named(2, Some("a.txt")),
        ];
        let plan = plan_outputs(&entries, Path::new("root"));
        assert_eq!(
            plan,
            vec![
                PathBuf::from("root/a.txt"),
                PathBuf::from("root/b.txt"),
                PathBuf::from("root/file_0002.bin"),
            ]
        );
    }

    #[test]
    fn fallback_that_collides_gets_a_numbered_path() {
        let entries = vec![
            entry_named(0, Some("file_0002.bin")),
            entry_named(1, Some("file_0002.1.bin")),
            entry_named(2, None),
            entry_named(3, Some("file_0002.bin")),
        ];
        let plan = plan_outputs(&entries, Path::new("root"));
        assert_eq!(
            plan,
            vec![
                PathBuf::from("root/file_0002.bin"),
                PathBuf::from("root/file_0002.1.bin"),
                PathBuf::from("root/file_0002.2.bin"),
                PathBuf::from("root/file_0003.bin"),
            ]
        );
        let distinct: HashSet<_> = plan.iter().collect();
        assert_eq!(distinct.len(), plan.len());
    }

    #[tokio::test]
    async fn decoded_name_matching_a_fallback_keeps_both_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut raw = RawArchive::new();
        raw.push(13, b"file_0002.bin", b"entry zero");
        raw.push(5, b"b.txt", b"entry one");
        raw.push(0, b"", b"entry two");
        let path = raw.write(dir.path(), "clash.ipf");

        let archive = IpfArchive::load(&path, Arc::new(PlainNameCipher), 3)
            .await
            .unwrap();
        let dest = dir.path().join("out");
        let report = IpfExtractor::new(&archive, 3).extract_all(&dest).await.unwrap();

        assert!(report.is_complete());
        assert_eq!(report.extracted, 3);
        assert_eq!(std::fs::read(dest.join("file_0002.bin")).unwrap(), b"entry zero");
        assert_eq!(std::fs::read(dest.join("b.txt")).unwrap(), b"entry one");
        assert_eq!(std::fs::read(dest.join("file_0002.1.bin")).unwrap(), b"entry two");
    }

    #[tokio::test]
    async fn fallback_entry_still_extracts() {
        let dir = tempfile::tempdir().unwrap();
        let mut raw = RawArchive::new();
        for i in 0..8 {
            let name = format!("doc{}.txt", i);
            let body = format!("body of entry {}", i);
            if i == 7 {
                raw.push(600, &[b'x'; 600], body.as_bytes());
            } else {
                raw.push(name.len() as u16, name.as_bytes(), body.as_bytes());
            }
        }
        let path = raw.write(dir.path(), "fallback.ipf");

        let archive = IpfArchive::load(&path, Arc::new(PlainNameCipher), 3)
            .await
            .unwrap();
        let dest = dir.path().join("out");
        let report = IpfExtractor::new(&archive, 3).extract_all(&dest).await.unwrap();

        assert!(report.is_complete());
        assert_eq!(report.extracted, 8);
        assert_eq!(
            std::fs::read_to_string(dest.join("file_0007.bin")).unwrap(),
            "body of entry 7"
        );
        assert_eq!(
            std::fs::read_to_string(dest.join("doc3.txt")).unwrap(),
            "body of entry 3"
        );
    }

    #[tokio::test]
    async fn corrupt_entry_does_not_stop_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let mut raw = RawArchive::new();
        raw.push(5, b"a.txt", b"first");
        raw.push(5, b"b.txt", b"second");
        raw.push(5, b"c.txt", b"third");
        let mut bytes = raw.finish();
        // flip a payload byte of b.txt so its checksum no longer matches
        let payload_b = (30 + 5 + 5) + 30 + 5;
        bytes[payload_b] ^= 0xFF;
        let path = dir.path().join("corrupt.ipf");
        std::fs::write(&path, bytes).unwrap();

        let archive = IpfArchive::load(&path, Arc::new(PlainNameCipher), 2)
            .await
            .unwrap();
        let dest = dir.path().join("out");
        let report = IpfExtractor::new(&archive, 2).extract_all(&dest).await.unwrap();

        assert_eq!(report.extracted, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].index, 1);
        assert!(matches!(report.failures[0].error, IpfError::Format(_)));
        assert!(!dest.join("b.txt").exists(), "partial output left behind");
        assert_eq!(std::fs::read(dest.join("c.txt")).unwrap(), b"third");
    }

    #[tokio::test]
    async fn stored_entry_to_memory() {
        let dir = tempfile::tempdir().unwrap();
        let mut raw = RawArchive::new();
        let body = vec![7u8; CHUNK_SIZE * 2 + 17];
        raw.push(8, b"big.blob", &body);
        let path = raw.write(dir.path(), "mem.ipf");

        let archive = IpfArchive::load(&path, Arc::new(PlainNameCipher), 1)
            .await
            .unwrap();
        let extractor = IpfExtractor::new(&archive, 1);
        let data = extractor
            .extract_to_memory(&archive.entries()[0])
            .await
            .unwrap();
        assert_eq!(data, body);
    }
}
