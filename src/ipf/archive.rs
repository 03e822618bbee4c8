use log::{debug, info};
use std::io;
use std::path::Path;
use std::sync::Arc;
use tokio::task::{JoinError, JoinSet};

use crate::error::{DecodeSkip, IpfError, Result};
use crate::io::{LocalFileReader, ReadAt};

use super::cipher::NameCipher;
use super::header::{is_safe_relative_path, read_stored_name};
use super::parser::DirectoryParser;
use super::structures::IpfEntry;
use super::validate::validate;

/// An open IPF container.
///
/// Entries are filled in two passes: [`read_structure`](Self::read_structure)
/// enumerates the directory, then
/// [`read_encrypted_filenames`](Self::read_encrypted_filenames) recovers the
/// stored names from the local headers. The file handle is shared with any
/// in-flight worker and closed when the last owner drops it.
pub struct IpfArchive<R: ReadAt = LocalFileReader> {
    reader: Arc<R>,
    size: u64,
    entries: Vec<IpfEntry>,
}

impl IpfArchive<LocalFileReader> {
    /// Open an archive on disk without reading its structure yet.
    pub fn open(path: &Path) -> Result<Self> {
        let metadata = std::fs::metadata(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => IpfError::NotFound(path.to_path_buf()),
            _ => IpfError::io(format!("inspecting {}", path.display()), e),
        })?;
        if !metadata.is_file() {
            return Err(IpfError::Format(format!(
                "{} is not a regular file",
                path.display()
            )));
        }

        let reader = LocalFileReader::new(path)
            .map_err(|e| IpfError::io(format!("opening {}", path.display()), e))?;
        Self::from_reader(Arc::new(reader))
    }

    /// Open, scan, decode names and validate in one go.
    pub async fn load(path: &Path, cipher: Arc<dyn NameCipher>, workers: usize) -> Result<Self> {
        let mut archive = Self::open(path)?;
        archive.read_structure().await?;
        archive.read_encrypted_filenames(cipher, workers).await?;
        validate(&archive)?;
        Ok(archive)
    }
}

impl<R: ReadAt + 'static> IpfArchive<R> {
    pub fn from_reader(reader: Arc<R>) -> Result<Self> {
        let size = reader.size();
        if size == 0 {
            return Err(IpfError::Format("empty file".into()));
        }
        Ok(Self {
            reader,
            size,
            entries: Vec::new(),
        })
    }

    /// First pass: enumerate the central directory.
    ///
    /// Sizes, methods, checksums and local header offsets come from the
    /// directory. Names are left empty.
    pub async fn read_structure(&mut self) -> Result<()> {
        let parser = DirectoryParser::new(self.reader.clone());
        let records = parser.read_directory().await?;

        self.entries = records
            .into_iter()
            .enumerate()
            .map(|(index, record)| IpfEntry::from_directory(index, record))
            .collect();

        info!("Read directory: {} entries", self.entries.len());
        Ok(())
    }

    /// Second pass: read and decrypt the name stored in every local header.
    ///
    /// An entry whose header cannot be read, or whose name does not decode to
    /// a safe relative path, keeps an empty name and records why. That never
    /// fails the pass.
    pub async fn read_encrypted_filenames(
        &mut self,
        cipher: Arc<dyn NameCipher>,
        workers: usize,
    ) -> Result<()> {
        let workers = workers.max(1);
        let mut tasks = JoinSet::new();

        let targets: Vec<(usize, u64)> = self
            .entries
            .iter()
            .map(|e| (e.index, e.lfh_offset))
            .collect();

        for (index, offset) in targets {
            if tasks.len() >= workers {
                if let Some(done) = tasks.join_next().await {
                    apply_name(&mut self.entries, join_outcome(done)?);
                }
            }

            let reader = self.reader.clone();
            let cipher = cipher.clone();
            tasks.spawn(async move { decode_name(&*reader, &*cipher, index, offset).await });
        }

        while let Some(done) = tasks.join_next().await {
            apply_name(&mut self.entries, join_outcome(done)?);
        }

        let skipped = self.skipped().count();
        if skipped > 0 {
            info!(
                "Decoded {} names, {} entries fall back to placeholder names",
                self.entries.len() - skipped,
                skipped
            );
        } else {
            info!("Decoded {} names", self.entries.len());
        }
        Ok(())
    }
}

impl<R: ReadAt> IpfArchive<R> {
    pub fn entries(&self) -> &[IpfEntry] {
        &self.entries
    }

    pub fn entry(&self, index: usize) -> Option<&IpfEntry> {
        self.entries.get(index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total size of the container file in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn reader(&self) -> &Arc<R> {
        &self.reader
    }

    /// Entries whose stored name could not be recovered.
    pub fn skipped(&self) -> impl Iterator<Item = &IpfEntry> {
        self.entries.iter().filter(|e| e.name_skip.is_some())
    }
}

struct NameOutcome {
    index: usize,
    stored: Vec<u8>,
    name: std::result::Result<String, DecodeSkip>,
}

async fn decode_name<R: ReadAt + ?Sized>(
    reader: &R,
    cipher: &dyn NameCipher,
    index: usize,
    offset: u64,
) -> NameOutcome {
    let stored = match read_stored_name(reader, offset).await {
        Ok(stored) => stored,
        Err(skip) => {
            return NameOutcome {
                index,
                stored: Vec::new(),
                name: Err(skip),
            };
        }
    };

    let name = match cipher.decrypt(&stored) {
        Some(name) if is_safe_relative_path(&name) => Ok(name),
        Some(name) => Err(DecodeSkip::UnsafePath(name)),
        None => Err(DecodeSkip::Cipher),
    };
    NameOutcome {
        index,
        stored,
        name,
    }
}

fn apply_name(entries: &mut [IpfEntry], outcome: NameOutcome) {
    let Some(entry) = entries.get_mut(outcome.index) else {
        return;
    };
    entry.encrypted_name = outcome.stored;
    match outcome.name {
        Ok(name) => {
            entry.decrypted_name = Some(name);
            entry.name_skip = None;
        }
        Err(skip) => {
            debug!(
                "Entry {}: {}; using {}",
                entry.index,
                skip,
                entry.fallback_name()
            );
            entry.decrypted_name = None;
            entry.name_skip = Some(skip);
        }
    }
}

/// Unwrap a finished worker, re-raising its panic on the caller.
pub(crate) fn join_outcome<T>(done: std::result::Result<T, JoinError>) -> Result<T> {
    match done {
        Ok(value) => Ok(value),
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(e) => Err(IpfError::io("worker task cancelled", io::Error::other(e))),
    }
}
