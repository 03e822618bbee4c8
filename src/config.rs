//! Explicit option records for the create and extract operations.

use std::path::PathBuf;

use crate::error::{IpfError, Result};

pub const DEFAULT_COMPRESSION_LEVEL: i32 = 6;

/// Worker count used when the caller does not pick one.
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Options for building an archive from a folder.
#[derive(Debug, Clone)]
pub struct CreateConfig {
    pub folder: PathBuf,
    pub output: PathBuf,
    /// Store names through the cipher; otherwise plain UTF-8.
    pub encrypt_names: bool,
    /// Deflate level, 0 (fastest) to 9 (smallest).
    pub compression_level: i32,
    pub verbose: bool,
    /// Files compressed concurrently.
    pub workers: usize,
}

impl Default for CreateConfig {
    fn default() -> Self {
        Self {
            folder: PathBuf::new(),
            output: PathBuf::new(),
            encrypt_names: true,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            verbose: false,
            workers: default_workers(),
        }
    }
}

impl CreateConfig {
    pub fn new(folder: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            folder: folder.into(),
            output: output.into(),
            ..Default::default()
        }
    }

    /// Checks that need no file-system access.
    pub fn validate(&self) -> Result<()> {
        if self.folder.as_os_str().is_empty() {
            return Err(IpfError::Config("input folder is required".into()));
        }
        if self.output.as_os_str().is_empty() {
            return Err(IpfError::Config("output path is required".into()));
        }
        if !(0..=9).contains(&self.compression_level) {
            return Err(IpfError::Config(format!(
                "compression level {} is outside 0..=9",
                self.compression_level
            )));
        }
        if self.workers == 0 {
            return Err(IpfError::Config("worker count must be at least 1".into()));
        }
        Ok(())
    }
}

/// Options for unpacking an archive.
#[derive(Debug, Clone)]
pub struct ExtractConfig {
    pub archive: PathBuf,
    pub destination: PathBuf,
    /// Names are stored unencrypted.
    pub plain_names: bool,
    pub verbose: bool,
    /// Entries read or written concurrently.
    pub workers: usize,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            archive: PathBuf::new(),
            destination: PathBuf::from("."),
            plain_names: false,
            verbose: false,
            workers: default_workers(),
        }
    }
}

impl ExtractConfig {
    pub fn new(archive: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self {
            archive: archive.into(),
            destination: destination.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.archive.as_os_str().is_empty() {
            return Err(IpfError::Config("archive path is required".into()));
        }
        if self.workers == 0 {
            return Err(IpfError::Config("worker count must be at least 1".into()));
        }
        Ok(())
    }
}
