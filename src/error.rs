//! Error types shared by the reader, extractor and writer.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result alias used throughout the library.
pub type Result<T, E = IpfError> = std::result::Result<T, E>;

/// Fatal errors surfaced by archive operations.
#[derive(Debug, Error)]
pub enum IpfError {
    /// The archive or input folder does not exist.
    #[error("not found: {}", .0.display())]
    NotFound(PathBuf),

    /// Open/seek/read/write failure at the file-system boundary.
    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    /// Empty file, zero entries, unreadable directory or corrupt entry data.
    #[error("invalid archive: {0}")]
    Format(String),

    /// Entry count or entry size beyond what the format or sanity bound allows.
    #[error("capacity exceeded: {0}")]
    Capacity(String),

    /// Invalid options or unusable inputs, detected before any work starts.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl IpfError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        IpfError::Io {
            context: context.into(),
            source,
        }
    }

    /// True when the error says the destination itself cannot take more writes,
    /// so continuing with the remaining entries is pointless.
    pub fn is_destination_fatal(&self) -> bool {
        match self {
            IpfError::Io { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::PermissionDenied
                    | io::ErrorKind::ReadOnlyFilesystem
                    | io::ErrorKind::StorageFull
            ),
            _ => false,
        }
    }
}

/// Why an entry's stored name could not be recovered.
///
/// This is never fatal: the entry keeps its fallback name and extraction
/// proceeds.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeSkip {
    #[error("name length {0} outside accepted range 1..=512")]
    NameLength(u16),
    #[error("local header at {offset} runs past end of file")]
    OutOfBounds { offset: u64 },
    #[error("missing local header signature at {offset}")]
    BadSignature { offset: u64 },
    #[error("read failed: {0}")]
    Read(String),
    #[error("name could not be decrypted")]
    Cipher,
    #[error("name escapes the destination root: {0:?}")]
    UnsafePath(String),
}
