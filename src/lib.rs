//! # ipfkit
//!
//! Read and write IPF game archives.
//!
//! IPF archives use the ZIP container layout but keep each entry's real path
//! only in its local header, and only in encrypted form. This crate parses the
//! container itself, recovers those names through a pluggable [`NameCipher`],
//! extracts entries by streaming them to disk, and builds new archives that
//! the reader accepts.
//!
//! ## Features
//!
//! - Two-pass loading: central directory first, then local header names
//! - Per-entry fallback names (`file_0007.bin`) when a header is unreadable
//! - Path traversal protection on every decoded name
//! - ZIP64 end records and offsets
//! - Stored and deflate entries, with CRC-32 verification on extraction
//! - Deterministic creation: identical input gives byte-identical output
//!
//! ## Example
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use ipfkit::{IpfArchive, IpfExtractor, IpfNameCipher};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let archive = IpfArchive::load(Path::new("data.ipf"), Arc::new(IpfNameCipher::new()), 8).await?;
//!
//!     for entry in archive.entries() {
//!         println!("{}", entry.display_name());
//!     }
//!
//!     let report = IpfExtractor::new(&archive, 8).extract_all(Path::new("out")).await?;
//!     println!("{} entries extracted", report.extracted);
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod config;
pub mod error;
pub mod io;
pub mod ipf;

pub use cli::Cli;
pub use config::{CreateConfig, ExtractConfig};
pub use error::{DecodeSkip, IpfError, Result};
pub use io::{LocalFileReader, ReadAt};
pub use ipf::{
    CreateSummary, ExtractReport, IpfArchive, IpfEntry, IpfExtractor, IpfNameCipher, NameCipher,
    PlainNameCipher, create, validate,
};
