//! IPF container reading, extraction and creation.
//!
//! An IPF file is laid out like a ZIP archive: local headers with their data,
//! then a central directory, then an end record. The difference is in the
//! names. The name stored in each local header is the real relative path run
//! through a [`NameCipher`], and the name in the directory record is not
//! trusted at all.
//!
//! ## Architecture
//!
//! - [`structures`]: fixed-layout records and the [`IpfEntry`] model
//! - `parser`: end record and central directory enumeration
//! - `header`: raw local header reads (stored name, data offset)
//! - [`cipher`]: the [`NameCipher`] seam and its implementations
//! - [`IpfArchive`]: two-pass loading (directory, then local header names)
//! - [`IpfExtractor`]: streaming extraction over a bounded set of workers
//! - [`create`]: deterministic archive creation
//! - [`validate`]: structural checks, also the gate before extraction
//!
//! ## Limitations
//!
//! - Only stored and deflate entries are extracted
//! - No multi-disk archives
//! - Single entries must stay below 4 GiB when writing

mod archive;
pub mod cipher;
mod extractor;
mod header;
mod parser;
pub mod structures;
mod validate;
mod writer;

#[cfg(test)]
mod testutil;

pub use archive::IpfArchive;
pub use cipher::{IpfNameCipher, NameCipher, PlainNameCipher};
pub use extractor::{CHUNK_SIZE, EntryFailure, ExtractReport, IpfExtractor, resolve_output_path};
pub use header::{data_offset, is_safe_relative_path, read_stored_name};
pub use parser::{DirectoryLocation, DirectoryParser};
pub use structures::{CompressionMethod, IpfEntry};
pub use validate::validate;
pub use writer::{CreateSummary, create};
