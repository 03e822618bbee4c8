use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::{CreateConfig, DEFAULT_COMPRESSION_LEVEL, ExtractConfig, default_workers};
use crate::error::{IpfError, Result};

#[derive(Parser, Debug)]
#[command(name = "ipfkit")]
#[command(version)]
#[command(about = "Read and write IPF archives", long_about = None)]
#[command(after_help = "Examples:\n  \
  ipfkit create -f data/ -o data.ipf        pack data/ with encrypted names\n  \
  ipfkit extract data.ipf -d out/           unpack into out/\n  \
  ipfkit list data.ipf -l                   show sizes and ratios")]
pub struct Cli {
    /// Log every entry (RUST_LOG overrides)
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Pack a folder into an archive
    Create(CreateArgs),
    /// Unpack an archive
    Extract(ExtractArgs),
    /// List entries
    List(ListArgs),
    /// Check archive structure
    Validate(ValidateArgs),
}

#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Folder to pack
    #[arg(short = 'f', long, value_name = "FOLDER")]
    pub folder: Option<PathBuf>,

    /// Archive to write
    #[arg(short = 'o', long, value_name = "OUTPUT")]
    pub output: Option<PathBuf>,

    /// Store names as plain UTF-8
    #[arg(long)]
    pub no_encrypt: bool,

    /// Deflate level (0-9)
    #[arg(short = 'c', long = "compression", value_name = "LEVEL", default_value_t = DEFAULT_COMPRESSION_LEVEL, allow_negative_numbers = true)]
    pub compression_level: i32,

    /// Files compressed concurrently
    #[arg(short = 'j', long, value_name = "WORKERS")]
    pub workers: Option<usize>,
}

#[derive(Args, Debug)]
pub struct ExtractArgs {
    /// Archive to unpack
    #[arg(value_name = "ARCHIVE")]
    pub archive: PathBuf,

    /// Extract files into DIR
    #[arg(short = 'd', value_name = "DIR", default_value = ".")]
    pub extract_dir: PathBuf,

    /// Names are stored unencrypted
    #[arg(long)]
    pub plain_names: bool,

    /// Entries extracted concurrently
    #[arg(short = 'j', long, value_name = "WORKERS")]
    pub workers: Option<usize>,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Archive to list
    #[arg(value_name = "ARCHIVE")]
    pub archive: PathBuf,

    /// Long format with sizes and dates
    #[arg(short = 'l')]
    pub long: bool,

    /// Names are stored unencrypted
    #[arg(long)]
    pub plain_names: bool,
}

#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Archive to check
    #[arg(value_name = "ARCHIVE")]
    pub archive: PathBuf,

    /// Names are stored unencrypted
    #[arg(long)]
    pub plain_names: bool,
}

impl CreateArgs {
    /// Build the option record. A missing folder or output is a usage error.
    pub fn to_config(&self, verbose: bool) -> Result<CreateConfig> {
        let folder = self
            .folder
            .clone()
            .ok_or_else(|| IpfError::Config("missing input folder (-f)".into()))?;
        let output = self
            .output
            .clone()
            .ok_or_else(|| IpfError::Config("missing output path (-o)".into()))?;

        Ok(CreateConfig {
            folder,
            output,
            encrypt_names: !self.no_encrypt,
            compression_level: self.compression_level,
            verbose,
            workers: self.workers.unwrap_or_else(default_workers),
        })
    }
}

impl ExtractArgs {
    pub fn to_config(&self, verbose: bool) -> ExtractConfig {
        ExtractConfig {
            archive: self.archive.clone(),
            destination: self.extract_dir.clone(),
            plain_names: self.plain_names,
            verbose,
            workers: self.workers.unwrap_or_else(default_workers),
        }
    }
}
