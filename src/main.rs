//! Main entry point for the ipfkit CLI application.
//!
//! Maps command-line flags onto the library's option records and prints
//! what each operation did.

use anyhow::{Context, Result, bail};
use clap::Parser;
use std::sync::Arc;

use ipfkit::cli::{Cli, Command, ListArgs, ValidateArgs};
use ipfkit::config::default_workers;
use ipfkit::{
    IpfArchive, IpfExtractor, IpfNameCipher, NameCipher, PlainNameCipher, create, validate,
};

/// Application entry point.
///
/// Any error is printed by `anyhow` and the process exits with status 1.
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match &cli.command {
        Command::Create(args) => {
            let config = args.to_config(cli.verbose)?;
            let summary = create(&config, Arc::new(IpfNameCipher::new()))
                .await
                .with_context(|| format!("creating {}", config.output.display()))?;
            println!(
                "{}: {} files, {} -> {}",
                config.output.display(),
                summary.entries,
                format_size(summary.bytes_in),
                format_size(summary.bytes_out)
            );
        }
        Command::Extract(args) => {
            let config = args.to_config(cli.verbose);
            config.validate()?;
            let archive = IpfArchive::load(&config.archive, cipher_for(config.plain_names), config.workers)
                .await
                .with_context(|| format!("reading {}", config.archive.display()))?;

            let report = IpfExtractor::new(&archive, config.workers)
                .extract_all(&config.destination)
                .await
                .with_context(|| format!("extracting into {}", config.destination.display()))?;

            println!(
                "Extracted {} of {} entries ({})",
                report.extracted,
                archive.len(),
                format_size(report.bytes_written)
            );
            if !report.is_complete() {
                for failure in &report.failures {
                    eprintln!("  failed: {} ({})", failure.name, failure.error);
                }
                bail!("{} entries could not be extracted", report.failures.len());
            }
        }
        Command::List(args) => list_entries(args).await?,
        Command::Validate(args) => check_archive(args).await?,
    }

    Ok(())
}

/// `info` by default, `debug` with `--verbose`. `RUST_LOG` wins over both.
fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();
}

fn cipher_for(plain_names: bool) -> Arc<dyn NameCipher> {
    if plain_names {
        Arc::new(PlainNameCipher)
    } else {
        Arc::new(IpfNameCipher::new())
    }
}

/// List entries in the archive.
///
/// The long format is a table with sizes, compression ratio and the stored
/// DOS timestamp, followed by a totals line.
async fn list_entries(args: &ListArgs) -> Result<()> {
    let archive = IpfArchive::load(&args.archive, cipher_for(args.plain_names), default_workers())
        .await
        .with_context(|| format!("reading {}", args.archive.display()))?;

    if args.long {
        println!(
            "{:>10}  {:>10}  {:>5}  {:>10}  {:>5}  Name",
            "Length", "Size", "Cmpr", "Date", "Time"
        );
        println!("{}", "-".repeat(70));
    }

    let mut total_uncompressed = 0u64;
    let mut total_compressed = 0u64;

    for entry in archive.entries() {
        if !args.long {
            println!("{}", entry.display_name());
            continue;
        }

        let (year, month, day) = entry.mod_date();
        let (hour, minute, _second) = entry.mod_time();
        println!(
            "{:>10}  {:>10}  {}  {:04}-{:02}-{:02}  {:02}:{:02}  {}",
            entry.uncompressed_size,
            entry.compressed_size,
            ratio(entry.compressed_size, entry.uncompressed_size),
            year,
            month,
            day,
            hour,
            minute,
            entry.display_name()
        );
        total_uncompressed += entry.uncompressed_size;
        total_compressed += entry.compressed_size;
    }

    if args.long {
        println!("{}", "-".repeat(70));
        println!(
            "{:>10}  {:>10}  {}  {:>21}  {} files",
            total_uncompressed,
            total_compressed,
            ratio(total_compressed, total_uncompressed),
            "",
            archive.len()
        );
    }

    Ok(())
}

async fn check_archive(args: &ValidateArgs) -> Result<()> {
    let archive = IpfArchive::load(&args.archive, cipher_for(args.plain_names), default_workers())
        .await
        .with_context(|| format!("reading {}", args.archive.display()))?;
    validate(&archive)?;

    let skipped = archive.skipped().count();
    println!(
        "{}: OK, {} entries, {}",
        args.archive.display(),
        archive.len(),
        format_size(archive.size())
    );
    if skipped > 0 {
        println!("  {} entries have unreadable names and will use placeholders", skipped);
    }
    Ok(())
}

/// Share of the input saved by compression, as a right-aligned percentage.
fn ratio(compressed: u64, uncompressed: u64) -> String {
    if uncompressed > 0 && compressed <= uncompressed {
        format!("{:>4}%", 100 - (compressed * 100 / uncompressed))
    } else {
        "  0%".to_string()
    }
}

/// Format a byte size into a human-readable string.
///
/// ```ignore
/// assert_eq!(format_size(500), "500 bytes");
/// assert_eq!(format_size(1536), "1.50 KB");
/// ```
fn format_size(size: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if size >= GB {
        format!("{:.2} GB", size as f64 / GB as f64)
    } else if size >= MB {
        format!("{:.2} MB", size as f64 / MB as f64)
    } else if size >= KB {
        format!("{:.2} KB", size as f64 / KB as f64)
    } else {
        format!("{} bytes", size)
    }
}
