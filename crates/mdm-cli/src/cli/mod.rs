//! CLI for the MDM download manager.

mod commands;

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use mdm_core::config::{self, FileAllocation};
use std::path::PathBuf;

use commands::run_get;

/// Top-level CLI for the MDM download manager.
#[derive(Debug, Parser)]
#[command(name = "mdm")]
#[command(about = "MDM: segmented multi-source download manager", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Download one file from mirrors, or each URI separately with -Z.
    Get(GetArgs),
}

#[derive(Debug, Clone, Args)]
pub struct GetArgs {
    /// URIs to download. Without -Z they are mirrors of the same file.
    #[arg(required = true, value_name = "URI")]
    pub uris: Vec<String>,

    /// Treat every URI as a separate download.
    #[arg(short = 'Z', long)]
    pub force_sequential: bool,

    /// Directory to save files to (default: current directory).
    #[arg(long, value_name = "DIR")]
    pub dir: Option<PathBuf>,

    /// Output file name. Only valid for a single download.
    #[arg(long, value_name = "FILE")]
    pub out: Option<String>,

    /// Maximum connections per download.
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u64).range(1..=64))]
    pub split: Option<u64>,

    /// Number of downloads running at once.
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u64).range(1..))]
    pub max_concurrent_downloads: Option<u64>,

    /// Expected digest, as `sha-256=<hex>`.
    #[arg(long, value_name = "TYPE=DIGEST", value_parser = parse_checksum)]
    pub checksum: Option<String>,

    /// Restart from scratch when the output file already exists.
    #[arg(long)]
    pub allow_overwrite: bool,

    /// Cap on the combined download speed in bytes per second (0 = unlimited).
    #[arg(long, value_name = "BYTES")]
    pub max_overall_download_limit: Option<u64>,

    /// How to reserve disk space: none, prealloc, falloc.
    #[arg(long, value_name = "METHOD", value_parser = parse_file_allocation)]
    pub file_allocation: Option<FileAllocation>,
}

/// `sha-256=<64 hex digits>` → lowercase hex digest.
fn parse_checksum(s: &str) -> Result<String> {
    let Some((kind, digest)) = s.split_once('=') else {
        bail!("expected TYPE=DIGEST");
    };
    if !kind.eq_ignore_ascii_case("sha-256") {
        bail!("unsupported checksum type {kind:?} (only sha-256)");
    }
    if digest.len() != 64 || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
        bail!("sha-256 digest must be 64 hex digits");
    }
    Ok(digest.to_ascii_lowercase())
}

fn parse_file_allocation(s: &str) -> Result<FileAllocation> {
    Ok(match s.to_ascii_lowercase().as_str() {
        "none" => FileAllocation::None,
        "prealloc" => FileAllocation::Prealloc,
        "falloc" => FileAllocation::Falloc,
        other => bail!("unknown file allocation method {other:?}"),
    })
}

impl CliCommand {
    /// Returns the process exit code.
    pub fn run_from_args() -> Result<i32> {
        let cli = Cli::parse();
        let cfg = config::load_or_init()?;
        tracing::debug!("loaded config: {:?}", cfg);

        match cli.command {
            CliCommand::Get(args) => run_get(cfg, args),
        }
    }
}

#[cfg(test)]
mod tests;
