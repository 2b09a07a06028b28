//! The persist subprocess: listens on a Unix domain socket for framed
//! IPC envelopes from the daemon and durably writes them.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use joblet::persist::{serve, LocalFileBackend, StorageBackend};

#[derive(Debug, Parser)]
#[command(name = "persist")]
#[command(about = "Out-of-process log/state persistence writer", long_about = None)]
struct Cli {
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[arg(long)]
    socket: std::path::PathBuf,

    #[arg(long)]
    data_root: Option<std::path::PathBuf>,

    #[arg(long, default_value = "10485760")]
    rotate_bytes: u64,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    let data_root = match cli.data_root {
        Some(p) => p,
        None => joblet::config::JobletConfig::default().data_root,
    };

    let backend: Arc<dyn StorageBackend> = Arc::new(LocalFileBackend::new(data_root, cli.rotate_bytes));
    serve(&cli.socket, backend).context("persist subprocess serve loop")?;
    Ok(())
}
