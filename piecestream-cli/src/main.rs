//! Piecestream CLI - Command-line interface
//!
//! Streams local files through a simulated piece download and hashes files.

mod commands;

use std::path::PathBuf;

use anyhow::Context;
use clap::{ArgAction, Parser};
use piecestream_core::tracing_setup::{Verbosity, init_tracing};

#[derive(Parser)]
#[command(name = "piecestream")]
#[command(about = "Random-access streaming over downloading torrents")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: commands::Commands,

    /// More console output (-v info, -vv debug, -vvv trace). RUST_LOG overrides it
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Only print errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Directory for the full trace log of this run
    #[arg(long, global = true)]
    logs_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(
        Verbosity::from_flags(cli.quiet, cli.verbose),
        cli.logs_dir.as_deref(),
    )
    .context("Failed to initialize logging")?;

    commands::handle_command(cli.command).await.map_err(|error| {
        tracing::error!("Command failed: {}", error);
        let message = error.user_message();
        anyhow::Error::new(error).context(message)
    })
}
