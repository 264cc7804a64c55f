//! extsync: extension file synchronization for a management-server cluster.
//!
//! # Usage
//!
//! ```text
//! extsync [--config <path>] checksum <extension> [--path <rel>] [--json]
//! extsync [--config <path>] publish <extension> [files...] [--id <n>]
//! extsync [--config <path>] sign-url <peer-ip> <archive> [--ttl <secs>]
//! extsync [--config <path>] apply <extension> <archive> [--partial]
//! extsync [--config <path>] receive [<command.json> | -]
//! extsync [--config <path>] sweep [--older-than <secs>] [--watch]
//! ```

mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    apply::ApplyArgs, checksum::ChecksumArgs, publish::PublishArgs, receive::ReceiveArgs,
    sign_url::SignUrlArgs, sweep::SweepArgs,
};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "extsync",
    version,
    about = "Publish, distribute and apply extension file trees across cluster nodes",
    long_about = None,
)]
struct Cli {
    /// Config file (default: ~/.extsync/config.yaml).
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the per-file checksum map of an extension directory.
    Checksum(ChecksumArgs),

    /// Archive an extension (or some of its files) into the share directory.
    Publish(PublishArgs),

    /// Print a time-limited download URL for a published archive.
    SignUrl(SignUrlArgs),

    /// Apply an archive to the local extension directory.
    Apply(ApplyArgs),

    /// Download, verify and apply the archive named by a JSON sync command.
    Receive(ReceiveArgs),

    /// Remove expired archives from the share directory.
    Sweep(SweepArgs),
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = commands::load_config(cli.config.as_deref())?;
    match cli.command {
        Commands::Checksum(args) => args.run(&config),
        Commands::Publish(args) => args.run(&config),
        Commands::SignUrl(args) => args.run(&config),
        Commands::Apply(args) => args.run(&config),
        Commands::Receive(args) => args.run(&config),
        Commands::Sweep(args) => args.run(&config),
    }
}

/// Logs go to stderr so JSON on stdout stays machine-readable.
fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
