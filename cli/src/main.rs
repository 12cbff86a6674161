mod commands;
mod config;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use commands::{
    init::InitCommand, restore::RestoreCommand, snapshots::SnapshotsCommand, store::StoreCommand,
    volume::VolumeCommand,
};
use config::Config;
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(
    name = "shardvault",
    about = "Deduplicating, encrypted, erasure-coded backups",
    long_about = "Shardvault splits files into content-defined chunks, stores each chunk once, \
                  and spreads it over erasure-coded fragments so it survives lost fragments"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, env = "SHARDVAULT_REPO", help = "Repository path")]
    repo: Option<String>,

    #[arg(long, env = "SHARDVAULT_PASSWORD", help = "Repository password")]
    password: Option<String>,

    #[arg(long, env = "SHARDVAULT_CONFIG", help = "Config file path")]
    config: Option<PathBuf>,

    #[arg(short, long, help = "Enable verbose output")]
    verbose: bool,

    #[arg(short, long, help = "Enable quiet mode")]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Initialize a new repository")]
    Init(InitCommand),

    #[command(about = "Manage volumes")]
    Volume(VolumeCommand),

    #[command(about = "Store paths as a new snapshot of a volume")]
    Store(StoreCommand),

    #[command(about = "Restore files from a snapshot")]
    Restore(RestoreCommand),

    #[command(about = "List snapshots")]
    Snapshots(SnapshotsCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.verbose, cli.quiet)?;

    let config = Config::load(cli.config.as_deref())?;
    debug!(?config, "Loaded configuration");

    match cli.command {
        Commands::Init(ref cmd) => cmd.run(&cli, &config).await,
        Commands::Volume(ref cmd) => cmd.run(&cli, &config).await,
        Commands::Store(ref cmd) => cmd.run(&cli, &config).await,
        Commands::Restore(ref cmd) => cmd.run(&cli, &config).await,
        Commands::Snapshots(ref cmd) => cmd.run(&cli, &config).await,
    }
}

fn init_tracing(verbose: bool, quiet: bool) -> Result<()> {
    let level = if quiet {
        "warn"
    } else if verbose {
        "debug"
    } else {
        "info"
    };

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::new(format!(
            "shardvault={level},shardvault_core={level},shardvault_backends={level}"
        )))
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow!("Setting default subscriber failed: {}", e))
}
