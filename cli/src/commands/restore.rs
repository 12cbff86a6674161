use crate::config::Config;
use anyhow::{anyhow, Result};
use clap::Args;
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use shardvault_core::pipeline;
use std::path::PathBuf;
use tracing::info;

#[derive(Args)]
pub struct RestoreCommand {
    #[arg(help = "Snapshot id to restore, or \"latest\"")]
    snapshot_id: String,

    #[arg(help = "Target directory for restore")]
    target: PathBuf,

    #[arg(long, short = 'x', help = "Archive path to skip (repeatable)")]
    exclude: Vec<String>,

    #[arg(long, help = "List what would be restored without writing anything")]
    dry_run: bool,
}

impl RestoreCommand {
    pub async fn run(&self, cli: &crate::Cli, config: &Config) -> Result<()> {
        let repo = super::open_repository(cli, config).await?;

        info!("Loading snapshot: {}", self.snapshot_id);
        let (volume, snapshot) = repo.find_snapshot(&self.snapshot_id).await?;

        println!("Restoring snapshot {} from volume {}", snapshot.summary(), volume.name);
        println!("Target: {}", self.target.display());

        let pb = if self.dry_run {
            ProgressBar::hidden()
        } else {
            let pb = ProgressBar::new(snapshot.archives.len() as u64);
            pb.set_style(ProgressStyle::default_bar().template("{bar:40.cyan/blue} {pos:>7}/{len:7} {msg}")?);
            pb
        };

        let mut pipeline = pipeline::restore(&repo, &snapshot, &self.target, &self.exclude, self.dry_run)?;
        while let Some(progress) = pipeline.next().await {
            pb.inc(1);
            match &progress.error {
                Some(e) => pb.println(format!("error: {}: {}", progress.path, e)),
                None if self.dry_run => println!("{} ({})", progress.path, HumanBytes(progress.size)),
                None => pb.set_message(progress.path.clone()),
            }
        }
        let stats = pipeline.finish().await?;
        pb.finish_and_clear();

        let verb = if self.dry_run { "Would restore" } else { "Restored" };
        println!(
            "{} {} files, {} dirs, {} symlinks ({})",
            verb,
            stats.files,
            stats.dirs,
            stats.symlinks,
            HumanBytes(stats.size)
        );

        if stats.errors > 0 {
            return Err(anyhow!("{} paths could not be restored", stats.errors));
        }
        Ok(())
    }
}
