use crate::config::Config;
use anyhow::{anyhow, Result};
use clap::Args;
use indicatif::HumanBytes;
use serde::Serialize;
use shardvault_core::Snapshot;
use tracing::warn;

#[derive(Args)]
pub struct SnapshotsCommand {
    #[arg(long, help = "Only list snapshots of this volume (id or name)")]
    volume: Option<String>,

    #[arg(long, default_value = "table", help = "Output format (table, json)")]
    format: String,
}

#[derive(Serialize)]
struct Listing<'a> {
    volume: &'a str,
    id: &'a str,
    date: String,
    hostname: &'a str,
    description: &'a str,
    files: u64,
    size: u64,
}

impl SnapshotsCommand {
    pub async fn run(&self, cli: &crate::Cli, config: &Config) -> Result<()> {
        let repo = super::open_repository(cli, config).await?;

        let volumes = match &self.volume {
            Some(volume) => vec![repo.find_volume(volume)?],
            None => repo.volumes().iter().collect(),
        };

        let mut snapshots: Vec<(&str, Snapshot)> = Vec::new();
        for volume in volumes {
            for snapshot_id in &volume.snapshots {
                match repo.load_snapshot(snapshot_id).await {
                    Ok(snapshot) => snapshots.push((volume.name.as_str(), snapshot)),
                    Err(e) => warn!(snapshot = %snapshot_id, error = %e, "Failed to load snapshot"),
                }
            }
        }

        match self.format.as_str() {
            "table" => {
                if snapshots.is_empty() {
                    println!("No snapshots found");
                    return Ok(());
                }
                println!(
                    "{:<10} {:<36} {:<20} {:<15} {:>8} {:>10}  {}",
                    "Volume", "ID", "Date", "Host", "Files", "Size", "Description"
                );
                println!("{:-<120}", "");
                for (volume, snapshot) in &snapshots {
                    println!(
                        "{:<10} {:<36} {:<20} {:<15} {:>8} {:>10}  {}",
                        volume,
                        snapshot.id,
                        snapshot.date.format("%Y-%m-%d %H:%M:%S"),
                        snapshot.hostname,
                        snapshot.stats.files,
                        HumanBytes(snapshot.stats.size).to_string(),
                        snapshot.description
                    );
                }
            }
            "json" => {
                let listing: Vec<Listing> = snapshots
                    .iter()
                    .map(|(volume, snapshot)| Listing {
                        volume,
                        id: &snapshot.id,
                        date: snapshot.date.to_rfc3339(),
                        hostname: &snapshot.hostname,
                        description: &snapshot.description,
                        files: snapshot.stats.files,
                        size: snapshot.stats.size,
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&listing)?);
            }
            other => return Err(anyhow!("Unsupported format: {}", other)),
        }
        Ok(())
    }
}
