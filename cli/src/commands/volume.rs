use crate::config::Config;
use anyhow::Result;
use clap::{Args, Subcommand};
use shardvault_core::Volume;

#[derive(Args)]
pub struct VolumeCommand {
    #[command(subcommand)]
    action: VolumeAction,
}

#[derive(Subcommand)]
enum VolumeAction {
    #[command(about = "Create a new volume")]
    Init {
        #[arg(help = "Volume name")]
        name: String,

        #[arg(long, short, default_value = "", help = "Volume description")]
        description: String,
    },

    #[command(about = "List all volumes")]
    List,
}

impl VolumeCommand {
    pub async fn run(&self, cli: &crate::Cli, config: &Config) -> Result<()> {
        let mut repo = super::open_repository(cli, config).await?;

        match &self.action {
            VolumeAction::Init { name, description } => {
                let volume = Volume::new(name.clone(), description.clone());
                let id = volume.id.clone();
                repo.add_volume(volume)?;
                repo.save().await?;
                println!("Volume {} ({}) created", id, name);
            }
            VolumeAction::List => {
                if repo.volumes().is_empty() {
                    println!("No volumes found");
                    return Ok(());
                }
                println!("{:<10} {:<20} {:<10} {}", "ID", "Name", "Snapshots", "Description");
                println!("{:-<70}", "");
                for volume in repo.volumes() {
                    println!(
                        "{:<10} {:<20} {:<10} {}",
                        volume.id,
                        volume.name,
                        volume.snapshots.len(),
                        volume.description
                    );
                }
            }
        }
        Ok(())
    }
}
