use crate::config::Config;
use anyhow::{anyhow, Result};
use clap::Args;
use shardvault_core::Repository;
use tracing::info;

#[derive(Args)]
pub struct InitCommand {
    #[arg(help = "Repository path")]
    repo: Option<String>,
}

impl InitCommand {
    pub async fn run(&self, cli: &crate::Cli, config: &Config) -> Result<()> {
        let repo_path = match &self.repo {
            Some(path) => path.clone(),
            None => super::repository_path(cli, config)?,
        };

        let password = super::password(cli)?;
        if password.is_empty() {
            return Err(anyhow!("Password must not be empty"));
        }

        info!("Initializing repository at: {}", repo_path);
        let repo = Repository::init(super::backend(&repo_path), &password).await?;
        println!("Created repository {} at {}", repo.config().id, repo_path);
        Ok(())
    }
}
