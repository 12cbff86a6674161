pub mod init;
pub mod restore;
pub mod snapshots;
pub mod store;
pub mod volume;

use crate::config::Config;
use crate::Cli;
use anyhow::{anyhow, Result};
use shardvault_backends::{Backend, LocalBackend, RetryBackend, RetryConfig};
use shardvault_core::Repository;
use std::io::{self, Write};
use std::sync::Arc;
use tracing::info;

/// Repository location from the flag, `SHARDVAULT_REPO` or the config file.
pub fn repository_path(cli: &Cli, config: &Config) -> Result<String> {
    cli.repo
        .clone()
        .or_else(|| config.repository.clone())
        .ok_or_else(|| anyhow!("Repository path required (--repo or SHARDVAULT_REPO)"))
}

pub fn password(cli: &Cli) -> Result<String> {
    cli.password
        .clone()
        .or_else(|| {
            print!("Enter repository password: ");
            io::stdout().flush().ok()?;
            rpassword::read_password().ok()
        })
        .ok_or_else(|| anyhow!("Password required"))
}

pub fn backend(path: &str) -> Arc<dyn Backend> {
    let local: Arc<dyn Backend> = Arc::new(LocalBackend::new(path));
    Arc::new(RetryBackend::new(local, RetryConfig::default()))
}

pub async fn open_repository(cli: &Cli, config: &Config) -> Result<Repository> {
    let path = repository_path(cli, config)?;
    let password = password(cli)?;
    info!("Opening repository at: {}", path);
    Ok(Repository::open(backend(&path), &password).await?)
}
