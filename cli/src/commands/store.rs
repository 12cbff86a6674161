use crate::config::Config;
use anyhow::{anyhow, Result};
use clap::Args;
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use shardvault_core::pipeline::{self, StoreOptions};
use shardvault_core::{ChunkIndex, Compression, Encryption, Snapshot};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Args)]
pub struct StoreCommand {
    #[arg(help = "Volume id or name to add the snapshot to")]
    volume: String,

    #[arg(required = true, help = "Paths to store, relative to the working directory")]
    paths: Vec<String>,

    #[arg(long, short, default_value = "", help = "Snapshot description")]
    description: String,

    #[arg(long, short = 'x', help = "Relative path to exclude (repeatable)")]
    exclude: Vec<String>,

    #[arg(long, help = "Compression: none, flate, gzip, lzma, zstd")]
    compression: Option<String>,

    #[arg(long, help = "Encryption: none, aes, chacha20")]
    encryption: Option<String>,

    #[arg(long, help = "Erasure data parts per chunk")]
    data_parts: Option<usize>,

    #[arg(long, help = "Erasure parity parts per chunk")]
    parity_parts: Option<usize>,

    #[arg(long, help = "Average chunk size in bytes")]
    chunk_size: Option<u32>,

    #[arg(long, help = "Chunks processed concurrently per file")]
    concurrency: Option<usize>,

    #[arg(long, help = "Abort on the first error")]
    pedantic: bool,
}

impl StoreCommand {
    fn options(&self, config: &Config) -> Result<StoreOptions> {
        let defaults = &config.store;
        let compress: Compression = self
            .compression
            .as_deref()
            .unwrap_or(&defaults.compression)
            .parse()?;
        let encrypt: Encryption = self
            .encryption
            .as_deref()
            .unwrap_or(&defaults.encryption)
            .parse()?;

        let mut options = StoreOptions {
            cwd: std::env::current_dir()?,
            paths: self.paths.clone(),
            excludes: self.exclude.clone(),
            compress,
            encrypt,
            data_parts: self.data_parts.unwrap_or(defaults.data_parts),
            parity_parts: self.parity_parts.unwrap_or(defaults.parity_parts),
            pedantic: self.pedantic,
            chunk_size: self.chunk_size.unwrap_or(defaults.chunk_size),
            ..Default::default()
        };
        if let Some(concurrency) = self.concurrency.or(defaults.concurrency) {
            options.concurrency = concurrency;
        }
        Ok(options)
    }

    pub async fn run(&self, cli: &crate::Cli, config: &Config) -> Result<()> {
        let options = self.options(config)?;
        let mut repo = super::open_repository(cli, config).await?;
        let volume_id = repo.find_volume(&self.volume)?.id.clone();
        let index = Arc::new(ChunkIndex::open(&repo).await?);

        info!(
            volume = %volume_id,
            compression = %options.compress,
            encryption = %options.encrypt,
            data_parts = options.data_parts,
            parity_parts = options.parity_parts,
            "Starting store"
        );

        let pb = ProgressBar::new_spinner();
        pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {pos} paths, {msg}")?);

        let mut pipeline = pipeline::store(&repo, index.clone(), Snapshot::new(self.description.clone()), options)?;
        let mut stored_bytes = 0u64;
        let mut failures = 0u64;
        while let Some(progress) = pipeline.next().await {
            pb.inc(1);
            match &progress.error {
                Some(e) => {
                    failures += 1;
                    pb.println(format!("error: {}: {}", progress.path, e));
                }
                None => {
                    stored_bytes += progress.size;
                    pb.set_message(format!("{} {}", HumanBytes(stored_bytes), progress.path));
                }
            }
        }
        let snapshot = pipeline.finish().await?;
        pb.finish_and_clear();

        snapshot.save(&repo).await?;
        repo.find_volume_mut(&volume_id)?.add_snapshot(snapshot.id.clone());
        repo.save().await?;
        index.save(&repo).await?;

        println!("Snapshot {} created: {}", snapshot.id, snapshot.summary());
        println!(
            "{} files, {} dirs, {} symlinks, {} stored as {} new",
            snapshot.stats.files,
            snapshot.stats.dirs,
            snapshot.stats.symlinks,
            HumanBytes(snapshot.stats.size),
            HumanBytes(snapshot.stats.transferred)
        );

        if failures > 0 {
            warn!(failures, "Some paths could not be stored");
            return Err(anyhow!("{} paths could not be stored", failures));
        }
        Ok(())
    }
}
