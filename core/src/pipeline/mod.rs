//! Asynchronous store and restore pipelines.
//!
//! Both pipelines run as a spawned task and report one [`Progress`] item per
//! processed path through a bounded channel. Per-path failures travel inside
//! the progress item; only failures that end the whole run come back from
//! [`Pipeline::finish`].

mod restore;
mod store;

pub use restore::restore;
pub use store::store;

use crate::codec::{Compression, Encryption};
use crate::erasure::ErasureCoder;
use crate::{ChunkShape, Error, Result};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const PROGRESS_BUFFER: usize = 64;

/// Outcome of one archive path.
#[derive(Debug)]
pub struct Progress {
    pub path: String,
    pub size: u64,
    pub error: Option<Error>,
}

impl Progress {
    fn done(path: impl Into<String>, size: u64) -> Self {
        Self {
            path: path.into(),
            size,
            error: None,
        }
    }

    fn failed(path: impl Into<String>, error: Error) -> Self {
        Self {
            path: path.into(),
            size: 0,
            error: Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Handle on a running pipeline task.
///
/// Dropping the handle (or calling [`Pipeline::detach`]) closes the progress
/// stream; the task then completes the path it is working on and stops.
pub struct Pipeline<T> {
    progress: mpsc::Receiver<Progress>,
    task: JoinHandle<Result<T>>,
}

impl<T> Pipeline<T> {
    fn new(progress: mpsc::Receiver<Progress>, task: JoinHandle<Result<T>>) -> Self {
        Self { progress, task }
    }

    /// Next progress item, or `None` once the task has finished.
    pub async fn next(&mut self) -> Option<Progress> {
        self.progress.recv().await
    }

    /// Discards the remaining progress and waits for the task result.
    pub async fn finish(mut self) -> Result<T> {
        while self.progress.recv().await.is_some() {}
        self.task.await.map_err(join_error)?
    }

    /// Gathers every remaining progress item along with the task result.
    pub async fn collect(mut self) -> (Vec<Progress>, Result<T>) {
        let mut items = Vec::new();
        while let Some(item) = self.progress.recv().await {
            items.push(item);
        }
        let result = self.task.await.map_err(join_error).and_then(|r| r);
        (items, result)
    }

    /// Stops listening for progress and returns the task handle.
    pub fn detach(self) -> JoinHandle<Result<T>> {
        self.task
    }
}

/// Settings of one store run.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Directory the archive paths are taken relative to.
    pub cwd: PathBuf,
    pub paths: Vec<String>,
    /// Relative paths to skip; an excluded directory is not descended into.
    pub excludes: Vec<String>,
    pub compress: Compression,
    pub encrypt: Encryption,
    pub data_parts: usize,
    pub parity_parts: usize,
    /// Abort on the first per-path error instead of reporting and moving on.
    pub pedantic: bool,
    /// Average content-defined chunk size in bytes.
    pub chunk_size: u32,
    /// Number of chunks of one file processed at the same time.
    pub concurrency: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            cwd: PathBuf::from("."),
            paths: Vec::new(),
            excludes: Vec::new(),
            compress: Compression::Zstd,
            encrypt: Encryption::Aes,
            data_parts: 1,
            parity_parts: 0,
            pedantic: false,
            chunk_size: 1024 * 1024,
            concurrency: default_concurrency(),
        }
    }
}

impl StoreOptions {
    pub fn validate(&self) -> Result<()> {
        ErasureCoder::new(self.data_parts, self.parity_parts)?;
        if self.chunk_size == 0 {
            return Err(Error::InvalidOptions("chunk size must be positive".to_string()));
        }
        if self.concurrency == 0 {
            return Err(Error::InvalidOptions("concurrency must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Shape given to chunks first stored by this run.
    pub fn shape(&self) -> ChunkShape {
        ChunkShape {
            compression: self.compress,
            encryption: self.encrypt,
            data_parts: self.data_parts,
            parity_parts: self.parity_parts,
        }
    }
}

pub(crate) fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

pub(crate) fn join_error(e: tokio::task::JoinError) -> Error {
    Error::Other(format!("worker task failed: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options_are_valid() {
        let options = StoreOptions::default();
        options.validate().unwrap();
        assert_eq!(options.shape().fragment_count(), 1);
    }

    #[test]
    fn test_invalid_options() {
        let zero_data = StoreOptions {
            data_parts: 0,
            ..Default::default()
        };
        assert!(matches!(zero_data.validate(), Err(Error::InvalidOptions(_))));

        let too_many = StoreOptions {
            data_parts: 250,
            parity_parts: 7,
            ..Default::default()
        };
        assert!(matches!(too_many.validate(), Err(Error::InvalidOptions(_))));

        let serial = StoreOptions {
            concurrency: 0,
            ..Default::default()
        };
        assert!(serial.validate().is_err());
    }

    #[tokio::test]
    async fn test_finish_drains_progress() {
        let (tx, rx) = mpsc::channel(1);
        let task = tokio::spawn(async move {
            for i in 0..5u64 {
                tx.send(Progress::done(format!("file{i}"), i)).await.ok();
            }
            Ok(42)
        });

        let pipeline = Pipeline::new(rx, task);
        assert_eq!(pipeline.finish().await.unwrap(), 42);
    }
}
