use super::{join_error, Pipeline, Progress, StoreOptions, PROGRESS_BUFFER};
use crate::backend::Backend;
use crate::chunker::{Chunk, Chunker};
use crate::codec::Codec;
use crate::erasure::ErasureCoder;
use crate::index::ChunkIndex;
use crate::repository::Repository;
use crate::snapshot::{Archive, ArchiveChunk, ArchiveType, Snapshot};
use crate::{ChunkShape, Error, Result};
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::fs::Metadata;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Adds `options.paths` to `snapshot`.
///
/// Returns once the options are validated; the work happens on a spawned
/// task. Neither the snapshot, the repository nor the index is saved here:
/// the caller persists them after [`Pipeline::finish`] hands the snapshot
/// back.
pub fn store(
    repository: &Repository,
    index: Arc<ChunkIndex>,
    snapshot: Snapshot,
    options: StoreOptions,
) -> Result<Pipeline<Snapshot>> {
    options.validate()?;

    let (tx, rx) = mpsc::channel(PROGRESS_BUFFER);
    let worker = StoreWorker {
        backend: repository.backend(),
        codec: repository.codec(),
        index,
        shape: options.shape(),
        chunker: Chunker::new(options.chunk_size),
        options,
    };
    let task = tokio::spawn(worker.run(snapshot, tx));
    Ok(Pipeline::new(rx, task))
}

struct StoreWorker {
    backend: Arc<dyn Backend>,
    codec: Arc<Codec>,
    index: Arc<ChunkIndex>,
    shape: ChunkShape,
    chunker: Chunker,
    options: StoreOptions,
}

struct StoredChunk {
    chunk: ArchiveChunk,
    written: u64,
}

enum Walked {
    Entry {
        path: PathBuf,
        rel: String,
        metadata: Metadata,
    },
    Failed {
        rel: String,
        error: Error,
    },
}

impl StoreWorker {
    async fn run(self, mut snapshot: Snapshot, progress: mpsc::Sender<Progress>) -> Result<Snapshot> {
        let excludes: Arc<HashSet<String>> = Arc::new(self.options.excludes.iter().cloned().collect());

        for path in &self.options.paths {
            let root = self.options.cwd.join(path);
            let cwd = self.options.cwd.clone();
            let excludes = excludes.clone();
            let entries = tokio::task::spawn_blocking(move || walk(&cwd, &root, &excludes))
                .await
                .map_err(join_error)?;

            for walked in entries {
                let (rel, result) = match walked {
                    Walked::Entry { path, rel, metadata } => {
                        let result = self.store_entry(&path, &rel, &metadata).await;
                        (rel, result)
                    }
                    Walked::Failed { rel, error } => (rel, Err(error)),
                };

                let item = match result {
                    Ok(Some((archive, written))) => {
                        let item = Progress::done(rel, archive.size);
                        snapshot.stats.transferred += written;
                        snapshot.add_archive(archive);
                        item
                    }
                    Ok(None) => continue,
                    Err(error) => {
                        warn!(path = %rel, error = %error, "Failed to store path");
                        snapshot.stats.errors += 1;
                        let reason = error.to_string();
                        if self.options.pedantic {
                            let _ = progress.send(Progress::failed(rel.clone(), error)).await;
                            return Err(Error::Aborted { path: rel, reason });
                        }
                        Progress::failed(rel, error)
                    }
                };

                if progress.send(item).await.is_err() {
                    debug!("Progress receiver dropped, stopping store");
                    return Ok(snapshot);
                }
            }
        }

        info!(
            snapshot = %snapshot.short_id(),
            archives = snapshot.archives.len(),
            transferred = snapshot.stats.transferred,
            "Stored paths"
        );
        Ok(snapshot)
    }

    /// Builds the archive for one walked entry. `None` for entries that are
    /// not captured, such as sockets and device nodes.
    async fn store_entry(&self, path: &Path, rel: &str, metadata: &Metadata) -> Result<Option<(Archive, u64)>> {
        let file_type = metadata.file_type();
        let (mode, uid, gid) = ownership(metadata);
        let mut archive = Archive {
            path: rel.to_string(),
            points_to: None,
            archive_type: ArchiveType::File,
            mode,
            uid,
            gid,
            mod_time: mod_time(metadata),
            size: 0,
            storage_size: 0,
            chunks: Vec::new(),
        };

        if file_type.is_dir() {
            archive.archive_type = ArchiveType::Directory;
            return Ok(Some((archive, 0)));
        }
        if file_type.is_symlink() {
            let target = tokio::fs::read_link(path).await?;
            archive.archive_type = ArchiveType::Symlink;
            archive.points_to = Some(target.to_string_lossy().into_owned());
            return Ok(Some((archive, 0)));
        }
        if !file_type.is_file() {
            debug!(path = %rel, "Skipping special file");
            return Ok(None);
        }

        let written = self.store_file(path, &mut archive).await?;
        Ok(Some((archive, written)))
    }

    /// Chunks one file and stores every chunk, preserving chunk order.
    async fn store_file(&self, path: &Path, archive: &mut Archive) -> Result<u64> {
        let (chunk_tx, chunk_rx) = mpsc::channel::<Result<Chunk>>(self.options.concurrency);
        let chunker = self.chunker;
        let file_path = path.to_path_buf();
        let reader = tokio::task::spawn_blocking(move || {
            let file = match std::fs::File::open(&file_path) {
                Ok(file) => file,
                Err(e) => {
                    let _ = chunk_tx.blocking_send(Err(e.into()));
                    return;
                }
            };
            for chunk in chunker.stream(std::io::BufReader::new(file)) {
                if chunk_tx.blocking_send(chunk).is_err() {
                    break;
                }
            }
        });

        let chunks = stream::unfold(chunk_rx, |mut rx| async move {
            rx.recv().await.map(|chunk| (chunk, rx))
        });
        let mut stored = Box::pin(
            chunks
                .map(|chunk| async move { self.store_chunk(chunk?).await })
                .buffered(self.options.concurrency),
        );

        let mut written = 0;
        let mut failure = None;
        while let Some(result) = stored.next().await {
            match result {
                Ok(chunk) => {
                    archive.size += chunk.chunk.size;
                    archive.storage_size += chunk.written;
                    written += chunk.written;
                    archive.chunks.push(chunk.chunk);
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        drop(stored);
        reader.await.map_err(join_error)?;

        match failure {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }

    /// Stores one chunk unless the index already knows its fingerprint.
    async fn store_chunk(&self, chunk: Chunk) -> Result<StoredChunk> {
        let id = chunk.id();
        let size = chunk.len() as u64;
        let _reservation = self.index.reserve(id).await;

        if let Some(entry) = self.index.lookup(&id) {
            self.index.insert(id, entry.shape, size);
            return Ok(StoredChunk {
                chunk: ArchiveChunk {
                    id,
                    size,
                    shape: entry.shape,
                },
                written: 0,
            });
        }

        let shape = self.shape;
        let codec = self.codec.clone();
        let fragments = tokio::task::spawn_blocking(move || -> Result<Vec<Vec<u8>>> {
            let encoded = codec.encode(chunk.data(), shape.compression, shape.encryption)?;
            ErasureCoder::for_shape(&shape)?.split(&encoded)
        })
        .await
        .map_err(join_error)??;

        let written: u64 = fragments.iter().map(|f| f.len() as u64).sum();
        futures::future::try_join_all(fragments.into_iter().enumerate().map(|(n, fragment)| {
            let key = id.fragment_key(n);
            async move { self.backend.write(&key, Bytes::from(fragment)).await }
        }))
        .await?;

        self.index.insert(id, shape, size);
        debug!(chunk = %id.short_string(), size, written, "Stored chunk");
        Ok(StoredChunk {
            chunk: ArchiveChunk { id, size, shape },
            written,
        })
    }
}

fn walk(cwd: &Path, root: &Path, excludes: &HashSet<String>) -> Vec<Walked> {
    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !excludes.contains(&relative_path(cwd, entry.path())));

    let mut entries = Vec::new();
    for entry in walker {
        match entry {
            Ok(entry) => {
                let rel = relative_path(cwd, entry.path());
                if rel.is_empty() {
                    continue;
                }
                match entry.metadata() {
                    Ok(metadata) => entries.push(Walked::Entry {
                        path: entry.into_path(),
                        rel,
                        metadata,
                    }),
                    Err(e) => entries.push(Walked::Failed {
                        rel,
                        error: walk_error(e),
                    }),
                }
            }
            Err(e) => {
                let rel = e
                    .path()
                    .map(|p| relative_path(cwd, p))
                    .unwrap_or_else(|| relative_path(cwd, root));
                entries.push(Walked::Failed {
                    rel,
                    error: walk_error(e),
                });
            }
        }
    }
    entries
}

fn walk_error(e: walkdir::Error) -> Error {
    let message = e.to_string();
    match e.into_io_error() {
        Some(io) => Error::Io(io),
        None => Error::Other(message),
    }
}

/// `/`-separated archive path of `path` below `cwd`.
fn relative_path(cwd: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(cwd).unwrap_or(path);
    rel.components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            Component::ParentDir => Some("..".to_string()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn mod_time(metadata: &Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(unix)]
fn ownership(metadata: &Metadata) -> (u32, u32, u32) {
    use std::os::unix::fs::MetadataExt;
    (metadata.mode() & 0o7777, metadata.uid(), metadata.gid())
}

#[cfg(not(unix))]
fn ownership(metadata: &Metadata) -> (u32, u32, u32) {
    let mode = if metadata.is_dir() { 0o755 } else { 0o644 };
    (mode, 0, 0)
}
