use super::{default_concurrency, join_error, Pipeline, Progress, PROGRESS_BUFFER};
use crate::backend::Backend;
use crate::codec::Codec;
use crate::erasure::ErasureCoder;
use crate::repository::Repository;
use crate::snapshot::{Archive, ArchiveChunk, ArchiveType, Snapshot, Stats};
use crate::{ChunkID, Error, Result};
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Rebuilds the archives of `snapshot` below `target`.
///
/// Archives whose path equals one of `excludes` are skipped. With `dry_run`
/// every selected archive is reported but nothing is read or written.
pub fn restore(
    repository: &Repository,
    snapshot: &Snapshot,
    target: impl AsRef<Path>,
    excludes: &[String],
    dry_run: bool,
) -> Result<Pipeline<Stats>> {
    let target = target.as_ref();
    if target.exists() && !target.is_dir() {
        return Err(Error::InvalidOptions(format!(
            "restore target {} is not a directory",
            target.display()
        )));
    }
    let target = if dry_run {
        target.to_path_buf()
    } else {
        std::fs::create_dir_all(target)?;
        target.canonicalize()?
    };

    let excludes: HashSet<&str> = excludes.iter().map(String::as_str).collect();
    let archives: Vec<Archive> = snapshot
        .archives
        .iter()
        .filter(|archive| !excludes.contains(archive.path.as_str()))
        .cloned()
        .collect();

    let (tx, rx) = mpsc::channel(PROGRESS_BUFFER);
    let worker = RestoreWorker {
        backend: repository.backend(),
        codec: repository.codec(),
        target,
        dry_run,
        concurrency: default_concurrency(),
    };
    let task = tokio::spawn(worker.run(archives, tx));
    Ok(Pipeline::new(rx, task))
}

struct RestoreWorker {
    backend: Arc<dyn Backend>,
    codec: Arc<Codec>,
    target: PathBuf,
    dry_run: bool,
    concurrency: usize,
}

impl RestoreWorker {
    async fn run(self, archives: Vec<Archive>, progress: mpsc::Sender<Progress>) -> Result<Stats> {
        let mut stats = Stats::default();
        let mut dir_modes = Vec::new();

        for archive in &archives {
            let result = match self.restore_archive(archive).await {
                Ok((dest, transferred)) => {
                    if archive.is_dir() {
                        dir_modes.push((dest, archive.mode));
                    }
                    stats.record(archive);
                    stats.transferred += transferred;
                    Progress::done(archive.path.as_str(), archive.size)
                }
                Err(e) => {
                    warn!(path = %archive.path, error = %e, "Failed to restore path");
                    stats.errors += 1;
                    Progress::failed(archive.path.as_str(), e)
                }
            };

            if progress.send(result).await.is_err() {
                debug!("Progress receiver dropped, stopping restore");
                break;
            }
        }

        // deepest first, so a read-only parent never blocks its children
        for (dir, mode) in dir_modes.iter().rev() {
            if let Err(e) = set_mode(dir, *mode).await {
                warn!(path = %dir.display(), error = %e, "Failed to set directory mode");
            }
        }

        if !self.dry_run {
            info!(
                target = %self.target.display(),
                files = stats.files,
                dirs = stats.dirs,
                symlinks = stats.symlinks,
                bytes = stats.size,
                "Restored snapshot"
            );
        }
        Ok(stats)
    }

    async fn restore_archive(&self, archive: &Archive) -> Result<(PathBuf, u64)> {
        let dest = self.target.join(sanitize_path(&archive.path)?);
        if self.dry_run {
            return Ok((dest, 0));
        }

        self.prepare_parent(&dest).await?;
        match archive.archive_type {
            ArchiveType::Directory => {
                tokio::fs::create_dir_all(&dest).await?;
                Ok((dest, 0))
            }
            ArchiveType::Symlink => {
                let points_to = archive.points_to.as_deref().ok_or_else(|| {
                    Error::Integrity(format!("symlink {} has no target", archive.path))
                })?;
                remove_symlink(&dest).await?;
                create_symlink(points_to, &dest).await?;
                Ok((dest, 0))
            }
            ArchiveType::File => {
                remove_symlink(&dest).await?;
                let transferred = self.restore_file(archive, &dest).await?;
                Ok((dest, transferred))
            }
        }
    }

    /// Creates the parent directories of `dest`, refusing to leave the
    /// restore target through a symlink restored earlier.
    async fn prepare_parent(&self, dest: &Path) -> Result<()> {
        let Some(parent) = dest.parent() else {
            return Ok(());
        };
        self.ensure_within_target(parent).await?;
        tokio::fs::create_dir_all(parent).await?;
        self.ensure_within_target(parent).await
    }

    async fn ensure_within_target(&self, path: &Path) -> Result<()> {
        let mut cursor = Some(path);
        while let Some(candidate) = cursor {
            if let Ok(canonical) = tokio::fs::canonicalize(candidate).await {
                if !canonical.starts_with(&self.target) {
                    return Err(Error::Integrity(format!(
                        "refusing to restore outside {}: {}",
                        self.target.display(),
                        path.display()
                    )));
                }
                return Ok(());
            }
            cursor = candidate.parent();
        }
        Ok(())
    }

    /// Writes `archive` to `dest`. A file that fails midway is removed.
    async fn restore_file(&self, archive: &Archive, dest: &Path) -> Result<u64> {
        let mut file = tokio::fs::File::create(dest).await?;
        match self.write_chunks(archive, &mut file).await {
            Ok(transferred) => {
                let file = file.into_std().await;
                file.set_modified(UNIX_EPOCH + Duration::from_secs(archive.mod_time.max(0) as u64))?;
                drop(file);
                set_mode(dest, archive.mode).await?;
                Ok(transferred)
            }
            Err(e) => {
                drop(file);
                if let Err(cleanup) = tokio::fs::remove_file(dest).await {
                    warn!(path = %dest.display(), error = %cleanup, "Failed to remove partial file");
                }
                Err(e)
            }
        }
    }

    async fn write_chunks(&self, archive: &Archive, file: &mut tokio::fs::File) -> Result<u64> {
        let mut chunks = stream::iter(archive.chunks.iter().cloned())
            .map(|chunk| async move { self.fetch_chunk(&chunk).await })
            .buffered(self.concurrency);

        let mut transferred = 0;
        while let Some(result) = chunks.next().await {
            let (data, fetched) = result?;
            file.write_all(&data).await?;
            transferred += fetched;
        }
        file.flush().await?;
        Ok(transferred)
    }

    /// Fetches, joins, decodes and verifies one chunk.
    async fn fetch_chunk(&self, chunk: &ArchiveChunk) -> Result<(Vec<u8>, u64)> {
        let id = chunk.id;
        let fragments: Vec<Option<Vec<u8>>> =
            futures::future::join_all((0..chunk.shape.fragment_count()).map(|n| {
                let key = id.fragment_key(n);
                async move {
                    match self.backend.read(&key).await {
                        Ok(data) => Some(data.to_vec()),
                        Err(e) => {
                            debug!(key = %key, error = %e, "Fragment unavailable");
                            None
                        }
                    }
                }
            }))
            .await;
        let fetched: u64 = fragments.iter().flatten().map(|f| f.len() as u64).sum();

        let shape = chunk.shape;
        let size = chunk.size;
        let codec = self.codec.clone();
        let data = tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
            let encoded = ErasureCoder::for_shape(&shape)?.join(fragments)?;
            let plaintext = codec.decode(&encoded, shape.compression, shape.encryption)?;
            if ChunkID::from_data(&plaintext) != id {
                return Err(Error::Integrity(format!("chunk {} does not match its fingerprint", id)));
            }
            if plaintext.len() as u64 != size {
                return Err(Error::Integrity(format!(
                    "chunk {} is {} bytes, expected {}",
                    id,
                    plaintext.len(),
                    size
                )));
            }
            Ok(plaintext)
        })
        .await
        .map_err(join_error)??;

        Ok((data, fetched))
    }
}

/// Relative restore path of an archive, refusing anything that could escape
/// the target directory.
fn sanitize_path(raw: &str) -> Result<PathBuf> {
    let mut out = PathBuf::new();
    for component in Path::new(raw).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::Integrity(format!("refusing to restore unsafe path: {raw}")));
            }
        }
    }
    if out.as_os_str().is_empty() {
        return Err(Error::Integrity(format!("refusing to restore empty path: {raw:?}")));
    }
    Ok(out)
}

/// Removes `dest` if it is a symlink, so nothing is written through it.
async fn remove_symlink(dest: &Path) -> Result<()> {
    if let Ok(metadata) = tokio::fs::symlink_metadata(dest).await {
        if metadata.file_type().is_symlink() {
            tokio::fs::remove_file(dest).await?;
        }
    }
    Ok(())
}

#[cfg(unix)]
async fn create_symlink(points_to: &str, dest: &Path) -> Result<()> {
    tokio::fs::symlink(points_to, dest).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn create_symlink(points_to: &str, dest: &Path) -> Result<()> {
    Err(Error::Other(format!(
        "cannot create symlink {} -> {} on this platform",
        dest.display(),
        points_to
    )))
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}
