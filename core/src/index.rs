//! Repository-wide chunk index.
//!
//! Maps every stored fingerprint to its reference count, the shape it was
//! stored with and its plaintext size. The table sits behind a lock so the
//! store workers can share one `Arc<ChunkIndex>`; fingerprint reservations
//! serialize the lookup → store → insert sequence per chunk.

use crate::repository::Repository;
use crate::snapshot::Snapshot;
use crate::{ChunkID, ChunkShape, Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

const INDEX_PREFIX: &str = "index/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkIndexEntry {
    pub refcount: u32,
    pub shape: ChunkShape,
    pub size: u64,
}

type Table = HashMap<ChunkID, ChunkIndexEntry>;

#[derive(Debug, Default)]
pub struct ChunkIndex {
    entries: Mutex<Table>,
    generation: AtomicU64,
    reservations: Mutex<HashMap<ChunkID, Arc<tokio::sync::Mutex<()>>>>,
}

impl ChunkIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the newest readable index generation, or an empty index.
    ///
    /// Generations that fail to decrypt or decode are skipped. Any other
    /// failure, such as a backend read error, is returned.
    pub async fn open(repository: &Repository) -> Result<Self> {
        let mut generations = list_generations(repository).await?;
        generations.sort_unstable_by(|a, b| b.0.cmp(&a.0));

        for (generation, key) in generations {
            let table = match repository.read_blob(&key).await {
                Ok(plaintext) => bincode::deserialize::<Table>(&plaintext).map_err(Error::from),
                Err(e) => Err(e),
            };
            match table {
                Ok(entries) => {
                    debug!(generation, chunks = entries.len(), "Loaded chunk index");
                    return Ok(Self {
                        entries: Mutex::new(entries),
                        generation: AtomicU64::new(generation),
                        reservations: Mutex::default(),
                    });
                }
                Err(e @ (Error::Integrity(_) | Error::Encoding(_))) => {
                    warn!(generation, error = %e, "Skipping unreadable chunk index generation");
                }
                Err(e) => return Err(e),
            }
        }

        debug!("No chunk index found, starting empty");
        Ok(Self::new())
    }

    /// Writes the index as a new generation, then drops older generations.
    ///
    /// The new generation is numbered above every generation present in
    /// the backend, unreadable ones included. The previous generation stays
    /// readable until the new one is fully written, so an interrupted save
    /// never loses the last good index.
    pub async fn save(&self, repository: &Repository) -> Result<()> {
        let (plaintext, chunks) = {
            let entries = self.table();
            (bincode::serialize(&*entries)?, entries.len())
        };

        let existing = list_generations(repository).await?;
        let newest = existing
            .iter()
            .map(|(generation, _)| *generation)
            .max()
            .unwrap_or(0)
            .max(self.generation());
        let generation = newest + 1;
        repository.write_blob(&generation_key(generation), &plaintext).await?;
        self.generation.store(generation, Ordering::SeqCst);

        let backend = repository.backend();
        for (old, key) in existing {
            if old < generation {
                if let Err(e) = backend.delete(&key).await {
                    warn!(key = %key, error = %e, "Failed to remove old chunk index generation");
                }
            }
        }

        info!(generation, chunks, "Saved chunk index");
        Ok(())
    }

    pub fn lookup(&self, id: &ChunkID) -> Option<ChunkIndexEntry> {
        self.table().get(id).copied()
    }

    pub fn contains(&self, id: &ChunkID) -> bool {
        self.table().contains_key(id)
    }

    /// Adds one reference to `id`, creating the entry on first use.
    ///
    /// An existing entry keeps the shape it was stored with. Returns the new
    /// reference count.
    pub fn insert(&self, id: ChunkID, shape: ChunkShape, size: u64) -> u32 {
        let mut entries = self.table();
        let entry = entries
            .entry(id)
            .and_modify(|e| e.refcount += 1)
            .or_insert(ChunkIndexEntry {
                refcount: 1,
                shape,
                size,
            });
        entry.refcount
    }

    /// Drops one reference. Entries stay in the index at zero so a later
    /// garbage collection can find them. Returns `None` for unknown ids.
    pub fn release(&self, id: &ChunkID) -> Option<u32> {
        let mut entries = self.table();
        let entry = entries.get_mut(id)?;
        entry.refcount = entry.refcount.saturating_sub(1);
        Some(entry.refcount)
    }

    /// Releases every chunk reference held by `snapshot`'s archives.
    pub fn release_snapshot(&self, snapshot: &Snapshot) -> usize {
        snapshot
            .archives
            .iter()
            .flat_map(|archive| archive.chunks.iter())
            .filter(|chunk| self.release(&chunk.id).is_some())
            .count()
    }

    /// Fingerprints no snapshot references any more.
    pub fn unreferenced(&self) -> Vec<ChunkID> {
        self.table()
            .iter()
            .filter(|(_, entry)| entry.refcount == 0)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Waits until no other task holds a reservation for `id`.
    ///
    /// Holders of a reservation are the only writers of `id`'s fragments and
    /// index entry until the returned guard is dropped.
    pub async fn reserve(&self, id: ChunkID) -> Reservation<'_> {
        let lock = self
            .reservations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(id)
            .or_default()
            .clone();
        let guard = lock.clone().lock_owned().await;
        Reservation {
            index: self,
            id,
            lock,
            _guard: guard,
        }
    }

    fn table(&self) -> MutexGuard<'_, Table> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct Reservation<'a> {
    index: &'a ChunkIndex,
    id: ChunkID,
    lock: Arc<tokio::sync::Mutex<()>>,
    _guard: tokio::sync::OwnedMutexGuard<()>,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        let mut reservations = self
            .index
            .reservations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // map + `lock` + the guard's own handle: nobody else is waiting
        if Arc::strong_count(&self.lock) <= 3 {
            reservations.remove(&self.id);
        }
    }
}

async fn list_generations(repository: &Repository) -> Result<Vec<(u64, String)>> {
    Ok(repository
        .backend()
        .list(INDEX_PREFIX)
        .await?
        .into_iter()
        .filter_map(|key| {
            let generation = u64::from_str_radix(key.strip_prefix(INDEX_PREFIX)?, 16).ok()?;
            Some((generation, key))
        })
        .collect())
}

fn generation_key(generation: u64) -> String {
    format!("{}{:016x}", INDEX_PREFIX, generation)
}
