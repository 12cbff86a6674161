use crate::crypto::Encryptor;
use crate::repository::Repository;
use crate::{ChunkID, ChunkShape, Error, Result, SnapshotID};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArchiveType {
    File,
    Directory,
    Symlink,
}

/// One content-addressed piece of an archive, in replay order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveChunk {
    pub id: ChunkID,
    pub size: u64,
    pub shape: ChunkShape,
}

/// A single file system entry captured by a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Archive {
    /// Path relative to the store working directory, `/`-separated.
    pub path: String,
    pub points_to: Option<String>,
    pub archive_type: ArchiveType,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mod_time: i64,
    pub size: u64,
    pub storage_size: u64,
    pub chunks: Vec<ArchiveChunk>,
}

impl Archive {
    pub fn is_file(&self) -> bool {
        matches!(self.archive_type, ArchiveType::File)
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.archive_type, ArchiveType::Directory)
    }

    pub fn is_symlink(&self) -> bool {
        matches!(self.archive_type, ArchiveType::Symlink)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub files: u64,
    pub dirs: u64,
    pub symlinks: u64,
    pub size: u64,
    pub storage_size: u64,
    pub transferred: u64,
    pub errors: u64,
}

impl Stats {
    pub fn record(&mut self, archive: &Archive) {
        match archive.archive_type {
            ArchiveType::File => self.files += 1,
            ArchiveType::Directory => self.dirs += 1,
            ArchiveType::Symlink => self.symlinks += 1,
        }
        self.size += archive.size;
        self.storage_size += archive.storage_size;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: SnapshotID,
    pub date: DateTime<Utc>,
    pub description: String,
    pub hostname: String,
    pub stats: Stats,
    pub archives: Vec<Archive>,
}

impl Snapshot {
    pub fn new(description: impl Into<String>) -> Self {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            date: Utc::now(),
            description: description.into(),
            hostname,
            stats: Stats::default(),
            archives: Vec::new(),
        }
    }

    /// Copy of this snapshot under a fresh id and timestamp, used as the base
    /// of an incremental snapshot.
    pub fn fork(&self) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            date: Utc::now(),
            ..self.clone()
        }
    }

    pub fn add_archive(&mut self, archive: Archive) {
        self.stats.record(&archive);
        self.archives.push(archive);
    }

    pub fn find_archive(&self, path: &str) -> Option<&Archive> {
        self.archives.iter().find(|archive| archive.path == path)
    }

    /// Persists this snapshot under its id. Does not touch any volume.
    pub async fn save(&self, repository: &Repository) -> Result<()> {
        repository.save_snapshot(self).await
    }

    pub fn serialize(&self, encryptor: &Encryptor) -> Result<Bytes> {
        let json_data = serde_json::to_vec(self)
            .map_err(|e| Error::Persistence(format!("Failed to serialize snapshot: {}", e)))?;
        let encrypted_data = encryptor.encrypt(&json_data)?;
        Ok(Bytes::from(encrypted_data))
    }

    pub fn deserialize(data: &[u8], encryptor: &Encryptor) -> Result<Self> {
        let decrypted_data = encryptor.decrypt(data)?;
        serde_json::from_slice(&decrypted_data)
            .map_err(|e| Error::Persistence(format!("Failed to deserialize snapshot: {}", e)))
    }

    pub fn short_id(&self) -> String {
        self.id.chars().take(8).collect()
    }

    pub fn summary(&self) -> String {
        format!("{} - {} archives on {} at {}",
            self.short_id(),
            self.archives.len(),
            self.hostname,
            self.date.format("%Y-%m-%d %H:%M:%S UTC")
        )
    }
}
