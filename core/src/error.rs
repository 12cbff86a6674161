use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Integrity check failed: {0}")]
    Integrity(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Insufficient fragments: {available} available, {required} required")]
    InsufficientFragments { available: usize, required: usize },

    #[error("Repository not found at {path}")]
    RepositoryNotFound { path: String },

    #[error("Repository already exists at {path}")]
    RepositoryExists { path: String },

    #[error("Invalid repository format version: {version}")]
    InvalidFormatVersion { version: u32 },

    #[error("Snapshot not found: {id}")]
    SnapshotNotFound { id: String },

    #[error("Volume not found: {id}")]
    VolumeNotFound { id: String },

    #[error("Chunk not found: {id}")]
    ChunkNotFound { id: String },

    #[error("Invalid password")]
    InvalidPassword,

    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Aborted while processing {path}: {reason}")]
    Aborted { path: String, reason: String },

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True for the snapshot, volume and chunk lookup failures.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::SnapshotNotFound { .. } | Error::VolumeNotFound { .. } | Error::ChunkNotFound { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
