pub mod backend;
pub mod chunker;
pub mod codec;
pub mod crypto;
pub mod erasure;
pub mod error;
pub mod index;
pub mod pipeline;
pub mod repository;
pub mod snapshot;
pub mod types;
pub mod volume;

pub use backend::{Backend, BackendType, MemoryBackend};
pub use codec::{Compression, Encryption};
pub use error::{Error, Result};
pub use index::{ChunkIndex, ChunkIndexEntry};
pub use pipeline::{Pipeline, Progress, StoreOptions};
pub use repository::{Repository, LATEST};
pub use snapshot::{Archive, ArchiveType, Snapshot, Stats};
pub use types::*;
pub use volume::Volume;
