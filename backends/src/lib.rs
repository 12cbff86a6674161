pub mod local;
pub mod retry;

pub use local::LocalBackend;
pub use retry::{retry_with_backoff, RetryBackend, RetryConfig, Retryable};
pub use shardvault_core::backend::{Backend, BackendType, MemoryBackend};
