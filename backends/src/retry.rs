use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use shardvault_core::backend::{Backend, BackendType};
use shardvault_core::{Error, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Configuration for retry behavior with exponential backoff
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first one included
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// Add up to 25% random jitter to each backoff
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    fn backoff_duration(&self, attempt: u32) -> Duration {
        let base_duration = self.initial_backoff.as_millis() as f64
            * self.backoff_multiplier.powi(attempt as i32);

        let duration_ms = base_duration.min(self.max_backoff.as_millis() as f64) as u64;
        let mut duration = Duration::from_millis(duration_ms);

        if self.jitter {
            let jitter_ms = rand::thread_rng().gen_range(0..=(duration_ms / 4));
            duration += Duration::from_millis(jitter_ms);
        }

        duration
    }
}

/// Whether an error is worth another attempt.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Io(e) => !matches!(
                e.kind(),
                std::io::ErrorKind::NotFound
                    | std::io::ErrorKind::PermissionDenied
                    | std::io::ErrorKind::AlreadyExists
            ),
            Error::Backend(msg) => {
                let msg = msg.to_ascii_lowercase();
                msg.contains("timed out")
                    || msg.contains("timeout")
                    || msg.contains("interrupted")
                    || msg.contains("temporarily unavailable")
                    || msg.contains("try again")
                    || msg.contains("connection reset")
            }
            // corrupt, missing or unauthorized data does not heal by retrying
            _ => false,
        }
    }
}

/// Retry a future operation with exponential backoff
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> std::result::Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: Retryable + std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(error) => {
                attempt += 1;
                if !error.is_retryable() {
                    debug!(
                        operation = operation_name,
                        error = %error,
                        "Error is not retryable, failing immediately"
                    );
                    return Err(error);
                }
                if attempt >= config.max_attempts {
                    warn!(
                        operation = operation_name,
                        max_attempts = config.max_attempts,
                        error = %error,
                        "Operation failed after all retry attempts"
                    );
                    return Err(error);
                }

                let backoff = config.backoff_duration(attempt - 1);
                warn!(
                    operation = operation_name,
                    attempt,
                    max_attempts = config.max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %error,
                    "Operation failed, retrying after backoff"
                );
                sleep(backoff).await;
            }
        }
    }
}

/// Wraps another backend and retries its transient failures.
pub struct RetryBackend {
    inner: Arc<dyn Backend>,
    config: RetryConfig,
}

impl RetryBackend {
    pub fn new(inner: Arc<dyn Backend>, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl Backend for RetryBackend {
    async fn init(&self) -> Result<()> {
        retry_with_backoff(&self.config, "init", || self.inner.init()).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        retry_with_backoff(&self.config, "exists", || self.inner.exists(key)).await
    }

    async fn read(&self, key: &str) -> Result<Bytes> {
        retry_with_backoff(&self.config, "read", || self.inner.read(key)).await
    }

    async fn write(&self, key: &str, data: Bytes) -> Result<()> {
        retry_with_backoff(&self.config, "write", || self.inner.write(key, data.clone())).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        retry_with_backoff(&self.config, "delete", || self.inner.delete(key)).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        retry_with_backoff(&self.config, "list", || self.inner.list(prefix)).await
    }

    fn backend_type(&self) -> BackendType {
        self.inner.backend_type()
    }

    fn location(&self) -> String {
        self.inner.location()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardvault_core::MemoryBackend;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_eventually() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        let result = retry_with_backoff(&fast(5), "test_operation", || {
            let attempts = attempts_clone.clone();
            async move {
                let count = attempts.fetch_add(1, Ordering::SeqCst);
                if count < 2 {
                    Err(Error::Io(std::io::Error::other("Temporary failure")))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_fails_after_max_attempts() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        let result = retry_with_backoff(&fast(3), "test_operation", || {
            let attempts = attempts_clone.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<i32, _>(Error::Io(std::io::Error::other("Persistent failure")))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_fails_immediately() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        let result = retry_with_backoff(&RetryConfig::default(), "test_operation", || {
            let attempts = attempts_clone.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<i32, _>(Error::Integrity("bad digest".to_string()))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_backoff_duration_calculation() {
        let config = RetryConfig {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            jitter: false,
            ..Default::default()
        };

        assert_eq!(config.backoff_duration(0), Duration::from_millis(100));
        assert_eq!(config.backoff_duration(1), Duration::from_millis(200));
        assert_eq!(config.backoff_duration(2), Duration::from_millis(400));
        assert_eq!(config.backoff_duration(10), Duration::from_secs(10));
    }

    /// Fails every `read` with a transient error until `failures` runs out.
    struct Flaky {
        inner: MemoryBackend,
        failures: AtomicU32,
    }

    #[async_trait]
    impl Backend for Flaky {
        async fn init(&self) -> Result<()> {
            Ok(())
        }
        async fn exists(&self, key: &str) -> Result<bool> {
            self.inner.exists(key).await
        }
        async fn read(&self, key: &str) -> Result<Bytes> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::Backend("connection reset by peer".to_string()));
            }
            self.inner.read(key).await
        }
        async fn write(&self, key: &str, data: Bytes) -> Result<()> {
            self.inner.write(key, data).await
        }
        async fn delete(&self, key: &str) -> Result<()> {
            self.inner.delete(key).await
        }
        async fn list(&self, prefix: &str) -> Result<Vec<String>> {
            self.inner.list(prefix).await
        }
        fn backend_type(&self) -> BackendType {
            BackendType::Memory
        }
        fn location(&self) -> String {
            "flaky".to_string()
        }
    }

    #[tokio::test]
    async fn test_retry_backend_hides_transient_failures() {
        let flaky = Arc::new(Flaky {
            inner: MemoryBackend::new(),
            failures: AtomicU32::new(2),
        });
        flaky.write("config", Bytes::from_static(b"{}")).await.unwrap();

        let backend = RetryBackend::new(flaky.clone(), fast(3));
        assert_eq!(backend.read("config").await.unwrap(), Bytes::from_static(b"{}"));
        assert_eq!(backend.location(), "flaky");

        flaky.failures.store(5, Ordering::SeqCst);
        assert!(backend.read("config").await.is_err());

        // a missing object is not transient
        let missing = RetryBackend::new(Arc::new(MemoryBackend::new()), fast(3));
        assert!(missing.read("nope").await.is_err());
    }
}
