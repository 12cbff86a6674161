use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    Local,
    Memory,
}

/// Key/value object store the repository is persisted into.
///
/// Keys are `/`-separated relative paths. `write` replaces any existing
/// object; implementations must never expose a half-written object under
/// its final key.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn init(&self) -> Result<()>;

    async fn exists(&self, key: &str) -> Result<bool>;

    async fn read(&self, key: &str) -> Result<Bytes>;

    async fn write(&self, key: &str, data: Bytes) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// All keys below `prefix`, recursively, as full keys.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    fn backend_type(&self) -> BackendType;

    /// Human-readable location, used in errors and logs.
    fn location(&self) -> String;
}

/// Process-local backend, used by tests and for scratch repositories.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    objects: Mutex<BTreeMap<String, Bytes>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.objects.lock().unwrap_or_else(PoisonError::into_inner).contains_key(key))
    }

    async fn read(&self, key: &str) -> Result<Bytes> {
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
            .ok_or_else(|| Error::Backend(format!("Failed to read {}: no such object", key)))
    }

    async fn write(&self, key: &str, data: Bytes) -> Result<()> {
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), data);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner).remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let objects = self.objects.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Memory
    }

    fn location(&self) -> String {
        "memory".to_string()
    }
}
