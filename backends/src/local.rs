use async_trait::async_trait;
use bytes::Bytes;
use shardvault_core::backend::{Backend, BackendType};
use shardvault_core::{Error, Result};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;
use walkdir::WalkDir;

const TEMP_MARKER: &str = ".tmp-";

/// Repository stored as plain files below a directory.
///
/// Keys map to relative paths. Writes go to a temporary sibling first and are
/// renamed into place, so readers only ever see complete objects.
pub struct LocalBackend {
    base_path: PathBuf,
}

impl LocalBackend {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn full_path(&self, key: &str) -> PathBuf {
        self.base_path.join(key)
    }
}

#[async_trait]
impl Backend for LocalBackend {
    async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.base_path).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(fs::try_exists(self.full_path(key)).await?)
    }

    async fn read(&self, key: &str) -> Result<Bytes> {
        let data = fs::read(self.full_path(key))
            .await
            .map_err(|e| Error::Backend(format!("Failed to read {}: {}", key, e)))?;
        Ok(Bytes::from(data))
    }

    async fn write(&self, key: &str, data: Bytes) -> Result<()> {
        let full_path = self.full_path(key);
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut temp_name = full_path.as_os_str().to_owned();
        temp_name.push(format!("{}{:016x}", TEMP_MARKER, rand::random::<u64>()));
        let temp_path = PathBuf::from(temp_name);

        if let Err(e) = fs::write(&temp_path, &data).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(Error::Backend(format!("Failed to write {}: {}", key, e)));
        }
        if let Err(e) = fs::rename(&temp_path, &full_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(Error::Backend(format!("Failed to write {}: {}", key, e)));
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.full_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Backend(format!("Failed to delete {}: {}", key, e))),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let base = self.base_path.clone();
        let prefix = prefix.to_string();
        tokio::task::spawn_blocking(move || list_keys(&base, &prefix))
            .await
            .map_err(|e| Error::Backend(format!("Failed to list: {}", e)))?
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Local
    }

    fn location(&self) -> String {
        self.base_path.display().to_string()
    }
}

fn list_keys(base: &Path, prefix: &str) -> Result<Vec<String>> {
    let dir = match prefix.rfind('/') {
        Some(pos) => base.join(&prefix[..pos]),
        None => base.to_path_buf(),
    };
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut keys = Vec::new();
    for entry in WalkDir::new(&dir).follow_links(false) {
        let entry = entry.map_err(|e| Error::Backend(format!("Failed to list {}: {}", prefix, e)))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(base) else {
            continue;
        };
        let key = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if key.contains(TEMP_MARKER) {
            debug!(key = %key, "Ignoring leftover temporary file");
            continue;
        }
        if key.starts_with(prefix) {
            keys.push(key);
        }
    }
    keys.sort();
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_read_delete() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path().join("repo"));
        backend.init().await.unwrap();

        backend.write("chunks/ab/abcd.0", Bytes::from_static(b"fragment")).await.unwrap();
        backend.write("chunks/ab/abcd.0", Bytes::from_static(b"replaced")).await.unwrap();
        assert!(backend.exists("chunks/ab/abcd.0").await.unwrap());
        assert_eq!(backend.read("chunks/ab/abcd.0").await.unwrap(), Bytes::from_static(b"replaced"));

        backend.delete("chunks/ab/abcd.0").await.unwrap();
        backend.delete("chunks/ab/abcd.0").await.unwrap();
        assert!(!backend.exists("chunks/ab/abcd.0").await.unwrap());
        assert!(matches!(backend.read("chunks/ab/abcd.0").await, Err(Error::Backend(_))));
    }

    #[tokio::test]
    async fn test_list_is_recursive_and_prefix_filtered() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        backend.init().await.unwrap();

        for key in ["chunks/aa/aa01.0", "chunks/aa/aa01.1", "chunks/bb/bb02.0", "index/0001", "config"] {
            backend.write(key, Bytes::from_static(b"x")).await.unwrap();
        }
        std::fs::write(dir.path().join("chunks/aa/aa03.0.tmp-0000000000000001"), b"torn").unwrap();

        assert_eq!(
            backend.list("chunks/").await.unwrap(),
            vec!["chunks/aa/aa01.0", "chunks/aa/aa01.1", "chunks/bb/bb02.0"]
        );
        assert_eq!(backend.list("chunks/aa/aa01.1").await.unwrap(), vec!["chunks/aa/aa01.1"]);
        assert_eq!(backend.list("index/").await.unwrap(), vec!["index/0001"]);
        assert!(backend.list("snapshots/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_writes_leave_no_temporaries() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        backend.init().await.unwrap();
        backend.write("snapshots/s1", Bytes::from(vec![1u8; 4096])).await.unwrap();

        let names: Vec<_> = std::fs::read_dir(dir.path().join("snapshots"))
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["s1"]);
        assert_eq!(backend.location(), dir.path().display().to_string());
    }
}
