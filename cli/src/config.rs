use anyhow::{anyhow, Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Optional defaults read from `config.toml`.
///
/// Command-line flags and environment variables always win over values
/// from this file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub repository: Option<String>,
    pub store: StoreDefaults,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreDefaults {
    pub compression: String,
    pub encryption: String,
    pub data_parts: usize,
    pub parity_parts: usize,
    pub chunk_size: u32,
    pub concurrency: Option<usize>,
}

impl Default for StoreDefaults {
    fn default() -> Self {
        Self {
            compression: "zstd".to_string(),
            encryption: "aes".to_string(),
            data_parts: 1,
            parity_parts: 0,
            chunk_size: 1024 * 1024,
            concurrency: None,
        }
    }
}

impl Config {
    /// Loads `path`, or the per-user config file when `path` is `None`.
    ///
    /// An explicitly given file must exist; a missing per-user file yields
    /// the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match default_path() {
                Some(path) if path.exists() => path,
                _ => return Ok(Self::default()),
            },
        };

        debug!(path = %path.display(), "Loading configuration");
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| anyhow!("{}", e))
    }
}

pub fn default_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "shardvault").map(|dirs| dirs.config_dir().join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = Config::parse(
            r#"
            repository = "/srv/backups"

            [store]
            compression = "lzma"
            parity_parts = 2
            "#,
        )
        .unwrap();

        assert_eq!(config.repository.as_deref(), Some("/srv/backups"));
        assert_eq!(config.store.compression, "lzma");
        assert_eq!(config.store.parity_parts, 2);
        assert_eq!(config.store.data_parts, 1);
        assert_eq!(config.store.encryption, "aes");
    }

    #[test]
    fn test_empty_file_is_default() {
        assert_eq!(Config::parse("").unwrap(), Config::default());
    }

    #[test]
    fn test_explicit_file_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load(Some(&dir.path().join("missing.toml"))).is_err());

        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[store]\nchunk_size = 65536\n").unwrap();
        assert_eq!(Config::load(Some(&path)).unwrap().store.chunk_size, 65536);

        std::fs::write(&path, "store = 5").unwrap();
        assert!(Config::load(Some(&path)).is_err());
    }
}
