use crate::backend::Backend;
use crate::codec::Codec;
use crate::crypto::{Encryptor, MasterKey};
use crate::snapshot::Snapshot;
use crate::volume::Volume;
use crate::{ChunkID, Error, KdfParams, RepoConfig, Result, SnapshotID, CHUNKS_PREFIX};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Snapshot id alias resolving to the newest snapshot of any volume.
pub const LATEST: &str = "latest";

const CONFIG_KEY: &str = "config";
const KEYS_PREFIX: &str = "keys/";
const STATE_KEY: &str = "repository";
const SNAPSHOTS_PREFIX: &str = "snapshots/";

/// The top-level container of a backup repository.
///
/// A repository is bound to one [`Backend`] and to the data key unwrapped
/// with the user's password. It owns the list of volumes; snapshots and the
/// chunk index are stored as separate encrypted blobs next to it.
///
/// # Repository Layout
///
/// ```text
/// config              # plain repository configuration
/// keys/<uuid>         # data key wrapped with the password-derived key
/// repository          # encrypted volume list
/// snapshots/<id>      # encrypted snapshots
/// index/<generation>  # encrypted chunk index generations
/// chunks/<hh>/<id>.<n> # erasure-coded chunk fragments
/// ```
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use shardvault_core::{MemoryBackend, Repository};
///
/// #[tokio::main]
/// async fn main() -> shardvault_core::Result<()> {
///     let backend = Arc::new(MemoryBackend::new());
///     Repository::init(backend.clone(), "my-password").await?;
///     let repo = Repository::open(backend, "my-password").await?;
///     assert!(repo.volumes().is_empty());
///     Ok(())
/// }
/// ```
pub struct Repository {
    backend: Arc<dyn Backend>,
    config: RepoConfig,
    encryptor: Encryptor,
    codec: Arc<Codec>,
    volumes: Vec<Volume>,
}

impl Repository {
    /// Initializes a new repository with default key derivation parameters.
    ///
    /// # Errors
    ///
    /// Returns `Error::RepositoryExists` if the backend already holds a repository.
    pub async fn init(backend: Arc<dyn Backend>, password: &str) -> Result<Self> {
        Self::init_with_kdf(backend, password, KdfParams::default()).await
    }

    /// Initializes a new repository, deriving the wrapping key with `kdf_params`.
    ///
    /// A fresh random data key is generated and stored wrapped under
    /// `keys/`; the wrapped record doubles as the password check on open.
    pub async fn init_with_kdf(backend: Arc<dyn Backend>, password: &str, kdf_params: KdfParams) -> Result<Self> {
        backend.init().await?;
        if backend.exists(CONFIG_KEY).await? {
            return Err(Error::RepositoryExists {
                path: backend.location(),
            });
        }

        let config = RepoConfig::with_kdf(kdf_params);

        let master_key = MasterKey::derive_from_password(
            password,
            &config.kdf_params.salt,
            &config.kdf_params,
        )?;
        let data_key = MasterKey::generate();

        let key_encryptor = Encryptor::new(master_key.as_bytes())?;
        let key_file = KeyFile {
            encrypted_key: BASE64.encode(key_encryptor.encrypt(data_key.as_bytes())?),
            kdf_params: config.kdf_params.clone(),
        };

        let config_json = serde_json::to_vec_pretty(&config)?;
        backend.write(CONFIG_KEY, Bytes::from(config_json)).await?;

        let key_json = serde_json::to_vec_pretty(&key_file)?;
        let key_id = uuid::Uuid::new_v4().to_string();
        backend.write(&format!("{}{}", KEYS_PREFIX, key_id), Bytes::from(key_json)).await?;

        let repository = Self::unlocked(backend, config, &data_key, Vec::new())?;
        repository.save().await?;

        info!(location = %repository.backend.location(), id = %repository.config.id, "Initialized repository");
        Ok(repository)
    }

    /// Opens an existing repository.
    ///
    /// # Errors
    ///
    /// * `Error::RepositoryNotFound` - no repository config in the backend
    /// * `Error::InvalidPassword` - no key record can be unwrapped with `password`
    /// * `Error::InvalidFormatVersion` - unsupported repository version
    pub async fn open(backend: Arc<dyn Backend>, password: &str) -> Result<Self> {
        if !backend.exists(CONFIG_KEY).await? {
            return Err(Error::RepositoryNotFound {
                path: backend.location(),
            });
        }

        let config: RepoConfig = serde_json::from_slice(&backend.read(CONFIG_KEY).await?)?;
        if config.version != 1 {
            return Err(Error::InvalidFormatVersion {
                version: config.version,
            });
        }

        let mut data_key = None;
        for key in backend.list(KEYS_PREFIX).await? {
            let key_data = backend.read(&key).await?;
            let Ok(key_file) = serde_json::from_slice::<KeyFile>(&key_data) else {
                debug!(key = %key, "Skipping unreadable key record");
                continue;
            };
            let Ok(wrapped) = BASE64.decode(&key_file.encrypted_key) else {
                continue;
            };

            let master_key = MasterKey::derive_from_password(
                password,
                &key_file.kdf_params.salt,
                &key_file.kdf_params,
            )?;
            let key_encryptor = Encryptor::new(master_key.as_bytes())?;
            if let Ok(unwrapped) = key_encryptor.decrypt(&wrapped) {
                data_key = Some(MasterKey::from_bytes(&unwrapped)?);
                break;
            }
        }
        let data_key = data_key.ok_or(Error::InvalidPassword)?;

        let mut repository = Self::unlocked(backend, config, &data_key, Vec::new())?;
        let state: RepositoryState = serde_json::from_slice(&repository.read_blob(STATE_KEY).await?)
            .map_err(|e| Error::Persistence(format!("Failed to parse repository state: {}", e)))?;
        repository.volumes = state.volumes;

        debug!(location = %repository.backend.location(), volumes = repository.volumes.len(), "Opened repository");
        Ok(repository)
    }

    fn unlocked(backend: Arc<dyn Backend>, config: RepoConfig, data_key: &MasterKey, volumes: Vec<Volume>) -> Result<Self> {
        Ok(Self {
            backend,
            config,
            encryptor: Encryptor::new(data_key.as_bytes())?,
            codec: Arc::new(Codec::new(data_key.as_bytes())?),
            volumes,
        })
    }

    pub fn backend(&self) -> Arc<dyn Backend> {
        self.backend.clone()
    }

    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    pub fn encryptor(&self) -> &Encryptor {
        &self.encryptor
    }

    pub fn codec(&self) -> Arc<Codec> {
        self.codec.clone()
    }

    /// Persists the volume list.
    pub async fn save(&self) -> Result<()> {
        let state = RepositoryState {
            volumes: self.volumes.clone(),
        };
        let json = serde_json::to_vec(&state)?;
        self.write_blob(STATE_KEY, &json).await
    }

    pub fn volumes(&self) -> &[Volume] {
        &self.volumes
    }

    pub fn add_volume(&mut self, volume: Volume) -> Result<()> {
        if self.volumes.iter().any(|v| v.id == volume.id) {
            return Err(Error::Other(format!("Volume {} already exists", volume.id)));
        }
        self.volumes.push(volume);
        Ok(())
    }

    /// Looks a volume up by id, falling back to its name.
    pub fn find_volume(&self, id_or_name: &str) -> Result<&Volume> {
        self.volumes
            .iter()
            .find(|v| v.id == id_or_name)
            .or_else(|| self.volumes.iter().find(|v| v.name == id_or_name))
            .ok_or_else(|| Error::VolumeNotFound { id: id_or_name.to_string() })
    }

    pub fn find_volume_mut(&mut self, id_or_name: &str) -> Result<&mut Volume> {
        let position = self
            .volumes
            .iter()
            .position(|v| v.id == id_or_name)
            .or_else(|| self.volumes.iter().position(|v| v.name == id_or_name))
            .ok_or_else(|| Error::VolumeNotFound { id: id_or_name.to_string() })?;
        Ok(&mut self.volumes[position])
    }

    pub fn remove_volume(&mut self, id: &str) -> Result<Volume> {
        let position = self
            .volumes
            .iter()
            .position(|v| v.id == id)
            .ok_or_else(|| Error::VolumeNotFound { id: id.to_string() })?;
        Ok(self.volumes.remove(position))
    }

    /// Resolves a snapshot id, or [`LATEST`], across all volumes.
    ///
    /// For [`LATEST`] the snapshot with the newest date wins; on equal dates
    /// the first one in volume order, then snapshot order, is kept.
    pub async fn find_snapshot(&self, id: &str) -> Result<(&Volume, Snapshot)> {
        if id == LATEST {
            let mut latest: Option<(&Volume, Snapshot)> = None;
            for volume in &self.volumes {
                for snapshot_id in &volume.snapshots {
                    let snapshot = self.load_snapshot(snapshot_id).await?;
                    let newer = match &latest {
                        Some((_, current)) => snapshot.date > current.date,
                        None => true,
                    };
                    if newer {
                        latest = Some((volume, snapshot));
                    }
                }
            }
            return latest.ok_or_else(|| Error::SnapshotNotFound { id: id.to_string() });
        }

        for volume in &self.volumes {
            if volume.contains(id) {
                return Ok((volume, self.load_snapshot(id).await?));
            }
        }
        Err(Error::SnapshotNotFound { id: id.to_string() })
    }

    pub async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let data = snapshot.serialize(&self.encryptor)?;
        self.backend
            .write(&format!("{}{}", SNAPSHOTS_PREFIX, snapshot.id), data)
            .await
            .map_err(|e| Error::Persistence(format!("Failed to save snapshot {}: {}", snapshot.id, e)))
    }

    pub async fn load_snapshot(&self, snapshot_id: &str) -> Result<Snapshot> {
        let key = format!("{}{}", SNAPSHOTS_PREFIX, snapshot_id);
        if !self.backend.exists(&key).await? {
            return Err(Error::SnapshotNotFound { id: snapshot_id.to_string() });
        }
        let data = self.backend.read(&key).await?;
        Snapshot::deserialize(&data, &self.encryptor)
    }

    /// Removes a snapshot from every volume and deletes its blob.
    ///
    /// Chunk references are not released here; pair with
    /// `ChunkIndex::release_snapshot` and save both.
    pub async fn delete_snapshot(&mut self, snapshot_id: &str) -> Result<()> {
        let mut found = false;
        for volume in &mut self.volumes {
            if volume.contains(snapshot_id) {
                volume.remove_snapshot(snapshot_id)?;
                found = true;
            }
        }
        if !found {
            return Err(Error::SnapshotNotFound { id: snapshot_id.to_string() });
        }
        self.backend.delete(&format!("{}{}", SNAPSHOTS_PREFIX, snapshot_id)).await
    }

    pub async fn list_snapshots(&self) -> Result<Vec<SnapshotID>> {
        Ok(self
            .backend
            .list(SNAPSHOTS_PREFIX)
            .await?
            .into_iter()
            .filter_map(|key| key.strip_prefix(SNAPSHOTS_PREFIX).map(str::to_string))
            .collect())
    }

    /// Fingerprints of every chunk with at least one fragment in the backend.
    pub async fn chunk_ids(&self) -> Result<HashSet<ChunkID>> {
        Ok(self
            .backend
            .list(&format!("{}/", CHUNKS_PREFIX))
            .await?
            .iter()
            .filter_map(|key| ChunkID::from_fragment_key(key))
            .collect())
    }

    pub(crate) async fn write_blob(&self, key: &str, plaintext: &[u8]) -> Result<()> {
        let data = self.encryptor.encrypt(plaintext)?;
        self.backend
            .write(key, Bytes::from(data))
            .await
            .map_err(|e| Error::Persistence(format!("Failed to write {}: {}", key, e)))
    }

    pub(crate) async fn read_blob(&self, key: &str) -> Result<Vec<u8>> {
        let data = self
            .backend
            .read(key)
            .await
            .map_err(|e| Error::Persistence(format!("Failed to read {}: {}", key, e)))?;
        self.encryptor.decrypt(&data)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RepositoryState {
    volumes: Vec<Volume>,
}

#[derive(Debug, Serialize, Deserialize)]
struct KeyFile {
    encrypted_key: String,
    kdf_params: KdfParams,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    const PASSWORD: &str = "this_is_a_password";

    fn cheap_kdf() -> KdfParams {
        KdfParams::new(64, 1, 1)
    }

    async fn new_repository() -> (Arc<MemoryBackend>, Repository) {
        let backend = Arc::new(MemoryBackend::new());
        let repo = Repository::init_with_kdf(backend.clone(), PASSWORD, cheap_kdf()).await.unwrap();
        (backend, repo)
    }

    #[tokio::test]
    async fn test_init_then_open() {
        let (backend, mut repo) = new_repository().await;
        repo.add_volume(Volume::new("test", "desc")).unwrap();
        repo.save().await.unwrap();

        let reopened = Repository::open(backend, PASSWORD).await.unwrap();
        assert_eq!(reopened.volumes(), repo.volumes());
        assert_eq!(reopened.config().id, repo.config().id);
    }

    #[tokio::test]
    async fn test_wrong_password_is_rejected() {
        let (backend, _repo) = new_repository().await;
        assert!(matches!(
            Repository::open(backend, "nope").await,
            Err(Error::InvalidPassword)
        ));
    }

    #[tokio::test]
    async fn test_init_twice_fails() {
        let (backend, _repo) = new_repository().await;
        assert!(matches!(
            Repository::init_with_kdf(backend, PASSWORD, cheap_kdf()).await,
            Err(Error::RepositoryExists { .. })
        ));
    }

    #[tokio::test]
    async fn test_open_missing_repository() {
        let backend = Arc::new(MemoryBackend::new());
        assert!(matches!(
            Repository::open(backend, PASSWORD).await,
            Err(Error::RepositoryNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_find_snapshot() {
        let (_backend, mut repo) = new_repository().await;
        let mut volume = Volume::new("test", "");

        assert!(matches!(
            repo.find_snapshot(LATEST).await,
            Err(Error::SnapshotNotFound { .. })
        ));

        let older = Snapshot::new("older");
        older.save(&repo).await.unwrap();
        let mut newer = Snapshot::new("newer");
        newer.date = older.date + chrono::Duration::seconds(5);
        newer.save(&repo).await.unwrap();

        volume.add_snapshot(newer.id.clone());
        volume.add_snapshot(older.id.clone());
        repo.add_volume(volume).unwrap();

        let (found_volume, latest) = repo.find_snapshot(LATEST).await.unwrap();
        assert_eq!(latest.id, newer.id);
        assert_eq!(found_volume.name, "test");

        let (_, exact) = repo.find_snapshot(&older.id).await.unwrap();
        assert_eq!(exact.description, "older");
        assert_eq!(exact.date, older.date);

        let err = repo.find_snapshot("nonexistent-id").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_latest_tie_keeps_first_in_volume_order() {
        let (_backend, mut repo) = new_repository().await;

        let first = Snapshot::new("first");
        let mut second = Snapshot::new("second");
        second.date = first.date;
        first.save(&repo).await.unwrap();
        second.save(&repo).await.unwrap();

        let mut a = Volume::new("a", "");
        a.add_snapshot(first.id.clone());
        let mut b = Volume::new("b", "");
        b.add_snapshot(second.id.clone());
        repo.add_volume(a).unwrap();
        repo.add_volume(b).unwrap();

        let (volume, latest) = repo.find_snapshot(LATEST).await.unwrap();
        assert_eq!(latest.id, first.id);
        assert_eq!(volume.name, "a");
    }

    #[tokio::test]
    async fn test_empty_volume_has_no_latest() {
        let (_backend, mut repo) = new_repository().await;
        repo.add_volume(Volume::new("test", "")).unwrap();

        let err = repo.find_snapshot(LATEST).await.unwrap_err();
        assert!(matches!(err, Error::SnapshotNotFound { .. }));
        assert!(repo.find_snapshot("invalidID").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_delete_snapshot() {
        let (_backend, mut repo) = new_repository().await;
        let snapshot = Snapshot::new("gone");
        snapshot.save(&repo).await.unwrap();
        let mut volume = Volume::new("v", "");
        volume.add_snapshot(snapshot.id.clone());
        repo.add_volume(volume).unwrap();

        assert_eq!(repo.list_snapshots().await.unwrap(), vec![snapshot.id.clone()]);
        repo.delete_snapshot(&snapshot.id).await.unwrap();

        assert!(repo.list_snapshots().await.unwrap().is_empty());
        assert!(repo.find_snapshot(&snapshot.id).await.unwrap_err().is_not_found());
        assert!(repo.delete_snapshot(&snapshot.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_volume_lookup() {
        let (_backend, mut repo) = new_repository().await;
        let volume = Volume::new("documents", "my docs");
        let id = volume.id.clone();
        repo.add_volume(volume.clone()).unwrap();

        assert!(repo.add_volume(volume).is_err());
        assert_eq!(repo.find_volume("documents").unwrap().id, id);
        repo.find_volume_mut(&id).unwrap().add_snapshot("s");
        assert_eq!(repo.find_volume(&id).unwrap().snapshots, vec!["s"]);
        assert!(matches!(repo.find_volume("missing"), Err(Error::VolumeNotFound { .. })));
        assert_eq!(repo.remove_volume(&id).unwrap().name, "documents");
        assert!(repo.volumes().is_empty());
    }
}
