use crate::codec::{Compression, Encryption};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Backend prefix under which chunk fragments live.
pub const CHUNKS_PREFIX: &str = "chunks";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkID(blake3::Hash);

impl ChunkID {
    pub fn new(hash: blake3::Hash) -> Self {
        Self(hash)
    }

    pub fn from_data(data: &[u8]) -> Self {
        Self(blake3::hash(data))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    pub fn to_hex(&self) -> String {
        self.0.to_hex().to_string()
    }

    pub fn short_string(&self) -> String {
        self.to_hex().chars().take(8).collect()
    }

    /// Backend key of the `n`-th erasure fragment of this chunk.
    pub fn fragment_key(&self, n: usize) -> String {
        let hex = self.to_hex();
        format!("{}/{}/{}.{}", CHUNKS_PREFIX, &hex[..2], hex, n)
    }

    /// Recovers the chunk id from a key produced by [`ChunkID::fragment_key`].
    pub fn from_fragment_key(key: &str) -> Option<Self> {
        let name = key.rsplit('/').next()?;
        let (hex, index) = name.split_once('.')?;
        index.parse::<usize>().ok()?;
        hex.parse().ok()
    }
}

impl From<blake3::Hash> for ChunkID {
    fn from(hash: blake3::Hash) -> Self {
        Self(hash)
    }
}

impl FromStr for ChunkID {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut array = [0u8; 32];
        array.copy_from_slice(&bytes);
        Ok(Self(blake3::Hash::from(array)))
    }
}

impl Serialize for ChunkID {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ChunkID {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        ChunkID::from_str(&s).map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for ChunkID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

pub type SnapshotID = String;
pub type VolumeID = String;

/// How a chunk's bytes were transformed on their way to the backend.
///
/// Recorded in the chunk index and copied into every archive that references
/// the chunk, so restore never depends on the options of a later store run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkShape {
    pub compression: Compression,
    pub encryption: Encryption,
    pub data_parts: usize,
    pub parity_parts: usize,
}

impl ChunkShape {
    pub fn fragment_count(&self) -> usize {
        self.data_parts + self.parity_parts
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoConfig {
    pub version: u32,
    pub id: String,
    pub created: chrono::DateTime<chrono::Utc>,
    pub kdf_params: KdfParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KdfParams {
    pub algorithm: String,
    pub iterations: u32,
    pub memory: u32,
    pub parallelism: u32,
    pub salt: Vec<u8>,
}

impl KdfParams {
    /// argon2id parameters with a fresh random salt.
    pub fn new(memory: u32, iterations: u32, parallelism: u32) -> Self {
        use rand::RngCore;
        let mut salt = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut salt);

        Self {
            algorithm: "argon2id".to_string(),
            iterations,
            memory,
            parallelism,
            salt,
        }
    }
}

impl RepoConfig {
    pub fn with_kdf(kdf_params: KdfParams) -> Self {
        Self {
            version: 1,
            id: uuid::Uuid::new_v4().to_string(),
            created: chrono::Utc::now(),
            kdf_params,
        }
    }
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self::with_kdf(KdfParams::default())
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::new(65536, 1, 4)
    }
}
