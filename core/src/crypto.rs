use crate::{Error, Result};
use aes_gcm::Aes256Gcm;
use argon2::Argon2;
use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

pub struct MasterKey {
    key: Vec<u8>,
}

impl MasterKey {
    pub fn derive_from_password(password: &str, salt: &[u8], params: &crate::KdfParams) -> Result<Self> {
        let argon2 = Argon2::new(
            argon2::Algorithm::Argon2id,
            argon2::Version::V0x13,
            argon2::Params::new(
                params.memory,
                params.iterations,
                params.parallelism,
                Some(32),
            ).map_err(|e| Error::Encryption(e.to_string()))?,
        );

        let mut key = vec![0u8; 32];
        argon2
            .hash_password_into(password.as_bytes(), salt, &mut key)
            .map_err(|e| Error::Encryption(e.to_string()))?;

        Ok(Self { key })
    }

    pub fn generate() -> Self {
        let mut key = vec![0u8; 32];
        OsRng.fill_bytes(&mut key);
        Self { key }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 32 {
            return Err(Error::Encryption("Key must be 32 bytes".to_string()));
        }
        Ok(Self { key: bytes.to_vec() })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.key
    }
}

/// ChaCha20-Poly1305 cipher used for repository metadata and key wrapping.
///
/// Output layout is `[12-byte nonce][ciphertext + 16-byte tag]`.
pub struct Encryptor {
    cipher: ChaCha20Poly1305,
}

impl Encryptor {
    pub fn new(key: &[u8]) -> Result<Self> {
        let cipher = ChaCha20Poly1305::new_from_slice(key)
            .map_err(|_| Error::Encryption("Key must be 32 bytes".to_string()))?;
        Ok(Self { cipher })
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self.cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| Error::Encryption(e.to_string()))?;

        let mut result = nonce.to_vec();
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < NONCE_LEN + TAG_LEN {
            return Err(Error::Integrity("ciphertext too short".to_string()));
        }

        let (nonce_bytes, encrypted) = ciphertext.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        self.cipher
            .decrypt(nonce, encrypted)
            .map_err(|_| Error::Integrity("chacha20-poly1305 authentication failed".to_string()))
    }
}

/// AES-256-GCM cipher for chunk payloads, same wire layout as [`Encryptor`].
pub struct AesEncryptor {
    cipher: Aes256Gcm,
}

impl AesEncryptor {
    pub fn new(key: &[u8]) -> Result<Self> {
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|_| Error::Encryption("Key must be 32 bytes".to_string()))?;
        Ok(Self { cipher })
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self.cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| Error::Encryption(format!("AES-GCM encrypt: {e}")))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < NONCE_LEN + TAG_LEN {
            return Err(Error::Integrity("ciphertext too short".to_string()));
        }
        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
        let nonce = aes_gcm::Nonce::from_slice(nonce_bytes);

        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| Error::Integrity("AES-GCM authentication failed".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encryption_roundtrip() {
        let key = MasterKey::generate();
        let encryptor = Encryptor::new(key.as_bytes()).unwrap();

        let plaintext = b"Hello, shardvault!";
        let ciphertext = encryptor.encrypt(plaintext).unwrap();
        let decrypted = encryptor.decrypt(&ciphertext).unwrap();

        assert_eq!(plaintext.to_vec(), decrypted);
    }

    #[test]
    fn test_aes_rejects_wrong_key() {
        let aes = AesEncryptor::new(MasterKey::generate().as_bytes()).unwrap();
        let other = AesEncryptor::new(MasterKey::generate().as_bytes()).unwrap();

        let ciphertext = aes.encrypt(b"payload").unwrap();
        assert!(matches!(other.decrypt(&ciphertext), Err(Error::Integrity(_))));
    }

    #[test]
    fn test_password_derivation_is_deterministic() {
        let params = crate::KdfParams::new(64, 1, 1);
        let a = MasterKey::derive_from_password("secret", &params.salt, &params).unwrap();
        let b = MasterKey::derive_from_password("secret", &params.salt, &params).unwrap();
        let c = MasterKey::derive_from_password("other", &params.salt, &params).unwrap();

        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_ne!(a.as_bytes(), c.as_bytes());
        assert_eq!(a.as_bytes().len(), 32);
    }
}
