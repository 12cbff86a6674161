//! Per-chunk compression and encryption.
//!
//! Both transforms are selected per store run by a closed enum and are exact
//! inverses of each other. Compression always runs before encryption.

use crate::crypto::{AesEncryptor, Encryptor};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;

const ZSTD_LEVEL: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Flate,
    GZip,
    Lzma,
    Zstd,
}

impl Compression {
    pub const ALL: [Compression; 5] = [
        Compression::None,
        Compression::Flate,
        Compression::GZip,
        Compression::Lzma,
        Compression::Zstd,
    ];

    pub fn compress(self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Compression::None => Ok(data.to_vec()),
            Compression::Flate => {
                let mut encoder = flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
                encoder.write_all(data).map_err(|e| Error::Codec(format!("flate: {e}")))?;
                encoder.finish().map_err(|e| Error::Codec(format!("flate: {e}")))
            }
            Compression::GZip => {
                let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
                encoder.write_all(data).map_err(|e| Error::Codec(format!("gzip: {e}")))?;
                encoder.finish().map_err(|e| Error::Codec(format!("gzip: {e}")))
            }
            Compression::Lzma => {
                let mut output = Vec::new();
                lzma_rs::lzma_compress(&mut &data[..], &mut output)
                    .map_err(|e| Error::Codec(format!("lzma: {e}")))?;
                Ok(output)
            }
            Compression::Zstd => {
                zstd::encode_all(data, ZSTD_LEVEL).map_err(|e| Error::Codec(format!("zstd: {e}")))
            }
        }
    }

    pub fn decompress(self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Compression::None => Ok(data.to_vec()),
            Compression::Flate => {
                let mut decoder = flate2::read::DeflateDecoder::new(data);
                let mut result = Vec::new();
                decoder.read_to_end(&mut result).map_err(|e| Error::Codec(format!("flate: {e}")))?;
                Ok(result)
            }
            Compression::GZip => {
                let mut decoder = flate2::read::GzDecoder::new(data);
                let mut result = Vec::new();
                decoder.read_to_end(&mut result).map_err(|e| Error::Codec(format!("gzip: {e}")))?;
                Ok(result)
            }
            Compression::Lzma => {
                let mut output = Vec::new();
                lzma_rs::lzma_decompress(&mut &data[..], &mut output)
                    .map_err(|e| Error::Codec(format!("lzma: {e:?}")))?;
                Ok(output)
            }
            Compression::Zstd => zstd::decode_all(data).map_err(|e| Error::Codec(format!("zstd: {e}"))),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Flate => "flate",
            Compression::GZip => "gzip",
            Compression::Lzma => "lzma",
            Compression::Zstd => "zstd",
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Compression {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Compression::None),
            "flate" => Ok(Compression::Flate),
            "gzip" => Ok(Compression::GZip),
            "lzma" => Ok(Compression::Lzma),
            "zstd" => Ok(Compression::Zstd),
            other => Err(Error::Codec(format!("unknown compression algorithm: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Encryption {
    None,
    #[default]
    Aes,
    ChaCha20,
}

impl Encryption {
    pub const ALL: [Encryption; 3] = [Encryption::None, Encryption::Aes, Encryption::ChaCha20];

    fn as_str(self) -> &'static str {
        match self {
            Encryption::None => "none",
            Encryption::Aes => "aes",
            Encryption::ChaCha20 => "chacha20",
        }
    }
}

impl fmt::Display for Encryption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Encryption {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Encryption::None),
            "aes" => Ok(Encryption::Aes),
            "chacha20" => Ok(Encryption::ChaCha20),
            other => Err(Error::Codec(format!("unknown encryption algorithm: {other}"))),
        }
    }
}

/// Compression + encryption pipeline keyed by the repository data key.
pub struct Codec {
    aes: AesEncryptor,
    chacha: Encryptor,
}

impl Codec {
    pub fn new(key: &[u8]) -> Result<Self> {
        Ok(Self {
            aes: AesEncryptor::new(key)?,
            chacha: Encryptor::new(key)?,
        })
    }

    pub fn encode(&self, plaintext: &[u8], compression: Compression, encryption: Encryption) -> Result<Vec<u8>> {
        let compressed = compression.compress(plaintext)?;
        match encryption {
            Encryption::None => Ok(compressed),
            Encryption::Aes => self.aes.encrypt(&compressed),
            Encryption::ChaCha20 => self.chacha.encrypt(&compressed),
        }
    }

    pub fn decode(&self, ciphertext: &[u8], compression: Compression, encryption: Encryption) -> Result<Vec<u8>> {
        let compressed = match encryption {
            Encryption::None => ciphertext.to_vec(),
            Encryption::Aes => self.aes.decrypt(ciphertext)?,
            Encryption::ChaCha20 => self.chacha.decrypt(ciphertext)?,
        };
        compression.decompress(&compressed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::MasterKey;

    fn codec() -> Codec {
        Codec::new(MasterKey::generate().as_bytes()).unwrap()
    }

    #[test]
    fn test_every_combination_is_inverse() {
        let codec = codec();
        let text = b"the quick brown fox jumps over the lazy dog ".repeat(64);
        let payloads: [&[u8]; 3] = [b"", b"x", &text];

        for compression in Compression::ALL {
            for encryption in Encryption::ALL {
                for payload in payloads {
                    let encoded = codec.encode(payload, compression, encryption).unwrap();
                    let decoded = codec.decode(&encoded, compression, encryption).unwrap();
                    assert_eq!(decoded, payload, "{compression}/{encryption}");
                }
            }
        }
    }

    #[test]
    fn test_compression_shrinks_repetitive_input() {
        let data = vec![7u8; 64 * 1024];
        for compression in Compression::ALL.into_iter().skip(1) {
            let compressed = compression.compress(&data).unwrap();
            assert!(compressed.len() < data.len() / 2, "{compression} did not compress");
        }
    }

    #[test]
    fn test_tampered_ciphertext_is_integrity_failure() {
        let codec = codec();
        for encryption in [Encryption::Aes, Encryption::ChaCha20] {
            let mut encoded = codec.encode(b"sensitive bytes", Compression::Zstd, encryption).unwrap();
            let last = encoded.len() - 1;
            encoded[last] ^= 0x01;

            let err = codec.decode(&encoded, Compression::Zstd, encryption).unwrap_err();
            assert!(matches!(err, Error::Integrity(_)), "{encryption}: {err}");
        }
    }

    #[test]
    fn test_wrong_key_is_rejected() {
        let encoded = codec().encode(b"payload", Compression::None, Encryption::Aes).unwrap();
        assert!(codec().decode(&encoded, Compression::None, Encryption::Aes).is_err());
    }

    #[test]
    fn test_parse_selectors() {
        assert_eq!("gzip".parse::<Compression>().unwrap(), Compression::GZip);
        assert_eq!("ZSTD".parse::<Compression>().unwrap(), Compression::Zstd);
        assert_eq!("aes".parse::<Encryption>().unwrap(), Encryption::Aes);
        assert!(matches!("brotli".parse::<Compression>(), Err(Error::Codec(_))));
        assert!(matches!("rot13".parse::<Encryption>(), Err(Error::Codec(_))));

        for compression in Compression::ALL {
            assert_eq!(compression.to_string().parse::<Compression>().unwrap(), compression);
        }
    }

    #[test]
    fn test_garbage_fails_decompression() {
        let err = Compression::Zstd.decompress(b"definitely not zstd").unwrap_err();
        assert!(matches!(err, Error::Codec(_)));
    }
}
