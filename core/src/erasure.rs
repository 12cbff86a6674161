//! Systematic Reed–Solomon striping of encoded chunk buffers.
//!
//! Every fragment is self-describing: it starts with the original buffer
//! length and a BLAKE3 digest over `length ‖ shard`, so a damaged fragment is
//! dropped before reconstruction instead of poisoning the linear system.

use crate::types::ChunkShape;
use crate::{Error, Result};
use reed_solomon_erasure::galois_8::ReedSolomon;
use tracing::debug;

/// GF(2^8) limits a stripe to 256 shards.
pub const MAX_FRAGMENTS: usize = 256;

const LEN_BYTES: usize = 8;
const HEADER_LEN: usize = LEN_BYTES + 32;

pub struct ErasureCoder {
    data_parts: usize,
    parity_parts: usize,
    rs: Option<ReedSolomon>,
}

impl ErasureCoder {
    pub fn new(data_parts: usize, parity_parts: usize) -> Result<Self> {
        if data_parts == 0 {
            return Err(Error::InvalidOptions("data parts must be at least 1".to_string()));
        }
        if data_parts + parity_parts > MAX_FRAGMENTS {
            return Err(Error::InvalidOptions(format!(
                "{} data + {} parity parts exceed the limit of {} fragments",
                data_parts, parity_parts, MAX_FRAGMENTS
            )));
        }

        let rs = if parity_parts > 0 {
            Some(
                ReedSolomon::new(data_parts, parity_parts)
                    .map_err(|e| Error::Codec(format!("reed-solomon setup: {e:?}")))?,
            )
        } else {
            None
        };

        Ok(Self {
            data_parts,
            parity_parts,
            rs,
        })
    }

    pub fn for_shape(shape: &ChunkShape) -> Result<Self> {
        Self::new(shape.data_parts, shape.parity_parts)
    }

    pub fn data_parts(&self) -> usize {
        self.data_parts
    }

    pub fn parity_parts(&self) -> usize {
        self.parity_parts
    }

    pub fn fragment_count(&self) -> usize {
        self.data_parts + self.parity_parts
    }

    /// Splits `buffer` into `data_parts + parity_parts` sealed fragments.
    pub fn split(&self, buffer: &[u8]) -> Result<Vec<Vec<u8>>> {
        let shard_len = buffer.len().div_ceil(self.data_parts).max(1);

        let mut shards: Vec<Vec<u8>> = (0..self.fragment_count())
            .map(|i| {
                let mut shard = vec![0u8; shard_len];
                let start = i * shard_len;
                if i < self.data_parts && start < buffer.len() {
                    let end = (start + shard_len).min(buffer.len());
                    shard[..end - start].copy_from_slice(&buffer[start..end]);
                }
                shard
            })
            .collect();

        if let Some(rs) = &self.rs {
            rs.encode(&mut shards)
                .map_err(|e| Error::Codec(format!("reed-solomon encode: {e:?}")))?;
        }

        let original_len = buffer.len() as u64;
        Ok(shards.into_iter().map(|shard| seal(original_len, &shard)).collect())
    }

    /// Rebuilds the original buffer from fragments indexed by position.
    ///
    /// `None`, truncated or digest-mismatched fragments count as missing.
    pub fn join(&self, fragments: Vec<Option<Vec<u8>>>) -> Result<Vec<u8>> {
        let total = self.fragment_count();
        let mut shards: Vec<Option<Vec<u8>>> = vec![None; total];
        let mut layout: Option<(u64, usize)> = None;

        for (position, fragment) in fragments.into_iter().enumerate().take(total) {
            let Some(fragment) = fragment else {
                continue;
            };
            let Some((original_len, shard)) = open(&fragment) else {
                debug!(position, "Discarding fragment with bad header or digest");
                continue;
            };

            match layout {
                Some((len, shard_len)) if len != original_len || shard_len != shard.len() => {
                    debug!(position, "Discarding fragment with inconsistent layout");
                    continue;
                }
                _ => layout = Some((original_len, shard.len())),
            }
            shards[position] = Some(shard.to_vec());
        }

        let available = shards.iter().filter(|s| s.is_some()).count();
        let Some((original_len, shard_len)) = layout else {
            return Err(Error::InsufficientFragments {
                available,
                required: self.data_parts,
            });
        };
        if available < self.data_parts {
            return Err(Error::InsufficientFragments {
                available,
                required: self.data_parts,
            });
        }
        if original_len > (shard_len * self.data_parts) as u64 {
            return Err(Error::Integrity(format!(
                "fragment header claims {} bytes but stripe holds {}",
                original_len,
                shard_len * self.data_parts
            )));
        }

        if let Some(rs) = &self.rs {
            rs.reconstruct_data(&mut shards)
                .map_err(|e| Error::Codec(format!("reed-solomon reconstruct: {e:?}")))?;
        }

        let mut buffer = Vec::with_capacity(shard_len * self.data_parts);
        for shard in shards.into_iter().take(self.data_parts) {
            let shard = shard.ok_or(Error::InsufficientFragments {
                available,
                required: self.data_parts,
            })?;
            buffer.extend_from_slice(&shard);
        }
        buffer.truncate(original_len as usize);
        Ok(buffer)
    }
}

fn digest(original_len: u64, shard: &[u8]) -> blake3::Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&original_len.to_le_bytes());
    hasher.update(shard);
    hasher.finalize()
}

fn seal(original_len: u64, shard: &[u8]) -> Vec<u8> {
    let mut fragment = Vec::with_capacity(HEADER_LEN + shard.len());
    fragment.extend_from_slice(&original_len.to_le_bytes());
    fragment.extend_from_slice(digest(original_len, shard).as_bytes());
    fragment.extend_from_slice(shard);
    fragment
}

fn open(fragment: &[u8]) -> Option<(u64, &[u8])> {
    if fragment.len() <= HEADER_LEN {
        return None;
    }
    let (header, shard) = fragment.split_at(HEADER_LEN);
    let (len_bytes, hash_bytes) = header.split_at(LEN_BYTES);
    let original_len = u64::from_le_bytes(len_bytes.try_into().ok()?);
    let expected: [u8; 32] = hash_bytes.try_into().ok()?;

    // blake3::Hash equality is constant time
    if digest(original_len, shard) != blake3::Hash::from(expected) {
        return None;
    }
    Some((original_len, shard))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    fn present(fragments: &[Vec<u8>]) -> Vec<Option<Vec<u8>>> {
        fragments.iter().cloned().map(Some).collect()
    }

    #[test]
    fn test_split_produces_all_fragments() {
        let coder = ErasureCoder::new(4, 2).unwrap();
        let fragments = coder.split(&sample(1001)).unwrap();

        assert_eq!(fragments.len(), 6);
        let first_len = fragments[0].len();
        assert!(fragments.iter().all(|f| f.len() == first_len));
    }

    #[test]
    fn test_join_strips_padding() {
        let coder = ErasureCoder::new(3, 1).unwrap();
        for len in [1, 2, 3, 4, 100, 1000] {
            let data = sample(len);
            let joined = coder.join(present(&coder.split(&data).unwrap())).unwrap();
            assert_eq!(joined, data, "length {len}");
        }
    }

    #[test]
    fn test_tolerates_any_parity_sized_loss() {
        let coder = ErasureCoder::new(3, 2).unwrap();
        let data = sample(4096);
        let fragments = coder.split(&data).unwrap();

        for a in 0..5 {
            for b in (a + 1)..5 {
                let mut partial = present(&fragments);
                partial[a] = None;
                partial[b] = None;
                assert_eq!(coder.join(partial).unwrap(), data, "lost {a} and {b}");
            }
        }
    }

    #[test]
    fn test_too_many_missing_is_insufficient() {
        let coder = ErasureCoder::new(3, 2).unwrap();
        let fragments = coder.split(&sample(4096)).unwrap();

        let mut partial = present(&fragments);
        partial[0] = None;
        partial[2] = None;
        partial[4] = None;

        let err = coder.join(partial).unwrap_err();
        assert!(matches!(
            err,
            Error::InsufficientFragments { available: 2, required: 3 }
        ));
    }

    #[test]
    fn test_corrupt_fragment_counts_as_missing() {
        let coder = ErasureCoder::new(2, 1).unwrap();
        let data = sample(777);
        let mut fragments = present(&coder.split(&data).unwrap());

        if let Some(fragment) = fragments[0].as_mut() {
            let last = fragment.len() - 1;
            fragment[last] ^= 0xff;
        }
        assert_eq!(coder.join(fragments.clone()).unwrap(), data);

        fragments[1] = Some(vec![1, 2, 3]);
        assert!(matches!(
            coder.join(fragments),
            Err(Error::InsufficientFragments { .. })
        ));
    }

    #[test]
    fn test_zero_parity_is_plain_striping() {
        let coder = ErasureCoder::new(1, 0).unwrap();
        let data = sample(300);
        let fragments = coder.split(&data).unwrap();

        assert_eq!(fragments.len(), 1);
        assert_eq!(&fragments[0][HEADER_LEN..], &data[..]);
        assert_eq!(coder.join(present(&fragments)).unwrap(), data);
        assert!(coder.join(vec![None]).is_err());

        let striped = ErasureCoder::new(3, 0).unwrap();
        let mut partial = present(&striped.split(&data).unwrap());
        assert_eq!(striped.join(partial.clone()).unwrap(), data);
        partial[1] = None;
        assert!(matches!(
            striped.join(partial),
            Err(Error::InsufficientFragments { available: 2, required: 3 })
        ));
    }

    #[test]
    fn test_empty_buffer_roundtrip() {
        let coder = ErasureCoder::new(2, 1).unwrap();
        let fragments = coder.split(&[]).unwrap();
        assert_eq!(coder.join(present(&fragments)).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_rejects_invalid_shapes() {
        assert!(matches!(ErasureCoder::new(0, 1), Err(Error::InvalidOptions(_))));
        assert!(matches!(ErasureCoder::new(200, 57), Err(Error::InvalidOptions(_))));
        assert!(ErasureCoder::new(200, 56).is_ok());
    }
}
