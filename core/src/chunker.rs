use crate::{ChunkID, Error, Result};
use fastcdc::v2020::{FastCDC, StreamCDC};
use std::io::Read;

// FastCDC 2020 bounds
const MIN_SIZE_RANGE: (u32, u32) = (64, 1_048_576);
const AVG_SIZE_RANGE: (u32, u32) = (256, 4_194_304);
const MAX_SIZE_RANGE: (u32, u32) = (1024, 16_777_216);

#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    min_size: u32,
    avg_size: u32,
    max_size: u32,
}

impl Chunker {
    pub fn new(avg_size: u32) -> Self {
        let avg_size = avg_size.clamp(AVG_SIZE_RANGE.0, AVG_SIZE_RANGE.1);
        Self {
            min_size: (avg_size / 4).clamp(MIN_SIZE_RANGE.0, MIN_SIZE_RANGE.1),
            avg_size,
            max_size: avg_size.saturating_mul(4).clamp(MAX_SIZE_RANGE.0, MAX_SIZE_RANGE.1),
        }
    }

    pub fn avg_size(&self) -> u32 {
        self.avg_size
    }

    pub fn chunk_data(&self, data: &[u8]) -> Vec<Chunk> {
        let chunker = FastCDC::new(data, self.min_size, self.avg_size, self.max_size);
        chunker
            .map(|chunk| Chunk::new(chunk.offset as u64, data[chunk.offset..chunk.offset + chunk.length].to_vec()))
            .collect()
    }

    /// Lazily chunks `reader`. Each call starts a fresh pass.
    pub fn stream<R: Read>(&self, reader: R) -> ChunkStream<R> {
        ChunkStream {
            inner: StreamCDC::new(reader, self.min_size, self.avg_size, self.max_size),
            failed: false,
        }
    }
}

impl Default for Chunker {
    fn default() -> Self {
        Self::new(1024 * 1024)
    }
}

/// Iterator over the content-defined chunks of a reader.
///
/// Stops after the first read error.
pub struct ChunkStream<R: Read> {
    inner: StreamCDC<R>,
    failed: bool,
}

impl<R: Read> Iterator for ChunkStream<R> {
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.inner.next()? {
            Ok(chunk) => Some(Ok(Chunk::new(chunk.offset, chunk.data))),
            Err(e) => {
                self.failed = true;
                Some(Err(match e {
                    fastcdc::v2020::Error::IoError(io) => Error::Io(io),
                    other => Error::Other(format!("chunker: {other:?}")),
                }))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Chunk {
    pub offset: u64,
    pub data: Vec<u8>,
    id: ChunkID,
}

impl Chunk {
    pub fn new(offset: u64, data: Vec<u8>) -> Self {
        let id = ChunkID::from_data(&data);
        Self { offset, data, id }
    }

    pub fn id(&self) -> ChunkID {
        self.id
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{RngCore, SeedableRng};
    use std::io;

    fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
        let mut data = vec![0u8; len];
        rand::rngs::StdRng::seed_from_u64(seed).fill_bytes(&mut data);
        data
    }

    #[test]
    fn test_chunking() {
        let chunker = Chunker::new(1024);
        let data = vec![0u8; 10000];
        let chunks = chunker.chunk_data(&data);

        assert!(!chunks.is_empty());

        let total_size: usize = chunks.iter().map(|c| c.len()).sum();
        assert_eq!(total_size, data.len());
    }

    #[test]
    fn test_stream_reassembles_input() {
        let chunker = Chunker::new(1024);
        let data = random_bytes(64 * 1024, 1);

        let chunks: Vec<Chunk> = chunker.stream(&data[..]).collect::<Result<_>>().unwrap();
        assert!(chunks.len() > 1);

        let mut expected_offset = 0u64;
        let mut rebuilt = Vec::new();
        for chunk in &chunks {
            assert_eq!(chunk.offset, expected_offset);
            assert_eq!(chunk.id(), ChunkID::from_data(chunk.data()));
            expected_offset += chunk.len() as u64;
            rebuilt.extend_from_slice(chunk.data());
        }
        assert_eq!(rebuilt, data);
    }

    #[test]
    fn test_empty_input_yields_no_chunks() {
        let chunker = Chunker::default();
        assert_eq!(chunker.stream(io::empty()).count(), 0);
        assert!(chunker.chunk_data(&[]).is_empty());
    }

    #[test]
    fn test_stream_is_restartable() {
        let chunker = Chunker::new(2048);
        let data = random_bytes(32 * 1024, 2);

        let first: Vec<ChunkID> = chunker.stream(&data[..]).map(|c| c.unwrap().id()).collect();
        let second: Vec<ChunkID> = chunker.stream(&data[..]).map(|c| c.unwrap().id()).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_local_edit_keeps_most_chunks() {
        let chunker = Chunker::new(1024);
        let original = random_bytes(128 * 1024, 3);
        let mut edited = original.clone();
        edited.splice(64 * 1024..64 * 1024, b"inserted bytes".iter().copied());

        let before: std::collections::HashSet<ChunkID> =
            chunker.chunk_data(&original).iter().map(|c| c.id()).collect();
        let after: Vec<ChunkID> = chunker.chunk_data(&edited).iter().map(|c| c.id()).collect();

        let shared = after.iter().filter(|id| before.contains(id)).count();
        assert!(shared * 10 >= before.len() * 8, "only {shared} of {} chunks survived", before.len());
    }

    #[test]
    fn test_read_error_surfaces_once() {
        struct Failing;
        impl Read for Failing {
            fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
                Err(io::Error::other("disk on fire"))
            }
        }

        let mut stream = Chunker::default().stream(Failing);
        assert!(matches!(stream.next(), Some(Err(Error::Io(_)))));
        assert!(stream.next().is_none());
    }

    #[test]
    fn test_sizes_are_clamped() {
        let tiny = Chunker::new(1);
        assert_eq!(tiny.avg_size(), 256);
        let huge = Chunker::new(u32::MAX);
        assert_eq!(huge.avg_size(), 4_194_304);
    }
}
