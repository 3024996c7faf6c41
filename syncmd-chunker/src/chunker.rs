use bytes::Bytes;
use tracing::trace;

use crate::errors::{ChunkerError, Result};
use crate::hash::ChunkHash;

/// Smallest chunk size a peer may ask for.
pub const MIN_CHUNK_SIZE: usize = 256;
/// Largest chunk size, kept well under the wire frame limit.
pub const MAX_CHUNK_SIZE: usize = 4 * 1024 * 1024;
/// Default transfer chunk size (64 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Fixed-size chunking configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkerConfig {
    /// Chunk size in bytes; every chunk but the last has exactly this length
    pub chunk_size: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl ChunkerConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size < MIN_CHUNK_SIZE || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(ChunkerError::ChunkSizeOutOfBounds(self.chunk_size));
        }
        Ok(())
    }
}

/// A fixed-size chunk of a file
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Position of the chunk within the file
    pub index: u32,
    /// Chunk data
    pub data: Bytes,
    /// Blake3 hash of the chunk
    pub hash: ChunkHash,
    /// Offset in the original content
    pub offset: u64,
}

impl Chunk {
    /// Check the chunk data against its recorded checksum
    pub fn verify(&self) -> bool {
        ChunkHash::of(&self.data) == self.hash
    }
}

/// Splits content into fixed-size, individually checksummed chunks.
///
/// Transfers address chunks by index, so both peers must agree on the chunk
/// size for a given transfer. The size travels with every chunk request and
/// push offer.
///
/// # Example
///
/// ```rust
/// use syncmd_chunker::{Chunker, ChunkerConfig};
///
/// let chunker = Chunker::new(ChunkerConfig { chunk_size: 1024 }).unwrap();
/// let chunks = chunker.chunk_bytes(&vec![7u8; 2500]);
/// assert_eq!(chunks.len(), 3);
/// assert_eq!(chunker.chunk_count(2500), 3);
/// ```
#[derive(Debug, Clone)]
pub struct Chunker {
    config: ChunkerConfig,
}

impl Default for Chunker {
    fn default() -> Self {
        Self {
            config: ChunkerConfig::default(),
        }
    }
}

impl Chunker {
    /// Create a new chunker with configuration
    pub fn new(config: ChunkerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Configured chunk size
    pub fn chunk_size(&self) -> usize {
        self.config.chunk_size
    }

    /// Number of chunks needed for `size` bytes. Empty content has no chunks.
    pub fn chunk_count(&self, size: u64) -> u32 {
        let chunk_size = self.config.chunk_size as u64;
        let count = size.div_ceil(chunk_size);
        u32::try_from(count).unwrap_or(u32::MAX)
    }

    /// Split a byte slice into chunks
    pub fn chunk_bytes(&self, data: &[u8]) -> Vec<Chunk> {
        let chunks: Vec<Chunk> = data
            .chunks(self.config.chunk_size)
            .enumerate()
            .map(|(i, slice)| self.make_chunk(i as u32, (i * self.config.chunk_size) as u64, slice))
            .collect();

        trace!("Chunked {} bytes into {} chunks", data.len(), chunks.len());
        chunks
    }

    /// Extract a single chunk by index
    pub fn chunk_at(&self, data: &[u8], index: u32) -> Result<Chunk> {
        let total = self.chunk_count(data.len() as u64);
        if index >= total {
            return Err(ChunkerError::ChunkIndexOutOfRange { index, total });
        }
        let start = index as usize * self.config.chunk_size;
        let end = (start + self.config.chunk_size).min(data.len());
        Ok(self.make_chunk(index, start as u64, &data[start..end]))
    }

    /// Chunks from `start_index` to the end, for resumed transfers
    pub fn chunks_from(&self, data: &[u8], start_index: u32) -> Result<Vec<Chunk>> {
        let total = self.chunk_count(data.len() as u64);
        if start_index > total {
            return Err(ChunkerError::ChunkIndexOutOfRange {
                index: start_index,
                total,
            });
        }
        (start_index..total).map(|i| self.chunk_at(data, i)).collect()
    }

    fn make_chunk(&self, index: u32, offset: u64, slice: &[u8]) -> Chunk {
        Chunk {
            index,
            data: Bytes::copy_from_slice(slice),
            hash: ChunkHash::of(slice),
            offset,
        }
    }
}
