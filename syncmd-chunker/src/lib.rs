pub mod chunker;
pub mod errors;
pub mod hash;

pub use chunker::{Chunk, Chunker, ChunkerConfig, DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};
pub use errors::{ChunkerError, Result};
pub use hash::{ChunkHash, ContentHash};
