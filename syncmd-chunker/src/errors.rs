use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChunkerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Chunk size out of bounds: {0}")]
    ChunkSizeOutOfBounds(usize),

    #[error("Chunk index {index} out of range (total {total})")]
    ChunkIndexOutOfRange { index: u32, total: u32 },
}

pub type Result<T> = std::result::Result<T, ChunkerError>;
