use syncmd_chunker::ContentHash;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CasError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Object not found: {0}")]
    ObjectNotFound(ContentHash),

    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch {
        expected: ContentHash,
        actual: ContentHash,
    },

    #[error("Chunk {index} failed checksum verification")]
    ChunkChecksum { index: u32 },

    #[error("Chunk out of order: expected {expected}, got {got}")]
    ChunkOutOfOrder { expected: u32, got: u32 },

    #[error("Corrupt object: {0}")]
    CorruptObject(String),

    #[error("Storage path error: {0}")]
    StoragePath(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl CasError {
    /// Whether the error reflects bad content rather than a local storage fault
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            CasError::HashMismatch { .. }
                | CasError::ChunkChecksum { .. }
                | CasError::ChunkOutOfOrder { .. }
                | CasError::CorruptObject(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CasError>;
