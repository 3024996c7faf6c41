use thiserror::Error;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] syncmd_cas::CasError),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Path outside replica root: {0}")]
    OutsideRoot(std::path::PathBuf),

    #[error("Schema version mismatch: expected {expected}, got {actual}")]
    SchemaVersionMismatch { expected: u32, actual: u32 },

    #[error("Record store lock poisoned")]
    LockPoisoned,
}

pub type Result<T> = std::result::Result<T, IndexError>;
