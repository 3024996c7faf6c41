//! Error types for reconciliation

use syncmd_chunker::ContentHash;
use syncmd_proto::{NackKind, ProtoError};
use thiserror::Error;

/// How the round driver reacts to a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Reconnect with backoff and carry on
    TransientNetwork,
    /// Discard staged data and retry from scratch, bounded
    ChecksumMismatch,
    /// Bounded retry, then skip the path for this round
    Filesystem,
    /// Routed to a conflict split by the resolver
    MergeAmbiguous,
    /// Abort the round and mark the peer unreachable
    ProtocolViolation,
    /// Target changed after planning; re-queue
    Stale,
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Index error: {0}")]
    Index(#[from] syncmd_index::IndexError),

    #[error("Storage error: {0}")]
    Storage(#[from] syncmd_cas::CasError),

    #[error("Chunker error: {0}")]
    Chunker(#[from] syncmd_chunker::ChunkerError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtoError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Checksum mismatch for {path}: {reason}")]
    ChecksumMismatch { path: String, reason: String },

    #[error("Stale operation on {path}: expected base {expected:?}, found {actual:?}")]
    Stale {
        path: String,
        expected: Option<ContentHash>,
        actual: Option<ContentHash>,
    },

    #[error("Content {hash} for {path} is not available")]
    ContentUnavailable { path: String, hash: ContentHash },

    #[error("Peer rejected {path} ({kind}): {reason}")]
    Rejected {
        path: String,
        kind: NackKind,
        reason: String,
    },

    #[error("Overlapping edits: {0}")]
    MergeAmbiguous(String),

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Timeout waiting for: {0}")]
    Timeout(String),
}

impl SyncError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::Protocol(e) if e.is_transient() => ErrorClass::TransientNetwork,
            SyncError::Protocol(_) | SyncError::ProtocolViolation(_) => ErrorClass::ProtocolViolation,
            SyncError::Connect(_) | SyncError::Timeout(_) => ErrorClass::TransientNetwork,
            SyncError::ChecksumMismatch { .. } => ErrorClass::ChecksumMismatch,
            SyncError::Storage(e) if e.is_integrity_failure() => ErrorClass::ChecksumMismatch,
            SyncError::Index(syncmd_index::IndexError::Storage(e)) if e.is_integrity_failure() => {
                ErrorClass::ChecksumMismatch
            }
            SyncError::Stale { .. } | SyncError::ContentUnavailable { .. } => ErrorClass::Stale,
            SyncError::Rejected { kind, .. } => match kind {
                NackKind::Stale | NackKind::Unavailable => ErrorClass::Stale,
                NackKind::Checksum => ErrorClass::ChecksumMismatch,
                NackKind::Filesystem => ErrorClass::Filesystem,
            },
            SyncError::MergeAmbiguous(_) => ErrorClass::MergeAmbiguous,
            SyncError::Chunker(_) => ErrorClass::ProtocolViolation,
            SyncError::Database(_)
            | SyncError::Io(_)
            | SyncError::Index(_)
            | SyncError::Storage(_)
            | SyncError::Serialization(_) => ErrorClass::Filesystem,
        }
    }

    /// Whether the peer should be marked unreachable immediately
    pub fn is_fatal_for_peer(&self) -> bool {
        matches!(self, SyncError::Timeout(_)) || self.class() == ErrorClass::ProtocolViolation
    }

    /// Nack kind reported to a peer when applying its operation fails here
    pub fn nack_kind(&self) -> NackKind {
        match self.class() {
            ErrorClass::Stale => match self {
                SyncError::ContentUnavailable { .. } => NackKind::Unavailable,
                _ => NackKind::Stale,
            },
            ErrorClass::ChecksumMismatch => NackKind::Checksum,
            _ => NackKind::Filesystem,
        }
    }

    pub fn violation(msg: impl Into<String>) -> Self {
        SyncError::ProtocolViolation(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let io = SyncError::Protocol(ProtoError::ConnectionClosed);
        assert_eq!(io.class(), ErrorClass::TransientNetwork);
        assert!(!io.is_fatal_for_peer());

        let crc = SyncError::Protocol(ProtoError::FrameCrcMismatch { expected: 1, got: 2 });
        assert_eq!(crc.class(), ErrorClass::ProtocolViolation);
        assert!(crc.is_fatal_for_peer());

        let bad_chunk = SyncError::Storage(syncmd_cas::CasError::ChunkChecksum { index: 3 });
        assert_eq!(bad_chunk.class(), ErrorClass::ChecksumMismatch);
        assert_eq!(bad_chunk.nack_kind(), NackKind::Checksum);

        let disk = SyncError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk full"));
        assert_eq!(disk.class(), ErrorClass::Filesystem);

        let stale = SyncError::Rejected {
            path: "a.md".into(),
            kind: NackKind::Stale,
            reason: "changed".into(),
        };
        assert_eq!(stale.class(), ErrorClass::Stale);

        assert!(SyncError::Timeout("round".into()).is_fatal_for_peer());
    }
}
