//! Peer-to-peer message set

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use syncmd_chunker::{ChunkHash, ContentHash};
use syncmd_index::{Conflict, FileRecord, Manifest};

use crate::errors::Result;

/// Why a peer refused an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NackKind {
    /// The target path changed since the operation was planned
    Stale,
    /// Received content failed verification
    Checksum,
    /// The peer could not write to its filesystem
    Filesystem,
    /// The peer no longer has the requested content
    Unavailable,
}

impl fmt::Display for NackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NackKind::Stale => "stale",
            NackKind::Checksum => "checksum",
            NackKind::Filesystem => "filesystem",
            NackKind::Unavailable => "unavailable",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Hello {
        protocol_version: String,
        device_id: String,
        manifest_sequence: u64,
    },
    HelloAck {
        protocol_version: String,
        device_id: String,
        manifest_sequence: u64,
    },

    ManifestRequest,
    ManifestResponse(Manifest),

    /// Stream `content_hash` starting at chunk `start_index`
    ChunkRequest {
        path: String,
        content_hash: ContentHash,
        chunk_size: u32,
        start_index: u32,
    },
    ChunkResponse {
        path: String,
        content_hash: ContentHash,
        chunk_index: u32,
        total_chunks: u32,
        data: Bytes,
        checksum: ChunkHash,
    },

    /// Offer a version of `record.path`; chunks follow once the peer is ready
    PushOffer {
        record: FileRecord,
        chunk_size: u32,
        expected_base: Option<ContentHash>,
    },
    PushReady {
        path: String,
        have_chunks: u32,
    },
    /// The target already holds this version. Also answers a delete or
    /// merge that changed nothing.
    AlreadyHave {
        path: String,
    },

    DeleteApply {
        tombstone: FileRecord,
        expected_base: Option<ContentHash>,
    },
    MergeApply {
        record: FileRecord,
        content: Bytes,
        expected_base: Option<ContentHash>,
    },
    ConflictSplit(Conflict),

    Ack {
        path: String,
        content_hash: ContentHash,
    },
    Nack {
        path: String,
        kind: NackKind,
        reason: String,
    },

    Error {
        message: String,
    },
    Goodbye,
}

impl Message {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(postcard::to_stdvec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(postcard::from_bytes(bytes)?)
    }

    /// Variant name for logs and protocol errors
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Hello { .. } => "Hello",
            Message::HelloAck { .. } => "HelloAck",
            Message::ManifestRequest => "ManifestRequest",
            Message::ManifestResponse(_) => "ManifestResponse",
            Message::ChunkRequest { .. } => "ChunkRequest",
            Message::ChunkResponse { .. } => "ChunkResponse",
            Message::PushOffer { .. } => "PushOffer",
            Message::PushReady { .. } => "PushReady",
            Message::AlreadyHave { .. } => "AlreadyHave",
            Message::DeleteApply { .. } => "DeleteApply",
            Message::MergeApply { .. } => "MergeApply",
            Message::ConflictSplit(_) => "ConflictSplit",
            Message::Ack { .. } => "Ack",
            Message::Nack { .. } => "Nack",
            Message::Error { .. } => "Error",
            Message::Goodbye => "Goodbye",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use syncmd_index::ConflictReason;

    #[test]
    fn test_chunk_response_carries_raw_bytes() {
        let data = Bytes::from_static(b"chunk payload");
        let msg = Message::ChunkResponse {
            path: "notes/a.md".into(),
            content_hash: ContentHash::of(b"whole file"),
            chunk_index: 2,
            total_chunks: 5,
            checksum: ContentHash::of(&data),
            data,
        };
        let encoded = msg.encode().unwrap();
        assert_eq!(Message::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn test_conflict_and_manifest_survive_encoding() {
        let now = Utc::now();
        let winner = FileRecord::created("p.png", ContentHash::of(b"w"), 1, "b", now);
        let mut loser = FileRecord::created("p.png", ContentHash::of(b"l"), 1, "a", now);
        loser = loser.tombstone("a", now);

        let split = Message::ConflictSplit(Conflict::new(winner.clone(), loser, ConflictReason::EditVsDelete));
        assert_eq!(Message::decode(&split.encode().unwrap()).unwrap(), split);

        let mut manifest = Manifest::new("b", 7);
        manifest.add_record(winner);
        manifest.finalize();
        let response = Message::ManifestResponse(manifest);
        let decoded = Message::decode(&response.encode().unwrap()).unwrap();
        match decoded {
            Message::ManifestResponse(m) => assert!(m.verify()),
            other => panic!("unexpected {}", other.kind()),
        }
    }

    #[test]
    fn test_garbage_fails_to_decode() {
        assert!(Message::decode(&[0xff, 0xff, 0xff]).is_err());
    }
}
