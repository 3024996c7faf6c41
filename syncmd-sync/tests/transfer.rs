use chrono::Utc;
use std::sync::Arc;
use syncmd_chunker::{ChunkHash, Chunker, ChunkerConfig, ContentHash};
use syncmd_index::FileRecord;
use syncmd_proto::{FramedConnection, Message};
use syncmd_sync::{ApplyOutcome, ErrorClass, LocalReplica, ReplicaConfig, SyncError, TransferEngine};
use tempfile::TempDir;
use tokio::io::{duplex, DuplexStream};

const CHUNK: usize = 256;

fn content() -> Vec<u8> {
    (0..5 * CHUNK).map(|i| (i * 7 % 251) as u8).collect()
}

async fn open_replica(dir: &TempDir) -> Arc<LocalReplica> {
    let config = ReplicaConfig {
        chunk_size: CHUNK,
        ..ReplicaConfig::default()
    };
    Arc::new(LocalReplica::open(dir.path(), "receiver", config).await.unwrap())
}

/// Scripted peer: answers one ChunkRequest with chunks `start..stop`, then hangs up.
/// Returns the start index the client asked for.
fn serve_chunks(stream: DuplexStream, data: Vec<u8>, stop: u32, corrupt: Option<u32>) -> tokio::task::JoinHandle<u32> {
    tokio::spawn(async move {
        let mut conn = FramedConnection::new(stream);
        let (hash, start_index, chunk_size) = match conn.recv().await.unwrap() {
            Message::ChunkRequest {
                content_hash,
                start_index,
                chunk_size,
                ..
            } => (content_hash, start_index, chunk_size),
            other => panic!("expected ChunkRequest, got {:?}", other),
        };
        let chunker = Chunker::new(ChunkerConfig {
            chunk_size: chunk_size as usize,
        })
        .unwrap();
        let total = chunker.chunk_count(data.len() as u64);
        for chunk in chunker.chunks_from(&data, start_index).unwrap() {
            if chunk.index >= stop {
                break;
            }
            let checksum = if corrupt == Some(chunk.index) {
                ChunkHash::of(b"not this chunk")
            } else {
                chunk.hash
            };
            conn.send(&Message::ChunkResponse {
                path: "photo.png".to_string(),
                content_hash: hash,
                chunk_index: chunk.index,
                total_chunks: total,
                data: chunk.data,
                checksum,
            })
            .await
            .unwrap();
        }
        start_index
    })
}

#[tokio::test]
async fn test_interrupted_fetch_resumes_from_staged_chunks() {
    let dir = TempDir::new().unwrap();
    let replica = open_replica(&dir).await;
    let engine = TransferEngine::new(replica.clone());

    let data = content();
    let hash = ContentHash::of(&data);
    let record = FileRecord::created("photo.png", hash, data.len() as u64, "sender", Utc::now());

    // First attempt: the peer drops after 3 of 5 chunks
    let (client, server) = duplex(64 * 1024);
    let peer = serve_chunks(server, data.clone(), 3, None);
    let mut conn = FramedConnection::new(client);
    let err = engine.fetch(&mut conn, &record, None).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::TransientNetwork);
    assert_eq!(peer.await.unwrap(), 0);
    assert_eq!(replica.staging().have_chunks(&hash, CHUNK).await.unwrap(), 3);
    assert!(!dir.path().join("photo.png").exists());
    assert!(replica.store().get("photo.png").unwrap().is_none());

    // Retry picks up at chunk 3
    let (client, server) = duplex(64 * 1024);
    let peer = serve_chunks(server, data.clone(), u32::MAX, None);
    let mut conn = FramedConnection::new(client);
    let outcome = engine.fetch(&mut conn, &record, None).await.unwrap();
    assert_eq!(outcome, ApplyOutcome::Applied);
    assert_eq!(peer.await.unwrap(), 3);

    let written = tokio::fs::read(dir.path().join("photo.png")).await.unwrap();
    assert_eq!(ContentHash::of(&written), hash);
    assert_eq!(replica.store().get("photo.png").unwrap(), Some(record));
    assert_eq!(replica.staging().have_chunks(&hash, CHUNK).await.unwrap(), 0);
}

#[tokio::test]
async fn test_corrupt_chunk_discards_staging() {
    let dir = TempDir::new().unwrap();
    let replica = open_replica(&dir).await;
    let engine = TransferEngine::new(replica.clone());

    let data = content();
    let hash = ContentHash::of(&data);
    let record = FileRecord::created("photo.png", hash, data.len() as u64, "sender", Utc::now());

    let (client, server) = duplex(64 * 1024);
    let peer = serve_chunks(server, data.clone(), u32::MAX, Some(2));
    let mut conn = FramedConnection::new(client);
    let err = engine.fetch(&mut conn, &record, None).await.unwrap_err();
    assert!(matches!(err, SyncError::ChecksumMismatch { .. }));
    assert_eq!(err.class(), ErrorClass::ChecksumMismatch);
    peer.await.unwrap();

    assert_eq!(replica.staging().have_chunks(&hash, CHUNK).await.unwrap(), 0);
    assert!(!dir.path().join("photo.png").exists());
}

#[tokio::test]
async fn test_content_held_locally_needs_no_transfer() {
    let dir = TempDir::new().unwrap();
    let replica = open_replica(&dir).await;
    let engine = TransferEngine::new(replica.clone());

    // Same bytes already indexed under another name
    let data = content();
    tokio::fs::write(dir.path().join("original.png"), &data).await.unwrap();
    replica.indexer().scan().await.unwrap();

    let record = FileRecord::created("renamed.png", ContentHash::of(&data), data.len() as u64, "sender", Utc::now());
    let (client, _server) = duplex(1024);
    let mut conn = FramedConnection::new(client);
    let outcome = engine.fetch(&mut conn, &record, None).await.unwrap();
    assert_eq!(outcome, ApplyOutcome::Applied);
    assert_eq!(tokio::fs::read(dir.path().join("renamed.png")).await.unwrap(), data);
}
