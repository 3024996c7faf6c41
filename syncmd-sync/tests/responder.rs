use std::sync::Arc;
use syncmd_chunker::ContentHash;
use syncmd_index::{ChangeEvent, ChangeKind, Conflict, ConflictReason, FileRecord, IndexOutcome};
use syncmd_proto::{FramedConnection, Message, NackKind, PROTOCOL_VERSION};
use syncmd_sync::{ApplyOutcome, ErrorClass, LocalReplica, ReplicaConfig, Responder, SyncError, TransferEngine};
use tempfile::TempDir;
use tokio::io::duplex;

async fn open(dir: &TempDir, device: &str) -> Arc<LocalReplica> {
    let config = ReplicaConfig {
        chunk_size: 1024,
        ..ReplicaConfig::default()
    };
    Arc::new(LocalReplica::open(dir.path(), device, config).await.unwrap())
}

async fn write_and_index(replica: &LocalReplica, rel: &str, content: &[u8]) -> FileRecord {
    let abs = replica.abs_path(rel);
    if let Some(parent) = abs.parent() {
        tokio::fs::create_dir_all(parent).await.unwrap();
    }
    tokio::fs::write(&abs, content).await.unwrap();
    match replica.indexer().apply_event(&ChangeEvent::new(rel, ChangeKind::Modified)).await.unwrap() {
        IndexOutcome::Updated(record) => record,
        IndexOutcome::Unchanged => panic!("{} did not change", rel),
    }
}

fn hello(device: &str, version: &str) -> Message {
    Message::Hello {
        protocol_version: version.to_string(),
        device_id: device.to_string(),
        manifest_sequence: 0,
    }
}

#[tokio::test]
async fn test_incompatible_version_is_refused() {
    let dir = TempDir::new().unwrap();
    let server = open(&dir, "server").await;
    let (client, stream) = duplex(64 * 1024);
    let serving = tokio::spawn(async move { Responder::new(server).serve(stream).await });

    let mut conn = FramedConnection::new(client);
    conn.send(&hello("client", "9.0.0")).await.unwrap();
    match conn.recv_optional().await.unwrap() {
        Some(Message::Error { message }) => assert!(message.contains("incompatible")),
        other => panic!("expected an error message, got {:?}", other),
    }

    let err = serving.await.unwrap().unwrap_err();
    assert_eq!(err.class(), ErrorClass::ProtocolViolation);
}

#[tokio::test]
async fn test_push_manifest_and_stale_offer() {
    let server_dir = TempDir::new().unwrap();
    let client_dir = TempDir::new().unwrap();
    let server = open(&server_dir, "server").await;
    let client_replica = open(&client_dir, "client").await;

    let existing = write_and_index(&server, "shared.md", b"server copy\n").await;
    let note = write_and_index(&client_replica, "notes/new.md", &b"line\n".repeat(600)).await;

    let (client, stream) = duplex(64 * 1024);
    let serving = tokio::spawn({
        let server = server.clone();
        async move { Responder::new(server).serve(stream).await }
    });

    let mut conn = FramedConnection::new(client);
    match conn.request(&hello("client", PROTOCOL_VERSION)).await.unwrap() {
        Message::HelloAck { device_id, .. } => assert_eq!(device_id, "server"),
        other => panic!("expected HelloAck, got {:?}", other),
    }

    match conn.request(&Message::ManifestRequest).await.unwrap() {
        Message::ManifestResponse(manifest) => {
            assert_eq!(manifest.device_id, "server");
            assert!(manifest.verify());
            assert_eq!(manifest.get("shared.md"), Some(&existing));
        }
        other => panic!("expected manifest, got {:?}", other),
    }

    // Multi-chunk push of a new file
    let engine = TransferEngine::new(client_replica.clone());
    assert_eq!(engine.push(&mut conn, &note, None).await.unwrap(), ApplyOutcome::Applied);
    let received = tokio::fs::read(server_dir.path().join("notes/new.md")).await.unwrap();
    assert_eq!(ContentHash::of(&received), note.content_hash);
    assert_eq!(server.store().get("notes/new.md").unwrap(), Some(note.clone()));

    // Offering it again is a no-op
    assert_eq!(engine.push(&mut conn, &note, None).await.unwrap(), ApplyOutcome::AlreadyCurrent);

    // An offer planned against an outdated base is refused
    let theirs = write_and_index(&client_replica, "shared.md", b"client copy\n").await;
    let err = engine
        .push(&mut conn, &theirs, Some(ContentHash::of(b"some older version\n")))
        .await
        .unwrap_err();
    match &err {
        SyncError::Rejected { kind, .. } => assert_eq!(*kind, NackKind::Stale),
        other => panic!("expected a stale rejection, got {:?}", other),
    }
    assert_eq!(err.class(), ErrorClass::Stale);
    assert_eq!(
        tokio::fs::read(server_dir.path().join("shared.md")).await.unwrap(),
        b"server copy\n"
    );

    conn.close().await.unwrap();
    assert_eq!(serving.await.unwrap().unwrap(), "client");
}

#[tokio::test]
async fn test_repeated_delete_reports_already_current() {
    let server_dir = TempDir::new().unwrap();
    let client_dir = TempDir::new().unwrap();
    let server = open(&server_dir, "server").await;
    let client_replica = open(&client_dir, "client").await;
    let live = write_and_index(&server, "old.png", b"stale pixels").await;
    let tombstone = live.tombstone("client", chrono::Utc::now());

    let (client, stream) = duplex(64 * 1024);
    let serving = tokio::spawn({
        let server = server.clone();
        async move { Responder::new(server).serve(stream).await }
    });
    let mut conn = FramedConnection::new(client);
    conn.request(&hello("client", PROTOCOL_VERSION)).await.unwrap();

    let engine = TransferEngine::new(client_replica);
    let first = engine
        .delete_remote(&mut conn, &tombstone, Some(live.content_hash))
        .await
        .unwrap();
    assert_eq!(first, ApplyOutcome::Applied);
    assert!(!server_dir.path().join("old.png").exists());

    let second = engine
        .delete_remote(&mut conn, &tombstone, Some(live.content_hash))
        .await
        .unwrap();
    assert_eq!(second, ApplyOutcome::AlreadyCurrent);

    conn.close().await.unwrap();
    serving.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_split_and_unavailable_content() {
    let dir = TempDir::new().unwrap();
    let server = open(&dir, "server").await;
    let loser = write_and_index(&server, "cover.jpg", b"server pixels").await;
    let mut winner = FileRecord::created("cover.jpg", ContentHash::of(b"client pixels"), 13, "client", loser.modified_at);
    winner.logical_version = 5;
    let conflict = Conflict::new(winner, loser.clone(), ConflictReason::ConcurrentEdit);

    let (client, stream) = duplex(64 * 1024);
    let serving = tokio::spawn({
        let server = server.clone();
        async move { Responder::new(server).serve(stream).await }
    });
    let mut conn = FramedConnection::new(client);
    conn.request(&hello("client", PROTOCOL_VERSION)).await.unwrap();

    match conn.request(&Message::ConflictSplit(conflict.clone())).await.unwrap() {
        Message::Ack { path, content_hash } => {
            assert_eq!(path, "cover.jpg");
            assert_eq!(content_hash, loser.content_hash);
        }
        other => panic!("expected Ack, got {:?}", other),
    }
    let copy = tokio::fs::read(dir.path().join(&conflict.copy_path)).await.unwrap();
    assert_eq!(copy, b"server pixels");
    assert_eq!(server.store().list_conflicts(false).unwrap().len(), 1);

    let missing = ContentHash::of(b"never existed");
    let reply = conn
        .request(&Message::ChunkRequest {
            path: "cover.jpg".to_string(),
            content_hash: missing,
            chunk_size: 1024,
            start_index: 0,
        })
        .await
        .unwrap();
    assert!(matches!(reply, Message::Nack { kind: NackKind::Unavailable, .. }));

    // Path traversal is a protocol violation
    let err = conn
        .request(&Message::ChunkRequest {
            path: "../outside.md".to_string(),
            content_hash: missing,
            chunk_size: 1024,
            start_index: 0,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, syncmd_proto::ProtoError::Remote(_)));
    assert!(serving.await.unwrap().is_err());
}
