//! Server side of a reconciliation round

use std::sync::Arc;
use syncmd_chunker::{Chunker, ChunkerConfig, ContentHash};
use syncmd_index::{Conflict, FileRecord};
use syncmd_proto::{
    FramedConnection, Message, NackKind, ProtoError, Validator, VersionNegotiator, PROTOCOL_VERSION,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::errors::{ErrorClass, Result, SyncError};
use crate::replica::{ApplyOutcome, LocalReplica};
use crate::transfer::unexpected;

/// Answers a peer's round against the local replica
pub struct Responder {
    replica: Arc<LocalReplica>,
}

impl Responder {
    pub fn new(replica: Arc<LocalReplica>) -> Self {
        Self { replica }
    }

    /// Serve one connection until the peer says goodbye or hangs up.
    ///
    /// Returns the peer's device id.
    pub async fn serve<S>(&self, stream: S) -> Result<String>
    where
        S: AsyncRead + AsyncWrite + Send,
    {
        let mut conn = FramedConnection::new(stream);
        let peer = self.handshake(&mut conn).await?;
        info!("Serving sync for peer: {}", peer);

        loop {
            let message = match conn.recv_optional().await? {
                Some(message) => message,
                None => {
                    debug!("Peer {} hung up", peer);
                    break;
                }
            };

            if message == Message::Goodbye {
                debug!("Peer {} finished", peer);
                break;
            }
            let result = self.handle(&mut conn, message).await;

            if let Err(e) = result {
                if e.class() == ErrorClass::ProtocolViolation {
                    warn!("Protocol violation from {}: {}", peer, e);
                    let _ = conn.send(&Message::Error { message: e.to_string() }).await;
                }
                return Err(e);
            }
        }
        Ok(peer)
    }

    async fn handle<S>(&self, conn: &mut FramedConnection<S>, message: Message) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send,
    {
        match message {
            Message::ManifestRequest => {
                let manifest = self.replica.build_manifest()?;
                conn.send(&Message::ManifestResponse(manifest)).await?;
                Ok(())
            }
            Message::ChunkRequest {
                path,
                content_hash,
                chunk_size,
                start_index,
            } => self.send_chunks(conn, &path, &content_hash, chunk_size, start_index).await,
            Message::PushOffer {
                record,
                chunk_size,
                expected_base,
            } => self.receive_push(conn, record, chunk_size, expected_base).await,
            Message::DeleteApply {
                tombstone,
                expected_base,
            } => self.apply_delete(conn, tombstone, expected_base).await,
            Message::MergeApply {
                record,
                content,
                expected_base,
            } => {
                validate_record(&record)?;
                let outcome = self.replica.apply_merge(&record, &content, expected_base).await;
                self.reply(conn, &record.path, record.content_hash, outcome)
                    .await
            }
            Message::ConflictSplit(conflict) => self.accept_split(conn, conflict).await,
            other => Err(unexpected("request", &other)),
        }
    }

    async fn handshake<S>(&self, conn: &mut FramedConnection<S>) -> Result<String>
    where
        S: AsyncRead + AsyncWrite + Send,
    {
        let (protocol_version, device_id) = match conn.recv().await? {
            Message::Hello {
                protocol_version,
                device_id,
                ..
            } => (protocol_version, device_id),
            other => {
                let err = unexpected("Hello", &other);
                let _ = conn.send(&Message::Error { message: err.to_string() }).await;
                return Err(err);
            }
        };

        if !VersionNegotiator::is_compatible(&protocol_version) {
            let message = VersionNegotiator::compatibility_error(&protocol_version);
            let _ = conn.send(&Message::Error { message: message.clone() }).await;
            return Err(SyncError::violation(message));
        }
        Validator::validate_device_id(&device_id).map_err(ProtoError::from)?;

        conn.send(&Message::HelloAck {
            protocol_version: PROTOCOL_VERSION.to_string(),
            device_id: self.replica.device_id().to_string(),
            manifest_sequence: self.replica.current_sequence()?,
        })
        .await?;
        Ok(device_id)
    }

    async fn send_chunks<S>(
        &self,
        conn: &mut FramedConnection<S>,
        path: &str,
        content_hash: &ContentHash,
        chunk_size: u32,
        start_index: u32,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send,
    {
        Validator::validate_path(path).map_err(ProtoError::from)?;
        Validator::validate_chunk_size(chunk_size as usize).map_err(ProtoError::from)?;

        let content = match self.replica.read_content(content_hash, Some(path)).await {
            Ok(Some(content)) => content,
            Ok(None) => {
                return self
                    .nack(conn, path, NackKind::Unavailable, format!("{} not held", content_hash.short()))
                    .await
            }
            Err(e) => return self.nack(conn, path, e.nack_kind(), e.to_string()).await,
        };
        if content.is_empty() {
            conn.send(&Message::Ack {
                path: path.to_string(),
                content_hash: *content_hash,
            })
            .await?;
            return Ok(());
        }

        let chunker = Chunker::new(ChunkerConfig {
            chunk_size: chunk_size as usize,
        })?;
        let total_chunks = chunker.chunk_count(content.len() as u64);
        let chunks = chunker.chunks_from(&content, start_index)?;
        debug!("Sending {} chunks {}..{} of {}", path, start_index, total_chunks, content_hash.short());
        for chunk in chunks {
            conn.send(&Message::ChunkResponse {
                path: path.to_string(),
                content_hash: *content_hash,
                chunk_index: chunk.index,
                total_chunks,
                data: chunk.data,
                checksum: chunk.hash,
            })
            .await?;
        }
        Ok(())
    }

    async fn receive_push<S>(
        &self,
        conn: &mut FramedConnection<S>,
        record: FileRecord,
        chunk_size: u32,
        expected_base: Option<ContentHash>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send,
    {
        validate_record(&record)?;
        Validator::validate_chunk_size(chunk_size as usize).map_err(ProtoError::from)?;
        if record.deleted {
            return Err(SyncError::violation(format!("push offer for tombstone {}", record.path)));
        }
        let path = record.path.clone();

        match self.replica.check_base(&path, &record.content_hash, expected_base).await {
            Ok(true) => {
                conn.send(&Message::AlreadyHave { path }).await?;
                return Ok(());
            }
            Ok(false) => {}
            Err(e) => return self.nack(conn, &path, e.nack_kind(), e.to_string()).await,
        }

        if record.size == 0 {
            let outcome = self.replica.apply_content(&record, &[], expected_base).await;
            return self.reply(conn, &path, record.content_hash, outcome).await;
        }

        let chunk_size = chunk_size as usize;
        let staging = self.replica.staging();
        let mut staged = match staging.open(&record.content_hash, record.size, chunk_size).await {
            Ok(staged) => staged,
            Err(e) => return self.nack(conn, &path, NackKind::Filesystem, e.to_string()).await,
        };
        let have_chunks = staged.have_chunks();
        let expected_chunks = staged.total_chunks() - have_chunks;
        conn.send(&Message::PushReady {
            path: path.clone(),
            have_chunks,
        })
        .await?;

        let mut failure: Option<SyncError> = None;
        for _ in 0..expected_chunks {
            match conn.recv().await? {
                Message::ChunkResponse {
                    content_hash,
                    chunk_index,
                    data,
                    checksum,
                    ..
                } if content_hash == record.content_hash => {
                    if failure.is_none() {
                        if let Err(e) = staged.append(chunk_index, &data, &checksum).await {
                            failure = Some(e.into());
                        }
                    }
                }
                other => return Err(unexpected("ChunkResponse", &other)),
            }
        }

        if let Some(e) = failure {
            drop(staged);
            if e.nack_kind() == NackKind::Checksum {
                staging.discard(&record.content_hash, chunk_size).await?;
            }
            return self.nack(conn, &path, e.nack_kind(), e.to_string()).await;
        }

        let outcome = self.replica.apply_staged(&record, staged, chunk_size, expected_base).await;
        self.reply(conn, &path, record.content_hash, outcome).await
    }

    async fn apply_delete<S>(
        &self,
        conn: &mut FramedConnection<S>,
        tombstone: FileRecord,
        expected_base: Option<ContentHash>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send,
    {
        validate_record(&tombstone)?;
        if !tombstone.deleted {
            return Err(SyncError::violation(format!("delete of {} carries a live record", tombstone.path)));
        }
        let outcome = self.replica.apply_tombstone(&tombstone, expected_base).await;
        self.reply(conn, &tombstone.path, tombstone.content_hash, outcome)
            .await
    }

    async fn accept_split<S>(&self, conn: &mut FramedConnection<S>, conflict: Conflict) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send,
    {
        validate_record(&conflict.winner)?;
        validate_record(&conflict.loser)?;
        Validator::validate_path(&conflict.copy_path).map_err(ProtoError::from)?;

        let outcome: Result<ApplyOutcome> = async {
            self.replica.persist_conflict(&conflict)?;
            self.replica.materialize_copy(&conflict).await?;
            Ok(ApplyOutcome::Applied)
        }
        .await;
        self.reply(conn, &conflict.path, conflict.loser.content_hash, outcome)
            .await
    }

    /// Ack on success, Nack for a local failure
    async fn reply<S>(
        &self,
        conn: &mut FramedConnection<S>,
        path: &str,
        content_hash: ContentHash,
        outcome: Result<ApplyOutcome>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send,
    {
        match outcome {
            Ok(ApplyOutcome::Applied) => {
                conn.send(&Message::Ack {
                    path: path.to_string(),
                    content_hash,
                })
                .await?;
                Ok(())
            }
            Ok(ApplyOutcome::AlreadyCurrent) => {
                conn.send(&Message::AlreadyHave { path: path.to_string() }).await?;
                Ok(())
            }
            Err(e) if e.class() == ErrorClass::ProtocolViolation => Err(e),
            Err(e) => self.nack(conn, path, e.nack_kind(), e.to_string()).await,
        }
    }

    async fn nack<S>(&self, conn: &mut FramedConnection<S>, path: &str, kind: NackKind, reason: String) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send,
    {
        debug!("Refusing {} ({}): {}", path, kind, reason);
        conn.send(&Message::Nack {
            path: path.to_string(),
            kind,
            reason,
        })
        .await?;
        Ok(())
    }
}

fn validate_record(record: &FileRecord) -> Result<()> {
    Validator::validate_record(record).map_err(ProtoError::from)?;
    Ok(())
}
