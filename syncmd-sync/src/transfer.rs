//! Chunked, resumable transfers over a framed connection

use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use syncmd_chunker::{ChunkHash, Chunker, ChunkerConfig, ContentHash};
use syncmd_index::{Conflict, FileRecord};
use syncmd_proto::{FramedConnection, Message};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::errors::{Result, SyncError};
use crate::progress::{TransferDirection, TransferProgress};
use crate::replica::{ApplyOutcome, LocalReplica};

/// Requester side of every content-moving operation
pub struct TransferEngine {
    replica: Arc<LocalReplica>,
}

impl TransferEngine {
    pub fn new(replica: Arc<LocalReplica>) -> Self {
        Self { replica }
    }

    fn chunker(&self) -> Result<Chunker> {
        Ok(Chunker::new(ChunkerConfig {
            chunk_size: self.replica.chunk_size(),
        })?)
    }

    /// Bring `record` from the peer and apply it locally.
    ///
    /// Verified chunks land in the staging area, so a dropped connection
    /// resumes from the first missing chunk on the next attempt.
    pub async fn fetch<S>(
        &self,
        conn: &mut FramedConnection<S>,
        record: &FileRecord,
        expected_base: Option<ContentHash>,
    ) -> Result<ApplyOutcome>
    where
        S: AsyncRead + AsyncWrite + Send,
    {
        if record.size == 0 {
            return self.replica.apply_content(record, &[], expected_base).await;
        }
        if let Some(content) = self.replica.read_content(&record.content_hash, None).await? {
            debug!("{} already held locally as {}", record.path, record.content_hash.short());
            return self.replica.apply_content(record, &content, expected_base).await;
        }

        let chunk_size = self.replica.chunk_size();
        let staging = self.replica.staging();
        let mut staged = staging.open(&record.content_hash, record.size, chunk_size).await?;

        if !staged.is_complete() {
            let start_index = staged.have_chunks();
            let total = staged.total_chunks();
            if start_index > 0 {
                info!("Resuming fetch of {} at chunk {}/{}", record.path, start_index, total);
            } else {
                debug!("Fetching {} ({} chunks)", record.path, total);
            }
            conn.send(&Message::ChunkRequest {
                path: record.path.clone(),
                content_hash: record.content_hash,
                chunk_size: chunk_size as u32,
                start_index,
            })
            .await?;

            let resumed = start_index as u64 * chunk_size as u64;
            let mut progress = TransferProgress::new(&record.path, TransferDirection::Fetch, record.size, resumed);
            while !staged.is_complete() {
                match conn.recv().await? {
                    Message::ChunkResponse {
                        content_hash,
                        chunk_index,
                        total_chunks,
                        data,
                        checksum,
                        ..
                    } => {
                        if content_hash != record.content_hash || total_chunks != total {
                            return Err(SyncError::violation(format!(
                                "chunk stream for {} does not match the request",
                                record.path
                            )));
                        }
                        if let Err(e) = staged.append(chunk_index, &data, &checksum).await {
                            if !e.is_integrity_failure() {
                                return Err(e.into());
                            }
                            warn!("{}: {}, discarding staged data", record.path, e);
                            drop(staged);
                            staging.discard(&record.content_hash, chunk_size).await?;
                            drain_chunks(conn, chunk_index, total_chunks).await?;
                            return Err(SyncError::ChecksumMismatch {
                                path: record.path.clone(),
                                reason: e.to_string(),
                            });
                        }
                        progress.advance(data.len() as u64);
                    }
                    Message::Nack { path, kind, reason } => {
                        return Err(SyncError::Rejected { path, kind, reason });
                    }
                    other => return Err(unexpected("ChunkResponse", &other)),
                }
            }
        }

        self.replica.apply_staged(record, staged, chunk_size, expected_base).await
    }

    /// Offer `record` to the peer and stream whatever chunks it lacks
    pub async fn push<S>(
        &self,
        conn: &mut FramedConnection<S>,
        record: &FileRecord,
        expected_base: Option<ContentHash>,
    ) -> Result<ApplyOutcome>
    where
        S: AsyncRead + AsyncWrite + Send,
    {
        let content = self
            .replica
            .read_content(&record.content_hash, Some(&record.path))
            .await?
            .ok_or_else(|| SyncError::ContentUnavailable {
                path: record.path.clone(),
                hash: record.content_hash,
            })?;
        let chunker = self.chunker()?;

        let reply = conn
            .request(&Message::PushOffer {
                record: record.clone(),
                chunk_size: chunker.chunk_size() as u32,
                expected_base,
            })
            .await?;

        match reply {
            Message::AlreadyHave { .. } => {
                debug!("Peer already has {} ({})", record.path, record.content_hash.short());
                Ok(ApplyOutcome::AlreadyCurrent)
            }
            Message::PushReady { have_chunks, .. } => {
                let total_chunks = chunker.chunk_count(content.len() as u64);
                if have_chunks > 0 {
                    info!("Resuming push of {} at chunk {}/{}", record.path, have_chunks, total_chunks);
                }
                let resumed = have_chunks as u64 * chunker.chunk_size() as u64;
                let mut progress =
                    TransferProgress::new(&record.path, TransferDirection::Push, content.len() as u64, resumed);
                for chunk in chunker.chunks_from(&content, have_chunks)? {
                    let len = chunk.data.len() as u64;
                    conn.send(&Message::ChunkResponse {
                        path: record.path.clone(),
                        content_hash: record.content_hash,
                        chunk_index: chunk.index,
                        total_chunks,
                        data: chunk.data,
                        checksum: chunk.hash,
                    })
                    .await?;
                    progress.advance(len);
                }
                expect_ack(conn, &record.path).await
            }
            Message::Ack { .. } => Ok(ApplyOutcome::Applied),
            Message::Nack { path, kind, reason } => Err(SyncError::Rejected { path, kind, reason }),
            other => Err(unexpected("PushReady", &other)),
        }
    }

    pub async fn delete_remote<S>(
        &self,
        conn: &mut FramedConnection<S>,
        tombstone: &FileRecord,
        expected_base: Option<ContentHash>,
    ) -> Result<ApplyOutcome>
    where
        S: AsyncRead + AsyncWrite + Send,
    {
        conn.send(&Message::DeleteApply {
            tombstone: tombstone.clone(),
            expected_base,
        })
        .await?;
        expect_ack(conn, &tombstone.path).await
    }

    pub async fn merge_remote<S>(
        &self,
        conn: &mut FramedConnection<S>,
        record: &FileRecord,
        content: &Bytes,
        expected_base: Option<ContentHash>,
    ) -> Result<ApplyOutcome>
    where
        S: AsyncRead + AsyncWrite + Send,
    {
        conn.send(&Message::MergeApply {
            record: record.clone(),
            content: content.clone(),
            expected_base,
        })
        .await?;
        expect_ack(conn, &record.path).await
    }

    pub async fn split_remote<S>(&self, conn: &mut FramedConnection<S>, conflict: &Conflict) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send,
    {
        conn.send(&Message::ConflictSplit(conflict.clone())).await?;
        expect_ack(conn, &conflict.path).await?;
        Ok(())
    }

    /// Read a version into memory without touching local state; `None` when
    /// the peer does not hold it
    pub async fn fetch_content<S>(
        &self,
        conn: &mut FramedConnection<S>,
        path: &str,
        hash: &ContentHash,
    ) -> Result<Option<Bytes>>
    where
        S: AsyncRead + AsyncWrite + Send,
    {
        if hash.is_tombstone() {
            return Ok(None);
        }
        if *hash == ContentHash::of(&[]) {
            return Ok(Some(Bytes::new()));
        }

        conn.send(&Message::ChunkRequest {
            path: path.to_string(),
            content_hash: *hash,
            chunk_size: self.replica.chunk_size() as u32,
            start_index: 0,
        })
        .await?;

        let mut buf = BytesMut::new();
        let mut next = 0u32;
        loop {
            match conn.recv().await? {
                Message::ChunkResponse {
                    content_hash,
                    chunk_index,
                    total_chunks,
                    data,
                    checksum,
                    ..
                } => {
                    if content_hash != *hash || chunk_index != next {
                        return Err(SyncError::violation(format!("chunk stream for {} out of order", path)));
                    }
                    if ChunkHash::of(&data) != checksum {
                        drain_chunks(conn, chunk_index, total_chunks).await?;
                        return Err(SyncError::ChecksumMismatch {
                            path: path.to_string(),
                            reason: format!("chunk {} failed verification", chunk_index),
                        });
                    }
                    buf.extend_from_slice(&data);
                    next += 1;
                    if next >= total_chunks {
                        break;
                    }
                }
                Message::Nack { path, kind, reason } => {
                    debug!("Peer cannot serve {} for {}: {} ({})", hash.short(), path, reason, kind);
                    return Ok(None);
                }
                other => return Err(unexpected("ChunkResponse", &other)),
            }
        }

        let content = buf.freeze();
        if ContentHash::of(&content) != *hash {
            return Err(SyncError::ChecksumMismatch {
                path: path.to_string(),
                reason: format!("assembled content does not hash to {}", hash.short()),
            });
        }
        Ok(Some(content))
    }
}

/// Consume the rest of a chunk stream after `last_index`
async fn drain_chunks<S>(conn: &mut FramedConnection<S>, last_index: u32, total_chunks: u32) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send,
{
    for _ in last_index.saturating_add(1)..total_chunks {
        match conn.recv().await? {
            Message::ChunkResponse { .. } => {}
            other => return Err(unexpected("ChunkResponse", &other)),
        }
    }
    Ok(())
}

async fn expect_ack<S>(conn: &mut FramedConnection<S>, path: &str) -> Result<ApplyOutcome>
where
    S: AsyncRead + AsyncWrite + Send,
{
    match conn.recv().await? {
        Message::Ack { path: acked, .. } if acked == path => Ok(ApplyOutcome::Applied),
        Message::AlreadyHave { path: current } if current == path => Ok(ApplyOutcome::AlreadyCurrent),
        Message::Nack { path, kind, reason } => Err(SyncError::Rejected { path, kind, reason }),
        other => Err(unexpected("Ack", &other)),
    }
}

pub(crate) fn unexpected(expected: &'static str, got: &Message) -> SyncError {
    SyncError::Protocol(syncmd_proto::ProtoError::UnexpectedMessage {
        expected,
        got: got.kind(),
    })
}
