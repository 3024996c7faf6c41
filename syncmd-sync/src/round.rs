//! One reconciliation round with one peer

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use syncmd_index::{Conflict, FileRecord, MergeStrategy};
use syncmd_proto::{FramedConnection, Message, ProtoError, Validator, VersionNegotiator, PROTOCOL_VERSION};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, info, warn};

use crate::errors::{ErrorClass, Result, SyncError};
use crate::planner::{DeltaPlanner, Divergence, Operation, Side};
use crate::replica::{ApplyOutcome, LocalReplica};
use crate::resolver::{common_ancestor, ConflictResolver, Resolution, ResolverConfig, VersionInput};
use crate::retry::RetryPolicy;
use crate::transfer::{unexpected, TransferEngine};

/// Opens byte streams to peers
#[async_trait]
pub trait Connector: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn connect(&self, address: &str) -> Result<Self::Stream>;
}

#[derive(Debug, Clone)]
pub struct RoundConfig {
    /// Reconnect policy for transient network failures
    pub retry_policy: RetryPolicy,
    pub max_checksum_retries: u32,
    pub max_fs_retries: u32,
    pub round_timeout: Duration,
}

impl Default for RoundConfig {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::default(),
            max_checksum_retries: 3,
            max_fs_retries: 2,
            round_timeout: Duration::from_secs(300),
        }
    }
}

/// What one round did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundReport {
    pub peer_device: String,
    pub remote_sequence: u64,
    pub fetched: usize,
    pub pushed: usize,
    pub deleted: usize,
    pub merged: usize,
    pub conflicts: usize,
    /// Paths given up on after repeated checksum failures
    pub failed: Vec<String>,
    /// Paths left for the next round
    pub requeued: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RoundReport {
    fn new(peer_device: String, remote_sequence: u64, started_at: DateTime<Utc>) -> Self {
        Self {
            peer_device,
            remote_sequence,
            fetched: 0,
            pushed: 0,
            deleted: 0,
            merged: 0,
            conflicts: 0,
            failed: Vec::new(),
            requeued: Vec::new(),
            started_at,
            finished_at: started_at,
        }
    }

    /// Operations that changed either replica
    pub fn applied(&self) -> usize {
        self.fetched + self.pushed + self.deleted + self.merged + self.conflicts
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.requeued.is_empty()
    }
}

/// Peer as seen in its handshake reply
#[derive(Debug, Clone)]
struct PeerHello {
    device_id: String,
    manifest_sequence: u64,
}

enum Step {
    Resolve(Divergence),
    Apply(Operation),
}

impl Step {
    fn path(&self) -> &str {
        match self {
            Step::Resolve(d) => &d.path,
            Step::Apply(op) => op.path(),
        }
    }
}

/// Drives plan, resolve and transfer against one peer
pub struct ReconciliationRound<C: Connector> {
    replica: Arc<LocalReplica>,
    connector: Arc<C>,
    engine: TransferEngine,
    resolver: ConflictResolver,
    config: RoundConfig,
}

impl<C: Connector> ReconciliationRound<C> {
    pub fn new(replica: Arc<LocalReplica>, connector: Arc<C>, config: RoundConfig) -> Self {
        let resolver = ConflictResolver::new(ResolverConfig {
            max_merge_bytes: replica.config().max_merge_bytes,
        });
        Self {
            engine: TransferEngine::new(replica.clone()),
            replica,
            connector,
            resolver,
            config,
        }
    }

    /// `run` bounded by the round timeout
    pub async fn run_with_timeout(&self, address: &str, expected_device: Option<&str>) -> Result<RoundReport> {
        match tokio::time::timeout(self.config.round_timeout, self.run(address, expected_device)).await {
            Ok(result) => result,
            Err(_) => {
                error!("Round with {} timed out after {:?}", address, self.config.round_timeout);
                Err(SyncError::Timeout(format!("round with {}", address)))
            }
        }
    }

    /// Reconcile with the peer at `address`. When `expected_device` is set the
    /// peer must identify as that device.
    pub async fn run(&self, address: &str, expected_device: Option<&str>) -> Result<RoundReport> {
        let started_at = Utc::now();
        info!("Starting sync with peer: {}", address);

        let mut failures = 0u32;
        let (mut conn, peer) = self.connect_with_retry(address, expected_device, &mut failures).await?;

        let local = self.replica.build_manifest()?;
        let remote = match conn.request(&Message::ManifestRequest).await? {
            Message::ManifestResponse(manifest) => manifest,
            other => return Err(unexpected("ManifestResponse", &other)),
        };
        Validator::validate_manifest(&remote, &peer.device_id).map_err(ProtoError::from)?;
        debug!(
            "Peer {} manifest #{} (handshake #{}) has {} records",
            peer.device_id,
            remote.sequence,
            peer.manifest_sequence,
            remote.len()
        );

        let plan = DeltaPlanner::plan(&local, &remote);
        let mut report = RoundReport::new(peer.device_id.clone(), remote.sequence, started_at);
        if plan.is_empty() {
            info!("Already in sync with {}", peer.device_id);
        } else {
            info!(
                "Plan with {}: {} operations, {} divergent paths",
                peer.device_id,
                plan.operations.len(),
                plan.divergent.len()
            );
        }

        let mut steps: Vec<Step> = plan
            .operations
            .into_iter()
            .map(Step::Apply)
            .chain(plan.divergent.into_iter().map(Step::Resolve))
            .collect();
        steps.sort_by(|a, b| a.path().cmp(b.path()));

        for step in steps {
            let mut step = step;
            let mut checksum_failures = 0u32;
            let mut fs_failures = 0u32;
            loop {
                let result = match &step {
                    Step::Resolve(divergence) => self.resolve(&mut conn, divergence).await.map(Some),
                    Step::Apply(op) => self.execute(&mut conn, op, &mut report).await.map(|_| None),
                };
                let err = match result {
                    Ok(Some(op)) => {
                        step = Step::Apply(op);
                        continue;
                    }
                    Ok(None) => break,
                    Err(e) => e,
                };

                let path = step.path().to_string();
                match err.class() {
                    ErrorClass::TransientNetwork => {
                        failures += 1;
                        if !self.config.retry_policy.should_retry(failures) {
                            error!("Giving up on {} after {} connection failures: {}", address, failures, err);
                            return Err(err);
                        }
                        warn!("Connection to {} lost during {}: {}", address, path, err);
                        tokio::time::sleep(self.config.retry_policy.calculate_delay(failures)).await;
                        let (fresh, _) = self
                            .connect_with_retry(address, Some(&peer.device_id), &mut failures)
                            .await?;
                        conn = fresh;
                    }
                    ErrorClass::ChecksumMismatch => {
                        checksum_failures += 1;
                        if checksum_failures > self.config.max_checksum_retries {
                            error!("{} keeps failing verification: {}", path, err);
                            report.failed.push(path);
                            break;
                        }
                        warn!("Retrying {} from scratch: {}", path, err);
                    }
                    ErrorClass::Filesystem => {
                        fs_failures += 1;
                        if fs_failures > self.config.max_fs_retries {
                            warn!("Skipping {} this round: {}", path, err);
                            report.requeued.push(path);
                            break;
                        }
                        debug!("Retrying {}: {}", path, err);
                    }
                    ErrorClass::Stale | ErrorClass::MergeAmbiguous => {
                        debug!("Re-queueing {}: {}", path, err);
                        report.requeued.push(path);
                        break;
                    }
                    ErrorClass::ProtocolViolation => {
                        error!("Aborting round with {}: {}", peer.device_id, err);
                        return Err(err);
                    }
                }
            }
        }

        if let Err(e) = conn.close().await {
            debug!("Closing connection to {}: {}", address, e);
        }

        report.finished_at = Utc::now();
        info!(
            "Sync with {} finished: {} applied, {} conflicts, {} failed, {} re-queued",
            report.peer_device,
            report.applied(),
            report.conflicts,
            report.failed.len(),
            report.requeued.len()
        );
        Ok(report)
    }

    async fn connect_with_retry(
        &self,
        address: &str,
        expected_device: Option<&str>,
        failures: &mut u32,
    ) -> Result<(FramedConnection<C::Stream>, PeerHello)> {
        loop {
            match self.handshake(address, expected_device).await {
                Ok(pair) => return Ok(pair),
                Err(e) if e.class() == ErrorClass::TransientNetwork => {
                    *failures += 1;
                    if !self.config.retry_policy.should_retry(*failures) {
                        return Err(e);
                    }
                    let delay = self.config.retry_policy.calculate_delay(*failures);
                    warn!("Connecting to {} failed ({}), retrying in {:?}", address, e, delay);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn handshake(
        &self,
        address: &str,
        expected_device: Option<&str>,
    ) -> Result<(FramedConnection<C::Stream>, PeerHello)> {
        let stream = self.connector.connect(address).await?;
        let mut conn = FramedConnection::new(stream);
        let reply = conn
            .request(&Message::Hello {
                protocol_version: PROTOCOL_VERSION.to_string(),
                device_id: self.replica.device_id().to_string(),
                manifest_sequence: self.replica.current_sequence()?,
            })
            .await?;

        let (protocol_version, device_id, manifest_sequence) = match reply {
            Message::HelloAck {
                protocol_version,
                device_id,
                manifest_sequence,
            } => (protocol_version, device_id, manifest_sequence),
            other => return Err(unexpected("HelloAck", &other)),
        };
        if !VersionNegotiator::is_compatible(&protocol_version) {
            return Err(SyncError::violation(VersionNegotiator::compatibility_error(&protocol_version)));
        }
        Validator::validate_device_id(&device_id).map_err(ProtoError::from)?;
        if device_id == self.replica.device_id() {
            return Err(SyncError::violation(format!("{} answered with our own device id", address)));
        }
        if let Some(expected) = expected_device {
            if expected != device_id {
                return Err(SyncError::violation(format!(
                    "{} identified as {}, expected {}",
                    address, device_id, expected
                )));
            }
        }

        debug!("Handshake with {} ({}) complete", device_id, address);
        Ok((
            conn,
            PeerHello {
                device_id,
                manifest_sequence,
            },
        ))
    }

    /// Turn a divergence into the operation that settles it
    async fn resolve(&self, conn: &mut FramedConnection<C::Stream>, divergence: &Divergence) -> Result<Operation> {
        let Divergence { path, local, remote } = divergence;
        let mergeable = MergeStrategy::for_path(path) == MergeStrategy::StructuralTextMerge
            && !local.deleted
            && !remote.deleted;

        let (local_content, remote_content, ancestor) = if mergeable {
            let max = self.replica.config().max_merge_bytes as u64;
            let local_content = self.replica.read_content(&local.content_hash, Some(path)).await?;
            let remote_content = if remote.size <= max {
                self.engine.fetch_content(conn, path, &remote.content_hash).await?
            } else {
                None
            };
            let ancestor = match common_ancestor(local, remote) {
                Some(hash) => match self.replica.read_content(&hash, None).await? {
                    Some(content) => Some(content),
                    None => self.engine.fetch_content(conn, path, &hash).await?,
                },
                None => None,
            };
            (local_content, remote_content, ancestor)
        } else {
            (None, None, None)
        };

        let resolution = self.resolver.resolve(
            VersionInput::new(local, local_content.as_deref()),
            VersionInput::new(remote, remote_content.as_deref()),
            ancestor.as_deref(),
        );
        Ok(match resolution {
            Resolution::Merged { record, content } => {
                debug!("{}: merged into {}", path, record.content_hash.short());
                Operation::MergeApply {
                    path: path.clone(),
                    record,
                    content,
                    local: local.clone(),
                    remote: remote.clone(),
                }
            }
            Resolution::Split(conflict) => Operation::ConflictSplit {
                path: path.clone(),
                conflict,
                local: local.clone(),
                remote: remote.clone(),
            },
            Resolution::Keep(winner) if winner == *local => {
                Operation::propagate(&winner, Side::Remote, Some(remote.content_hash))
            }
            Resolution::Keep(winner) => Operation::propagate(&winner, Side::Local, Some(local.content_hash)),
        })
    }

    async fn execute(
        &self,
        conn: &mut FramedConnection<C::Stream>,
        op: &Operation,
        report: &mut RoundReport,
    ) -> Result<()> {
        debug!("Executing {} {}", op.kind(), op.path());
        match op {
            Operation::Fetch {
                record, expected_base, ..
            } => {
                if self.engine.fetch(conn, record, *expected_base).await? == ApplyOutcome::Applied {
                    report.fetched += 1;
                }
            }
            Operation::Push {
                record, expected_base, ..
            } => {
                if self.engine.push(conn, record, *expected_base).await? == ApplyOutcome::Applied {
                    report.pushed += 1;
                }
            }
            Operation::Delete {
                tombstone,
                target: Side::Local,
                expected_base,
                ..
            } => {
                if self.replica.apply_tombstone(tombstone, *expected_base).await? == ApplyOutcome::Applied {
                    report.deleted += 1;
                }
            }
            Operation::Delete {
                tombstone,
                target: Side::Remote,
                expected_base,
                ..
            } => {
                if self.engine.delete_remote(conn, tombstone, *expected_base).await? == ApplyOutcome::Applied {
                    report.deleted += 1;
                }
            }
            Operation::MergeApply {
                record,
                content,
                local,
                remote,
                ..
            } => {
                if local.content_hash != record.content_hash {
                    self.replica.apply_merge(record, content, Some(local.content_hash)).await?;
                }
                if remote.content_hash != record.content_hash {
                    self.engine.merge_remote(conn, record, content, Some(remote.content_hash)).await?;
                }
                report.merged += 1;
            }
            Operation::ConflictSplit {
                conflict, local, remote, ..
            } => {
                self.execute_split(conn, conflict, local, remote).await?;
                report.conflicts += 1;
            }
        }
        Ok(())
    }

    /// Preserve the loser as a copy on both sides, then apply the winner
    async fn execute_split(
        &self,
        conn: &mut FramedConnection<C::Stream>,
        conflict: &Conflict,
        local: &FileRecord,
        remote: &FileRecord,
    ) -> Result<()> {
        self.engine.split_remote(conn, conflict).await?;
        self.replica.persist_conflict(conflict)?;

        if !conflict.loser.deleted {
            let copy = conflict.copy_record();
            if self.replica.materialize_copy(conflict).await? {
                self.engine.push(conn, &copy, None).await?;
            } else {
                self.engine.fetch(conn, &copy, None).await?;
            }
        }

        let winner = &conflict.winner;
        match (winner == local, winner.deleted) {
            (true, true) => {
                self.engine.delete_remote(conn, winner, Some(remote.content_hash)).await?;
            }
            (true, false) => {
                self.engine.push(conn, winner, Some(remote.content_hash)).await?;
            }
            (false, true) => {
                self.replica.apply_tombstone(winner, Some(local.content_hash)).await?;
            }
            (false, false) => {
                self.engine.fetch(conn, winner, Some(local.content_hash)).await?;
            }
        }
        info!("{}: kept {} version, loser saved as {}", conflict.path, winner.device_id, conflict.copy_path);
        Ok(())
    }
}
