//! Periodic reconciliation rounds with known peers

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use syncmd_index::{ChangeEvent, IndexOutcome};
use syncmd_sync::{
    Connector, LocalReplica, PeerRecord, PeerStateDatabase, ReconciliationRound, RegistryConfig, ReplicaRegistry,
    Result, RetryPolicy, RoundConfig, RoundHistoryEntry, RoundReport, SyncError,
};
use tokio::sync::{mpsc, watch, RwLock, Semaphore};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::discovery::PeerDiscovery;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between scheduling ticks
    pub tick_interval_secs: u64,
    pub max_concurrent_rounds: usize,
    pub round_timeout_secs: u64,
    /// Consecutive failures before a peer is marked unreachable
    pub failure_threshold: u32,
    /// Capacity of the change intake channel
    pub event_buffer: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 30,
            max_concurrent_rounds: 4,
            round_timeout_secs: 300,
            failure_threshold: 3,
            event_buffer: 1024,
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.max(1))
    }

    pub fn round_config(&self) -> RoundConfig {
        RoundConfig {
            round_timeout: Duration::from_secs(self.round_timeout_secs),
            ..RoundConfig::default()
        }
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            failure_threshold: self.failure_threshold,
            retry_policy: RetryPolicy::peer_backoff(),
        }
    }
}

/// Snapshot of what the scheduler has been doing
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub ticks: u64,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub active_rounds: usize,
    pub rounds_succeeded: u64,
    pub rounds_failed: u64,
    pub events_indexed: u64,
    pub last_error: Option<String>,
}

/// Counts from one scheduling tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Runs one round per due peer on every tick, bounded by a semaphore
pub struct RoundScheduler<C: Connector> {
    replica: Arc<LocalReplica>,
    registry: Arc<ReplicaRegistry>,
    discovery: Arc<dyn PeerDiscovery>,
    connector: Arc<C>,
    history: Option<Arc<PeerStateDatabase>>,
    config: SchedulerConfig,
    round_config: RoundConfig,
    permits: Semaphore,
    status: RwLock<SchedulerStatus>,
}

impl<C: Connector> RoundScheduler<C> {
    pub fn new(
        replica: Arc<LocalReplica>,
        registry: Arc<ReplicaRegistry>,
        discovery: Arc<dyn PeerDiscovery>,
        connector: Arc<C>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            replica,
            registry,
            discovery,
            connector,
            history: None,
            round_config: config.round_config(),
            permits: Semaphore::new(config.max_concurrent_rounds.max(1)),
            config,
            status: RwLock::new(SchedulerStatus::default()),
        }
    }

    /// Record every finished round in `db`
    pub fn with_history(mut self, db: Arc<PeerStateDatabase>) -> Self {
        self.history = Some(db);
        self
    }

    pub fn with_round_config(mut self, round_config: RoundConfig) -> Self {
        self.round_config = round_config;
        self
    }

    pub fn registry(&self) -> &Arc<ReplicaRegistry> {
        &self.registry
    }

    pub fn replica(&self) -> &Arc<LocalReplica> {
        &self.replica
    }

    pub async fn status(&self) -> SchedulerStatus {
        self.status.read().await.clone()
    }

    /// Index one change from the intake channel
    pub async fn index_event(&self, event: &ChangeEvent) {
        match self.replica.indexer().apply_event(event).await {
            Ok(IndexOutcome::Updated(record)) => {
                debug!("Indexed {} at version {}", record.path, record.logical_version);
            }
            Ok(IndexOutcome::Unchanged) => {}
            Err(e) => {
                warn!("Failed to index {:?}: {}", event.path, e);
                self.status.write().await.last_error = Some(e.to_string());
            }
        }
        self.status.write().await.events_indexed += 1;
    }

    /// Rescan, refresh peers from discovery, then reconcile with every due peer.
    pub async fn tick(&self) -> TickSummary {
        let now = Utc::now();
        match self.replica.indexer().scan().await {
            Ok(summary) if summary.updated + summary.removed > 0 => {
                info!("Rescan: {} updated, {} removed", summary.updated, summary.removed);
            }
            Ok(_) => {}
            Err(e) => warn!("Rescan failed: {}", e),
        }
        match self.replica.purge_tombstones() {
            Ok(0) => {}
            Ok(purged) => debug!("Purged {} expired tombstones", purged),
            Err(e) => warn!("Tombstone purge failed: {}", e),
        }

        match self.discovery.discover().await {
            Ok(found) => {
                for peer in found {
                    if let Err(e) = self.registry.upsert_peer(&peer.device_id, &peer.address).await {
                        warn!("Failed to record peer {}: {}", peer.device_id, e);
                    }
                }
            }
            Err(e) => warn!("Peer discovery failed: {}", e),
        }

        let due = self.registry.candidates(now).await;
        debug!("{} peers due this tick", due.len());
        let results = join_all(due.into_iter().map(|peer| self.round_with(peer))).await;

        let summary = TickSummary {
            attempted: results.len(),
            succeeded: results.iter().filter(|r| r.is_ok()).count(),
            failed: results.iter().filter(|r| r.is_err()).count(),
        };
        let mut status = self.status.write().await;
        status.ticks += 1;
        status.last_tick_at = Some(now);
        summary
    }

    /// One round with a registered peer, holding a concurrency permit
    pub async fn round_with(&self, peer: PeerRecord) -> Result<RoundReport> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| SyncError::Io(std::io::Error::new(std::io::ErrorKind::Other, "scheduler closed")))?;
        self.status.write().await.active_rounds += 1;

        let started_at = Utc::now();
        let round = ReconciliationRound::new(self.replica.clone(), self.connector.clone(), self.round_config.clone());
        let result = round.run_with_timeout(&peer.address, Some(&peer.device_id)).await;

        self.status.write().await.active_rounds -= 1;
        self.record_outcome(&peer.device_id, started_at, &result).await;
        result
    }

    /// Run a round with whoever answers at `address` and register it as a peer
    pub async fn sync_once(&self, address: &str) -> Result<RoundReport> {
        let started_at = Utc::now();
        let round = ReconciliationRound::new(self.replica.clone(), self.connector.clone(), self.round_config.clone());
        let result = round.run_with_timeout(address, None).await;
        let device = match &result {
            Ok(report) => {
                self.registry.upsert_peer(&report.peer_device, address).await?;
                report.peer_device.clone()
            }
            Err(_) => address.to_string(),
        };
        self.record_outcome(&device, started_at, &result).await;
        result
    }

    async fn record_outcome(&self, device: &str, started_at: DateTime<Utc>, result: &Result<RoundReport>) {
        let entry = match result {
            Ok(report) => {
                if let Err(e) = self
                    .registry
                    .record_success(device, report.remote_sequence, report.finished_at)
                    .await
                {
                    warn!("Failed to update peer {}: {}", device, e);
                }
                self.status.write().await.rounds_succeeded += 1;
                RoundHistoryEntry::from_report(report)
            }
            Err(e) => {
                error!("Round with {} failed: {}", device, e);
                if let Err(db_err) = self
                    .registry
                    .record_failure(device, Utc::now(), e.is_fatal_for_peer())
                    .await
                {
                    warn!("Failed to update peer {}: {}", device, db_err);
                }
                let mut status = self.status.write().await;
                status.rounds_failed += 1;
                status.last_error = Some(e.to_string());
                RoundHistoryEntry::failed(device, started_at, e)
            }
        };
        if let Some(db) = &self.history {
            if let Err(e) = db.record_round(&entry) {
                warn!("Failed to record round history: {}", e);
            }
        }
    }

    /// Tick periodically and index intake events until `shutdown` flips to true
    pub async fn run(&self, mut events: mpsc::Receiver<ChangeEvent>, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Scheduler started: tick every {:?}, up to {} concurrent rounds",
            self.config.tick_interval(),
            self.config.max_concurrent_rounds
        );
        self.status.write().await.running = true;

        let mut ticker = interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut intake_open = true;

        loop {
            tokio::select! {
                event = events.recv(), if intake_open => match event {
                    Some(event) => self.index_event(&event).await,
                    None => {
                        debug!("Change intake closed");
                        intake_open = false;
                    }
                },
                _ = ticker.tick() => {
                    let summary = self.tick().await;
                    if summary.attempted > 0 {
                        info!(
                            "Tick finished: {} rounds, {} failed",
                            summary.attempted, summary.failed
                        );
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.status.write().await.running = false;
        info!("Scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{FailingDiscovery, PeerCandidate, StaticDiscovery};
    use async_trait::async_trait;
    use syncmd_sync::{Reachability, ReplicaConfig};
    use tempfile::TempDir;
    use tokio::io::DuplexStream;

    /// Every connect attempt fails
    struct NoRoute;

    #[async_trait]
    impl Connector for NoRoute {
        type Stream = DuplexStream;

        async fn connect(&self, address: &str) -> Result<DuplexStream> {
            Err(SyncError::Connect(format!("no route to {}", address)))
        }
    }

    fn one_shot() -> RoundConfig {
        RoundConfig {
            retry_policy: RetryPolicy {
                max_attempts: 1,
                ..RetryPolicy::aggressive()
            },
            ..RoundConfig::default()
        }
    }

    async fn scheduler(dir: &TempDir, discovery: Arc<dyn PeerDiscovery>) -> RoundScheduler<NoRoute> {
        let replica = Arc::new(LocalReplica::open(dir.path(), "local", ReplicaConfig::default()).await.unwrap());
        let config = SchedulerConfig::default();
        let registry = Arc::new(ReplicaRegistry::new(config.registry_config()));
        RoundScheduler::new(replica, registry, discovery, Arc::new(NoRoute), config).with_round_config(one_shot())
    }

    #[tokio::test]
    async fn test_failed_round_backs_off() {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(PeerStateDatabase::open_in_memory().unwrap());
        let discovery = Arc::new(StaticDiscovery::new("local", vec![PeerCandidate::new("phone", "10.0.0.7:7700")]));
        let scheduler = scheduler(&dir, discovery).await.with_history(db.clone());

        let summary = scheduler.tick().await;
        assert_eq!(summary, TickSummary { attempted: 1, succeeded: 0, failed: 1 });

        let peer = scheduler.registry().get("phone").await.unwrap();
        assert_eq!(peer.consecutive_failures, 1);
        assert_eq!(peer.reachability, Reachability::Unknown);
        assert!(peer.next_attempt_at.is_some());

        // Still backing off on the next tick
        assert_eq!(scheduler.tick().await.attempted, 0);

        let status = scheduler.status().await;
        assert_eq!(status.ticks, 2);
        assert_eq!(status.rounds_failed, 1);
        assert_eq!(status.active_rounds, 0);
        assert!(status.last_error.is_some());

        let history = db.recent_rounds(10).unwrap();
        assert_eq!(history.len(), 1);
        assert!(!history[0].success);
    }

    #[tokio::test]
    async fn test_discovery_failure_does_not_stop_tick() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&dir, Arc::new(FailingDiscovery)).await;
        tokio::fs::write(dir.path().join("note.md"), b"hello\n").await.unwrap();

        let summary = scheduler.tick().await;
        assert_eq!(summary.attempted, 0);
        // The rescan still ran
        assert!(scheduler.replica().store().get("note.md").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_run_indexes_events_until_shutdown() {
        let dir = TempDir::new().unwrap();
        let scheduler = Arc::new(scheduler(&dir, Arc::new(StaticDiscovery::new("local", Vec::new()))).await);
        let (events_tx, events_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let running = tokio::spawn({
            let scheduler = scheduler.clone();
            async move { scheduler.run(events_rx, shutdown_rx).await }
        });

        tokio::fs::write(dir.path().join("draft.md"), b"first\n").await.unwrap();
        events_tx
            .send(ChangeEvent::new("draft.md", syncmd_index::ChangeKind::Created))
            .await
            .unwrap();

        let mut indexed = false;
        for _ in 0..100 {
            if scheduler.status().await.events_indexed > 0 {
                indexed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(indexed);
        assert!(scheduler.replica().store().get("draft.md").unwrap().is_some());

        shutdown_tx.send(true).unwrap();
        running.await.unwrap();
        assert!(!scheduler.status().await.running);
    }
}
