use anyhow::{bail, Context, Result};
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use syncmd_index::ChangeEvent;
use syncmd_sync::{LocalReplica, PeerStateDatabase, ReplicaRegistry};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, Instrument};

use crate::config::{DaemonConfig, SyncRoot};
use crate::connector::TcpConnector;
use crate::discovery::StaticDiscovery;
use crate::scheduler::RoundScheduler;
use crate::server::SyncServer;

/// Peer state database under the root's state directory
pub fn peer_state_path(root: &SyncRoot) -> PathBuf {
    root.state_dir().join("peers.sqlite")
}

/// Open the replica for one configured root
pub async fn open_replica(config: &DaemonConfig, root: &SyncRoot) -> Result<Arc<LocalReplica>> {
    tokio::fs::create_dir_all(&root.path)
        .await
        .with_context(|| format!("Failed to create sync root: {}", root.path.display()))?;
    let replica = LocalReplica::open(&root.path, config.device_id.clone(), config.replica.clone())
        .await
        .with_context(|| format!("Failed to open replica at {}", root.path.display()))?;
    Ok(Arc::new(replica))
}

/// Scheduler wired to the root's TCP peers, with persisted peer state
pub async fn build_scheduler(
    config: &DaemonConfig,
    root: &SyncRoot,
    replica: Arc<LocalReplica>,
) -> Result<RoundScheduler<TcpConnector>> {
    let db = Arc::new(PeerStateDatabase::open(peer_state_path(root)).context("Failed to open peer state database")?);
    let registry = Arc::new(
        ReplicaRegistry::with_database(config.scheduler.registry_config(), db.clone())
            .context("Failed to load known peers")?,
    );
    let discovery = Arc::new(StaticDiscovery::new(&config.device_id, root.peers.clone()));
    Ok(RoundScheduler::new(
        replica,
        registry,
        discovery,
        Arc::new(TcpConnector::default()),
        config.scheduler.clone(),
    )
    .with_history(db))
}

/// Server, scheduler and change intake for one root
pub struct RootService {
    name: String,
    scheduler: Arc<RoundScheduler<TcpConnector>>,
    server: SyncServer,
    events_tx: mpsc::Sender<ChangeEvent>,
    events_rx: mpsc::Receiver<ChangeEvent>,
}

impl RootService {
    pub async fn open(config: &DaemonConfig, root: &SyncRoot) -> Result<Self> {
        let replica = open_replica(config, root).await?;
        let summary = replica.indexer().scan().await.context("Initial scan failed")?;
        info!(
            "Initial scan of {}: {} files, {} updated, {} removed",
            root.name, summary.indexed, summary.updated, summary.removed
        );

        let scheduler = Arc::new(build_scheduler(config, root, replica.clone()).await?);
        let server = SyncServer::bind(&root.listen_addr, replica)
            .await
            .with_context(|| format!("Failed to listen on {} for root {}", root.listen_addr, root.name))?;
        let (events_tx, events_rx) = mpsc::channel(config.scheduler.event_buffer.max(1));

        Ok(Self {
            name: root.name.clone(),
            scheduler,
            server,
            events_tx,
            events_rx,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sender for filesystem change events. Debouncing is the sender's job.
    pub fn change_sender(&self) -> mpsc::Sender<ChangeEvent> {
        self.events_tx.clone()
    }

    pub fn scheduler(&self) -> &Arc<RoundScheduler<TcpConnector>> {
        &self.scheduler
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.server.local_addr()?)
    }

    fn spawn(self, stop: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let RootService {
            name,
            scheduler,
            server,
            events_tx,
            events_rx,
        } = self;
        // Our own sender must not keep the intake open forever
        drop(events_tx);

        let span = info_span!("root", name = %name);
        let server_task = tokio::spawn(server.run(stop.clone()).instrument(span.clone()));
        let stop = stop.clone();
        let scheduler_task = tokio::spawn(async move { scheduler.run(events_rx, stop).await }.instrument(span));
        vec![server_task, scheduler_task]
    }
}

/// Every enabled root of one device
pub struct Daemon {
    roots: Vec<RootService>,
}

impl Daemon {
    pub async fn open(config: DaemonConfig) -> Result<Self> {
        config.validate()?;
        info!("Starting syncmd daemon for device {}", config.device_id);

        let mut roots = Vec::new();
        for root in config.enabled_roots() {
            roots.push(RootService::open(&config, root).await?);
        }
        if roots.is_empty() {
            bail!("No enabled roots to serve");
        }
        Ok(Self { roots })
    }

    pub fn roots(&self) -> &[RootService] {
        &self.roots
    }

    pub fn root(&self, name: &str) -> Option<&RootService> {
        self.roots.iter().find(|root| root.name == name)
    }

    /// Run until ctrl-c
    pub async fn run(self) -> Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await
    }

    /// Run until `shutdown` completes
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let (stop_tx, stop_rx) = watch::channel(false);
        let tasks: Vec<JoinHandle<()>> = self.roots.into_iter().flat_map(|root| root.spawn(&stop_rx)).collect();

        shutdown.await;
        info!("Shutting down syncmd daemon");
        let _ = stop_tx.send(true);

        for task in tasks {
            task.await.context("Daemon task failed")?;
        }
        info!("Daemon stopped");
        Ok(())
    }
}
