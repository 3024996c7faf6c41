//! Two in-process replicas connected over in-memory duplex streams

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, Once};
use syncmd::chunker::ContentHash;
use syncmd::index::{ChangeEvent, ChangeKind, FileRecord, IndexOutcome};
use syncmd::sync::{
    Connector, LocalReplica, ReconciliationRound, ReplicaConfig, Responder, Result, RoundConfig, RoundReport,
    SyncError,
};
use tempfile::TempDir;
use tokio::io::{duplex, DuplexStream};

static LOGGING: Once = Once::new();

pub fn init_logging() {
    LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Routes `connect(address)` to a responder serving the registered replica
#[derive(Default)]
pub struct MemoryConnector {
    peers: Mutex<HashMap<String, Arc<LocalReplica>>>,
}

impl MemoryConnector {
    pub fn register(&self, address: &str, replica: Arc<LocalReplica>) {
        self.peers.lock().unwrap().insert(address.to_string(), replica);
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    type Stream = DuplexStream;

    async fn connect(&self, address: &str) -> Result<DuplexStream> {
        let replica = self
            .peers
            .lock()
            .unwrap()
            .get(address)
            .cloned()
            .ok_or_else(|| SyncError::Connect(format!("nothing listening at {}", address)))?;
        let (client, server) = duplex(256 * 1024);
        tokio::spawn(async move {
            let _ = Responder::new(replica).serve(server).await;
        });
        Ok(client)
    }
}

pub const BETA_ADDR: &str = "mem://beta";

/// `alpha` drives rounds against `beta`
pub struct Pair {
    _dirs: (TempDir, TempDir),
    pub alpha: Arc<LocalReplica>,
    pub beta: Arc<LocalReplica>,
    connector: Arc<MemoryConnector>,
}

impl Pair {
    pub async fn new() -> Self {
        init_logging();
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();
        let config = ReplicaConfig {
            chunk_size: 1024,
            ..ReplicaConfig::default()
        };
        let alpha = Arc::new(LocalReplica::open(dir_a.path(), "alpha", config.clone()).await.unwrap());
        let beta = Arc::new(LocalReplica::open(dir_b.path(), "beta", config).await.unwrap());
        let connector = Arc::new(MemoryConnector::default());
        connector.register(BETA_ADDR, beta.clone());
        Self {
            _dirs: (dir_a, dir_b),
            alpha,
            beta,
            connector,
        }
    }

    pub async fn round(&self) -> RoundReport {
        ReconciliationRound::new(self.alpha.clone(), self.connector.clone(), RoundConfig::default())
            .run_with_timeout(BETA_ADDR, Some("beta"))
            .await
            .unwrap()
    }

    /// Every path has the same content (or tombstone) on both replicas
    pub async fn assert_converged(&self) {
        let a = state(&self.alpha);
        let b = state(&self.beta);
        assert_eq!(a, b, "replicas disagree");
        for (path, (hash, deleted)) in a {
            let on_a = self.alpha.abs_path(&path);
            let on_b = self.beta.abs_path(&path);
            if deleted {
                assert!(!on_a.exists() && !on_b.exists(), "{} should be gone", path);
            } else {
                assert_eq!(ContentHash::of(&tokio::fs::read(&on_a).await.unwrap()), hash, "{} on alpha", path);
                assert_eq!(ContentHash::of(&tokio::fs::read(&on_b).await.unwrap()), hash, "{} on beta", path);
            }
        }
    }
}

fn state(replica: &LocalReplica) -> BTreeMap<String, (ContentHash, bool)> {
    replica
        .store()
        .scan()
        .unwrap()
        .into_iter()
        .map(|r| (r.path, (r.content_hash, r.deleted)))
        .collect()
}

/// Write a file and index the change
pub async fn write(replica: &LocalReplica, rel: &str, content: &[u8]) -> FileRecord {
    let abs = replica.abs_path(rel);
    if let Some(parent) = abs.parent() {
        tokio::fs::create_dir_all(parent).await.unwrap();
    }
    tokio::fs::write(&abs, content).await.unwrap();
    match replica
        .indexer()
        .apply_event(&ChangeEvent::new(rel, ChangeKind::Modified))
        .await
        .unwrap()
    {
        IndexOutcome::Updated(record) => record,
        IndexOutcome::Unchanged => panic!("{} did not change", rel),
    }
}

pub async fn remove(replica: &LocalReplica, rel: &str) {
    tokio::fs::remove_file(replica.abs_path(rel)).await.unwrap();
    replica
        .indexer()
        .apply_event(&ChangeEvent::new(rel, ChangeKind::Removed))
        .await
        .unwrap();
}

pub async fn read(replica: &LocalReplica, rel: &str) -> Vec<u8> {
    tokio::fs::read(replica.abs_path(rel)).await.unwrap()
}
