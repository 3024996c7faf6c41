//! Known peers, their reachability and when to try them next

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::errors::Result;
use crate::retry::RetryPolicy;
use crate::state::PeerStateDatabase;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reachability {
    Unknown,
    Reachable,
    Unreachable,
}

impl Reachability {
    fn rank(self) -> u8 {
        match self {
            Reachability::Reachable => 0,
            Reachability::Unknown => 1,
            Reachability::Unreachable => 2,
        }
    }
}

impl fmt::Display for Reachability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Reachability::Unknown => "unknown",
            Reachability::Reachable => "reachable",
            Reachability::Unreachable => "unreachable",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub device_id: String,
    pub address: String,
    pub last_manifest_sequence: Option<u64>,
    pub last_seen: Option<DateTime<Utc>>,
    pub reachability: Reachability,
    pub consecutive_failures: u32,
    /// Earliest time the scheduler may contact the peer again
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl PeerRecord {
    pub fn new(device_id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            address: address.into(),
            last_manifest_sequence: None,
            last_seen: None,
            reachability: Reachability::Unknown,
            consecutive_failures: 0,
            next_attempt_at: None,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.map_or(true, |at| at <= now)
    }
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Consecutive failures before a peer is marked unreachable
    pub failure_threshold: u32,
    pub retry_policy: RetryPolicy,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            retry_policy: RetryPolicy::peer_backoff(),
        }
    }
}

pub struct ReplicaRegistry {
    peers: RwLock<BTreeMap<String, PeerRecord>>,
    db: Option<Arc<PeerStateDatabase>>,
    config: RegistryConfig,
}

impl ReplicaRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            peers: RwLock::new(BTreeMap::new()),
            db: None,
            config,
        }
    }

    /// Registry backed by `db`, starting from the peers it already knows
    pub fn with_database(config: RegistryConfig, db: Arc<PeerStateDatabase>) -> Result<Self> {
        let peers: BTreeMap<String, PeerRecord> = db
            .load_peers()?
            .into_iter()
            .map(|peer| (peer.device_id.clone(), peer))
            .collect();
        debug!("Loaded {} known peers", peers.len());
        Ok(Self {
            peers: RwLock::new(peers),
            db: Some(db),
            config,
        })
    }

    fn persist(&self, peer: &PeerRecord) -> Result<()> {
        if let Some(db) = &self.db {
            db.upsert_peer(peer)?;
        }
        Ok(())
    }

    /// Add a discovered peer, or refresh its address
    pub async fn upsert_peer(&self, device_id: &str, address: &str) -> Result<PeerRecord> {
        let mut peers = self.peers.write().await;
        let peer = peers
            .entry(device_id.to_string())
            .or_insert_with(|| {
                info!("Discovered peer {} at {}", device_id, address);
                PeerRecord::new(device_id, address)
            });
        if peer.address != address {
            debug!("Peer {} moved from {} to {}", device_id, peer.address, address);
            peer.address = address.to_string();
        }
        let peer = peer.clone();
        self.persist(&peer)?;
        Ok(peer)
    }

    pub async fn record_success(&self, device_id: &str, manifest_sequence: u64, at: DateTime<Utc>) -> Result<()> {
        let mut peers = self.peers.write().await;
        let Some(peer) = peers.get_mut(device_id) else {
            warn!("Success reported for unknown peer {}", device_id);
            return Ok(());
        };
        if peer.reachability != Reachability::Reachable {
            info!("Peer {} is reachable", device_id);
        }
        peer.reachability = Reachability::Reachable;
        peer.consecutive_failures = 0;
        peer.last_seen = Some(at);
        peer.last_manifest_sequence = Some(manifest_sequence);
        peer.next_attempt_at = None;
        let peer = peer.clone();
        self.persist(&peer)
    }

    /// Count a failed attempt. `fatal` failures (protocol violations, round
    /// timeouts) mark the peer unreachable at once.
    pub async fn record_failure(&self, device_id: &str, at: DateTime<Utc>, fatal: bool) -> Result<()> {
        let mut peers = self.peers.write().await;
        let Some(peer) = peers.get_mut(device_id) else {
            warn!("Failure reported for unknown peer {}", device_id);
            return Ok(());
        };
        peer.consecutive_failures = peer.consecutive_failures.saturating_add(1);
        if fatal || peer.consecutive_failures >= self.config.failure_threshold {
            if peer.reachability != Reachability::Unreachable {
                warn!(
                    "Peer {} unreachable after {} failures",
                    device_id, peer.consecutive_failures
                );
            }
            peer.reachability = Reachability::Unreachable;
        }

        let delay = self.config.retry_policy.calculate_delay(peer.consecutive_failures);
        let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(1));
        peer.next_attempt_at = Some(at + delay);
        debug!("Next attempt for {} at {}", device_id, at + delay);
        let peer = peer.clone();
        self.persist(&peer)
    }

    /// Peers to contact now: reachable, then unknown, then unreachable ones
    /// due for another attempt. Peers still backing off are skipped.
    pub async fn candidates(&self, now: DateTime<Utc>) -> Vec<PeerRecord> {
        let peers = self.peers.read().await;
        let mut due: Vec<PeerRecord> = peers.values().filter(|p| p.is_due(now)).cloned().collect();
        due.sort_by(|a, b| {
            (a.reachability.rank(), &a.device_id).cmp(&(b.reachability.rank(), &b.device_id))
        });
        due
    }

    pub async fn get(&self, device_id: &str) -> Option<PeerRecord> {
        self.peers.read().await.get(device_id).cloned()
    }

    pub async fn list(&self) -> Vec<PeerRecord> {
        self.peers.read().await.values().cloned().collect()
    }
}
