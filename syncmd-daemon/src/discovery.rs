use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use syncmd_proto::Validator;
use syncmd_sync::Result;
use tracing::{debug, warn};

/// A peer that may be reachable at `address`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerCandidate {
    pub device_id: String,
    pub address: String,
}

impl PeerCandidate {
    pub fn new(device_id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            address: address.into(),
        }
    }
}

/// Source of peer candidates for the scheduler
#[async_trait]
pub trait PeerDiscovery: Send + Sync {
    async fn discover(&self) -> Result<Vec<PeerCandidate>>;
}

/// Peers listed in the configuration file
pub struct StaticDiscovery {
    peers: Vec<PeerCandidate>,
}

impl StaticDiscovery {
    /// Drops entries with an invalid device id, and our own id if it appears.
    pub fn new(local_device: &str, peers: Vec<PeerCandidate>) -> Self {
        let peers = peers
            .into_iter()
            .filter(|peer| {
                if let Err(e) = Validator::validate_device_id(&peer.device_id) {
                    warn!("Ignoring configured peer {:?}: {}", peer.device_id, e);
                    return false;
                }
                peer.device_id != local_device
            })
            .collect();
        Self { peers }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[async_trait]
impl PeerDiscovery for StaticDiscovery {
    async fn discover(&self) -> Result<Vec<PeerCandidate>> {
        debug!("Static discovery yields {} peers", self.peers.len());
        Ok(self.peers.clone())
    }
}

/// Discovery that always fails, for exercising scheduler error paths
#[cfg(test)]
pub(crate) struct FailingDiscovery;

#[cfg(test)]
#[async_trait]
impl PeerDiscovery for FailingDiscovery {
    async fn discover(&self) -> Result<Vec<PeerCandidate>> {
        Err(syncmd_sync::SyncError::Connect("discovery offline".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_discovery_filters_entries() {
        let discovery = StaticDiscovery::new(
            "me",
            vec![
                PeerCandidate::new("laptop", "10.0.0.2:7700"),
                PeerCandidate::new("me", "127.0.0.1:7700"),
                PeerCandidate::new("", "10.0.0.3:7700"),
            ],
        );
        assert_eq!(discovery.len(), 1);
        let peers = discovery.discover().await.unwrap();
        assert_eq!(peers, vec![PeerCandidate::new("laptop", "10.0.0.2:7700")]);
    }
}
