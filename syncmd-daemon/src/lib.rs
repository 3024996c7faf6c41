//! syncmd background service
//!
//! - [`scheduler`]: periodic rounds with due peers, change intake and status
//! - [`server`]: TCP listener answering peers' rounds
//! - [`discovery`]: where peer candidates come from
//! - [`config`]: the TOML configuration file and its sync roots
//! - [`daemon`]: one server and scheduler per enabled root

pub mod config;
pub mod connector;
pub mod daemon;
pub mod discovery;
pub mod scheduler;
pub mod server;

pub use config::{default_config_path, DaemonConfig, SyncRoot, DEFAULT_LISTEN_ADDR};
pub use connector::TcpConnector;
pub use daemon::{build_scheduler, open_replica, peer_state_path, Daemon, RootService};
pub use discovery::{PeerCandidate, PeerDiscovery, StaticDiscovery};
pub use scheduler::{RoundScheduler, SchedulerConfig, SchedulerStatus, TickSummary};
pub use server::SyncServer;
