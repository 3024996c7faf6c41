//! Reconciliation engine for syncmd
//!
//! This crate turns two replicas' manifests into converged state:
//! - Delta planning between manifests, with fast-forward detection
//! - Deterministic conflict resolution (structural text merge or conflict copies)
//! - Chunked, resumable transfers with progress logging, and the matching server-side responder
//! - Round driving with class-based retry
//! - Peer registry with reachability tracking and persisted history

pub mod errors;
pub mod frontmatter;
pub mod merge;
pub mod planner;
pub mod progress;
pub mod registry;
pub mod replica;
pub mod resolver;
pub mod responder;
pub mod retry;
pub mod round;
pub mod state;
pub mod transfer;

pub use errors::{ErrorClass, Result, SyncError};
pub use frontmatter::{merge_document, Document};
pub use merge::merge_lines;
pub use planner::{DeltaPlanner, Divergence, Operation, Plan, Side};
pub use progress::{TransferDirection, TransferProgress};
pub use registry::{PeerRecord, Reachability, RegistryConfig, ReplicaRegistry};
pub use replica::{ApplyOutcome, LocalReplica, ReplicaConfig};
pub use resolver::{
    common_ancestor, merged_record, restamp_merge, ConflictResolver, Resolution, ResolverConfig, VersionInput,
    DEFAULT_MAX_MERGE_BYTES,
};
pub use responder::Responder;
pub use retry::RetryPolicy;
pub use round::{Connector, ReconciliationRound, RoundConfig, RoundReport};
pub use state::{PeerStateDatabase, RoundHistoryEntry};
pub use transfer::TransferEngine;
