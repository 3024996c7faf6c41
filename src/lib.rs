//! syncmd workspace root
//!
//! Re-exports the workspace crates so cross-crate scenarios under `tests/`
//! can reach everything through one dependency.

pub use syncmd_cas as cas;
pub use syncmd_chunker as chunker;
pub use syncmd_daemon as daemon;
pub use syncmd_index as index;
pub use syncmd_proto as proto;
pub use syncmd_sync as sync;
