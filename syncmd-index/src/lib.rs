//! Record keeping for a syncmd replica
//!
//! - [`record`]: per-path `FileRecord` metadata and text/binary classification
//! - [`store`]: the SQLite-backed record store
//! - [`manifest`]: immutable snapshots exchanged between peers
//! - [`indexer`]: turns local filesystem changes into record updates
//! - [`policy`]: which local files are synced
//! - [`locks`]: per-path advisory locks shared by every writer

pub mod conflict;
pub mod errors;
pub mod indexer;
pub mod locks;
pub mod manifest;
pub mod policy;
pub mod record;
pub mod schema;
pub mod store;

pub use conflict::{conflict_copy_path, Conflict, ConflictEntry, ConflictReason};
pub use errors::{IndexError, Result};
pub use indexer::{
    ChangeEvent, ChangeKind, FileIndexer, IndexOutcome, IndexerConfig, ScanSummary, STATE_DIR,
};
pub use locks::{PathGuard, PathLocks};
pub use manifest::{Manifest, ManifestBuilder, DEFAULT_TOMBSTONE_RETENTION_DAYS};
pub use policy::{FileCategory, SyncPolicy, ALLOWED_PROJECT_FILES};
pub use record::{FileClass, FileRecord, MergeStrategy, ANCESTOR_TRAIL_LEN, TEXT_EXTENSIONS};
pub use store::{RecordStore, SqliteRecordStore};
