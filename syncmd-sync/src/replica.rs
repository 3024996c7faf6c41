//! Local replica: files, record store, blob store and staging under one root

use bytes::Bytes;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use syncmd_cas::{write_atomic, CasError, ContentStore, StagedFile, StagingArea};
use syncmd_chunker::{ContentHash, DEFAULT_CHUNK_SIZE};
use syncmd_index::{
    Conflict, FileClass, FileIndexer, FileRecord, IndexerConfig, Manifest, ManifestBuilder, PathLocks,
    RecordStore, SqliteRecordStore, SyncPolicy, DEFAULT_TOMBSTONE_RETENTION_DAYS, STATE_DIR,
};
use tokio::fs;
use tracing::{debug, info, trace, warn};

use crate::errors::{Result, SyncError};
use crate::resolver::{restamp_merge, DEFAULT_MAX_MERGE_BYTES};

/// Per-replica tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicaConfig {
    /// Transfer chunk size in bytes
    pub chunk_size: usize,
    /// Days a tombstone is advertised before it is purged
    pub tombstone_retention_days: i64,
    /// Largest text merged automatically
    pub max_merge_bytes: usize,
    pub ignore_patterns: Vec<String>,
    /// Which local files are picked up
    pub sync: SyncPolicy,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            tombstone_retention_days: DEFAULT_TOMBSTONE_RETENTION_DAYS,
            max_merge_bytes: DEFAULT_MAX_MERGE_BYTES,
            ignore_patterns: IndexerConfig::default().ignore_patterns,
            sync: SyncPolicy::default(),
        }
    }
}

/// Result of applying a remote version locally
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// The replica already held the target version
    AlreadyCurrent,
}

pub struct LocalReplica {
    root: PathBuf,
    device_id: String,
    store: Arc<dyn RecordStore>,
    cas: Arc<ContentStore>,
    staging: StagingArea,
    locks: PathLocks,
    config: ReplicaConfig,
    builder: ManifestBuilder,
}

impl LocalReplica {
    /// Open the replica rooted at `root`, creating `.syncmd/` state as needed
    pub async fn open(root: impl AsRef<Path>, device_id: impl Into<String>, config: ReplicaConfig) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let state_dir = root.join(STATE_DIR);
        fs::create_dir_all(&state_dir).await?;
        let store = SqliteRecordStore::open(state_dir.join("index.sqlite"))?;
        Self::with_store(root, device_id, Arc::new(store), config).await
    }

    pub async fn with_store(
        root: impl AsRef<Path>,
        device_id: impl Into<String>,
        store: Arc<dyn RecordStore>,
        config: ReplicaConfig,
    ) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let state_dir = root.join(STATE_DIR);
        let cas = ContentStore::new(&state_dir).await?;
        let staging = StagingArea::new(state_dir.join("staging")).await?;
        let device_id = device_id.into();

        info!("Opened replica {} at {:?}", device_id, root);
        Ok(Self {
            root,
            device_id,
            store,
            cas: Arc::new(cas),
            staging,
            locks: PathLocks::new(),
            builder: ManifestBuilder::new(Duration::days(config.tombstone_retention_days)),
            config,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn staging(&self) -> &StagingArea {
        &self.staging
    }

    pub fn config(&self) -> &ReplicaConfig {
        &self.config
    }

    pub fn chunk_size(&self) -> usize {
        self.config.chunk_size
    }

    /// Indexer sharing this replica's store, blob store and path locks
    pub fn indexer(&self) -> FileIndexer {
        FileIndexer::new(
            &self.root,
            &self.device_id,
            self.store.clone(),
            self.cas.clone(),
            self.locks.clone(),
            IndexerConfig {
                ignore_patterns: self.config.ignore_patterns.clone(),
                policy: self.config.sync.clone(),
            },
        )
    }

    pub fn build_manifest(&self) -> Result<Manifest> {
        Ok(self.builder.build(self.store.as_ref(), &self.device_id)?)
    }

    pub fn current_sequence(&self) -> Result<u64> {
        Ok(self.store.current_manifest_sequence()?)
    }

    pub fn abs_path(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    /// Content for `hash`: the canonical file, then the blob store, then any
    /// file whose record carries the hash. Every candidate is verified.
    pub async fn read_content(&self, hash: &ContentHash, path_hint: Option<&str>) -> Result<Option<Bytes>> {
        if hash.is_tombstone() {
            return Ok(None);
        }

        if let Some(path) = path_hint {
            if let Some(record) = self.store.get(path)? {
                if !record.deleted && record.content_hash == *hash {
                    if let Some(data) = self.read_verified(path, hash).await? {
                        return Ok(Some(data));
                    }
                }
            }
        }

        match self.cas.get(hash).await {
            Ok(data) => return Ok(Some(data)),
            Err(CasError::ObjectNotFound(_)) => {}
            Err(e) if e.is_integrity_failure() => warn!("Blob {} is corrupt: {}", hash.short(), e),
            Err(e) => return Err(e.into()),
        }

        for record in self.store.find_by_hash(hash)? {
            if Some(record.path.as_str()) == path_hint {
                continue;
            }
            if let Some(data) = self.read_verified(&record.path, hash).await? {
                return Ok(Some(data));
            }
        }

        trace!("Content {} not held locally", hash.short());
        Ok(None)
    }

    async fn read_verified(&self, rel: &str, hash: &ContentHash) -> Result<Option<Bytes>> {
        match fs::read(self.abs_path(rel)).await {
            Ok(data) if ContentHash::of(&data) == *hash => Ok(Some(Bytes::from(data))),
            Ok(_) => {
                debug!("{} changed on disk since it was indexed", rel);
                Ok(None)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Fail with `Stale` unless the path still holds `expected_base`, on disk and
    /// in the store. Absent and deleted are the same base. Returns true when the
    /// path already holds `target`.
    pub(crate) async fn check_base(&self, path: &str, target: &ContentHash, expected_base: Option<ContentHash>) -> Result<bool> {
        let current = self.store.get(path)?.filter(|r| !r.deleted).map(|r| r.content_hash);

        let target_live = (!target.is_tombstone()).then_some(*target);
        if current == target_live {
            return Ok(true);
        }

        let expected = expected_base.filter(|h| !h.is_tombstone());
        if current != expected {
            return Err(SyncError::Stale {
                path: path.to_string(),
                expected,
                actual: current,
            });
        }

        let on_disk = match fs::read(self.abs_path(path)).await {
            Ok(data) => Some(ContentHash::of(&data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        if on_disk != current {
            debug!("{} has unindexed local changes", path);
            return Err(SyncError::Stale {
                path: path.to_string(),
                expected,
                actual: on_disk,
            });
        }
        Ok(false)
    }

    /// Store `record` at its path with in-memory content
    pub async fn apply_content(
        &self,
        record: &FileRecord,
        content: &[u8],
        expected_base: Option<ContentHash>,
    ) -> Result<ApplyOutcome> {
        verify_content(record, content)?;
        let _guard = self.locks.lock(&record.path).await;
        if self.check_base(&record.path, &record.content_hash, expected_base).await? {
            return Ok(ApplyOutcome::AlreadyCurrent);
        }
        self.commit_content(record, content).await?;
        Ok(ApplyOutcome::Applied)
    }

    /// Move a completed staging file into place and store `record`
    pub async fn apply_staged(
        &self,
        record: &FileRecord,
        staged: StagedFile,
        chunk_size: usize,
        expected_base: Option<ContentHash>,
    ) -> Result<ApplyOutcome> {
        let _guard = self.locks.lock(&record.path).await;
        if self.check_base(&record.path, &record.content_hash, expected_base).await? {
            drop(staged);
            self.staging.discard(&record.content_hash, chunk_size).await?;
            return Ok(ApplyOutcome::AlreadyCurrent);
        }

        let abs = self.abs_path(&record.path);
        staged.finish(&abs).await?;
        // Record first: nothing may suspend between the rename and the store
        self.store.put(record)?;
        if record.class() == FileClass::Text {
            let data = fs::read(&abs).await?;
            self.cas.put(&data).await?;
        }
        info!("Applied {} v{} ({})", record.path, record.logical_version, record.content_hash.short());
        Ok(ApplyOutcome::Applied)
    }

    /// Remove the file and store the tombstone
    pub async fn apply_tombstone(&self, tombstone: &FileRecord, expected_base: Option<ContentHash>) -> Result<ApplyOutcome> {
        if !tombstone.deleted {
            return Err(SyncError::violation(format!("{} is not a tombstone", tombstone.path)));
        }
        let _guard = self.locks.lock(&tombstone.path).await;
        if self.check_base(&tombstone.path, &tombstone.content_hash, expected_base).await? {
            if self.store.get(&tombstone.path)?.is_some_and(|r| r.version_cmp(tombstone).is_lt()) {
                self.store.put(tombstone)?;
            }
            return Ok(ApplyOutcome::AlreadyCurrent);
        }

        match fs::remove_file(self.abs_path(&tombstone.path)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.store.put(tombstone)?;
        info!("Deleted {} (v{})", tombstone.path, tombstone.logical_version);
        Ok(ApplyOutcome::Applied)
    }

    /// Write merged content, restamped against this replica's prior version
    pub async fn apply_merge(
        &self,
        merged: &FileRecord,
        content: &[u8],
        expected_base: Option<ContentHash>,
    ) -> Result<ApplyOutcome> {
        verify_content(merged, content)?;
        let _guard = self.locks.lock(&merged.path).await;
        if self.check_base(&merged.path, &merged.content_hash, expected_base).await? {
            return Ok(ApplyOutcome::AlreadyCurrent);
        }

        let record = match self.store.get(&merged.path)? {
            Some(own) if !own.deleted => restamp_merge(merged, &own, &self.device_id),
            _ => merged.clone(),
        };
        self.commit_content(&record, content).await?;
        Ok(ApplyOutcome::Applied)
    }

    async fn commit_content(&self, record: &FileRecord, content: &[u8]) -> Result<()> {
        write_atomic(self.abs_path(&record.path), content).await?;
        self.store.put(record)?;
        if record.class() == FileClass::Text {
            self.cas.put(content).await?;
        }
        info!("Applied {} v{} ({})", record.path, record.logical_version, record.content_hash.short());
        Ok(())
    }

    /// Record a conflict; returns its id the first time it is seen
    pub fn persist_conflict(&self, conflict: &Conflict) -> Result<Option<i64>> {
        let id = self.store.put_conflict(conflict)?;
        if let Some(id) = id {
            warn!(
                "Conflict #{} on {} ({}): {} kept, {} saved as {}",
                id,
                conflict.path,
                conflict.reason,
                conflict.winner.device_id,
                conflict.loser.device_id,
                conflict.copy_path
            );
        }
        Ok(id)
    }

    /// Write the loser's content to the conflict copy path if this replica has it.
    /// Returns whether the copy is now present.
    pub async fn materialize_copy(&self, conflict: &Conflict) -> Result<bool> {
        let copy = conflict.copy_record();
        let _guard = self.locks.lock(&copy.path).await;
        if let Some(existing) = self.store.get(&copy.path)? {
            if !existing.deleted && existing.content_hash == copy.content_hash {
                return Ok(true);
            }
        }

        let content = match self.read_content(&conflict.loser.content_hash, Some(&conflict.loser.path)).await? {
            Some(content) => content,
            None => return Ok(false),
        };
        self.commit_content(&copy, &content).await?;
        debug!("Materialized conflict copy {}", copy.path);
        Ok(true)
    }

    /// Drop tombstones past retention from the store
    pub fn purge_tombstones(&self) -> Result<usize> {
        let cutoff = Utc::now() - Duration::days(self.config.tombstone_retention_days);
        let purged = self.store.purge_tombstones(cutoff)?;
        if purged > 0 {
            info!("Purged {} expired tombstones", purged);
        }
        Ok(purged)
    }
}

fn verify_content(record: &FileRecord, content: &[u8]) -> Result<()> {
    let actual = ContentHash::of(content);
    if actual != record.content_hash || content.len() as u64 != record.size {
        return Err(SyncError::ChecksumMismatch {
            path: record.path.clone(),
            reason: format!("content hashes to {}, record says {}", actual.short(), record.content_hash.short()),
        });
    }
    Ok(())
}
