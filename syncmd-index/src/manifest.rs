//! Immutable per-round snapshots of a replica's records

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use syncmd_chunker::ContentHash;
use tracing::debug;

use crate::errors::Result;
use crate::record::FileRecord;
use crate::store::RecordStore;

/// Default window during which tombstones are still advertised
pub const DEFAULT_TOMBSTONE_RETENTION_DAYS: i64 = 30;

/// A replica's full record set at one logical moment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub device_id: String,
    /// Monotonic per replica
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
    /// Path-sorted once finalized
    pub records: Vec<FileRecord>,
    pub manifest_hash: Option<ContentHash>,
}

impl Manifest {
    pub fn new(device_id: impl Into<String>, sequence: u64) -> Self {
        Self {
            device_id: device_id.into(),
            sequence,
            created_at: Utc::now(),
            records: Vec::new(),
            manifest_hash: None,
        }
    }

    pub fn add_record(&mut self, record: FileRecord) {
        self.records.push(record);
    }

    /// Sort into canonical order and stamp the merkle root
    pub fn finalize(&mut self) {
        self.records.sort_by(|a, b| a.path.cmp(&b.path));
        self.manifest_hash = Some(self.calculate_hash());
    }

    /// Recompute the root and compare with the stamped one
    pub fn verify(&self) -> bool {
        match &self.manifest_hash {
            Some(stored) => self.calculate_hash() == *stored,
            None => false,
        }
    }

    /// Merkle root over the path-sorted records
    pub fn calculate_hash(&self) -> ContentHash {
        let mut sorted: Vec<&FileRecord> = self.records.iter().collect();
        sorted.sort_by(|a, b| a.path.cmp(&b.path));

        if sorted.is_empty() {
            return ContentHash::from_blake3(blake3::Hasher::new().finalize());
        }

        let mut level: Vec<[u8; 32]> = sorted.iter().map(|r| leaf_hash(r)).collect();
        while level.len() > 1 {
            level = level
                .chunks(2)
                .map(|pair| {
                    let mut hasher = blake3::Hasher::new();
                    hasher.update(&pair[0]);
                    // Odd node is paired with itself
                    hasher.update(pair.get(1).unwrap_or(&pair[0]));
                    *hasher.finalize().as_bytes()
                })
                .collect();
        }
        ContentHash::from_bytes(level[0])
    }

    /// Look up a record in a finalized manifest
    pub fn get(&self, path: &str) -> Option<&FileRecord> {
        self.records
            .binary_search_by(|r| r.path.as_str().cmp(path))
            .ok()
            .map(|i| &self.records[i])
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Bytes held by live records
    pub fn total_size(&self) -> u64 {
        self.records.iter().filter(|r| !r.deleted).map(|r| r.size).sum()
    }

    pub fn live_count(&self) -> usize {
        self.records.iter().filter(|r| !r.deleted).count()
    }
}

fn leaf_hash(record: &FileRecord) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&(record.path.len() as u64).to_le_bytes());
    hasher.update(record.path.as_bytes());
    hasher.update(record.content_hash.as_bytes());
    hasher.update(&record.size.to_le_bytes());
    hasher.update(&record.logical_version.to_le_bytes());
    hasher.update(&(record.device_id.len() as u64).to_le_bytes());
    hasher.update(record.device_id.as_bytes());
    hasher.update(&[record.deleted as u8]);
    match &record.lineage {
        Some(lineage) => {
            hasher.update(&[1]);
            hasher.update(lineage.as_bytes());
        }
        None => {
            hasher.update(&[0]);
        }
    }
    for ancestor in &record.ancestors {
        hasher.update(ancestor.as_bytes());
    }
    hasher.update(&record.modified_at.timestamp_millis().to_le_bytes());
    *hasher.finalize().as_bytes()
}

/// Produces manifests from a record store
#[derive(Debug, Clone)]
pub struct ManifestBuilder {
    /// Tombstones older than this are left out
    pub tombstone_retention: Duration,
}

impl Default for ManifestBuilder {
    fn default() -> Self {
        Self {
            tombstone_retention: Duration::days(DEFAULT_TOMBSTONE_RETENTION_DAYS),
        }
    }
}

impl ManifestBuilder {
    pub fn new(tombstone_retention: Duration) -> Self {
        Self {
            tombstone_retention,
        }
    }

    /// Snapshot the store under a fresh sequence number
    pub fn build(&self, store: &dyn RecordStore, device_id: &str) -> Result<Manifest> {
        self.build_at(store, device_id, Utc::now())
    }

    pub fn build_at(
        &self,
        store: &dyn RecordStore,
        device_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Manifest> {
        let cutoff = now - self.tombstone_retention;
        let sequence = store.next_manifest_sequence()?;

        let mut manifest = Manifest::new(device_id, sequence);
        manifest.created_at = now;
        for record in store.scan()? {
            if record.deleted && record.modified_at < cutoff {
                continue;
            }
            manifest.add_record(record);
        }
        manifest.finalize();

        debug!(
            "Built manifest #{} for {} with {} records ({} live)",
            manifest.sequence,
            device_id,
            manifest.len(),
            manifest.live_count()
        );
        Ok(manifest)
    }
}
