//! Per-path metadata records and file classification

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use syncmd_chunker::ContentHash;

/// Maximum number of older ancestor hashes carried beyond `lineage`
pub const ANCESTOR_TRAIL_LEN: usize = 16;

/// Extensions merged structurally as text
pub const TEXT_EXTENSIONS: &[&str] = &[
    "md", "markdown", "mdown", "mkdn", "mkd", "mdwn", "mdtxt", "mdtext", "text", "txt",
];

/// Latest known state of one path on one replica
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Root-relative path with `/` separators
    pub path: String,
    /// BLAKE3 of the content; the all-zero hash for tombstones
    pub content_hash: ContentHash,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    /// Wall clock, informational only
    pub modified_at: DateTime<Utc>,
    /// Per-path counter bumped on every local write
    pub logical_version: u64,
    /// Replica that produced this version
    pub device_id: String,
    pub deleted: bool,
    /// Hash of the version this one was derived from
    pub lineage: Option<ContentHash>,
    /// Older ancestors beyond `lineage`, most recent first
    pub ancestors: Vec<ContentHash>,
}

impl FileRecord {
    /// A path seen for the first time
    pub fn created(
        path: impl Into<String>,
        content_hash: ContentHash,
        size: u64,
        device_id: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            path: path.into(),
            content_hash,
            size,
            created_at: at,
            modified_at: at,
            logical_version: 1,
            device_id: device_id.into(),
            deleted: false,
            lineage: None,
            ancestors: Vec::new(),
        }
    }

    /// A new local version derived from this one
    pub fn successor(
        &self,
        content_hash: ContentHash,
        size: u64,
        device_id: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            path: self.path.clone(),
            content_hash,
            size,
            created_at: if self.deleted { at } else { self.created_at },
            modified_at: at,
            logical_version: self.logical_version + 1,
            device_id: device_id.into(),
            deleted: false,
            lineage: Some(self.content_hash),
            ancestors: self.trail(),
        }
    }

    /// A tombstone superseding this record
    pub fn tombstone(&self, device_id: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            path: self.path.clone(),
            content_hash: ContentHash::tombstone(),
            size: 0,
            created_at: self.created_at,
            modified_at: at,
            logical_version: self.logical_version + 1,
            device_id: device_id.into(),
            deleted: true,
            lineage: Some(self.content_hash),
            ancestors: self.trail(),
        }
    }

    /// Ancestor list for a record whose immediate parent is `self`
    pub fn trail(&self) -> Vec<ContentHash> {
        let mut trail = Vec::with_capacity(ANCESTOR_TRAIL_LEN);
        for hash in self.lineage.iter().chain(self.ancestors.iter()) {
            if trail.len() == ANCESTOR_TRAIL_LEN {
                break;
            }
            if *hash != self.content_hash && !trail.contains(hash) {
                trail.push(*hash);
            }
        }
        trail
    }

    /// Own hash followed by every known ancestor, nearest first
    pub fn history(&self) -> impl Iterator<Item = &ContentHash> + '_ {
        std::iter::once(&self.content_hash)
            .chain(self.lineage.iter())
            .chain(self.ancestors.iter())
    }

    /// True when `other`'s content is somewhere in this record's ancestry
    pub fn is_descendant_of(&self, other: &FileRecord) -> bool {
        self.content_hash != other.content_hash
            && (self.lineage == Some(other.content_hash)
                || self.ancestors.contains(&other.content_hash))
    }

    /// Total order used for every last-writer-wins decision
    pub fn version_cmp(&self, other: &FileRecord) -> Ordering {
        (self.logical_version, self.device_id.as_str())
            .cmp(&(other.logical_version, other.device_id.as_str()))
            .then_with(|| self.content_hash.cmp(&other.content_hash))
    }

    /// Whether this record beats `other` under the `(logical_version, device_id)` tie-break
    pub fn wins_over(&self, other: &FileRecord) -> bool {
        self.version_cmp(other) == Ordering::Greater
    }

    pub fn class(&self) -> FileClass {
        FileClass::from_path(&self.path)
    }
}

/// How a path's content is treated when two replicas disagree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileClass {
    Text,
    Binary,
}

impl FileClass {
    /// Classify by extension. Unknown extensions are treated as binary so
    /// both replicas always reach the same decision without reading content.
    pub fn from_path(path: &str) -> Self {
        let name = path.rsplit('/').next().unwrap_or(path);
        let ext = match name.rfind('.') {
            Some(i) if i > 0 => &name[i + 1..],
            _ => return FileClass::Binary,
        };
        if TEXT_EXTENSIONS.iter().any(|t| t.eq_ignore_ascii_case(ext)) {
            FileClass::Text
        } else {
            FileClass::Binary
        }
    }

    pub fn merge_strategy(self) -> MergeStrategy {
        match self {
            FileClass::Text => MergeStrategy::StructuralTextMerge,
            FileClass::Binary => MergeStrategy::LastWriterWins,
        }
    }
}

/// Closed set of conflict strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeStrategy {
    StructuralTextMerge,
    LastWriterWins,
}

impl MergeStrategy {
    pub fn for_path(path: &str) -> Self {
        FileClass::from_path(path).merge_strategy()
    }
}
