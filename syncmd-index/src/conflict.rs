use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use syncmd_chunker::ContentHash;

use crate::record::FileRecord;

/// Why two versions could not be merged automatically
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictReason {
    /// Both sides changed and no structural merge applies (binary, oversized, non-UTF-8)
    ConcurrentEdit,
    /// Both sides changed the same lines
    OverlappingEdit,
    /// The common ancestor content is unknown or no longer available
    MissingAncestor,
    /// A deletion beat a concurrent edit
    EditVsDelete,
}

impl fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConflictReason::ConcurrentEdit => "concurrent-edit",
            ConflictReason::OverlappingEdit => "overlapping-edit",
            ConflictReason::MissingAncestor => "missing-ancestor",
            ConflictReason::EditVsDelete => "edit-vs-delete",
        };
        f.write_str(s)
    }
}

/// Two divergent versions of one path, with the losing content preserved at `copy_path`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    pub path: String,
    pub copy_path: String,
    pub winner: FileRecord,
    pub loser: FileRecord,
    pub reason: ConflictReason,
    pub detected_at: DateTime<Utc>,
}

impl Conflict {
    pub fn new(winner: FileRecord, loser: FileRecord, reason: ConflictReason) -> Self {
        let copy_path = conflict_copy_path(&loser.path, &loser.device_id, &loser.content_hash);
        Self {
            path: winner.path.clone(),
            copy_path,
            detected_at: winner.modified_at.max(loser.modified_at),
            winner,
            loser,
            reason,
        }
    }

    /// Record stored for the conflict copy; identical on every replica
    pub fn copy_record(&self) -> FileRecord {
        FileRecord {
            path: self.copy_path.clone(),
            content_hash: self.loser.content_hash,
            size: self.loser.size,
            created_at: self.loser.created_at,
            modified_at: self.loser.modified_at,
            logical_version: 1,
            device_id: self.loser.device_id.clone(),
            deleted: false,
            lineage: None,
            ancestors: Vec::new(),
        }
    }
}

/// A persisted conflict awaiting acknowledgement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictEntry {
    pub id: i64,
    pub conflict: Conflict,
    pub acknowledged: bool,
}

/// `dir/stem.conflict-<device>-<hash8>.ext`
pub fn conflict_copy_path(path: &str, device_id: &str, hash: &ContentHash) -> String {
    let (dir, name) = match path.rfind('/') {
        Some(i) => (&path[..=i], &path[i + 1..]),
        None => ("", path),
    };
    let (stem, ext) = match name.rfind('.') {
        Some(i) if i > 0 => (&name[..i], &name[i..]),
        _ => (name, ""),
    };
    let device: String = device_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!("{}{}.conflict-{}-{}{}", dir, stem, device, hash.short(), ext)
}
