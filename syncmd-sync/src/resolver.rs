//! Deterministic resolution of concurrent edits

use bytes::Bytes;
use syncmd_chunker::ContentHash;
use syncmd_index::{Conflict, ConflictReason, FileRecord, MergeStrategy, ANCESTOR_TRAIL_LEN};
use tracing::debug;

use crate::errors::SyncError;
use crate::frontmatter::merge_document;

/// Largest text merged automatically (8 MiB)
pub const DEFAULT_MAX_MERGE_BYTES: usize = 8 * 1024 * 1024;

/// One side of a divergence, with its content when available
#[derive(Debug, Clone, Copy)]
pub struct VersionInput<'a> {
    pub record: &'a FileRecord,
    pub content: Option<&'a [u8]>,
}

impl<'a> VersionInput<'a> {
    pub fn new(record: &'a FileRecord, content: Option<&'a [u8]>) -> Self {
        Self { record, content }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Both sides adopt this record and content
    Merged { record: FileRecord, content: Bytes },
    /// The winner keeps the path, the loser is preserved as a copy
    Split(Conflict),
    /// A live version beat a tombstone; it propagates unchanged
    Keep(FileRecord),
}

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub max_merge_bytes: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            max_merge_bytes: DEFAULT_MAX_MERGE_BYTES,
        }
    }
}

/// Nearest hash shared by both histories.
///
/// Depth is the position in `[hash, lineage, ancestors..]`; the shared hash
/// with the smallest summed depth wins, ties broken by hash bytes.
pub fn common_ancestor(a: &FileRecord, b: &FileRecord) -> Option<ContentHash> {
    let mut best: Option<(usize, ContentHash)> = None;
    for (da, ha) in a.history().enumerate() {
        if ha.is_tombstone() {
            continue;
        }
        if let Some(db) = b.history().position(|hb| hb == ha) {
            let candidate = (da + db, *ha);
            if best.map_or(true, |current| candidate < current) {
                best = Some(candidate);
            }
        }
    }
    best.map(|(_, hash)| hash)
}

pub struct ConflictResolver {
    config: ResolverConfig,
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(ResolverConfig::default())
    }
}

impl ConflictResolver {
    pub fn new(config: ResolverConfig) -> Self {
        Self { config }
    }

    /// Resolve two divergent versions of one path.
    ///
    /// Symmetric: swapping `local` and `remote` gives the same outcome.
    pub fn resolve(&self, local: VersionInput<'_>, remote: VersionInput<'_>, ancestor: Option<&[u8]>) -> Resolution {
        let (winner, loser) = if local.record.wins_over(remote.record) {
            (local, remote)
        } else {
            (remote, local)
        };
        let path = &winner.record.path;

        if winner.record.deleted || loser.record.deleted {
            if winner.record.deleted && !loser.record.deleted {
                debug!("{}: deletion wins over edit, keeping edit as conflict copy", path);
                return Resolution::Split(Conflict::new(
                    winner.record.clone(),
                    loser.record.clone(),
                    ConflictReason::EditVsDelete,
                ));
            }
            return Resolution::Keep(winner.record.clone());
        }

        match MergeStrategy::for_path(path) {
            MergeStrategy::LastWriterWins => self.split(winner.record, loser.record, ConflictReason::ConcurrentEdit),
            MergeStrategy::StructuralTextMerge => self.merge_text(winner, loser, ancestor),
        }
    }

    fn merge_text(&self, winner: VersionInput<'_>, loser: VersionInput<'_>, ancestor: Option<&[u8]>) -> Resolution {
        let (w_bytes, l_bytes) = match (winner.content, loser.content) {
            (Some(w), Some(l)) => (w, l),
            _ => return self.split(winner.record, loser.record, ConflictReason::ConcurrentEdit),
        };
        let max = self.config.max_merge_bytes;
        if w_bytes.len() > max || l_bytes.len() > max {
            return self.split(winner.record, loser.record, ConflictReason::ConcurrentEdit);
        }
        let (w_text, l_text) = match (std::str::from_utf8(w_bytes), std::str::from_utf8(l_bytes)) {
            (Ok(w), Ok(l)) => (w, l),
            _ => return self.split(winner.record, loser.record, ConflictReason::ConcurrentEdit),
        };

        let base_text = match ancestor {
            None => return self.split(winner.record, loser.record, ConflictReason::MissingAncestor),
            Some(bytes) if bytes.len() > max => {
                return self.split(winner.record, loser.record, ConflictReason::ConcurrentEdit)
            }
            Some(bytes) => match std::str::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => return self.split(winner.record, loser.record, ConflictReason::ConcurrentEdit),
            },
        };

        match merge_document(base_text, w_text, l_text) {
            Ok(merged) => {
                let content = Bytes::from(merged.into_bytes());
                let record = merged_record(winner.record, loser.record, &content);
                debug!(
                    "{}: merged {} and {} into {}",
                    record.path,
                    winner.record.content_hash.short(),
                    loser.record.content_hash.short(),
                    record.content_hash.short()
                );
                Resolution::Merged { record, content }
            }
            Err(SyncError::MergeAmbiguous(reason)) => {
                debug!("{}: {}", winner.record.path, reason);
                self.split(winner.record, loser.record, ConflictReason::OverlappingEdit)
            }
            Err(_) => self.split(winner.record, loser.record, ConflictReason::OverlappingEdit),
        }
    }

    fn split(&self, winner: &FileRecord, loser: &FileRecord, reason: ConflictReason) -> Resolution {
        Resolution::Split(Conflict::new(winner.clone(), loser.clone(), reason))
    }
}

/// Record for merged content; identical on both replicas
pub fn merged_record(winner: &FileRecord, loser: &FileRecord, content: &[u8]) -> FileRecord {
    let content_hash = ContentHash::of(content);
    let mut ancestors = vec![loser.content_hash];
    ancestors.extend(winner.trail());
    FileRecord {
        path: winner.path.clone(),
        content_hash,
        size: content.len() as u64,
        created_at: winner.created_at.min(loser.created_at),
        modified_at: winner.modified_at.max(loser.modified_at),
        logical_version: winner.logical_version.max(loser.logical_version) + 1,
        device_id: winner.device_id.clone(),
        deleted: false,
        lineage: Some(winner.content_hash),
        ancestors: bounded_trail(ancestors, &[content_hash, winner.content_hash]),
    }
}

/// The merged record as stored by a replica whose prior version was `own`.
///
/// Lineage points at the replica's own prior hash and the other parent leads
/// the ancestor trail, so both parents stay reachable.
pub fn restamp_merge(merged: &FileRecord, own: &FileRecord, device_id: &str) -> FileRecord {
    let parents = [merged.lineage, merged.ancestors.first().copied()];
    let other_parent = parents
        .iter()
        .flatten()
        .copied()
        .find(|h| *h != own.content_hash);

    let mut ancestors: Vec<ContentHash> = other_parent.into_iter().collect();
    ancestors.extend(own.trail());
    FileRecord {
        device_id: device_id.to_string(),
        lineage: Some(own.content_hash),
        ancestors: bounded_trail(ancestors, &[merged.content_hash, own.content_hash]),
        ..merged.clone()
    }
}

fn bounded_trail(hashes: Vec<ContentHash>, exclude: &[ContentHash]) -> Vec<ContentHash> {
    let mut out = Vec::with_capacity(ANCESTOR_TRAIL_LEN);
    for hash in hashes {
        if out.len() == ANCESTOR_TRAIL_LEN {
            break;
        }
        if !exclude.contains(&hash) && !out.contains(&hash) {
            out.push(hash);
        }
    }
    out
}
