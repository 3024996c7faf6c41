//! Delta planning between two manifests

use bytes::Bytes;
use std::cmp::Ordering;
use syncmd_chunker::ContentHash;
use syncmd_index::{Conflict, FileClass, FileRecord, Manifest};

/// Which replica an operation mutates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Local,
    Remote,
}

/// One unit of work for the transfer engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Bring the remote version here
    Fetch {
        path: String,
        from_hash: ContentHash,
        record: FileRecord,
        expected_base: Option<ContentHash>,
    },
    /// Send the local version to the peer
    Push {
        path: String,
        to_hash: ContentHash,
        record: FileRecord,
        expected_base: Option<ContentHash>,
    },
    /// Apply a tombstone on `target`
    Delete {
        path: String,
        tombstone: FileRecord,
        target: Side,
        expected_base: Option<ContentHash>,
    },
    /// Write merged content on every side whose hash differs
    MergeApply {
        path: String,
        record: FileRecord,
        content: Bytes,
        local: FileRecord,
        remote: FileRecord,
    },
    /// Keep the winner on the path and preserve the loser as a copy
    ConflictSplit {
        path: String,
        conflict: Conflict,
        local: FileRecord,
        remote: FileRecord,
    },
}

impl Operation {
    pub fn path(&self) -> &str {
        match self {
            Operation::Fetch { path, .. }
            | Operation::Push { path, .. }
            | Operation::Delete { path, .. }
            | Operation::MergeApply { path, .. }
            | Operation::ConflictSplit { path, .. } => path,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Operation::Fetch { .. } => "fetch",
            Operation::Push { .. } => "push",
            Operation::Delete { .. } => "delete",
            Operation::MergeApply { .. } => "merge",
            Operation::ConflictSplit { .. } => "split",
        }
    }

    /// Fetch or push `winner` so that `target` ends up holding it
    pub fn propagate(winner: &FileRecord, target: Side, target_hash: Option<ContentHash>) -> Self {
        let path = winner.path.clone();
        match (winner.deleted, target) {
            (true, _) => Operation::Delete {
                path,
                tombstone: winner.clone(),
                target,
                expected_base: target_hash,
            },
            (false, Side::Local) => Operation::Fetch {
                path,
                from_hash: winner.content_hash,
                record: winner.clone(),
                expected_base: target_hash,
            },
            (false, Side::Remote) => Operation::Push {
                path,
                to_hash: winner.content_hash,
                record: winner.clone(),
                expected_base: target_hash,
            },
        }
    }
}

/// A path edited independently on both sides
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Divergence {
    pub path: String,
    pub local: FileRecord,
    pub remote: FileRecord,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    pub operations: Vec<Operation>,
    pub divergent: Vec<Divergence>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty() && self.divergent.is_empty()
    }
}

/// Pure diff of two manifests into operations
pub struct DeltaPlanner;

impl DeltaPlanner {
    pub fn plan(local: &Manifest, remote: &Manifest) -> Plan {
        let mut local_records: Vec<&FileRecord> = local.records.iter().collect();
        let mut remote_records: Vec<&FileRecord> = remote.records.iter().collect();
        local_records.sort_by(|a, b| a.path.cmp(&b.path));
        remote_records.sort_by(|a, b| a.path.cmp(&b.path));

        let mut plan = Plan::default();
        let (mut i, mut j) = (0, 0);
        loop {
            let (l, r) = match (local_records.get(i), remote_records.get(j)) {
                (None, None) => break,
                (Some(l), None) => {
                    i += 1;
                    (Some(*l), None)
                }
                (None, Some(r)) => {
                    j += 1;
                    (None, Some(*r))
                }
                (Some(l), Some(r)) => match l.path.cmp(&r.path) {
                    Ordering::Less => {
                        i += 1;
                        (Some(*l), None)
                    }
                    Ordering::Greater => {
                        j += 1;
                        (None, Some(*r))
                    }
                    Ordering::Equal => {
                        i += 1;
                        j += 1;
                        (Some(*l), Some(*r))
                    }
                },
            };
            Self::plan_path(l, r, &mut plan);
        }
        plan
    }

    fn plan_path(local: Option<&FileRecord>, remote: Option<&FileRecord>, plan: &mut Plan) {
        match (local, remote) {
            (None, None) => {}
            (Some(l), None) => {
                if !l.deleted {
                    plan.operations.push(Operation::propagate(l, Side::Remote, None));
                }
            }
            (None, Some(r)) => {
                if !r.deleted {
                    plan.operations.push(Operation::propagate(r, Side::Local, None));
                }
            }
            (Some(l), Some(r)) => {
                if l.content_hash == r.content_hash {
                    return;
                }

                let local_descends = l.is_descendant_of(r);
                let remote_descends = r.is_descendant_of(l);
                // Both can hold when a recreated file and a later tombstone each list the other
                let fast_forward = match (local_descends, remote_descends) {
                    (true, false) => Some(Side::Local),
                    (false, true) => Some(Side::Remote),
                    (true, true) if l.wins_over(r) => Some(Side::Local),
                    (true, true) => Some(Side::Remote),
                    (false, false) => None,
                };
                if let Some(winner) = fast_forward {
                    plan.operations.push(Self::winner_op(winner, l, r));
                    return;
                }

                if l.deleted || r.deleted {
                    let (live_side, live, dead) = if l.deleted {
                        (Side::Remote, r, l)
                    } else {
                        (Side::Local, l, r)
                    };
                    let edit_wins = match FileClass::from_path(&live.path) {
                        FileClass::Text => true,
                        FileClass::Binary => live.wins_over(dead),
                    };
                    if edit_wins {
                        plan.operations.push(Self::winner_op(live_side, l, r));
                        return;
                    }
                }

                plan.divergent.push(Divergence {
                    path: l.path.clone(),
                    local: l.clone(),
                    remote: r.clone(),
                });
            }
        }
    }

    fn winner_op(winner: Side, local: &FileRecord, remote: &FileRecord) -> Operation {
        match winner {
            Side::Local => Operation::propagate(local, Side::Remote, Some(remote.content_hash)),
            Side::Remote => Operation::propagate(remote, Side::Local, Some(local.content_hash)),
        }
    }
}
