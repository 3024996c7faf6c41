//! Three-way line merge

use similar::{capture_diff_slices, Algorithm, DiffOp};

use crate::errors::{Result, SyncError};

/// A contiguous change against the base: base lines `start..end` become `lines`
#[derive(Debug, Clone, PartialEq, Eq)]
struct Hunk<'a> {
    start: usize,
    end: usize,
    lines: Vec<&'a str>,
    /// 0 for the winner, 1 for the loser
    side: u8,
}

impl Hunk<'_> {
    fn same_change(&self, other: &Hunk<'_>) -> bool {
        self.start == other.start && self.end == other.end && self.lines == other.lines
    }
}

fn split_lines(text: &str) -> Vec<&str> {
    text.split_inclusive('\n').collect()
}

fn hunks<'a>(base: &[&'a str], changed: &[&'a str], side: u8) -> Vec<Hunk<'a>> {
    let mut out: Vec<Hunk<'a>> = Vec::new();
    let mut open: Option<Hunk<'a>> = None;

    for op in capture_diff_slices(Algorithm::Myers, base, changed) {
        let (old_start, old_len, new_start, new_len) = match op {
            DiffOp::Equal { .. } => {
                if let Some(h) = open.take() {
                    out.push(h);
                }
                continue;
            }
            DiffOp::Delete { old_index, old_len, new_index } => (old_index, old_len, new_index, 0),
            DiffOp::Insert { old_index, new_index, new_len } => (old_index, 0, new_index, new_len),
            DiffOp::Replace { old_index, old_len, new_index, new_len } => {
                (old_index, old_len, new_index, new_len)
            }
        };
        let new_lines = &changed[new_start..new_start + new_len];
        match open.as_mut() {
            Some(h) if h.end == old_start => {
                h.end = old_start + old_len;
                h.lines.extend_from_slice(new_lines);
            }
            _ => {
                if let Some(h) = open.take() {
                    out.push(h);
                }
                open = Some(Hunk {
                    start: old_start,
                    end: old_start + old_len,
                    lines: new_lines.to_vec(),
                    side,
                });
            }
        }
    }
    if let Some(h) = open {
        out.push(h);
    }
    out
}

fn with_newline(text: &str) -> std::borrow::Cow<'_, str> {
    if text.is_empty() || text.ends_with('\n') {
        std::borrow::Cow::Borrowed(text)
    } else {
        std::borrow::Cow::Owned(format!("{}\n", text))
    }
}

/// Merge `winner` and `loser` against their common `base`.
///
/// Non-overlapping changes from both sides are combined, identical changes are
/// applied once and insertions at the same point keep the winner's lines first.
/// Any other overlap is `MergeAmbiguous`.
pub fn merge_lines(base: &str, winner: &str, loser: &str) -> Result<String> {
    let base_ends = base.ends_with('\n');
    let winner_ends = winner.ends_with('\n');
    let loser_ends = loser.ends_with('\n');

    let (base_n, winner_n, loser_n) = (with_newline(base), with_newline(winner), with_newline(loser));
    let base_lines = split_lines(&base_n);
    let winner_lines = split_lines(&winner_n);
    let loser_lines = split_lines(&loser_n);

    let mut all = hunks(&base_lines, &winner_lines, 0);
    all.extend(hunks(&base_lines, &loser_lines, 1));
    // Insertions before replacements at the same anchor, winner first
    all.sort_by_key(|h| (h.start, h.end > h.start, h.side));

    let mut out: Vec<&str> = Vec::with_capacity(base_lines.len());
    let mut pos = 0usize;
    let mut last: Option<&Hunk<'_>> = None;

    for hunk in &all {
        if let Some(prev) = last {
            if prev.side != hunk.side && prev.same_change(hunk) {
                continue;
            }
        }
        if hunk.start < pos {
            return Err(SyncError::MergeAmbiguous(format!(
                "edits overlap at line {}",
                hunk.start + 1
            )));
        }
        out.extend_from_slice(&base_lines[pos..hunk.start]);
        out.extend_from_slice(&hunk.lines);
        pos = hunk.end;
        last = Some(hunk);
    }
    out.extend_from_slice(&base_lines[pos..]);

    let mut merged = out.concat();
    let ends = if winner_ends != base_ends {
        winner_ends
    } else {
        loser_ends
    };
    if !ends && merged.ends_with('\n') {
        merged.pop();
    }
    Ok(merged)
}
