//! YAML frontmatter aware document merge

use serde_yaml::{Mapping, Value};
use tracing::debug;

use crate::errors::Result;
use crate::merge::merge_lines;

/// A markdown document split at its frontmatter fences
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document<'a> {
    /// Whole fenced block including both fence lines
    pub block: Option<&'a str>,
    /// YAML between the fences
    pub yaml: &'a str,
    pub body: &'a str,
}

impl<'a> Document<'a> {
    pub fn parse(text: &'a str) -> Self {
        let plain = Document {
            block: None,
            yaml: "",
            body: text,
        };

        let first_len = match text.find('\n') {
            Some(i) => i + 1,
            None => return plain,
        };
        if text[..first_len].trim_end_matches(['\r', '\n']) != "---" {
            return plain;
        }

        let mut offset = first_len;
        for line in text[first_len..].split_inclusive('\n') {
            let trimmed = line.trim_end_matches(['\r', '\n']);
            if trimmed == "---" || trimmed == "..." {
                let end = offset + line.len();
                return Document {
                    block: Some(&text[..end]),
                    yaml: &text[first_len..offset],
                    body: &text[end..],
                };
            }
            offset += line.len();
        }
        plain
    }

    fn mapping(&self) -> Option<Mapping> {
        match serde_yaml::from_str::<Value>(self.yaml).ok()? {
            Value::Mapping(m) => Some(m),
            Value::Null => Some(Mapping::new()),
            _ => None,
        }
    }
}

/// Merge two versions of a document against their base.
///
/// Frontmatter is merged key by key, the body line by line. When any side's
/// frontmatter is missing or unparsable the whole text is line-merged.
pub fn merge_document(base: &str, winner: &str, loser: &str) -> Result<String> {
    let (b, w, l) = (Document::parse(base), Document::parse(winner), Document::parse(loser));

    let (b_block, w_block, l_block) = match (b.block, w.block, l.block) {
        (Some(bb), Some(wb), Some(lb)) => (bb, wb, lb),
        (None, None, None) => return merge_lines(base, winner, loser),
        _ => {
            debug!("Frontmatter present on some sides only, merging whole document");
            return merge_lines(base, winner, loser);
        }
    };

    let (b_map, w_map, l_map) = match (b.mapping(), w.mapping(), l.mapping()) {
        (Some(bm), Some(wm), Some(lm)) => (bm, wm, lm),
        _ => {
            debug!("Frontmatter does not parse, merging whole document");
            return merge_lines(base, winner, loser);
        }
    };

    let merged = merge_mappings(&b_map, &w_map, &l_map);
    let block = if merged == w_map {
        w_block.to_string()
    } else if merged == l_map {
        l_block.to_string()
    } else if merged == b_map {
        b_block.to_string()
    } else {
        let yaml = serde_yaml::to_string(&Value::Mapping(merged))
            .map_err(|e| crate::errors::SyncError::MergeAmbiguous(format!("frontmatter: {}", e)))?;
        format!("---\n{}---\n", yaml)
    };

    let body = merge_lines(b.body, w.body, l.body)?;
    Ok(block + &body)
}

/// Key-wise merge, winner's key order first
pub fn merge_mappings(base: &Mapping, winner: &Mapping, loser: &Mapping) -> Mapping {
    let mut out = Mapping::new();

    for (key, w_value) in winner {
        let value = match loser.get(key) {
            None => w_value.clone(),
            Some(l_value) => merge_value(base.get(key), w_value, l_value),
        };
        out.insert(key.clone(), value);
    }
    for (key, l_value) in loser {
        if !winner.contains_key(key) {
            out.insert(key.clone(), l_value.clone());
        }
    }
    out
}

fn merge_value(base: Option<&Value>, winner: &Value, loser: &Value) -> Value {
    if winner == loser {
        return winner.clone();
    }
    if base == Some(winner) {
        return loser.clone();
    }
    if base == Some(loser) {
        return winner.clone();
    }
    match (winner, loser) {
        (Value::Sequence(w), Value::Sequence(l)) => {
            let base_items: &[Value] = match base {
                Some(Value::Sequence(b)) => b,
                _ => &[],
            };
            let removed: Vec<&Value> = base_items
                .iter()
                .filter(|item| !w.contains(item) || !l.contains(item))
                .collect();

            let mut union: Vec<Value> = Vec::with_capacity(w.len() + l.len());
            for item in w.iter().chain(l.iter()) {
                if !removed.contains(&item) && !union.contains(item) {
                    union.push(item.clone());
                }
            }
            Value::Sequence(union)
        }
        _ => winner.clone(),
    }
}
