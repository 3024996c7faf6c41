use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use syncmd_cas::{is_temp_name, ContentStore};
use syncmd_chunker::ContentHash;
use tokio::fs;
use tracing::{debug, info, trace, warn};

use crate::errors::{IndexError, Result};
use crate::locks::PathLocks;
use crate::policy::SyncPolicy;
use crate::record::{FileClass, FileRecord};
use crate::store::RecordStore;

/// Directory under the replica root holding engine state
pub const STATE_DIR: &str = ".syncmd";

/// Kind of local change reported by a watcher or a rescan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
    Removed,
}

/// A change to one file under the replica root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Absolute, or relative to the replica root
    pub path: PathBuf,
    pub kind: ChangeKind,
}

impl ChangeEvent {
    pub fn new(path: impl Into<PathBuf>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

/// Configuration for the file indexer
#[derive(Debug, Clone)]
pub struct IndexerConfig {
    /// Names to skip while walking (basic `*` globs)
    pub ignore_patterns: Vec<String>,
    pub policy: SyncPolicy,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            ignore_patterns: vec![
                ".git".to_string(),
                ".DS_Store".to_string(),
                "Thumbs.db".to_string(),
                "*.tmp".to_string(),
            ],
            policy: SyncPolicy::default(),
        }
    }
}

/// Outcome of indexing one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexOutcome {
    Unchanged,
    Updated(FileRecord),
}

/// Counts from a full rescan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub indexed: usize,
    pub updated: usize,
    pub removed: usize,
}

/// Turns local filesystem changes into FileRecord updates
pub struct FileIndexer {
    root: PathBuf,
    device_id: String,
    store: Arc<dyn RecordStore>,
    cas: Arc<ContentStore>,
    locks: PathLocks,
    config: IndexerConfig,
}

impl FileIndexer {
    pub fn new(
        root: impl Into<PathBuf>,
        device_id: impl Into<String>,
        store: Arc<dyn RecordStore>,
        cas: Arc<ContentStore>,
        locks: PathLocks,
        config: IndexerConfig,
    ) -> Self {
        Self {
            root: root.into(),
            device_id: device_id.into(),
            store,
            cas,
            locks,
            config,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Record a single change. Safe to call repeatedly for the same event.
    pub async fn apply_event(&self, event: &ChangeEvent) -> Result<IndexOutcome> {
        let rel = self.relative_path(&event.path)?;
        let _guard = self.locks.lock(&rel).await;
        let abs = self.root.join(&rel);

        let existing = self.store.get(&rel)?;
        // Records received from peers stay tracked whatever the local policy says
        if existing.is_none() && !self.tracks(&rel) {
            trace!("{} is outside the sync policy", rel);
            return Ok(IndexOutcome::Unchanged);
        }
        let content = match fs::read(&abs).await {
            Ok(data) => Some(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        // The filesystem is the source of truth regardless of the reported kind
        match (content, existing) {
            (None, None) => Ok(IndexOutcome::Unchanged),
            (None, Some(prev)) if prev.deleted => Ok(IndexOutcome::Unchanged),
            (None, Some(prev)) => {
                let tombstone = prev.tombstone(&self.device_id, Utc::now());
                self.store.put(&tombstone)?;
                info!("Indexed removal of {} (v{})", rel, tombstone.logical_version);
                Ok(IndexOutcome::Updated(tombstone))
            }
            (Some(data), prev) => {
                let hash = ContentHash::of(&data);
                if let Some(prev) = &prev {
                    if !prev.deleted && prev.content_hash == hash {
                        trace!("{} unchanged", rel);
                        return Ok(IndexOutcome::Unchanged);
                    }
                }

                let modified_at = file_mtime(&abs).await.unwrap_or_else(Utc::now);
                let size = data.len() as u64;
                let record = match &prev {
                    Some(prev) => prev.successor(hash, size, &self.device_id, modified_at),
                    None => FileRecord::created(&rel, hash, size, &self.device_id, modified_at),
                };

                // Text versions are kept as merge ancestors
                if FileClass::from_path(&rel) == FileClass::Text {
                    self.cas.put(&data).await?;
                }
                self.store.put(&record)?;
                debug!(
                    "Indexed {} v{} ({})",
                    rel,
                    record.logical_version,
                    record.content_hash.short()
                );
                Ok(IndexOutcome::Updated(record))
            }
        }
    }

    /// Walk the tree and reconcile it against the store
    pub async fn scan(&self) -> Result<ScanSummary> {
        info!("Scanning replica root {:?}", self.root);
        let files = self.walk_directory(&self.root).await?;
        let mut summary = ScanSummary::default();
        let mut seen = HashSet::with_capacity(files.len());

        for file in files {
            let rel = self.relative_path(&file)?;
            summary.indexed += 1;
            match self.apply_event(&ChangeEvent::new(&file, ChangeKind::Modified)).await {
                Ok(IndexOutcome::Updated(_)) => summary.updated += 1,
                Ok(IndexOutcome::Unchanged) => {}
                Err(e) => warn!("Failed to index {:?}: {}", file, e),
            }
            seen.insert(rel);
        }

        for record in self.store.scan()? {
            if record.deleted || seen.contains(&record.path) {
                continue;
            }
            let event = ChangeEvent::new(&record.path, ChangeKind::Removed);
            if let IndexOutcome::Updated(_) = self.apply_event(&event).await? {
                summary.removed += 1;
            }
        }

        info!(
            "Scan finished: {} files, {} updated, {} removed",
            summary.indexed, summary.updated, summary.removed
        );
        Ok(summary)
    }

    /// Convert an absolute or root-relative path into a `/`-separated key
    pub fn relative_path(&self, path: &Path) -> Result<String> {
        let rel = if path.is_absolute() {
            path.strip_prefix(&self.root)
                .map_err(|_| IndexError::OutsideRoot(path.to_path_buf()))?
        } else {
            path
        };

        let mut parts = Vec::new();
        for component in rel.components() {
            match component {
                Component::Normal(part) => {
                    let part = part
                        .to_str()
                        .ok_or_else(|| IndexError::InvalidRecord(format!("non UTF-8 path {:?}", rel)))?;
                    parts.push(part);
                }
                Component::CurDir => {}
                _ => return Err(IndexError::OutsideRoot(path.to_path_buf())),
            }
        }
        if parts.is_empty() {
            return Err(IndexError::InvalidRecord("empty path".to_string()));
        }
        if parts[0] == STATE_DIR {
            return Err(IndexError::OutsideRoot(path.to_path_buf()));
        }
        Ok(parts.join("/"))
    }

    async fn walk_directory(&self, dir_path: &Path) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut dirs_to_process = vec![dir_path.to_path_buf()];

        while let Some(current_dir) = dirs_to_process.pop() {
            let mut entries = fs::read_dir(&current_dir).await?;

            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let name = entry.file_name();
                let Some(name) = name.to_str() else {
                    warn!("Skipping non UTF-8 name {:?}", path);
                    continue;
                };
                if self.matches_ignore(name) {
                    trace!("Ignoring path: {:?}", path);
                    continue;
                }

                let file_type = entry.file_type().await?;
                if file_type.is_file() && self.config.policy.syncs_file(name) {
                    files.push(path);
                } else if file_type.is_dir() && self.config.policy.walks_dir(name) {
                    dirs_to_process.push(path);
                } else {
                    trace!("Outside sync policy: {:?}", path);
                }
            }
        }

        files.sort();
        Ok(files)
    }

    /// Whether a root-relative path is picked up from the local tree
    pub fn tracks(&self, rel: &str) -> bool {
        self.config.policy.syncs_path(rel) && !rel.split('/').any(|part| self.matches_ignore(part))
    }

    fn matches_ignore(&self, name: &str) -> bool {
        if name == STATE_DIR || is_temp_name(name) {
            return true;
        }

        self.config.ignore_patterns.iter().any(|pattern| {
            if pattern.contains('*') {
                glob_match(pattern, name)
            } else {
                name == pattern
            }
        })
    }
}

/// Single leading or trailing `*` glob
fn glob_match(pattern: &str, name: &str) -> bool {
    if let Some(suffix) = pattern.strip_prefix('*') {
        return name.ends_with(suffix);
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return name.starts_with(prefix);
    }
    pattern == name
}

async fn file_mtime(path: &Path) -> Option<DateTime<Utc>> {
    let metadata = fs::metadata(path).await.ok()?;
    metadata.modified().ok().map(DateTime::<Utc>::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteRecordStore;
    use tempfile::tempdir;

    async fn indexer(root: &Path) -> FileIndexer {
        let store: Arc<dyn RecordStore> = Arc::new(SqliteRecordStore::open_in_memory().unwrap());
        let cas = Arc::new(ContentStore::new(root.join(STATE_DIR).join("objects")).await.unwrap());
        FileIndexer::new(root, "dev-a", store, cas, PathLocks::new(), IndexerConfig::default())
    }

    #[tokio::test]
    async fn test_apply_event_lifecycle() {
        let dir = tempdir().unwrap();
        let idx = indexer(dir.path()).await;
        let file = dir.path().join("notes.md");

        fs::write(&file, b"first\n").await.unwrap();
        let v1 = match idx.apply_event(&ChangeEvent::new(&file, ChangeKind::Created)).await.unwrap() {
            IndexOutcome::Updated(r) => r,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(v1.logical_version, 1);
        assert_eq!(v1.path, "notes.md");
        assert!(idx.cas.contains(&v1.content_hash).await);

        // Repeat is a no-op
        assert_eq!(
            idx.apply_event(&ChangeEvent::new(&file, ChangeKind::Modified)).await.unwrap(),
            IndexOutcome::Unchanged
        );

        fs::write(&file, b"second\n").await.unwrap();
        let v2 = match idx.apply_event(&ChangeEvent::new("notes.md", ChangeKind::Modified)).await.unwrap() {
            IndexOutcome::Updated(r) => r,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(v2.logical_version, 2);
        assert_eq!(v2.lineage, Some(v1.content_hash));

        fs::remove_file(&file).await.unwrap();
        let gone = match idx.apply_event(&ChangeEvent::new(&file, ChangeKind::Removed)).await.unwrap() {
            IndexOutcome::Updated(r) => r,
            other => panic!("unexpected {:?}", other),
        };
        assert!(gone.deleted);
        assert_eq!(gone.logical_version, 3);
        assert_eq!(
            idx.apply_event(&ChangeEvent::new(&file, ChangeKind::Removed)).await.unwrap(),
            IndexOutcome::Unchanged
        );
    }

    #[tokio::test]
    async fn test_binary_content_not_retained() {
        let dir = tempdir().unwrap();
        let idx = indexer(dir.path()).await;
        let file = dir.path().join("photo.jpg");
        fs::write(&file, b"\xff\xd8binary").await.unwrap();

        idx.apply_event(&ChangeEvent::new(&file, ChangeKind::Created)).await.unwrap();
        assert!(!idx.cas.contains(&ContentHash::of(b"\xff\xd8binary")).await);
    }

    #[tokio::test]
    async fn test_scan_skips_state_and_hidden() {
        let dir = tempdir().unwrap();
        let idx = indexer(dir.path()).await;
        let root = dir.path();

        fs::create_dir_all(root.join("sub")).await.unwrap();
        fs::write(root.join("a.md"), b"a").await.unwrap();
        fs::write(root.join("sub/b.png"), b"b").await.unwrap();
        fs::write(root.join(".hidden"), b"h").await.unwrap();
        fs::write(root.join("sub/.b.png.tmp.123"), b"partial").await.unwrap();
        fs::write(root.join("build.tmp"), b"t").await.unwrap();

        let summary = idx.scan().await.unwrap();
        assert_eq!(summary, ScanSummary { indexed: 2, updated: 2, removed: 0 });

        let paths: Vec<String> = idx.store.scan().unwrap().into_iter().map(|r| r.path).collect();
        assert_eq!(paths, vec!["a.md", "sub/b.png"]);

        fs::remove_file(root.join("a.md")).await.unwrap();
        let summary = idx.scan().await.unwrap();
        assert_eq!(summary, ScanSummary { indexed: 1, updated: 0, removed: 1 });
        assert!(idx.store.get("a.md").unwrap().unwrap().deleted);
    }

    #[tokio::test]
    async fn test_scan_follows_sync_policy() {
        let dir = tempdir().unwrap();
        let idx = indexer(dir.path()).await;
        let root = dir.path();

        fs::create_dir_all(root.join(".vscode")).await.unwrap();
        fs::create_dir_all(root.join(".git")).await.unwrap();
        fs::write(root.join(".gitignore"), b"target/\n").await.unwrap();
        fs::write(root.join(".editorconfig"), b"root = true\n").await.unwrap();
        fs::write(root.join(".vscode/settings.json"), b"{}").await.unwrap();
        fs::write(root.join(".git/HEAD"), b"ref: refs/heads/main\n").await.unwrap();
        fs::write(root.join(".env"), b"SECRET=1\n").await.unwrap();
        fs::write(root.join("clip.mp4"), b"video").await.unwrap();
        fs::write(root.join("plan.md"), b"# Plan\n").await.unwrap();

        let summary = idx.scan().await.unwrap();
        assert_eq!(summary.indexed, 4);
        let paths: Vec<String> = idx.store.scan().unwrap().into_iter().map(|r| r.path).collect();
        assert_eq!(paths, vec![".editorconfig", ".gitignore", ".vscode/settings.json", "plan.md"]);

        // Direct events are filtered the same way
        assert_eq!(
            idx.apply_event(&ChangeEvent::new("clip.mp4", ChangeKind::Created)).await.unwrap(),
            IndexOutcome::Unchanged
        );
        assert!(idx.store.get("clip.mp4").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_received_file_outside_policy_stays_tracked() {
        let dir = tempdir().unwrap();
        let store: Arc<dyn RecordStore> = Arc::new(SqliteRecordStore::open_in_memory().unwrap());
        let cas = Arc::new(ContentStore::new(dir.path().join(STATE_DIR).join("objects")).await.unwrap());
        let config = IndexerConfig {
            policy: SyncPolicy::only([crate::policy::FileCategory::Markdown]),
            ..IndexerConfig::default()
        };
        let idx = FileIndexer::new(dir.path(), "dev-a", store.clone(), cas, PathLocks::new(), config);

        // A peer with a wider policy sent this one
        fs::write(dir.path().join("photo.png"), b"pixels").await.unwrap();
        let received = FileRecord::created("photo.png", ContentHash::of(b"pixels"), 6, "dev-b", Utc::now());
        store.put(&received).unwrap();

        let summary = idx.scan().await.unwrap();
        assert_eq!(summary.removed, 0);
        assert!(!store.get("photo.png").unwrap().unwrap().deleted);

        fs::write(dir.path().join("photo.png"), b"retouched").await.unwrap();
        let outcome = idx.apply_event(&ChangeEvent::new("photo.png", ChangeKind::Modified)).await.unwrap();
        assert!(matches!(outcome, IndexOutcome::Updated(r) if r.logical_version == 2));
    }

    #[tokio::test]
    async fn test_relative_path_rules() {
        let dir = tempdir().unwrap();
        let idx = indexer(dir.path()).await;

        assert_eq!(idx.relative_path(&dir.path().join("x/y.md")).unwrap(), "x/y.md");
        assert_eq!(idx.relative_path(Path::new("./x/y.md")).unwrap(), "x/y.md");
        assert!(idx.relative_path(Path::new("../escape.md")).is_err());
        assert!(idx.relative_path(Path::new("/elsewhere/file.md")).is_err());
        assert!(idx.relative_path(Path::new(".syncmd/index.sqlite")).is_err());
    }

    #[test]
    fn test_glob_matching() {
        assert!(glob_match("*.tmp", "build.tmp"));
        assert!(glob_match("draft*", "draft-1.md"));
        assert!(!glob_match("*.tmp", "build.md"));
        assert!(!glob_match("draft*", "final.md"));
    }
}
