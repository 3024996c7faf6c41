//! Atomic file replacement for crash safety

use blake3::Hasher;
use std::path::{Path, PathBuf};
use syncmd_chunker::ContentHash;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::errors::{CasError, Result};

/// Temp-file marker; the indexer skips any name containing it.
pub const TEMP_MARKER: &str = ".tmp.";

/// Writes to a hidden sibling temp file and renames it over the target on
/// commit. Readers observe either the old content or the new content, never
/// a mix. Dropping an uncommitted writer removes the temp file.
pub struct AtomicWriter {
    final_path: PathBuf,
    temp_path: PathBuf,
    file: Option<fs::File>,
    hasher: Hasher,
    bytes_written: u64,
}

impl AtomicWriter {
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let final_path = path.as_ref().to_path_buf();
        let temp_path = temp_path_for(&final_path)?;

        if let Some(parent) = temp_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let file = fs::File::create(&temp_path).await?;

        Ok(Self {
            final_path,
            temp_path,
            file: Some(file),
            hasher: Hasher::new(),
            bytes_written: 0,
        })
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| CasError::InvalidOperation("Writer already finalized".to_string()))?;
        file.write_all(data).await?;
        self.hasher.update(data);
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    /// Rename the temp file over the target
    pub async fn commit(self) -> Result<AtomicWriteResult> {
        self.finish(None).await
    }

    /// Finalize only if the written bytes hash to `expected`
    pub async fn commit_verified(self, expected: &ContentHash) -> Result<AtomicWriteResult> {
        self.finish(Some(*expected)).await
    }

    async fn finish(mut self, expected: Option<ContentHash>) -> Result<AtomicWriteResult> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| CasError::InvalidOperation("Writer already finalized".to_string()))?;

        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let content_hash = ContentHash::from_blake3(self.hasher.finalize());
        if let Some(expected) = expected {
            if expected != content_hash {
                self.remove_temp().await;
                return Err(CasError::HashMismatch {
                    expected,
                    actual: content_hash,
                });
            }
        }

        if let Err(e) = fs::rename(&self.temp_path, &self.final_path).await {
            self.remove_temp().await;
            return Err(e.into());
        }

        debug!(
            "Committed atomic write: {} ({} bytes, {})",
            self.final_path.display(),
            self.bytes_written,
            content_hash.short()
        );

        Ok(AtomicWriteResult {
            path: self.final_path.clone(),
            bytes_written: self.bytes_written,
            content_hash,
        })
    }

    /// Discard everything written so far
    pub async fn abort(mut self) -> Result<()> {
        if self.file.take().is_some() {
            self.remove_temp().await;
        }
        Ok(())
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    async fn remove_temp(&self) {
        if let Err(e) = fs::remove_file(&self.temp_path).await {
            warn!("Could not remove {}: {}", self.temp_path.display(), e);
        }
    }
}

impl Drop for AtomicWriter {
    fn drop(&mut self) {
        if self.file.take().is_some() {
            let _ = std::fs::remove_file(&self.temp_path);
        }
    }
}

/// A committed write
#[derive(Debug, Clone)]
pub struct AtomicWriteResult {
    pub path: PathBuf,
    pub bytes_written: u64,
    pub content_hash: ContentHash,
}

/// Replace `path` with `data` in one step
pub async fn write_atomic(path: impl AsRef<Path>, data: &[u8]) -> Result<AtomicWriteResult> {
    let mut writer = AtomicWriter::new(path).await?;
    writer.write(data).await?;
    writer.commit().await
}

/// Whether a file name belongs to an in-flight atomic write
pub fn is_temp_name(name: &str) -> bool {
    name.starts_with('.') && name.contains(TEMP_MARKER)
}

fn temp_path_for(final_path: &Path) -> Result<PathBuf> {
    let name = final_path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| CasError::StoragePath(format!("Invalid target path: {}", final_path.display())))?;
    let temp_name = format!(".{}{}{}", name, TEMP_MARKER, uuid::Uuid::new_v4().simple());
    Ok(final_path.with_file_name(temp_name))
}
