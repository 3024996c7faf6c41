//! Chunk staging for resumable transfers.
//!
//! Incoming chunks for a file are appended to `{root}/{hash}.{chunk_size}.part`.
//! Only whole, verified chunks count towards progress: on reopen the file is
//! truncated to a chunk boundary, so the receiver can report exactly how many
//! leading chunks it already holds and the sender resumes from there.
//!
//! A part file has at most one writer. `open` waits until any other
//! `StagedFile` for the same part is finished or dropped.

use blake3::Hasher;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use syncmd_chunker::{ChunkHash, ContentHash};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, trace, warn};

use crate::errors::{CasError, Result};
use crate::store::ObjectRef;

/// Directory holding partially received files
#[derive(Debug, Clone)]
pub struct StagingArea {
    root: PathBuf,
    writers: Arc<Mutex<HashMap<PathBuf, Arc<AsyncMutex<()>>>>>,
}

impl StagingArea {
    /// Create the staging directory if needed
    pub async fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            writers: Arc::default(),
        })
    }

    /// Exclusive access to one part file
    async fn claim(&self, path: &Path) -> OwnedMutexGuard<()> {
        let slot = {
            let mut writers = self.writers.lock().unwrap_or_else(PoisonError::into_inner);
            writers.retain(|p, slot| p == path || Arc::strong_count(slot) > 1);
            writers
                .entry(path.to_path_buf())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        slot.lock_owned().await
    }

    fn part_path(&self, hash: &ContentHash, chunk_size: usize) -> PathBuf {
        self.root.join(format!("{}.{}.part", hash.to_hex(), chunk_size))
    }

    /// Number of verified leading chunks already staged for `hash`
    pub async fn have_chunks(&self, hash: &ContentHash, chunk_size: usize) -> Result<u32> {
        match fs::metadata(self.part_path(hash, chunk_size)).await {
            Ok(meta) => Ok((meta.len() / chunk_size as u64) as u32),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Open (or resume) the staged file for `hash`
    pub async fn open(
        &self,
        hash: &ContentHash,
        size: u64,
        chunk_size: usize,
    ) -> Result<StagedFile> {
        if chunk_size == 0 {
            return Err(CasError::InvalidOperation("chunk size must be positive".to_string()));
        }
        let path = self.part_path(hash, chunk_size);
        let total_chunks = u32::try_from(size.div_ceil(chunk_size as u64))
            .map_err(|_| CasError::InvalidOperation(format!("file too large: {} bytes", size)))?;
        let claim = self.claim(&path).await;

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .await?;

        let existing = file.metadata().await?.len();
        let mut have = (existing / chunk_size as u64) as u32;
        if have > total_chunks {
            have = 0;
        }
        let keep = (have as u64 * chunk_size as u64).min(size);
        if keep != existing {
            trace!("Truncating staged {} from {} to {} bytes", hash.short(), existing, keep);
            file.set_len(keep).await?;
        }

        // Rebuild hasher from the kept prefix
        let mut hasher = Hasher::new();
        let mut buf = vec![0u8; 64 * 1024];
        let mut remaining = keep;
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let n = file.read(&mut buf[..want]).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            remaining -= n as u64;
        }
        file.flush().await?;
        drop(file);

        let file = OpenOptions::new().append(true).open(&path).await?;

        if have > 0 {
            debug!("Resuming staged transfer {} at chunk {}/{}", hash.short(), have, total_chunks);
        }

        Ok(StagedFile {
            path,
            _claim: claim,
            file: Some(file),
            hasher,
            expected: *hash,
            size,
            chunk_size,
            next_index: have,
            total_chunks,
            bytes: keep,
        })
    }

    /// Remove any staged data for `hash`. Waits for an open `StagedFile` on
    /// the same part to be dropped.
    pub async fn discard(&self, hash: &ContentHash, chunk_size: usize) -> Result<()> {
        let path = self.part_path(hash, chunk_size);
        let _claim = self.claim(&path).await;
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Discarded staged data for {}", hash.short());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// A partially received file
pub struct StagedFile {
    path: PathBuf,
    _claim: OwnedMutexGuard<()>,
    file: Option<File>,
    hasher: Hasher,
    expected: ContentHash,
    size: u64,
    chunk_size: usize,
    next_index: u32,
    total_chunks: u32,
    bytes: u64,
}

impl StagedFile {
    /// Index of the next chunk to request; equals the count of held chunks
    pub fn have_chunks(&self) -> u32 {
        self.next_index
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    pub fn is_complete(&self) -> bool {
        self.next_index >= self.total_chunks
    }

    /// Append the next chunk after verifying its checksum and position
    pub async fn append(&mut self, index: u32, data: &[u8], checksum: &ChunkHash) -> Result<()> {
        if index != self.next_index || index >= self.total_chunks {
            return Err(CasError::ChunkOutOfOrder {
                expected: self.next_index,
                got: index,
            });
        }
        if ChunkHash::of(data) != *checksum {
            return Err(CasError::ChunkChecksum { index });
        }
        let expected_len = (self.size - self.bytes).min(self.chunk_size as u64);
        if data.len() as u64 != expected_len {
            return Err(CasError::CorruptObject(format!(
                "chunk {} has {} bytes, expected {}",
                index,
                data.len(),
                expected_len
            )));
        }

        let file = self
            .file
            .as_mut()
            .ok_or_else(|| CasError::InvalidOperation("staged file already finalized".to_string()))?;
        file.write_all(data).await?;
        file.flush().await?;

        self.hasher.update(data);
        self.bytes += data.len() as u64;
        self.next_index += 1;
        trace!("Staged chunk {}/{} for {}", index + 1, self.total_chunks, self.expected.short());
        Ok(())
    }

    /// Verify the whole-file hash and move the file to `dest`.
    ///
    /// On mismatch the staged data is deleted, so the next attempt starts over.
    pub async fn finish(mut self, dest: impl AsRef<Path>) -> Result<ObjectRef> {
        let dest = dest.as_ref();
        if !self.is_complete() {
            return Err(CasError::InvalidOperation(format!(
                "staged file incomplete: {}/{} chunks",
                self.next_index, self.total_chunks
            )));
        }
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }

        let actual = ContentHash::from_blake3(self.hasher.finalize());
        if actual != self.expected {
            warn!("Whole-file hash mismatch for {}, discarding staged data", self.expected.short());
            let _ = fs::remove_file(&self.path).await;
            return Err(CasError::HashMismatch {
                expected: self.expected,
                actual,
            });
        }

        // The bytes on disk are what gets committed
        let (on_disk, len) = hash_file(&self.path).await?;
        if on_disk != self.expected || len != self.size {
            warn!(
                "Staged file for {} changed on disk ({} bytes), discarding",
                self.expected.short(),
                len
            );
            let _ = fs::remove_file(&self.path).await;
            return Err(CasError::HashMismatch {
                expected: self.expected,
                actual: on_disk,
            });
        }

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(&self.path, dest).await?;
        debug!("Committed staged {} to {}", self.expected.short(), dest.display());

        Ok(ObjectRef {
            hash: actual,
            size: self.bytes,
        })
    }
}

async fn hash_file(path: &Path) -> Result<(ContentHash, u64)> {
    let mut file = File::open(path).await?;
    let mut hasher = Hasher::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut len = 0u64;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        len += n as u64;
    }
    Ok((ContentHash::from_blake3(hasher.finalize()), len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use syncmd_chunker::{Chunker, ChunkerConfig};
    use tempfile::TempDir;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    #[tokio::test]
    async fn test_stage_and_finish() {
        let temp_dir = TempDir::new().unwrap();
        let staging = StagingArea::new(temp_dir.path().join("staging")).await.unwrap();
        let chunker = Chunker::new(ChunkerConfig { chunk_size: 256 }).unwrap();
        let data = sample(1000);
        let hash = ContentHash::of(&data);

        let mut staged = staging.open(&hash, data.len() as u64, 256).await.unwrap();
        assert_eq!(staged.total_chunks(), 4);
        for chunk in chunker.chunk_bytes(&data) {
            staged.append(chunk.index, &chunk.data, &chunk.hash).await.unwrap();
        }

        let dest = temp_dir.path().join("out").join("file.bin");
        let obj = staged.finish(&dest).await.unwrap();
        assert_eq!(obj.hash, hash);
        assert_eq!(fs::read(&dest).await.unwrap(), data);
        assert_eq!(staging.have_chunks(&hash, 256).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_resume_after_interruption() {
        let temp_dir = TempDir::new().unwrap();
        let staging = StagingArea::new(temp_dir.path()).await.unwrap();
        let chunker = Chunker::new(ChunkerConfig { chunk_size: 256 }).unwrap();
        let data = sample(256 * 5);
        let hash = ContentHash::of(&data);
        let chunks = chunker.chunk_bytes(&data);

        {
            let mut staged = staging.open(&hash, data.len() as u64, 256).await.unwrap();
            for chunk in &chunks[..3] {
                staged.append(chunk.index, &chunk.data, &chunk.hash).await.unwrap();
            }
        }

        let mut staged = staging.open(&hash, data.len() as u64, 256).await.unwrap();
        assert_eq!(staged.have_chunks(), 3);
        for chunk in &chunks[3..] {
            staged.append(chunk.index, &chunk.data, &chunk.hash).await.unwrap();
        }
        let dest = temp_dir.path().join("done.bin");
        staged.finish(&dest).await.unwrap();
        assert_eq!(fs::read(&dest).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_partial_chunk_truncated_on_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let staging = StagingArea::new(temp_dir.path()).await.unwrap();
        let data = sample(256 * 3);
        let hash = ContentHash::of(&data);

        // Two whole chunks plus a torn write
        fs::write(staging.part_path(&hash, 256), &data[..256 * 2 + 100]).await.unwrap();

        let staged = staging.open(&hash, data.len() as u64, 256).await.unwrap();
        assert_eq!(staged.have_chunks(), 2);
        let len = fs::metadata(staging.part_path(&hash, 256)).await.unwrap().len();
        assert_eq!(len, 512);
    }

    #[tokio::test]
    async fn test_bad_chunk_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let staging = StagingArea::new(temp_dir.path()).await.unwrap();
        let data = sample(600);
        let hash = ContentHash::of(&data);
        let mut staged = staging.open(&hash, 600, 256).await.unwrap();

        let err = staged
            .append(0, &data[..256], &ChunkHash::of(b"wrong"))
            .await
            .unwrap_err();
        assert!(matches!(err, CasError::ChunkChecksum { index: 0 }));

        let err = staged
            .append(1, &data[256..512], &ChunkHash::of(&data[256..512]))
            .await
            .unwrap_err();
        assert!(matches!(err, CasError::ChunkOutOfOrder { expected: 0, got: 1 }));
    }

    #[tokio::test]
    async fn test_whole_file_mismatch_discards() {
        let temp_dir = TempDir::new().unwrap();
        let staging = StagingArea::new(temp_dir.path()).await.unwrap();
        let data = sample(300);
        let claimed = ContentHash::of(b"a different file");

        let mut staged = staging.open(&claimed, 300, 256).await.unwrap();
        staged.append(0, &data[..256], &ChunkHash::of(&data[..256])).await.unwrap();
        staged.append(1, &data[256..], &ChunkHash::of(&data[256..])).await.unwrap();

        let err = staged.finish(temp_dir.path().join("x")).await.unwrap_err();
        assert!(matches!(err, CasError::HashMismatch { .. }));
        assert_eq!(staging.have_chunks(&claimed, 256).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_second_opener_waits_for_first() {
        let temp_dir = TempDir::new().unwrap();
        let staging = StagingArea::new(temp_dir.path().join("staging")).await.unwrap();
        let chunker = Chunker::new(ChunkerConfig { chunk_size: 256 }).unwrap();
        let data = sample(1000);
        let hash = ContentHash::of(&data);

        let mut first = staging.open(&hash, 1000, 256).await.unwrap();
        let second = {
            let staging = staging.clone();
            tokio::spawn(async move { staging.open(&hash, 1000, 256).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!second.is_finished());

        for chunk in chunker.chunk_bytes(&data) {
            first.append(chunk.index, &chunk.data, &chunk.hash).await.unwrap();
        }
        let dest = temp_dir.path().join("shared.png");
        let obj = first.finish(&dest).await.unwrap();
        assert_eq!(obj.size, 1000);
        assert_eq!(ContentHash::of(&fs::read(&dest).await.unwrap()), hash);

        // The part file was committed, so the waiter starts from scratch
        let second = second.await.unwrap().unwrap();
        assert_eq!(second.have_chunks(), 0);
    }

    #[tokio::test]
    async fn test_finish_rejects_bytes_changed_on_disk() {
        let temp_dir = TempDir::new().unwrap();
        let staging = StagingArea::new(temp_dir.path().join("staging")).await.unwrap();
        let chunker = Chunker::new(ChunkerConfig { chunk_size: 256 }).unwrap();
        let data = sample(1000);
        let hash = ContentHash::of(&data);

        let mut staged = staging.open(&hash, 1000, 256).await.unwrap();
        for chunk in chunker.chunk_bytes(&data) {
            staged.append(chunk.index, &chunk.data, &chunk.hash).await.unwrap();
        }
        // Another process scribbles on the part file
        let mut extra = OpenOptions::new()
            .append(true)
            .open(staging.part_path(&hash, 256))
            .await
            .unwrap();
        extra.write_all(&data[..256]).await.unwrap();
        extra.flush().await.unwrap();

        let dest = temp_dir.path().join("photo.png");
        let err = staged.finish(&dest).await.unwrap_err();
        assert!(matches!(err, CasError::HashMismatch { .. }));
        assert!(!dest.exists());
        assert_eq!(staging.have_chunks(&hash, 256).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_empty_file() {
        let temp_dir = TempDir::new().unwrap();
        let staging = StagingArea::new(temp_dir.path().join("s")).await.unwrap();
        let hash = ContentHash::of(b"");
        let staged = staging.open(&hash, 0, 256).await.unwrap();
        assert!(staged.is_complete());
        let dest = temp_dir.path().join("empty.md");
        staged.finish(&dest).await.unwrap();
        assert_eq!(fs::read(&dest).await.unwrap().len(), 0);
    }
}
