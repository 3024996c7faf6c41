use bytes::Bytes;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use syncmd_chunker::ContentHash;
use tokio::fs;
use tracing::{debug, trace};

use crate::atomic::write_atomic;
use crate::errors::{CasError, Result};

/// Reference to an object in the content-addressed storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRef {
    /// Blake3 hash of the content
    pub hash: ContentHash,
    /// Size of the content in bytes
    pub size: u64,
}

/// Content-addressed blob store.
///
/// Holds prior versions of text files so that a later three-way merge can
/// find the common ancestor by hash, and serves those blobs to peers that
/// ask for an ancestor they no longer have.
///
/// # Storage Layout
///
/// Objects are stored at `{root}/objects/{shard}/{hash}`, where `shard` is the
/// first two characters of the hex hash.
pub struct ContentStore {
    root_path: PathBuf,
}

impl ContentStore {
    /// Open a content store, creating its directories if needed
    pub async fn new(root_path: impl AsRef<Path>) -> Result<Self> {
        let root_path = root_path.as_ref().to_path_buf();
        fs::create_dir_all(root_path.join("objects")).await?;
        debug!("Content store initialized at {:?}", root_path);
        Ok(Self { root_path })
    }

    fn object_path(&self, hash: &ContentHash) -> PathBuf {
        let hex = hash.to_hex();
        let (shard, _) = hex.split_at(2);
        self.root_path.join("objects").join(shard).join(&hex)
    }

    /// Store `data`. Writing an object that already exists is a no-op.
    pub async fn put(&self, data: &[u8]) -> Result<ObjectRef> {
        let hash = ContentHash::of(data);
        let object_path = self.object_path(&hash);

        if fs::try_exists(&object_path).await? {
            trace!("Object {} already exists", hash.short());
        } else {
            write_atomic(&object_path, data).await?;
            debug!("Wrote object {} ({} bytes)", hash.short(), data.len());
        }

        Ok(ObjectRef {
            hash,
            size: data.len() as u64,
        })
    }

    /// Read an object, verifying its hash
    pub async fn get(&self, hash: &ContentHash) -> Result<Bytes> {
        let object_path = self.object_path(hash);
        let data = match fs::read(&object_path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CasError::ObjectNotFound(*hash))
            }
            Err(e) => return Err(e.into()),
        };

        let actual = ContentHash::of(&data);
        if actual != *hash {
            return Err(CasError::HashMismatch {
                expected: *hash,
                actual,
            });
        }

        Ok(Bytes::from(data))
    }

    /// Read an object if present
    pub async fn get_optional(&self, hash: &ContentHash) -> Result<Option<Bytes>> {
        match self.get(hash).await {
            Ok(data) => Ok(Some(data)),
            Err(CasError::ObjectNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Check if an object exists in the store
    pub async fn contains(&self, hash: &ContentHash) -> bool {
        fs::try_exists(self.object_path(hash)).await.unwrap_or(false)
    }

    /// List all stored object hashes
    pub async fn list(&self) -> Result<Vec<ContentHash>> {
        let mut hashes = Vec::new();
        let mut shards = fs::read_dir(self.root_path.join("objects")).await?;
        while let Some(shard) = shards.next_entry().await? {
            if !shard.file_type().await?.is_dir() {
                continue;
            }
            let mut objects = fs::read_dir(shard.path()).await?;
            while let Some(object) = objects.next_entry().await? {
                let name = object.file_name();
                if let Some(hash) = name.to_str().and_then(|n| ContentHash::from_hex(n).ok()) {
                    hashes.push(hash);
                }
            }
        }
        hashes.sort();
        Ok(hashes)
    }

    /// Delete every object not in `keep`. Returns the number removed.
    pub async fn prune(&self, keep: &HashSet<ContentHash>) -> Result<usize> {
        let mut removed = 0;
        for hash in self.list().await? {
            if keep.contains(&hash) {
                continue;
            }
            fs::remove_file(self.object_path(&hash)).await?;
            removed += 1;
        }
        if removed > 0 {
            debug!("Pruned {} unreferenced objects", removed);
        }
        Ok(removed)
    }
}
