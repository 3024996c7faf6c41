use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Per-path mutual exclusion shared by the indexer and the apply paths.
///
/// Writers to a path take its lock for the whole read-hash-store sequence, so
/// a local change and an incoming remote version are never interleaved.
#[derive(Clone, Default)]
pub struct PathLocks {
    inner: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

/// Held while a path is being mutated
pub struct PathGuard {
    _guard: OwnedMutexGuard<()>,
}

impl PathLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, path: &str) -> PathGuard {
        let slot = {
            let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            // Entries nobody else holds a handle to are idle
            map.retain(|p, slot| p == path || Arc::strong_count(slot) > 1);
            map.entry(path.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        PathGuard {
            _guard: slot.lock_owned().await,
        }
    }

    /// Number of tracked paths
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
