//! Keyed async locks.
//!
//! The controller serializes attach/detach/delete/resize per volume id
//! and the node serializes stage/unstage per staging path and
//! publish/unpublish per target path. A lock per key keeps operations on
//! different volumes fully parallel.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Debug, Default)]
pub(crate) struct KeyedLocks {
    inner: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl KeyedLocks {
    pub(crate) fn new() -> KeyedLocks {
        KeyedLocks::default()
    }

    /// Take the lock for `key`, creating it on first use. Entries are
    /// never reaped: the live key set is bounded by the volumes a
    /// cluster actually uses.
    pub(crate) async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let entry = {
            let mut map = self.inner.lock().expect("not poisoned");
            map.entry(key.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        entry.lock_owned().await
    }
}
