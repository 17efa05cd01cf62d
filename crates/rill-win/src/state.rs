//! Lazily-populated per-side join state: one slice store per key.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rill_core::WatermarkTs;

use crate::slice::SliceStore;
use crate::JoinKey;

/// `key -> slice store` for one side of a join. Stores are created on first
/// insert of a key.
#[derive(Debug, Default)]
pub struct SideState {
    stores: Mutex<HashMap<JoinKey, Arc<SliceStore>>>,
}

impl SideState {
    pub fn new() -> Self {
        Self::default()
    }

    /// The store for `key`, created if absent.
    pub fn store(&self, key: JoinKey) -> Arc<SliceStore> {
        self.stores
            .lock()
            .entry(key)
            .or_insert_with(|| Arc::new(SliceStore::new()))
            .clone()
    }

    pub fn get(&self, key: JoinKey) -> Option<Arc<SliceStore>> {
        self.stores.lock().get(&key).cloned()
    }

    /// Keys in ascending order, the canonical iteration order for triggers.
    pub fn keys(&self) -> Vec<JoinKey> {
        let mut keys: Vec<_> = self.stores.lock().keys().copied().collect();
        keys.sort_unstable();
        keys
    }

    /// Earliest slice start across all keys, used to seed the handler's
    /// last-watermark on the first trigger.
    pub fn min_slice_start(&self) -> Option<WatermarkTs> {
        self.stores
            .lock()
            .values()
            .filter_map(|store| store.first_slice_start())
            .min()
    }

    /// Largest slice end across all keys, the watermark that closes every
    /// in-flight window at graceful shutdown.
    pub fn max_slice_end(&self) -> Option<WatermarkTs> {
        self.stores
            .lock()
            .values()
            .filter_map(|store| store.last_slice_end())
            .max()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.lock().is_empty()
    }
}
