//! A thread-safe in-memory slot for the currently active [`ToggleSet`]. Readers (flag
//! evaluation) get an `Arc` snapshot that is not affected by later writes.
use std::sync::{Arc, PoisonError, RwLock};

use crate::snapshot::ToggleSet;

/// `SnapshotStore` provides a `Sync` storage for the active toggle set, allowing concurrent
/// access for readers and writers.
///
/// `ToggleSet` itself is immutable and can only be replaced completely.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    toggles: RwLock<Arc<ToggleSet>>,
}

impl SnapshotStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        SnapshotStore::default()
    }

    /// Get the currently active toggle set.
    pub fn get(&self) -> Arc<ToggleSet> {
        // A poisoned lock only means a writer panicked mid-swap; the slot still holds a complete
        // `Arc`, so keep serving it.
        let toggles = self.toggles.read().unwrap_or_else(PoisonError::into_inner);
        toggles.clone()
    }

    /// Replace the active toggle set, returning the previous one.
    pub fn set(&self, toggles: ToggleSet) -> Arc<ToggleSet> {
        // Constructing new value before requesting the lock to minimize lock span.
        let new_value = Arc::new(toggles);

        let mut slot = self.toggles.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *slot, new_value)
    }
}
