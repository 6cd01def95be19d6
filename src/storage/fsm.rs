//! Free-space map.
//!
//! In-memory hint of free bytes per heap page, rebuilt from a scan when the
//! heap file is opened. The hint may be stale (another writer can consume
//! the space between lookup and insert), so the insert path always re-checks
//! `can_fit` on the pinned page.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::common::PageId;

/// Per-page free-byte hints with first-fit lookup.
#[derive(Debug, Default)]
pub struct FreeSpaceMap {
    inner: Mutex<HashMap<PageId, usize>>,
}

impl FreeSpaceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the current free-byte count for a page.
    pub fn update(&self, page_id: PageId, free_bytes: usize) {
        self.inner.lock().insert(page_id, free_bytes);
    }

    /// Forgets a page (used when a heap file is truncated).
    pub fn remove(&self, page_id: PageId) {
        self.inner.lock().remove(&page_id);
    }

    /// Returns some page with at least `needed` free bytes, or `None` when
    /// no tracked page qualifies.
    pub fn find_page_with_space(&self, needed: usize) -> Option<PageId> {
        self.inner
            .lock()
            .iter()
            .find(|(_, free)| **free >= needed)
            .map(|(page_id, _)| *page_id)
    }

    /// Drops every hint. Called before a rebuild scan.
    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
