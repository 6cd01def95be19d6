//! Buffer pool: fixed-capacity LRU page cache with pin counts.
//!
//! Each heap file owns one pool. Frames hold pages behind `Arc<RwLock<..>>`
//! so callers can read or mutate a pinned page without holding the pool
//! mutex. A pinned frame is never evicted; `unpin` decrements the count and
//! OR-merges the caller's dirty bit into the frame.
//!
//! The pool itself knows nothing about files. Reads and flush writes go
//! through the [`PageStore`] handle the caller passes in, which keeps the
//! pool ↔ heap-file relationship acyclic.
//!
//! Lock discipline: the single pool mutex is held across `read_page` /
//! `write_page` I/O. Callers must not invoke pool methods while holding a
//! page's own lock.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::trace;

use crate::common::PageId;
use crate::error::{DbError, Result};
use crate::storage::page::Page;

/// Default number of frames (≈1 MiB of 8 KiB pages).
pub const DEFAULT_POOL_SIZE: usize = 128;

/// Backing store a pool reads from and flushes to.
pub trait PageStore {
    /// Reads one page image from the store, verifying its checksum.
    fn read_page(&self, page_id: PageId) -> Result<Page>;

    /// Writes one page image back to the store.
    fn write_page(&self, page: &Page) -> Result<()>;
}

struct Frame {
    page: Arc<RwLock<Page>>,
    pin_count: u32,
    dirty: bool,
}

struct PoolInner {
    frames: HashMap<PageId, Frame>,
    /// LRU order, most recently used at the front.
    lru: VecDeque<PageId>,
}

impl PoolInner {
    fn touch(&mut self, page_id: PageId) {
        if let Some(pos) = self.lru.iter().position(|id| *id == page_id) {
            self.lru.remove(pos);
        }
        self.lru.push_front(page_id);
    }
}

/// LRU page cache for one heap file.
pub struct BufferPool {
    capacity: usize,
    inner: Mutex<PoolInner>,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Hit/miss counters exposed for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPoolStats {
    pub hits: u64,
    pub misses: u64,
    pub resident: usize,
    pub capacity: usize,
}

impl BufferPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(PoolInner {
                frames: HashMap::new(),
                lru: VecDeque::new(),
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns the page pinned. Every successful call must be paired with
    /// exactly one [`BufferPool::unpin`] on all exit paths.
    pub fn get_page(&self, store: &dyn PageStore, page_id: PageId) -> Result<Arc<RwLock<Page>>> {
        let mut inner = self.inner.lock();

        if let Some(frame) = inner.frames.get_mut(&page_id) {
            frame.pin_count += 1;
            let page = frame.page.clone();
            inner.touch(page_id);
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(page);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        if inner.frames.len() >= self.capacity {
            self.evict_one(&mut inner, store)?;
        }

        let page = Arc::new(RwLock::new(store.read_page(page_id)?));
        inner.frames.insert(
            page_id,
            Frame {
                page: page.clone(),
                pin_count: 1,
                dirty: false,
            },
        );
        inner.lru.push_front(page_id);
        Ok(page)
    }

    /// Inserts a freshly allocated page into the pool, pinned, without a
    /// store read. The caller has already written the empty image to disk.
    pub fn put_new_page(&self, store: &dyn PageStore, page: Page) -> Result<Arc<RwLock<Page>>> {
        let mut inner = self.inner.lock();
        if inner.frames.len() >= self.capacity {
            self.evict_one(&mut inner, store)?;
        }

        let page_id = page.page_id;
        let page = Arc::new(RwLock::new(page));
        inner.frames.insert(
            page_id,
            Frame {
                page: page.clone(),
                pin_count: 1,
                dirty: false,
            },
        );
        inner.lru.push_front(page_id);
        Ok(page)
    }

    /// Drops one pin and merges the dirty bit.
    pub fn unpin(&self, page_id: PageId, dirty: bool) {
        let mut inner = self.inner.lock();
        if let Some(frame) = inner.frames.get_mut(&page_id) {
            frame.pin_count = frame.pin_count.saturating_sub(1);
            frame.dirty |= dirty;
        }
    }

    /// Flushes a single page if resident and dirty.
    pub fn flush_page(&self, store: &dyn PageStore, page_id: PageId) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(frame) = inner.frames.get_mut(&page_id) {
            if frame.dirty {
                let mut page = frame.page.write();
                store.write_page(&page)?;
                page.clear_dirty();
                frame.dirty = false;
            }
        }
        Ok(())
    }

    /// Flushes every dirty resident page.
    pub fn flush_all(&self, store: &dyn PageStore) -> Result<()> {
        let mut inner = self.inner.lock();
        let ids: Vec<PageId> = inner.frames.keys().copied().collect();
        for page_id in ids {
            let frame = inner.frames.get_mut(&page_id).expect("frame disappeared");
            if frame.dirty {
                let mut page = frame.page.write();
                store.write_page(&page)?;
                page.clear_dirty();
                frame.dirty = false;
            }
        }
        Ok(())
    }

    /// IDs of currently dirty resident pages (checkpoint bookkeeping).
    pub fn dirty_page_ids(&self) -> Vec<PageId> {
        let inner = self.inner.lock();
        inner
            .frames
            .iter()
            .filter(|(_, f)| f.dirty)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Discards every frame without flushing. Only valid when the caller
    /// has made the on-disk state authoritative (truncate).
    pub fn discard_all(&self) {
        let mut inner = self.inner.lock();
        inner.frames.clear();
        inner.lru.clear();
    }

    pub fn stats(&self) -> BufferPoolStats {
        BufferPoolStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            resident: self.inner.lock().frames.len(),
            capacity: self.capacity,
        }
    }

    /// Evicts the LRU-most unpinned frame, flushing it first if dirty.
    fn evict_one(&self, inner: &mut PoolInner, store: &dyn PageStore) -> Result<()> {
        let victim = inner
            .lru
            .iter()
            .rev()
            .copied()
            .find(|id| {
                inner
                    .frames
                    .get(id)
                    .map(|f| f.pin_count == 0)
                    .unwrap_or(false)
            })
            .ok_or(DbError::AllPinned {
                capacity: self.capacity,
            })?;

        let frame = inner.frames.remove(&victim).expect("victim frame missing");
        if frame.dirty {
            let mut page = frame.page.write();
            store.write_page(&page)?;
            page.clear_dirty();
        }
        if let Some(pos) = inner.lru.iter().position(|id| *id == victim) {
            inner.lru.remove(pos);
        }
        trace!(page_id = victim, "evicted page from buffer pool");
        Ok(())
    }
}
