//! Heap file: a table's pages on disk.
//!
//! One file per table, a back-to-back sequence of 8192-byte pages with
//! dense IDs `0..page_count`. All page traffic goes through the file's own
//! buffer pool; the free-space map picks insert targets and is rebuilt by a
//! scan when the file is opened.
//!
//! A reader-writer lock guards the file handle and page count: reads share
//! (positioned reads via `FileExt`), extension and page writes exclude.
//! Checksums are verified on every read from disk; a mismatch surfaces as
//! a corruption error and fails the read.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::debug;

use crate::buffer::{BufferPool, BufferPoolStats, PageStore};
use crate::common::{Lsn, PageId, SlotId, TupleId, PAGE_SIZE};
use crate::error::{DbError, Result};
use crate::storage::fsm::FreeSpaceMap;
use crate::storage::page::{verify_checksum, Page, MAX_TUPLE_SIZE, SLOT_SIZE};

struct FileState {
    file: File,
    page_count: u32,
}

/// Raw positioned page I/O over the heap file. Implements [`PageStore`] so
/// the buffer pool can read and flush without a back-pointer to the heap.
struct FileStore {
    path: PathBuf,
    state: RwLock<FileState>,
}

impl FileStore {
    fn page_count(&self) -> u32 {
        self.state.read().page_count
    }
}

impl PageStore for FileStore {
    fn read_page(&self, page_id: PageId) -> Result<Page> {
        let state = self.state.read();
        if page_id >= state.page_count {
            return Err(DbError::Internal(format!(
                "read of page {} past end of {} ({} pages)",
                page_id,
                self.path.display(),
                state.page_count
            )));
        }

        let mut buf = vec![0u8; PAGE_SIZE];
        state
            .file
            .read_exact_at(&mut buf, page_id as u64 * PAGE_SIZE as u64)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    DbError::corruption(format!(
                        "short read of page {} in {}",
                        page_id,
                        self.path.display()
                    ))
                } else {
                    DbError::Io(e)
                }
            })?;

        if !verify_checksum(&buf) {
            return Err(DbError::corruption(format!(
                "checksum mismatch on page {} in {}",
                page_id,
                self.path.display()
            )));
        }
        Page::deserialize(&buf)
    }

    fn write_page(&self, page: &Page) -> Result<()> {
        let state = self.state.write();
        state
            .file
            .write_all_at(&page.serialize(), page.page_id as u64 * PAGE_SIZE as u64)?;
        Ok(())
    }
}

/// A table's paged heap file with its buffer pool and free-space map.
pub struct HeapFile {
    store: FileStore,
    pool: BufferPool,
    fsm: FreeSpaceMap,
}

impl HeapFile {
    /// Opens (or creates) a heap file and rebuilds the free-space map by
    /// scanning existing pages.
    pub fn open(path: impl AsRef<Path>, pool_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let len = file.metadata()?.len();
        if len % PAGE_SIZE as u64 != 0 {
            return Err(DbError::corruption(format!(
                "{} is {} bytes, not a multiple of the page size",
                path.display(),
                len
            )));
        }

        let heap = Self {
            store: FileStore {
                path,
                state: RwLock::new(FileState {
                    file,
                    page_count: (len / PAGE_SIZE as u64) as u32,
                }),
            },
            pool: BufferPool::new(pool_size),
            fsm: FreeSpaceMap::new(),
        };
        heap.rebuild_fsm()?;
        Ok(heap)
    }

    pub fn path(&self) -> &Path {
        &self.store.path
    }

    pub fn page_count(&self) -> u32 {
        self.store.page_count()
    }

    pub fn pool_stats(&self) -> BufferPoolStats {
        self.pool.stats()
    }

    /// IDs of dirty cached pages, for checkpoint records.
    pub fn dirty_page_ids(&self) -> Vec<PageId> {
        self.pool.dirty_page_ids()
    }

    /// Extends the file by one zero-initialized page and returns its ID.
    pub fn allocate_page(&self) -> Result<PageId> {
        let page_id = {
            let mut state = self.store.state.write();
            let page_id = state.page_count;
            let page = Page::new(page_id);
            state
                .file
                .write_all_at(&page.serialize(), page_id as u64 * PAGE_SIZE as u64)?;
            state.page_count += 1;
            page_id
        };

        let page = Page::new(page_id);
        self.fsm.update(page_id, page.free_space());
        self.pool.put_new_page(&self.store, page)?;
        self.pool.unpin(page_id, false);
        debug!(path = %self.store.path.display(), page_id, "allocated heap page");
        Ok(page_id)
    }

    /// Inserts a tuple wherever it fits: free-space-map hint first, then a
    /// full scan (compacting pages whose dead space would make room), then
    /// a fresh page.
    pub fn insert_tuple(&self, tuple: &[u8]) -> Result<TupleId> {
        let needed = tuple.len() + SLOT_SIZE;

        if let Some(page_id) = self.fsm.find_page_with_space(needed) {
            if let Some(tid) = self.try_insert_on(page_id, tuple)? {
                return Ok(tid);
            }
        }

        for page_id in 0..self.page_count() {
            if let Some(tid) = self.try_insert_on(page_id, tuple)? {
                return Ok(tid);
            }
        }

        let page_id = self.allocate_page()?;
        match self.try_insert_on(page_id, tuple)? {
            Some(tid) => Ok(tid),
            // A fresh page can only reject a tuple that can never fit.
            None => Err(DbError::TupleTooLarge {
                size: tuple.len(),
                max: MAX_TUPLE_SIZE,
            }),
        }
    }

    /// Returns a copy of the tuple bytes at `tid`.
    pub fn get_tuple(&self, tid: TupleId) -> Result<Vec<u8>> {
        self.with_page(tid.page_id, |page| {
            page.get_tuple(tid.slot).map(|b| b.to_vec())
        })?
    }

    /// In-place tuple overwrite; fails with `TooLargeForInPlace` when the
    /// replacement grew.
    pub fn update_tuple(&self, tid: TupleId, tuple: &[u8]) -> Result<()> {
        self.with_page_mut(tid.page_id, |page| page.update_tuple(tid.slot, tuple))?
    }

    /// Marks the slot at `tid` dead.
    pub fn delete_tuple(&self, tid: TupleId) -> Result<()> {
        self.with_page_mut(tid.page_id, |page| page.delete_tuple(tid.slot))?
    }

    /// Puts a tuple image back at an exact location (recovery/undo path),
    /// growing the file if the page does not exist yet.
    pub fn restore_tuple(&self, tid: TupleId, tuple: &[u8]) -> Result<()> {
        self.ensure_page_exists(tid.page_id)?;
        self.with_page_mut(tid.page_id, |page| page.restore_tuple(tid.slot, tuple))?
    }

    /// Replaces a tuple image at an exact location regardless of size
    /// (recovery path for updates).
    pub fn replace_tuple(&self, tid: TupleId, tuple: &[u8]) -> Result<()> {
        self.ensure_page_exists(tid.page_id)?;
        self.with_page_mut(tid.page_id, |page| page.replace_tuple(tid.slot, tuple))?
    }

    /// Forces a tuple image into an exact location: live slots are
    /// replaced, dead or missing slots revived. Recovery uses this because
    /// it cannot know how much of the original write reached disk.
    pub fn force_tuple(&self, tid: TupleId, tuple: &[u8]) -> Result<()> {
        self.ensure_page_exists(tid.page_id)?;
        self.with_page_mut(tid.page_id, |page| {
            match page.slot(tid.slot) {
                Some(entry) if !entry.is_dead() => page.replace_tuple(tid.slot, tuple),
                _ => page.restore_tuple(tid.slot, tuple),
            }
        })?
    }

    /// Visits every live tuple in page-then-slot order. Dead slots are
    /// skipped silently.
    pub fn scan<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(TupleId, &[u8]) -> Result<()>,
    {
        for page_id in 0..self.page_count() {
            self.with_page(page_id, |page| {
                for slot in 0..page.slot_count() {
                    let entry = page.slot(slot as SlotId).expect("slot within count");
                    if entry.is_dead() {
                        continue;
                    }
                    f(TupleId::new(page_id, slot as SlotId), page.get_tuple(slot)?)?;
                }
                Ok::<(), DbError>(())
            })??;
        }
        Ok(())
    }

    /// Runs `f` with shared access to a pinned page. The pin is dropped on
    /// every exit path.
    pub fn with_page<R>(&self, page_id: PageId, f: impl FnOnce(&Page) -> R) -> Result<R> {
        let page = self.pool.get_page(&self.store, page_id)?;
        let out = f(&page.read());
        self.pool.unpin(page_id, false);
        Ok(out)
    }

    /// Runs `f` with exclusive access to a pinned page, marking it dirty
    /// and refreshing its free-space hint afterwards.
    pub fn with_page_mut<R>(&self, page_id: PageId, f: impl FnOnce(&mut Page) -> R) -> Result<R> {
        let page = self.pool.get_page(&self.store, page_id)?;
        let (out, free) = {
            let mut guard = page.write();
            let out = f(&mut guard);
            (out, guard.free_space())
        };
        self.fsm.update(page_id, free);
        self.pool.unpin(page_id, true);
        Ok(out)
    }

    /// Stamps the page LSN after a WAL append.
    pub fn set_page_lsn(&self, page_id: PageId, lsn: Lsn) -> Result<()> {
        self.with_page_mut(page_id, |page| {
            if lsn > page.lsn {
                page.lsn = lsn;
            }
            page.mark_dirty();
        })
    }

    /// Reads the page LSN (recovery's redo comparison).
    pub fn page_lsn(&self, page_id: PageId) -> Result<Lsn> {
        self.with_page(page_id, |page| page.lsn)
    }

    /// Flushes all dirty cached pages to disk.
    pub fn flush(&self) -> Result<()> {
        self.pool.flush_all(&self.store)
    }

    /// Drops every page: the file is truncated to zero length and caches
    /// are reset.
    pub fn truncate(&self) -> Result<()> {
        let mut state = self.store.state.write();
        state.file.set_len(0)?;
        state.page_count = 0;
        drop(state);
        self.pool.discard_all();
        self.fsm.clear();
        Ok(())
    }

    /// Flushes and durably syncs the file.
    pub fn close(&self) -> Result<()> {
        self.flush()?;
        let state = self.store.state.read();
        state.file.sync_all()?;
        Ok(())
    }

    /// Closes and removes the file from disk (DROP TABLE).
    pub fn delete(self) -> Result<()> {
        let path = self.store.path.clone();
        drop(self);
        std::fs::remove_file(&path)?;
        Ok(())
    }

    fn rebuild_fsm(&self) -> Result<()> {
        self.fsm.clear();
        for page_id in 0..self.page_count() {
            let free = self.with_page(page_id, |page| page.free_space())?;
            self.fsm.update(page_id, free);
        }
        Ok(())
    }

    /// Grows the file until `page_id` exists (recovery may replay writes
    /// to pages that never reached disk).
    pub fn ensure_page_exists(&self, page_id: PageId) -> Result<()> {
        while self.page_count() <= page_id {
            self.allocate_page()?;
        }
        Ok(())
    }

    /// Attempts an insert on one page, compacting first when dead space
    /// would make the tuple fit. Returns `None` when the page cannot take
    /// the tuple even after compaction.
    fn try_insert_on(&self, page_id: PageId, tuple: &[u8]) -> Result<Option<TupleId>> {
        let needed = tuple.len() + SLOT_SIZE;
        let page = self.pool.get_page(&self.store, page_id)?;
        let (result, free) = {
            let mut guard = page.write();
            if !guard.can_fit(tuple.len()) && guard.free_space() + guard.reclaimable_space() >= needed
            {
                guard.compact();
            }
            let result = if guard.can_fit(tuple.len()) {
                guard.insert_tuple(tuple).map(Some)
            } else {
                Ok(None)
            };
            (result, guard.free_space())
        };
        self.fsm.update(page_id, free);
        self.pool.unpin(page_id, matches!(result, Ok(Some(_))));

        Ok(result?.map(|slot| TupleId::new(page_id, slot)))
    }
}
