//! stratadb: a single-node relational storage kernel.
//!
//! Durable, transactionally-consistent tabular storage: slotted heap pages
//! behind an LRU buffer pool, a segmented write-ahead log with ARIES-style
//! recovery, snapshot-isolation MVCC with a vacuum reclaimer, order-128
//! B+Tree indexes with on-disk persistence, and a JSON system catalog,
//! all orchestrated by [`engine::StorageEngine`].
//!
//! SQL parsing, query shaping, access control and the network surface are
//! external collaborators: they hand the engine an already-structured
//! [`engine::Statement`] and post-process the rows it returns.

pub mod buffer;
pub mod catalog;
pub mod common;
pub mod engine;
pub mod error;
pub mod index;
pub mod recovery;
pub mod storage;
pub mod transaction;
pub mod vacuum;
pub mod wal;

use std::path::PathBuf;

pub use common::{PageId, Row, SlotId, TransactionId, TupleId, Value, PAGE_SIZE};
pub use engine::{QueryResult, Statement, StorageEngine};
pub use error::{DbError, Result};

/// Storage engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory for all on-disk state.
    pub data_dir: PathBuf,
    /// Write-ahead logging (and with it crash recovery).
    pub enable_wal: bool,
    /// Buffer pool frames per heap file.
    pub buffer_pool_size: usize,
    /// WAL segment size in bytes.
    pub wal_segment_size: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            enable_wal: true,
            buffer_pool_size: buffer::DEFAULT_POOL_SIZE,
            wal_segment_size: wal::DEFAULT_SEGMENT_SIZE,
        }
    }
}

impl Config {
    /// Configuration rooted at `data_dir` with defaults elsewhere.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    pub fn without_wal(mut self) -> Self {
        self.enable_wal = false;
        self
    }
}
