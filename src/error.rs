//! Crate-wide error types.
//!
//! The kernel reports every failure through [`DbError`], defined with
//! `thiserror` so call sites can propagate with `?` and callers can match
//! on semantic categories (not-found, already-exists, corruption, capacity,
//! transaction-state, ...).
//!
//! Page-level capacity failures get their own variants because the heap
//! insert path branches on them: `NoSpace` sends the insert to another page,
//! `TooLargeForInPlace` turns an update into a delete+insert, and
//! `TupleTooLarge` is terminal.

use std::io;

use thiserror::Error;

use crate::common::{PageId, SlotId, TransactionId};

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DbError>;

/// Comprehensive error type for storage kernel operations.
#[derive(Debug, Error)]
pub enum DbError {
    /// Database, table, column or tuple does not exist.
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    /// Duplicate database/table/index name.
    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: &'static str, name: String },

    /// Uniqueness or not-null violation detected by the engine's
    /// pre-write constraint hooks.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// Checksum mismatch or undecodable on-disk structure.
    #[error("corruption: {0}")]
    Corruption(String),

    /// Underlying file I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Page cannot hold the tuple plus a slot entry right now.
    #[error("page {page_id} has no space for {needed} bytes ({free} free)")]
    NoSpace {
        page_id: PageId,
        needed: usize,
        free: usize,
    },

    /// Tuple can never fit in an empty page.
    #[error("tuple of {size} bytes exceeds page capacity of {max} bytes")]
    TupleTooLarge { size: usize, max: usize },

    /// Slot number out of range for the page's slot directory.
    #[error("invalid slot {slot} on page {page_id} ({slot_count} slots)")]
    InvalidSlot {
        page_id: PageId,
        slot: SlotId,
        slot_count: u16,
    },

    /// Slot exists but its tuple was deleted.
    #[error("slot {slot} on page {page_id} is dead")]
    SlotDead { page_id: PageId, slot: SlotId },

    /// In-place update would grow the tuple.
    #[error("in-place update on page {page_id} slot {slot} would grow tuple from {old} to {new} bytes")]
    TooLargeForInPlace {
        page_id: PageId,
        slot: SlotId,
        old: usize,
        new: usize,
    },

    /// Every buffer pool frame is pinned; nothing can be evicted.
    #[error("buffer pool full: all {capacity} frames are pinned")]
    AllPinned { capacity: usize },

    /// Key already present in a unique index.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// Commit/rollback issued with no transaction in progress.
    #[error("no transaction in progress")]
    NoTransaction,

    /// BEGIN issued while an explicit transaction is already open.
    #[error("transaction {0} already in progress")]
    TransactionInProgress(TransactionId),

    /// Engine used after `close()`.
    #[error("storage engine is closed")]
    Closed,

    /// Invariant breakage that indicates a bug rather than bad input.
    #[error("internal error: {0}")]
    Internal(String),
}

impl DbError {
    /// Creates a not-found error for a named object.
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        DbError::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Creates an already-exists error for a named object.
    pub fn already_exists(kind: &'static str, name: impl Into<String>) -> Self {
        DbError::AlreadyExists {
            kind,
            name: name.into(),
        }
    }

    /// Creates a corruption error with context.
    pub fn corruption(msg: impl Into<String>) -> Self {
        DbError::Corruption(msg.into())
    }

    /// Returns true if the error means "this page cannot take the write",
    /// i.e. the caller should try another page or compact this one.
    pub fn is_page_full(&self) -> bool {
        matches!(self, DbError::NoSpace { .. })
    }

    /// Returns true for errors that indicate on-disk damage.
    pub fn is_corruption(&self) -> bool {
        matches!(self, DbError::Corruption(_))
    }

    /// Returns true for transaction state-machine violations.
    pub fn is_transaction_state(&self) -> bool {
        matches!(
            self,
            DbError::NoTransaction | DbError::TransactionInProgress(_)
        )
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::Corruption(format!("catalog serialization: {}", err))
    }
}
