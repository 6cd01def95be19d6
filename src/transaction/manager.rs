//! Transaction lifecycle management.
//!
//! Assigns transaction IDs (starting at 2; 0 is invalid and 1 is reserved
//! for bootstrap), tracks the active set, and builds snapshots atomically
//! with `begin`. Committed IDs are remembered with their commit time so the
//! vacuum horizon can be computed, and can be purged with
//! [`TransactionManager::cleanup_old`].
//!
//! The next-ID counter persists to `txn_meta.dat` (4 bytes little-endian)
//! on close and is reloaded on open; WAL recovery may bump it further so
//! new IDs never collide with replayed ones.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;
use tracing::debug;

use crate::common::{TransactionId, FIRST_TXN_ID};
use crate::error::{DbError, Result};
use crate::transaction::snapshot::Snapshot;

/// File the next-ID counter persists to, under the data directory.
pub const TXN_META_FILE: &str = "txn_meta.dat";

/// Lifecycle states of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    Aborted,
}

/// One transaction's bookkeeping.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: TransactionId,
    pub state: TransactionState,
    pub start_time: SystemTime,
    pub snapshot: Snapshot,
}

struct ManagerInner {
    next_id: TransactionId,
    active: HashMap<TransactionId, Transaction>,
    /// Commit instants, kept for the vacuum horizon until purged.
    committed: HashMap<TransactionId, Instant>,
}

/// Assigns IDs, tracks the active set, and commits/aborts transactions.
pub struct TransactionManager {
    meta_path: PathBuf,
    inner: Mutex<ManagerInner>,
}

impl TransactionManager {
    /// Opens the manager, reloading the persisted next-ID counter when
    /// `txn_meta.dat` exists.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let meta_path = data_dir.as_ref().join(TXN_META_FILE);
        let next_id = match std::fs::read(&meta_path) {
            Ok(bytes) if bytes.len() == 4 => {
                u32::from_le_bytes(bytes[..4].try_into().unwrap()).max(FIRST_TXN_ID)
            }
            Ok(bytes) => {
                return Err(DbError::corruption(format!(
                    "{} is {} bytes, expected 4",
                    meta_path.display(),
                    bytes.len()
                )))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => FIRST_TXN_ID,
            Err(e) => return Err(DbError::Io(e)),
        };

        debug!(next_id, "opened transaction manager");
        Ok(Self {
            meta_path,
            inner: Mutex::new(ManagerInner {
                next_id,
                active: HashMap::new(),
                committed: HashMap::new(),
            }),
        })
    }

    /// Starts a transaction, building its snapshot atomically with the ID
    /// assignment.
    ///
    /// The snapshot's `xmax` is the counter value after assignment, so the
    /// transaction sees its own writes; the active set excludes it for the
    /// same reason.
    pub fn begin(&self) -> Transaction {
        let mut inner = self.inner.lock();

        let id = inner.next_id;
        inner.next_id += 1;

        let active_ids: HashSet<TransactionId> = inner.active.keys().copied().collect();
        let xmin = active_ids.iter().min().copied().unwrap_or(id);
        let snapshot = Snapshot::new(xmin, id + 1, active_ids);

        let txn = Transaction {
            id,
            state: TransactionState::Active,
            start_time: SystemTime::now(),
            snapshot,
        };
        inner.active.insert(id, txn.clone());
        txn
    }

    /// Builds a read-only snapshot without starting a transaction.
    pub fn current_snapshot(&self) -> Snapshot {
        let inner = self.inner.lock();
        let active_ids: HashSet<TransactionId> = inner.active.keys().copied().collect();
        let xmin = active_ids.iter().min().copied().unwrap_or(inner.next_id);
        Snapshot::new(xmin, inner.next_id, active_ids)
    }

    /// Commits a transaction, removing it from the active set.
    pub fn commit(&self, id: TransactionId) -> Result<()> {
        let mut inner = self.inner.lock();
        inner
            .active
            .remove(&id)
            .ok_or(DbError::NoTransaction)?;
        inner.committed.insert(id, Instant::now());
        Ok(())
    }

    /// Aborts a transaction, removing it from the active set.
    pub fn abort(&self, id: TransactionId) -> Result<()> {
        let mut inner = self.inner.lock();
        inner
            .active
            .remove(&id)
            .ok_or(DbError::NoTransaction)?;
        Ok(())
    }

    /// True while `id` is in the active set.
    pub fn is_active(&self, id: TransactionId) -> bool {
        self.inner.lock().active.contains_key(&id)
    }

    /// IDs currently active, unordered.
    pub fn active_ids(&self) -> Vec<TransactionId> {
        self.inner.lock().active.keys().copied().collect()
    }

    /// Oldest transaction ID still needed for visibility: the minimum
    /// active ID, or the next ID when nothing is active.
    pub fn horizon(&self) -> TransactionId {
        let inner = self.inner.lock();
        inner
            .active
            .keys()
            .min()
            .copied()
            .unwrap_or(inner.next_id)
    }

    /// Ensures future IDs are strictly greater than `seen` (recovery hook).
    pub fn bump_next_id(&self, seen: TransactionId) {
        let mut inner = self.inner.lock();
        if seen >= inner.next_id {
            inner.next_id = seen + 1;
        }
    }

    /// Forgets committed-transaction bookkeeping older than `older_than`.
    /// Returns how many entries were purged.
    pub fn cleanup_old(&self, older_than: Duration) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.committed.len();
        inner
            .committed
            .retain(|_, committed_at| committed_at.elapsed() < older_than);
        before - inner.committed.len()
    }

    /// The ID the next `begin` will receive.
    pub fn next_id(&self) -> TransactionId {
        self.inner.lock().next_id
    }

    /// Persists the next-ID counter to `txn_meta.dat`.
    pub fn persist(&self) -> Result<()> {
        let next_id = self.inner.lock().next_id;
        if let Some(parent) = self.meta_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.meta_path, next_id.to_le_bytes())?;
        Ok(())
    }
}
