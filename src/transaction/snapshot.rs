//! Snapshots and MVCC visibility.
//!
//! A snapshot freezes what a reader may see: `xmin` (oldest transaction
//! active when it was taken), `xmax` (first transaction ID *not* visible),
//! and the set of transaction IDs that were in flight. Tuple headers carry
//! the creating (`xmin`) and deleting (`xmax`) transaction IDs; visibility
//! is a pure function of header and snapshot.

use std::collections::HashSet;

use crate::common::{TransactionId, INVALID_TXN_ID};
use crate::storage::tuple::TupleHeader;

/// A point-in-time view for consistent reads.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Oldest transaction that was active when the snapshot was taken.
    pub xmin: TransactionId,
    /// First transaction ID invisible to this snapshot.
    pub xmax: TransactionId,
    /// Transactions in flight at snapshot time (excluding the owner).
    pub active_ids: HashSet<TransactionId>,
}

impl Snapshot {
    pub fn new(
        xmin: TransactionId,
        xmax: TransactionId,
        active_ids: HashSet<TransactionId>,
    ) -> Self {
        Self {
            xmin,
            xmax,
            active_ids,
        }
    }

    /// Decides whether a tuple is visible to this snapshot.
    ///
    /// The creator must have committed before the snapshot started:
    /// `xmin != 0`, `xmin < self.xmax`, and `xmin` not active. The deleter,
    /// if any, must *not* have committed before the snapshot started:
    /// `xmax == 0`, or `xmax >= self.xmax`, or `xmax` still active.
    pub fn is_visible(&self, header: &TupleHeader) -> bool {
        if header.xmin == INVALID_TXN_ID {
            return false;
        }
        if header.xmin >= self.xmax || self.active_ids.contains(&header.xmin) {
            return false;
        }

        header.xmax == INVALID_TXN_ID
            || header.xmax >= self.xmax
            || self.active_ids.contains(&header.xmax)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(xmin: TransactionId, xmax: TransactionId) -> TupleHeader {
        TupleHeader {
            length: 12,
            null_bitmap: 0,
            xmin,
            xmax,
        }
    }

    fn snapshot(xmax: TransactionId, active: &[TransactionId]) -> Snapshot {
        let active_ids: HashSet<_> = active.iter().copied().collect();
        let xmin = active_ids.iter().min().copied().unwrap_or(xmax);
        Snapshot::new(xmin, xmax, active_ids)
    }

    #[test]
    fn test_committed_insert_is_visible() {
        let snap = snapshot(10, &[]);
        assert!(snap.is_visible(&header(5, 0)));
    }

    #[test]
    fn test_unset_xmin_is_invisible() {
        let snap = snapshot(10, &[]);
        assert!(!snap.is_visible(&header(0, 0)));
    }

    #[test]
    fn test_concurrent_writer_is_invisible() {
        // Transaction 5 was still active when the snapshot was taken.
        let snap = snapshot(10, &[5]);
        assert!(!snap.is_visible(&header(5, 0)));
    }

    #[test]
    fn test_future_writer_is_invisible() {
        let snap = snapshot(10, &[]);
        assert!(!snap.is_visible(&header(10, 0)));
        assert!(!snap.is_visible(&header(11, 0)));
    }

    #[test]
    fn test_committed_delete_hides_tuple() {
        let snap = snapshot(10, &[]);
        assert!(!snap.is_visible(&header(3, 7)));
    }

    #[test]
    fn test_uncommitted_delete_keeps_tuple_visible() {
        // Deleter 7 still active: the tuple remains visible to this reader.
        let snap = snapshot(10, &[7]);
        assert!(snap.is_visible(&header(3, 7)));
    }

    #[test]
    fn test_delete_by_future_transaction_keeps_tuple_visible() {
        let snap = snapshot(10, &[]);
        assert!(snap.is_visible(&header(3, 12)));
    }
}
