//! ARIES-style crash recovery.
//!
//! Three passes over the WAL, run before the engine accepts requests:
//!
//! 1. **Analysis**: find the last checkpoint, rebuild the set of
//!    transactions that were in flight at the crash (losers), and observe
//!    the maximum transaction ID so new IDs never collide.
//! 2. **Redo**: from the checkpoint's `redo_lsn` (or the log start),
//!    reapply every data record; the target skips pages whose LSN already
//!    reflects the record, and records whose table vanished from the
//!    catalog are skipped with a warning.
//! 3. **Undo**: walk each loser's records newest-first and compensate
//!    them, then log an Abort so the next recovery does not undo again.
//!
//! The heap-touching half of redo/undo lives behind [`RecoveryTarget`],
//! implemented by the engine, which owns the heap files and catalog.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{info, warn};

use crate::common::{Lsn, TransactionId};
use crate::error::Result;
use crate::wal::record::{
    CheckpointPayload, DeletePayload, InsertPayload, UpdatePayload, WalRecord, WalRecordType,
};
use crate::wal::WalManager;

/// Heap/catalog operations recovery needs from the engine.
///
/// Each method returns `Ok(false)` when the record references a table the
/// catalog no longer knows; the recovery manager downgrades that to a
/// warning and keeps replaying.
pub trait RecoveryTarget {
    /// Reapplies an insert when the page image predates `lsn`.
    fn redo_insert(&self, payload: &InsertPayload, lsn: Lsn) -> Result<bool>;
    /// Reapplies an update when the page image predates `lsn`.
    fn redo_update(&self, payload: &UpdatePayload, lsn: Lsn) -> Result<bool>;
    /// Reapplies a delete when the page image predates `lsn`.
    fn redo_delete(&self, payload: &DeletePayload, lsn: Lsn) -> Result<bool>;

    /// Compensates an insert: the slot is removed.
    fn undo_insert(&self, payload: &InsertPayload) -> Result<bool>;
    /// Compensates an update: the before-image is restored.
    fn undo_update(&self, payload: &UpdatePayload) -> Result<bool>;
    /// Compensates a delete: the deleted tuple is restored.
    fn undo_delete(&self, payload: &DeletePayload) -> Result<bool>;
}

/// Outcome of one recovery run.
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    pub records_scanned: usize,
    pub checkpoint_lsn: Option<Lsn>,
    pub redone: usize,
    pub skipped: usize,
    pub undone: usize,
    pub losers: Vec<TransactionId>,
    /// Highest transaction ID seen anywhere in the log.
    pub max_txn_id: TransactionId,
}

/// Drives the analysis/redo/undo passes and emits checkpoints.
pub struct RecoveryManager {
    wal: Arc<WalManager>,
}

impl RecoveryManager {
    pub fn new(wal: Arc<WalManager>) -> Self {
        Self { wal }
    }

    /// Runs full crash recovery against `target`.
    pub fn recover(&self, target: &dyn RecoveryTarget) -> Result<RecoveryReport> {
        let records = self.wal.read_records(0)?;
        let mut report = RecoveryReport {
            records_scanned: records.len(),
            ..RecoveryReport::default()
        };
        if records.is_empty() {
            return Ok(report);
        }

        // ---- Analysis ----
        let mut checkpoint: Option<(Lsn, CheckpointPayload)> = None;
        for record in &records {
            if record.record_type == WalRecordType::Checkpoint {
                checkpoint = Some((record.lsn, CheckpointPayload::decode(&record.data)?));
            }
        }

        let (checkpoint_lsn, mut active, redo_lsn) = match &checkpoint {
            Some((lsn, payload)) => (
                Some(*lsn),
                payload.active_txns.iter().copied().collect::<HashSet<_>>(),
                payload.redo_lsn,
            ),
            None => (None, HashSet::new(), 1),
        };
        report.checkpoint_lsn = checkpoint_lsn;

        let mut records_by_txn: HashMap<TransactionId, Vec<&WalRecord>> = HashMap::new();
        for record in &records {
            report.max_txn_id = report.max_txn_id.max(record.txn_id);
            if checkpoint_lsn.map_or(false, |c| record.lsn <= c) {
                continue;
            }
            match record.record_type {
                WalRecordType::Insert | WalRecordType::Update | WalRecordType::Delete => {
                    active.insert(record.txn_id);
                }
                WalRecordType::Commit | WalRecordType::Abort => {
                    active.remove(&record.txn_id);
                }
                WalRecordType::Checkpoint => {}
            }
        }
        // Collect the full per-transaction history for the undo walk.
        for record in &records {
            if record.record_type.is_data() && active.contains(&record.txn_id) {
                records_by_txn.entry(record.txn_id).or_default().push(record);
            }
        }

        report.losers = {
            let mut losers: Vec<_> = active.iter().copied().collect();
            losers.sort_unstable();
            losers
        };

        // ---- Redo ----
        for record in records.iter().filter(|r| r.lsn >= redo_lsn) {
            let applied = match record.record_type {
                WalRecordType::Insert => {
                    target.redo_insert(&InsertPayload::decode(&record.data)?, record.lsn)?
                }
                WalRecordType::Update => {
                    target.redo_update(&UpdatePayload::decode(&record.data)?, record.lsn)?
                }
                WalRecordType::Delete => {
                    target.redo_delete(&DeletePayload::decode(&record.data)?, record.lsn)?
                }
                _ => continue,
            };
            if applied {
                report.redone += 1;
            } else {
                warn!(
                    lsn = record.lsn,
                    txn = record.txn_id,
                    "skipping redo of record for missing table"
                );
                report.skipped += 1;
            }
        }

        // ---- Undo ----
        for txn_id in &report.losers {
            if let Some(txn_records) = records_by_txn.get(txn_id) {
                for record in txn_records.iter().rev() {
                    let undone = match record.record_type {
                        WalRecordType::Insert => {
                            target.undo_insert(&InsertPayload::decode(&record.data)?)?
                        }
                        WalRecordType::Update => {
                            target.undo_update(&UpdatePayload::decode(&record.data)?)?
                        }
                        WalRecordType::Delete => {
                            target.undo_delete(&DeletePayload::decode(&record.data)?)?
                        }
                        _ => continue,
                    };
                    if undone {
                        report.undone += 1;
                    } else {
                        warn!(
                            lsn = record.lsn,
                            txn = record.txn_id,
                            "skipping undo of record for missing table"
                        );
                        report.skipped += 1;
                    }
                }
            }
            // Close the loser so the next recovery does not undo it again.
            self.wal
                .append_record(*txn_id, WalRecordType::Abort, Vec::new())?;
        }
        if !report.losers.is_empty() {
            self.wal.sync()?;
        }

        info!(
            scanned = report.records_scanned,
            redone = report.redone,
            undone = report.undone,
            losers = report.losers.len(),
            "recovery complete"
        );
        Ok(report)
    }

    /// Appends a checkpoint record and syncs. The caller must have flushed
    /// the dirty pages it reports, which is what makes `redo_lsn` (the LSN
    /// the checkpoint itself receives) a safe redo starting point.
    pub fn create_checkpoint(
        &self,
        active_txns: Vec<TransactionId>,
        dirty_pages: Vec<u32>,
    ) -> Result<Lsn> {
        let payload = CheckpointPayload {
            redo_lsn: self.wal.current_lsn(),
            active_txns,
            dirty_pages,
        };
        let lsn = self
            .wal
            .append_record(0, WalRecordType::Checkpoint, payload.encode())?;
        self.wal.sync()?;
        info!(lsn, "checkpoint written");
        Ok(lsn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::TupleId;
    use parking_lot::Mutex;
    use tempfile::tempdir;

    /// Records every call; pretends table "ghost" is missing.
    #[derive(Default)]
    struct SpyTarget {
        calls: Mutex<Vec<String>>,
    }

    impl SpyTarget {
        fn log(&self, entry: String) {
            self.calls.lock().push(entry);
        }
    }

    impl RecoveryTarget for SpyTarget {
        fn redo_insert(&self, p: &InsertPayload, lsn: Lsn) -> Result<bool> {
            if p.table == "ghost" {
                return Ok(false);
            }
            self.log(format!("redo_insert {} @{}", p.tid, lsn));
            Ok(true)
        }

        fn redo_update(&self, p: &UpdatePayload, lsn: Lsn) -> Result<bool> {
            self.log(format!("redo_update {} @{}", p.tid, lsn));
            Ok(true)
        }

        fn redo_delete(&self, p: &DeletePayload, lsn: Lsn) -> Result<bool> {
            self.log(format!("redo_delete {} @{}", p.tid, lsn));
            Ok(true)
        }

        fn undo_insert(&self, p: &InsertPayload) -> Result<bool> {
            self.log(format!("undo_insert {}", p.tid));
            Ok(true)
        }

        fn undo_update(&self, p: &UpdatePayload) -> Result<bool> {
            self.log(format!("undo_update {}", p.tid));
            Ok(true)
        }

        fn undo_delete(&self, p: &DeletePayload) -> Result<bool> {
            self.log(format!("undo_delete {}", p.tid));
            Ok(true)
        }
    }

    fn insert_data(table: &str, page: u32, slot: u16) -> Vec<u8> {
        InsertPayload {
            database: "db1".to_string(),
            table: table.to_string(),
            tid: TupleId::new(page, slot),
            tuple: vec![0xAB; 20],
        }
        .encode()
    }

    #[test]
    fn test_committed_work_redone_uncommitted_undone() {
        let dir = tempdir().unwrap();
        let wal = Arc::new(WalManager::open(dir.path(), 1 << 20).unwrap());

        // Txn 2 commits; txn 3 does not.
        wal.append_record(2, WalRecordType::Insert, insert_data("users", 0, 0))
            .unwrap();
        wal.append_record(2, WalRecordType::Commit, Vec::new())
            .unwrap();
        wal.append_record(3, WalRecordType::Insert, insert_data("users", 0, 1))
            .unwrap();
        wal.sync().unwrap();

        let target = SpyTarget::default();
        let report = RecoveryManager::new(wal.clone()).recover(&target).unwrap();

        assert_eq!(report.redone, 2);
        assert_eq!(report.undone, 1);
        assert_eq!(report.losers, vec![3]);
        assert_eq!(report.max_txn_id, 3);

        let calls = target.calls.lock();
        assert!(calls.iter().any(|c| c.starts_with("undo_insert (0, 1)")));

        // The loser got an Abort record, so a second recovery sees no losers.
        drop(calls);
        let report2 = RecoveryManager::new(wal).recover(&SpyTarget::default()).unwrap();
        assert!(report2.losers.is_empty());
        assert_eq!(report2.undone, 0);
    }

    #[test]
    fn test_missing_table_is_skipped_with_warning() {
        let dir = tempdir().unwrap();
        let wal = Arc::new(WalManager::open(dir.path(), 1 << 20).unwrap());

        wal.append_record(2, WalRecordType::Insert, insert_data("ghost", 0, 0))
            .unwrap();
        wal.append_record(2, WalRecordType::Commit, Vec::new())
            .unwrap();

        let report = RecoveryManager::new(wal)
            .recover(&SpyTarget::default())
            .unwrap();
        assert_eq!(report.redone, 0);
        assert_eq!(report.skipped, 1);
    }

    #[test]
    fn test_checkpoint_limits_redo_and_seeds_active_set() {
        let dir = tempdir().unwrap();
        let wal = Arc::new(WalManager::open(dir.path(), 1 << 20).unwrap());
        let mgr = RecoveryManager::new(wal.clone());

        wal.append_record(2, WalRecordType::Insert, insert_data("users", 0, 0))
            .unwrap();
        wal.append_record(2, WalRecordType::Commit, Vec::new())
            .unwrap();

        // Txn 3 is active across the checkpoint and never finishes.
        wal.append_record(3, WalRecordType::Insert, insert_data("users", 1, 0))
            .unwrap();
        mgr.create_checkpoint(vec![3], vec![1]).unwrap();
        wal.append_record(3, WalRecordType::Insert, insert_data("users", 1, 1))
            .unwrap();
        wal.sync().unwrap();

        let target = SpyTarget::default();
        let report = mgr.recover(&target).unwrap();

        // Redo starts at the checkpoint: only the post-checkpoint insert.
        assert_eq!(report.redone, 1);
        assert_eq!(report.losers, vec![3]);
        // Undo walks txn 3's full history, including pre-checkpoint work.
        assert_eq!(report.undone, 2);

        let calls = target.calls.lock();
        let undos: Vec<_> = calls.iter().filter(|c| c.starts_with("undo")).collect();
        assert_eq!(undos.len(), 2);
        // Newest first.
        assert!(undos[0].contains("(1, 1)"));
        assert!(undos[1].contains("(1, 0)"));
    }

    #[test]
    fn test_empty_log_recovers_cleanly() {
        let dir = tempdir().unwrap();
        let wal = Arc::new(WalManager::open(dir.path(), 1 << 20).unwrap());
        let report = RecoveryManager::new(wal)
            .recover(&SpyTarget::default())
            .unwrap();
        assert_eq!(report.records_scanned, 0);
        assert!(report.losers.is_empty());
    }
}
