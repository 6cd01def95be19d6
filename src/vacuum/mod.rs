//! Vacuum: reclaims space held by dead tuples.
//!
//! A tuple is dead once its deleter committed below the horizon (the
//! oldest transaction ID any snapshot can still need): `xmax != 0 &&
//! xmax < horizon`. Dead tuples are marked slot-dead and the page is
//! compacted. Pages are processed one at a time under the page's write
//! lock, so vacuum never races a concurrent writer on the same page.

use tracing::info;

use crate::common::TransactionId;
use crate::error::Result;
use crate::storage::heap::HeapFile;
use crate::storage::tuple::TupleHeader;

/// Counters reported by one vacuum run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VacuumStats {
    pub pages_scanned: u64,
    pub tuples_scanned: u64,
    pub dead_tuples: u64,
    pub tuples_removed: u64,
    pub bytes_reclaimed: u64,
}

impl VacuumStats {
    pub fn merge(&mut self, other: &VacuumStats) {
        self.pages_scanned += other.pages_scanned;
        self.tuples_scanned += other.tuples_scanned;
        self.dead_tuples += other.dead_tuples;
        self.tuples_removed += other.tuples_removed;
        self.bytes_reclaimed += other.bytes_reclaimed;
    }
}

/// Scans heaps and reclaims dead tuples.
#[derive(Debug, Default)]
pub struct VacuumManager;

impl VacuumManager {
    pub fn new() -> Self {
        Self
    }

    /// Vacuums one heap file against the given horizon.
    pub fn vacuum_heap(&self, heap: &HeapFile, horizon: TransactionId) -> Result<VacuumStats> {
        let mut stats = VacuumStats::default();

        for page_id in 0..heap.page_count() {
            let page_stats = heap.with_page_mut(page_id, |page| -> Result<VacuumStats> {
                let mut page_stats = VacuumStats {
                    pages_scanned: 1,
                    ..VacuumStats::default()
                };

                let mut removed_any = false;
                for slot in 0..page.slot_count() {
                    let entry = page.slot(slot).expect("slot within count");
                    if entry.is_dead() {
                        continue;
                    }
                    page_stats.tuples_scanned += 1;

                    let header = TupleHeader::from_bytes(page.get_tuple(slot)?)?;
                    if header.xmax != 0 && header.xmax < horizon {
                        page_stats.dead_tuples += 1;
                        page.delete_tuple(slot)?;
                        page_stats.tuples_removed += 1;
                        removed_any = true;
                    }
                }

                if removed_any {
                    let free_before = page.free_space();
                    page.compact();
                    page_stats.bytes_reclaimed += (page.free_space() - free_before) as u64;
                }
                Ok(page_stats)
            })??;
            stats.merge(&page_stats);
        }

        if stats.tuples_removed > 0 {
            info!(
                path = %heap.path().display(),
                removed = stats.tuples_removed,
                bytes = stats.bytes_reclaimed,
                "vacuum reclaimed space"
            );
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Row, Value};
    use crate::storage::tuple;
    use tempfile::tempdir;

    fn tuple_bytes(id: i64, xmin: u32, xmax: u32) -> Vec<u8> {
        let mut row = Row::new();
        row.insert("id".to_string(), Value::Integer(id));
        tuple::serialize(&row, &["id".to_string()], xmin, xmax).unwrap()
    }

    #[test]
    fn test_vacuum_removes_only_dead_below_horizon() {
        let dir = tempdir().unwrap();
        let heap = HeapFile::open(dir.path().join("t.heap"), 16).unwrap();

        // Live, deleted-below-horizon, deleted-at-horizon.
        heap.insert_tuple(&tuple_bytes(1, 2, 0)).unwrap();
        heap.insert_tuple(&tuple_bytes(2, 2, 5)).unwrap();
        heap.insert_tuple(&tuple_bytes(3, 2, 9)).unwrap();

        let stats = VacuumManager::new().vacuum_heap(&heap, 9).unwrap();
        assert_eq!(stats.pages_scanned, 1);
        assert_eq!(stats.tuples_scanned, 3);
        assert_eq!(stats.dead_tuples, 1);
        assert_eq!(stats.tuples_removed, 1);
        assert!(stats.bytes_reclaimed > 0);

        let mut remaining = Vec::new();
        heap.scan(|_, bytes| {
            remaining.push(tuple::deserialize(bytes).unwrap());
            Ok(())
        })
        .unwrap();
        assert_eq!(remaining.len(), 2);
        assert!(remaining
            .iter()
            .all(|t| t.row.get("id") != Some(&Value::Integer(2))));
    }

    #[test]
    fn test_vacuum_clean_heap_is_noop() {
        let dir = tempdir().unwrap();
        let heap = HeapFile::open(dir.path().join("t.heap"), 16).unwrap();
        for i in 0..5 {
            heap.insert_tuple(&tuple_bytes(i, 2, 0)).unwrap();
        }

        let stats = VacuumManager::new().vacuum_heap(&heap, 100).unwrap();
        assert_eq!(stats.tuples_scanned, 5);
        assert_eq!(stats.dead_tuples, 0);
        assert_eq!(stats.tuples_removed, 0);
        assert_eq!(stats.bytes_reclaimed, 0);
    }

    #[test]
    fn test_vacuumed_space_is_reusable() {
        let dir = tempdir().unwrap();
        let heap = HeapFile::open(dir.path().join("t.heap"), 16).unwrap();

        let mut row = Row::new();
        row.insert(
            "pad".to_string(),
            Value::String("x".repeat(1500)),
        );
        let cols = vec!["pad".to_string()];

        // Five fat tuples fill the first page.
        for _ in 0..5 {
            let bytes = tuple::serialize(&row, &cols, 2, 5).unwrap();
            heap.insert_tuple(&bytes).unwrap();
        }
        assert_eq!(heap.page_count(), 1);

        let stats = VacuumManager::new().vacuum_heap(&heap, 10).unwrap();
        assert_eq!(stats.tuples_removed, 5);

        // The page is empty again; new inserts reuse it.
        let bytes = tuple::serialize(&row, &cols, 11, 0).unwrap();
        let tid = heap.insert_tuple(&bytes).unwrap();
        assert_eq!(tid.page_id, 0);
        assert_eq!(heap.page_count(), 1);
    }
}
