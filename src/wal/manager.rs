//! Segmented write-ahead log manager.
//!
//! Records append to numbered segment files `wal_00000000`, `wal_00000001`,
//! ... of a configured size; a record that would overflow the current
//! segment rolls the log to a new one. One mutex serializes appends so LSNs
//! come out monotonic; `sync` is called with the lock held, making a
//! commit's durability point well ordered against later appends.
//!
//! Reading back tolerates a torn tail: the first record whose frame or
//! checksum fails terminates the scan, and everything before it is
//! returned. On open the manager scans every segment and resumes LSN
//! assignment at `max(lsn) + 1`.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::common::{Lsn, TransactionId};
use crate::error::{DbError, Result};
use crate::wal::record::{WalRecord, WalRecordType, WAL_HEADER_SIZE};

/// Default segment size: 16 MiB.
pub const DEFAULT_SEGMENT_SIZE: u64 = 16 * 1024 * 1024;

struct WalInner {
    segment_id: u64,
    file: File,
    segment_bytes: u64,
    next_lsn: Lsn,
    /// Last LSN appended per in-flight transaction, for `prev_lsn` chaining.
    last_lsn_by_txn: HashMap<TransactionId, Lsn>,
}

/// Append-only segmented log with CRC-framed records.
pub struct WalManager {
    dir: PathBuf,
    segment_size: u64,
    inner: Mutex<WalInner>,
}

impl WalManager {
    /// Opens the log directory, scanning existing segments to recover the
    /// next LSN and the append position.
    pub fn open(dir: impl AsRef<Path>, segment_size: u64) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let segments = list_segments(&dir)?;
        let mut max_lsn: Lsn = 0;
        let mut tail_valid_bytes: u64 = 0;
        for (i, (_, path)) in segments.iter().enumerate() {
            let segment = read_segment(path)?;
            for record in &segment.records {
                max_lsn = max_lsn.max(record.lsn);
            }
            if i == segments.len() - 1 {
                tail_valid_bytes = segment.valid_bytes;
            }
        }

        let segment_id = segments.last().map(|(id, _)| *id).unwrap_or(0);
        let path = segment_path(&dir, segment_id);

        // Chop a torn tail off the live segment so future appends are
        // reachable by the scan.
        if path.exists() {
            let len = std::fs::metadata(&path)?.len();
            if len > tail_valid_bytes {
                warn!(
                    path = %path.display(),
                    torn_bytes = len - tail_valid_bytes,
                    "truncating torn WAL tail"
                );
                let file = OpenOptions::new().write(true).open(&path)?;
                file.set_len(tail_valid_bytes)?;
                file.sync_all()?;
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let segment_bytes = file.metadata()?.len();

        debug!(
            dir = %dir.display(),
            segments = segments.len(),
            next_lsn = max_lsn + 1,
            "opened WAL"
        );

        Ok(Self {
            dir,
            segment_size,
            inner: Mutex::new(WalInner {
                segment_id,
                file,
                segment_bytes,
                next_lsn: max_lsn + 1,
                last_lsn_by_txn: HashMap::new(),
            }),
        })
    }

    /// Appends one record, assigning it the next LSN.
    pub fn append_record(
        &self,
        txn_id: TransactionId,
        record_type: WalRecordType,
        data: Vec<u8>,
    ) -> Result<Lsn> {
        let mut inner = self.inner.lock();

        let lsn = inner.next_lsn;
        let prev_lsn = inner.last_lsn_by_txn.get(&txn_id).copied().unwrap_or(0);
        let record = WalRecord {
            lsn,
            prev_lsn,
            txn_id,
            record_type,
            data,
        };
        let encoded = record.encode();

        if inner.segment_bytes > 0
            && inner.segment_bytes + encoded.len() as u64 > self.segment_size
        {
            self.roll_segment(&mut inner)?;
        }

        inner.file.write_all(&encoded)?;
        inner.segment_bytes += encoded.len() as u64;
        inner.next_lsn = lsn + 1;

        match record_type {
            WalRecordType::Commit | WalRecordType::Abort => {
                inner.last_lsn_by_txn.remove(&txn_id);
            }
            _ => {
                inner.last_lsn_by_txn.insert(txn_id, lsn);
            }
        }

        Ok(lsn)
    }

    /// Durably flushes the current segment. Must complete before a commit
    /// is acknowledged.
    pub fn sync(&self) -> Result<()> {
        let inner = self.inner.lock();
        inner.file.sync_all()?;
        Ok(())
    }

    /// Reads every record with `lsn >= from_lsn` across all segments in
    /// order, stopping at the first torn or corrupt record.
    pub fn read_records(&self, from_lsn: Lsn) -> Result<Vec<WalRecord>> {
        // Flush buffered appends so the read sees them.
        self.sync()?;

        let mut records = Vec::new();
        for (_, path) in list_segments(&self.dir)? {
            let segment = read_segment(&path)?;
            let complete = segment.complete;
            records.extend(segment.records.into_iter().filter(|r| r.lsn >= from_lsn));
            if !complete {
                break;
            }
        }
        Ok(records)
    }

    /// Deletes whole segments whose every record is older than `before_lsn`.
    pub fn truncate(&self, before_lsn: Lsn) -> Result<()> {
        let inner = self.inner.lock();
        for (id, path) in list_segments(&self.dir)? {
            if id == inner.segment_id {
                continue;
            }
            let segment = read_segment(&path)?;
            if !segment.records.is_empty() && segment.records.iter().all(|r| r.lsn < before_lsn) {
                std::fs::remove_file(&path)?;
                debug!(segment = id, "truncated WAL segment");
            }
        }
        Ok(())
    }

    /// The LSN the next append will receive.
    pub fn current_lsn(&self) -> Lsn {
        self.inner.lock().next_lsn
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn roll_segment(&self, inner: &mut WalInner) -> Result<()> {
        inner.file.sync_all()?;
        let segment_id = inner.segment_id + 1;
        let path = segment_path(&self.dir, segment_id);
        inner.file = OpenOptions::new().create(true).append(true).open(&path)?;
        inner.segment_id = segment_id;
        inner.segment_bytes = 0;
        debug!(segment = segment_id, "rolled WAL segment");
        Ok(())
    }
}

fn segment_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("wal_{:08}", id))
}

fn list_segments(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut segments = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(id) = name.strip_prefix("wal_").and_then(|s| s.parse::<u64>().ok()) {
            segments.push((id, entry.path()));
        }
    }
    segments.sort_by_key(|(id, _)| *id);
    Ok(segments)
}

struct SegmentRead {
    records: Vec<WalRecord>,
    /// Bytes of the segment holding intact records.
    valid_bytes: u64,
    /// False when the segment ended in a torn or corrupt record.
    complete: bool,
}

fn read_segment(path: &Path) -> Result<SegmentRead> {
    let bytes = std::fs::read(path)?;
    let mut records = Vec::new();
    let mut pos = 0;
    while pos < bytes.len() {
        if bytes.len() - pos < WAL_HEADER_SIZE {
            warn!(path = %path.display(), offset = pos, "torn WAL tail (short header)");
            return Ok(SegmentRead {
                records,
                valid_bytes: pos as u64,
                complete: false,
            });
        }
        match WalRecord::decode(&bytes[pos..]) {
            Ok((record, consumed)) => {
                records.push(record);
                pos += consumed;
            }
            Err(DbError::Corruption(reason)) => {
                warn!(path = %path.display(), offset = pos, %reason, "torn WAL tail");
                return Ok(SegmentRead {
                    records,
                    valid_bytes: pos as u64,
                    complete: false,
                });
            }
            Err(e) => return Err(e),
        }
    }
    Ok(SegmentRead {
        records,
        valid_bytes: pos as u64,
        complete: true,
    })
}
