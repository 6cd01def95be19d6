//! WAL record framing and payload codecs.
//!
//! Every record is framed as a 29-byte little-endian header followed by
//! type-specific data:
//!
//! ```text
//! { lsn: u64, prev_lsn: u64, txn_id: u32, record_type: u8,
//!   length: u32, checksum: u32 }
//! ```
//!
//! `length` counts the whole record including the header. The CRC32 (IEEE)
//! covers the header with the checksum field zeroed, then the data bytes.
//! `prev_lsn` chains a transaction's records together for the undo walk.
//!
//! Data-modifying payloads name their database and table so the redo pass
//! can route them (and skip records whose table no longer exists).

use crc32fast::Hasher;

use crate::common::{Lsn, PageId, TransactionId, TupleId};
use crate::error::{DbError, Result};

/// Byte size of the record header.
pub const WAL_HEADER_SIZE: usize = 29;

const CHECKSUM_OFFSET: usize = 25;

/// Typed WAL record kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WalRecordType {
    Insert = 1,
    Update = 2,
    Delete = 3,
    Commit = 4,
    Abort = 5,
    Checkpoint = 6,
}

impl WalRecordType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(WalRecordType::Insert),
            2 => Some(WalRecordType::Update),
            3 => Some(WalRecordType::Delete),
            4 => Some(WalRecordType::Commit),
            5 => Some(WalRecordType::Abort),
            6 => Some(WalRecordType::Checkpoint),
            _ => None,
        }
    }

    /// True for records the redo/undo passes apply to heap pages.
    pub fn is_data(&self) -> bool {
        matches!(
            self,
            WalRecordType::Insert | WalRecordType::Update | WalRecordType::Delete
        )
    }
}

/// One framed log record.
#[derive(Debug, Clone)]
pub struct WalRecord {
    pub lsn: Lsn,
    /// Previous LSN written by the same transaction, `0` for its first.
    pub prev_lsn: Lsn,
    pub txn_id: TransactionId,
    pub record_type: WalRecordType,
    pub data: Vec<u8>,
}

impl WalRecord {
    /// Total encoded length in bytes.
    pub fn encoded_len(&self) -> usize {
        WAL_HEADER_SIZE + self.data.len()
    }

    /// Encodes the record with its checksum filled in.
    pub fn encode(&self) -> Vec<u8> {
        let length = self.encoded_len() as u32;
        let mut buf = Vec::with_capacity(length as usize);
        buf.extend_from_slice(&self.lsn.to_le_bytes());
        buf.extend_from_slice(&self.prev_lsn.to_le_bytes());
        buf.extend_from_slice(&self.txn_id.to_le_bytes());
        buf.push(self.record_type as u8);
        buf.extend_from_slice(&length.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&self.data);

        let checksum = record_checksum(&buf);
        buf[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].copy_from_slice(&checksum.to_le_bytes());
        buf
    }

    /// Decodes one record from the front of `bytes`.
    ///
    /// Returns the record and the number of bytes consumed. Any framing or
    /// checksum problem is reported as corruption; the segment reader
    /// treats that as the torn tail and stops.
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize)> {
        if bytes.len() < WAL_HEADER_SIZE {
            return Err(DbError::corruption("WAL record header truncated"));
        }

        let lsn = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
        let prev_lsn = u64::from_le_bytes(bytes[8..16].try_into().unwrap());
        let txn_id = u32::from_le_bytes(bytes[16..20].try_into().unwrap());
        let type_byte = bytes[20];
        let length = u32::from_le_bytes(bytes[21..25].try_into().unwrap()) as usize;
        let stored_checksum = u32::from_le_bytes(bytes[25..29].try_into().unwrap());

        let record_type = WalRecordType::from_u8(type_byte)
            .ok_or_else(|| DbError::corruption(format!("unknown WAL record type {}", type_byte)))?;
        if length < WAL_HEADER_SIZE {
            return Err(DbError::corruption(format!(
                "WAL record length {} shorter than header",
                length
            )));
        }
        if bytes.len() < length {
            return Err(DbError::corruption("WAL record body truncated"));
        }

        let mut image = bytes[..length].to_vec();
        image[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].copy_from_slice(&0u32.to_le_bytes());
        if record_checksum(&image) != stored_checksum {
            return Err(DbError::corruption(format!(
                "WAL record checksum mismatch at LSN {}",
                lsn
            )));
        }

        Ok((
            Self {
                lsn,
                prev_lsn,
                txn_id,
                record_type,
                data: bytes[WAL_HEADER_SIZE..length].to_vec(),
            },
            length,
        ))
    }
}

fn record_checksum(image_with_zeroed_checksum: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(image_with_zeroed_checksum);
    hasher.finalize()
}

// ---------------------------------------------------------------------------
// Payload codecs
// ---------------------------------------------------------------------------

/// Insert payload: where the tuple went and its full image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertPayload {
    pub database: String,
    pub table: String,
    pub tid: TupleId,
    pub tuple: Vec<u8>,
}

impl InsertPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.tuple.len() + 32);
        encode_location(&mut buf, &self.database, &self.table, self.tid);
        buf.extend_from_slice(&self.tuple);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut cursor = PayloadCursor::new(data);
        let (database, table, tid) = decode_location(&mut cursor)?;
        Ok(Self {
            database,
            table,
            tid,
            tuple: cursor.rest().to_vec(),
        })
    }
}

/// Update payload: before and after images for redo/undo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdatePayload {
    pub database: String,
    pub table: String,
    pub tid: TupleId,
    pub old: Vec<u8>,
    pub new: Vec<u8>,
}

impl UpdatePayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.old.len() + self.new.len() + 36);
        encode_location(&mut buf, &self.database, &self.table, self.tid);
        buf.extend_from_slice(&(self.old.len() as u16).to_le_bytes());
        buf.extend_from_slice(&(self.new.len() as u16).to_le_bytes());
        buf.extend_from_slice(&self.old);
        buf.extend_from_slice(&self.new);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut cursor = PayloadCursor::new(data);
        let (database, table, tid) = decode_location(&mut cursor)?;
        let old_len = cursor.read_u16()? as usize;
        let new_len = cursor.read_u16()? as usize;
        let old = cursor.read_bytes(old_len)?.to_vec();
        let new = cursor.read_bytes(new_len)?.to_vec();
        Ok(Self {
            database,
            table,
            tid,
            old,
            new,
        })
    }
}

/// Delete payload: the deleted tuple's pre-image (undo restores it).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletePayload {
    pub database: String,
    pub table: String,
    pub tid: TupleId,
    pub tuple: Vec<u8>,
}

impl DeletePayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.tuple.len() + 32);
        encode_location(&mut buf, &self.database, &self.table, self.tid);
        buf.extend_from_slice(&self.tuple);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut cursor = PayloadCursor::new(data);
        let (database, table, tid) = decode_location(&mut cursor)?;
        Ok(Self {
            database,
            table,
            tid,
            tuple: cursor.rest().to_vec(),
        })
    }
}

/// Checkpoint payload: where redo starts and what was in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointPayload {
    pub redo_lsn: Lsn,
    pub active_txns: Vec<TransactionId>,
    pub dirty_pages: Vec<PageId>,
}

impl CheckpointPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf =
            Vec::with_capacity(16 + 4 * (self.active_txns.len() + self.dirty_pages.len()));
        buf.extend_from_slice(&self.redo_lsn.to_le_bytes());
        buf.extend_from_slice(&(self.active_txns.len() as u32).to_le_bytes());
        for txn in &self.active_txns {
            buf.extend_from_slice(&txn.to_le_bytes());
        }
        buf.extend_from_slice(&(self.dirty_pages.len() as u32).to_le_bytes());
        for page in &self.dirty_pages {
            buf.extend_from_slice(&page.to_le_bytes());
        }
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut cursor = PayloadCursor::new(data);
        let redo_lsn = cursor.read_u64()?;
        let active_count = cursor.read_u32()? as usize;
        let mut active_txns = Vec::with_capacity(active_count);
        for _ in 0..active_count {
            active_txns.push(cursor.read_u32()?);
        }
        let dirty_count = cursor.read_u32()? as usize;
        let mut dirty_pages = Vec::with_capacity(dirty_count);
        for _ in 0..dirty_count {
            dirty_pages.push(cursor.read_u32()?);
        }
        Ok(Self {
            redo_lsn,
            active_txns,
            dirty_pages,
        })
    }
}

fn encode_location(buf: &mut Vec<u8>, database: &str, table: &str, tid: TupleId) {
    buf.extend_from_slice(&tid.page_id.to_le_bytes());
    buf.extend_from_slice(&tid.slot.to_le_bytes());
    buf.extend_from_slice(&(database.len() as u16).to_le_bytes());
    buf.extend_from_slice(database.as_bytes());
    buf.extend_from_slice(&(table.len() as u16).to_le_bytes());
    buf.extend_from_slice(table.as_bytes());
}

fn decode_location(cursor: &mut PayloadCursor<'_>) -> Result<(String, String, TupleId)> {
    let page_id = cursor.read_u32()?;
    let slot = cursor.read_u16()?;
    let database = cursor.read_string()?;
    let table = cursor.read_string()?;
    Ok((database, table, TupleId::new(page_id, slot)))
}

struct PayloadCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadCursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() - self.pos < n {
            return Err(DbError::corruption("WAL payload truncated"));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.read_bytes(2)?.try_into().unwrap()))
    }

    fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_bytes(4)?.try_into().unwrap()))
    }

    fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.read_bytes(8)?.try_into().unwrap()))
    }

    fn read_string(&mut self) -> Result<String> {
        let len = self.read_u16()? as usize;
        String::from_utf8(self.read_bytes(len)?.to_vec())
            .map_err(|_| DbError::corruption("WAL payload string is not UTF-8"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_encode_decode() {
        let record = WalRecord {
            lsn: 17,
            prev_lsn: 5,
            txn_id: 3,
            record_type: WalRecordType::Insert,
            data: b"some payload".to_vec(),
        };

        let bytes = record.encode();
        assert_eq!(bytes.len(), WAL_HEADER_SIZE + 12);

        let (decoded, consumed) = WalRecord::decode(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded.lsn, 17);
        assert_eq!(decoded.prev_lsn, 5);
        assert_eq!(decoded.txn_id, 3);
        assert_eq!(decoded.record_type, WalRecordType::Insert);
        assert_eq!(decoded.data, b"some payload");
    }

    #[test]
    fn test_decode_rejects_flipped_byte() {
        let record = WalRecord {
            lsn: 1,
            prev_lsn: 0,
            txn_id: 2,
            record_type: WalRecordType::Commit,
            data: vec![1, 2, 3],
        };
        let mut bytes = record.encode();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x80;
        assert!(matches!(
            WalRecord::decode(&bytes),
            Err(DbError::Corruption(_))
        ));
    }

    #[test]
    fn test_decode_rejects_truncation() {
        let record = WalRecord {
            lsn: 1,
            prev_lsn: 0,
            txn_id: 2,
            record_type: WalRecordType::Abort,
            data: vec![0; 100],
        };
        let bytes = record.encode();
        assert!(WalRecord::decode(&bytes[..40]).is_err());
        assert!(WalRecord::decode(&bytes[..10]).is_err());
    }

    #[test]
    fn test_insert_payload_roundtrip() {
        let payload = InsertPayload {
            database: "db1".to_string(),
            table: "users".to_string(),
            tid: TupleId::new(4, 2),
            tuple: vec![9; 40],
        };
        let decoded = InsertPayload::decode(&payload.encode()).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_update_payload_roundtrip() {
        let payload = UpdatePayload {
            database: "db1".to_string(),
            table: "users".to_string(),
            tid: TupleId::new(0, 7),
            old: vec![1; 20],
            new: vec![2; 12],
        };
        let decoded = UpdatePayload::decode(&payload.encode()).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_checkpoint_payload_roundtrip() {
        let payload = CheckpointPayload {
            redo_lsn: 123,
            active_txns: vec![5, 9],
            dirty_pages: vec![0, 3, 8],
        };
        let decoded = CheckpointPayload::decode(&payload.encode()).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_record_type_predicates() {
        assert!(WalRecordType::Insert.is_data());
        assert!(WalRecordType::Delete.is_data());
        assert!(!WalRecordType::Commit.is_data());
        assert_eq!(WalRecordType::from_u8(0), None);
        assert_eq!(WalRecordType::from_u8(6), Some(WalRecordType::Checkpoint));
    }
}
