//! Write-ahead logging: record framing and the segmented log manager.

pub mod manager;
pub mod record;

pub use manager::{WalManager, DEFAULT_SEGMENT_SIZE};
pub use record::{
    CheckpointPayload, DeletePayload, InsertPayload, UpdatePayload, WalRecord, WalRecordType,
    WAL_HEADER_SIZE,
};
