//! Transactions: ID assignment, the active set, snapshots and visibility.

pub mod manager;
pub mod snapshot;

pub use manager::{Transaction, TransactionManager, TransactionState, TXN_META_FILE};
pub use snapshot::Snapshot;
