//! Ordered secondary indexes: typed keys and the B+Tree.

pub mod btree;
pub mod key;

pub use btree::{BPlusTree, DEFAULT_ORDER};
pub use key::IndexKey;
