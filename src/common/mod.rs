//! Shared types used across the storage kernel.
//!
//! This module defines the identifier aliases, the dynamic [`Value`] type
//! rows are built from, and the on-disk constants every subsystem agrees on.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Fixed page size in bytes. The unit of I/O, caching and locking.
pub const PAGE_SIZE: usize = 8192;

/// Identifier of a page within one heap file. Pages are dense `0..page_count`.
pub type PageId = u32;

/// Index into a page's slot directory.
pub type SlotId = u16;

/// Transaction identifier. `0` is invalid, `1` is reserved for bootstrap;
/// user transactions start at `2`.
pub type TransactionId = u32;

/// Log sequence number: monotonic identifier of a WAL record.
pub type Lsn = u64;

/// Transaction ID value that marks "no transaction" (`xmin` unset /
/// `xmax` not deleted).
pub const INVALID_TXN_ID: TransactionId = 0;

/// First transaction ID handed out to user transactions.
pub const FIRST_TXN_ID: TransactionId = 2;

/// Physical location of a tuple: page plus slot. Stable for as long as the
/// slot is not reused, which makes it usable as an index payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TupleId {
    pub page_id: PageId,
    pub slot: SlotId,
}

impl TupleId {
    pub fn new(page_id: PageId, slot: SlotId) -> Self {
        Self { page_id, slot }
    }
}

impl fmt::Display for TupleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.page_id, self.slot)
    }
}

/// A dynamically-typed column value.
///
/// The kernel stores four value shapes; column declarations constrain which
/// shapes a decoder will accept for a given column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    /// SQL NULL.
    Null,
    /// 64-bit signed integer.
    Integer(i64),
    /// 64-bit floating point.
    Float(f64),
    /// Variable-length UTF-8 string.
    String(String),
}

impl Value {
    /// Check if value is NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Get type name as string.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Integer(_) => "INTEGER",
            Value::Float(_) => "FLOAT",
            Value::String(_) => "STRING",
        }
    }

    /// Orders two values for predicate evaluation.
    ///
    /// Numeric values compare numerically across Integer/Float; strings
    /// compare lexically. NULL and mixed non-numeric comparisons yield
    /// `None`, which predicate evaluation treats as "no match".
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Integer(a), Value::Integer(b)) => Some(a.cmp(b)),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Integer(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
            (Value::Float(a), Value::Integer(b)) => a.partial_cmp(&(*b as f64)),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::String(a), Value::String(b)) => a == b,
            _ => self.compare(other) == Some(Ordering::Equal),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::String(s) => write!(f, "{}", s),
        }
    }
}

/// A row as the engine sees it: column name to value.
pub type Row = HashMap<String, Value>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_numeric_compare() {
        assert_eq!(
            Value::Integer(2).compare(&Value::Float(2.0)),
            Some(Ordering::Equal)
        );
        assert_eq!(
            Value::Integer(1).compare(&Value::Integer(5)),
            Some(Ordering::Less)
        );
        assert_eq!(Value::Null.compare(&Value::Integer(1)), None);
    }

    #[test]
    fn test_value_equality() {
        assert_eq!(Value::Integer(3), Value::Float(3.0));
        assert_eq!(Value::Null, Value::Null);
        assert_ne!(Value::Null, Value::Integer(0));
        assert_ne!(Value::String("a".into()), Value::String("b".into()));
    }

    #[test]
    fn test_tuple_id_display() {
        let tid = TupleId::new(7, 3);
        assert_eq!(tid.to_string(), "(7, 3)");
    }
}
