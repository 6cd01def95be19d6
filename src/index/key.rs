//! Typed index keys.
//!
//! Keys compare by static type: integers with integers, floats with floats,
//! strings byte-wise. Comparing *different* types falls back to the key's
//! stable string form, which keeps the ordering total (required by the
//! tree) without privileging any type. Composite keys compare part-wise
//! through their joined string form.

use std::cmp::Ordering;
use std::fmt;

use crate::common::Value;

/// A key stored in a B+Tree index.
#[derive(Debug, Clone)]
pub enum IndexKey {
    Int(i64),
    Float(f64),
    Str(String),
    Composite(Vec<IndexKey>),
}

impl IndexKey {
    /// Builds a key from a row value. NULL has no key; callers skip index
    /// maintenance for NULL column values.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Integer(i) => Some(IndexKey::Int(*i)),
            Value::Float(x) => Some(IndexKey::Float(*x)),
            Value::String(s) => Some(IndexKey::Str(s.clone())),
        }
    }

    /// Stable textual form used for cross-type comparison and for
    /// persisting non-integer, non-string keys.
    pub fn stable_string(&self) -> String {
        match self {
            IndexKey::Int(i) => i.to_string(),
            IndexKey::Float(x) => x.to_string(),
            IndexKey::Str(s) => s.clone(),
            IndexKey::Composite(parts) => parts
                .iter()
                .map(|p| p.stable_string())
                .collect::<Vec<_>>()
                .join("|"),
        }
    }
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.stable_string())
    }
}

impl PartialEq for IndexKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for IndexKey {}

impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (IndexKey::Int(a), IndexKey::Int(b)) => a.cmp(b),
            (IndexKey::Float(a), IndexKey::Float(b)) => a.total_cmp(b),
            (IndexKey::Str(a), IndexKey::Str(b)) => a.as_bytes().cmp(b.as_bytes()),
            _ => self.stable_string().cmp(&other.stable_string()),
        }
    }
}
