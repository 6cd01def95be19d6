//! Tuple codec.
//!
//! A tuple is a serialized row prefixed by a 12-byte header carrying the
//! MVCC timestamps:
//!
//! ```text
//! { length: u16, null_bitmap: u16, xmin: u32, xmax: u32 }
//! ```
//!
//! `length` is the total byte length including the header and is validated
//! on decode. The null bitmap covers the first 16 columns of the table's
//! column order; later columns are still encoded, they just have no bitmap
//! bit. `xmin == 0` means not-yet-visible, `xmax == 0` means not deleted.
//!
//! The payload after the header is self-describing: a column count followed
//! by `(name, tagged value)` pairs, all little-endian. The payload encoding
//! is private to this module; the header layout is an on-disk contract.

use std::collections::HashMap;

use crate::common::{Row, TransactionId, Value};
use crate::error::{DbError, Result};

/// Byte size of the tuple header.
pub const TUPLE_HEADER_SIZE: usize = 12;

/// Number of columns the null bitmap can describe.
pub const NULL_BITMAP_COLUMNS: usize = 16;

const TAG_NULL: u8 = 0;
const TAG_INTEGER: u8 = 1;
const TAG_FLOAT: u8 = 2;
const TAG_STRING: u8 = 3;

/// Parsed tuple header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TupleHeader {
    pub length: u16,
    pub null_bitmap: u16,
    pub xmin: TransactionId,
    pub xmax: TransactionId,
}

impl TupleHeader {
    /// Reads just the header from a raw tuple image. Cheap enough for the
    /// vacuum scan, which only needs `xmax`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < TUPLE_HEADER_SIZE {
            return Err(DbError::corruption(format!(
                "tuple of {} bytes is shorter than its header",
                bytes.len()
            )));
        }
        Ok(Self {
            length: u16::from_le_bytes(bytes[0..2].try_into().unwrap()),
            null_bitmap: u16::from_le_bytes(bytes[2..4].try_into().unwrap()),
            xmin: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            xmax: u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
        })
    }
}

/// A decoded tuple: header plus the row it carries.
#[derive(Debug, Clone)]
pub struct Tuple {
    pub header: TupleHeader,
    pub row: Row,
}

/// Serializes a row into tuple bytes.
///
/// `columns` fixes the encoding order (the table's column list). A column
/// missing from the row is encoded as NULL; the bitmap records NULLs for
/// the first [`NULL_BITMAP_COLUMNS`] columns.
pub fn serialize(
    row: &Row,
    columns: &[String],
    xmin: TransactionId,
    xmax: TransactionId,
) -> Result<Vec<u8>> {
    let mut payload = Vec::with_capacity(64);
    payload.extend_from_slice(&(columns.len() as u16).to_le_bytes());

    let mut null_bitmap: u16 = 0;
    for (i, name) in columns.iter().enumerate() {
        let value = row.get(name).unwrap_or(&Value::Null);
        if value.is_null() && i < NULL_BITMAP_COLUMNS {
            null_bitmap |= 1 << i;
        }

        payload.extend_from_slice(&(name.len() as u16).to_le_bytes());
        payload.extend_from_slice(name.as_bytes());
        encode_value(&mut payload, value);
    }

    let total = TUPLE_HEADER_SIZE + payload.len();
    if total > u16::MAX as usize {
        return Err(DbError::TupleTooLarge {
            size: total,
            max: u16::MAX as usize,
        });
    }

    let mut bytes = Vec::with_capacity(total);
    bytes.extend_from_slice(&(total as u16).to_le_bytes());
    bytes.extend_from_slice(&null_bitmap.to_le_bytes());
    bytes.extend_from_slice(&xmin.to_le_bytes());
    bytes.extend_from_slice(&xmax.to_le_bytes());
    bytes.extend_from_slice(&payload);
    Ok(bytes)
}

/// Decodes tuple bytes back into header and row.
pub fn deserialize(bytes: &[u8]) -> Result<Tuple> {
    let header = TupleHeader::from_bytes(bytes)?;
    if header.length as usize != bytes.len() {
        return Err(DbError::corruption(format!(
            "tuple length field {} does not match {} actual bytes",
            header.length,
            bytes.len()
        )));
    }

    let mut cursor = Cursor::new(&bytes[TUPLE_HEADER_SIZE..]);
    let column_count = cursor.read_u16()?;
    let mut row = HashMap::with_capacity(column_count as usize);
    for _ in 0..column_count {
        let name_len = cursor.read_u16()? as usize;
        let name = String::from_utf8(cursor.read_bytes(name_len)?.to_vec())
            .map_err(|_| DbError::corruption("tuple column name is not UTF-8"))?;
        let value = decode_value(&mut cursor)?;
        row.insert(name, value);
    }
    if !cursor.is_empty() {
        return Err(DbError::corruption(format!(
            "tuple has {} trailing bytes after last column",
            cursor.remaining()
        )));
    }

    Ok(Tuple { header, row })
}

/// Patches `xmax` directly in a tuple image. Used by the MVCC delete path
/// (and its undo), which changes only the header.
pub fn write_xmax(tuple: &mut [u8], xmax: TransactionId) -> Result<()> {
    if tuple.len() < TUPLE_HEADER_SIZE {
        return Err(DbError::corruption("tuple too short for header patch"));
    }
    tuple[8..12].copy_from_slice(&xmax.to_le_bytes());
    Ok(())
}

fn encode_value(buf: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Null => buf.push(TAG_NULL),
        Value::Integer(i) => {
            buf.push(TAG_INTEGER);
            buf.extend_from_slice(&i.to_le_bytes());
        }
        Value::Float(x) => {
            buf.push(TAG_FLOAT);
            buf.extend_from_slice(&x.to_le_bytes());
        }
        Value::String(s) => {
            buf.push(TAG_STRING);
            buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
            buf.extend_from_slice(s.as_bytes());
        }
    }
}

fn decode_value(cursor: &mut Cursor<'_>) -> Result<Value> {
    let tag = cursor.read_u8()?;
    match tag {
        TAG_NULL => Ok(Value::Null),
        TAG_INTEGER => Ok(Value::Integer(i64::from_le_bytes(
            cursor.read_bytes(8)?.try_into().unwrap(),
        ))),
        TAG_FLOAT => Ok(Value::Float(f64::from_le_bytes(
            cursor.read_bytes(8)?.try_into().unwrap(),
        ))),
        TAG_STRING => {
            let len = cursor.read_u32()? as usize;
            let bytes = cursor.read_bytes(len)?;
            String::from_utf8(bytes.to_vec())
                .map(Value::String)
                .map_err(|_| DbError::corruption("tuple string value is not UTF-8"))
        }
        other => Err(DbError::corruption(format!(
            "unknown tuple value tag {}",
            other
        ))),
    }
}

/// Minimal bounds-checked reader over the tuple payload.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos == self.buf.len()
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(DbError::corruption("tuple payload truncated"));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.read_bytes(2)?.try_into().unwrap()))
    }

    fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_bytes(4)?.try_into().unwrap()))
    }
}
