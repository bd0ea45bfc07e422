//! Column values, rows and primary keys.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

/// A single relational column value.
///
/// Values have a total order (variant rank first, then content) so they can
/// key ordered maps. Reals compare with `f64::total_cmp`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ColumnValue {
    /// SQL NULL.
    Null,
    /// Signed 64-bit integer.
    Integer(i64),
    /// Double precision float.
    Real(f64),
    /// UTF-8 text.
    Text(String),
    /// Opaque bytes.
    Blob(Vec<u8>),
}

impl ColumnValue {
    fn rank(&self) -> u8 {
        match self {
            ColumnValue::Null => 0,
            ColumnValue::Integer(_) => 1,
            ColumnValue::Real(_) => 2,
            ColumnValue::Text(_) => 3,
            ColumnValue::Blob(_) => 4,
        }
    }

    /// Returns the integer value, if this is an integer.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            ColumnValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the text value, if this is text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ColumnValue::Text(v) => Some(v),
            _ => None,
        }
    }

    /// Returns true for NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, ColumnValue::Null)
    }

    /// Appends the canonical CBOR encoding of the value to `out`.
    ///
    /// Integers take their shortest head. Reals are always written as
    /// 64-bit floats.
    pub(crate) fn write_cbor(&self, out: &mut Vec<u8>) {
        match self {
            ColumnValue::Null => out.push(0xf6),
            ColumnValue::Integer(v) if *v >= 0 => write_cbor_head(out, 0, v.unsigned_abs()),
            // -1 is stored as 0, -2 as 1, and so on.
            ColumnValue::Integer(v) => write_cbor_head(out, 1, v.unsigned_abs() - 1),
            ColumnValue::Real(v) => {
                out.push(0xfb);
                out.extend_from_slice(&v.to_bits().to_be_bytes());
            }
            ColumnValue::Text(v) => {
                write_cbor_head(out, 3, v.len() as u64);
                out.extend_from_slice(v.as_bytes());
            }
            ColumnValue::Blob(v) => {
                write_cbor_head(out, 2, v.len() as u64);
                out.extend_from_slice(v);
            }
        }
    }
}

/// Writes a CBOR item head with the shortest argument encoding.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn write_cbor_head(out: &mut Vec<u8>, major: u8, value: u64) {
    let mt = major << 5;
    if value < 24 {
        out.push(mt | value as u8);
    } else if let Ok(v) = u8::try_from(value) {
        out.push(mt | 24);
        out.push(v);
    } else if let Ok(v) = u16::try_from(value) {
        out.push(mt | 25);
        out.extend_from_slice(&v.to_be_bytes());
    } else if let Ok(v) = u32::try_from(value) {
        out.push(mt | 26);
        out.extend_from_slice(&v.to_be_bytes());
    } else {
        out.push(mt | 27);
        out.extend_from_slice(&value.to_be_bytes());
    }
}

impl PartialEq for ColumnValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ColumnValue {}

impl PartialOrd for ColumnValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ColumnValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (ColumnValue::Null, ColumnValue::Null) => Ordering::Equal,
            (ColumnValue::Integer(a), ColumnValue::Integer(b)) => a.cmp(b),
            (ColumnValue::Real(a), ColumnValue::Real(b)) => a.total_cmp(b),
            (ColumnValue::Text(a), ColumnValue::Text(b)) => a.cmp(b),
            (ColumnValue::Blob(a), ColumnValue::Blob(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl Hash for ColumnValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            ColumnValue::Null => {}
            ColumnValue::Integer(v) => v.hash(state),
            ColumnValue::Real(v) => v.to_bits().hash(state),
            ColumnValue::Text(v) => v.hash(state),
            ColumnValue::Blob(v) => v.hash(state),
        }
    }
}

impl fmt::Display for ColumnValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnValue::Null => write!(f, "NULL"),
            ColumnValue::Integer(v) => write!(f, "{v}"),
            ColumnValue::Real(v) => write!(f, "{v}"),
            ColumnValue::Text(v) => write!(f, "{v:?}"),
            ColumnValue::Blob(v) => write!(f, "<{} bytes>", v.len()),
        }
    }
}

impl From<i64> for ColumnValue {
    fn from(v: i64) -> Self {
        ColumnValue::Integer(v)
    }
}

impl From<i32> for ColumnValue {
    fn from(v: i32) -> Self {
        ColumnValue::Integer(i64::from(v))
    }
}

impl From<f64> for ColumnValue {
    fn from(v: f64) -> Self {
        ColumnValue::Real(v)
    }
}

impl From<&str> for ColumnValue {
    fn from(v: &str) -> Self {
        ColumnValue::Text(v.to_string())
    }
}

impl From<String> for ColumnValue {
    fn from(v: String) -> Self {
        ColumnValue::Text(v)
    }
}

impl From<Vec<u8>> for ColumnValue {
    fn from(v: Vec<u8>) -> Self {
        ColumnValue::Blob(v)
    }
}

/// A row: column name to value, ordered by column name.
pub type Row = BTreeMap<String, ColumnValue>;

/// Primary key of a row, in the order of the table's key columns.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PrimaryKey(pub Vec<ColumnValue>);

impl PrimaryKey {
    /// Creates a single-column key.
    pub fn single(value: impl Into<ColumnValue>) -> Self {
        Self(vec![value.into()])
    }

    /// Returns the key parts.
    pub fn parts(&self) -> &[ColumnValue] {
        &self.0
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let [only] = self.0.as_slice() {
            return write!(f, "{only}");
        }
        write!(f, "(")?;
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{part}")?;
        }
        write!(f, ")")
    }
}
