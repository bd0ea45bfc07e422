//! Change records.

use crate::value::{write_cbor_head, PrimaryKey, Row};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Milliseconds since the Unix epoch, or a store-defined version number.
pub type Timestamp = i64;

/// SHA-256 digest of a row's column values.
pub type ContentHash = [u8; 32];

/// Encodes a row as a canonical CBOR map.
///
/// Keys are ordered length-first, then bytewise, and every length is
/// definite, so equal rows encode identically no matter which store
/// produced them.
pub fn canonical_cbor(row: &Row) -> Vec<u8> {
    let mut columns: Vec<_> = row.iter().collect();
    columns.sort_by(|(a, _), (b, _)| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));

    let mut buf = Vec::with_capacity(64);
    write_cbor_head(&mut buf, 5, columns.len() as u64);
    for (column, value) in columns {
        write_cbor_head(&mut buf, 3, column.len() as u64);
        buf.extend_from_slice(column.as_bytes());
        value.write_cbor(&mut buf);
    }
    buf
}

/// Computes the content hash of a row: SHA-256 over [`canonical_cbor`].
pub fn content_hash(row: &Row) -> ContentHash {
    Sha256::digest(canonical_cbor(row)).into()
}

/// Formats a digest as lowercase hex.
pub fn hex_digest(hash: &ContentHash) -> String {
    hash.iter().map(|b| format!("{b:02x}")).collect()
}

/// A captured row-level mutation.
///
/// `ChangeRecord` is produced by a change detector scan and is immutable
/// afterwards. The content hash always matches `column_values`; use
/// [`ChangeRecord::with_values`] to derive a record with different values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Sync pair that observed the change.
    pub pair_id: String,
    /// Table name.
    pub table: String,
    /// Primary key of the changed row.
    pub primary_key: PrimaryKey,
    /// Full row contents after the change.
    pub column_values: Row,
    /// Name of the store the change was observed on.
    pub origin_store: String,
    /// Version or observation time of the change.
    pub observed_at: Timestamp,
    /// Hash of `column_values`.
    pub content_hash: ContentHash,
}

impl ChangeRecord {
    /// Creates a record, computing its content hash.
    pub fn new(
        pair_id: impl Into<String>,
        table: impl Into<String>,
        primary_key: PrimaryKey,
        column_values: Row,
        origin_store: impl Into<String>,
        observed_at: Timestamp,
    ) -> Self {
        let content_hash = content_hash(&column_values);
        Self {
            pair_id: pair_id.into(),
            table: table.into(),
            primary_key,
            column_values,
            origin_store: origin_store.into(),
            observed_at,
            content_hash,
        }
    }

    /// Returns a copy with new column values and origin, rehashed.
    pub fn with_values(
        &self,
        column_values: Row,
        origin_store: impl Into<String>,
        observed_at: Timestamp,
    ) -> Self {
        Self::new(
            self.pair_id.clone(),
            self.table.clone(),
            self.primary_key.clone(),
            column_values,
            origin_store,
            observed_at,
        )
    }

    /// Returns true if both records carry identical row contents.
    pub fn same_content(&self, other: &ChangeRecord) -> bool {
        self.content_hash == other.content_hash
    }

    /// Returns true if both records describe the same logical row.
    pub fn same_row(&self, other: &ChangeRecord) -> bool {
        self.table == other.table && self.primary_key == other.primary_key
    }

    /// Short hex prefix of the content hash, for logs.
    pub fn short_hash(&self) -> String {
        hex_digest(&self.content_hash)[..12].to_string()
    }
}
