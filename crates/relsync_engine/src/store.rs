//! Store adapters.
//!
//! A store is one relational database the engine reads changes from and
//! writes winners to. Adapters only move rows; turning rows into
//! [`ChangeRecord`]s is the detector's job.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use parking_lot::RwLock;
use relsync_protocol::{ChangeRecord, PrimaryKey, Row, TableSpec, Timestamp};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// A relational store.
#[async_trait]
pub trait Store: Send + Sync {
    /// Store name, recorded as `origin_store` on detected changes.
    fn name(&self) -> &str;

    /// Reads candidate rows of `table`.
    ///
    /// Version-column tables return rows whose version is greater than
    /// `since` (every row when `since` is `None`). Content-hash tables
    /// return every row.
    async fn scan(&self, table: &TableSpec, since: Option<Timestamp>) -> SyncResult<Vec<Row>>;

    /// Upserts every record atomically: either all rows land or none do.
    async fn apply_batch(&self, table: &TableSpec, records: &[ChangeRecord]) -> SyncResult<()>;
}

/// A batch of rows written by [`MemoryStore::apply_batch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedBatch {
    /// Table written.
    pub table: String,
    /// Keys written, in batch order.
    pub keys: Vec<PrimaryKey>,
}

/// Thread-safe in-memory store.
///
/// Used by tests and embedders. It can be switched offline, made to fail
/// writes only, slowed down, or have individual tables report a schema
/// mismatch.
#[derive(Debug)]
pub struct MemoryStore {
    name: String,
    tables: RwLock<HashMap<String, BTreeMap<PrimaryKey, Row>>>,
    mismatched: RwLock<HashSet<String>>,
    applied: RwLock<Vec<AppliedBatch>>,
    online: AtomicBool,
    writable: AtomicBool,
    latency_ms: AtomicU64,
}

impl MemoryStore {
    /// Creates an empty online store.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tables: RwLock::new(HashMap::new()),
            mismatched: RwLock::new(HashSet::new()),
            applied: RwLock::new(Vec::new()),
            online: AtomicBool::new(true),
            writable: AtomicBool::new(true),
            latency_ms: AtomicU64::new(0),
        }
    }

    /// Inserts or replaces a row directly, as a local application would.
    pub fn put(&self, table: &str, key: PrimaryKey, row: Row) {
        self.tables
            .write()
            .entry(table.to_string())
            .or_default()
            .insert(key, row);
    }

    /// Returns a row.
    pub fn get(&self, table: &str, key: &PrimaryKey) -> Option<Row> {
        self.tables.read().get(table).and_then(|t| t.get(key).cloned())
    }

    /// Returns every row of a table in key order.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.tables
            .read()
            .get(table)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Makes every call fail with `StoreUnavailable` while offline.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Makes writes fail with `StoreUnavailable` while reads keep working.
    pub fn set_writable(&self, writable: bool) {
        self.writable.store(writable, Ordering::SeqCst);
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Makes `table` report a schema mismatch.
    pub fn mark_mismatched(&self, table: &str) {
        self.mismatched.write().insert(table.to_string());
    }

    /// Clears a schema mismatch.
    pub fn clear_mismatched(&self, table: &str) {
        self.mismatched.write().remove(table);
    }

    /// Batches written through [`Store::apply_batch`], oldest first.
    pub fn applied_batches(&self) -> Vec<AppliedBatch> {
        self.applied.read().clone()
    }

    /// Total rows written through [`Store::apply_batch`].
    pub fn write_count(&self) -> usize {
        self.applied.read().iter().map(|b| b.keys.len()).sum()
    }

    async fn enter(&self, table: &TableSpec) -> SyncResult<()> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if !self.online.load(Ordering::SeqCst) {
            return Err(SyncError::store_unavailable(&self.name, "store is offline"));
        }
        if self.mismatched.read().contains(&table.name) {
            return Err(SyncError::schema_mismatch(
                &self.name,
                &table.name,
                "table shape does not match its definition",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn scan(&self, table: &TableSpec, since: Option<Timestamp>) -> SyncResult<Vec<Row>> {
        self.enter(table).await?;

        let tables = self.tables.read();
        let Some(rows) = tables.get(&table.name) else {
            return Ok(Vec::new());
        };

        let mut out = Vec::new();
        for row in rows.values() {
            let version = table
                .version_of(row)
                .map_err(|e| SyncError::schema_mismatch(&self.name, &table.name, e.to_string()))?;
            match (version, since) {
                (Some(v), Some(since)) if v <= since => {}
                _ => out.push(row.clone()),
            }
        }
        Ok(out)
    }

    async fn apply_batch(&self, table: &TableSpec, records: &[ChangeRecord]) -> SyncResult<()> {
        self.enter(table).await?;
        if !self.writable.load(Ordering::SeqCst) {
            return Err(SyncError::store_unavailable(&self.name, "store rejected write"));
        }

        let mut tables = self.tables.write();
        let rows = tables.entry(table.name.clone()).or_default();
        for record in records {
            rows.insert(record.primary_key.clone(), record.column_values.clone());
        }
        self.applied.write().push(AppliedBatch {
            table: table.name.clone(),
            keys: records.iter().map(|r| r.primary_key.clone()).collect(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relsync_protocol::ColumnValue;

    fn row(id: i64, v: i64, val: &str) -> Row {
        let mut row = Row::new();
        row.insert("id".into(), ColumnValue::Integer(id));
        row.insert("v".into(), ColumnValue::Integer(v));
        row.insert("val".into(), ColumnValue::Text(val.into()));
        row
    }

    #[tokio::test]
    async fn scan_filters_by_version() {
        let store = MemoryStore::new("a");
        let spec = TableSpec::versioned("t", &["id"], "v");
        store.put("t", PrimaryKey::single(1), row(1, 10, "x"));
        store.put("t", PrimaryKey::single(2), row(2, 20, "y"));

        assert_eq!(store.scan(&spec, None).await.unwrap().len(), 2);
        assert_eq!(store.scan(&spec, Some(10)).await.unwrap().len(), 1);
        assert!(store.scan(&spec, Some(20)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn hashed_tables_scan_everything() {
        let store = MemoryStore::new("a");
        let spec = TableSpec::hashed("t", &["id"]);
        store.put("t", PrimaryKey::single(1), row(1, 10, "x"));
        assert_eq!(store.scan(&spec, Some(99)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn offline_and_mismatch() {
        let store = MemoryStore::new("a");
        let spec = TableSpec::versioned("t", &["id"], "v");

        store.set_online(false);
        assert!(matches!(
            store.scan(&spec, None).await,
            Err(SyncError::StoreUnavailable { .. })
        ));
        store.set_online(true);

        store.mark_mismatched("t");
        assert!(matches!(
            store.scan(&spec, None).await,
            Err(SyncError::SchemaMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn read_only_store_rejects_batches() {
        let store = MemoryStore::new("a");
        let spec = TableSpec::versioned("t", &["id"], "v");
        let record = ChangeRecord::new("p", "t", PrimaryKey::single(1), row(1, 1, "x"), "b", 1);

        store.set_writable(false);
        assert!(store.apply_batch(&spec, &[record.clone()]).await.is_err());
        assert_eq!(store.write_count(), 0);

        store.set_writable(true);
        store.apply_batch(&spec, &[record]).await.unwrap();
        assert_eq!(store.write_count(), 1);
        assert!(store.get("t", &PrimaryKey::single(1)).is_some());
    }
}
