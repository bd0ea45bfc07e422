//! Apply callbacks for changes received from peers.

use crate::error::{SyncError, SyncResult};
use crate::store::Store;
use async_trait::async_trait;
use parking_lot::RwLock;
use relsync_protocol::{ChangeRecord, TableSpec};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Applies a change received from a peer to local state.
#[async_trait]
pub trait RemoteApplier: Send + Sync {
    /// Applies one change. An error skips this change only.
    async fn apply(&self, record: &ChangeRecord) -> SyncResult<()>;
}

fn rejected(record: &ChangeRecord, message: impl Into<String>) -> SyncError {
    SyncError::ApplyCallback {
        table: record.table.clone(),
        key: record.primary_key.to_string(),
        message: message.into(),
    }
}

/// Collects applied changes in memory.
#[derive(Debug, Default)]
pub struct MemoryApplier {
    applied: RwLock<Vec<ChangeRecord>>,
    rejected_tables: RwLock<HashSet<String>>,
}

impl MemoryApplier {
    /// Creates an empty applier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every change for `table` fail.
    pub fn reject_table(&self, table: impl Into<String>) {
        self.rejected_tables.write().insert(table.into());
    }

    /// Changes applied so far, in order.
    pub fn applied(&self) -> Vec<ChangeRecord> {
        self.applied.read().clone()
    }

    /// Number of changes applied.
    pub fn len(&self) -> usize {
        self.applied.read().len()
    }

    /// Returns true if nothing was applied.
    pub fn is_empty(&self) -> bool {
        self.applied.read().is_empty()
    }
}

#[async_trait]
impl RemoteApplier for MemoryApplier {
    async fn apply(&self, record: &ChangeRecord) -> SyncResult<()> {
        if self.rejected_tables.read().contains(&record.table) {
            return Err(rejected(record, "table rejected"));
        }
        self.applied.write().push(record.clone());
        Ok(())
    }
}

/// Writes inbound changes into the local side of their pair.
///
/// Changes for unknown pairs or tables are rejected. Once written, the
/// local coordinator picks the change up like any other local edit.
pub struct StoreApplier {
    targets: HashMap<String, (Arc<dyn Store>, HashMap<String, TableSpec>)>,
}

impl StoreApplier {
    /// Creates an applier with no pairs.
    pub fn new() -> Self {
        Self {
            targets: HashMap::new(),
        }
    }

    /// Routes changes for `pair_id` into `store`.
    pub fn with_pair(mut self, pair_id: impl Into<String>, store: Arc<dyn Store>, tables: &[TableSpec]) -> Self {
        let tables = tables.iter().map(|t| (t.name.clone(), t.clone())).collect();
        self.targets.insert(pair_id.into(), (store, tables));
        self
    }
}

impl Default for StoreApplier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteApplier for StoreApplier {
    async fn apply(&self, record: &ChangeRecord) -> SyncResult<()> {
        let (store, tables) = self
            .targets
            .get(&record.pair_id)
            .ok_or_else(|| rejected(record, format!("unknown pair {}", record.pair_id)))?;
        let table = tables
            .get(&record.table)
            .ok_or_else(|| rejected(record, "unknown table"))?;
        store
            .apply_batch(table, std::slice::from_ref(record))
            .await
            .map_err(|e| rejected(record, e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use relsync_protocol::{ColumnValue, PrimaryKey, Row};

    fn record(pair: &str, table: &str) -> ChangeRecord {
        let mut row = Row::new();
        row.insert("id".into(), ColumnValue::Integer(1));
        row.insert("v".into(), ColumnValue::Integer(5));
        ChangeRecord::new(pair, table, PrimaryKey::single(1), row, "remote", 5)
    }

    #[tokio::test]
    async fn memory_applier_can_reject() {
        let applier = MemoryApplier::new();
        applier.reject_table("locked");

        applier.apply(&record("p", "t")).await.unwrap();
        assert!(matches!(
            applier.apply(&record("p", "locked")).await,
            Err(SyncError::ApplyCallback { .. })
        ));
        assert_eq!(applier.len(), 1);
    }

    #[tokio::test]
    async fn store_applier_writes_local_side() {
        let store = Arc::new(MemoryStore::new("local"));
        let applier = StoreApplier::new().with_pair(
            "p",
            store.clone(),
            &[TableSpec::versioned("t", &["id"], "v")],
        );

        applier.apply(&record("p", "t")).await.unwrap();
        assert!(store.get("t", &PrimaryKey::single(1)).is_some());

        assert!(applier.apply(&record("q", "t")).await.is_err());
        assert!(applier.apply(&record("p", "other")).await.is_err());
    }
}
