//! Change detection.

use crate::error::{SyncError, SyncResult};
use crate::store::Store;
use relsync_protocol::{ChangeRecord, ContentHash, PrimaryKey, TableSpec, Timestamp};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::debug;

/// Per-table progress of a pair.
///
/// `synced` holds the content hash each key had after it was last written
/// or confirmed equal on both sides. A scanned row with that same hash is
/// not a change, which keeps the engine from echoing its own writes back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableCursor {
    /// Highest version seen on the source.
    pub source_since: Option<Timestamp>,
    /// Highest version seen on the target.
    pub target_since: Option<Timestamp>,
    /// Last synced content per key.
    pub synced: HashMap<PrimaryKey, ContentHash>,
}

impl TableCursor {
    /// Raises a high-water mark; never lowers it.
    pub fn advance(current: Option<Timestamp>, seen: Option<Timestamp>) -> Option<Timestamp> {
        match (current, seen) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }
}

/// Changes found on one side of a pair for one table.
#[derive(Debug, Clone, Default)]
pub struct Detection {
    /// Net change per key.
    pub changes: BTreeMap<PrimaryKey, ChangeRecord>,
    /// Highest version among detected changes.
    ///
    /// Rows suppressed as already synced do not count: their versions may
    /// come from the other store.
    pub high_water: Option<Timestamp>,
}

/// Turns store scans into change records.
#[derive(Debug, Clone)]
pub struct ChangeDetector {
    store_timeout: Duration,
}

impl ChangeDetector {
    /// Creates a detector whose scans give up after `store_timeout`.
    pub fn new(store_timeout: Duration) -> Self {
        Self { store_timeout }
    }

    /// Returns the changes on `store` since `since`.
    ///
    /// Keys whose content matches `synced` are dropped. When a store hands
    /// back several rows for one key, the one with the latest `observed_at`
    /// is kept. Rows missing a key or version column make the whole table
    /// a [`SyncError::SchemaMismatch`].
    ///
    /// Rows without a version column are stamped with `scanned_at`. Callers
    /// pass the same value for both sides of a pair so that last-write-wins
    /// falls through to its origin tie-break on such tables.
    pub async fn detect(
        &self,
        store: &dyn Store,
        pair_id: &str,
        table: &TableSpec,
        since: Option<Timestamp>,
        synced: &HashMap<PrimaryKey, ContentHash>,
        scanned_at: Timestamp,
    ) -> SyncResult<Detection> {
        let rows = tokio::time::timeout(self.store_timeout, store.scan(table, since))
            .await
            .map_err(|_| {
                SyncError::store_unavailable(
                    store.name(),
                    format!("scan exceeded {}ms", self.store_timeout.as_millis()),
                )
            })??;

        let mismatch = |e: relsync_protocol::ProtocolError| {
            SyncError::schema_mismatch(store.name(), &table.name, e.to_string())
        };

        let mut detection = Detection::default();
        for row in rows {
            let key = table.primary_key_of(&row).map_err(mismatch)?;
            let version = table.version_of(&row).map_err(mismatch)?;

            if let (Some(v), Some(since)) = (version, since) {
                if v <= since {
                    continue;
                }
            }

            let record = ChangeRecord::new(
                pair_id,
                &table.name,
                key.clone(),
                row,
                store.name(),
                version.unwrap_or(scanned_at),
            );
            if synced.get(&key) == Some(&record.content_hash) {
                continue;
            }
            detection.high_water = TableCursor::advance(detection.high_water, version);

            match detection.changes.get(&key) {
                Some(existing) if existing.observed_at >= record.observed_at => {}
                _ => {
                    detection.changes.insert(key, record);
                }
            }
        }

        debug!(
            store = store.name(),
            table = %table.name,
            changes = detection.changes.len(),
            "scan complete"
        );
        Ok(detection)
    }
}
