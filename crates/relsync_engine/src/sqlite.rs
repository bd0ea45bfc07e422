//! SQLite store adapter and ledger, backed by `sqlx`.

use crate::error::{SyncError, SyncResult};
use crate::events::EventKind;
use crate::ledger::{LedgerEvent, SessionLedger};
use crate::store::Store;
use async_trait::async_trait;
use relsync_protocol::{
    validate_identifier, ChangeRecord, ColumnValue, ConflictDecision, Row, SessionStatus,
    SyncSession, TableSpec, Timestamp,
};
use sqlx::query::Query;
use sqlx::sqlite::{
    Sqlite, SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePool,
    SqlitePoolOptions, SqliteRow,
};
use sqlx::{Column, Row as _, TypeInfo, ValueRef};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

async fn open_pool(url: &str) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));
    SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await
}

fn is_schema_error(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db) => {
            let message = db.message();
            message.contains("no such table")
                || message.contains("no such column")
                || message.contains("has no column named")
        }
        sqlx::Error::ColumnNotFound(_) | sqlx::Error::ColumnDecode { .. } => true,
        _ => false,
    }
}

fn quote(identifier: &str) -> String {
    format!("\"{identifier}\"")
}

fn decode_value(row: &SqliteRow, index: usize) -> Result<ColumnValue, sqlx::Error> {
    let raw = row.try_get_raw(index)?;
    if raw.is_null() {
        return Ok(ColumnValue::Null);
    }
    let type_name = raw.type_info().name().to_ascii_uppercase();
    Ok(match type_name.as_str() {
        "INTEGER" | "INT" | "BIGINT" | "BOOLEAN" => {
            ColumnValue::Integer(row.try_get_unchecked::<i64, _>(index)?)
        }
        "REAL" | "FLOAT" | "DOUBLE" | "NUMERIC" => {
            ColumnValue::Real(row.try_get_unchecked::<f64, _>(index)?)
        }
        "BLOB" => ColumnValue::Blob(row.try_get_unchecked::<Vec<u8>, _>(index)?),
        _ => ColumnValue::Text(row.try_get_unchecked::<String, _>(index)?),
    })
}

fn decode_row(row: &SqliteRow) -> Result<Row, sqlx::Error> {
    let mut out = Row::new();
    for (index, column) in row.columns().iter().enumerate() {
        out.insert(column.name().to_string(), decode_value(row, index)?);
    }
    Ok(out)
}

fn bind_value<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &'q ColumnValue,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        ColumnValue::Null => query.bind(None::<i64>),
        ColumnValue::Integer(v) => query.bind(*v),
        ColumnValue::Real(v) => query.bind(*v),
        ColumnValue::Text(v) => query.bind(v.as_str()),
        ColumnValue::Blob(v) => query.bind(v.as_slice()),
    }
}

/// A store over one SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    name: String,
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens (creating if missing) the database at `url`.
    pub async fn connect(name: impl Into<String>, url: &str) -> SyncResult<Self> {
        let name = name.into();
        let pool = open_pool(url)
            .await
            .map_err(|e| SyncError::store_unavailable(&name, e.to_string()))?;
        Ok(Self { name, pool })
    }

    /// Wraps an existing pool.
    pub fn from_pool(name: impl Into<String>, pool: SqlitePool) -> Self {
        Self {
            name: name.into(),
            pool,
        }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn map_error(&self, table: &TableSpec, error: sqlx::Error) -> SyncError {
        if is_schema_error(&error) {
            SyncError::schema_mismatch(&self.name, &table.name, error.to_string())
        } else {
            SyncError::store_unavailable(&self.name, error.to_string())
        }
    }
}

#[async_trait]
impl Store for SqliteStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn scan(&self, table: &TableSpec, since: Option<Timestamp>) -> SyncResult<Vec<Row>> {
        table.validate()?;
        let name = quote(&table.name);
        let rows = match (table.version_column(), since) {
            (Some(column), Some(since)) => {
                let column = quote(column);
                let sql = format!("SELECT * FROM {name} WHERE {column} > ? ORDER BY {column}");
                sqlx::query(&sql).bind(since).fetch_all(&self.pool).await
            }
            (Some(column), None) => {
                let sql = format!("SELECT * FROM {name} ORDER BY {}", quote(column));
                sqlx::query(&sql).fetch_all(&self.pool).await
            }
            (None, _) => {
                let sql = format!("SELECT * FROM {name}");
                sqlx::query(&sql).fetch_all(&self.pool).await
            }
        }
        .map_err(|e| self.map_error(table, e))?;

        rows.iter()
            .map(|row| decode_row(row).map_err(|e| self.map_error(table, e)))
            .collect()
    }

    async fn apply_batch(&self, table: &TableSpec, records: &[ChangeRecord]) -> SyncResult<()> {
        table.validate()?;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| self.map_error(table, e))?;

        for record in records {
            let mut columns = Vec::with_capacity(record.column_values.len());
            for column in record.column_values.keys() {
                validate_identifier(column).map_err(|e| {
                    SyncError::schema_mismatch(&self.name, &table.name, e.to_string())
                })?;
                columns.push(quote(column));
            }
            let placeholders = vec!["?"; columns.len()].join(", ");
            let sql = format!(
                "INSERT OR REPLACE INTO {} ({}) VALUES ({})",
                quote(&table.name),
                columns.join(", "),
                placeholders
            );

            let mut query = sqlx::query(&sql);
            for value in record.column_values.values() {
                query = bind_value(query, value);
            }
            query
                .execute(&mut *tx)
                .await
                .map_err(|e| self.map_error(table, e))?;
        }

        tx.commit().await.map_err(|e| self.map_error(table, e))
    }
}

const LEDGER_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS sync_sessions (
        session_id TEXT PRIMARY KEY,
        pair_id TEXT NOT NULL,
        started_at INTEGER NOT NULL,
        ended_at INTEGER,
        changes_applied INTEGER NOT NULL,
        conflicts_resolved INTEGER NOT NULL,
        tables_skipped INTEGER NOT NULL,
        status TEXT NOT NULL,
        error TEXT
    )",
    "CREATE INDEX IF NOT EXISTS sync_sessions_started ON sync_sessions (started_at)",
    "CREATE TABLE IF NOT EXISTS conflict_decisions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        pair_id TEXT NOT NULL,
        table_name TEXT NOT NULL,
        row_key TEXT NOT NULL,
        policy TEXT NOT NULL,
        winner_origin TEXT NOT NULL,
        reason TEXT NOT NULL,
        decided_at INTEGER NOT NULL,
        decision TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS sync_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        kind TEXT NOT NULL,
        payload TEXT NOT NULL,
        recorded_at INTEGER NOT NULL
    )",
];

type SessionRow = (
    String,
    String,
    i64,
    Option<i64>,
    i64,
    i64,
    i64,
    String,
    Option<String>,
);

fn ledger_error(error: impl std::fmt::Display) -> SyncError {
    SyncError::Ledger(error.to_string())
}

/// Session ledger stored in SQLite.
#[derive(Debug, Clone)]
pub struct SqliteLedger {
    pool: SqlitePool,
}

impl SqliteLedger {
    /// Opens the ledger at `url`, creating its tables if missing.
    pub async fn connect(url: &str) -> SyncResult<Self> {
        let pool = open_pool(url).await.map_err(ledger_error)?;
        Self::from_pool(pool).await
    }

    /// Uses an existing pool, creating the ledger tables if missing.
    pub async fn from_pool(pool: SqlitePool) -> SyncResult<Self> {
        for statement in LEDGER_SCHEMA {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .map_err(ledger_error)?;
        }
        Ok(Self { pool })
    }
}

#[async_trait]
impl SessionLedger for SqliteLedger {
    async fn record_session(&self, session: &SyncSession) -> SyncResult<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO sync_sessions
             (session_id, pair_id, started_at, ended_at, changes_applied,
              conflicts_resolved, tables_skipped, status, error)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(session.session_id.to_string())
        .bind(&session.pair_id)
        .bind(session.started_at)
        .bind(session.ended_at)
        .bind(session.changes_applied as i64)
        .bind(session.conflicts_resolved as i64)
        .bind(session.tables_skipped as i64)
        .bind(session.status.as_str())
        .bind(session.error.as_deref())
        .execute(&self.pool)
        .await
        .map_err(ledger_error)?;
        Ok(())
    }

    async fn record_decision(&self, decision: &ConflictDecision) -> SyncResult<()> {
        let encoded = serde_json::to_string(decision).map_err(ledger_error)?;
        sqlx::query(
            "INSERT INTO conflict_decisions
             (pair_id, table_name, row_key, policy, winner_origin, reason, decided_at, decision)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&decision.local.pair_id)
        .bind(&decision.local.table)
        .bind(decision.local.primary_key.to_string())
        .bind(&decision.policy_name)
        .bind(&decision.winner.origin_store)
        .bind(&decision.reason)
        .bind(decision.decided_at)
        .bind(encoded)
        .execute(&self.pool)
        .await
        .map_err(ledger_error)?;
        Ok(())
    }

    async fn record_event(&self, event: &LedgerEvent) -> SyncResult<()> {
        sqlx::query("INSERT INTO sync_events (kind, payload, recorded_at) VALUES (?, ?, ?)")
            .bind(event.kind.as_str())
            .bind(event.payload.to_string())
            .bind(event.recorded_at)
            .execute(&self.pool)
            .await
            .map_err(ledger_error)?;
        Ok(())
    }

    async fn recent_sessions(&self, limit: usize) -> SyncResult<Vec<SyncSession>> {
        let rows = sqlx::query_as::<_, SessionRow>(
            "SELECT session_id, pair_id, started_at, ended_at, changes_applied,
                    conflicts_resolved, tables_skipped, status, error
             FROM sync_sessions ORDER BY started_at DESC, rowid DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(ledger_error)?;

        rows.into_iter()
            .map(
                |(id, pair_id, started_at, ended_at, applied, conflicts, skipped, status, error)| -> SyncResult<SyncSession> {
                Ok(SyncSession {
                    session_id: Uuid::parse_str(&id).map_err(ledger_error)?,
                    pair_id,
                    started_at,
                    ended_at,
                    changes_applied: applied as u64,
                    conflicts_resolved: conflicts as u64,
                    tables_skipped: skipped as u64,
                    status: SessionStatus::parse(&status)
                        .ok_or_else(|| ledger_error(format!("unknown status {status}")))?,
                    error,
                })
            })
            .collect()
    }

    async fn recent_events(&self, limit: usize) -> SyncResult<Vec<LedgerEvent>> {
        let rows = sqlx::query_as::<_, (String, String, i64)>(
            "SELECT kind, payload, recorded_at FROM sync_events ORDER BY id DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(ledger_error)?;

        rows.into_iter()
            .map(|(kind, payload, recorded_at)| -> SyncResult<LedgerEvent> {
                Ok(LedgerEvent {
                    kind: EventKind::parse(&kind)
                        .ok_or_else(|| ledger_error(format!("unknown event kind {kind}")))?,
                    payload: serde_json::from_str(&payload).map_err(ledger_error)?,
                    recorded_at,
                })
            })
            .collect()
    }

    async fn decisions_for(&self, pair_id: &str) -> SyncResult<Vec<ConflictDecision>> {
        let rows = sqlx::query_as::<_, (String,)>(
            "SELECT decision FROM conflict_decisions WHERE pair_id = ? ORDER BY id",
        )
        .bind(pair_id)
        .fetch_all(&self.pool)
        .await
        .map_err(ledger_error)?;

        rows.into_iter()
            .map(|(decision,)| serde_json::from_str(&decision).map_err(ledger_error))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relsync_protocol::{PrimaryKey, ResolverPolicy};
    use tempfile::TempDir;

    async fn store(dir: &TempDir, name: &str) -> SqliteStore {
        let path = dir.path().join(format!("{name}.db"));
        let store = SqliteStore::connect(name, &format!("sqlite://{}", path.display()))
            .await
            .unwrap();
        sqlx::query("CREATE TABLE scripts (id INTEGER PRIMARY KEY, body TEXT, score REAL, updated_at INTEGER NOT NULL)")
            .execute(store.pool())
            .await
            .unwrap();
        store
    }

    fn script(id: i64, body: &str, updated_at: i64) -> Row {
        let mut row = Row::new();
        row.insert("id".into(), ColumnValue::Integer(id));
        row.insert("body".into(), ColumnValue::Text(body.into()));
        row.insert("score".into(), ColumnValue::Null);
        row.insert("updated_at".into(), ColumnValue::Integer(updated_at));
        row
    }

    #[tokio::test]
    async fn upsert_and_scan() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, "primary").await;
        let spec = TableSpec::versioned("scripts", &["id"], "updated_at");

        let records: Vec<ChangeRecord> = [(1, "a", 10), (2, "b", 20)]
            .into_iter()
            .map(|(id, body, at)| {
                ChangeRecord::new("p", "scripts", PrimaryKey::single(id), script(id, body, at), "x", at)
            })
            .collect();
        store.apply_batch(&spec, &records).await.unwrap();

        let all = store.scan(&spec, None).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0], script(1, "a", 10));

        let newer = store.scan(&spec, Some(10)).await.unwrap();
        assert_eq!(newer, vec![script(2, "b", 20)]);

        // replace keeps one row per key
        let update = ChangeRecord::new("p", "scripts", PrimaryKey::single(1), script(1, "c", 30), "x", 30);
        store.apply_batch(&spec, &[update]).await.unwrap();
        assert_eq!(store.scan(&spec, None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn missing_table_is_schema_mismatch() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, "primary").await;
        let spec = TableSpec::hashed("nope", &["id"]);

        assert!(matches!(
            store.scan(&spec, None).await,
            Err(SyncError::SchemaMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn failed_batch_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, "primary").await;
        let spec = TableSpec::versioned("scripts", &["id"], "updated_at");

        let good = ChangeRecord::new("p", "scripts", PrimaryKey::single(1), script(1, "a", 10), "x", 10);
        let mut bad_row = script(2, "b", 20);
        bad_row.insert("colour".into(), ColumnValue::Text("red".into()));
        let bad = ChangeRecord::new("p", "scripts", PrimaryKey::single(2), bad_row, "x", 20);

        assert!(store.apply_batch(&spec, &[good, bad]).await.is_err());
        assert!(store.scan(&spec, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn ledger_round_trip() {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite://{}", dir.path().join("ledger.db").display());
        let ledger = SqliteLedger::connect(&url).await.unwrap();

        let mut session = SyncSession::begin("scripts", 100);
        ledger.record_session(&session).await.unwrap();
        session.changes_applied = 4;
        session.complete(150);
        ledger.record_session(&session).await.unwrap();

        let sessions = ledger.recent_sessions(10).await.unwrap();
        assert_eq!(sessions, vec![session]);

        let local = ChangeRecord::new("scripts", "scripts", PrimaryKey::single(5), script(5, "a", 10), "x", 10);
        let remote = ChangeRecord::new("scripts", "scripts", PrimaryKey::single(5), script(5, "b", 20), "y", 20);
        let decision = ConflictDecision::decide(&ResolverPolicy::LastWriteWins, &local, &remote, 200).unwrap();
        ledger.record_decision(&decision).await.unwrap();
        assert_eq!(ledger.decisions_for("scripts").await.unwrap(), vec![decision]);

        ledger
            .record_event(&LedgerEvent {
                kind: EventKind::QueueOverflow,
                payload: serde_json::json!({"peer": "node-b"}),
                recorded_at: 300,
            })
            .await
            .unwrap();
        let events = ledger.recent_events(5).await.unwrap();
        assert_eq!(events[0].kind, EventKind::QueueOverflow);
        assert_eq!(events[0].payload["peer"], "node-b");
    }
}
