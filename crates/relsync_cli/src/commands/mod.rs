//! CLI command implementations.

pub mod check;
pub mod events;
pub mod run;
pub mod sessions;

use relsync_engine::{MemoryLedger, MemoryStore, SessionLedger, SqliteLedger, SqliteStore, Store};
use std::sync::Arc;

/// Opens a store from its configured URL.
///
/// `sqlite://` URLs open (or create) a SQLite database; `memory://` gives an
/// empty in-memory store.
pub async fn open_store(
    name: &str,
    url: &str,
) -> Result<Arc<dyn Store>, Box<dyn std::error::Error>> {
    if url.starts_with("sqlite:") {
        Ok(Arc::new(SqliteStore::connect(name, url).await?))
    } else if url.starts_with("memory:") {
        Ok(Arc::new(MemoryStore::new(name)))
    } else {
        Err(format!("Unsupported store URL for '{}': {}", name, url).into())
    }
}

/// Opens a ledger. `None` keeps the ledger in memory.
pub async fn open_ledger(
    url: Option<&str>,
) -> Result<Arc<dyn SessionLedger>, Box<dyn std::error::Error>> {
    match url {
        None => Ok(Arc::new(MemoryLedger::new())),
        Some(url) if url.starts_with("memory:") => Ok(Arc::new(MemoryLedger::new())),
        Some(url) if url.starts_with("sqlite:") => Ok(Arc::new(SqliteLedger::connect(url).await?)),
        Some(url) => Err(format!("Unsupported ledger URL: {}", url).into()),
    }
}
