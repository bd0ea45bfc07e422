//! Run command implementation.

use super::{open_ledger, open_store};
use relsync_engine::{EngineConfig, Supervisor};
use std::path::Path;
use tracing::info;

/// Runs the engine until Ctrl-C, then stops every task gracefully.
pub async fn run(config_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let config = EngineConfig::from_file(config_path)?;

    let mut builder = Supervisor::builder(config.clone());
    for store in &config.stores {
        builder = builder.store(open_store(&store.name, &store.url).await?);
    }
    builder = builder.ledger(open_ledger(config.ledger.as_deref()).await?);

    let supervisor = builder.start().await?;
    if let Some(addr) = supervisor.listen_addr() {
        info!(%addr, "listening for peers");
    }

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    supervisor.stop_all().await;

    for session in supervisor.status() {
        info!(
            pair = %session.pair_id,
            status = %session.status,
            applied = session.changes_applied,
            "last session"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn invalid_config_fails_before_opening_stores() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = dir.path().join("primary.db");
        let config = format!(
            r#"{{
                "nodeId": "node-a",
                "stores": [{{"name": "primary", "url": "sqlite://{}"}}],
                "pairs": [{{
                    "id": "scripts", "source": "primary", "target": "missing",
                    "tables": [{{"name": "scripts", "primaryKey": ["id"]}}]
                }}]
            }}"#,
            db.display()
        );
        let path = dir.path().join("relsync.json");
        std::fs::write(&path, config).unwrap();

        let err = run(&path).await.unwrap_err();
        assert!(err.to_string().contains("missing"));
        assert!(!db.exists());
    }
}
