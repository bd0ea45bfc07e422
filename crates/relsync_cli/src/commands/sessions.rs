//! Sessions command implementation.

use super::open_ledger;
use relsync_engine::SessionLedger;
use relsync_protocol::SyncSession;

/// Runs the sessions command.
pub async fn run(ledger_url: &str, limit: usize, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let ledger = open_ledger(Some(ledger_url)).await?;
    let sessions = ledger.recent_sessions(limit).await?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&sessions)?);
        }
        _ => {
            print_text_output(&sessions);
        }
    }

    Ok(())
}

fn print_text_output(sessions: &[SyncSession]) {
    if sessions.is_empty() {
        println!("No sessions recorded");
        return;
    }

    println!(
        "{:<36}  {:<16}  {:<9}  {:>7}  {:>9}  {:>7}  {:>8}",
        "SESSION", "PAIR", "STATUS", "APPLIED", "CONFLICTS", "SKIPPED", "MS"
    );
    for session in sessions {
        let duration = session
            .duration_ms()
            .map(|ms| ms.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<36}  {:<16}  {:<9}  {:>7}  {:>9}  {:>7}  {:>8}",
            session.session_id,
            session.pair_id,
            session.status.as_str(),
            session.changes_applied,
            session.conflicts_resolved,
            session.tables_skipped,
            duration
        );
        if let Some(error) = &session.error {
            println!("    error: {}", error);
        }
    }
}
