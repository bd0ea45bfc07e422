//! Events command implementation.

use super::open_ledger;
use relsync_engine::{EventKind, LedgerEvent, SessionLedger};

/// Runs the events command.
///
/// With a `kind` filter the limit applies after filtering.
pub async fn run(
    ledger_url: &str,
    limit: usize,
    kind: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let kind = kind
        .map(|k| EventKind::parse(k).ok_or_else(|| format!("Unknown event kind: {}", k)))
        .transpose()?;

    let ledger = open_ledger(Some(ledger_url)).await?;
    let fetch = if kind.is_some() { usize::MAX } else { limit };
    let events = filter(ledger.recent_events(fetch).await?, kind, limit);

    if events.is_empty() {
        println!("No events recorded");
    }
    for event in &events {
        println!(
            "{}  {:<16}  {}",
            event.recorded_at,
            event.kind.as_str(),
            serde_json::to_string(&event.payload)?
        );
    }

    Ok(())
}

fn filter(events: Vec<LedgerEvent>, kind: Option<EventKind>, limit: usize) -> Vec<LedgerEvent> {
    events
        .into_iter()
        .filter(|e| kind.map_or(true, |k| e.kind == k))
        .take(limit)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(kind: EventKind, at: i64) -> LedgerEvent {
        LedgerEvent {
            kind,
            payload: json!({ "at": at }),
            recorded_at: at,
        }
    }

    #[test]
    fn filters_by_kind_before_limiting() {
        let events = vec![
            event(EventKind::SyncError, 5),
            event(EventKind::QueueOverflow, 4),
            event(EventKind::SyncError, 3),
            event(EventKind::SyncError, 2),
        ];

        let errors = filter(events.clone(), Some(EventKind::SyncError), 2);
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[1].recorded_at, 3);

        assert_eq!(filter(events, None, 3).len(), 3);
    }
}
