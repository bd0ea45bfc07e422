//! Discrete engine events and the optional log hook.

use crate::ledger::{LedgerEvent, SessionLedger};
use relsync_protocol::{now_millis, ChangeRecord, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{error, warn};

/// Kind of a discrete event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A store or table error during a cycle.
    SyncError,
    /// A conflict was left unresolved because its policy failed.
    ConflictSkip,
    /// A peer queue dropped its oldest change.
    QueueOverflow,
    /// An inbound change was rejected by the apply callback.
    ApplyError,
    /// A cycle was aborted by its timeout.
    CycleTimeout,
    /// The log hook itself failed.
    LogHookError,
}

impl EventKind {
    /// Stable snake_case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::SyncError => "sync_error",
            EventKind::ConflictSkip => "conflict_skip",
            EventKind::QueueOverflow => "queue_overflow",
            EventKind::ApplyError => "apply_error",
            EventKind::CycleTimeout => "cycle_timeout",
            EventKind::LogHookError => "log_hook_error",
        }
    }

    /// Parses a stored name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sync_error" => Some(EventKind::SyncError),
            "conflict_skip" => Some(EventKind::ConflictSkip),
            "queue_overflow" => Some(EventKind::QueueOverflow),
            "apply_error" => Some(EventKind::ApplyError),
            "cycle_timeout" => Some(EventKind::CycleTimeout),
            "log_hook_error" => Some(EventKind::LogHookError),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A discrete event raised by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// A store or table error during a cycle.
    SyncError {
        /// Pair id.
        pair_id: String,
        /// Table, when the error is table-scoped or a write failed.
        table: Option<String>,
        /// Keys affected, formatted.
        keys: Vec<String>,
        /// Error text.
        error: String,
    },
    /// A conflict was skipped.
    ConflictSkip {
        /// Pair id.
        pair_id: String,
        /// Table.
        table: String,
        /// Key, formatted.
        key: String,
        /// Error text.
        error: String,
    },
    /// A peer queue overflowed and dropped `dropped`.
    QueueOverflow {
        /// Peer the queue feeds.
        peer_id: String,
        /// The change that was dropped.
        dropped: ChangeRecord,
    },
    /// An inbound change was rejected.
    ApplyError {
        /// Node the change came from.
        peer_id: String,
        /// The rejected change.
        record: ChangeRecord,
        /// Error text.
        error: String,
    },
    /// A cycle was aborted.
    CycleTimeout {
        /// Pair id.
        pair_id: String,
        /// Configured timeout.
        timeout_ms: u64,
    },
}

impl SyncEvent {
    /// Kind of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            SyncEvent::SyncError { .. } => EventKind::SyncError,
            SyncEvent::ConflictSkip { .. } => EventKind::ConflictSkip,
            SyncEvent::QueueOverflow { .. } => EventKind::QueueOverflow,
            SyncEvent::ApplyError { .. } => EventKind::ApplyError,
            SyncEvent::CycleTimeout { .. } => EventKind::CycleTimeout,
        }
    }

    /// Structured payload handed to the hook and stored in the ledger.
    pub fn payload(&self, at: Timestamp) -> Value {
        match self {
            SyncEvent::SyncError {
                pair_id,
                table,
                keys,
                error,
            } => json!({
                "pair": pair_id,
                "table": table,
                "keys": keys,
                "error": error,
                "at": at,
            }),
            SyncEvent::ConflictSkip {
                pair_id,
                table,
                key,
                error,
            } => json!({
                "pair": pair_id,
                "table": table,
                "key": key,
                "error": error,
                "at": at,
            }),
            SyncEvent::QueueOverflow { peer_id, dropped } => json!({
                "pair": dropped.pair_id,
                "peer": peer_id,
                "table": dropped.table,
                "key": dropped.primary_key.to_string(),
                "observedAt": dropped.observed_at,
                "at": at,
            }),
            SyncEvent::ApplyError {
                peer_id,
                record,
                error,
            } => json!({
                "pair": record.pair_id,
                "peer": peer_id,
                "table": record.table,
                "key": record.primary_key.to_string(),
                "observedAt": record.observed_at,
                "error": error,
                "at": at,
            }),
            SyncEvent::CycleTimeout {
                pair_id,
                timeout_ms,
            } => json!({
                "pair": pair_id,
                "timeoutMs": timeout_ms,
                "at": at,
            }),
        }
    }
}

/// Observer for engine events.
///
/// Failures, including panics, never reach the engine; they are logged
/// as `log_hook_error`.
pub trait EventHook: Send + Sync {
    /// Called once per event.
    fn on_event(&self, kind: EventKind, payload: &Value) -> Result<(), String>;
}

impl<F> EventHook for F
where
    F: Fn(EventKind, &Value) -> Result<(), String> + Send + Sync,
{
    fn on_event(&self, kind: EventKind, payload: &Value) -> Result<(), String> {
        self(kind, payload)
    }
}

/// Fans events out to tracing, the ledger and the hook.
#[derive(Clone)]
pub struct EventSink {
    ledger: Arc<dyn SessionLedger>,
    hook: Option<Arc<dyn EventHook>>,
}

impl EventSink {
    /// Creates a sink writing to `ledger`.
    pub fn new(ledger: Arc<dyn SessionLedger>) -> Self {
        Self { ledger, hook: None }
    }

    /// Adds a hook.
    pub fn with_hook(mut self, hook: Arc<dyn EventHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// The ledger events are written to.
    pub fn ledger(&self) -> &Arc<dyn SessionLedger> {
        &self.ledger
    }

    /// Records an event.
    pub async fn emit(&self, event: SyncEvent) {
        let kind = event.kind();
        let at = now_millis();
        let payload = event.payload(at);
        warn!(event = kind.as_str(), %payload, "sync event");

        self.store(kind, payload.clone(), at).await;

        if let Some(hook) = &self.hook {
            let outcome = catch_unwind(AssertUnwindSafe(|| hook.on_event(kind, &payload)));
            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(message)) => Some(message),
                Err(_) => Some("hook panicked".to_string()),
            };
            if let Some(message) = failure {
                error!(event = "log_hook_error", source_event = kind.as_str(), %message);
                self.store(
                    EventKind::LogHookError,
                    json!({ "event": kind.as_str(), "error": message, "at": at }),
                    at,
                )
                .await;
            }
        }
    }

    async fn store(&self, kind: EventKind, payload: Value, at: Timestamp) {
        let event = LedgerEvent {
            kind,
            payload,
            recorded_at: at,
        };
        if let Err(e) = self.ledger.record_event(&event).await {
            error!(event = kind.as_str(), error = %e, "failed to record event");
        }
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink")
            .field("hook", &self.hook.is_some())
            .finish()
    }
}
