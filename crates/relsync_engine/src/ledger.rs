//! Session ledger.
//!
//! The ledger is the audit trail of the engine: one row per sync session,
//! one per conflict decision and one per discrete event. Conflict
//! decisions carry both input records, so a decision can be replayed from
//! the ledger alone.

use crate::error::SyncResult;
use crate::events::EventKind;
use async_trait::async_trait;
use parking_lot::RwLock;
use relsync_protocol::{ConflictDecision, SyncSession, Timestamp};
use serde::{Deserialize, Serialize};

/// A discrete event as stored in the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEvent {
    /// Event kind.
    pub kind: EventKind,
    /// Structured payload.
    pub payload: serde_json::Value,
    /// When the event was recorded.
    pub recorded_at: Timestamp,
}

/// Durable record of sessions, decisions and events.
#[async_trait]
pub trait SessionLedger: Send + Sync {
    /// Inserts or replaces a session, keyed by session id.
    async fn record_session(&self, session: &SyncSession) -> SyncResult<()>;

    /// Appends a conflict decision.
    async fn record_decision(&self, decision: &ConflictDecision) -> SyncResult<()>;

    /// Appends an event.
    async fn record_event(&self, event: &LedgerEvent) -> SyncResult<()>;

    /// Most recent sessions, newest first.
    async fn recent_sessions(&self, limit: usize) -> SyncResult<Vec<SyncSession>>;

    /// Most recent events, newest first.
    async fn recent_events(&self, limit: usize) -> SyncResult<Vec<LedgerEvent>>;

    /// Every decision made for a pair, oldest first.
    async fn decisions_for(&self, pair_id: &str) -> SyncResult<Vec<ConflictDecision>>;
}

/// In-memory ledger.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    sessions: RwLock<Vec<SyncSession>>,
    decisions: RwLock<Vec<ConflictDecision>>,
    events: RwLock<Vec<LedgerEvent>>,
}

impl MemoryLedger {
    /// Creates an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event of `kind`, oldest first.
    pub fn events_of(&self, kind: EventKind) -> Vec<LedgerEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    /// Every session of a pair, oldest first.
    pub fn sessions_for(&self, pair_id: &str) -> Vec<SyncSession> {
        self.sessions
            .read()
            .iter()
            .filter(|s| s.pair_id == pair_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl SessionLedger for MemoryLedger {
    async fn record_session(&self, session: &SyncSession) -> SyncResult<()> {
        let mut sessions = self.sessions.write();
        match sessions
            .iter_mut()
            .find(|s| s.session_id == session.session_id)
        {
            Some(existing) => *existing = session.clone(),
            None => sessions.push(session.clone()),
        }
        Ok(())
    }

    async fn record_decision(&self, decision: &ConflictDecision) -> SyncResult<()> {
        self.decisions.write().push(decision.clone());
        Ok(())
    }

    async fn record_event(&self, event: &LedgerEvent) -> SyncResult<()> {
        self.events.write().push(event.clone());
        Ok(())
    }

    async fn recent_sessions(&self, limit: usize) -> SyncResult<Vec<SyncSession>> {
        Ok(self.sessions.read().iter().rev().take(limit).cloned().collect())
    }

    async fn recent_events(&self, limit: usize) -> SyncResult<Vec<LedgerEvent>> {
        Ok(self.events.read().iter().rev().take(limit).cloned().collect())
    }

    async fn decisions_for(&self, pair_id: &str) -> SyncResult<Vec<ConflictDecision>> {
        Ok(self
            .decisions
            .read()
            .iter()
            .filter(|d| d.local.pair_id == pair_id)
            .cloned()
            .collect())
    }
}
