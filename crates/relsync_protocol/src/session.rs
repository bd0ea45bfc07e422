//! Sync session records.

use crate::record::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Outcome of a sync session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// The cycle is still in progress.
    Running,
    /// The cycle finished; table-scoped errors may have skipped tables.
    Completed,
    /// The cycle failed and will be retried on the next tick.
    Failed,
}

impl SessionStatus {
    /// Stable lowercase name, as stored in ledgers.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        }
    }

    /// Parses a stored status name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(SessionStatus::Running),
            "completed" => Some(SessionStatus::Completed),
            "failed" => Some(SessionStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One execution of a pair's scan-resolve-apply cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSession {
    /// Unique session id.
    pub session_id: Uuid,
    /// Pair the cycle ran for.
    pub pair_id: String,
    /// Cycle start time.
    pub started_at: Timestamp,
    /// Cycle end time, once closed.
    pub ended_at: Option<Timestamp>,
    /// Rows written across both stores.
    pub changes_applied: u64,
    /// Conflicts decided by the resolver.
    pub conflicts_resolved: u64,
    /// Tables skipped because of a table-scoped error.
    pub tables_skipped: u64,
    /// Session status.
    pub status: SessionStatus,
    /// Failure description for failed sessions.
    pub error: Option<String>,
}

impl SyncSession {
    /// Opens a new running session.
    pub fn begin(pair_id: impl Into<String>, started_at: Timestamp) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            pair_id: pair_id.into(),
            started_at,
            ended_at: None,
            changes_applied: 0,
            conflicts_resolved: 0,
            tables_skipped: 0,
            status: SessionStatus::Running,
            error: None,
        }
    }

    /// Closes the session as completed.
    pub fn complete(&mut self, ended_at: Timestamp) {
        self.ended_at = Some(ended_at);
        self.status = SessionStatus::Completed;
    }

    /// Closes the session as failed.
    pub fn fail(&mut self, ended_at: Timestamp, error: impl Into<String>) {
        self.ended_at = Some(ended_at);
        self.status = SessionStatus::Failed;
        self.error = Some(error.into());
    }

    /// Returns true once the session has been closed.
    pub fn is_closed(&self) -> bool {
        self.status != SessionStatus::Running
    }

    /// Cycle duration in milliseconds, once closed.
    pub fn duration_ms(&self) -> Option<i64> {
        self.ended_at.map(|end| end - self.started_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_lifecycle() {
        let mut session = SyncSession::begin("scripts", 100);
        assert_eq!(session.status, SessionStatus::Running);
        assert!(!session.is_closed());

        session.changes_applied = 3;
        session.complete(150);
        assert!(session.is_closed());
        assert_eq!(session.duration_ms(), Some(50));
        assert!(session.error.is_none());
    }

    #[test]
    fn failed_session_keeps_error() {
        let mut session = SyncSession::begin("scripts", 100);
        session.fail(120, "store unavailable: replica");
        assert_eq!(session.status, SessionStatus::Failed);
        assert_eq!(session.error.as_deref(), Some("store unavailable: replica"));
    }

    #[test]
    fn status_names() {
        for status in [
            SessionStatus::Running,
            SessionStatus::Completed,
            SessionStatus::Failed,
        ] {
            assert_eq!(SessionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(SessionStatus::parse("paused"), None);
    }
}
