//! Error types for the sync engine.

use crate::config::ConfigError;
use relsync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
///
/// Errors are contained at the smallest scope that makes sense: a store
/// outage fails one cycle, a schema mismatch skips one table, a policy
/// failure skips one key and a bad inbound record is skipped on its own.
#[derive(Error, Debug)]
pub enum SyncError {
    /// A store could not be reached or did not answer in time.
    #[error("store {store} unavailable: {message}")]
    StoreUnavailable {
        /// Store name.
        store: String,
        /// Error message.
        message: String,
    },

    /// A table does not have the columns its definition expects.
    #[error("schema mismatch for {store}.{table}: {message}")]
    SchemaMismatch {
        /// Store name.
        store: String,
        /// Table name.
        table: String,
        /// Error message.
        message: String,
    },

    /// A resolver policy failed for one key.
    #[error("conflict policy failed for {table}[{key}]: {message}")]
    ConflictPolicy {
        /// Table name.
        table: String,
        /// Primary key, formatted.
        key: String,
        /// Error message.
        message: String,
    },

    /// A peer connection was lost or could not be established.
    #[error("channel to {peer} disconnected: {message}")]
    ChannelDisconnected {
        /// Peer id.
        peer: String,
        /// Error message.
        message: String,
    },

    /// The caller's apply callback rejected an inbound record.
    #[error("apply callback failed for {table}[{key}]: {message}")]
    ApplyCallback {
        /// Table name.
        table: String,
        /// Primary key, formatted.
        key: String,
        /// Error message.
        message: String,
    },

    /// A sync cycle exceeded its timeout.
    #[error("cycle for pair {pair} timed out after {timeout_ms}ms")]
    CycleTimeout {
        /// Pair id.
        pair: String,
        /// Configured timeout.
        timeout_ms: u64,
    },

    /// The session ledger failed.
    #[error("ledger error: {0}")]
    Ledger(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Protocol encoding or data error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The referenced pair is not running.
    #[error("pair {0} is not running")]
    PairNotRunning(String),

    /// I/O error (listener sockets).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Creates a store-unavailable error.
    pub fn store_unavailable(store: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            store: store.into(),
            message: message.into(),
        }
    }

    /// Creates a schema-mismatch error.
    pub fn schema_mismatch(
        store: impl Into<String>,
        table: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::SchemaMismatch {
            store: store.into(),
            table: table.into(),
            message: message.into(),
        }
    }

    /// Creates a channel-disconnected error.
    pub fn disconnected(peer: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ChannelDisconnected {
            peer: peer.into(),
            message: message.into(),
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::StoreUnavailable { .. }
                | SyncError::ChannelDisconnected { .. }
                | SyncError::CycleTimeout { .. }
        )
    }

    /// Returns true if this error only affects a single table.
    pub fn is_table_scoped(&self) -> bool {
        matches!(self, SyncError::SchemaMismatch { .. })
    }
}
