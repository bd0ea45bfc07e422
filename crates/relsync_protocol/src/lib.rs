//! # relsync Protocol
//!
//! Data types shared by every relsync component.
//!
//! This crate provides:
//! - [`ChangeRecord`] for row-level mutations captured from a store
//! - [`TableSpec`] describing how changes are detected for one table
//! - [`ResolverPolicy`] and [`ConflictDecision`] for deterministic conflict resolution
//! - [`SyncSession`] for the audit trail of one sync cycle
//! - [`PeerMessage`] frames exchanged with remote peers, encoded as CBOR
//!
//! This is a pure protocol crate with no I/O operations. Resolver policies
//! never touch disk or network, so every decision can be replayed from the
//! ledger alone.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod error;
mod messages;
mod record;
mod resolver;
mod session;
mod table;
mod value;

pub use error::{ProtocolError, ProtocolResult};
pub use messages::PeerMessage;
pub use record::{canonical_cbor, content_hash, hex_digest, ChangeRecord, ContentHash, Timestamp};
pub use resolver::{
    ConflictDecision, MergeFn, Resolution, ResolverPolicy, Winner, MERGED_ORIGIN,
};
pub use session::{SessionStatus, SyncSession};
pub use table::{validate_identifier, ChangeDetection, TableSpec};
pub use value::{ColumnValue, PrimaryKey, Row};

/// Returns the current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Timestamp)
        .unwrap_or_default()
}
