//! # relsync Engine
//!
//! Keeps pairs of relational stores synchronized and forwards the applied
//! changes to remote peers.
//!
//! This crate provides:
//! - Change detection by version column or content hash
//! - A per-pair coordinator state machine
//!   (idle → scanning → diffing → resolving → applying → logging)
//! - Pluggable conflict resolution (last-write-wins or custom merge)
//! - Bounded per-peer change queues with drop-oldest overflow
//! - WebSocket peer channels with resume after reconnect
//! - A session ledger recording every cycle, decision and event
//! - A supervisor that owns all of the above and stops it gracefully
//!
//! ## Architecture
//!
//! Each pair has one coordinator. A cycle scans both stores for rows
//! changed since the pair's cursor, diffs them by primary key, resolves
//! conflicts, writes the target and then the source, and finally records
//! a [`SyncSession`](relsync_protocol::SyncSession) to the ledger. Applied
//! changes are published to the outbox of every peer subscribed to the
//! pair.
//!
//! ## Key Invariants
//!
//! - At most one cycle per pair runs at a time
//! - Cursors only advance after the writes they cover succeeded
//! - Rows written by the engine are not detected again as new changes
//! - Every conflict decision is recorded before the session closes
//!
//! ## Example
//!
//! ```rust,ignore
//! use relsync_engine::{EngineConfig, MemoryStore, Supervisor};
//! use std::sync::Arc;
//!
//! let config = EngineConfig::from_file("relsync.json")?;
//! let supervisor = Supervisor::builder(config)
//!     .store(Arc::new(MemoryStore::new("primary")))
//!     .store(Arc::new(MemoryStore::new("replica")))
//!     .start()
//!     .await?;
//!
//! tokio::signal::ctrl_c().await?;
//! supervisor.stop_all().await;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod applier;
mod channel;
mod config;
mod coordinator;
mod detector;
mod error;
mod events;
mod ledger;
mod listener;
mod queue;
#[cfg(feature = "sqlite")]
mod sqlite;
mod store;
mod supervisor;

pub use applier::{MemoryApplier, RemoteApplier, StoreApplier};
pub use channel::{ChannelHandle, ChannelStatus, PeerChannel, HANDSHAKE_TIMEOUT};
pub use config::{
    ConfigError, ConfigResult, EngineConfig, PairConfig, PeerConfig, PolicySpec,
    ResolverRegistry, RetryConfig, StoreConfig, DEFAULT_QUEUE_CAPACITY,
};
pub use coordinator::{CoordinatorState, CoordinatorStats, PairCoordinator};
pub use detector::{ChangeDetector, Detection, TableCursor};
pub use error::{SyncError, SyncResult};
pub use events::{EventHook, EventKind, EventSink, SyncEvent};
pub use ledger::{LedgerEvent, MemoryLedger, SessionLedger};
pub use listener::{Peer, PeerListener, PeerRegistry, DEFAULT_SESSION_RETENTION};
pub use queue::{ChangeQueue, PeerOutbox, Propagator};
#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteLedger, SqliteStore};
pub use store::{AppliedBatch, MemoryStore, Store};
pub use supervisor::{Supervisor, SupervisorBuilder};
