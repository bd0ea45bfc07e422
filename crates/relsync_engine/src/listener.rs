//! Inbound peer connections.

use crate::applier::RemoteApplier;
use crate::channel::{next_message, send_message, HANDSHAKE_TIMEOUT};
use crate::error::{SyncError, SyncResult};
use crate::events::{EventSink, SyncEvent};
use futures_util::StreamExt;
use parking_lot::{Mutex, RwLock};
use relsync_protocol::{now_millis, PeerMessage, Timestamp};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_tungstenite::accept_async;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A connected inbound peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    /// Node id announced in `Hello`.
    pub peer_id: String,
    /// Remote socket address.
    pub address: SocketAddr,
    /// The dialer's session.
    pub session_id: Uuid,
    /// Highest sequence applied for that session.
    pub last_applied_seq: u64,
    /// When the connection was accepted.
    pub connected_at: Timestamp,
}

/// Connected inbound peers.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: RwLock<HashMap<u64, Peer>>,
    next_id: AtomicU64,
}

impl PeerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, peer: Peer) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.peers.write().insert(id, peer);
        id
    }

    fn update_seq(&self, id: u64, seq: u64) {
        if let Some(peer) = self.peers.write().get_mut(&id) {
            peer.last_applied_seq = seq;
        }
    }

    fn remove(&self, id: u64) {
        self.peers.write().remove(&id);
    }

    /// Connected peers, ordered by peer id.
    pub fn list(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.peers.read().values().cloned().collect();
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        peers
    }

    /// Number of connected peers.
    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    /// Returns true if no peer is connected.
    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }
}

/// How long a disconnected dialer session's progress is kept.
pub const DEFAULT_SESSION_RETENTION: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy)]
struct ResumePoint {
    seq: u64,
    connections: usize,
    idle_since: Timestamp,
}

/// Accepts peer connections and applies the changes they push.
///
/// The highest applied sequence is remembered per dialer session, so a
/// reconnecting dialer resumes where it left off and duplicates are
/// acknowledged without being applied again. A session with no open
/// connection is forgotten once it has been idle longer than the
/// retention period.
pub struct PeerListener {
    node_id: String,
    applier: Arc<dyn RemoteApplier>,
    events: EventSink,
    registry: Arc<PeerRegistry>,
    retention: Duration,
    applied: Mutex<HashMap<(String, Uuid), ResumePoint>>,
}

impl PeerListener {
    /// Creates a listener.
    pub fn new(node_id: impl Into<String>, applier: Arc<dyn RemoteApplier>, events: EventSink) -> Self {
        Self {
            node_id: node_id.into(),
            applier,
            events,
            registry: Arc::new(PeerRegistry::new()),
            retention: DEFAULT_SESSION_RETENTION,
            applied: Mutex::new(HashMap::new()),
        }
    }

    /// Sets how long an idle dialer session's progress is kept.
    pub fn with_session_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Number of dialer sessions whose progress is remembered.
    pub fn tracked_sessions(&self) -> usize {
        self.applied.lock().len()
    }

    /// Drops idle sessions past retention, then opens `key`.
    fn open_session(&self, key: &(String, Uuid)) -> u64 {
        let now = now_millis();
        let retention = self.retention.as_millis() as i64;
        let mut applied = self.applied.lock();
        let before = applied.len();
        applied.retain(|_, p| p.connections > 0 || now - p.idle_since <= retention);
        if applied.len() < before {
            debug!(evicted = before - applied.len(), "forgot idle peer sessions");
        }

        let point = applied.entry(key.clone()).or_insert(ResumePoint {
            seq: 0,
            connections: 0,
            idle_since: now,
        });
        point.connections += 1;
        point.seq
    }

    fn record_applied(&self, key: &(String, Uuid), seq: u64) {
        if let Some(point) = self.applied.lock().get_mut(key) {
            point.seq = point.seq.max(seq);
        }
    }

    fn close_session(&self, key: &(String, Uuid)) {
        if let Some(point) = self.applied.lock().get_mut(key) {
            point.connections = point.connections.saturating_sub(1);
            point.idle_since = now_millis();
        }
    }

    /// Binds a TCP socket.
    pub async fn bind(addr: SocketAddr) -> SyncResult<TcpListener> {
        Ok(TcpListener::bind(addr).await?)
    }

    /// The registry of connected peers.
    pub fn registry(&self) -> Arc<PeerRegistry> {
        self.registry.clone()
    }

    /// Accepts connections until `shutdown` flips to true, then waits for
    /// open connections to close.
    pub async fn run(self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        let this = Arc::new(self);
        let mut connections = JoinSet::new();
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "peer listener started");
        }

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, address)) => {
                        let this = this.clone();
                        let shutdown = shutdown.clone();
                        connections.spawn(async move { this.serve(stream, address, shutdown).await });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = shutdown.changed() => break,
            }
        }

        while connections.join_next().await.is_some() {}
        info!("peer listener stopped");
    }

    async fn serve(&self, stream: TcpStream, address: SocketAddr, mut shutdown: watch::Receiver<bool>) {
        if let Err(e) = self.handle(stream, address, &mut shutdown).await {
            warn!(%address, error = %e, "peer connection ended");
        }
    }

    async fn handle(
        &self,
        stream: TcpStream,
        address: SocketAddr,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SyncResult<()> {
        let label = address.to_string();
        let ws = tokio::time::timeout(HANDSHAKE_TIMEOUT, accept_async(stream))
            .await
            .map_err(|_| SyncError::disconnected(&label, "websocket upgrade timed out"))?
            .map_err(|e| SyncError::disconnected(&label, e.to_string()))?;
        let (mut sink, mut frames) = ws.split();

        let hello = tokio::time::timeout(HANDSHAKE_TIMEOUT, next_message(&mut frames, &label))
            .await
            .map_err(|_| SyncError::disconnected(&label, "handshake timed out"))??;
        let PeerMessage::Hello {
            node_id: peer_id,
            session_id,
        } = hello
        else {
            return Err(SyncError::disconnected(&label, "expected hello"));
        };

        let key = (peer_id.clone(), session_id);
        let mut last_applied = self.open_session(&key);
        let welcome = PeerMessage::Welcome {
            node_id: self.node_id.clone(),
            last_applied_seq: last_applied,
        };
        if let Err(e) = send_message(&mut sink, &peer_id, &welcome).await {
            self.close_session(&key);
            return Err(e);
        }

        let conn = self.registry.register(Peer {
            peer_id: peer_id.clone(),
            address,
            session_id,
            last_applied_seq: last_applied,
            connected_at: now_millis(),
        });
        info!(peer = %peer_id, %address, resume_after = last_applied, "peer connected");

        let result = loop {
            let message = tokio::select! {
                _ = shutdown.changed() => break Ok(()),
                message = next_message(&mut frames, &peer_id) => message,
            };
            let message = match message {
                Ok(message) => message,
                Err(e) => break Err(e),
            };

            match message {
                PeerMessage::Change { seq, record } => {
                    if seq > last_applied {
                        if let Err(e) = self.applier.apply(&record).await {
                            warn!(peer = %peer_id, seq, error = %e, "apply failed");
                            self.events
                                .emit(SyncEvent::ApplyError {
                                    peer_id: peer_id.clone(),
                                    record,
                                    error: e.to_string(),
                                })
                                .await;
                        }
                        last_applied = seq;
                        self.record_applied(&key, seq);
                        self.registry.update_seq(conn, seq);
                    } else {
                        debug!(peer = %peer_id, seq, "duplicate change acknowledged");
                    }
                    if let Err(e) =
                        send_message(&mut sink, &peer_id, &PeerMessage::Ack { seq: last_applied }).await
                    {
                        break Err(e);
                    }
                }
                other => warn!(peer = %peer_id, code = other.type_code(), "unexpected message"),
            }
        };

        self.close_session(&key);
        self.registry.remove(conn);
        info!(peer = %peer_id, "peer disconnected");
        result
    }
}

impl std::fmt::Debug for PeerListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerListener")
            .field("node_id", &self.node_id)
            .field("peers", &self.registry.len())
            .finish()
    }
}
