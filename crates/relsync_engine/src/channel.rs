//! Outbound peer channels.
//!
//! A channel keeps one WebSocket connection to a remote peer and pushes
//! the changes queued for it, in order. Every change gets a sequence
//! number; the peer acknowledges cumulatively. Sent but unacknowledged
//! changes are kept and resent after a reconnect, starting after the
//! sequence the peer reports in its `Welcome`.

use crate::config::{PeerConfig, RetryConfig};
use crate::error::{SyncError, SyncResult};
use crate::queue::PeerOutbox;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use relsync_protocol::{ChangeRecord, PeerMessage};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, WebSocketStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Time allowed for the `Hello`/`Welcome` exchange.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) async fn send_message<K>(sink: &mut K, peer: &str, message: &PeerMessage) -> SyncResult<()>
where
    K: Sink<Message, Error = WsError> + Unpin,
{
    let bytes = message.encode()?;
    sink.send(Message::Binary(bytes))
        .await
        .map_err(|e| SyncError::disconnected(peer, e.to_string()))
}

/// Reads frames until a peer message arrives. Control frames are skipped.
pub(crate) async fn next_message<St>(stream: &mut St, peer: &str) -> SyncResult<PeerMessage>
where
    St: Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        match stream.next().await {
            Some(Ok(Message::Binary(bytes))) => return Ok(PeerMessage::decode(&bytes)?),
            Some(Ok(Message::Close(_))) | None => {
                return Err(SyncError::disconnected(peer, "connection closed"))
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(SyncError::disconnected(peer, e.to_string())),
        }
    }
}

#[derive(Debug, Default)]
struct ChannelShared {
    connected: AtomicBool,
    next_seq: AtomicU64,
    last_acked: AtomicU64,
    reconnects: AtomicU64,
    in_flight: Mutex<VecDeque<(u64, ChangeRecord)>>,
}

impl ChannelShared {
    fn acknowledge(&self, seq: u64) {
        self.in_flight.lock().retain(|(s, _)| *s > seq);
        self.last_acked.fetch_max(seq, Ordering::SeqCst);
    }
}

/// Snapshot of an outbound channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelStatus {
    /// Peer id.
    pub peer_id: String,
    /// Peer URL.
    pub url: String,
    /// Whether a session is currently open.
    pub connected: bool,
    /// Highest acknowledged sequence.
    pub last_acked_seq: u64,
    /// Sent but unacknowledged changes.
    pub in_flight: usize,
    /// Changes waiting to be sent.
    pub queued: usize,
    /// Reconnect attempts so far.
    pub reconnects: u64,
}

/// Read-only view of a running channel.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    peer_id: String,
    url: String,
    outbox: PeerOutbox,
    shared: Arc<ChannelShared>,
}

impl ChannelHandle {
    /// Current status.
    pub fn status(&self) -> ChannelStatus {
        ChannelStatus {
            peer_id: self.peer_id.clone(),
            url: self.url.clone(),
            connected: self.shared.connected.load(Ordering::SeqCst),
            last_acked_seq: self.shared.last_acked.load(Ordering::SeqCst),
            in_flight: self.shared.in_flight.lock().len(),
            queued: self.outbox.len(),
            reconnects: self.shared.reconnects.load(Ordering::SeqCst),
        }
    }
}

/// Persistent outbound connection to one peer.
pub struct PeerChannel {
    peer: PeerConfig,
    node_id: String,
    session_id: Uuid,
    outbox: PeerOutbox,
    retry: RetryConfig,
    max_in_flight: usize,
    shared: Arc<ChannelShared>,
}

impl PeerChannel {
    /// Creates a channel that drains `outbox` into `peer`.
    pub fn new(node_id: impl Into<String>, peer: PeerConfig, outbox: PeerOutbox, retry: RetryConfig) -> Self {
        Self {
            peer,
            node_id: node_id.into(),
            session_id: Uuid::new_v4(),
            outbox,
            retry,
            max_in_flight: 256,
            shared: Arc::new(ChannelShared::default()),
        }
    }

    /// Sets how many changes may be unacknowledged at once.
    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = max.max(1);
        self
    }

    /// Returns a handle for status queries.
    pub fn handle(&self) -> ChannelHandle {
        ChannelHandle {
            peer_id: self.peer.peer_id.clone(),
            url: self.peer.url.clone(),
            outbox: self.outbox.clone(),
            shared: self.shared.clone(),
        }
    }

    /// Connects, pushes and reconnects until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let peer_id = self.peer.peer_id.clone();
        let mut attempt: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let connected = tokio::select! {
                result = connect_async(self.peer.url.as_str()) => result,
                _ = shutdown.changed() => break,
            };

            match connected {
                Ok((ws, _)) => {
                    self.shared.connected.store(true, Ordering::SeqCst);
                    let result = self.session(ws, &mut shutdown, &mut attempt).await;
                    self.shared.connected.store(false, Ordering::SeqCst);
                    match result {
                        Ok(()) => break,
                        Err(e) if e.is_retryable() => {
                            warn!(peer = %peer_id, error = %e, "peer channel disconnected")
                        }
                        Err(e) => error!(peer = %peer_id, error = %e, "peer session failed"),
                    }
                }
                Err(e) => {
                    let error = SyncError::disconnected(&peer_id, e.to_string());
                    warn!(peer = %peer_id, %error, attempt, "connect failed");
                }
            }

            attempt = attempt.saturating_add(1);
            self.shared.reconnects.fetch_add(1, Ordering::SeqCst);
            let delay = self.retry.delay_for_attempt(attempt);
            debug!(peer = %peer_id, ?delay, "waiting to reconnect");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        info!(peer = %peer_id, "peer channel stopped");
    }

    async fn session<S>(
        &self,
        ws: WebSocketStream<S>,
        shutdown: &mut watch::Receiver<bool>,
        attempt: &mut u32,
    ) -> SyncResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let peer_id = self.peer.peer_id.as_str();
        let (mut sink, mut stream) = ws.split();

        let hello = PeerMessage::Hello {
            node_id: self.node_id.clone(),
            session_id: self.session_id,
        };
        send_message(&mut sink, peer_id, &hello).await?;

        let welcome = tokio::time::timeout(HANDSHAKE_TIMEOUT, next_message(&mut stream, peer_id))
            .await
            .map_err(|_| SyncError::disconnected(peer_id, "handshake timed out"))??;
        let PeerMessage::Welcome {
            node_id: remote,
            last_applied_seq,
        } = welcome
        else {
            return Err(SyncError::disconnected(peer_id, "expected welcome"));
        };

        self.shared.acknowledge(last_applied_seq);
        *attempt = 0;

        let pending: Vec<(u64, ChangeRecord)> = self.shared.in_flight.lock().iter().cloned().collect();
        info!(
            peer = %peer_id,
            remote_node = %remote,
            resumed_after = last_applied_seq,
            resending = pending.len(),
            "peer session open"
        );
        for (seq, record) in pending {
            send_message(&mut sink, peer_id, &PeerMessage::Change { seq, record }).await?;
        }

        loop {
            let window_open = self.shared.in_flight.lock().len() < self.max_in_flight;
            tokio::select! {
                _ = shutdown.changed() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(());
                }
                record = self.outbox.next(), if window_open => {
                    let seq = self.shared.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
                    self.shared.in_flight.lock().push_back((seq, record.clone()));
                    send_message(&mut sink, peer_id, &PeerMessage::Change { seq, record }).await?;
                }
                message = next_message(&mut stream, peer_id) => match message? {
                    PeerMessage::Ack { seq } => self.shared.acknowledge(seq),
                    other => warn!(peer = %peer_id, code = other.type_code(), "unexpected message"),
                },
            }
        }
    }
}

impl std::fmt::Debug for PeerChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerChannel")
            .field("peer", &self.peer.peer_id)
            .field("session_id", &self.session_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relsync_protocol::{ColumnValue, PrimaryKey, Row};

    fn record(seq: i64) -> ChangeRecord {
        let mut row = Row::new();
        row.insert("id".into(), ColumnValue::Integer(seq));
        ChangeRecord::new("p", "t", PrimaryKey::single(seq), row, "a", seq)
    }

    #[test]
    fn acknowledge_trims_in_flight() {
        let shared = ChannelShared::default();
        {
            let mut in_flight = shared.in_flight.lock();
            for seq in 1..=4u64 {
                in_flight.push_back((seq, record(seq as i64)));
            }
        }

        shared.acknowledge(2);
        assert_eq!(shared.in_flight.lock().len(), 2);
        assert_eq!(shared.last_acked.load(Ordering::SeqCst), 2);

        // stale acks never move the mark back
        shared.acknowledge(1);
        assert_eq!(shared.last_acked.load(Ordering::SeqCst), 2);
        assert_eq!(shared.in_flight.lock().front().map(|(s, _)| *s), Some(3));
    }

    #[tokio::test]
    async fn stops_while_peer_is_unreachable() {
        let channel = PeerChannel::new(
            "node-a",
            PeerConfig::new("node-b", "ws://127.0.0.1:9"),
            PeerOutbox::new(),
            RetryConfig::new().with_initial_delay(Duration::from_millis(10)),
        );
        let handle = channel.handle();
        let (stop, shutdown) = watch::channel(false);
        let task = tokio::spawn(channel.run(shutdown));

        tokio::time::sleep(Duration::from_millis(100)).await;
        stop.send(true).unwrap();
        task.await.unwrap();

        let status = handle.status();
        assert!(!status.connected);
        assert!(status.reconnects >= 1);
    }
}
