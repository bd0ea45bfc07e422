//! Bounded change queues between coordinators and peer channels.

use crate::events::{EventSink, SyncEvent};
use parking_lot::Mutex;
use relsync_protocol::ChangeRecord;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Bounded FIFO of changes.
///
/// When full, a push drops the oldest change and hands it back so the
/// caller can report it. Pushing never blocks.
#[derive(Debug)]
pub struct ChangeQueue {
    items: Mutex<VecDeque<ChangeRecord>>,
    capacity: usize,
    dropped: AtomicU64,
    notify: Arc<Notify>,
}

impl ChangeQueue {
    /// Creates a queue holding at most `capacity` changes.
    pub fn new(capacity: usize) -> Self {
        Self::with_notify(capacity, Arc::new(Notify::new()))
    }

    /// Creates a queue that signals `notify` on every push.
    pub fn with_notify(capacity: usize, notify: Arc<Notify>) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
            notify,
        }
    }

    /// Appends a change, returning the change dropped to make room.
    pub fn push(&self, record: ChangeRecord) -> Option<ChangeRecord> {
        let evicted = {
            let mut items = self.items.lock();
            let evicted = if items.len() >= self.capacity {
                items.pop_front()
            } else {
                None
            };
            items.push_back(record);
            evicted
        };
        if evicted.is_some() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        evicted
    }

    /// Removes the oldest change.
    pub fn pop(&self) -> Option<ChangeRecord> {
        self.items.lock().pop_front()
    }

    /// Number of queued changes.
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Maximum number of queued changes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Changes dropped on overflow so far.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Every queue feeding one peer, one per subscribed pair.
///
/// Queues are drained round-robin. Order is kept within a pair, not
/// across pairs.
#[derive(Debug, Clone)]
pub struct PeerOutbox {
    queues: Vec<(String, Arc<ChangeQueue>)>,
    notify: Arc<Notify>,
    turn: Arc<AtomicUsize>,
}

impl PeerOutbox {
    /// Creates an outbox with no queues.
    pub fn new() -> Self {
        Self {
            queues: Vec::new(),
            notify: Arc::new(Notify::new()),
            turn: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Adds a queue for `pair_id` and returns it.
    pub fn add_pair(&mut self, pair_id: impl Into<String>, capacity: usize) -> Arc<ChangeQueue> {
        let queue = Arc::new(ChangeQueue::with_notify(capacity, self.notify.clone()));
        self.queues.push((pair_id.into(), queue.clone()));
        queue
    }

    /// Queue for `pair_id`.
    pub fn queue(&self, pair_id: &str) -> Option<&Arc<ChangeQueue>> {
        self.queues
            .iter()
            .find(|(id, _)| id == pair_id)
            .map(|(_, q)| q)
    }

    /// Total queued changes.
    pub fn len(&self) -> usize {
        self.queues.iter().map(|(_, q)| q.len()).sum()
    }

    /// Returns true if every queue is empty.
    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(|(_, q)| q.is_empty())
    }

    /// Takes the next change, starting after the queue served last.
    pub fn try_next(&self) -> Option<ChangeRecord> {
        let count = self.queues.len();
        let start = self.turn.load(Ordering::Relaxed);
        for offset in 0..count {
            let index = (start + offset) % count;
            if let Some(record) = self.queues[index].1.pop() {
                self.turn.store((index + 1) % count, Ordering::Relaxed);
                return Some(record);
            }
        }
        None
    }

    /// Waits for the next change.
    ///
    /// Cancel safe: a change is only removed in the poll that returns it.
    pub async fn next(&self) -> ChangeRecord {
        loop {
            if let Some(record) = self.try_next() {
                return record;
            }
            self.notify.notified().await;
        }
    }
}

impl Default for PeerOutbox {
    fn default() -> Self {
        Self::new()
    }
}

/// Routes applied changes from pairs into peer queues.
#[derive(Debug, Clone)]
pub struct Propagator {
    routes: HashMap<String, Vec<(String, Arc<ChangeQueue>)>>,
    events: EventSink,
}

impl Propagator {
    /// Creates a propagator with no routes.
    pub fn new(events: EventSink) -> Self {
        Self {
            routes: HashMap::new(),
            events,
        }
    }

    /// Sends changes from `pair_id` to `peer_id` through `queue`.
    pub fn route(&mut self, pair_id: impl Into<String>, peer_id: impl Into<String>, queue: Arc<ChangeQueue>) {
        self.routes
            .entry(pair_id.into())
            .or_default()
            .push((peer_id.into(), queue));
    }

    /// Returns true if `pair_id` has at least one subscriber.
    pub fn has_routes(&self, pair_id: &str) -> bool {
        self.routes.get(pair_id).is_some_and(|r| !r.is_empty())
    }

    /// Enqueues `records` for every peer subscribed to their pair.
    pub async fn publish(&self, pair_id: &str, records: &[ChangeRecord]) {
        let Some(routes) = self.routes.get(pair_id) else {
            return;
        };
        for (peer_id, queue) in routes {
            for record in records {
                if let Some(dropped) = queue.push(record.clone()) {
                    self.events
                        .emit(SyncEvent::QueueOverflow {
                            peer_id: peer_id.clone(),
                            dropped,
                        })
                        .await;
                }
            }
        }
    }
}
