//! Integration tests for coordinators, peer channels and the supervisor.

use futures_util::{SinkExt, StreamExt};
use relsync_engine::{
    EngineConfig, EventKind, EventSink, MemoryApplier, MemoryLedger, MemoryStore, PairConfig,
    PairCoordinator, PeerChannel, PeerConfig, PeerListener, PeerOutbox, Propagator,
    ResolverRegistry, RetryConfig, SessionLedger, Supervisor, SyncError,
};
use relsync_protocol::{
    ChangeRecord, ColumnValue, PeerMessage, PrimaryKey, Row, SessionStatus, TableSpec, Winner,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

fn row(id: i64, v: i64, val: &str) -> Row {
    let mut row = Row::new();
    row.insert("id".into(), ColumnValue::Integer(id));
    row.insert("v".into(), ColumnValue::Integer(v));
    row.insert("val".into(), ColumnValue::Text(val.into()));
    row
}

fn pair() -> PairConfig {
    PairConfig::new("p", "x", "y")
        .with_table(TableSpec::versioned("t", &["id"], "v"))
        .with_watch_interval(Duration::from_millis(20))
}

fn fast_retry() -> RetryConfig {
    RetryConfig::new()
        .with_initial_delay(Duration::from_millis(10))
        .with_max_delay(Duration::from_millis(50))
        .without_jitter()
}

/// Polls `check` until it holds or five seconds pass.
async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

struct Node {
    source: Arc<MemoryStore>,
    target: Arc<MemoryStore>,
    ledger: Arc<MemoryLedger>,
    coordinator: PairCoordinator,
}

fn node(pair: PairConfig, outbox: Option<(&mut PeerOutbox, usize)>) -> Node {
    let source = Arc::new(MemoryStore::new("x"));
    let target = Arc::new(MemoryStore::new("y"));
    let ledger = Arc::new(MemoryLedger::new());
    let events = EventSink::new(ledger.clone());
    let mut propagator = Propagator::new(events.clone());
    if let Some((outbox, capacity)) = outbox {
        let queue = outbox.add_pair(&pair.id, capacity);
        propagator.route(&pair.id, "peer-b", queue);
    }
    let coordinator = PairCoordinator::new(
        pair,
        source.clone(),
        target.clone(),
        &ResolverRegistry::new(),
        events,
        propagator,
    )
    .unwrap();
    Node {
        source,
        target,
        ledger,
        coordinator,
    }
}

struct Remote {
    url: String,
    applier: Arc<MemoryApplier>,
    ledger: Arc<MemoryLedger>,
    stop: watch::Sender<bool>,
}

async fn remote() -> Remote {
    let applier = Arc::new(MemoryApplier::new());
    let ledger = Arc::new(MemoryLedger::new());
    let listener = PeerListener::new("node-b", applier.clone(), EventSink::new(ledger.clone()));
    let socket = PeerListener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let url = format!("ws://{}", socket.local_addr().unwrap());
    let (stop, shutdown) = watch::channel(false);
    tokio::spawn(listener.run(socket, shutdown));
    Remote {
        url,
        applier,
        ledger,
        stop,
    }
}

fn record(id: i64) -> ChangeRecord {
    ChangeRecord::new("p", "t", PrimaryKey::single(id), row(id, id, "r"), "x", id)
}

fn change(seq: u64, id: i64) -> Message {
    let record = record(id);
    Message::Binary(PeerMessage::Change { seq, record }.encode().unwrap())
}

fn welcome(last_applied_seq: u64) -> Message {
    let welcome = PeerMessage::Welcome {
        node_id: "node-b".into(),
        last_applied_seq,
    };
    Message::Binary(welcome.encode().unwrap())
}

fn ack(seq: u64) -> Message {
    Message::Binary(PeerMessage::Ack { seq }.encode().unwrap())
}

async fn read<S>(stream: &mut S) -> PeerMessage
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        match stream.next().await.unwrap().unwrap() {
            Message::Binary(bytes) => return PeerMessage::decode(&bytes).unwrap(),
            _ => continue,
        }
    }
}

// ============================================================================
// Coordinator scenarios
// ============================================================================

#[tokio::test]
async fn later_write_wins_conflict() {
    let n = node(pair(), None);
    n.source.put("t", PrimaryKey::single(5), row(5, 10, "a"));
    n.target.put("t", PrimaryKey::single(5), row(5, 20, "b"));

    let session = n.coordinator.run_cycle().await;
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.conflicts_resolved, 1);

    let decisions = n.ledger.decisions_for("p").await.unwrap();
    assert_eq!(decisions.len(), 1);
    assert_eq!(decisions[0].side, Winner::Remote);
    assert_eq!(
        decisions[0].winner.column_values["val"],
        ColumnValue::Text("b".into())
    );
    assert_eq!(n.source.get("t", &PrimaryKey::single(5)), Some(row(5, 20, "b")));
    assert_eq!(n.target.get("t", &PrimaryKey::single(5)), Some(row(5, 20, "b")));
}

#[tokio::test]
async fn new_row_is_copied_without_conflict() {
    let n = node(pair(), None);
    n.source.put("t", PrimaryKey::single(9), row(9, 1, "fresh"));

    let session = n.coordinator.run_cycle().await;
    assert_eq!(session.changes_applied, 1);
    assert_eq!(session.conflicts_resolved, 0);
    assert!(n.ledger.decisions_for("p").await.unwrap().is_empty());
    assert_eq!(n.target.get("t", &PrimaryKey::single(9)), Some(row(9, 1, "fresh")));
}

#[tokio::test]
async fn unchanged_stores_produce_no_writes() {
    let n = node(pair(), None);
    n.source.put("t", PrimaryKey::single(1), row(1, 1, "a"));
    n.source.put("t", PrimaryKey::single(2), row(2, 2, "b"));
    n.target.put("t", PrimaryKey::single(3), row(3, 3, "c"));
    n.coordinator.run_cycle().await;
    let writes = n.source.write_count() + n.target.write_count();

    for _ in 0..3 {
        let session = n.coordinator.run_cycle().await;
        assert_eq!(session.changes_applied, 0);
        assert_eq!(session.conflicts_resolved, 0);
    }
    assert_eq!(n.source.write_count() + n.target.write_count(), writes);
    assert_eq!(n.source.rows("t"), n.target.rows("t"));
}

#[tokio::test]
async fn each_key_is_written_once_per_cycle() {
    let n = node(pair(), None);
    for id in 1..=5 {
        n.source.put("t", PrimaryKey::single(id), row(id, id, "s"));
    }
    n.target.put("t", PrimaryKey::single(3), row(3, 30, "t"));

    n.coordinator.run_cycle().await;
    let mut keys: Vec<PrimaryKey> = n
        .target
        .applied_batches()
        .into_iter()
        .chain(n.source.applied_batches())
        .flat_map(|b| b.keys)
        .collect();
    let total = keys.len();
    keys.sort();
    keys.dedup();
    assert_eq!(keys.len(), total);
}

#[tokio::test]
async fn rejected_target_write_is_retried_by_the_next_tick() {
    let source = Arc::new(MemoryStore::new("x"));
    let target = Arc::new(MemoryStore::new("y"));
    let ledger = Arc::new(MemoryLedger::new());
    source.put("t", PrimaryKey::single(1), row(1, 10, "a"));
    target.set_writable(false);

    let supervisor = Supervisor::builder(EngineConfig::new("node-a").with_pair(pair()))
        .store(source.clone())
        .store(target.clone())
        .ledger(ledger.clone())
        .start()
        .await
        .unwrap();

    eventually("a failed session", || {
        ledger
            .sessions_for("p")
            .iter()
            .any(|s| s.status == SessionStatus::Failed)
    })
    .await;
    assert_eq!(target.write_count(), 0);
    assert_eq!(source.write_count(), 0);
    assert!(!ledger.events_of(EventKind::SyncError).is_empty());

    target.set_writable(true);
    eventually("the row on the target", || {
        target.get("t", &PrimaryKey::single(1)).is_some()
    })
    .await;
    eventually("a completed session", || {
        supervisor
            .status()
            .first()
            .is_some_and(|s| s.status == SessionStatus::Completed)
    })
    .await;

    supervisor.stop_all().await;
}

// ============================================================================
// Peer propagation
// ============================================================================

#[tokio::test]
async fn overflow_drops_oldest_before_peer_connects() {
    let remote = remote().await;
    let mut outbox = PeerOutbox::new();
    let n = node(pair(), Some((&mut outbox, 2)));
    for id in 1..=3 {
        n.source.put("t", PrimaryKey::single(id), row(id, id * 10, "q"));
    }
    n.coordinator.run_cycle().await;

    let overflow = n.ledger.events_of(EventKind::QueueOverflow);
    assert_eq!(overflow.len(), 1);
    assert_eq!(overflow[0].payload["observedAt"], 10);
    assert_eq!(overflow[0].payload["peer"], "peer-b");
    assert_eq!(outbox.len(), 2);

    let channel = PeerChannel::new(
        "node-a",
        PeerConfig::new("peer-b", &remote.url),
        outbox.clone(),
        fast_retry(),
    );
    let handle = channel.handle();
    let (stop, shutdown) = watch::channel(false);
    let task = tokio::spawn(channel.run(shutdown));

    eventually("two deliveries", || remote.applier.len() == 2).await;
    let delivered: Vec<i64> = remote
        .applier
        .applied()
        .iter()
        .map(|r| r.observed_at)
        .collect();
    assert_eq!(delivered, vec![20, 30]);
    eventually("acknowledgement", || handle.status().last_acked_seq == 2).await;
    assert_eq!(handle.status().in_flight, 0);

    stop.send(true).unwrap();
    task.await.unwrap();
    remote.stop.send(true).unwrap();
}

#[tokio::test]
async fn updates_to_one_key_arrive_in_order() {
    let remote = remote().await;
    let mut outbox = PeerOutbox::new();
    let n = node(pair(), Some((&mut outbox, 16)));

    let channel = PeerChannel::new(
        "node-a",
        PeerConfig::new("peer-b", &remote.url),
        outbox,
        fast_retry(),
    );
    let (stop, shutdown) = watch::channel(false);
    let task = tokio::spawn(channel.run(shutdown));

    for (v, val) in [(1, "first"), (2, "second"), (3, "third")] {
        n.source.put("t", PrimaryKey::single(7), row(7, v, val));
        n.coordinator.run_cycle().await;
    }

    eventually("three deliveries", || remote.applier.len() == 3).await;
    let values: Vec<ColumnValue> = remote
        .applier
        .applied()
        .into_iter()
        .map(|r| r.column_values["val"].clone())
        .collect();
    assert_eq!(
        values,
        vec![
            ColumnValue::Text("first".into()),
            ColumnValue::Text("second".into()),
            ColumnValue::Text("third".into()),
        ]
    );

    stop.send(true).unwrap();
    task.await.unwrap();
    remote.stop.send(true).unwrap();
}

#[tokio::test]
async fn resumed_session_skips_applied_changes() {
    let remote = remote().await;
    let session_id = Uuid::new_v4();
    let hello = PeerMessage::Hello {
        node_id: "node-a".into(),
        session_id,
    };

    let (mut ws, _) = tokio_tungstenite::connect_async(remote.url.as_str()).await.unwrap();
    ws.send(Message::Binary(hello.encode().unwrap())).await.unwrap();
    assert!(matches!(
        read(&mut ws).await,
        PeerMessage::Welcome { last_applied_seq: 0, .. }
    ));
    ws.send(change(1, 1)).await.unwrap();
    assert_eq!(read(&mut ws).await, PeerMessage::Ack { seq: 1 });
    ws.close(None).await.unwrap();

    let (mut ws, _) = tokio_tungstenite::connect_async(remote.url.as_str()).await.unwrap();
    ws.send(Message::Binary(hello.encode().unwrap())).await.unwrap();
    assert!(matches!(
        read(&mut ws).await,
        PeerMessage::Welcome { last_applied_seq: 1, .. }
    ));
    ws.send(change(1, 1)).await.unwrap();
    assert_eq!(read(&mut ws).await, PeerMessage::Ack { seq: 1 });
    ws.send(change(2, 2)).await.unwrap();
    assert_eq!(read(&mut ws).await, PeerMessage::Ack { seq: 2 });

    assert_eq!(remote.applier.len(), 2);
    remote.stop.send(true).unwrap();
}

#[tokio::test]
async fn channel_resends_only_unapplied_changes_after_reconnect() {
    let socket = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let mut outbox = PeerOutbox::new();
    let queue = outbox.add_pair("p", 16);
    for id in 1..=3 {
        queue.push(record(id));
    }

    let channel = PeerChannel::new(
        "node-a",
        PeerConfig::new("peer-b", format!("ws://{addr}")),
        outbox,
        fast_retry(),
    );
    let handle = channel.handle();
    let (stop, shutdown) = watch::channel(false);
    let task = tokio::spawn(channel.run(shutdown));

    // First connection: seq 1 and 2 are applied, only 1 is acknowledged,
    // and seq 3 is lost with the connection.
    let mut applied = Vec::new();
    let (stream, _) = socket.accept().await.unwrap();
    let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
    let PeerMessage::Hello { session_id, .. } = read(&mut ws).await else {
        panic!("expected hello");
    };
    ws.send(welcome(0)).await.unwrap();
    for expected in 1..=3 {
        let PeerMessage::Change { seq, record } = read(&mut ws).await else {
            panic!("expected change");
        };
        assert_eq!(seq, expected);
        if seq <= 2 {
            applied.push(record.primary_key);
        }
    }
    ws.send(ack(1)).await.unwrap();
    eventually("first ack", || handle.status().last_acked_seq == 1).await;
    drop(ws);
    drop(socket);

    // The peer comes back on the same address knowing seq 2 was applied.
    let socket = tokio::net::TcpListener::bind(addr).await.unwrap();
    let (stream, _) = socket.accept().await.unwrap();
    let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
    let PeerMessage::Hello {
        session_id: resumed,
        ..
    } = read(&mut ws).await
    else {
        panic!("expected hello");
    };
    assert_eq!(resumed, session_id);
    ws.send(welcome(2)).await.unwrap();
    queue.push(record(4));

    for expected in 3..=4 {
        let PeerMessage::Change { seq, record } = read(&mut ws).await else {
            panic!("expected change");
        };
        assert_eq!(seq, expected);
        applied.push(record.primary_key);
    }
    ws.send(ack(4)).await.unwrap();
    eventually("final ack", || {
        let status = handle.status();
        status.last_acked_seq == 4 && status.in_flight == 0
    })
    .await;

    let expected: Vec<PrimaryKey> = (1..=4i64).map(PrimaryKey::single).collect();
    assert_eq!(applied, expected);
    assert!(handle.status().reconnects >= 1);

    stop.send(true).unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn idle_dialer_session_is_forgotten() {
    let applier = Arc::new(MemoryApplier::new());
    let listener = PeerListener::new(
        "node-b",
        applier.clone(),
        EventSink::new(Arc::new(MemoryLedger::new())),
    )
    .with_session_retention(Duration::ZERO);
    let socket = PeerListener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let url = format!("ws://{}", socket.local_addr().unwrap());
    let registry = listener.registry();
    let (stop, shutdown) = watch::channel(false);
    tokio::spawn(listener.run(socket, shutdown));

    let hello = |session_id| {
        let hello = PeerMessage::Hello {
            node_id: "node-a".into(),
            session_id,
        };
        Message::Binary(hello.encode().unwrap())
    };
    let old_session = Uuid::new_v4();

    let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    ws.send(hello(old_session)).await.unwrap();
    read(&mut ws).await;
    ws.send(change(1, 1)).await.unwrap();
    assert_eq!(read(&mut ws).await, PeerMessage::Ack { seq: 1 });
    ws.close(None).await.unwrap();
    eventually("disconnect", || registry.is_empty()).await;
    tokio::time::sleep(Duration::from_millis(5)).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    ws.send(hello(old_session)).await.unwrap();
    assert!(matches!(
        read(&mut ws).await,
        PeerMessage::Welcome { last_applied_seq: 0, .. }
    ));
    assert_eq!(applier.len(), 1);
    stop.send(true).unwrap();
}

#[tokio::test]
async fn failed_apply_is_reported_and_acknowledged() {
    let remote = remote().await;
    remote.applier.reject_table("t");

    let (mut ws, _) = tokio_tungstenite::connect_async(remote.url.as_str()).await.unwrap();
    let hello = PeerMessage::Hello {
        node_id: "node-a".into(),
        session_id: Uuid::new_v4(),
    };
    ws.send(Message::Binary(hello.encode().unwrap())).await.unwrap();
    read(&mut ws).await;
    ws.send(change(1, 4)).await.unwrap();
    assert_eq!(read(&mut ws).await, PeerMessage::Ack { seq: 1 });

    assert!(remote.applier.is_empty());
    let errors = remote.ledger.events_of(EventKind::ApplyError);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].payload["peer"], "node-a");
    assert_eq!(errors[0].payload["table"], "t");
    remote.stop.send(true).unwrap();
}

// ============================================================================
// Supervisor
// ============================================================================

#[tokio::test]
async fn supervisor_runs_and_stops_pairs() {
    let source = Arc::new(MemoryStore::new("x"));
    let target = Arc::new(MemoryStore::new("y"));
    source.put("t", PrimaryKey::single(1), row(1, 1, "a"));

    let supervisor = Supervisor::builder(EngineConfig::new("node-a").with_pair(pair()))
        .store(source.clone())
        .store(target.clone())
        .start()
        .await
        .unwrap();
    assert!(supervisor.is_running("p"));

    eventually("the copied row", || target.get("t", &PrimaryKey::single(1)).is_some()).await;
    eventually("a closed session", || !supervisor.status().is_empty()).await;
    assert_eq!(supervisor.status()[0].pair_id, "p");

    supervisor.stop("p").await.unwrap();
    assert!(!supervisor.is_running("p"));
    assert!(matches!(
        supervisor.stop("p").await,
        Err(SyncError::PairNotRunning(_))
    ));

    // a stopped pair can still be driven by hand
    source.put("t", PrimaryKey::single(2), row(2, 2, "b"));
    let session = supervisor.run_once("p").await.unwrap();
    assert_eq!(session.changes_applied, 1);

    supervisor.stop_all().await;
    assert!(!supervisor.recent_sessions(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn supervisor_rejects_missing_stores() {
    let result = Supervisor::builder(EngineConfig::new("node-a").with_pair(pair()))
        .store(Arc::new(MemoryStore::new("x")))
        .start()
        .await;
    assert!(matches!(result, Err(SyncError::Config(_))));
}

#[tokio::test]
async fn supervisors_propagate_between_nodes() {
    let applier = Arc::new(MemoryApplier::new());
    let receiver = Supervisor::builder(
        EngineConfig::new("node-b").with_listen("127.0.0.1:0".parse().unwrap()),
    )
    .applier(applier.clone())
    .start()
    .await
    .unwrap();
    let addr = receiver.listen_addr().unwrap();

    let source = Arc::new(MemoryStore::new("x"));
    let target = Arc::new(MemoryStore::new("y"));
    let config = EngineConfig::new("node-a")
        .with_pair(pair())
        .with_peer(PeerConfig::new("node-b", format!("ws://{addr}")).with_pair("p"))
        .with_reconnect(fast_retry());
    let sender = Supervisor::builder(config)
        .store(source.clone())
        .store(target.clone())
        .start()
        .await
        .unwrap();

    source.put("t", PrimaryKey::single(3), row(3, 5, "shared"));
    eventually("delivery to node-b", || applier.len() == 1).await;
    assert_eq!(applier.applied()[0].primary_key, PrimaryKey::single(3));
    eventually("node-b sees node-a", || {
        receiver.peers().iter().any(|p| p.peer_id == "node-a")
    })
    .await;
    assert!(sender.channels()[0].connected);

    sender.stop_all().await;
    receiver.stop_all().await;
}

// ============================================================================
// SQLite
// ============================================================================

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn sqlite_stores_sync_end_to_end() {
    use relsync_engine::{SqliteLedger, SqliteStore};

    let dir = tempfile::TempDir::new().unwrap();
    let open = |name: &str| format!("sqlite://{}", dir.path().join(format!("{name}.db")).display());

    let primary = SqliteStore::connect("primary", &open("primary")).await.unwrap();
    let replica = SqliteStore::connect("replica", &open("replica")).await.unwrap();
    for store in [&primary, &replica] {
        sqlx::query("CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT, updated_at INTEGER NOT NULL)")
            .execute(store.pool())
            .await
            .unwrap();
    }
    sqlx::query("INSERT INTO notes VALUES (1, 'from primary', 100)")
        .execute(primary.pool())
        .await
        .unwrap();
    sqlx::query("INSERT INTO notes VALUES (2, 'from replica', 200)")
        .execute(replica.pool())
        .await
        .unwrap();
    let ledger = Arc::new(SqliteLedger::connect(&open("ledger")).await.unwrap());

    let config = EngineConfig::new("node-a")
        .with_store("primary", open("primary"))
        .with_store("replica", open("replica"))
        .with_pair(
            PairConfig::new("notes", "primary", "replica")
                .with_table(TableSpec::versioned("notes", &["id"], "updated_at"))
                .with_watch_interval(Duration::from_secs(3600)),
        );
    let supervisor = Supervisor::builder(config)
        .store(Arc::new(primary.clone()))
        .store(Arc::new(replica.clone()))
        .ledger(ledger.clone())
        .start()
        .await
        .unwrap();
    supervisor.run_once("notes").await.unwrap();
    supervisor.stop_all().await;

    for pool in [primary.pool(), replica.pool()] {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM notes")
            .fetch_one(pool)
            .await
            .unwrap();
        assert_eq!(count, 2);
    }

    let quiet = supervisor.run_once("notes").await.unwrap();
    assert_eq!(quiet.changes_applied, 0);

    let sessions = ledger.recent_sessions(10).await.unwrap();
    assert!(sessions.iter().all(|s| s.status == SessionStatus::Completed));
    assert_eq!(sessions.iter().map(|s| s.changes_applied).sum::<u64>(), 2);
}
