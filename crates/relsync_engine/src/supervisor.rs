//! Engine supervisor.
//!
//! The supervisor is the composition root: it turns a validated
//! [`EngineConfig`] plus store instances into running tasks. Each pair
//! gets a coordinator task, each peer an outbound channel task, and the
//! optional listener one task plus one per accepted connection.
//!
//! Stopping is cooperative. A coordinator finishes the cycle it is in
//! before exiting, so `stop` and `stop_all` never leave a half-applied
//! cycle behind.

use crate::applier::{RemoteApplier, StoreApplier};
use crate::channel::{ChannelHandle, ChannelStatus, PeerChannel};
use crate::config::{ConfigError, EngineConfig, ResolverRegistry};
use crate::coordinator::{CoordinatorState, PairCoordinator};
use crate::error::{SyncError, SyncResult};
use crate::events::{EventHook, EventSink};
use crate::ledger::{MemoryLedger, SessionLedger};
use crate::listener::{Peer, PeerListener, PeerRegistry};
use crate::queue::{PeerOutbox, Propagator};
use crate::store::Store;
use parking_lot::Mutex;
use relsync_protocol::{MergeFn, SyncSession};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

struct Worker {
    name: String,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Worker {
    fn spawn<F, Fut>(name: impl Into<String>, run: F) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown, receiver) = watch::channel(false);
        Self {
            name: name.into(),
            shutdown,
            task: tokio::spawn(run(receiver)),
        }
    }

    fn signal(&self) {
        let _ = self.shutdown.send(true);
    }

    async fn join(self) {
        if let Err(e) = self.task.await {
            error!(task = %self.name, error = %e, "task ended abnormally");
        }
    }
}

async fn run_pair(coordinator: Arc<PairCoordinator>, mut shutdown: watch::Receiver<bool>) {
    let pair_id = coordinator.pair().id.clone();
    let interval = coordinator.pair().watch_interval;
    info!(pair = %pair_id, ?interval, "coordinator started");

    loop {
        if *shutdown.borrow() {
            break;
        }
        coordinator.run_cycle().await;
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => break,
        }
    }

    info!(pair = %pair_id, "coordinator stopped");
}

/// Collects the pieces a supervisor needs before it starts.
pub struct SupervisorBuilder {
    config: EngineConfig,
    stores: HashMap<String, Arc<dyn Store>>,
    ledger: Option<Arc<dyn SessionLedger>>,
    hook: Option<Arc<dyn EventHook>>,
    applier: Option<Arc<dyn RemoteApplier>>,
    registry: ResolverRegistry,
}

impl SupervisorBuilder {
    /// Registers a store under its own name.
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.stores.insert(store.name().to_string(), store);
        self
    }

    /// Sets the ledger. Defaults to an in-memory ledger.
    pub fn ledger(mut self, ledger: Arc<dyn SessionLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Sets the event hook.
    pub fn hook(mut self, hook: Arc<dyn EventHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Sets the callback for changes received from peers.
    ///
    /// Defaults to writing them into the source store of their pair.
    pub fn applier(mut self, applier: Arc<dyn RemoteApplier>) -> Self {
        self.applier = Some(applier);
        self
    }

    /// Registers a merge function for custom policies.
    pub fn merge(mut self, name: impl Into<String>, merge: MergeFn) -> Self {
        self.registry.register(name, merge);
        self
    }

    /// Validates everything and starts every task.
    ///
    /// Configuration problems are returned before anything is spawned.
    pub async fn start(self) -> SyncResult<Supervisor> {
        let config = self.config;
        config.validate()?;
        config.check_resolvers(&self.registry)?;

        let store = |pair: &str, name: &str| -> SyncResult<Arc<dyn Store>> {
            self.stores.get(name).cloned().ok_or_else(|| {
                SyncError::Config(ConfigError::UnknownStore {
                    pair: pair.to_string(),
                    store: name.to_string(),
                })
            })
        };

        let ledger = self
            .ledger
            .unwrap_or_else(|| Arc::new(MemoryLedger::new()) as Arc<dyn SessionLedger>);
        let mut events = EventSink::new(ledger.clone());
        if let Some(hook) = self.hook {
            events = events.with_hook(hook);
        }

        let mut propagator = Propagator::new(events.clone());
        let mut channels = Vec::with_capacity(config.peers.len());
        for peer in &config.peers {
            let mut outbox = PeerOutbox::new();
            for pair in config.pairs.iter().filter(|p| peer.subscribes_to(&p.id)) {
                let queue = outbox.add_pair(&pair.id, pair.queue_capacity);
                propagator.route(&pair.id, &peer.peer_id, queue);
            }
            channels.push(PeerChannel::new(
                &config.node_id,
                peer.clone(),
                outbox,
                config.reconnect.clone(),
            ));
        }

        let mut coordinators = BTreeMap::new();
        let mut default_applier = StoreApplier::new();
        for pair in &config.pairs {
            let source = store(&pair.id, &pair.source)?;
            let target = store(&pair.id, &pair.target)?;
            default_applier = default_applier.with_pair(&pair.id, source.clone(), &pair.tables);
            let coordinator = PairCoordinator::new(
                pair.clone(),
                source,
                target,
                &self.registry,
                events.clone(),
                propagator.clone(),
            )?;
            coordinators.insert(pair.id.clone(), Arc::new(coordinator));
        }

        let mut listener_worker = None;
        let mut peer_registry = None;
        let mut listen_addr = None;
        if let Some(addr) = config.listen {
            let socket = PeerListener::bind(addr).await?;
            listen_addr = Some(socket.local_addr()?);
            let applier = self
                .applier
                .unwrap_or_else(|| Arc::new(default_applier) as Arc<dyn RemoteApplier>);
            let listener = PeerListener::new(&config.node_id, applier, events.clone());
            peer_registry = Some(listener.registry());
            listener_worker = Some(Worker::spawn("listener", move |shutdown| {
                listener.run(socket, shutdown)
            }));
        }

        let mut pairs = HashMap::new();
        for (pair_id, coordinator) in &coordinators {
            let coordinator = coordinator.clone();
            let worker = Worker::spawn(format!("pair:{pair_id}"), move |shutdown| {
                run_pair(coordinator, shutdown)
            });
            pairs.insert(pair_id.clone(), worker);
        }

        let channel_handles = channels.iter().map(PeerChannel::handle).collect();
        let channel_workers = channels
            .into_iter()
            .map(|channel| {
                let name = format!("peer:{}", channel.handle().status().peer_id);
                Worker::spawn(name, move |shutdown| channel.run(shutdown))
            })
            .collect();

        info!(
            node = %config.node_id,
            pairs = coordinators.len(),
            peers = config.peers.len(),
            listen = ?listen_addr,
            "supervisor started"
        );

        Ok(Supervisor {
            coordinators,
            pairs: Mutex::new(pairs),
            channels: Mutex::new(channel_workers),
            channel_handles,
            listener: Mutex::new(listener_worker),
            peer_registry,
            listen_addr,
            ledger,
        })
    }
}

/// Owns every running coordinator, channel and listener.
pub struct Supervisor {
    coordinators: BTreeMap<String, Arc<PairCoordinator>>,
    pairs: Mutex<HashMap<String, Worker>>,
    channels: Mutex<Vec<Worker>>,
    channel_handles: Vec<ChannelHandle>,
    listener: Mutex<Option<Worker>>,
    peer_registry: Option<Arc<PeerRegistry>>,
    listen_addr: Option<SocketAddr>,
    ledger: Arc<dyn SessionLedger>,
}

impl Supervisor {
    /// Starts building a supervisor for `config`.
    pub fn builder(config: EngineConfig) -> SupervisorBuilder {
        SupervisorBuilder {
            config,
            stores: HashMap::new(),
            ledger: None,
            hook: None,
            applier: None,
            registry: ResolverRegistry::new(),
        }
    }

    /// Stops one pair after its current cycle.
    pub async fn stop(&self, pair_id: &str) -> SyncResult<()> {
        let worker = self
            .pairs
            .lock()
            .remove(pair_id)
            .ok_or_else(|| SyncError::PairNotRunning(pair_id.to_string()))?;
        worker.signal();
        worker.join().await;
        Ok(())
    }

    /// Stops everything, waiting for in-flight cycles to finish.
    pub async fn stop_all(&self) {
        let pairs: Vec<Worker> = self.pairs.lock().drain().map(|(_, w)| w).collect();
        for worker in &pairs {
            worker.signal();
        }
        for worker in pairs {
            worker.join().await;
        }

        let channels: Vec<Worker> = self.channels.lock().drain(..).collect();
        for worker in &channels {
            worker.signal();
        }
        for worker in channels {
            worker.join().await;
        }

        let listener = self.listener.lock().take();
        if let Some(worker) = listener {
            worker.signal();
            worker.join().await;
        }
        info!("supervisor stopped");
    }

    /// Most recent session per pair, ordered by pair id.
    pub fn status(&self) -> Vec<SyncSession> {
        self.coordinators
            .values()
            .filter_map(|c| c.last_session())
            .collect()
    }

    /// Current state of every coordinator.
    pub fn states(&self) -> Vec<(String, CoordinatorState)> {
        self.coordinators
            .iter()
            .map(|(id, c)| (id.clone(), c.state()))
            .collect()
    }

    /// Returns true if the pair's task is running.
    pub fn is_running(&self, pair_id: &str) -> bool {
        self.pairs.lock().contains_key(pair_id)
    }

    /// The coordinator of a pair.
    pub fn coordinator(&self, pair_id: &str) -> Option<Arc<PairCoordinator>> {
        self.coordinators.get(pair_id).cloned()
    }

    /// Runs one cycle of a pair right away.
    pub async fn run_once(&self, pair_id: &str) -> SyncResult<SyncSession> {
        let coordinator = self
            .coordinator(pair_id)
            .ok_or_else(|| SyncError::PairNotRunning(pair_id.to_string()))?;
        Ok(coordinator.run_cycle().await)
    }

    /// Most recent sessions from the ledger, newest first.
    pub async fn recent_sessions(&self, limit: usize) -> SyncResult<Vec<SyncSession>> {
        self.ledger.recent_sessions(limit).await
    }

    /// The ledger.
    pub fn ledger(&self) -> &Arc<dyn SessionLedger> {
        &self.ledger
    }

    /// Connected inbound peers.
    pub fn peers(&self) -> Vec<Peer> {
        self.peer_registry
            .as_ref()
            .map(|r| r.list())
            .unwrap_or_default()
    }

    /// Status of every outbound channel.
    pub fn channels(&self) -> Vec<ChannelStatus> {
        self.channel_handles.iter().map(ChannelHandle::status).collect()
    }

    /// Address the listener is bound to.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listen_addr
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("pairs", &self.coordinators.keys().collect::<Vec<_>>())
            .field("listen_addr", &self.listen_addr)
            .finish()
    }
}
