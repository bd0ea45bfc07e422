//! Configuration for the sync engine.
//!
//! Configuration is either built in code with the `with_*` builders or
//! loaded from a JSON file. Both paths end in [`EngineConfig::validate`],
//! and a supervisor only ever starts from a validated config.

use relsync_protocol::{validate_identifier, ChangeDetection, MergeFn, ResolverPolicy, TableSpec};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default number of queued changes per peer subscription.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Configuration errors. Always fatal to start.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("cannot read {path}: {message}")]
    Read {
        /// File path.
        path: String,
        /// Error message.
        message: String,
    },

    /// The file is not valid JSON for the schema.
    #[error("invalid config json: {0}")]
    Parse(String),

    /// Two pairs share an id.
    #[error("duplicate pair id: {0}")]
    DuplicatePair(String),

    /// Two stores share a name.
    #[error("duplicate store name: {0}")]
    DuplicateStore(String),

    /// A pair references a store that is not configured.
    #[error("pair {pair} references unknown store {store}")]
    UnknownStore {
        /// Pair id.
        pair: String,
        /// Store name.
        store: String,
    },

    /// A pair uses the same store on both sides.
    #[error("pair {0} uses the same store as source and target")]
    SameStore(String),

    /// A pair has no tables.
    #[error("pair {0} has no tables")]
    NoTables(String),

    /// A table spec is malformed.
    #[error("pair {pair}: invalid table: {message}")]
    InvalidTable {
        /// Pair id.
        pair: String,
        /// Error message.
        message: String,
    },

    /// A pair has a non-positive interval or timeout.
    #[error("pair {pair}: {field} must be positive")]
    NonPositive {
        /// Pair id.
        pair: String,
        /// Field name.
        field: &'static str,
    },

    /// A resolver policy name is not recognised.
    #[error("unknown resolver policy: {0}")]
    UnknownPolicy(String),

    /// A custom policy has no merge name.
    #[error("custom policy for {0} has no merge function name")]
    MissingMerge(String),

    /// A custom policy names a merge function that was never registered.
    #[error("merge function {0} is not registered")]
    UnregisteredMerge(String),

    /// A peer subscribes to a pair that does not exist.
    #[error("peer {peer} references unknown pair {pair}")]
    UnknownPeerPair {
        /// Peer id.
        peer: String,
        /// Pair id.
        pair: String,
    },

    /// Two peers share an id.
    #[error("duplicate peer id: {0}")]
    DuplicatePeer(String),

    /// A peer URL is not a WebSocket URL.
    #[error("peer {peer} has invalid url {url}")]
    InvalidPeerUrl {
        /// Peer id.
        peer: String,
        /// The URL.
        url: String,
    },

    /// The listen address does not parse.
    #[error("invalid listen address: {0}")]
    InvalidListen(String),
}

/// Result type for configuration.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Resolver selection before merge functions are bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicySpec {
    /// Last write wins.
    LastWriteWins,
    /// Named custom merge.
    Custom(String),
}

impl PolicySpec {
    /// Parses a policy name.
    ///
    /// Accepts `last-write-wins`, its alias `timestamp`, `custom` (with the
    /// merge name given separately) and the compact `custom:<merge>`.
    pub fn parse(name: &str, merge: Option<&str>) -> ConfigResult<Self> {
        match name {
            "last-write-wins" | "timestamp" => Ok(PolicySpec::LastWriteWins),
            "custom" => merge
                .filter(|m| !m.is_empty())
                .map(|m| PolicySpec::Custom(m.to_string()))
                .ok_or_else(|| ConfigError::MissingMerge(name.to_string())),
            other => match other.strip_prefix("custom:") {
                Some(m) if !m.is_empty() => Ok(PolicySpec::Custom(m.to_string())),
                _ => Err(ConfigError::UnknownPolicy(other.to_string())),
            },
        }
    }
}

/// Named merge functions available to custom policies.
#[derive(Clone, Default)]
pub struct ResolverRegistry {
    merges: HashMap<String, MergeFn>,
}

impl ResolverRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a merge function under `name`.
    pub fn register(&mut self, name: impl Into<String>, merge: MergeFn) {
        self.merges.insert(name.into(), merge);
    }

    /// Returns true if `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.merges.contains_key(name)
    }

    /// Binds a policy spec to a runnable policy.
    pub fn resolve(&self, spec: &PolicySpec) -> ConfigResult<ResolverPolicy> {
        match spec {
            PolicySpec::LastWriteWins => Ok(ResolverPolicy::LastWriteWins),
            PolicySpec::Custom(name) => self
                .merges
                .get(name)
                .map(|merge| ResolverPolicy::CustomMerge {
                    name: name.clone(),
                    merge: merge.clone(),
                })
                .ok_or_else(|| ConfigError::UnregisteredMerge(name.clone())),
        }
    }
}

impl std::fmt::Debug for ResolverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.merges.keys().collect();
        names.sort();
        f.debug_struct("ResolverRegistry").field("merges", &names).finish()
    }
}

/// Configuration for reconnect behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Initial delay between attempts.
    pub initial_delay: Duration,
    /// Maximum delay between attempts.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a configuration with the default backoff curve.
    pub fn new() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Disables jitter.
    pub fn without_jitter(mut self) -> Self {
        self.add_jitter = false;
        self
    }

    /// Calculates the delay before reconnect attempt `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);

        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // up to 25% jitter
            let jitter = delay_secs * 0.25 * rand_jitter();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn rand_jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 1000) as f64 / 1000.0
}

/// A named store endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Store name, used as `origin_store` on records.
    pub name: String,
    /// Connection URL (`sqlite://...` or `memory://`).
    pub url: String,
}

/// Configuration for one sync pair.
#[derive(Debug, Clone)]
pub struct PairConfig {
    /// Pair id.
    pub id: String,
    /// Source store name.
    pub source: String,
    /// Target store name.
    pub target: String,
    /// Delay between cycles.
    pub watch_interval: Duration,
    /// Upper bound on one cycle.
    pub cycle_timeout: Duration,
    /// Upper bound on one store call.
    pub store_timeout: Duration,
    /// Capacity of each peer queue fed by this pair.
    pub queue_capacity: usize,
    /// Default resolver policy.
    pub resolver: PolicySpec,
    /// Tables to synchronize.
    pub tables: Vec<TableSpec>,
}

impl PairConfig {
    /// Creates a pair with default timings and last-write-wins.
    pub fn new(id: impl Into<String>, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            watch_interval: Duration::from_secs(1),
            cycle_timeout: Duration::from_secs(30),
            store_timeout: Duration::from_secs(5),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            resolver: PolicySpec::LastWriteWins,
            tables: Vec::new(),
        }
    }

    /// Adds a table.
    pub fn with_table(mut self, table: TableSpec) -> Self {
        self.tables.push(table);
        self
    }

    /// Sets the watch interval.
    pub fn with_watch_interval(mut self, interval: Duration) -> Self {
        self.watch_interval = interval;
        self
    }

    /// Sets the cycle timeout.
    pub fn with_cycle_timeout(mut self, timeout: Duration) -> Self {
        self.cycle_timeout = timeout;
        self
    }

    /// Sets the per-call store timeout.
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Sets the peer queue capacity.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Sets the default resolver policy.
    pub fn with_resolver(mut self, resolver: PolicySpec) -> Self {
        self.resolver = resolver;
        self
    }

    /// Returns the policy spec for a table, honoring its override.
    pub fn policy_for(&self, table: &TableSpec) -> ConfigResult<PolicySpec> {
        match table.resolver.as_deref() {
            Some(name) => PolicySpec::parse(name, None),
            None => Ok(self.resolver.clone()),
        }
    }

    fn validate(&self) -> ConfigResult<()> {
        validate_identifier(&self.id).map_err(|e| ConfigError::InvalidTable {
            pair: self.id.clone(),
            message: e.to_string(),
        })?;
        if self.source == self.target {
            return Err(ConfigError::SameStore(self.id.clone()));
        }
        if self.tables.is_empty() {
            return Err(ConfigError::NoTables(self.id.clone()));
        }
        for (field, value) in [
            ("watchIntervalMs", self.watch_interval),
            ("cycleTimeoutMs", self.cycle_timeout),
            ("storeTimeoutMs", self.store_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::NonPositive {
                    pair: self.id.clone(),
                    field,
                });
            }
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::NonPositive {
                pair: self.id.clone(),
                field: "queueCapacity",
            });
        }

        let mut names = HashSet::new();
        for table in &self.tables {
            table.validate().map_err(|e| ConfigError::InvalidTable {
                pair: self.id.clone(),
                message: e.to_string(),
            })?;
            if !names.insert(table.name.as_str()) {
                return Err(ConfigError::InvalidTable {
                    pair: self.id.clone(),
                    message: format!("table {} listed twice", table.name),
                });
            }
            self.policy_for(table)?;
        }
        Ok(())
    }
}

/// A remote peer to push changes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    /// Peer id.
    pub peer_id: String,
    /// WebSocket URL.
    pub url: String,
    /// Pairs whose changes go to this peer; empty means every pair.
    pub pairs: Vec<String>,
}

impl PeerConfig {
    /// Creates a peer subscribed to every pair.
    pub fn new(peer_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            url: url.into(),
            pairs: Vec::new(),
        }
    }

    /// Restricts the peer to the given pair.
    pub fn with_pair(mut self, pair_id: impl Into<String>) -> Self {
        self.pairs.push(pair_id.into());
        self
    }

    /// Returns true if changes from `pair_id` go to this peer.
    pub fn subscribes_to(&self, pair_id: &str) -> bool {
        self.pairs.is_empty() || self.pairs.iter().any(|p| p == pair_id)
    }
}

/// Validated configuration for a whole engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// This node's id, sent in peer handshakes.
    pub node_id: String,
    /// Store endpoints.
    pub stores: Vec<StoreConfig>,
    /// Sync pairs.
    pub pairs: Vec<PairConfig>,
    /// Outbound peers.
    pub peers: Vec<PeerConfig>,
    /// Bind address for inbound peers.
    pub listen: Option<SocketAddr>,
    /// Ledger URL; `None` keeps the ledger in memory.
    pub ledger: Option<String>,
    /// Reconnect backoff.
    pub reconnect: RetryConfig,
}

impl EngineConfig {
    /// Creates an empty configuration.
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            stores: Vec::new(),
            pairs: Vec::new(),
            peers: Vec::new(),
            listen: None,
            ledger: None,
            reconnect: RetryConfig::default(),
        }
    }

    /// Adds a store endpoint.
    pub fn with_store(mut self, name: impl Into<String>, url: impl Into<String>) -> Self {
        self.stores.push(StoreConfig {
            name: name.into(),
            url: url.into(),
        });
        self
    }

    /// Adds a pair.
    pub fn with_pair(mut self, pair: PairConfig) -> Self {
        self.pairs.push(pair);
        self
    }

    /// Adds a peer.
    pub fn with_peer(mut self, peer: PeerConfig) -> Self {
        self.peers.push(peer);
        self
    }

    /// Sets the listen address.
    pub fn with_listen(mut self, addr: SocketAddr) -> Self {
        self.listen = Some(addr);
        self
    }

    /// Sets the reconnect backoff.
    pub fn with_reconnect(mut self, reconnect: RetryConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Parses and validates a JSON document.
    pub fn from_json(json: &str) -> ConfigResult<Self> {
        let file: ConfigFile =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        let config = file.into_config()?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_json(&json)
    }

    /// Returns the pair with the given id.
    pub fn pair(&self, id: &str) -> Option<&PairConfig> {
        self.pairs.iter().find(|p| p.id == id)
    }

    /// Checks every structural rule.
    ///
    /// Stores are only checked against the store list when one is given;
    /// embedders may instead hand store instances to the supervisor.
    pub fn validate(&self) -> ConfigResult<()> {
        let mut store_names = HashSet::new();
        for store in &self.stores {
            if !store_names.insert(store.name.as_str()) {
                return Err(ConfigError::DuplicateStore(store.name.clone()));
            }
        }

        let mut pair_ids = HashSet::new();
        for pair in &self.pairs {
            if !pair_ids.insert(pair.id.as_str()) {
                return Err(ConfigError::DuplicatePair(pair.id.clone()));
            }
            pair.validate()?;
            if !self.stores.is_empty() {
                for store in [&pair.source, &pair.target] {
                    if !store_names.contains(store.as_str()) {
                        return Err(ConfigError::UnknownStore {
                            pair: pair.id.clone(),
                            store: store.clone(),
                        });
                    }
                }
            }
        }

        let mut peer_ids = HashSet::new();
        for peer in &self.peers {
            if !peer_ids.insert(peer.peer_id.as_str()) {
                return Err(ConfigError::DuplicatePeer(peer.peer_id.clone()));
            }
            if !(peer.url.starts_with("ws://") || peer.url.starts_with("wss://")) {
                return Err(ConfigError::InvalidPeerUrl {
                    peer: peer.peer_id.clone(),
                    url: peer.url.clone(),
                });
            }
            if let Some(unknown) = peer.pairs.iter().find(|p| !pair_ids.contains(p.as_str())) {
                return Err(ConfigError::UnknownPeerPair {
                    peer: peer.peer_id.clone(),
                    pair: unknown.clone(),
                });
            }
        }
        Ok(())
    }

    /// Binds every pair and table policy against `registry`.
    pub fn check_resolvers(&self, registry: &ResolverRegistry) -> ConfigResult<()> {
        for pair in &self.pairs {
            registry.resolve(&pair.resolver)?;
            for table in &pair.tables {
                registry.resolve(&pair.policy_for(table)?)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ConfigFile {
    #[serde(default = "default_node_id")]
    node_id: String,
    #[serde(default)]
    stores: Vec<StoreEntry>,
    pairs: Vec<PairEntry>,
    #[serde(default)]
    peers: Vec<PeerEntry>,
    listen: Option<String>,
    ledger: Option<String>,
    reconnect: Option<ReconnectEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct StoreEntry {
    name: String,
    url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct PairEntry {
    id: String,
    source: String,
    target: String,
    #[serde(default = "default_watch_interval_ms")]
    watch_interval_ms: u64,
    #[serde(default = "default_cycle_timeout_ms")]
    cycle_timeout_ms: u64,
    #[serde(default = "default_store_timeout_ms")]
    store_timeout_ms: u64,
    #[serde(default = "default_queue_capacity")]
    queue_capacity: usize,
    #[serde(default = "default_policy")]
    resolver_policy: String,
    merge: Option<String>,
    tables: Vec<TableEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct TableEntry {
    name: String,
    primary_key: Vec<String>,
    version_column: Option<String>,
    resolver_policy: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct PeerEntry {
    peer_id: String,
    url: String,
    #[serde(default)]
    pairs: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ReconnectEntry {
    initial_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    multiplier: Option<f64>,
}

fn default_node_id() -> String {
    "relsync".to_string()
}

fn default_watch_interval_ms() -> u64 {
    1_000
}

fn default_cycle_timeout_ms() -> u64 {
    30_000
}

fn default_store_timeout_ms() -> u64 {
    5_000
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

fn default_policy() -> String {
    "last-write-wins".to_string()
}

impl ConfigFile {
    fn into_config(self) -> ConfigResult<EngineConfig> {
        let mut pairs = Vec::with_capacity(self.pairs.len());
        for entry in self.pairs {
            let resolver = PolicySpec::parse(&entry.resolver_policy, entry.merge.as_deref())?;
            let tables = entry
                .tables
                .into_iter()
                .map(|t| TableSpec {
                    name: t.name,
                    primary_key: t.primary_key,
                    detection: match t.version_column {
                        Some(column) => ChangeDetection::VersionColumn(column),
                        None => ChangeDetection::ContentHash,
                    },
                    resolver: t.resolver_policy,
                })
                .collect();
            pairs.push(PairConfig {
                id: entry.id,
                source: entry.source,
                target: entry.target,
                watch_interval: Duration::from_millis(entry.watch_interval_ms),
                cycle_timeout: Duration::from_millis(entry.cycle_timeout_ms),
                store_timeout: Duration::from_millis(entry.store_timeout_ms),
                queue_capacity: entry.queue_capacity,
                resolver,
                tables,
            });
        }

        let listen = self
            .listen
            .map(|addr| {
                addr.parse::<SocketAddr>()
                    .map_err(|_| ConfigError::InvalidListen(addr.clone()))
            })
            .transpose()?;

        let mut reconnect = RetryConfig::default();
        if let Some(entry) = self.reconnect {
            if let Some(ms) = entry.initial_delay_ms {
                reconnect = reconnect.with_initial_delay(Duration::from_millis(ms));
            }
            if let Some(ms) = entry.max_delay_ms {
                reconnect = reconnect.with_max_delay(Duration::from_millis(ms));
            }
            if let Some(multiplier) = entry.multiplier {
                reconnect = reconnect.with_backoff_multiplier(multiplier);
            }
        }

        Ok(EngineConfig {
            node_id: self.node_id,
            stores: self
                .stores
                .into_iter()
                .map(|s| StoreConfig {
                    name: s.name,
                    url: s.url,
                })
                .collect(),
            pairs,
            peers: self
                .peers
                .into_iter()
                .map(|p| PeerConfig {
                    peer_id: p.peer_id,
                    url: p.url,
                    pairs: p.pairs,
                })
                .collect(),
            listen,
            ledger: self.ledger,
            reconnect,
        })
    }
}
