//! Sync pair coordinator state machine.
//!
//! One coordinator owns one source/target pair. A cycle moves through
//! `Scanning → Diffing → Resolving → Applying → Logging` and back to
//! `Idle`. A store error while scanning or applying ends the cycle in
//! `Failed`; the coordinator stays there until the next cycle starts.
//!
//! Version cursors only move after a table's writes succeed, so a failed
//! cycle is simply detected again on the next tick. Each batch is handed to
//! the peer queues as soon as its store commits it.

use crate::config::{PairConfig, ResolverRegistry};
use crate::detector::{ChangeDetector, Detection, TableCursor};
use crate::error::{SyncError, SyncResult};
use crate::events::{EventSink, SyncEvent};
use crate::ledger::SessionLedger;
use crate::queue::Propagator;
use crate::store::Store;
use parking_lot::{Mutex, RwLock};
use relsync_protocol::{
    now_millis, ChangeRecord, ConflictDecision, ContentHash, PrimaryKey, ResolverPolicy,
    SyncSession, TableSpec, Timestamp, Winner, MERGED_ORIGIN,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// The current state of a coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    /// Waiting for the next tick.
    Idle,
    /// Reading changes from both stores.
    Scanning,
    /// Classifying changes per key.
    Diffing,
    /// Running the resolver on conflicts.
    Resolving,
    /// Writing winners.
    Applying,
    /// Recording the session.
    Logging,
    /// The last cycle failed.
    Failed,
}

impl CoordinatorState {
    /// Returns true while a cycle is in progress.
    pub fn is_active(&self) -> bool {
        !matches!(self, CoordinatorState::Idle | CoordinatorState::Failed)
    }
}

/// Running totals for a coordinator.
#[derive(Debug, Clone, Default)]
pub struct CoordinatorStats {
    /// Cycles that completed.
    pub cycles_completed: u64,
    /// Cycles that failed or timed out.
    pub cycles_failed: u64,
    /// Rows written across both stores.
    pub changes_applied: u64,
    /// Conflicts decided.
    pub conflicts_resolved: u64,
    /// Table skips.
    pub tables_skipped: u64,
    /// Last failure.
    pub last_error: Option<String>,
}

struct CycleFailure {
    table: Option<String>,
    keys: Vec<String>,
    error: SyncError,
}

struct TablePlan<'a> {
    table: &'a TableSpec,
    cursor: TableCursor,
    source_high: Option<Timestamp>,
    target_high: Option<Timestamp>,
    to_target: Vec<ChangeRecord>,
    to_source: Vec<ChangeRecord>,
    converged: Vec<(PrimaryKey, ContentHash)>,
    conflicts: Vec<(ChangeRecord, ChangeRecord)>,
    hold_cursor: bool,
}

impl<'a> TablePlan<'a> {
    fn diff(table: &'a TableSpec, cursor: TableCursor, source: Detection, target: Detection) -> Self {
        let mut plan = TablePlan {
            table,
            cursor,
            source_high: source.high_water,
            target_high: target.high_water,
            to_target: Vec::new(),
            to_source: Vec::new(),
            converged: Vec::new(),
            conflicts: Vec::new(),
            hold_cursor: false,
        };

        let mut remote = target.changes;
        for (key, local) in source.changes {
            match remote.remove(&key) {
                None => plan.to_target.push(local),
                Some(other) if local.same_content(&other) => {
                    plan.converged.push((key, local.content_hash));
                }
                Some(other) => plan.conflicts.push((local, other)),
            }
        }
        plan.to_source.extend(remote.into_values());
        plan
    }
}

/// Drives sync cycles for one pair.
pub struct PairCoordinator {
    pair: PairConfig,
    source: Arc<dyn Store>,
    target: Arc<dyn Store>,
    default_policy: ResolverPolicy,
    policies: HashMap<String, ResolverPolicy>,
    detector: ChangeDetector,
    ledger: Arc<dyn SessionLedger>,
    events: EventSink,
    propagator: Propagator,
    state: RwLock<CoordinatorState>,
    stats: RwLock<CoordinatorStats>,
    cursors: Mutex<HashMap<String, TableCursor>>,
    last_session: RwLock<Option<SyncSession>>,
    cycle_lock: tokio::sync::Mutex<()>,
}

impl PairCoordinator {
    /// Creates a coordinator, binding every table's resolver policy.
    pub fn new(
        pair: PairConfig,
        source: Arc<dyn Store>,
        target: Arc<dyn Store>,
        registry: &ResolverRegistry,
        events: EventSink,
        propagator: Propagator,
    ) -> SyncResult<Self> {
        let default_policy = registry.resolve(&pair.resolver)?;
        let mut policies = HashMap::new();
        for table in &pair.tables {
            policies.insert(table.name.clone(), registry.resolve(&pair.policy_for(table)?)?);
        }

        Ok(Self {
            detector: ChangeDetector::new(pair.store_timeout),
            ledger: events.ledger().clone(),
            pair,
            source,
            target,
            default_policy,
            policies,
            events,
            propagator,
            state: RwLock::new(CoordinatorState::Idle),
            stats: RwLock::new(CoordinatorStats::default()),
            cursors: Mutex::new(HashMap::new()),
            last_session: RwLock::new(None),
            cycle_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// The pair this coordinator runs.
    pub fn pair(&self) -> &PairConfig {
        &self.pair
    }

    /// Gets the current state.
    pub fn state(&self) -> CoordinatorState {
        *self.state.read()
    }

    /// Gets the current stats.
    pub fn stats(&self) -> CoordinatorStats {
        self.stats.read().clone()
    }

    /// The most recently closed session.
    pub fn last_session(&self) -> Option<SyncSession> {
        self.last_session.read().clone()
    }

    /// Current cursor of a table.
    pub fn cursor(&self, table: &str) -> TableCursor {
        self.cursors.lock().get(table).cloned().unwrap_or_default()
    }

    fn set_state(&self, state: CoordinatorState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        if previous != state {
            debug!(pair = %self.pair.id, from = ?previous, to = ?state, "state change");
        }
    }

    fn policy_for(&self, table: &TableSpec) -> &ResolverPolicy {
        self.policies.get(&table.name).unwrap_or(&self.default_policy)
    }

    /// Runs one full cycle and returns its closed session.
    ///
    /// Never returns an error: failures are recorded in the session, the
    /// ledger and the event hook. Concurrent calls run one after another.
    pub async fn run_cycle(&self) -> SyncSession {
        let _cycle = self.cycle_lock.lock().await;
        let mut session = SyncSession::begin(&self.pair.id, now_millis());
        let span = info_span!("cycle", pair = %self.pair.id, session = %session.session_id);

        let outcome = tokio::time::timeout(self.pair.cycle_timeout, self.cycle(&mut session))
            .instrument(span)
            .await;

        match outcome {
            Ok(Ok(())) => {
                session.complete(now_millis());
                info!(
                    pair = %self.pair.id,
                    applied = session.changes_applied,
                    conflicts = session.conflicts_resolved,
                    skipped = session.tables_skipped,
                    "cycle completed"
                );
            }
            Ok(Err(failure)) => {
                self.set_state(CoordinatorState::Failed);
                error!(pair = %self.pair.id, error = %failure.error, "cycle failed");
                self.events
                    .emit(SyncEvent::SyncError {
                        pair_id: self.pair.id.clone(),
                        table: failure.table,
                        keys: failure.keys,
                        error: failure.error.to_string(),
                    })
                    .await;
                session.fail(now_millis(), failure.error.to_string());
            }
            Err(_) => {
                self.set_state(CoordinatorState::Failed);
                let error = SyncError::CycleTimeout {
                    pair: self.pair.id.clone(),
                    timeout_ms: self.pair.cycle_timeout.as_millis() as u64,
                };
                error!(pair = %self.pair.id, %error, "cycle aborted");
                self.events
                    .emit(SyncEvent::CycleTimeout {
                        pair_id: self.pair.id.clone(),
                        timeout_ms: self.pair.cycle_timeout.as_millis() as u64,
                    })
                    .await;
                session.fail(now_millis(), error.to_string());
            }
        }

        if let Err(e) = self.ledger.record_session(&session).await {
            error!(pair = %self.pair.id, error = %e, "failed to record session");
        }

        {
            let mut stats = self.stats.write();
            if session.status == relsync_protocol::SessionStatus::Completed {
                stats.cycles_completed += 1;
            } else {
                stats.cycles_failed += 1;
                stats.last_error = session.error.clone();
            }
            stats.changes_applied += session.changes_applied;
            stats.conflicts_resolved += session.conflicts_resolved;
            stats.tables_skipped += session.tables_skipped;
        }
        *self.last_session.write() = Some(session.clone());
        if self.state() != CoordinatorState::Failed {
            self.set_state(CoordinatorState::Idle);
        }
        session
    }

    async fn cycle(&self, session: &mut SyncSession) -> Result<(), CycleFailure> {
        self.set_state(CoordinatorState::Scanning);
        let scanned_at = now_millis();
        let mut scans = Vec::with_capacity(self.pair.tables.len());
        for table in &self.pair.tables {
            let cursor = self.cursor(&table.name);
            match self.scan_table(table, &cursor, scanned_at).await {
                Ok((source, target)) => scans.push((table, cursor, source, target)),
                Err(e) if e.is_table_scoped() => self.skip_table(session, table, e).await,
                Err(e) => {
                    return Err(CycleFailure {
                        table: Some(table.name.clone()),
                        keys: Vec::new(),
                        error: e,
                    })
                }
            }
        }

        self.set_state(CoordinatorState::Diffing);
        let mut plans: Vec<TablePlan<'_>> = scans
            .into_iter()
            .map(|(table, cursor, source, target)| TablePlan::diff(table, cursor, source, target))
            .collect();

        self.set_state(CoordinatorState::Resolving);
        for plan in &mut plans {
            self.resolve(session, plan).await;
        }

        self.set_state(CoordinatorState::Applying);
        for plan in plans {
            self.apply(session, plan).await?;
        }

        self.set_state(CoordinatorState::Logging);
        Ok(())
    }

    async fn scan_table(
        &self,
        table: &TableSpec,
        cursor: &TableCursor,
        scanned_at: Timestamp,
    ) -> SyncResult<(Detection, Detection)> {
        let source = self
            .detector
            .detect(
                self.source.as_ref(),
                &self.pair.id,
                table,
                cursor.source_since,
                &cursor.synced,
                scanned_at,
            )
            .await?;
        let target = self
            .detector
            .detect(
                self.target.as_ref(),
                &self.pair.id,
                table,
                cursor.target_since,
                &cursor.synced,
                scanned_at,
            )
            .await?;
        Ok((source, target))
    }

    async fn resolve(&self, session: &mut SyncSession, plan: &mut TablePlan<'_>) {
        let policy = self.policy_for(plan.table);
        for (local, remote) in std::mem::take(&mut plan.conflicts) {
            let decision = match ConflictDecision::decide(policy, &local, &remote, now_millis()) {
                Ok(decision) => decision,
                Err(e) => {
                    plan.hold_cursor = true;
                    let error = SyncError::ConflictPolicy {
                        table: plan.table.name.clone(),
                        key: local.primary_key.to_string(),
                        message: e.to_string(),
                    };
                    warn!(pair = %self.pair.id, %error, "conflict skipped");
                    self.events
                        .emit(SyncEvent::ConflictSkip {
                            pair_id: self.pair.id.clone(),
                            table: plan.table.name.clone(),
                            key: local.primary_key.to_string(),
                            error: error.to_string(),
                        })
                        .await;
                    continue;
                }
            };

            debug!(
                pair = %self.pair.id,
                table = %plan.table.name,
                key = %local.primary_key,
                policy = %decision.policy_name,
                reason = %decision.reason,
                "conflict resolved"
            );
            if let Err(e) = self.ledger.record_decision(&decision).await {
                error!(pair = %self.pair.id, error = %e, "failed to record decision");
            }
            session.conflicts_resolved += 1;

            match decision.side {
                Winner::Local => plan.to_target.push(decision.winner),
                Winner::Remote => plan.to_source.push(decision.winner),
                Winner::Merged => {
                    plan.to_target.push(decision.winner.clone());
                    plan.to_source.push(decision.winner);
                }
            }
        }
    }

    async fn apply(&self, session: &mut SyncSession, plan: TablePlan<'_>) -> Result<(), CycleFailure> {
        let table = plan.table;
        let mut cursor = plan.cursor;
        cursor.synced.extend(plan.converged);

        let batches = [
            (&self.target, plan.to_target, true),
            (&self.source, plan.to_source, false),
        ];
        for (store, records, publish_merged) in batches {
            if records.is_empty() {
                continue;
            }
            match self.write(store.as_ref(), table, &records).await {
                Ok(()) => session.changes_applied += records.len() as u64,
                Err(e) if e.is_table_scoped() => {
                    self.cursors.lock().insert(table.name.clone(), cursor);
                    self.skip_table(session, table, e).await;
                    return Ok(());
                }
                Err(e) => {
                    self.cursors.lock().insert(table.name.clone(), cursor);
                    return Err(CycleFailure {
                        table: Some(table.name.clone()),
                        keys: records.iter().map(|r| r.primary_key.to_string()).collect(),
                        error: e,
                    });
                }
            }

            for record in &records {
                cursor.synced.insert(record.primary_key.clone(), record.content_hash);
            }
            // Merged winners go out once, with the target batch.
            let outbound: Vec<ChangeRecord> = records
                .into_iter()
                .filter(|r| publish_merged || r.origin_store != MERGED_ORIGIN)
                .collect();
            if !outbound.is_empty() {
                self.propagator.publish(&self.pair.id, &outbound).await;
            }
        }

        // Each side's cursor only follows versions scanned from that side.
        if !plan.hold_cursor {
            cursor.source_since = TableCursor::advance(cursor.source_since, plan.source_high);
            cursor.target_since = TableCursor::advance(cursor.target_since, plan.target_high);
        }
        self.cursors.lock().insert(table.name.clone(), cursor);
        Ok(())
    }

    async fn write(&self, store: &dyn Store, table: &TableSpec, records: &[ChangeRecord]) -> SyncResult<()> {
        tokio::time::timeout(self.pair.store_timeout, store.apply_batch(table, records))
            .await
            .map_err(|_| {
                SyncError::store_unavailable(
                    store.name(),
                    format!("write exceeded {}ms", self.pair.store_timeout.as_millis()),
                )
            })?
    }

    async fn skip_table(&self, session: &mut SyncSession, table: &TableSpec, error: SyncError) {
        session.tables_skipped += 1;
        warn!(pair = %self.pair.id, table = %table.name, %error, "table skipped");
        self.events
            .emit(SyncEvent::SyncError {
                pair_id: self.pair.id.clone(),
                table: Some(table.name.clone()),
                keys: Vec::new(),
                error: error.to_string(),
            })
            .await;
    }
}

impl std::fmt::Debug for PairCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairCoordinator")
            .field("pair", &self.pair.id)
            .field("state", &self.state())
            .finish()
    }
}
