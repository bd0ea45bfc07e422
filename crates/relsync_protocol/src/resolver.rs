//! Conflict resolution policies.

use crate::error::{ProtocolError, ProtocolResult};
use crate::record::{ChangeRecord, Timestamp};
use crate::value::Row;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Origin store name given to records synthesized by a merge.
pub const MERGED_ORIGIN: &str = "merged";

/// A caller-supplied merge function.
///
/// Receives the local and remote record and returns the merged row. It
/// must be deterministic and must not perform I/O.
pub type MergeFn = Arc<dyn Fn(&ChangeRecord, &ChangeRecord) -> Result<Row, String> + Send + Sync>;

/// Which side a resolution picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Winner {
    /// The local (source) record won.
    Local,
    /// The remote (target) record won.
    Remote,
    /// Neither; a merged record was synthesized.
    Merged,
}

/// Result of applying a policy to a conflict.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// The record to write.
    pub winner: ChangeRecord,
    /// Which side produced the winner.
    pub side: Winner,
    /// Human-readable explanation.
    pub reason: String,
}

/// Policy for resolving a conflict between two versions of a row.
#[derive(Clone)]
pub enum ResolverPolicy {
    /// Later `observed_at` wins; ties go to the lexically greater origin store.
    LastWriteWins,
    /// A named caller-supplied merge function.
    CustomMerge {
        /// Registry name of the merge function.
        name: String,
        /// The merge function.
        merge: MergeFn,
    },
}

impl fmt::Debug for ResolverPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolverPolicy::LastWriteWins => write!(f, "LastWriteWins"),
            ResolverPolicy::CustomMerge { name, .. } => {
                f.debug_struct("CustomMerge").field("name", name).finish()
            }
        }
    }
}

impl ResolverPolicy {
    /// Wraps a merge function as a policy.
    pub fn custom<F>(name: impl Into<String>, merge: F) -> Self
    where
        F: Fn(&ChangeRecord, &ChangeRecord) -> Result<Row, String> + Send + Sync + 'static,
    {
        ResolverPolicy::CustomMerge {
            name: name.into(),
            merge: Arc::new(merge),
        }
    }

    /// Name recorded in conflict decisions.
    pub fn name(&self) -> String {
        match self {
            ResolverPolicy::LastWriteWins => "last-write-wins".to_string(),
            ResolverPolicy::CustomMerge { name, .. } => format!("custom:{name}"),
        }
    }

    /// Resolves a conflict between `local` and `remote`.
    ///
    /// Neither input is modified. Errors and panics raised by a merge
    /// function are returned as [`ProtocolError::MergeFailed`].
    pub fn resolve(&self, local: &ChangeRecord, remote: &ChangeRecord) -> ProtocolResult<Resolution> {
        if !local.same_row(remote) {
            return Err(ProtocolError::MismatchedRecords(format!(
                "{}[{}] vs {}[{}]",
                local.table, local.primary_key, remote.table, remote.primary_key
            )));
        }

        match self {
            ResolverPolicy::LastWriteWins => Ok(last_write_wins(local, remote)),
            ResolverPolicy::CustomMerge { name, merge } => {
                let merged = catch_unwind(AssertUnwindSafe(|| merge(local, remote)))
                    .map_err(|_| ProtocolError::merge_failed(name.as_str(), "merge function panicked"))?
                    .map_err(|message| ProtocolError::merge_failed(name.as_str(), message))?;

                let observed_at = local.observed_at.max(remote.observed_at);
                Ok(Resolution {
                    winner: local.with_values(merged, MERGED_ORIGIN, observed_at),
                    side: Winner::Merged,
                    reason: format!("merged by {name}"),
                })
            }
        }
    }
}

fn last_write_wins(local: &ChangeRecord, remote: &ChangeRecord) -> Resolution {
    // Total order: timestamp, then origin name, then content. The last key
    // only matters for records that are indistinguishable otherwise.
    let order = local
        .observed_at
        .cmp(&remote.observed_at)
        .then_with(|| local.origin_store.cmp(&remote.origin_store))
        .then_with(|| local.content_hash.cmp(&remote.content_hash));

    let (winner, loser, side) = if order == Ordering::Less {
        (remote, local, Winner::Remote)
    } else {
        (local, remote, Winner::Local)
    };

    let reason = if winner.observed_at != loser.observed_at {
        format!(
            "{} is newer: observed_at {} > {}",
            winner.origin_store, winner.observed_at, loser.observed_at
        )
    } else if winner.origin_store != loser.origin_store {
        format!(
            "observed_at tie at {}; {} wins lexical tie-break over {} (check clock skew)",
            winner.observed_at, winner.origin_store, loser.origin_store
        )
    } else {
        format!(
            "observed_at and origin tie at {}; kept {} by content order",
            winner.observed_at, winner.origin_store
        )
    };

    Resolution {
        winner: winner.clone(),
        side,
        reason,
    }
}

/// An audited conflict decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictDecision {
    /// Source-side record.
    pub local: ChangeRecord,
    /// Target-side record.
    pub remote: ChangeRecord,
    /// Name of the policy that decided.
    pub policy_name: String,
    /// The winning record.
    pub winner: ChangeRecord,
    /// Which side won.
    pub side: Winner,
    /// Explanation.
    pub reason: String,
    /// When the decision was made.
    pub decided_at: Timestamp,
}

impl ConflictDecision {
    /// Applies `policy` and records the outcome.
    pub fn decide(
        policy: &ResolverPolicy,
        local: &ChangeRecord,
        remote: &ChangeRecord,
        decided_at: Timestamp,
    ) -> ProtocolResult<Self> {
        let resolution = policy.resolve(local, remote)?;
        Ok(Self {
            local: local.clone(),
            remote: remote.clone(),
            policy_name: policy.name(),
            winner: resolution.winner,
            side: resolution.side,
            reason: resolution.reason,
            decided_at,
        })
    }
}
