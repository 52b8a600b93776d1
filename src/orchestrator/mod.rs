/// Ledger transaction orchestration
///
/// Every rank affecting flow follows the same shape: resolve and pre-check
/// outside any transaction, then in one transaction lock the affected users in
/// ID order, upsert or cancel ledger entries and apply the resulting deltas,
/// commit, and only then notify.

pub mod accept;
pub mod bonus;
pub mod follow;
pub mod vote;

pub use accept::AcceptAnswerOrchestrator;
pub use bonus::{BonusOutcome, BonusProcessor};
pub use follow::FollowProcessor;
pub use vote::{VoteDirection, VoteOrchestrator, VoteRequest};

use crate::{
    activity::{Activity, ActivityKind, ActivityStore, LedgerKey},
    cache::CacheClient,
    error::{LedgerError, LedgerResult},
    metrics,
    notification::{Notification, NotificationQueue},
    rank::RankMutator,
    site_config::SiteConfig,
};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnection, SqlitePool};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, warn};

/// Dependencies shared by every orchestrator
#[derive(Clone)]
pub struct LedgerServices {
    pub db: SqlitePool,
    pub config: Arc<SiteConfig>,
    pub activities: ActivityStore,
    pub rank: RankMutator,
    pub notifier: NotificationQueue,
    pub cache: Option<CacheClient>,
}

/// One intended grant inside a batch
#[derive(Debug, Clone)]
pub struct PlannedActivity {
    pub key: LedgerKey,
    pub rank: i64,
    pub has_rank: bool,
}

impl PlannedActivity {
    pub fn new(key: LedgerKey, kind: &ActivityKind) -> Self {
        Self {
            key,
            rank: kind.default_rank,
            has_rank: kind.has_rank,
        }
    }

    /// Keep the ledger record but carry no rank
    pub fn without_rank(mut self) -> Self {
        self.rank = 0;
        self
    }
}

/// A rank change actually applied to a user by a committed batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankChange {
    pub user_id: String,
    pub object_id: String,
    pub activity_type: i64,
    pub delta: i64,
}

/// Result of a vote or acceptance operation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerOutcome {
    /// A transaction was committed; false when the pre-check found nothing to do
    pub applied: bool,
    pub rank_changes: Vec<RankChange>,
}

impl LedgerOutcome {
    pub fn noop() -> Self {
        Self::default()
    }

    pub fn committed(rank_changes: Vec<RankChange>) -> Self {
        Self {
            applied: true,
            rank_changes,
        }
    }
}

pub type VoteOutcome = LedgerOutcome;
pub type AcceptOutcome = LedgerOutcome;

/// What a batch did, per key, in batch order
#[derive(Debug, Default)]
pub(crate) struct BatchResult {
    pub changes: Vec<RankChange>,
    /// Keys whose entry changed state (became available, or was cancelled)
    pub flipped_keys: Vec<LedgerKey>,
}

impl BatchResult {
    pub fn flipped(&self, key: &LedgerKey) -> bool {
        self.flipped_keys.iter().any(|k| k == key)
    }

    pub fn extend(&mut self, other: BatchResult) {
        self.changes.extend(other.changes);
        self.flipped_keys.extend(other.flipped_keys);
    }
}

impl LedgerServices {
    /// Look up the current rows for `keys`, outside any transaction
    pub async fn existing(&self, keys: &[&LedgerKey]) -> LedgerResult<Vec<Option<Activity>>> {
        let mut conn = self.db.acquire().await?;
        let mut rows = Vec::with_capacity(keys.len());
        for key in keys {
            rows.push(self.activities.find_existing(&mut conn, key).await?);
        }
        Ok(rows)
    }

    /// Every key already has an available entry
    pub async fn all_available(&self, keys: &[&LedgerKey]) -> LedgerResult<bool> {
        Ok(self
            .existing(keys)
            .await?
            .iter()
            .all(|row| row.as_ref().map(Activity::is_available).unwrap_or(false)))
    }

    /// At least one key has an available entry
    pub async fn any_available(&self, keys: &[&LedgerKey]) -> LedgerResult<bool> {
        Ok(self
            .existing(keys)
            .await?
            .iter()
            .any(|row| row.as_ref().map(Activity::is_available).unwrap_or(false)))
    }

    /// Grant every planned activity in order.
    ///
    /// For each key the delta is clipped against the user's running rank and
    /// the daily limit, recorded through the ledger upsert, and whatever the
    /// upsert reports as newly applied is added to the user. `ranks` must hold
    /// every affected user, locked by the caller's transaction.
    pub(crate) async fn grant_batch(
        &self,
        conn: &mut SqliteConnection,
        plans: &[PlannedActivity],
        ranks: &mut BTreeMap<String, i64>,
    ) -> LedgerResult<BatchResult> {
        let mut result = BatchResult::default();

        for plan in plans {
            let user_id = plan.key.user_id.as_str();
            let current = locked_rank(ranks, user_id)?;

            // duplicates are recorded as-is, without consulting the daily limit
            let duplicate = self
                .activities
                .find_existing(conn, &plan.key)
                .await?
                .map(|row| row.is_available())
                .unwrap_or(false);
            let proposed = if duplicate {
                0
            } else {
                self.rank
                    .clip_for_grant(conn, user_id, current, plan.rank, plan.key.activity_type)
                    .await?
                    .delta
            };

            let upserted = self
                .activities
                .upsert_available(conn, &plan.key, proposed, plan.has_rank)
                .await?;
            if upserted.newly_available {
                result.flipped_keys.push(plan.key.clone());
            }

            let applied = self
                .rank
                .apply_delta(conn, user_id, current, upserted.applied_rank)
                .await?;
            if applied != 0 {
                ranks.insert(user_id.to_string(), current + applied);
                result.changes.push(RankChange {
                    user_id: user_id.to_string(),
                    object_id: plan.key.object_id.clone(),
                    activity_type: plan.key.activity_type,
                    delta: applied,
                });
            }
        }

        Ok(result)
    }

    /// Cancel the entries for `keys` and roll back their rank.
    ///
    /// With `require_existing`, a key without a ledger row is a data
    /// inconsistency and fails the batch; otherwise it is skipped.
    pub(crate) async fn cancel_batch(
        &self,
        conn: &mut SqliteConnection,
        keys: &[&LedgerKey],
        ranks: &mut BTreeMap<String, i64>,
        require_existing: bool,
    ) -> LedgerResult<BatchResult> {
        let mut result = BatchResult::default();

        for key in keys {
            let row = match self.activities.find_existing(conn, key).await? {
                Some(row) => row,
                None if require_existing => {
                    error!(%key, "Ledger entry missing during cancellation");
                    return Err(LedgerError::DataInconsistency(format!(
                        "No ledger entry for {}",
                        key
                    )));
                }
                None => continue,
            };

            let cancelled = self.activities.cancel(conn, &row).await?;
            if cancelled.was_available {
                result.flipped_keys.push((*key).clone());
            }

            let user_id = key.user_id.as_str();
            let current = locked_rank(ranks, user_id)?;
            let applied = self
                .rank
                .apply_delta(conn, user_id, current, -cancelled.rolled_back_rank)
                .await?;
            if applied != 0 {
                ranks.insert(user_id.to_string(), current + applied);
                result.changes.push(RankChange {
                    user_id: user_id.to_string(),
                    object_id: key.object_id.clone(),
                    activity_type: key.activity_type,
                    delta: applied,
                });
            }
        }

        Ok(result)
    }

    /// Post-commit side effects: achievement notifications for every applied
    /// change, the caller's extra notifications, and cache eviction.
    pub(crate) async fn after_commit(&self, changes: &[RankChange], extra: Vec<Notification>) {
        self.notifier.send_all(
            changes
                .iter()
                .map(|c| Notification::achievement(&c.user_id, &c.object_id, c.activity_type, c.delta)),
        );
        self.notifier.send_all(extra);

        if let Some(cache) = &self.cache {
            let mut users: Vec<&str> = changes.iter().map(|c| c.user_id.as_str()).collect();
            users.sort_unstable();
            users.dedup();
            cache.invalidate_users(users).await;
        }
    }
}

fn locked_rank(ranks: &BTreeMap<String, i64>, user_id: &str) -> LedgerResult<i64> {
    ranks.get(user_id).copied().ok_or_else(|| {
        LedgerError::Internal(format!("User {} was not locked by this transaction", user_id))
    })
}

/// Times one orchestrated operation and records its outcome
pub(crate) struct OperationTimer {
    flow: &'static str,
    started: Instant,
}

impl OperationTimer {
    pub fn start(flow: &'static str) -> Self {
        Self {
            flow,
            started: Instant::now(),
        }
    }

    /// Record the outcome; `applied` tells a committed result from a pre-check no-op
    pub fn finish<T>(self, result: &LedgerResult<T>, applied: impl FnOnce(&T) -> bool) {
        match result {
            Ok(value) if applied(value) => metrics::record_ledger_operation(
                self.flow,
                "committed",
                self.started.elapsed().as_secs_f64(),
            ),
            Ok(_) => metrics::record_ledger_skip(self.flow, "noop"),
            Err(e) => {
                warn!(flow = self.flow, class = e.class(), "Ledger operation failed: {}", e);
                metrics::record_ledger_operation(
                    self.flow,
                    e.class(),
                    self.started.elapsed().as_secs_f64(),
                );
            }
        }
    }
}
