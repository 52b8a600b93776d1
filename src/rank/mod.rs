/// Rank mutation
///
/// The user `rank` column is only ever changed here, inside a caller supplied
/// transaction that already holds the user's row lock.

mod daily_cap;

pub use daily_cap::{today_window, DailyCapTracker};

use crate::{
    db::lock_users,
    error::{LedgerError, LedgerResult},
    metrics,
};
use chrono::Utc;
use sqlx::sqlite::SqliteConnection;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Lowest rank a ledger mutation may leave a user at
pub const RANK_FLOOR: i64 = 1;

/// Clip a negative delta so `current + delta` stays at or above the floor
pub fn clip_to_floor(current: i64, delta: i64) -> i64 {
    if delta < 0 && current + delta < RANK_FLOOR {
        (RANK_FLOOR - current).min(0)
    } else {
        delta
    }
}

/// Delta decided for a grant before it is recorded and applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClippedDelta {
    pub delta: i64,
    /// A positive delta was dropped because the daily limit was reached
    pub capped: bool,
}

/// Result of a guarded trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Triggered {
    pub applied: i64,
    pub clipped_to_zero: bool,
}

#[derive(Clone)]
pub struct RankMutator {
    cap: DailyCapTracker,
    external_authority: Arc<AtomicBool>,
}

impl RankMutator {
    pub fn new(cap: DailyCapTracker, external_authority: bool) -> Self {
        Self {
            cap,
            external_authority: Arc::new(AtomicBool::new(external_authority)),
        }
    }

    /// Hand reputation over to (or take it back from) an external system of record
    pub fn set_external_authority(&self, enabled: bool) {
        let previous = self.external_authority.swap(enabled, Ordering::SeqCst);
        if previous != enabled {
            info!(enabled, "External rank authority changed");
        }
    }

    pub fn external_authority_enabled(&self) -> bool {
        self.external_authority.load(Ordering::SeqCst)
    }

    pub fn daily_cap(&self) -> &DailyCapTracker {
        &self.cap
    }

    /// Add `delta` to the user's rank, clipping at the floor.
    ///
    /// `current` must have been read under the same row lock. Returns the delta
    /// actually applied. Nothing is applied while an external authority owns rank.
    pub async fn apply_delta(
        &self,
        conn: &mut SqliteConnection,
        user_id: &str,
        current: i64,
        delta: i64,
    ) -> LedgerResult<i64> {
        if delta == 0 {
            return Ok(0);
        }

        if self.external_authority_enabled() {
            debug!(user_id, delta, "External rank authority enabled, skipping rank change");
            return Ok(0);
        }

        let delta = clip_to_floor(current, delta);
        if delta == 0 {
            return Ok(0);
        }

        let result = sqlx::query("UPDATE users SET rank = rank + ?1, updated_at = ?2 WHERE id = ?3")
            .bind(delta)
            .bind(Utc::now())
            .bind(user_id)
            .execute(&mut *conn)
            .await?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::NotFound(format!("User {} not found", user_id)));
        }

        metrics::record_rank_delta(delta);
        debug!(user_id, current, delta, "Applied rank delta");

        Ok(delta)
    }

    /// Decide the delta a grant of `activity_type` may apply.
    ///
    /// Shared by the batch orchestrators and [`RankMutator::trigger`], so both
    /// honour the same authority, floor and daily limit rules.
    pub async fn clip_for_grant(
        &self,
        conn: &mut SqliteConnection,
        user_id: &str,
        current: i64,
        delta: i64,
        activity_type: i64,
    ) -> LedgerResult<ClippedDelta> {
        if self.external_authority_enabled() || delta == 0 {
            return Ok(ClippedDelta {
                delta: 0,
                capped: false,
            });
        }

        if delta < 0 {
            return Ok(ClippedDelta {
                delta: clip_to_floor(current, delta),
                capped: false,
            });
        }

        if self.cap.is_capped(conn, user_id, activity_type).await? {
            metrics::record_capped_grant();
            return Ok(ClippedDelta {
                delta: 0,
                capped: true,
            });
        }

        Ok(ClippedDelta {
            delta,
            capped: false,
        })
    }

    /// Check and apply a delta in one step.
    ///
    /// Locks the user's row itself, so it can be used from flows that did not
    /// pre-compute a capped delta. A total no-op while an external authority
    /// owns rank.
    pub async fn trigger(
        &self,
        conn: &mut SqliteConnection,
        user_id: &str,
        delta: i64,
        activity_type: i64,
    ) -> LedgerResult<Triggered> {
        if self.external_authority_enabled() {
            debug!(user_id, delta, "External rank authority enabled, trigger ignored");
            return Ok(Triggered {
                applied: 0,
                clipped_to_zero: false,
            });
        }

        let ranks = lock_users(conn, [user_id]).await?;
        let current = ranks.get(user_id).copied().unwrap_or(RANK_FLOOR);

        let clipped = self
            .clip_for_grant(conn, user_id, current, delta, activity_type)
            .await?;
        let applied = self.apply_delta(conn, user_id, current, clipped.delta).await?;

        Ok(Triggered {
            applied,
            clipped_to_zero: clipped.capped,
        })
    }
}
