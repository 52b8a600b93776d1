/// Daily cap tracker
///
/// Earned rank is derived from the ledger itself: the positive rank of
/// available entries updated during the current local calendar day. There is
/// no separate counter to keep in sync.

use crate::{error::LedgerResult, site_config::SiteConfig};
use chrono::{DateTime, Duration, Local, NaiveTime, Utc};
use sqlx::sqlite::SqliteConnection;
use std::sync::Arc;
use tracing::debug;

#[derive(Clone)]
pub struct DailyCapTracker {
    config: Arc<SiteConfig>,
}

impl DailyCapTracker {
    pub fn new(config: Arc<SiteConfig>) -> Self {
        Self { config }
    }

    /// Rank the user earned today from kinds the cap applies to
    pub async fn earned_today(&self, conn: &mut SqliteConnection, user_id: &str) -> LedgerResult<i64> {
        let (start, end) = today_window(Local::now());
        self.earned_between(conn, user_id, start, end).await
    }

    /// Rank earned in `[start, end)` from kinds the cap applies to
    pub async fn earned_between(
        &self,
        conn: &mut SqliteConnection,
        user_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> LedgerResult<i64> {
        let excluded = self.config.daily_cap_exclusions().await?;

        let per_kind: Vec<(i64, i64)> = sqlx::query_as(
            "SELECT activity_type, COALESCE(SUM(rank), 0)
             FROM activity
             WHERE user_id = ?1 AND cancelled = 0 AND rank > 0
               AND updated_at >= ?2 AND updated_at < ?3
             GROUP BY activity_type",
        )
        .bind(user_id)
        .bind(start)
        .bind(end)
        .fetch_all(&mut *conn)
        .await?;

        Ok(per_kind
            .into_iter()
            .filter(|(kind, _)| !excluded.contains(kind))
            .map(|(_, earned)| earned)
            .sum())
    }

    /// Whether a positive grant of `activity_type` must be dropped for this user today
    pub async fn is_capped(
        &self,
        conn: &mut SqliteConnection,
        user_id: &str,
        activity_type: i64,
    ) -> LedgerResult<bool> {
        let Some(limit) = self.config.daily_rank_limit().await? else {
            return Ok(false);
        };

        if self.config.daily_cap_exclusions().await?.contains(&activity_type) {
            return Ok(false);
        }

        let earned = self.earned_today(conn, user_id).await?;
        let capped = earned >= limit;
        if capped {
            debug!(user_id, earned, limit, activity_type, "Daily rank limit reached");
        }

        Ok(capped)
    }
}

/// Start and end of the local calendar day containing `now`, in UTC
pub fn today_window(now: DateTime<Local>) -> (DateTime<Utc>, DateTime<Utc>) {
    let midnight = now.date_naive().and_time(NaiveTime::default());
    let start = midnight
        .and_local_timezone(Local)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        // Midnight skipped by a DST transition; the naive value is close enough
        .unwrap_or_else(|| midnight.and_utc());

    (start, start + Duration::days(1))
}
