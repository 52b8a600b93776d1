/// Activity ledger store
use crate::{
    activity::{Activity, LedgerKey, RankEarner},
    error::{LedgerError, LedgerResult},
    object_id::{gen_unique_id, EntityKind},
};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnection, SqlitePool};
use tracing::{debug, error};

const ACTIVITY_COLUMNS: &str = "id, object_id, original_object_id, user_id, trigger_user_id, \
     activity_type, rank, has_rank, cancelled, cancelled_at, created_at, updated_at";

/// Result of making a ledger entry available
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    /// Rank the caller must still add to the user; 0 for duplicate grants
    pub applied_rank: i64,
    /// The entry went from missing or cancelled to available
    pub newly_available: bool,
}

/// Result of cancelling a ledger entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelOutcome {
    /// Rank the caller must roll back from the user; 0 if already cancelled
    pub rolled_back_rank: i64,
    /// The entry was available before this call
    pub was_available: bool,
}

/// Store over `activity` rows.
///
/// Mutating operations take the caller's transaction connection and assume the
/// affected user rows are already locked by it.
#[derive(Clone)]
pub struct ActivityStore {
    db: SqlitePool,
}

impl ActivityStore {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Read-only lookup of the row for `key`
    pub async fn find_existing(
        &self,
        conn: &mut SqliteConnection,
        key: &LedgerKey,
    ) -> LedgerResult<Option<Activity>> {
        let sql = format!(
            "SELECT {} FROM activity
             WHERE object_id = ?1 AND user_id = ?2 AND trigger_user_id = ?3 AND activity_type = ?4",
            ACTIVITY_COLUMNS
        );

        let row = sqlx::query_as::<_, Activity>(&sql)
            .bind(&key.object_id)
            .bind(&key.user_id)
            .bind(&key.trigger_user_id)
            .bind(key.activity_type)
            .fetch_optional(&mut *conn)
            .await?;

        Ok(row)
    }

    pub async fn find_by_id(
        &self,
        conn: &mut SqliteConnection,
        id: &str,
    ) -> LedgerResult<Option<Activity>> {
        let sql = format!("SELECT {} FROM activity WHERE id = ?1", ACTIVITY_COLUMNS);

        let row = sqlx::query_as::<_, Activity>(&sql)
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;

        Ok(row)
    }

    /// Make the entry for `key` available with `proposed_rank`.
    ///
    /// Inserts a new row on first grant and revives a cancelled row on re-grant.
    /// A row that is already available keeps its rank and the outcome carries
    /// an applied rank of 0, so the caller never adds rank twice for one entry.
    /// Only its original object follows the key.
    pub async fn upsert_available(
        &self,
        conn: &mut SqliteConnection,
        key: &LedgerKey,
        proposed_rank: i64,
        has_rank: bool,
    ) -> LedgerResult<UpsertOutcome> {
        let now = Utc::now();

        match self.find_existing(conn, key).await? {
            None => {
                let id = gen_unique_id(conn, EntityKind::Activity).await?;

                sqlx::query(
                    "INSERT INTO activity (id, object_id, original_object_id, user_id, trigger_user_id,
                                           activity_type, rank, has_rank, cancelled, cancelled_at,
                                           created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, NULL, ?9, ?10)",
                )
                .bind(&id)
                .bind(&key.object_id)
                .bind(&key.original_object_id)
                .bind(&key.user_id)
                .bind(&key.trigger_user_id)
                .bind(key.activity_type)
                .bind(proposed_rank)
                .bind(has_rank)
                .bind(now)
                .bind(now)
                .execute(&mut *conn)
                .await?;

                debug!(activity_id = %id, %key, rank = proposed_rank, "Inserted activity");

                Ok(UpsertOutcome {
                    applied_rank: proposed_rank,
                    newly_available: true,
                })
            }
            Some(existing) if existing.is_available() => {
                if existing.original_object_id != key.original_object_id {
                    sqlx::query("UPDATE activity SET original_object_id = ?1, updated_at = ?2 WHERE id = ?3")
                        .bind(&key.original_object_id)
                        .bind(now)
                        .bind(&existing.id)
                        .execute(&mut *conn)
                        .await?;

                    debug!(activity_id = %existing.id, original_object_id = %key.original_object_id,
                           "Moved activity to a new original object");
                }

                debug!(activity_id = %existing.id, %key, "Activity already available, duplicate grant ignored");

                Ok(UpsertOutcome {
                    applied_rank: 0,
                    newly_available: false,
                })
            }
            Some(existing) => {
                sqlx::query(
                    "UPDATE activity
                     SET cancelled = 0, cancelled_at = NULL, rank = ?1, has_rank = ?2,
                         original_object_id = ?3, updated_at = ?4
                     WHERE id = ?5",
                )
                .bind(proposed_rank)
                .bind(has_rank)
                .bind(&key.original_object_id)
                .bind(now)
                .bind(&existing.id)
                .execute(&mut *conn)
                .await?;

                debug!(activity_id = %existing.id, %key, rank = proposed_rank, "Revived cancelled activity");

                Ok(UpsertOutcome {
                    applied_rank: proposed_rank,
                    newly_available: true,
                })
            }
        }
    }

    /// Cancel an entry previously read by the caller.
    ///
    /// The row is re-fetched inside the transaction. Cancelling an already
    /// cancelled row forces its rank to 0 and rolls nothing back.
    pub async fn cancel(
        &self,
        conn: &mut SqliteConnection,
        activity: &Activity,
    ) -> LedgerResult<CancelOutcome> {
        let current = self.find_by_id(conn, &activity.id).await?.ok_or_else(|| {
            error!(activity_id = %activity.id, object_id = %activity.object_id,
                   user_id = %activity.user_id, "Activity vanished during cancellation");
            LedgerError::DataInconsistency(format!("Activity {} not found", activity.id))
        })?;

        if current.cancelled {
            sqlx::query("UPDATE activity SET rank = 0 WHERE id = ?1")
                .bind(&current.id)
                .execute(&mut *conn)
                .await?;

            debug!(activity_id = %current.id, "Activity already cancelled");

            return Ok(CancelOutcome {
                rolled_back_rank: 0,
                was_available: false,
            });
        }

        let now = Utc::now();
        sqlx::query(
            "UPDATE activity SET cancelled = 1, cancelled_at = ?1, updated_at = ?2 WHERE id = ?3",
        )
        .bind(now)
        .bind(now)
        .bind(&current.id)
        .execute(&mut *conn)
        .await?;

        debug!(activity_id = %current.id, rank = current.rank, "Cancelled activity");

        Ok(CancelOutcome {
            rolled_back_rank: current.rank,
            was_available: true,
        })
    }

    /// Rank history of a user, newest first
    pub async fn list_user_activities(
        &self,
        user_id: &str,
        include_cancelled: bool,
        limit: i64,
        offset: i64,
    ) -> LedgerResult<Vec<Activity>> {
        let filter = if include_cancelled {
            ""
        } else {
            "AND cancelled = 0"
        };
        let sql = format!(
            "SELECT {} FROM activity
             WHERE user_id = ?1 AND has_rank = 1 {}
             ORDER BY updated_at DESC, id DESC
             LIMIT ?2 OFFSET ?3",
            ACTIVITY_COLUMNS, filter
        );

        let rows = sqlx::query_as::<_, Activity>(&sql)
            .bind(user_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.db)
            .await?;

        Ok(rows)
    }

    /// Users who earned the most rank since `since`
    pub async fn top_rank_earners(
        &self,
        since: DateTime<Utc>,
        limit: i64,
    ) -> LedgerResult<Vec<RankEarner>> {
        let rows = sqlx::query_as::<_, RankEarner>(
            "SELECT user_id, SUM(rank) AS earned
             FROM activity
             WHERE cancelled = 0 AND rank > 0 AND updated_at >= ?1
             GROUP BY user_id
             ORDER BY earned DESC, user_id ASC
             LIMIT ?2",
        )
        .bind(since)
        .bind(limit)
        .fetch_all(&self.db)
        .await?;

        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::*;
    use chrono::Duration;

    fn key(user: &str) -> LedgerKey {
        LedgerKey::new("10010000000000001", user, "10050000000000009", 1)
    }

    #[tokio::test]
    async fn test_upsert_inserts_then_ignores_duplicate() {
        let pool = memory_pool().await;
        let store = ActivityStore::new(pool.clone());
        let mut tx = pool.begin().await.unwrap();

        let first = store.upsert_available(&mut tx, &key("u1"), 10, true).await.unwrap();
        assert_eq!(first.applied_rank, 10);
        assert!(first.newly_available);

        let second = store.upsert_available(&mut tx, &key("u1"), 10, true).await.unwrap();
        assert_eq!(second.applied_rank, 0);
        assert!(!second.newly_available);

        let row = store.find_existing(&mut tx, &key("u1")).await.unwrap().unwrap();
        assert_eq!(row.rank, 10);
        assert!(row.is_available());
        assert!(row.id.starts_with("1006"));
        tx.commit().await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM activity")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_cancel_and_revive_reuses_row() {
        let pool = memory_pool().await;
        let store = ActivityStore::new(pool.clone());
        let mut tx = pool.begin().await.unwrap();

        store.upsert_available(&mut tx, &key("u1"), 10, true).await.unwrap();
        let row = store.find_existing(&mut tx, &key("u1")).await.unwrap().unwrap();

        let cancelled = store.cancel(&mut tx, &row).await.unwrap();
        assert_eq!(cancelled.rolled_back_rank, 10);
        assert!(cancelled.was_available);

        let after = store.find_by_id(&mut tx, &row.id).await.unwrap().unwrap();
        assert!(after.cancelled);
        assert!(after.cancelled_at.is_some());

        let revived = store.upsert_available(&mut tx, &key("u1"), 4, true).await.unwrap();
        assert_eq!(revived.applied_rank, 4);
        assert!(revived.newly_available);

        let again = store.find_existing(&mut tx, &key("u1")).await.unwrap().unwrap();
        assert_eq!(again.id, row.id);
        assert_eq!(again.rank, 4);
        assert!(again.cancelled_at.is_none());
    }

    #[tokio::test]
    async fn test_double_cancel_rolls_back_once() {
        let pool = memory_pool().await;
        let store = ActivityStore::new(pool.clone());
        let mut tx = pool.begin().await.unwrap();

        store.upsert_available(&mut tx, &key("u1"), 10, true).await.unwrap();
        let row = store.find_existing(&mut tx, &key("u1")).await.unwrap().unwrap();

        assert_eq!(store.cancel(&mut tx, &row).await.unwrap().rolled_back_rank, 10);

        let second = store.cancel(&mut tx, &row).await.unwrap();
        assert_eq!(second.rolled_back_rank, 0);
        assert!(!second.was_available);

        let stored = store.find_by_id(&mut tx, &row.id).await.unwrap().unwrap();
        assert_eq!(stored.rank, 0);
    }

    #[tokio::test]
    async fn test_cancel_missing_row_is_inconsistency() {
        let pool = memory_pool().await;
        let store = ActivityStore::new(pool.clone());
        let mut tx = pool.begin().await.unwrap();

        store.upsert_available(&mut tx, &key("u1"), 10, true).await.unwrap();
        let mut row = store.find_existing(&mut tx, &key("u1")).await.unwrap().unwrap();
        row.id = "10069999999999999".to_string();

        let result = store.cancel(&mut tx, &row).await;
        assert!(matches!(result, Err(LedgerError::DataInconsistency(_))));
    }

    #[tokio::test]
    async fn test_history_and_leaderboard() {
        let pool = memory_pool().await;
        let store = ActivityStore::new(pool.clone());
        let mut tx = pool.begin().await.unwrap();

        store.upsert_available(&mut tx, &key("u1"), 10, true).await.unwrap();
        store
            .upsert_available(&mut tx, &LedgerKey::new("10020000000000001", "u1", "u3", 5), 10, true)
            .await
            .unwrap();
        store.upsert_available(&mut tx, &key("u2"), 15, true).await.unwrap();
        let u2_row = store.find_existing(&mut tx, &key("u2")).await.unwrap().unwrap();
        store.cancel(&mut tx, &u2_row).await.unwrap();
        store
            .upsert_available(&mut tx, &LedgerKey::new("10020000000000001", "u2", "u3", 5), 5, true)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let history = store.list_user_activities("u2", false, 10, 0).await.unwrap();
        assert_eq!(history.len(), 1);
        let full_history = store.list_user_activities("u2", true, 10, 0).await.unwrap();
        assert_eq!(full_history.len(), 2);

        let top = store
            .top_rank_earners(Utc::now() - Duration::days(7), 10)
            .await
            .unwrap();
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].user_id, "u1");
        assert_eq!(top[0].earned, 20);
        assert_eq!(top[1].earned, 5);
    }
}
