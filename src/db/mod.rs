/// Database layer for the reputation ledger
///
/// Manages the SQLite connection pool and migrations, and provides the
/// per-user row locking every ledger transaction starts with.

use crate::error::{LedgerError, LedgerResult};
use sqlx::sqlite::{SqliteConnection, SqlitePool};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Database connection options
#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    pub max_connections: u32,
    pub enable_wal: bool,
    pub busy_timeout: Duration,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            max_connections: 10,
            enable_wal: true,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

/// Create a SQLite connection pool
pub async fn create_pool(path: &Path, options: DatabaseOptions) -> LedgerResult<SqlitePool> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(options.max_connections)
        .connect_with(
            sqlx::sqlite::SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
                .journal_mode(if options.enable_wal {
                    sqlx::sqlite::SqliteJournalMode::Wal
                } else {
                    sqlx::sqlite::SqliteJournalMode::Delete
                })
                .foreign_keys(true)
                .busy_timeout(options.busy_timeout),
        )
        .await?;

    Ok(pool)
}

/// Run migrations
/// Migrations are embedded at compile time from ./migrations directory
pub async fn run_migrations(pool: &SqlitePool) -> LedgerResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;

    Ok(())
}

/// Test database connection
pub async fn test_connection(pool: &SqlitePool) -> LedgerResult<()> {
    sqlx::query("SELECT 1").execute(pool).await?;

    Ok(())
}

/// Lock the rows of every user in `user_ids` and return their current ranks.
///
/// Rows are locked in ascending user ID order, so two transactions over
/// overlapping user sets always acquire their locks in the same order. Each
/// row is touched with a no-op update, which takes the row lock on stores with
/// row-level locking and the database write lock on SQLite; the rank returned
/// is read under that lock.
pub async fn lock_users<'a, I>(
    conn: &mut SqliteConnection,
    user_ids: I,
) -> LedgerResult<BTreeMap<String, i64>>
where
    I: IntoIterator<Item = &'a str>,
{
    let ordered: std::collections::BTreeSet<&str> = user_ids.into_iter().collect();
    let mut ranks = BTreeMap::new();

    for user_id in ordered {
        let rank: Option<i64> =
            sqlx::query_scalar("UPDATE users SET rank = rank WHERE id = ?1 RETURNING rank")
                .bind(user_id)
                .fetch_optional(&mut *conn)
                .await?;

        let rank = rank.ok_or_else(|| LedgerError::NotFound(format!("User {} not found", user_id)))?;
        ranks.insert(user_id.to_string(), rank);
    }

    Ok(ranks)
}

/// Fixtures shared by the unit tests of every module
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use chrono::Utc;
    use sqlx::sqlite::SqlitePoolOptions;

    /// In-memory database with the full schema. A single connection is kept
    /// alive for the life of the pool so every query sees the same database.
    pub async fn memory_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        run_migrations(&pool).await.unwrap();
        pool
    }

    pub async fn insert_user(pool: &SqlitePool, id: &str, rank: i64) {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO users (id, username, rank, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(id)
        .bind(format!("user-{}", id))
        .bind(rank)
        .bind(now)
        .bind(now)
        .execute(pool)
        .await
        .unwrap();
    }

    pub async fn insert_question(pool: &SqlitePool, id: &str, user_id: &str) {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO question (id, user_id, title, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(id)
        .bind(user_id)
        .bind("How do I lock rows in order?")
        .bind(now)
        .bind(now)
        .execute(pool)
        .await
        .unwrap();
    }

    pub async fn insert_answer(pool: &SqlitePool, id: &str, question_id: &str, user_id: &str) {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO answer (id, question_id, user_id, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(id)
        .bind(question_id)
        .bind(user_id)
        .bind(now)
        .bind(now)
        .execute(pool)
        .await
        .unwrap();
    }

    pub async fn insert_tag(pool: &SqlitePool, id: &str, slug: &str) {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO tag (id, slug_name, created_at, updated_at) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(id)
        .bind(slug)
        .bind(now)
        .bind(now)
        .execute(pool)
        .await
        .unwrap();
    }

    pub async fn user_rank(pool: &SqlitePool, id: &str) -> i64 {
        sqlx::query_scalar("SELECT rank FROM users WHERE id = ?1")
            .bind(id)
            .fetch_one(pool)
            .await
            .unwrap()
    }
}
