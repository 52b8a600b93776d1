//! Shared fixtures for the integration tests
#![allow(dead_code)]

use chrono::Utc;
use qa_rank_ledger::config::{
    CacheConfig, LedgerConfig, LoggingConfig, NotificationConfig, RankConfig, StorageConfig,
};
use qa_rank_ledger::object_id::{format_id, EntityKind};
use qa_rank_ledger::LedgerContext;
use sqlx::SqlitePool;
use tempfile::TempDir;

/// A ledger over a fresh file database. The directory lives as long as the fixture.
pub struct TestLedger {
    pub ctx: LedgerContext,
    _dir: TempDir,
}

impl TestLedger {
    pub async fn new(max_connections: u32) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = LedgerConfig {
            storage: StorageConfig {
                database_path: dir.path().join("ledger.sqlite"),
                max_connections,
                busy_timeout_secs: 30,
            },
            rank: RankConfig {
                external_authority: false,
            },
            cache: CacheConfig::default(),
            notifications: NotificationConfig {
                queue_capacity: 1024,
            },
            logging: LoggingConfig {
                level: "warn".to_string(),
                json: false,
            },
        };

        let ctx = LedgerContext::new(config).await.unwrap();
        Self { ctx, _dir: dir }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.ctx.db
    }

    pub async fn user(&self, id: &str, rank: i64) {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO users (id, username, rank, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(id)
        .bind(format!("user-{}", id))
        .bind(rank)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await
        .unwrap();
    }

    /// Insert a question owned by `user_id` and return its ID
    pub async fn question(&self, seq: i64, user_id: &str) -> String {
        let id = format_id(EntityKind::Question, seq);
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO question (id, user_id, title, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&id)
        .bind(user_id)
        .bind(format!("Question {}", seq))
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await
        .unwrap();
        id
    }

    /// Insert an answer to `question_id` owned by `user_id` and return its ID
    pub async fn answer(&self, seq: i64, question_id: &str, user_id: &str) -> String {
        let id = format_id(EntityKind::Answer, seq);
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO answer (id, question_id, user_id, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&id)
        .bind(question_id)
        .bind(user_id)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await
        .unwrap();
        id
    }

    pub async fn rank(&self, user_id: &str) -> i64 {
        sqlx::query_scalar("SELECT rank FROM users WHERE id = ?1")
            .bind(user_id)
            .fetch_one(self.pool())
            .await
            .unwrap()
    }

    pub async fn vote_count(&self, table: &str, id: &str) -> i64 {
        sqlx::query_scalar(&format!("SELECT vote_count FROM {} WHERE id = ?1", table))
            .bind(id)
            .fetch_one(self.pool())
            .await
            .unwrap()
    }

    pub async fn activity_count(&self, user_id: &str) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM activity WHERE user_id = ?1")
            .bind(user_id)
            .fetch_one(self.pool())
            .await
            .unwrap()
    }
}
