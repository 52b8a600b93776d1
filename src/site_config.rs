/// Site configuration store
///
/// Activity kinds, their default ranks, the daily rank limit and its exclusion
/// list all live in the `config` table. The whole table is loaded into memory
/// once so lookups never need a database connection, which matters for callers
/// already holding a transaction.

use crate::{
    activity::ActivityKind,
    error::{LedgerError, LedgerResult},
};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Key of the daily rank limit entry
pub const DAILY_RANK_LIMIT_KEY: &str = "daily_rank_limit";

/// Key of the JSON list of activity keys the daily limit never applies to
pub const DAILY_RANK_LIMIT_EXCLUDE_KEY: &str = "daily_rank_limit.exclude";

/// A configuration entry
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub id: i64,
    pub key: String,
    pub value: String,
}

/// In-process view of the `config` table
#[derive(Clone)]
pub struct SiteConfig {
    db: SqlitePool,
    entries: Arc<RwLock<HashMap<String, ConfigEntry>>>,
}

impl SiteConfig {
    /// Load every configuration entry
    pub async fn load(db: SqlitePool) -> LedgerResult<Self> {
        let config = Self {
            db,
            entries: Arc::new(RwLock::new(HashMap::new())),
        };
        config.reload().await?;
        Ok(config)
    }

    /// Re-read the table, replacing the in-memory view
    pub async fn reload(&self) -> LedgerResult<usize> {
        let rows = sqlx::query_as::<_, ConfigEntry>("SELECT id, key, value FROM config")
            .fetch_all(&self.db)
            .await?;

        let count = rows.len();
        let mut entries = self.entries.write().await;
        *entries = rows.into_iter().map(|e| (e.key.clone(), e)).collect();

        info!(entries = count, "Loaded site configuration");
        Ok(count)
    }

    /// Insert or replace an entry, keeping its ID stable
    pub async fn set(&self, key: &str, value: &str) -> LedgerResult<ConfigEntry> {
        let entry = sqlx::query_as::<_, ConfigEntry>(
            "INSERT INTO config (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value
             RETURNING id, key, value",
        )
        .bind(key)
        .bind(value)
        .fetch_one(&self.db)
        .await?;

        self.entries
            .write()
            .await
            .insert(entry.key.clone(), entry.clone());

        debug!(key, value, "Updated site configuration");
        Ok(entry)
    }

    pub async fn find(&self, key: &str) -> Option<ConfigEntry> {
        self.entries.read().await.get(key).cloned()
    }

    /// Get an entry; a missing key is a configuration error
    pub async fn get(&self, key: &str) -> LedgerResult<ConfigEntry> {
        self.find(key)
            .await
            .ok_or_else(|| LedgerError::Config(format!("Missing configuration key {}", key)))
    }

    pub async fn get_int(&self, key: &str) -> LedgerResult<i64> {
        let entry = self.get(key).await?;
        parse_int(&entry)
    }

    /// Parse a JSON array of strings
    pub async fn get_string_list(&self, key: &str) -> LedgerResult<Vec<String>> {
        let entry = self.get(key).await?;
        serde_json::from_str(&entry.value).map_err(|e| {
            LedgerError::Config(format!("Configuration key {} is not a string list: {}", key, e))
        })
    }

    /// Resolve a `{objectType}.{action}` key into an activity kind
    pub async fn activity_kind(&self, key: &str) -> LedgerResult<ActivityKind> {
        let entry = self.get(key).await?;
        let default_rank = parse_int(&entry)?;

        Ok(ActivityKind {
            id: entry.id,
            key: entry.key,
            default_rank,
            has_rank: default_rank != 0,
        })
    }

    /// Daily rank limit; `None` when not configured or non-positive (unlimited)
    pub async fn daily_rank_limit(&self) -> LedgerResult<Option<i64>> {
        match self.find(DAILY_RANK_LIMIT_KEY).await {
            None => Ok(None),
            Some(entry) if entry.value.trim().is_empty() => Ok(None),
            Some(entry) => {
                let limit = parse_int(&entry)?;
                Ok(if limit > 0 { Some(limit) } else { None })
            }
        }
    }

    /// Activity kind IDs excluded from the daily rank limit
    pub async fn daily_cap_exclusions(&self) -> LedgerResult<HashSet<i64>> {
        if self.find(DAILY_RANK_LIMIT_EXCLUDE_KEY).await.is_none() {
            return Ok(HashSet::new());
        }

        let keys = self.get_string_list(DAILY_RANK_LIMIT_EXCLUDE_KEY).await?;
        let mut ids = HashSet::with_capacity(keys.len());
        for key in keys {
            ids.insert(self.get(&key).await?.id);
        }

        Ok(ids)
    }
}

fn parse_int(entry: &ConfigEntry) -> LedgerResult<i64> {
    entry.value.trim().parse().map_err(|_| {
        LedgerError::Config(format!(
            "Configuration key {} is not an integer: {}",
            entry.key, entry.value
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::memory_pool;

    #[tokio::test]
    async fn test_activity_kind_from_seeded_config() {
        let config = SiteConfig::load(memory_pool().await).await.unwrap();

        let kind = config.activity_kind("answer.vote_up").await.unwrap();
        assert_eq!(kind.default_rank, 10);
        assert!(kind.has_rank);

        let record = config.activity_kind("answer.voted_up").await.unwrap();
        assert_eq!(record.default_rank, 0);
        assert!(!record.has_rank);
        assert_ne!(kind.id, record.id);
    }

    #[tokio::test]
    async fn test_missing_key_is_config_error() {
        let config = SiteConfig::load(memory_pool().await).await.unwrap();

        let result = config.activity_kind("question.teleport").await;
        assert!(matches!(result, Err(LedgerError::Config(_))));
    }

    #[tokio::test]
    async fn test_daily_limit_and_exclusions() {
        let config = SiteConfig::load(memory_pool().await).await.unwrap();

        assert_eq!(config.daily_rank_limit().await.unwrap(), Some(200));

        let exclusions = config.daily_cap_exclusions().await.unwrap();
        let accepted = config.get("answer.accepted").await.unwrap();
        let activated = config.get("user.activated").await.unwrap();
        assert_eq!(exclusions.len(), 2);
        assert!(exclusions.contains(&accepted.id));
        assert!(exclusions.contains(&activated.id));

        config.set(DAILY_RANK_LIMIT_KEY, "0").await.unwrap();
        assert_eq!(config.daily_rank_limit().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_keeps_id_and_survives_reload() {
        let config = SiteConfig::load(memory_pool().await).await.unwrap();
        let before = config.get("question.vote_up").await.unwrap();

        let updated = config.set("question.vote_up", "7").await.unwrap();
        assert_eq!(updated.id, before.id);

        config.reload().await.unwrap();
        assert_eq!(config.get_int("question.vote_up").await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_malformed_values() {
        let config = SiteConfig::load(memory_pool().await).await.unwrap();
        config.set(DAILY_RANK_LIMIT_EXCLUDE_KEY, "not json").await.unwrap();
        config.set("answer.vote_up", "ten").await.unwrap();

        assert!(matches!(
            config.daily_cap_exclusions().await,
            Err(LedgerError::Config(_))
        ));
        assert!(matches!(
            config.activity_kind("answer.vote_up").await,
            Err(LedgerError::Config(_))
        ));
    }
}
