/// Redis-based user info cache
///
/// Read paths elsewhere cache user info (including rank). The ledger never
/// reads it; it only evicts entries for users whose rank changed, after commit.

use crate::config::CacheConfig;
use crate::error::{LedgerError, LedgerResult};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tracing::{debug, error, info, warn};

/// Cache category constants
pub mod categories {
    pub const USER_INFO: &str = "user_info:";
}

/// Redis cache client
#[derive(Clone)]
pub struct CacheClient {
    connection: ConnectionManager,
    config: CacheConfig,
}

impl CacheClient {
    /// Create a new cache client
    pub async fn new(config: CacheConfig) -> LedgerResult<Self> {
        if !config.enabled {
            return Err(LedgerError::Cache(
                "Cache is disabled, cannot create client".to_string(),
            ));
        }

        info!("Connecting to Redis at {}", config.redis_url);

        let client = Client::open(config.redis_url.as_str()).map_err(|e| {
            error!("Failed to create Redis client: {}", e);
            LedgerError::Cache(format!("Redis client creation failed: {}", e))
        })?;

        let connection = ConnectionManager::new(client).await.map_err(|e| {
            error!("Failed to connect to Redis: {}", e);
            LedgerError::Cache(format!("Redis connection failed: {}", e))
        })?;

        info!("Redis connection established");

        Ok(Self { connection, config })
    }

    /// Build a cache key with prefix
    fn build_key(&self, category: &str, key: &str) -> String {
        build_key(&self.config.key_prefix, category, key)
    }

    /// Delete a value from cache
    pub async fn delete(&self, category: &str, key: &str) -> LedgerResult<()> {
        let cache_key = self.build_key(category, key);

        debug!("Cache DELETE: {}", cache_key);

        let mut conn = self.connection.clone();
        conn.del::<_, ()>(&cache_key).await.map_err(|e| {
            warn!("Redis DELETE failed for {}: {}", cache_key, e);
            LedgerError::Cache(format!("Cache delete failed: {}", e))
        })?;

        Ok(())
    }

    /// Evict cached user info for every user in `user_ids`. Failures are logged only.
    pub async fn invalidate_users<'a, I>(&self, user_ids: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        let evictions = user_ids
            .into_iter()
            .map(|user_id| self.delete(categories::USER_INFO, user_id));

        for result in futures::future::join_all(evictions).await {
            if let Err(e) = result {
                warn!("Failed to invalidate user info cache: {}", e);
            }
        }
    }
}

fn build_key(prefix: &str, category: &str, key: &str) -> String {
    format!("{}{}{}", prefix, category, key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_key() {
        let config = CacheConfig::default();
        let key = build_key(&config.key_prefix, categories::USER_INFO, "10050000000000001");
        assert_eq!(key, "qa:user_info:10050000000000001");
    }

    #[tokio::test]
    async fn test_disabled_cache_cannot_connect() {
        let result = CacheClient::new(CacheConfig::default()).await;
        assert!(matches!(result, Err(LedgerError::Cache(_))));
    }
}
