/// Configuration management for the reputation ledger
use crate::error::{LedgerError, LedgerResult};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

/// Main ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    pub storage: StorageConfig,
    pub rank: RankConfig,
    pub cache: CacheConfig,
    pub notifications: NotificationConfig,
    pub logging: LoggingConfig,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub database_path: PathBuf,
    pub max_connections: u32,
    /// How long a transaction waits on a locked database before failing
    pub busy_timeout_secs: u64,
}

/// Rank mutation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankConfig {
    /// Initial state of the external rank authority flag. When set, an external
    /// identity system owns reputation and local mutation is disabled.
    pub external_authority: bool,
}

/// Advisory user info cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Enable caching (default: false)
    pub enabled: bool,

    /// Redis connection URL (e.g., "redis://localhost:6379")
    pub redis_url: String,

    /// Key prefix for all cache entries
    pub key_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            redis_url: "redis://localhost:6379".to_string(),
            key_prefix: "qa:".to_string(),
        }
    }
}

/// Notification queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    pub queue_capacity: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl LedgerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> LedgerResult<Self> {
        dotenv::dotenv().ok();

        let database_path: PathBuf = env::var("QA_DATABASE_PATH")
            .unwrap_or_else(|_| "./data/ledger.sqlite".to_string())
            .into();
        let max_connections = env::var("QA_DB_MAX_CONNECTIONS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .map_err(|_| LedgerError::Validation("Invalid QA_DB_MAX_CONNECTIONS".to_string()))?;
        let busy_timeout_secs = env::var("QA_DB_BUSY_TIMEOUT")
            .unwrap_or_else(|_| "5".to_string())
            .parse()
            .unwrap_or(5);

        let external_authority = env::var("QA_EXTERNAL_RANK_AUTHORITY")
            .unwrap_or_else(|_| "false".to_string())
            .parse()
            .unwrap_or(false);

        let cache = CacheConfig {
            enabled: env::var("CACHE_ENABLED")
                .unwrap_or_else(|_| "false".to_string())
                .parse()
                .unwrap_or(false),
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            key_prefix: env::var("CACHE_KEY_PREFIX").unwrap_or_else(|_| "qa:".to_string()),
        };

        let queue_capacity = env::var("QA_NOTIFICATION_QUEUE_CAPACITY")
            .unwrap_or_else(|_| "1024".to_string())
            .parse()
            .unwrap_or(1024);

        let level = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
        let json = env::var("QA_LOG_JSON")
            .unwrap_or_else(|_| "false".to_string())
            .parse()
            .unwrap_or(false);

        Ok(LedgerConfig {
            storage: StorageConfig {
                database_path,
                max_connections,
                busy_timeout_secs,
            },
            rank: RankConfig { external_authority },
            cache,
            notifications: NotificationConfig { queue_capacity },
            logging: LoggingConfig { level, json },
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> LedgerResult<()> {
        if self.storage.max_connections == 0 {
            return Err(LedgerError::Validation(
                "At least one database connection is required".to_string(),
            ));
        }

        if self.notifications.queue_capacity == 0 {
            return Err(LedgerError::Validation(
                "Notification queue capacity must be positive".to_string(),
            ));
        }

        if self.cache.enabled && self.cache.redis_url.is_empty() {
            return Err(LedgerError::Validation(
                "REDIS_URL is required when the cache is enabled".to_string(),
            ));
        }

        Ok(())
    }
}
