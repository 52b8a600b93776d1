/// Ledger context and dependency injection
use crate::{
    activity::ActivityStore,
    cache::CacheClient,
    config::{LedgerConfig, LoggingConfig},
    db,
    error::{LedgerError, LedgerResult},
    notification::{spawn_dispatcher, LogSink, NotificationQueue, NotificationSink},
    orchestrator::{
        AcceptAnswerOrchestrator, BonusProcessor, FollowProcessor, LedgerServices,
        VoteOrchestrator,
    },
    rank::{DailyCapTracker, RankMutator},
    site_config::SiteConfig,
};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Context holding every ledger service, constructed once at startup
#[derive(Clone)]
pub struct LedgerContext {
    pub config: Arc<LedgerConfig>,
    pub db: SqlitePool,
    pub site_config: Arc<SiteConfig>,
    pub activities: ActivityStore,
    pub rank: RankMutator,
    pub notifier: NotificationQueue,
    pub cache: Option<CacheClient>,
    pub votes: VoteOrchestrator,
    pub accepts: AcceptAnswerOrchestrator,
    pub bonuses: BonusProcessor,
    pub follows: FollowProcessor,
}

impl LedgerContext {
    /// Create a new ledger context from configuration, delivering notifications to the log
    pub async fn new(config: LedgerConfig) -> LedgerResult<Self> {
        Self::with_sink(config, Arc::new(LogSink)).await
    }

    /// Create a new ledger context delivering notifications to `sink`
    pub async fn with_sink(config: LedgerConfig, sink: Arc<dyn NotificationSink>) -> LedgerResult<Self> {
        config.validate()?;

        // Initialize database
        let options = db::DatabaseOptions {
            max_connections: config.storage.max_connections,
            enable_wal: true,
            busy_timeout: Duration::from_secs(config.storage.busy_timeout_secs),
        };
        let db = db::create_pool(&config.storage.database_path, options).await?;

        db::run_migrations(&db).await?;
        db::test_connection(&db).await?;

        let site_config = Arc::new(SiteConfig::load(db.clone()).await?);
        let activities = ActivityStore::new(db.clone());
        let rank = RankMutator::new(
            DailyCapTracker::new(site_config.clone()),
            config.rank.external_authority,
        );
        if config.rank.external_authority {
            info!("External rank authority enabled, local rank mutation disabled");
        }

        let (notifier, receiver) = NotificationQueue::new(config.notifications.queue_capacity);
        spawn_dispatcher(receiver, sink);

        // Cache is advisory, the ledger runs without it
        let cache = if config.cache.enabled {
            match CacheClient::new(config.cache.clone()).await {
                Ok(client) => Some(client),
                Err(e) => {
                    warn!("Continuing without user info cache: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let services = LedgerServices {
            db: db.clone(),
            config: site_config.clone(),
            activities: activities.clone(),
            rank: rank.clone(),
            notifier: notifier.clone(),
            cache: cache.clone(),
        };

        info!(database = ?config.storage.database_path, "Ledger context initialized");

        Ok(Self {
            config: Arc::new(config),
            db,
            site_config,
            activities,
            rank,
            notifier,
            cache,
            votes: VoteOrchestrator::new(services.clone()),
            accepts: AcceptAnswerOrchestrator::new(services.clone()),
            bonuses: BonusProcessor::new(services.clone()),
            follows: FollowProcessor::new(services),
        })
    }
}

/// Install the global tracing subscriber
pub fn init_tracing(config: &LoggingConfig) -> LedgerResult<()> {
    let filter = EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(config.json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!config.json).then(tracing_subscriber::fmt::layer))
        .try_init()
        .map_err(|e| LedgerError::Internal(format!("Failed to install tracing subscriber: {}", e)))
}
