/// Unified error types for the reputation ledger
use thiserror::Error;

/// Main error type for ledger operations
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Database errors (transaction, lock or timeout failures)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration errors
    #[error("Migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Validation errors, rejected before any transaction opens
    #[error("Validation error: {0}")]
    Validation(String),

    /// Not found errors (malformed object IDs, missing users or objects)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Missing or malformed site configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// An expected ledger row is missing or contradicts recorded history
    #[error("Ledger inconsistency: {0}")]
    DataInconsistency(String),

    /// State read before the transaction changed before its locks were taken
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Cache errors
    #[error("Cache error: {0}")]
    Cache(String),

    /// Notification delivery errors
    #[error("Notification error: {0}")]
    Notification(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl LedgerError {
    /// Stable short name of the error class, used as a metrics label
    pub fn class(&self) -> &'static str {
        match self {
            LedgerError::Database(_)
            | LedgerError::Migration(_)
            | LedgerError::Io(_)
            | LedgerError::Conflict(_) => "persistence",
            LedgerError::Validation(_) | LedgerError::NotFound(_) | LedgerError::Config(_) => {
                "validation"
            }
            LedgerError::DataInconsistency(_) => "inconsistency",
            LedgerError::Cache(_) | LedgerError::Notification(_) => "best_effort",
            LedgerError::Internal(_) => "internal",
        }
    }

    /// Whether the failure came from lock contention and the whole batch may be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            LedgerError::Database(sqlx::Error::PoolTimedOut) | LedgerError::Conflict(_) => true,
            LedgerError::Database(sqlx::Error::Database(db_err)) => {
                // SQLITE_BUSY (5) and SQLITE_LOCKED (6), including extended codes
                db_err
                    .code()
                    .and_then(|code| code.parse::<i32>().ok())
                    .map(|code| matches!(code & 0xff, 5 | 6))
                    .unwrap_or(false)
            }
            _ => false,
        }
    }
}

/// Result type alias for ledger operations
pub type LedgerResult<T> = Result<T, LedgerError>;
