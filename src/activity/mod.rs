/// Reputation ledger entries
///
/// An activity records one rank relevant action of a user against an object,
/// possibly triggered by another user. Each (object, user, trigger user, kind)
/// tuple owns at most one row, reused across grant and cancel cycles.

mod store;

pub use store::{ActivityStore, CancelOutcome, UpsertOutcome};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Ledger entry as stored in the `activity` table
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Activity {
    pub id: String,
    pub object_id: String,
    /// Object identity before any public ID remapping
    pub original_object_id: String,
    /// User whose rank is affected
    pub user_id: String,
    /// User who caused the activity, may equal `user_id`
    pub trigger_user_id: String,
    pub activity_type: i64,
    /// Delta actually applied to the user when the row was last made available
    pub rank: i64,
    /// Whether this kind of activity can carry rank at all
    pub has_rank: bool,
    pub cancelled: bool,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Activity {
    /// An available entry's rank is currently reflected in the user's score
    pub fn is_available(&self) -> bool {
        !self.cancelled
    }
}

/// Identity of a logical ledger entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LedgerKey {
    pub object_id: String,
    pub original_object_id: String,
    pub user_id: String,
    pub trigger_user_id: String,
    pub activity_type: i64,
}

impl LedgerKey {
    pub fn new(
        object_id: impl Into<String>,
        user_id: impl Into<String>,
        trigger_user_id: impl Into<String>,
        activity_type: i64,
    ) -> Self {
        let object_id = object_id.into();
        Self {
            original_object_id: object_id.clone(),
            object_id,
            user_id: user_id.into(),
            trigger_user_id: trigger_user_id.into(),
            activity_type,
        }
    }

    pub fn with_original_object(mut self, original_object_id: impl Into<String>) -> Self {
        self.original_object_id = original_object_id.into();
        self
    }
}

impl std::fmt::Display for LedgerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "object={} user={} trigger={} type={}",
            self.object_id, self.user_id, self.trigger_user_id, self.activity_type
        )
    }
}

/// An activity kind resolved from a `{objectType}.{action}` configuration key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityKind {
    /// Configuration entry ID, stored as `activity.activity_type`
    pub id: i64,
    pub key: String,
    pub default_rank: i64,
    pub has_rank: bool,
}

/// Leaderboard row
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct RankEarner {
    pub user_id: String,
    pub earned: i64,
}
