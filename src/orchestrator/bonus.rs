/// One-shot bonuses, granted at most once per user
use crate::{
    activity::LedgerKey,
    db::lock_users,
    error::LedgerResult,
    orchestrator::{LedgerServices, OperationTimer, RankChange},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

const USER_ACTIVATED_KEY: &str = "user.activated";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BonusOutcome {
    /// The bonus entry was recorded; `rank` is what was actually added
    Granted { rank: i64 },
    AlreadyGranted,
}

#[derive(Clone)]
pub struct BonusProcessor {
    services: LedgerServices,
}

impl BonusProcessor {
    pub fn new(services: LedgerServices) -> Self {
        Self { services }
    }

    /// Grant the account activation bonus
    pub async fn activate_user(&self, user_id: &str) -> LedgerResult<BonusOutcome> {
        let timer = OperationTimer::start("bonus");
        let result = self.grant_once(user_id, USER_ACTIVATED_KEY).await;
        timer.finish(&result, |outcome| matches!(outcome, BonusOutcome::Granted { .. }));
        result
    }

    /// Grant the bonus configured under `activity_key` unless the user ever had it.
    ///
    /// The entry is keyed on the user as both object and trigger, so a cancelled
    /// entry still counts as granted.
    async fn grant_once(&self, user_id: &str, activity_key: &str) -> LedgerResult<BonusOutcome> {
        let kind = self.services.config.activity_kind(activity_key).await?;
        let key = LedgerKey::new(user_id, user_id, user_id, kind.id);

        let mut tx = self.services.db.begin().await?;
        lock_users(&mut tx, [user_id]).await?;

        if self.services.activities.find_existing(&mut tx, &key).await?.is_some() {
            debug!(user_id, activity_key, "Bonus already granted");
            return Ok(BonusOutcome::AlreadyGranted);
        }

        let triggered = self
            .services
            .rank
            .trigger(&mut tx, user_id, kind.default_rank, kind.id)
            .await?;
        self.services
            .activities
            .upsert_available(&mut tx, &key, triggered.applied, kind.has_rank)
            .await?;

        tx.commit().await?;

        info!(user_id, activity_key, rank = triggered.applied, clipped = triggered.clipped_to_zero, "Bonus granted");

        let mut changes = Vec::new();
        if triggered.applied != 0 {
            changes.push(RankChange {
                user_id: user_id.to_string(),
                object_id: user_id.to_string(),
                activity_type: kind.id,
                delta: triggered.applied,
            });
        }
        self.services.after_commit(&changes, Vec::new()).await;

        Ok(BonusOutcome::Granted {
            rank: triggered.applied,
        })
    }
}
