/// Follow and unfollow
///
/// Follows carry no rank. They go through the ledger so a repeated follow or
/// unfollow leaves the follow counter untouched.
use crate::{
    activity::LedgerKey,
    db::lock_users,
    error::{LedgerError, LedgerResult},
    notification::Notification,
    object_id::{Counter, ObjectKind},
    orchestrator::{LedgerServices, OperationTimer, PlannedActivity},
};
use tracing::{debug, info};

/// A resolved follow target
struct FollowTarget {
    key: LedgerKey,
    plan: PlannedActivity,
    counter: Counter,
    owner_id: Option<String>,
    /// Activity key, e.g. `question.follow`
    action: String,
}

#[derive(Clone)]
pub struct FollowProcessor {
    services: LedgerServices,
}

impl FollowProcessor {
    pub fn new(services: LedgerServices) -> Self {
        Self { services }
    }

    /// Follow an object. Returns false if the user already follows it.
    pub async fn follow(&self, user_id: &str, object_id: &str) -> LedgerResult<bool> {
        let timer = OperationTimer::start("follow");
        let result = self.follow_inner(user_id, object_id).await;
        timer.finish(&result, |followed| *followed);
        result
    }

    /// Stop following an object. Returns false if the user did not follow it.
    pub async fn unfollow(&self, user_id: &str, object_id: &str) -> LedgerResult<bool> {
        let timer = OperationTimer::start("unfollow");
        let result = self.unfollow_inner(user_id, object_id).await;
        timer.finish(&result, |unfollowed| *unfollowed);
        result
    }

    async fn follow_inner(&self, user_id: &str, object_id: &str) -> LedgerResult<bool> {
        let target = self.resolve(user_id, object_id).await?;

        if self.services.all_available(&[&target.key]).await? {
            debug!(user_id, object_id, "Already following");
            return Ok(false);
        }

        let mut tx = self.services.db.begin().await?;
        let mut ranks = lock_users(&mut tx, [user_id]).await?;

        let result = self
            .services
            .grant_batch(&mut tx, std::slice::from_ref(&target.plan), &mut ranks)
            .await?;
        let followed = result.flipped(&target.key);
        if followed {
            target.counter.adjust(&mut tx, object_id, 1).await?;
        }

        tx.commit().await?;

        info!(user_id, object_id, followed, "Follow recorded");

        let mut inbox = Vec::new();
        if followed {
            if let Some(owner_id) = target.owner_id.as_deref().filter(|owner| *owner != user_id) {
                inbox.push(Notification::inbox(owner_id, user_id, object_id, &target.action));
            }
        }
        self.services.after_commit(&[], inbox).await;

        Ok(followed)
    }

    async fn unfollow_inner(&self, user_id: &str, object_id: &str) -> LedgerResult<bool> {
        let target = self.resolve(user_id, object_id).await?;

        if !self.services.any_available(&[&target.key]).await? {
            debug!(user_id, object_id, "Not following");
            return Ok(false);
        }

        let mut tx = self.services.db.begin().await?;
        let mut ranks = lock_users(&mut tx, [user_id]).await?;

        let result = self
            .services
            .cancel_batch(&mut tx, &[&target.key], &mut ranks, false)
            .await?;
        let unfollowed = result.flipped(&target.key);
        if unfollowed {
            target.counter.adjust(&mut tx, object_id, -1).await?;
        }

        tx.commit().await?;

        info!(user_id, object_id, unfollowed, "Unfollow recorded");

        Ok(unfollowed)
    }

    async fn resolve(&self, user_id: &str, object_id: &str) -> LedgerResult<FollowTarget> {
        let kind = ObjectKind::from_object_id(object_id)?;
        let counter = kind.follow_counter().ok_or_else(|| {
            LedgerError::Validation(format!("Objects of type {} cannot be followed", kind))
        })?;

        if kind == ObjectKind::User && object_id == user_id {
            return Err(LedgerError::Validation("Users cannot follow themselves".to_string()));
        }

        let owner_id = {
            let mut conn = self.services.db.acquire().await?;
            kind.fetch_owner(&mut conn, object_id).await?
        };

        let activity = self
            .services
            .config
            .activity_kind(&kind.activity_key("follow"))
            .await?;
        let key = LedgerKey::new(object_id, user_id, user_id, activity.id);
        let plan = PlannedActivity::new(key.clone(), &activity).without_rank();

        Ok(FollowTarget {
            key,
            plan,
            counter,
            owner_id,
            action: activity.key,
        })
    }
}
