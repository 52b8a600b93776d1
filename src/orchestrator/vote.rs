/// Vote orchestration
///
/// A vote touches two ledger entries: the object owner's rank entry and the
/// voter's own record. Both are granted or cancelled together, in one transaction.

use crate::{
    activity::{ActivityKind, LedgerKey},
    db::lock_users,
    error::{LedgerError, LedgerResult},
    notification::Notification,
    object_id::ObjectKind,
    orchestrator::{
        BatchResult, LedgerOutcome, LedgerServices, OperationTimer, PlannedActivity, VoteOutcome,
    },
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteDirection {
    Up,
    Down,
}

impl VoteDirection {
    pub fn opposite(self) -> Self {
        match self {
            VoteDirection::Up => VoteDirection::Down,
            VoteDirection::Down => VoteDirection::Up,
        }
    }

    /// Action recorded against the object owner
    fn owner_action(self) -> &'static str {
        match self {
            VoteDirection::Up => "vote_up",
            VoteDirection::Down => "vote_down",
        }
    }

    /// Action recorded against the voter
    fn voter_action(self) -> &'static str {
        match self {
            VoteDirection::Up => "voted_up",
            VoteDirection::Down => "voted_down",
        }
    }

    /// Change to the object's vote count when a vote in this direction is applied
    fn vote_count_delta(self) -> i64 {
        match self {
            VoteDirection::Up => 1,
            VoteDirection::Down => -1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub object_id: String,
    pub voter_id: String,
    pub direction: VoteDirection,
}

impl VoteRequest {
    pub fn new(object_id: impl Into<String>, voter_id: impl Into<String>, direction: VoteDirection) -> Self {
        Self {
            object_id: object_id.into(),
            voter_id: voter_id.into(),
            direction,
        }
    }
}

/// Ledger keys of one vote direction, resolved before any transaction
struct VoteKeys {
    owner_kind: ActivityKind,
    owner: LedgerKey,
    voter_kind: ActivityKind,
    voter: LedgerKey,
}

impl VoteKeys {
    fn all(&self) -> [&LedgerKey; 2] {
        [&self.owner, &self.voter]
    }
}

/// Resolved target of a vote
struct VoteTarget {
    kind: ObjectKind,
    owner_id: String,
}

#[derive(Clone)]
pub struct VoteOrchestrator {
    services: LedgerServices,
}

impl VoteOrchestrator {
    pub fn new(services: LedgerServices) -> Self {
        Self { services }
    }

    /// Record a vote. Voting again in the same direction is a no-op; voting
    /// in the other direction replaces the earlier vote.
    pub async fn vote(&self, request: &VoteRequest) -> LedgerResult<VoteOutcome> {
        let timer = OperationTimer::start("vote");
        let result = self.vote_inner(request).await;
        timer.finish(&result, |outcome| outcome.applied);
        result
    }

    /// Withdraw a vote. Withdrawing a vote that is not in place is a no-op.
    pub async fn cancel_vote(&self, request: &VoteRequest) -> LedgerResult<VoteOutcome> {
        let timer = OperationTimer::start("vote_cancel");
        let result = self.cancel_vote_inner(request).await;
        timer.finish(&result, |outcome| outcome.applied);
        result
    }

    async fn vote_inner(&self, request: &VoteRequest) -> LedgerResult<VoteOutcome> {
        let target = self.resolve_target(request).await?;
        let keys = self.resolve_keys(request, &target, request.direction).await?;

        if self.services.all_available(&keys.all()).await? {
            debug!(object_id = %request.object_id, voter_id = %request.voter_id,
                   direction = ?request.direction, "Vote already recorded");
            return Ok(LedgerOutcome::noop());
        }

        let opposite = self
            .resolve_keys(request, &target, request.direction.opposite())
            .await?;

        let self_vote = request.voter_id == target.owner_id;
        let mut owner_plan = PlannedActivity::new(keys.owner.clone(), &keys.owner_kind);
        if self_vote {
            owner_plan = owner_plan.without_rank();
        }
        let plans = [
            owner_plan,
            PlannedActivity::new(keys.voter.clone(), &keys.voter_kind),
        ];

        let mut tx = self.services.db.begin().await?;
        let mut ranks = lock_users(
            &mut tx,
            [request.voter_id.as_str(), target.owner_id.as_str()],
        )
        .await?;

        let mut result = BatchResult::default();

        let withdrawn = self
            .services
            .cancel_batch(&mut tx, &opposite.all(), &mut ranks, false)
            .await?;
        if withdrawn.flipped(&opposite.owner) {
            adjust_vote_count(&mut tx, target.kind, &request.object_id, -request.direction.opposite().vote_count_delta())
                .await?;
        }
        result.extend(withdrawn);

        let granted = self.services.grant_batch(&mut tx, &plans, &mut ranks).await?;
        if granted.flipped(&keys.owner) {
            adjust_vote_count(&mut tx, target.kind, &request.object_id, request.direction.vote_count_delta())
                .await?;
        }
        result.extend(granted);

        tx.commit().await?;

        info!(object_id = %request.object_id, voter_id = %request.voter_id,
              direction = ?request.direction, changes = result.changes.len(), "Vote recorded");

        let mut inbox = Vec::new();
        if !self_vote {
            inbox.push(Notification::inbox(
                &target.owner_id,
                &request.voter_id,
                &request.object_id,
                &keys.owner_kind.key,
            ));
        }
        self.services.after_commit(&result.changes, inbox).await;

        Ok(LedgerOutcome::committed(result.changes))
    }

    async fn cancel_vote_inner(&self, request: &VoteRequest) -> LedgerResult<VoteOutcome> {
        let target = self.resolve_target(request).await?;
        let keys = self.resolve_keys(request, &target, request.direction).await?;

        if !self.services.any_available(&keys.all()).await? {
            debug!(object_id = %request.object_id, voter_id = %request.voter_id,
                   direction = ?request.direction, "No vote to cancel");
            return Ok(LedgerOutcome::noop());
        }

        let mut tx = self.services.db.begin().await?;
        let mut ranks = lock_users(
            &mut tx,
            [request.voter_id.as_str(), target.owner_id.as_str()],
        )
        .await?;

        let result = self
            .services
            .cancel_batch(&mut tx, &keys.all(), &mut ranks, true)
            .await?;
        if result.flipped(&keys.owner) {
            adjust_vote_count(&mut tx, target.kind, &request.object_id, -request.direction.vote_count_delta())
                .await?;
        }

        tx.commit().await?;

        info!(object_id = %request.object_id, voter_id = %request.voter_id,
              direction = ?request.direction, changes = result.changes.len(), "Vote cancelled");

        self.services.after_commit(&result.changes, Vec::new()).await;

        Ok(LedgerOutcome::committed(result.changes))
    }

    async fn resolve_target(&self, request: &VoteRequest) -> LedgerResult<VoteTarget> {
        let kind = ObjectKind::from_object_id(&request.object_id)?;
        if !kind.is_votable() {
            return Err(LedgerError::Validation(format!(
                "Objects of type {} cannot be voted on",
                kind
            )));
        }

        let mut conn = self.services.db.acquire().await?;
        let owner_id = kind
            .fetch_owner(&mut conn, &request.object_id)
            .await?
            .ok_or_else(|| {
                LedgerError::Validation(format!("Object {} has no owner", request.object_id))
            })?;

        Ok(VoteTarget { kind, owner_id })
    }

    async fn resolve_keys(
        &self,
        request: &VoteRequest,
        target: &VoteTarget,
        direction: VoteDirection,
    ) -> LedgerResult<VoteKeys> {
        let config = &self.services.config;
        let owner_kind = config
            .activity_kind(&target.kind.activity_key(direction.owner_action()))
            .await?;
        let voter_kind = config
            .activity_kind(&target.kind.activity_key(direction.voter_action()))
            .await?;

        Ok(VoteKeys {
            owner: LedgerKey::new(
                &request.object_id,
                &target.owner_id,
                &request.voter_id,
                owner_kind.id,
            ),
            voter: LedgerKey::new(
                &request.object_id,
                &request.voter_id,
                &request.voter_id,
                voter_kind.id,
            ),
            owner_kind,
            voter_kind,
        })
    }
}

async fn adjust_vote_count(
    conn: &mut sqlx::SqliteConnection,
    kind: ObjectKind,
    object_id: &str,
    delta: i64,
) -> LedgerResult<()> {
    match kind.vote_counter() {
        Some(counter) => counter.adjust(conn, object_id, delta).await,
        None => Ok(()),
    }
}
