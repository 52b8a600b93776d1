/// Accept-answer orchestration
use crate::{
    activity::{ActivityKind, LedgerKey},
    db::lock_users,
    error::{LedgerError, LedgerResult},
    notification::Notification,
    object_id::ObjectKind,
    orchestrator::{AcceptOutcome, LedgerOutcome, LedgerServices, OperationTimer, PlannedActivity},
};
use chrono::Utc;
use sqlx::sqlite::SqliteConnection;
use tracing::{debug, info};

const ANSWER_ACCEPTED_KEY: &str = "answer.accepted";
const QUESTION_ACCEPT_KEY: &str = "question.accept";

/// Question state read before the transaction
struct QuestionState {
    asker_id: String,
    accepted_answer_id: Option<String>,
}

/// Activity kinds involved in an acceptance
struct AcceptKinds {
    accepted: ActivityKind,
    accept: ActivityKind,
}

impl AcceptKinds {
    /// Rank entry of the answerer, triggered by the asker
    fn answerer_key(&self, answer_id: &str, answerer_id: &str, asker_id: &str) -> LedgerKey {
        LedgerKey::new(answer_id, answerer_id, asker_id, self.accepted.id)
    }

    /// The asker's own record of accepting an answer on their question
    fn asker_key(&self, question_id: &str, answer_id: &str, asker_id: &str) -> LedgerKey {
        LedgerKey::new(question_id, asker_id, asker_id, self.accept.id).with_original_object(answer_id)
    }
}

#[derive(Clone)]
pub struct AcceptAnswerOrchestrator {
    services: LedgerServices,
}

impl AcceptAnswerOrchestrator {
    pub fn new(services: LedgerServices) -> Self {
        Self { services }
    }

    /// Accept `answer_id` as the answer to `question_id`, replacing any
    /// previously accepted answer.
    pub async fn accept(&self, question_id: &str, answer_id: &str) -> LedgerResult<AcceptOutcome> {
        let timer = OperationTimer::start("accept");
        let result = self.accept_inner(question_id, answer_id).await;
        timer.finish(&result, |outcome| outcome.applied);
        result
    }

    /// Withdraw the accepted answer of `question_id`
    pub async fn unaccept(&self, question_id: &str) -> LedgerResult<AcceptOutcome> {
        let timer = OperationTimer::start("unaccept");
        let result = self.unaccept_inner(question_id).await;
        timer.finish(&result, |outcome| outcome.applied);
        result
    }

    async fn accept_inner(&self, question_id: &str, answer_id: &str) -> LedgerResult<AcceptOutcome> {
        expect_kind(question_id, ObjectKind::Question)?;
        expect_kind(answer_id, ObjectKind::Answer)?;

        let kinds = self.kinds().await?;

        let (question, answerer_id, previous) = {
            let mut conn = self.services.db.acquire().await?;
            let question = fetch_question(&mut conn, question_id).await?;
            let answerer_id = fetch_answer_owner(&mut conn, question_id, answer_id).await?;
            let previous = match question.accepted_answer_id.as_deref() {
                Some(previous_id) if previous_id != answer_id => {
                    let previous_owner = fetch_answer_owner(&mut conn, question_id, previous_id).await?;
                    Some((previous_id.to_string(), previous_owner))
                }
                _ => None,
            };
            (question, answerer_id, previous)
        };
        let asker_id = question.asker_id.as_str();

        let answerer_key = kinds.answerer_key(answer_id, &answerer_id, asker_id);
        let asker_key = kinds.asker_key(question_id, answer_id, asker_id);

        if question.accepted_answer_id.as_deref() == Some(answer_id)
            && self.services.all_available(&[&answerer_key, &asker_key]).await?
        {
            debug!(question_id, answer_id, "Answer already accepted");
            return Ok(LedgerOutcome::noop());
        }

        let self_accept = answerer_id == asker_id;
        let mut answerer_plan = PlannedActivity::new(answerer_key, &kinds.accepted);
        if self_accept {
            answerer_plan = answerer_plan.without_rank();
        }
        let plans = [
            answerer_plan,
            PlannedActivity::new(asker_key, &kinds.accept),
        ];

        let mut users = vec![asker_id, answerer_id.as_str()];
        if let Some((_, previous_owner)) = &previous {
            users.push(previous_owner.as_str());
        }

        let mut tx = self.services.db.begin().await?;
        let mut ranks = lock_users(&mut tx, users).await?;
        ensure_unchanged(&mut tx, question_id, question.accepted_answer_id.as_deref()).await?;

        let mut changes = Vec::new();

        if let Some((previous_id, previous_owner)) = &previous {
            let previous_key = kinds.answerer_key(previous_id, previous_owner, asker_id);
            let withdrawn = self
                .services
                .cancel_batch(&mut tx, &[&previous_key], &mut ranks, true)
                .await?;
            set_adopted(&mut tx, previous_id, false).await?;
            changes.extend(withdrawn.changes);
        }

        let granted = self.services.grant_batch(&mut tx, &plans, &mut ranks).await?;
        changes.extend(granted.changes);

        set_adopted(&mut tx, answer_id, true).await?;
        set_accepted_answer(&mut tx, question_id, Some(answer_id)).await?;

        tx.commit().await?;

        info!(question_id, answer_id, replaced = previous.is_some(), "Answer accepted");

        let mut inbox = Vec::new();
        if !self_accept {
            inbox.push(Notification::inbox(&answerer_id, asker_id, answer_id, ANSWER_ACCEPTED_KEY));
        }
        self.services.after_commit(&changes, inbox).await;

        Ok(LedgerOutcome::committed(changes))
    }

    async fn unaccept_inner(&self, question_id: &str) -> LedgerResult<AcceptOutcome> {
        expect_kind(question_id, ObjectKind::Question)?;

        let kinds = self.kinds().await?;

        let (question, answer_id, answerer_id) = {
            let mut conn = self.services.db.acquire().await?;
            let question = fetch_question(&mut conn, question_id).await?;
            let Some(answer_id) = question.accepted_answer_id.clone() else {
                debug!(question_id, "Question has no accepted answer");
                return Ok(LedgerOutcome::noop());
            };
            let answerer_id = fetch_answer_owner(&mut conn, question_id, &answer_id).await?;
            (question, answer_id, answerer_id)
        };
        let asker_id = question.asker_id.as_str();

        let answerer_key = kinds.answerer_key(&answer_id, &answerer_id, asker_id);
        let asker_key = kinds.asker_key(question_id, &answer_id, asker_id);
        let keys = [&answerer_key, &asker_key];

        // an accepted answer without its ledger rows fails inside cancel_batch
        let mut tx = self.services.db.begin().await?;
        let mut ranks = lock_users(&mut tx, [asker_id, answerer_id.as_str()]).await?;
        ensure_unchanged(&mut tx, question_id, Some(answer_id.as_str())).await?;

        let result = self
            .services
            .cancel_batch(&mut tx, &keys, &mut ranks, true)
            .await?;

        set_adopted(&mut tx, &answer_id, false).await?;
        set_accepted_answer(&mut tx, question_id, None).await?;

        tx.commit().await?;

        info!(question_id, answer_id = %answer_id, "Answer unaccepted");

        self.services.after_commit(&result.changes, Vec::new()).await;

        Ok(LedgerOutcome::committed(result.changes))
    }

    async fn kinds(&self) -> LedgerResult<AcceptKinds> {
        Ok(AcceptKinds {
            accepted: self.services.config.activity_kind(ANSWER_ACCEPTED_KEY).await?,
            accept: self.services.config.activity_kind(QUESTION_ACCEPT_KEY).await?,
        })
    }
}

fn expect_kind(object_id: &str, expected: ObjectKind) -> LedgerResult<()> {
    let kind = ObjectKind::from_object_id(object_id)?;
    if kind != expected {
        return Err(LedgerError::Validation(format!(
            "Expected a {} ID, got {} {}",
            expected, kind, object_id
        )));
    }
    Ok(())
}

async fn fetch_question(conn: &mut SqliteConnection, question_id: &str) -> LedgerResult<QuestionState> {
    let row: Option<(String, Option<String>)> =
        sqlx::query_as("SELECT user_id, accepted_answer_id FROM question WHERE id = ?1")
            .bind(question_id)
            .fetch_optional(&mut *conn)
            .await?;

    let (asker_id, accepted_answer_id) =
        row.ok_or_else(|| LedgerError::NotFound(format!("Question {} not found", question_id)))?;

    Ok(QuestionState {
        asker_id,
        accepted_answer_id,
    })
}

/// Owner of an answer, which must belong to `question_id`
async fn fetch_answer_owner(
    conn: &mut SqliteConnection,
    question_id: &str,
    answer_id: &str,
) -> LedgerResult<String> {
    let row: Option<(String, String)> =
        sqlx::query_as("SELECT user_id, question_id FROM answer WHERE id = ?1")
            .bind(answer_id)
            .fetch_optional(&mut *conn)
            .await?;

    let (user_id, parent_id) =
        row.ok_or_else(|| LedgerError::NotFound(format!("Answer {} not found", answer_id)))?;

    if parent_id != question_id {
        return Err(LedgerError::Validation(format!(
            "Answer {} does not belong to question {}",
            answer_id, question_id
        )));
    }

    Ok(user_id)
}

/// Fail if the accepted answer moved after the pre-transaction read
async fn ensure_unchanged(
    conn: &mut SqliteConnection,
    question_id: &str,
    expected: Option<&str>,
) -> LedgerResult<()> {
    let current: Option<String> =
        sqlx::query_scalar("SELECT accepted_answer_id FROM question WHERE id = ?1")
            .bind(question_id)
            .fetch_one(&mut *conn)
            .await?;

    if current.as_deref() != expected {
        return Err(LedgerError::Conflict(format!(
            "Accepted answer of question {} changed concurrently",
            question_id
        )));
    }
    Ok(())
}

async fn set_adopted(conn: &mut SqliteConnection, answer_id: &str, adopted: bool) -> LedgerResult<()> {
    sqlx::query("UPDATE answer SET adopted = ?1, updated_at = ?2 WHERE id = ?3")
        .bind(adopted)
        .bind(Utc::now())
        .bind(answer_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn set_accepted_answer(
    conn: &mut SqliteConnection,
    question_id: &str,
    answer_id: Option<&str>,
) -> LedgerResult<()> {
    sqlx::query("UPDATE question SET accepted_answer_id = ?1, updated_at = ?2 WHERE id = ?3")
        .bind(answer_id)
        .bind(Utc::now())
        .bind(question_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::*;
    use crate::notification::NotificationKind;
    use crate::object_id::{format_id, EntityKind};
    use crate::orchestrator::testing::*;

    fn question_id() -> String {
        format_id(EntityKind::Question, 1)
    }

    fn answer_id(seq: i64) -> String {
        format_id(EntityKind::Answer, seq)
    }

    async fn adopted(pool: &sqlx::SqlitePool, answer_id: &str) -> bool {
        sqlx::query_scalar("SELECT adopted FROM answer WHERE id = ?1")
            .bind(answer_id)
            .fetch_one(pool)
            .await
            .unwrap()
    }

    async fn accepted_answer(pool: &sqlx::SqlitePool) -> Option<String> {
        sqlx::query_scalar("SELECT accepted_answer_id FROM question WHERE id = ?1")
            .bind(question_id())
            .fetch_one(pool)
            .await
            .unwrap()
    }

    /// Asker "u1", answerers "u2" (answer 1) and "u3" (answer 2), all at rank 10
    async fn setup() -> (
        sqlx::SqlitePool,
        AcceptAnswerOrchestrator,
        tokio::sync::mpsc::Receiver<Notification>,
    ) {
        let pool = memory_pool().await;
        for user in ["u1", "u2", "u3"] {
            insert_user(&pool, user, 10).await;
        }
        insert_question(&pool, &question_id(), "u1").await;
        insert_answer(&pool, &answer_id(1), &question_id(), "u2").await;
        insert_answer(&pool, &answer_id(2), &question_id(), "u3").await;
        let (services, rx) = services(&pool).await;
        (pool, AcceptAnswerOrchestrator::new(services), rx)
    }

    #[tokio::test]
    async fn test_accept_grants_answerer_and_asker() {
        let (pool, accepts, mut rx) = setup().await;

        let outcome = accepts.accept(&question_id(), &answer_id(1)).await.unwrap();

        assert!(outcome.applied);
        assert_eq!(user_rank(&pool, "u2").await, 25);
        assert_eq!(user_rank(&pool, "u1").await, 12);
        assert!(adopted(&pool, &answer_id(1)).await);
        assert_eq!(accepted_answer(&pool).await, Some(answer_id(1)));

        let sent = drain(&mut rx);
        assert!(sent.iter().any(|n| matches!(
            &n.kind,
            NotificationKind::Inbox { receiver_user_id, trigger_user_id, .. }
                if receiver_user_id == "u2" && trigger_user_id == "u1"
        )));

        let again = accepts.accept(&question_id(), &answer_id(1)).await.unwrap();
        assert!(!again.applied);
        assert_eq!(user_rank(&pool, "u2").await, 25);
    }

    #[tokio::test]
    async fn test_switching_accepted_answer() {
        let (pool, accepts, _rx) = setup().await;

        accepts.accept(&question_id(), &answer_id(1)).await.unwrap();
        accepts.accept(&question_id(), &answer_id(2)).await.unwrap();

        assert_eq!(user_rank(&pool, "u2").await, 10);
        assert_eq!(user_rank(&pool, "u3").await, 25);
        // the asker's record is per question, granted once
        assert_eq!(user_rank(&pool, "u1").await, 12);
        assert!(!adopted(&pool, &answer_id(1)).await);
        assert!(adopted(&pool, &answer_id(2)).await);
        assert_eq!(accepted_answer(&pool).await, Some(answer_id(2)));

        // and it points at the answer accepted now
        let original: String = sqlx::query_scalar(
            "SELECT original_object_id FROM activity WHERE object_id = ?1 AND user_id = 'u1'",
        )
        .bind(question_id())
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(original, answer_id(2));
    }

    #[tokio::test]
    async fn test_unaccept_mirrors_accept() {
        let (pool, accepts, _rx) = setup().await;

        accepts.accept(&question_id(), &answer_id(1)).await.unwrap();
        let outcome = accepts.unaccept(&question_id()).await.unwrap();

        assert!(outcome.applied);
        assert_eq!(outcome.rank_changes.len(), 2);
        assert_eq!(user_rank(&pool, "u2").await, 10);
        assert_eq!(user_rank(&pool, "u1").await, 10);
        assert!(!adopted(&pool, &answer_id(1)).await);
        assert_eq!(accepted_answer(&pool).await, None);

        let again = accepts.unaccept(&question_id()).await.unwrap();
        assert!(!again.applied);
    }

    #[tokio::test]
    async fn test_self_accept_grants_no_answerer_rank() {
        let (pool, accepts, mut rx) = setup().await;
        insert_answer(&pool, &answer_id(3), &question_id(), "u1").await;

        accepts.accept(&question_id(), &answer_id(3)).await.unwrap();

        assert_eq!(user_rank(&pool, "u1").await, 12);
        assert!(!drain(&mut rx)
            .iter()
            .any(|n| matches!(n.kind, NotificationKind::Inbox { .. })));
    }

    #[tokio::test]
    async fn test_missing_previous_entry_is_inconsistency() {
        let (pool, accepts, _rx) = setup().await;
        sqlx::query("UPDATE question SET accepted_answer_id = ?1 WHERE id = ?2")
            .bind(answer_id(1))
            .bind(question_id())
            .execute(&pool)
            .await
            .unwrap();

        let result = accepts.accept(&question_id(), &answer_id(2)).await;

        assert!(matches!(result, Err(LedgerError::DataInconsistency(_))));
        assert_eq!(user_rank(&pool, "u3").await, 10);
        assert_eq!(accepted_answer(&pool).await, Some(answer_id(1)));
    }

    #[tokio::test]
    async fn test_unaccept_without_entries_is_inconsistency() {
        let (pool, accepts, mut rx) = setup().await;
        sqlx::query("UPDATE question SET accepted_answer_id = ?1 WHERE id = ?2")
            .bind(answer_id(1))
            .bind(question_id())
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("UPDATE answer SET adopted = 1 WHERE id = ?1")
            .bind(answer_id(1))
            .execute(&pool)
            .await
            .unwrap();

        let result = accepts.unaccept(&question_id()).await;

        assert!(matches!(result, Err(LedgerError::DataInconsistency(_))));
        assert_eq!(accepted_answer(&pool).await, Some(answer_id(1)));
        assert!(adopted(&pool, &answer_id(1)).await);
        assert_eq!(user_rank(&pool, "u2").await, 10);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_unaccept_reconciles_cancelled_entries() {
        let (pool, accepts, _rx) = setup().await;
        accepts.accept(&question_id(), &answer_id(1)).await.unwrap();
        sqlx::query("UPDATE activity SET cancelled = 1")
            .execute(&pool)
            .await
            .unwrap();

        let outcome = accepts.unaccept(&question_id()).await.unwrap();

        assert!(outcome.applied);
        assert!(outcome.rank_changes.is_empty());
        assert_eq!(user_rank(&pool, "u2").await, 25);
        assert_eq!(accepted_answer(&pool).await, None);
        assert!(!adopted(&pool, &answer_id(1)).await);
    }

    #[tokio::test]
    async fn test_accept_validates_ids() {
        let (pool, accepts, _rx) = setup().await;
        let other_question = format_id(EntityKind::Question, 2);
        insert_question(&pool, &other_question, "u3").await;

        let swapped = accepts.accept(&answer_id(1), &question_id()).await;
        assert!(matches!(swapped, Err(LedgerError::Validation(_))));

        let foreign = accepts.accept(&other_question, &answer_id(1)).await;
        assert!(matches!(foreign, Err(LedgerError::Validation(_))));

        let missing = accepts.accept(&question_id(), &answer_id(9)).await;
        assert!(matches!(missing, Err(LedgerError::NotFound(_))));
    }
}
