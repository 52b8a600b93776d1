/// Post-commit notifications
///
/// Orchestrators enqueue notifications only after their transaction commits.
/// Delivery is fire-and-forget: a full queue or a failing sink is logged and
/// never reaches the caller of the ledger operation.

use crate::{error::LedgerResult, metrics};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Notification payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationKind {
    /// A user's rank changed
    Achievement {
        user_id: String,
        object_id: String,
        activity_type: i64,
        rank: i64,
    },
    /// Something happened to a user's content
    Inbox {
        receiver_user_id: String,
        trigger_user_id: String,
        object_id: String,
        action: String,
    },
}

/// A notification message. The ID lets at-least-once consumers deduplicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: NotificationKind,
}

impl Notification {
    pub fn new(kind: NotificationKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            kind,
        }
    }

    pub fn achievement(user_id: &str, object_id: &str, activity_type: i64, rank: i64) -> Self {
        Self::new(NotificationKind::Achievement {
            user_id: user_id.to_string(),
            object_id: object_id.to_string(),
            activity_type,
            rank,
        })
    }

    pub fn inbox(receiver_user_id: &str, trigger_user_id: &str, object_id: &str, action: &str) -> Self {
        Self::new(NotificationKind::Inbox {
            receiver_user_id: receiver_user_id.to_string(),
            trigger_user_id: trigger_user_id.to_string(),
            object_id: object_id.to_string(),
            action: action.to_string(),
        })
    }
}

/// Downstream delivery pipeline
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, notification: &Notification) -> LedgerResult<()>;
}

/// Sink that only logs notifications
#[derive(Debug, Default, Clone)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn deliver(&self, notification: &Notification) -> LedgerResult<()> {
        let payload = serde_json::to_string(notification).unwrap_or_default();
        info!(notification_id = %notification.id, %payload, "Notification");
        Ok(())
    }
}

/// Bounded in-process notification queue
#[derive(Clone)]
pub struct NotificationQueue {
    sender: mpsc::Sender<Notification>,
}

impl NotificationQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Notification>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, receiver)
    }

    /// Enqueue without waiting. Returns whether the notification was queued.
    pub fn send(&self, notification: Notification) -> bool {
        match self.sender.try_send(notification) {
            Ok(()) => {
                metrics::record_notification("queued");
                true
            }
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                warn!(notification_id = %dropped.id, "Notification queue full, dropping notification");
                metrics::record_notification("dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(dropped)) => {
                warn!(notification_id = %dropped.id, "Notification queue closed, dropping notification");
                metrics::record_notification("dropped");
                false
            }
        }
    }

    pub fn send_all(&self, notifications: impl IntoIterator<Item = Notification>) {
        for notification in notifications {
            self.send(notification);
        }
    }
}

/// Drain `receiver` into `sink` until every queue handle is dropped
pub fn spawn_dispatcher(
    mut receiver: mpsc::Receiver<Notification>,
    sink: Arc<dyn NotificationSink>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Notification dispatcher started");

        while let Some(notification) = receiver.recv().await {
            match sink.deliver(&notification).await {
                Ok(()) => {
                    debug!(notification_id = %notification.id, "Delivered notification");
                    metrics::record_notification("delivered");
                }
                Err(e) => {
                    warn!(notification_id = %notification.id, "Failed to deliver notification: {}", e);
                    metrics::record_notification("failed");
                }
            }
        }

        info!("Notification dispatcher stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LedgerError;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct CollectingSink {
        delivered: Mutex<Vec<Notification>>,
    }

    #[async_trait]
    impl NotificationSink for CollectingSink {
        async fn deliver(&self, notification: &Notification) -> LedgerResult<()> {
            self.delivered.lock().await.push(notification.clone());
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl NotificationSink for FailingSink {
        async fn deliver(&self, _notification: &Notification) -> LedgerResult<()> {
            Err(LedgerError::Notification("pipeline offline".to_string()))
        }
    }

    #[tokio::test]
    async fn test_dispatcher_delivers_in_queue_order() {
        let (queue, receiver) = NotificationQueue::new(8);
        let sink = Arc::new(CollectingSink::default());
        let handle = spawn_dispatcher(receiver, sink.clone());

        assert!(queue.send(Notification::achievement("u1", "o1", 5, 10)));
        assert!(queue.send(Notification::inbox("u1", "u2", "o1", "answer.vote_up")));
        drop(queue);
        handle.await.unwrap();

        let delivered = sink.delivered.lock().await;
        assert_eq!(delivered.len(), 2);
        assert!(matches!(
            delivered[0].kind,
            NotificationKind::Achievement { rank: 10, .. }
        ));
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_error() {
        let (queue, _receiver) = NotificationQueue::new(1);

        assert!(queue.send(Notification::achievement("u1", "o1", 5, 10)));
        assert!(!queue.send(Notification::achievement("u1", "o2", 5, 10)));
    }

    #[tokio::test]
    async fn test_failing_sink_keeps_draining() {
        let (queue, receiver) = NotificationQueue::new(8);
        let handle = spawn_dispatcher(receiver, Arc::new(FailingSink));

        queue.send(Notification::achievement("u1", "o1", 5, 10));
        queue.send(Notification::achievement("u1", "o2", 5, 10));
        drop(queue);

        // the dispatcher finishes once the queue closes even though every delivery failed
        handle.await.unwrap();
    }

    #[test]
    fn test_notification_serialization() {
        let notification = Notification::inbox("u1", "u2", "o1", "answer.accepted");
        let json = serde_json::to_value(&notification).unwrap();

        assert_eq!(json["type"], "inbox");
        assert_eq!(json["receiver_user_id"], "u1");
        assert_eq!(json["action"], "answer.accepted");
    }
}
