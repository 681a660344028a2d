use atrium_core::events::{NotificationChannel, NotificationEvent};
use atrium_core::UserId;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::warn;

/// A notification addressed to one user.
#[derive(Clone, Debug, Serialize)]
pub struct UserEvent {
    pub user_id: UserId,
    #[serde(flatten)]
    pub event: NotificationEvent,
}

/// In-process fan-out. The event bridge forwards to the user's sockets.
pub struct BroadcastNotifier {
    tx: broadcast::Sender<UserEvent>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UserEvent> {
        self.tx.subscribe()
    }
}

impl NotificationChannel for BroadcastNotifier {
    fn publish(&self, user_id: &UserId, event: NotificationEvent) {
        let event_type = event.event_type();
        if self
            .tx
            .send(UserEvent {
                user_id: user_id.clone(),
                event,
            })
            .is_err()
        {
            warn!(user_id = %user_id, event_type, "no notification receivers, event dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atrium_core::ThreadId;

    #[tokio::test]
    async fn subscribers_receive_addressed_events() {
        let notifier = BroadcastNotifier::new(16);
        let mut rx = notifier.subscribe();
        notifier.publish(
            &UserId::from_raw("alice"),
            NotificationEvent::StreamStopped {
                thread_id: ThreadId::from_raw("ops"),
            },
        );
        let evt = rx.recv().await.unwrap();
        assert_eq!(evt.user_id.as_str(), "alice");
        let json = serde_json::to_value(&evt).unwrap();
        assert_eq!(json["type"], "stream_stopped");
        assert_eq!(json["thread_id"], "ops");
    }

    #[test]
    fn publish_without_receivers_is_dropped() {
        let notifier = BroadcastNotifier::new(4);
        notifier.publish(
            &UserId::from_raw("alice"),
            NotificationEvent::StreamStopped {
                thread_id: ThreadId::from_raw("ops"),
            },
        );
    }
}
