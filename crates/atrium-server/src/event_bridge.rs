use std::sync::Arc;

use tokio::sync::broadcast;

use crate::client::ClientRegistry;
use crate::notify::UserEvent;

/// Forward notifier events to the addressed user's sockets.
pub fn start_bridge(registry: Arc<ClientRegistry>, mut rx: broadcast::Receiver<UserEvent>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let Some(json) = serialize_event(&event) else {
                        continue;
                    };
                    if registry.broadcast_to_user(&event.user_id, &json) == 0 {
                        tracing::debug!(user_id = %event.user_id, event_type = event.event.event_type(), "user has no live socket");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "event bridge lagged, dropped events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::info!("event bridge channel closed");
                    break;
                }
            }
        }
    })
}

pub fn serialize_event(event: &UserEvent) -> Option<String> {
    serde_json::to_string(event).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::BroadcastNotifier;
    use atrium_core::events::{NotificationChannel, NotificationEvent};
    use atrium_core::{ThreadId, UserId};

    #[tokio::test]
    async fn bridge_routes_by_user() {
        let registry = Arc::new(ClientRegistry::new(32));
        let notifier = BroadcastNotifier::new(16);
        let (_alice, mut alice_rx) = registry.register(UserId::from_raw("alice"));
        let (_bob, mut bob_rx) = registry.register(UserId::from_raw("bob"));
        let handle = start_bridge(Arc::clone(&registry), notifier.subscribe());

        notifier.publish(
            &UserId::from_raw("alice"),
            NotificationEvent::MessageComplete {
                thread_id: ThreadId::from_raw("ops"),
                text: "done".into(),
            },
        );

        let msg = tokio::time::timeout(std::time::Duration::from_secs(1), alice_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(msg.contains("\"type\":\"message_complete\""));
        assert!(msg.contains("\"user_id\":\"alice\""));
        assert!(bob_rx.try_recv().is_err());
        handle.abort();
    }
}
