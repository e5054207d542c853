use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

use crate::{
    message::ServerEvent,
    registry::{Connection, SessionRegistry},
};

impl SessionRegistry {
    /// Offers `event` to every registered connection. Returns how many accepted it.
    pub async fn broadcast_all(&self, event: &ServerEvent) -> usize {
        self.fan_out(event, None).await
    }

    /// Offers `event` to every registered connection except `excluded`.
    pub async fn broadcast_except(&self, event: &ServerEvent, excluded: &str) -> usize {
        self.fan_out(event, Some(excluded)).await
    }

    async fn fan_out(&self, event: &ServerEvent, excluded: Option<&str>) -> usize {
        self.with_connections(|connections| {
            connections
                .values()
                .filter(|connection| Some(connection.username()) != excluded)
                .filter(|connection| deliver(connection, event))
                .count()
        })
        .await
    }
}

// Never waits: a target that is gone or not keeping up is logged and skipped,
// and removing it is left to that connection's own receive loop.
fn deliver(connection: &Connection, event: &ServerEvent) -> bool {
    match connection.try_send(event.clone()) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!(
                username = connection.username(),
                connection_id = connection.id(),
                "outbound queue full, dropping event for slow participant"
            );
            false
        }
        Err(TrySendError::Closed(_)) => {
            warn!(
                username = connection.username(),
                connection_id = connection.id(),
                "failed to deliver event, connection outbound queue is closed"
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        message::{ServerEvent, TypingEvent, TypingEventKind, UserEventKind},
        registry::{
            SessionRegistry,
            tests::{connection, connection_with_capacity},
        },
    };

    #[tokio::test]
    async fn broadcast_all_reaches_every_connection_once() {
        let registry = SessionRegistry::new();
        let (alice, mut alice_rx) = connection(1, "alice");
        let (bob, mut bob_rx) = connection(2, "bob");
        registry.register(alice).await;
        registry.register(bob).await;

        let event = ServerEvent::user(UserEventKind::Joined, "bob");
        assert_eq!(registry.broadcast_all(&event).await, 2);

        assert_eq!(alice_rx.recv().await, Some(event.clone()));
        assert_eq!(bob_rx.recv().await, Some(event));
        assert!(alice_rx.try_recv().is_err());
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_target_does_not_abort_fan_out() {
        let registry = SessionRegistry::new();
        let (alice, alice_rx) = connection(1, "alice");
        let (bob, mut bob_rx) = connection(2, "bob");
        let (carol, mut carol_rx) = connection(3, "carol");
        registry.register(alice).await;
        registry.register(bob).await;
        registry.register(carol).await;
        drop(alice_rx);

        let event = ServerEvent::user(UserEventKind::Left, "dave");
        assert_eq!(registry.broadcast_all(&event).await, 2);

        assert_eq!(bob_rx.recv().await, Some(event.clone()));
        assert_eq!(carol_rx.recv().await, Some(event));
        assert!(
            registry.contains("alice").await,
            "fan-out never unregisters"
        );
    }

    #[tokio::test]
    async fn broadcast_except_skips_only_the_excluded_name() {
        let registry = SessionRegistry::new();
        let (alice, mut alice_rx) = connection(1, "alice");
        let (bob, mut bob_rx) = connection(2, "bob");
        let (carol, mut carol_rx) = connection(3, "carol");
        registry.register(alice).await;
        registry.register(bob).await;
        registry.register(carol).await;

        let event = ServerEvent::Typing(TypingEvent::now("alice", TypingEventKind::Start));
        assert_eq!(registry.broadcast_except(&event, "alice").await, 2);

        assert!(alice_rx.try_recv().is_err());
        assert_eq!(bob_rx.try_recv().ok(), Some(event.clone()));
        assert_eq!(carol_rx.try_recv().ok(), Some(event));
        assert!(bob_rx.try_recv().is_err());
        assert!(carol_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_to_empty_registry_delivers_nothing() {
        let registry = SessionRegistry::new();
        let event = ServerEvent::user(UserEventKind::Joined, "ghost");
        assert_eq!(registry.broadcast_all(&event).await, 0);
    }

    #[tokio::test]
    async fn full_queue_sheds_events_without_blocking_others() {
        let registry = SessionRegistry::new();
        let (alice, mut alice_rx) = connection(1, "alice");
        let (stalled, mut stalled_rx) = connection_with_capacity(2, "stalled", 4);
        registry.register(alice).await;
        registry.register(stalled).await;

        let event = ServerEvent::Typing(TypingEvent::now("alice", TypingEventKind::Start));
        let mut accepted = 0;
        for _ in 0..1_000 {
            accepted += registry.broadcast_except(&event, "alice").await;
        }

        assert_eq!(accepted, 4, "queue never grows past its bound");
        let queued = std::iter::from_fn(|| stalled_rx.try_recv().ok()).count();
        assert_eq!(queued, 4);
        assert!(alice_rx.try_recv().is_err());

        let joined = ServerEvent::user(UserEventKind::Joined, "bob");
        assert_eq!(registry.broadcast_all(&joined).await, 2);
        assert_eq!(alice_rx.try_recv().ok(), Some(joined.clone()));
        assert_eq!(stalled_rx.try_recv().ok(), Some(joined));
    }
}
