use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use tokio::sync::{
    Mutex, mpsc,
    mpsc::error::{SendError, TrySendError},
};
use tokio_util::sync::CancellationToken;

use crate::{limiter::RateLimiter, message::ServerEvent};

pub type ConnectionId = u64;

/// Server-side bookkeeping for one participant's stream.
///
/// Cloning is cheap and every clone refers to the same stream: the outbound
/// sink, limiter, typing flag and close signal are all shared handles.
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    username: String,
    outbound: mpsc::Sender<ServerEvent>,
    limiter: RateLimiter,
    typing: Arc<AtomicBool>,
    closed: CancellationToken,
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        username: impl Into<String>,
        outbound: mpsc::Sender<ServerEvent>,
        limiter: RateLimiter,
    ) -> Self {
        Self {
            id,
            username: username.into(),
            outbound,
            limiter,
            typing: Arc::new(AtomicBool::new(false)),
            closed: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn is_typing(&self) -> bool {
        self.typing.load(Ordering::Relaxed)
    }

    pub fn set_typing(&self, typing: bool) {
        self.typing.store(typing, Ordering::Relaxed);
    }

    /// Queues an event without waiting. Fails if the outbound queue is full or gone.
    pub fn try_send(&self, event: ServerEvent) -> Result<(), TrySendError<ServerEvent>> {
        self.outbound.try_send(event)
    }

    /// Queues an event, waiting for room in the outbound queue.
    pub async fn send(&self, event: ServerEvent) -> Result<(), SendError<ServerEvent>> {
        self.outbound.send(event).await
    }

    /// Asks the connection's receive loop to stop.
    pub fn close(&self) {
        self.closed.cancel();
    }

    #[cfg(test)]
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once [`Connection::close`] has been called on any clone.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// The close signal alone, for tasks that must not keep the outbound sink alive.
    pub(crate) fn close_signal(&self) -> CancellationToken {
        self.closed.clone()
    }
}

/// Authoritative map of participant name to live connection.
///
/// The map lives behind one mutex that is never handed out. Membership
/// changes and fan-out passes (see [`crate::broadcast`]) both go through it,
/// so a broadcast never observes a half-updated membership.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    connections: Mutex<HashMap<String, Connection>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `connection` under its username and returns whichever
    /// connection held that name before, if any. The displaced connection is
    /// not closed here.
    pub async fn register(&self, connection: Connection) -> Option<Connection> {
        let mut connections = self.connections.lock().await;
        connections.insert(connection.username.clone(), connection)
    }

    /// Removes `username` only if it is still owned by connection `id`.
    pub async fn unregister(&self, username: &str, id: ConnectionId) -> Option<Connection> {
        let mut connections = self.connections.lock().await;
        match connections.get(username) {
            Some(current) if current.id == id => connections.remove(username),
            _ => None,
        }
    }

    /// Owned copy of the current membership.
    pub async fn snapshot(&self) -> Vec<Connection> {
        self.with_connections(|connections| connections.values().cloned().collect())
            .await
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .with_connections(|connections| connections.keys().cloned().collect())
            .await;
        names.sort();
        names
    }

    #[cfg(test)]
    pub(crate) async fn contains(&self, username: &str) -> bool {
        self.with_connections(|connections| connections.contains_key(username))
            .await
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.with_connections(HashMap::len).await
    }

    #[cfg(test)]
    pub(crate) async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Runs `f` against the map with the registry lock held for its whole duration.
    pub(crate) async fn with_connections<T>(
        &self,
        f: impl FnOnce(&HashMap<String, Connection>) -> T,
    ) -> T {
        let connections = self.connections.lock().await;
        f(&*connections)
    }
}
