use std::{
    future::Future,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use anyhow::Result;
use tokio::{
    io::BufReader,
    net::{TcpListener, TcpStream},
    select,
};
use tracing::{info, warn};

use crate::{
    connection::handle_connection,
    limiter::RateLimitConfig,
    registry::{ConnectionId, SessionRegistry},
    store::MessageStore,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct HubConfig {
    pub rate_limit: RateLimitConfig,
    /// Stored messages replayed to a participant right after joining. Zero disables replay.
    pub replay_history: usize,
}

/// Accepts TCP connections and runs one handler task per participant.
pub struct Hub {
    listener: TcpListener,
    state: Arc<HubState>,
}

impl Hub {
    pub fn new(listener: TcpListener, store: Arc<dyn MessageStore>, config: HubConfig) -> Self {
        Self {
            listener,
            state: Arc::new(HubState::new(store, config)),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn state(&self) -> Arc<HubState> {
        Arc::clone(&self.state)
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Hub { listener, state } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    handle_shutdown(&state).await;
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &state);
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

async fn handle_shutdown(state: &HubState) {
    let connections = state.registry().snapshot().await;
    info!(connections = connections.len(), "hub shutting down");
    for connection in connections {
        connection.close();
    }
}

fn handle_accept_result(result: std::io::Result<(TcpStream, SocketAddr)>, state: &Arc<HubState>) {
    match result {
        Ok((stream, peer)) => spawn_connection_handler(stream, peer, state),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_connection_handler(stream: TcpStream, peer: SocketAddr, state: &Arc<HubState>) {
    let state = Arc::clone(state);
    tokio::spawn(async move {
        let (reader, writer) = stream.into_split();
        if let Err(err) = handle_connection(BufReader::new(reader), writer, peer, state).await {
            warn!(peer = %peer, error = ?err, "connection closed with error");
        }
    });
}

/// State shared by every connection handler of one hub.
pub struct HubState {
    registry: SessionRegistry,
    store: Arc<dyn MessageStore>,
    config: HubConfig,
    next_id: AtomicU64,
}

impl HubState {
    pub fn new(store: Arc<dyn MessageStore>, config: HubConfig) -> Self {
        Self {
            registry: SessionRegistry::new(),
            store,
            config,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn store(&self) -> &dyn MessageStore {
        self.store.as_ref()
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub(crate) fn next_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}
