use std::{io, net::SocketAddr, sync::Arc};

use anyhow::Result;
use thiserror::Error;
use tokio::{
    io::{AsyncBufRead, AsyncWrite, AsyncWriteExt},
    select,
    sync::mpsc,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    hub::HubState,
    limiter::RateLimiter,
    message::{
        ChatMessageEvent, ClientEvent, ServerEvent, TypingEvent, TypingEventKind, UserEvent,
        UserEventKind, read_message, write_message,
    },
    registry::Connection,
    store::HISTORY_KEY,
};

/// Events queued per participant before fan-out starts dropping theirs.
pub const OUTBOUND_CAPACITY: usize = 128;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("connection closed before handshake")]
    Closed,
    #[error("first event must be a joined user event, got {0}")]
    UnexpectedEvent(&'static str),
    #[error("username cannot be empty")]
    EmptyUsername,
    #[error("failed to read handshake")]
    Io(#[from] io::Error),
}

/// Reads the first event and returns the joining username.
pub async fn perform_handshake<R>(reader: &mut R) -> Result<String, HandshakeError>
where
    R: AsyncBufRead + Unpin,
{
    let first = read_message::<_, ClientEvent>(reader)
        .await?
        .ok_or(HandshakeError::Closed)?;

    let username = match first {
        ClientEvent::User(UserEvent {
            kind: UserEventKind::Joined,
            username,
            ..
        }) => username.trim().to_string(),
        other => return Err(HandshakeError::UnexpectedEvent(other.name())),
    };

    if username.is_empty() {
        return Err(HandshakeError::EmptyUsername);
    }
    Ok(username)
}

/// Runs one participant's stream from handshake to teardown.
///
/// The first event must be a `JOINED` user event carrying a non-empty
/// username. After that the connection is active until its receive side
/// fails, reaches end of stream, or is closed by the hub. Teardown
/// unregisters the connection and announces `LEFT`.
pub async fn handle_connection<R, W>(
    mut reader: R,
    writer: W,
    peer: SocketAddr,
    state: Arc<HubState>,
) -> Result<()>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let username = perform_handshake(&mut reader).await?;

    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
    let limiter = RateLimiter::spawn(state.config().rate_limit);
    let connection = Connection::new(state.next_id(), username, outbound_tx, limiter);
    let writer_task = spawn_writer(writer, outbound_rx, connection.close_signal());

    replay_history(&state, &connection).await;
    register(&state, &connection, peer).await;

    let outcome = run_receive_loop(&state, &mut reader, &connection).await;
    teardown(&state, &connection, peer).await;

    drop(connection);
    if let Err(err) = writer_task.await {
        warn!(peer = %peer, error = ?err, "connection writer task failed");
    }

    outcome
}

async fn register(state: &HubState, connection: &Connection, peer: SocketAddr) {
    let username = connection.username();
    if let Some(displaced) = state.registry().register(connection.clone()).await {
        info!(
            username,
            displaced_id = displaced.id(),
            "username taken over by a new connection, closing the old one"
        );
        displaced.close();
    }

    info!(%peer, username, connection_id = connection.id(), "participant joined");
    state
        .registry()
        .broadcast_all(&ServerEvent::user(UserEventKind::Joined, username))
        .await;
}

async fn replay_history(state: &HubState, connection: &Connection) {
    let count = state.config().replay_history;
    if count == 0 {
        return;
    }

    match state.store().recent(HISTORY_KEY, count).await {
        Ok(messages) => {
            for message in messages {
                if connection.send(ServerEvent::ChatMessage(message)).await.is_err() {
                    break;
                }
            }
        }
        Err(error) => warn!(
            username = connection.username(),
            error = ?error,
            "failed to load history for replay"
        ),
    }
}

async fn run_receive_loop<R>(state: &HubState, reader: &mut R, connection: &Connection) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        select! {
            _ = connection.closed() => {
                debug!(username = connection.username(), "connection closed by hub");
                return Ok(());
            }
            inbound = read_message::<_, ClientEvent>(reader) => {
                match inbound? {
                    Some(event) => handle_client_event(state, connection, event).await,
                    None => return Ok(()),
                }
            }
        }
    }
}

async fn handle_client_event(state: &HubState, connection: &Connection, event: ClientEvent) {
    match event {
        ClientEvent::ChatMessage(message) => handle_chat_message(state, connection, message).await,
        ClientEvent::Typing(typing) => handle_typing(state, connection, typing).await,
        ClientEvent::User(_) => {
            debug!(
                username = connection.username(),
                event = event.name(),
                "ignoring user event after handshake"
            );
        }
    }
}

async fn handle_chat_message(state: &HubState, connection: &Connection, inbound: ChatMessageEvent) {
    let username = connection.username();
    if inbound.message.trim().is_empty() {
        return;
    }

    if !connection.limiter().allow() {
        info!(username, "rate limit hit, dropping message");
        return;
    }

    // Username and timestamp always come from the hub, never from the client.
    let message = ChatMessageEvent::now(username, inbound.message);

    if let Err(error) = state.store().append(HISTORY_KEY, &message).await {
        warn!(username, error = ?error, "failed to persist message, broadcasting anyway");
    }

    state
        .registry()
        .broadcast_all(&ServerEvent::ChatMessage(message))
        .await;
}

async fn handle_typing(state: &HubState, connection: &Connection, inbound: TypingEvent) {
    connection.set_typing(inbound.kind == TypingEventKind::Start);

    let event = ServerEvent::Typing(TypingEvent::now(connection.username(), inbound.kind));
    state
        .registry()
        .broadcast_except(&event, connection.username())
        .await;
}

async fn teardown(state: &HubState, connection: &Connection, peer: SocketAddr) {
    connection.close();
    let username = connection.username();

    if state
        .registry()
        .unregister(username, connection.id())
        .await
        .is_none()
    {
        debug!(username, "connection was already replaced, not announcing departure");
        return;
    }

    info!(%peer, username, "participant left");
    state
        .registry()
        .broadcast_all(&ServerEvent::user(UserEventKind::Left, username))
        .await;
}

fn spawn_writer<W>(
    mut writer: W,
    mut outbound: mpsc::Receiver<ServerEvent>,
    closed: CancellationToken,
) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            select! {
                biased;
                event = outbound.recv() => {
                    let Some(event) = event else { break };
                    if let Err(err) = write_message(&mut writer, &event).await {
                        debug!(error = ?err, "failed to write to participant, closing connection");
                        closed.cancel();
                        break;
                    }
                }
                _ = closed.cancelled() => break,
            }
        }

        if let Err(err) = writer.shutdown().await {
            debug!(error = ?err, "failed to shut down connection writer");
        }
    })
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncWriteExt, BufReader, duplex};

    use super::*;

    async fn handshake_with(lines: &[u8]) -> Result<String, HandshakeError> {
        let (mut client, server) = duplex(1024);
        client.write_all(lines).await.expect("write handshake");
        drop(client);
        perform_handshake(&mut BufReader::new(server)).await
    }

    #[tokio::test]
    async fn joined_event_yields_trimmed_username() {
        let (mut client, server) = duplex(1024);
        write_message(&mut client, &ClientEvent::joined("  alice "))
            .await
            .expect("write join");

        let username = perform_handshake(&mut BufReader::new(server))
            .await
            .expect("handshake");
        assert_eq!(username, "alice");
    }

    #[tokio::test]
    async fn handshake_rejections() {
        assert!(matches!(handshake_with(b"").await, Err(HandshakeError::Closed)));
        assert!(matches!(
            handshake_with(b"{\"event\":\"user\",\"kind\":\"joined\",\"username\":\" \",\"timestamp\":0}\n").await,
            Err(HandshakeError::EmptyUsername)
        ));
        assert!(matches!(
            handshake_with(b"{\"event\":\"user\",\"kind\":\"left\",\"username\":\"bob\",\"timestamp\":0}\n").await,
            Err(HandshakeError::UnexpectedEvent("user_left"))
        ));
        assert!(matches!(
            handshake_with(b"{\"event\":\"chat_message\",\"username\":\"bob\",\"message\":\"hi\",\"timestamp\":0}\n").await,
            Err(HandshakeError::UnexpectedEvent("chat_message"))
        ));
        assert!(matches!(handshake_with(b"not json\n").await, Err(HandshakeError::Io(_))));
    }
}
