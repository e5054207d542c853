use std::{
    io::{self, Write},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result, bail, ensure};
use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::mpsc,
    task::JoinHandle,
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    cli::ClientArgs,
    message::{ClientEvent, ServerEvent, UserEvent, UserEventKind, read_message, write_message},
    terminal::{InputEvent, Terminal},
    typing::{RemoteTyping, TypingDebouncer, spawn_idle_checker},
};

/// How long queued events (the final typing STOP in particular) get to reach the hub on exit.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

pub async fn run(args: ClientArgs) -> Result<()> {
    let username = resolve_username(args.username).await?;
    let (reader, writer) = establish_connection(&args.server).await?;

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let writer_task = spawn_writer(writer, outbound_rx);
    outbound_tx
        .send(ClientEvent::joined(&username))
        .context("connection closed before joining")?;

    let (terminal, mut input, raw_mode) = Terminal::start()?;
    terminal.print_line("You can start chatting now. Type your messages and press Enter.");

    let done = CancellationToken::new();
    let debouncer = Arc::new(TypingDebouncer::new(&username, outbound_tx.clone()));
    let receiver_task = spawn_receiver(reader, terminal.clone(), username.clone(), done.clone());
    let idle_task = spawn_idle_checker(Arc::clone(&debouncer), done.clone());

    let session = ClientSession {
        username: &username,
        terminal: &terminal,
        debouncer: &debouncer,
        outbound: &outbound_tx,
        done: &done,
    };
    session.run(&mut input).await;

    debouncer.stop();
    done.cancel();
    if let Err(err) = idle_task.await {
        warn!(error = ?err, "typing idle checker task failed");
    }
    if let Err(err) = receiver_task.await {
        warn!(error = ?err, "server receiver task failed");
    }

    drop(debouncer);
    drop(outbound_tx);
    if timeout(FLUSH_TIMEOUT, writer_task).await.is_err() {
        warn!("timed out flushing events to the server");
    }
    drop(raw_mode);

    Ok(())
}

async fn resolve_username(flag: Option<String>) -> Result<String> {
    if let Some(name) = flag {
        let name = name.trim();
        ensure!(!name.is_empty(), "username cannot be empty");
        return Ok(name.to_string());
    }

    tokio::task::spawn_blocking(prompt_username)
        .await
        .context("username prompt task failed")?
}

fn prompt_username() -> Result<String> {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        write!(stdout, "Enter your username: ")?;
        stdout.flush()?;

        let mut line = String::new();
        if stdin.read_line(&mut line)? == 0 {
            bail!("no username entered");
        }

        let name = line.trim();
        if !name.is_empty() {
            return Ok(name.to_string());
        }
        writeln!(stdout, "Username cannot be empty.")?;
    }
}

async fn establish_connection(server: &str) -> Result<(BufReader<OwnedReadHalf>, OwnedWriteHalf)> {
    let stream = TcpStream::connect(server)
        .await
        .with_context(|| format!("failed to connect to {server}"))?;

    info!("connected to {server}");

    let (reader, writer) = stream.into_split();
    Ok((BufReader::new(reader), writer))
}

fn spawn_writer(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<ClientEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = outbound.recv().await {
            if let Err(error) = write_message(&mut writer, &event).await {
                debug!(?error, "failed to send event to server");
                break;
            }
        }
        shutdown_connection(&mut writer).await;
    })
}

async fn shutdown_connection(writer: &mut OwnedWriteHalf) {
    if let Err(error) = writer.shutdown().await {
        debug!(?error, "failed to shutdown client writer cleanly");
    }
}

fn spawn_receiver(
    mut reader: BufReader<OwnedReadHalf>,
    terminal: Terminal,
    username: String,
    done: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut remote = RemoteTyping::new(&username);

        loop {
            let message = select! {
                _ = done.cancelled() => return,
                message = read_message::<_, ServerEvent>(&mut reader) => message,
            };

            match message {
                Ok(Some(event)) => render_server_event(&terminal, &mut remote, &username, event),
                Ok(None) => break,
                Err(error) => {
                    debug!(?error, "failed to receive from server");
                    break;
                }
            }
        }

        terminal.print_line("Disconnected from server");
        done.cancel();
    })
}

struct ClientSession<'a> {
    username: &'a str,
    terminal: &'a Terminal,
    debouncer: &'a TypingDebouncer,
    outbound: &'a mpsc::UnboundedSender<ClientEvent>,
    done: &'a CancellationToken,
}

impl ClientSession<'_> {
    /// Drives local input until the user leaves or the server goes away.
    async fn run(&self, input: &mut mpsc::UnboundedReceiver<InputEvent>) {
        loop {
            select! {
                _ = self.done.cancelled() => return,
                event = input.recv() => {
                    if !self.handle_input(event.unwrap_or(InputEvent::Closed)) {
                        return;
                    }
                }
                ctrl_c = tokio::signal::ctrl_c() => {
                    handle_ctrl_c(ctrl_c);
                    self.terminal.print_line("Exiting chat...");
                    return;
                }
            }
        }
    }

    fn handle_input(&self, event: InputEvent) -> bool {
        match event {
            InputEvent::Changed(len) => {
                self.debouncer.input_changed(len);
                true
            }
            InputEvent::Submitted(line) => {
                self.debouncer.line_submitted();
                self.handle_line(line.trim())
            }
            InputEvent::Closed => {
                self.terminal.print_line("Exiting chat...");
                false
            }
        }
    }

    fn handle_line(&self, text: &str) -> bool {
        if text.is_empty() {
            return true;
        }

        if text.eq_ignore_ascii_case("/quit") {
            self.terminal.print_line("Exiting chat...");
            return false;
        }

        if self
            .outbound
            .send(ClientEvent::chat(self.username, text))
            .is_err()
        {
            warn!("failed to send message, connection is closed");
        }
        true
    }
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

fn render_server_event(
    terminal: &Terminal,
    remote: &mut RemoteTyping,
    own_name: &str,
    event: ServerEvent,
) {
    if let ServerEvent::Typing(typing) = &event {
        if remote.apply(typing) {
            terminal.set_indicator(remote.indicator());
        }
        return;
    }

    if let ServerEvent::User(UserEvent {
        kind: UserEventKind::Left,
        username,
        ..
    }) = &event
    {
        if remote.remove(username) {
            terminal.set_indicator(remote.indicator());
        }
    }

    if let Some(line) = render_line(own_name, &event) {
        terminal.print_line(&line);
    }
}

/// Text printed for one server event, if it produces a line of output.
pub fn render_line(own_name: &str, event: &ServerEvent) -> Option<String> {
    match event {
        ServerEvent::ChatMessage(message) if message.username == own_name => {
            Some(format!("[you] {}", message.message))
        }
        ServerEvent::ChatMessage(message) => {
            Some(format!("[{}] {}", message.username, message.message))
        }
        ServerEvent::User(UserEvent {
            kind: UserEventKind::Joined,
            username,
            ..
        }) => Some(format!("* {username} joined the chat")),
        ServerEvent::User(UserEvent {
            kind: UserEventKind::Left,
            username,
            ..
        }) => Some(format!("* {username} left the chat")),
        ServerEvent::Typing(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ChatMessageEvent, TypingEvent, TypingEventKind};

    #[test]
    fn own_messages_render_as_you() {
        let event = ServerEvent::ChatMessage(ChatMessageEvent::now("alice", "hi"));

        assert_eq!(render_line("alice", &event).as_deref(), Some("[you] hi"));
        assert_eq!(render_line("bob", &event).as_deref(), Some("[alice] hi"));
    }

    #[test]
    fn membership_changes_render_as_notices() {
        let joined = ServerEvent::user(UserEventKind::Joined, "bob");
        let left = ServerEvent::user(UserEventKind::Left, "bob");

        assert_eq!(
            render_line("alice", &joined).as_deref(),
            Some("* bob joined the chat")
        );
        assert_eq!(
            render_line("alice", &left).as_deref(),
            Some("* bob left the chat")
        );
    }

    #[test]
    fn typing_events_print_nothing() {
        let typing = ServerEvent::Typing(TypingEvent::now("bob", TypingEventKind::Start));
        assert_eq!(render_line("alice", &typing), None);
    }
}
