use std::{
    io,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UserEventKind {
    Joined,
    Left,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TypingEventKind {
    Start,
    Stop,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserEvent {
    pub kind: UserEventKind,
    pub username: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessageEvent {
    pub username: String,
    pub message: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TypingEvent {
    pub username: String,
    pub kind: TypingEventKind,
    pub timestamp: i64,
}

/// Events a client writes to the hub.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientEvent {
    User(UserEvent),
    ChatMessage(ChatMessageEvent),
    Typing(TypingEvent),
}

/// Events the hub fans out to connected clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    User(UserEvent),
    ChatMessage(ChatMessageEvent),
    Typing(TypingEvent),
}

impl UserEvent {
    pub fn now(kind: UserEventKind, username: impl Into<String>) -> Self {
        Self {
            kind,
            username: username.into(),
            timestamp: unix_timestamp(),
        }
    }
}

impl ChatMessageEvent {
    pub fn now(username: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            message: message.into(),
            timestamp: unix_timestamp(),
        }
    }
}

impl TypingEvent {
    pub fn now(username: impl Into<String>, kind: TypingEventKind) -> Self {
        Self {
            username: username.into(),
            kind,
            timestamp: unix_timestamp(),
        }
    }
}

impl ClientEvent {
    pub fn joined(username: impl Into<String>) -> Self {
        ClientEvent::User(UserEvent::now(UserEventKind::Joined, username))
    }

    pub fn chat(username: impl Into<String>, message: impl Into<String>) -> Self {
        ClientEvent::ChatMessage(ChatMessageEvent::now(username, message))
    }

    pub fn typing(username: impl Into<String>, kind: TypingEventKind) -> Self {
        ClientEvent::Typing(TypingEvent::now(username, kind))
    }

    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::User(UserEvent {
                kind: UserEventKind::Joined,
                ..
            }) => "user_joined",
            ClientEvent::User(UserEvent {
                kind: UserEventKind::Left,
                ..
            }) => "user_left",
            ClientEvent::ChatMessage(_) => "chat_message",
            ClientEvent::Typing(_) => "typing",
        }
    }
}

impl ServerEvent {
    pub fn user(kind: UserEventKind, username: impl Into<String>) -> Self {
        ServerEvent::User(UserEvent::now(kind, username))
    }
}

/// Seconds since the Unix epoch, the resolution every event timestamp uses.
pub fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or_default()
}

pub async fn read_message<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    // One JSON object per line; blank lines are keep-alives and skipped.
    let mut line = String::new();
    loop {
        line.clear();
        let bytes = reader.read_line(&mut line).await?;
        if bytes == 0 {
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        if trimmed.is_empty() {
            continue;
        }

        let parsed = serde_json::from_str(trimmed).map_err(to_io_error)?;
        return Ok(Some(parsed));
    }
}

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut encoded = serde_json::to_vec(message).map_err(to_io_error)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn server_event_survives_the_wire() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut reader = tokio::io::BufReader::new(reader);
        let message = ServerEvent::ChatMessage(ChatMessageEvent {
            username: "alice".into(),
            message: "hello".into(),
            timestamp: 1_700_000_000,
        });

        write_message(&mut writer, &message)
            .await
            .expect("write message");
        let parsed = read_message::<_, ServerEvent>(&mut reader)
            .await
            .expect("read message")
            .expect("expected message");

        assert_eq!(message, parsed);
    }

    #[test]
    fn client_events_are_tagged_by_event_kind() {
        let encoded = serde_json::to_value(ClientEvent::Typing(TypingEvent {
            username: "bob".into(),
            kind: TypingEventKind::Start,
            timestamp: 7,
        }))
        .expect("encode typing event");

        assert_eq!(
            encoded,
            serde_json::json!({
                "event": "typing",
                "username": "bob",
                "kind": "start",
                "timestamp": 7,
            })
        );
    }

    #[tokio::test]
    async fn blank_lines_are_skipped_and_eof_is_none() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut reader = tokio::io::BufReader::new(reader);

        writer.write_all(b"\n\r\n").await.expect("write blanks");
        write_message(&mut writer, &ClientEvent::joined("carol"))
            .await
            .expect("write join");
        drop(writer);

        let first = read_message::<_, ClientEvent>(&mut reader)
            .await
            .expect("read join");
        assert!(matches!(
            first,
            Some(ClientEvent::User(UserEvent { kind: UserEventKind::Joined, ref username, .. }))
                if username == "carol"
        ));
        let end = read_message::<_, ClientEvent>(&mut reader)
            .await
            .expect("read eof");
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn malformed_json_is_invalid_data() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut reader = tokio::io::BufReader::new(reader);

        writer.write_all(b"{not json}\n").await.expect("write junk");

        let err = read_message::<_, ClientEvent>(&mut reader)
            .await
            .expect_err("junk should not parse");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
