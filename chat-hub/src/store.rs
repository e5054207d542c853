use std::{
    collections::{HashMap, VecDeque},
    io,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    fs::OpenOptions,
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    sync::Mutex,
};
use tracing::warn;

use crate::message::ChatMessageEvent;

/// Topic every accepted chat message is stored under.
pub const HISTORY_KEY: &str = "chat:messages";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("history storage I/O failed")]
    Io(#[from] io::Error),
    #[error("failed to encode history record")]
    Encode(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Message history port. The hub only ever appends accepted chat messages
/// under a topic key and reads back the most recent ones.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Durably stores one message under `topic`.
    async fn append(&self, topic: &str, message: &ChatMessageEvent) -> StoreResult<()>;

    /// Up to `count` most recently appended messages for `topic`, oldest first.
    async fn recent(&self, topic: &str, count: usize) -> StoreResult<Vec<ChatMessageEvent>>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    topics: Mutex<HashMap<String, Vec<ChatMessageEvent>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn append(&self, topic: &str, message: &ChatMessageEvent) -> StoreResult<()> {
        let mut topics = self.topics.lock().await;
        topics
            .entry(topic.to_string())
            .or_default()
            .push(message.clone());
        Ok(())
    }

    async fn recent(&self, topic: &str, count: usize) -> StoreResult<Vec<ChatMessageEvent>> {
        let topics = self.topics.lock().await;
        let messages = topics.get(topic).map(Vec::as_slice).unwrap_or_default();
        let start = messages.len().saturating_sub(count);
        Ok(messages[start..].to_vec())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Record {
    topic: String,
    #[serde(flatten)]
    message: ChatMessageEvent,
}

/// Append-only JSON-lines history file shared by every topic, so history
/// survives restarts.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    // Serializes appends so concurrent writers never interleave partial lines.
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Opens (creating if needed) the history file at `path`.
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl MessageStore for FileStore {
    async fn append(&self, topic: &str, message: &ChatMessageEvent) -> StoreResult<()> {
        let mut line = serde_json::to_vec(&Record {
            topic: topic.to_string(),
            message: message.clone(),
        })?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    async fn recent(&self, topic: &str, count: usize) -> StoreResult<Vec<ChatMessageEvent>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let file = OpenOptions::new().read(true).open(&self.path).await?;
        let mut lines = BufReader::new(file).lines();
        let mut window = VecDeque::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let record: Record = match serde_json::from_str(&line) {
                Ok(record) => record,
                Err(error) => {
                    warn!(path = %self.path.display(), ?error, "skipping corrupt history line");
                    continue;
                }
            };
            if record.topic != topic {
                continue;
            }
            if window.len() == count {
                window.pop_front();
            }
            window.push_back(record.message);
        }

        Ok(window.into())
    }
}
