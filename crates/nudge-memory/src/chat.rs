use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use nudge_provider::LlmMessage;
use nudge_schema::{ChatRecord, ChatRole};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

use crate::validate_user_id;

pub const DEFAULT_HISTORY_LIMIT: usize = 200;

/// Append-only JSONL chat history, one file per user.
pub struct ChatHistoryStore {
    dir: PathBuf,
    write_locks: parking_lot::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ChatHistoryStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            dir: data_dir.as_ref().join("chat_history"),
            write_locks: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    fn path(&self, user_id: &str) -> Result<PathBuf> {
        validate_user_id(user_id)?;
        Ok(self.dir.join(format!("{user_id}.jsonl")))
    }

    fn write_lock(&self, user_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.write_locks.lock();
        locks.entry(user_id.to_string()).or_default().clone()
    }

    pub async fn append(&self, user_id: &str, record: &ChatRecord) -> Result<()> {
        let path = self.path(user_id)?;
        let lock = self.write_lock(user_id);
        let _guard = lock.lock().await;

        tokio::fs::create_dir_all(&self.dir).await?;
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("failed to open {}", path.display()))?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// The most recent `limit` records in chronological order. Unreadable lines are skipped.
    pub async fn load(&self, user_id: &str, limit: usize) -> Result<Vec<ChatRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let path = self.path(user_id)?;
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("failed to read {}", path.display())),
        };

        let mut records = Vec::new();
        for (index, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ChatRecord>(line) {
                Ok(record) => records.push(record),
                Err(error) => warn!(user_id, line = index + 1, %error, "failed to parse chat record line"),
            }
        }

        if records.len() > limit {
            records = records.split_off(records.len() - limit);
        }
        Ok(records)
    }

    /// Records shown in the UI: visible ones only.
    pub async fn visible(&self, user_id: &str, limit: usize) -> Result<Vec<ChatRecord>> {
        let records = self.load(user_id, DEFAULT_HISTORY_LIMIT.max(limit)).await?;
        let mut visible: Vec<ChatRecord> = records.into_iter().filter(|r| r.visible).collect();
        if visible.len() > limit {
            visible = visible.split_off(visible.len() - limit);
        }
        Ok(visible)
    }
}

/// Turns stored history into provider messages.
///
/// Injected context stays in place as system turns. `extra_context`, when given, is appended
/// to the system prompt.
pub fn to_messages(
    history: &[ChatRecord],
    system: &str,
    extra_context: Option<&str>,
) -> (String, Vec<LlmMessage>) {
    let system = match extra_context.map(str::trim).filter(|c| !c.is_empty()) {
        Some(extra) => format!("{system}\n\n{extra}"),
        None => system.to_string(),
    };
    let messages = history
        .iter()
        .filter_map(|record| match record.role {
            ChatRole::User => Some(LlmMessage::user(record.content.clone())),
            ChatRole::Assistant => Some(LlmMessage::assistant(record.content.clone())),
            ChatRole::SystemInject => Some(LlmMessage::system(record.content.clone())),
        })
        .collect();
    (system, messages)
}
