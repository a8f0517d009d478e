use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::RwLock;

use crate::validate_user_id;

/// Longest plain-text document kept when a `.md`/`.txt` file stands in for JSON.
pub const TEXT_SUMMARY_LIMIT: usize = 2000;

/// Key-value document storage keyed by user id and document name.
///
/// A missing document is `Ok(None)`, never an error.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, user_id: &str, doc: &str) -> Result<Option<Value>>;
    async fn put(&self, user_id: &str, doc: &str, value: &Value) -> Result<()>;
}

/// Stores documents as `<root>/users/<user_id>/<doc>.json`.
pub struct FileDocumentStore {
    users_dir: PathBuf,
}

impl FileDocumentStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            users_dir: data_dir.as_ref().join("users"),
        }
    }

    fn user_dir(&self, user_id: &str) -> Result<PathBuf> {
        validate_user_id(user_id)?;
        Ok(self.users_dir.join(user_id))
    }

    async fn read_text_fallback(&self, dir: &Path, doc: &str) -> Result<Option<Value>> {
        for ext in ["md", "txt"] {
            let path = dir.join(format!("{doc}.{ext}"));
            match tokio::fs::read_to_string(&path).await {
                Ok(text) => {
                    let summary: String = text.chars().take(TEXT_SUMMARY_LIMIT).collect();
                    return Ok(Some(json!({ "summary": summary })));
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(e).with_context(|| format!("failed to read {}", path.display()))
                }
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl DocumentStore for FileDocumentStore {
    async fn get(&self, user_id: &str, doc: &str) -> Result<Option<Value>> {
        let dir = self.user_dir(user_id)?;
        let path = dir.join(format!("{doc}.json"));
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return self.read_text_fallback(&dir, doc).await;
            }
            Err(e) => return Err(e).with_context(|| format!("failed to read {}", path.display())),
        };
        let value = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(Some(value))
    }

    async fn put(&self, user_id: &str, doc: &str, value: &Value) -> Result<()> {
        let dir = self.user_dir(user_id)?;
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create {}", dir.display()))?;

        let path = dir.join(format!("{doc}.json"));
        let tmp = dir.join(format!("{doc}.json.tmp"));
        let json = serde_json::to_string_pretty(value)?;
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("failed to replace {}", path.display()))?;
        Ok(())
    }
}

/// In-process store, handy for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryDocumentStore {
    docs: RwLock<HashMap<(String, String), Value>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get(&self, user_id: &str, doc: &str) -> Result<Option<Value>> {
        let docs = self.docs.read().await;
        Ok(docs.get(&(user_id.to_string(), doc.to_string())).cloned())
    }

    async fn put(&self, user_id: &str, doc: &str, value: &Value) -> Result<()> {
        let mut docs = self.docs.write().await;
        docs.insert((user_id.to_string(), doc.to_string()), value.clone());
        Ok(())
    }
}
