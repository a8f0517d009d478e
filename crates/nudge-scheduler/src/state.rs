use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use nudge_memory::DocumentStore;
use nudge_schema::RunState;
use tokio::sync::Mutex;
use tracing::warn;

pub const RUN_STATE_DOC: &str = "proactive_state";

/// Per-user [`RunState`] kept as a document next to the user's other records.
#[derive(Clone)]
pub struct RunStateStore {
    docs: Arc<dyn DocumentStore>,
    locks: Arc<parking_lot::Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl RunStateStore {
    pub fn new(docs: Arc<dyn DocumentStore>) -> Self {
        Self {
            docs,
            locks: Arc::default(),
        }
    }

    fn lock_for(&self, user_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .entry(user_id.to_string())
            .or_default()
            .clone()
    }

    /// A missing document is the default state; an unreadable shape is logged and replaced.
    pub async fn load(&self, user_id: &str) -> Result<RunState> {
        let Some(value) = self.docs.get(user_id, RUN_STATE_DOC).await? else {
            return Ok(RunState::default());
        };
        match serde_json::from_value(value) {
            Ok(state) => Ok(state),
            Err(error) => {
                warn!(user_id, %error, "malformed run state, starting from defaults");
                Ok(RunState::default())
            }
        }
    }

    pub async fn save(&self, user_id: &str, state: &RunState) -> Result<()> {
        let value = serde_json::to_value(state)?;
        self.docs
            .put(user_id, RUN_STATE_DOC, &value)
            .await
            .with_context(|| format!("failed to persist run state for {user_id}"))
    }

    /// Read-modify-write under a per-user lock.
    pub async fn update<F>(&self, user_id: &str, apply: F) -> Result<RunState>
    where
        F: FnOnce(&mut RunState),
    {
        let lock = self.lock_for(user_id);
        let _guard = lock.lock().await;
        let mut state = match self.load(user_id).await {
            Ok(state) => state,
            Err(error) => {
                warn!(user_id, %error, "run state unreadable, overwriting with defaults");
                RunState::default()
            }
        };
        apply(&mut state);
        self.save(user_id, &state).await?;
        Ok(state)
    }
}
