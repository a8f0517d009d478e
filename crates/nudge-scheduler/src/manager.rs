use std::collections::HashMap;

use anyhow::Result;
use nudge_memory::validate_user_id;
use parking_lot::Mutex;
use tracing::info;

use crate::{ProactiveConfig, ProactiveScheduler, SchedulerDeps, SchedulerHandle};

/// At most one running scheduler per user.
pub struct SchedulerManager {
    config: ProactiveConfig,
    deps: SchedulerDeps,
    handles: Mutex<HashMap<String, SchedulerHandle>>,
}

impl SchedulerManager {
    pub fn new(config: ProactiveConfig, deps: SchedulerDeps) -> Self {
        Self {
            config,
            deps,
            handles: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ProactiveConfig {
        &self.config
    }

    /// A scheduler that is not registered with the manager, for one-off ticks.
    pub fn scheduler(&self, user_id: &str) -> ProactiveScheduler {
        ProactiveScheduler::new(user_id, self.config.clone(), self.deps.clone())
    }

    /// Starts the user's loop; returns `false` when it was already running.
    pub fn start(&self, user_id: &str) -> Result<bool> {
        validate_user_id(user_id)?;
        let mut handles = self.handles.lock();
        if let Some(handle) = handles.get(user_id) {
            if !handle.is_finished() {
                return Ok(false);
            }
        }
        let handle = self.scheduler(user_id).spawn();
        handles.insert(user_id.to_string(), handle);
        info!(user_id, "proactive scheduling started");
        Ok(true)
    }

    pub fn start_configured(&self) -> Result<usize> {
        let mut started = 0;
        for user_id in &self.config.users {
            if self.start(user_id)? {
                started += 1;
            }
        }
        Ok(started)
    }

    pub async fn stop(&self, user_id: &str) -> bool {
        let handle = self.handles.lock().remove(user_id);
        match handle {
            Some(handle) => {
                handle.stop().await;
                true
            }
            None => false,
        }
    }

    pub async fn stop_all(&self) {
        let handles: Vec<SchedulerHandle> = self.handles.lock().drain().map(|(_, h)| h).collect();
        for handle in handles {
            handle.stop().await;
        }
    }

    pub fn running(&self) -> Vec<String> {
        let mut users: Vec<String> = self
            .handles
            .lock()
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .map(|(user_id, _)| user_id.clone())
            .collect();
        users.sort();
        users
    }
}
