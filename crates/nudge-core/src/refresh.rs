use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use nudge_bus::BroadcastHub;
use tracing::{debug, warn};

use crate::jobs::{JobPool, JobTicket};

/// Re-publishes a user's profile state after something may have changed it.
#[async_trait]
pub trait ProfileRefresher: Send + Sync {
    async fn refresh(&self, user_id: &str) -> Result<()>;
}

pub struct BroadcastProfileRefresher {
    hub: BroadcastHub,
}

impl BroadcastProfileRefresher {
    pub fn new(hub: BroadcastHub) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl ProfileRefresher for BroadcastProfileRefresher {
    async fn refresh(&self, user_id: &str) -> Result<()> {
        let profile = self.hub.broadcast_profile(user_id).await;
        let schedule = self.hub.broadcast_schedule(user_id).await;
        debug!(user_id, profile, schedule, "profile refresh published");
        Ok(())
    }
}

/// Queues a refresh on `jobs`. A full or closed pool only costs this refresh.
pub fn submit_refresh(
    jobs: &JobPool,
    refresher: &Arc<dyn ProfileRefresher>,
    user_id: &str,
) -> Option<JobTicket> {
    let refresher = Arc::clone(refresher);
    let user = user_id.to_string();
    match jobs.submit(format!("profile-refresh:{user_id}"), async move {
        refresher.refresh(&user).await
    }) {
        Ok(ticket) => Some(ticket),
        Err(error) => {
            warn!(user_id, %error, "profile refresh not scheduled");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobOutcome, JobPoolConfig};
    use crate::snapshot::StoreSnapshot;
    use nudge_bus::HubConfig;
    use nudge_memory::{MemoryDocumentStore, ProfileStore};
    use nudge_schema::StateEvent;

    #[tokio::test]
    async fn refresh_job_publishes_profile_then_schedule() {
        let profiles = ProfileStore::new(Arc::new(MemoryDocumentStore::new()));
        let hub = BroadcastHub::new(HubConfig::default(), Arc::new(StoreSnapshot::new(profiles)));
        let mut sub = hub.attach("u1").unwrap();
        let refresher: Arc<dyn ProfileRefresher> =
            Arc::new(BroadcastProfileRefresher::new(hub.clone()));
        let jobs = JobPool::new(JobPoolConfig::default());

        let ticket = submit_refresh(&jobs, &refresher, "u1").unwrap();
        assert_eq!(ticket.wait().await, JobOutcome::Succeeded);

        assert_eq!(sub.recv().await.unwrap().name(), StateEvent::PROFILE_UPDATE);
        assert_eq!(sub.recv().await.unwrap().name(), StateEvent::SCHEDULE_UPDATE);
    }

    #[tokio::test]
    async fn closed_pool_skips_refresh() {
        let profiles = ProfileStore::new(Arc::new(MemoryDocumentStore::new()));
        let hub = BroadcastHub::new(HubConfig::default(), Arc::new(StoreSnapshot::new(profiles)));
        let refresher: Arc<dyn ProfileRefresher> = Arc::new(BroadcastProfileRefresher::new(hub));
        let jobs = JobPool::new(JobPoolConfig::default());
        jobs.shutdown().await;

        assert!(submit_refresh(&jobs, &refresher, "u1").is_none());
    }
}
