use anyhow::Result;
use async_trait::async_trait;
use nudge_bus::SnapshotSource;
use nudge_memory::ProfileStore;
use serde_json::Value;

/// Hub snapshots read straight from the profile and schedule documents.
#[derive(Clone)]
pub struct StoreSnapshot {
    profiles: ProfileStore,
}

impl StoreSnapshot {
    pub fn new(profiles: ProfileStore) -> Self {
        Self { profiles }
    }
}

#[async_trait]
impl SnapshotSource for StoreSnapshot {
    async fn profile(&self, user_id: &str) -> Result<Value> {
        self.profiles.load(user_id).await
    }

    async fn schedule(&self, user_id: &str) -> Result<Option<Value>> {
        self.profiles.schedule(user_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nudge_bus::{BroadcastHub, HubConfig};
    use nudge_memory::{DocumentStore, FileDocumentStore, SCHEDULE_DOC};
    use nudge_schema::StateEvent;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn subscriber_snapshot_comes_from_documents() {
        let dir = tempfile::TempDir::new().unwrap();
        let docs = Arc::new(FileDocumentStore::new(dir.path()));
        docs.put("u1", SCHEDULE_DOC, &json!({"timezone": "UTC", "items": []}))
            .await
            .unwrap();
        let hub = BroadcastHub::new(
            HubConfig::default(),
            Arc::new(StoreSnapshot::new(ProfileStore::new(docs))),
        );

        let mut sub = hub.subscribe("u1").await.unwrap();
        match sub.recv().await.unwrap() {
            StateEvent::ProfileUpdate { profile, .. } => {
                assert_eq!(profile["basic"]["user_id"]["value"], "u1")
            }
            other => panic!("expected profile first, got {other:?}"),
        }
        match sub.recv().await.unwrap() {
            StateEvent::ScheduleUpdate { schedule, .. } => {
                assert_eq!(schedule.unwrap()["timezone"], "UTC")
            }
            other => panic!("expected schedule second, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn corrupt_profile_becomes_state_error_only_for_that_item() {
        let dir = tempfile::TempDir::new().unwrap();
        let user_dir = dir.path().join("users/u1");
        std::fs::create_dir_all(&user_dir).unwrap();
        std::fs::write(user_dir.join("profile.json"), "{oops").unwrap();
        let docs = Arc::new(FileDocumentStore::new(dir.path()));
        let hub = BroadcastHub::new(
            HubConfig::default(),
            Arc::new(StoreSnapshot::new(ProfileStore::new(docs))),
        );

        let mut sub = hub.subscribe("u1").await.unwrap();
        assert_eq!(sub.recv().await.unwrap().name(), StateEvent::STATE_ERROR);
        assert_eq!(
            sub.recv().await.unwrap(),
            StateEvent::ScheduleUpdate {
                user_id: "u1".into(),
                schedule: None
            }
        );
    }
}
