use std::sync::Arc;

use async_stream::stream;
use chrono::Utc;
use nudge_bus::BroadcastHub;
use nudge_memory::ChatHistoryStore;
use nudge_schema::{ChatRecord, ChatRole, RecordMeta, SOURCE_REPLY_GENERATOR, SOURCE_USER};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tracing::{info, warn};

use crate::jobs::JobPool;
use crate::refresh::{submit_refresh, ProfileRefresher};
use crate::reply::{
    collect_reply, ReplyGenerator, ReplyRequest, ReplyStream, EVENT_ANSWER, EVENT_DONE,
    EVENT_INTERRUPT, EVENT_MESSAGE,
};
use crate::topic_pool::TopicPool;

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("message text is empty")]
    EmptyMessage,
    #[error("reply generation failed: {0:#}")]
    Generation(anyhow::Error),
    #[error("chat storage failed: {0:#}")]
    Storage(anyhow::Error),
}

const STREAM_BUFFER: usize = 32;

/// A user-initiated turn: record the message, answer it, publish both.
#[derive(Clone)]
pub struct PassiveChat {
    chats: Arc<ChatHistoryStore>,
    hub: BroadcastHub,
    generator: Arc<dyn ReplyGenerator>,
    pool: Arc<TopicPool>,
    jobs: Arc<JobPool>,
    refresher: Arc<dyn ProfileRefresher>,
}

impl PassiveChat {
    pub fn new(
        chats: Arc<ChatHistoryStore>,
        hub: BroadcastHub,
        generator: Arc<dyn ReplyGenerator>,
        pool: Arc<TopicPool>,
        jobs: Arc<JobPool>,
        refresher: Arc<dyn ProfileRefresher>,
    ) -> Self {
        Self {
            chats,
            hub,
            generator,
            pool,
            jobs,
            refresher,
        }
    }

    /// Returns the assistant reply, or `None` when the generator produced no text.
    pub async fn send(&self, user_id: &str, text: &str) -> Result<Option<String>, ChatError> {
        let events = self.begin(user_id, text).await?;
        let reply = collect_reply(events).await.map_err(ChatError::Generation)?;
        self.finish(user_id, &reply).await
    }

    /// Streams reply events as they are generated.
    ///
    /// Generation runs on its own task and the reply is recorded when it ends, even if the
    /// returned stream is dropped first. The stream closes only after the reply is stored.
    pub async fn stream(&self, user_id: &str, text: &str) -> Result<ReplyStream, ChatError> {
        let mut events = self.begin(user_id, text).await?;
        let (tx, mut rx) = mpsc::channel(STREAM_BUFFER);
        let chat = self.clone();
        let user_id = user_id.to_string();

        tokio::spawn(async move {
            let mut reply = String::new();
            while let Some(event) = events.next().await {
                let event = match event {
                    Ok(event) => event,
                    Err(error) => {
                        warn!(user_id, error = %format!("{error:#}"), "passive reply stream failed");
                        let _ = tx.send(Err(error)).await;
                        break;
                    }
                };
                let name = event.name.as_str();
                if matches!(name, EVENT_MESSAGE | EVENT_ANSWER) {
                    reply.push_str(&event.data);
                }
                let last = matches!(name, EVENT_DONE | EVENT_INTERRUPT);
                let _ = tx.send(Ok(event)).await;
                if last {
                    break;
                }
            }
            if let Err(error) = chat.finish(&user_id, reply.trim()).await {
                warn!(user_id, %error, "streamed reply not recorded");
            }
            drop(tx);
        });

        Ok(Box::pin(stream! {
            while let Some(item) = rx.recv().await {
                yield item;
            }
        }))
    }

    /// Records and publishes the user turn, then starts generation.
    async fn begin(&self, user_id: &str, text: &str) -> Result<ReplyStream, ChatError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::EmptyMessage);
        }

        let record = ChatRecord::new(ChatRole::User, text, Utc::now())
            .with_source(SOURCE_USER)
            .with_meta(RecordMeta::passive());
        self.chats
            .append(user_id, &record)
            .await
            .map_err(ChatError::Storage)?;
        self.hub
            .broadcast_chat(user_id, ChatRole::User, text, RecordMeta::passive());

        let brief = self.pool.snapshot(user_id).await.brief;
        let request = ReplyRequest {
            user_id: user_id.to_string(),
            extra_context: (!brief.is_empty()).then(|| format!("[USER_DATA]\n{brief}")),
            proactive: false,
        };
        self.generator
            .generate(request)
            .await
            .map_err(ChatError::Generation)
    }

    async fn finish(&self, user_id: &str, reply: &str) -> Result<Option<String>, ChatError> {
        if reply.is_empty() {
            info!(user_id, "reply generator returned no text, nothing recorded");
            return Ok(None);
        }

        let record = ChatRecord::new(ChatRole::Assistant, reply, Utc::now())
            .with_source(SOURCE_REPLY_GENERATOR)
            .with_meta(RecordMeta::passive());
        self.chats
            .append(user_id, &record)
            .await
            .map_err(ChatError::Storage)?;
        self.hub
            .broadcast_chat(user_id, ChatRole::Assistant, reply, RecordMeta::passive());
        submit_refresh(&self.jobs, &self.refresher, user_id);

        Ok(Some(reply.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobPoolConfig;
    use crate::refresh::BroadcastProfileRefresher;
    use crate::reply::ReplyEvent;
    use crate::snapshot::StoreSnapshot;
    use anyhow::Result;
    use async_trait::async_trait;
    use nudge_bus::HubConfig;
    use nudge_memory::{MemoryDocumentStore, ProfileStore};
    use nudge_schema::{ChatMode, StateEvent};

    struct Fixed(Vec<ReplyEvent>);

    #[async_trait]
    impl ReplyGenerator for Fixed {
        async fn generate(&self, _request: ReplyRequest) -> Result<ReplyStream> {
            Ok(Box::pin(tokio_stream::iter(
                self.0.clone().into_iter().map(Ok::<_, anyhow::Error>),
            )))
        }
    }

    fn passive_chat(dir: &tempfile::TempDir, reply: Vec<ReplyEvent>) -> (PassiveChat, BroadcastHub) {
        let docs = Arc::new(MemoryDocumentStore::new());
        let hub = BroadcastHub::new(
            HubConfig::default(),
            Arc::new(StoreSnapshot::new(ProfileStore::new(docs.clone()))),
        );
        let chat = PassiveChat::new(
            Arc::new(ChatHistoryStore::new(dir.path())),
            hub.clone(),
            Arc::new(Fixed(reply)),
            Arc::new(TopicPool::new(docs)),
            Arc::new(JobPool::new(JobPoolConfig::default())),
            Arc::new(BroadcastProfileRefresher::new(hub.clone())),
        );
        (chat, hub)
    }

    #[tokio::test]
    async fn turn_records_and_publishes_both_sides() {
        let dir = tempfile::TempDir::new().unwrap();
        let (chat, hub) = passive_chat(
            &dir,
            vec![ReplyEvent::message("Hi! "), ReplyEvent::message("Lunch?"), ReplyEvent::done()],
        );
        let mut sub = hub.attach("u1").unwrap();

        let reply = chat.send("u1", "  hello  ").await.unwrap();
        assert_eq!(reply.as_deref(), Some("Hi! Lunch?"));

        let history = chat.chats.load("u1", 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "hello");
        assert_eq!(history[1].role, ChatRole::Assistant);
        assert_eq!(history[1].meta.mode, Some(ChatMode::Passive));

        match sub.recv().await.unwrap() {
            StateEvent::ChatMessage(message) => {
                assert_eq!(message.role, ChatRole::User);
                assert_eq!(message.text, "hello");
            }
            other => panic!("unexpected {other:?}"),
        }
        match sub.recv().await.unwrap() {
            StateEvent::ChatMessage(message) => assert_eq!(message.text, "Hi! Lunch?"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_reply_records_only_the_user_turn() {
        let dir = tempfile::TempDir::new().unwrap();
        let (chat, _hub) = passive_chat(&dir, vec![ReplyEvent::done()]);

        assert_eq!(chat.send("u1", "anyone there?").await.unwrap(), None);
        let history = chat.chats.load("u1", 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, ChatRole::User);
    }

    #[tokio::test]
    async fn streamed_turn_forwards_events_and_records_reply() {
        let dir = tempfile::TempDir::new().unwrap();
        let (chat, hub) = passive_chat(
            &dir,
            vec![
                ReplyEvent::message("Try "),
                ReplyEvent::new(EVENT_ANSWER, "oats"),
                ReplyEvent::done(),
                ReplyEvent::message("after done"),
            ],
        );
        let mut sub = hub.attach("u1").unwrap();

        let events = chat.stream("u1", "breakfast idea?").await.unwrap();
        let names: Vec<String> = events.map(|e| e.unwrap().name).collect().await;
        assert_eq!(names, vec![EVENT_MESSAGE, EVENT_ANSWER, EVENT_DONE]);

        let history = chat.chats.load("u1", 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].content, "Try oats");
        sub.recv().await.unwrap();
        match sub.recv().await.unwrap() {
            StateEvent::ChatMessage(message) => assert_eq!(message.text, "Try oats"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn dropped_stream_still_records_reply() {
        let dir = tempfile::TempDir::new().unwrap();
        let (chat, hub) = passive_chat(
            &dir,
            vec![ReplyEvent::message("kept"), ReplyEvent::done()],
        );
        let mut sub = hub.attach("u1").unwrap();

        drop(chat.stream("u1", "hi").await.unwrap());
        sub.recv().await.unwrap();
        let reply = tokio::time::timeout(std::time::Duration::from_secs(2), sub.recv())
            .await
            .unwrap();
        match reply.unwrap() {
            StateEvent::ChatMessage(message) => assert_eq!(message.text, "kept"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(chat.chats.load("u1", 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn blank_message_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let (chat, _hub) = passive_chat(&dir, vec![]);
        assert!(matches!(
            chat.send("u1", "   ").await,
            Err(ChatError::EmptyMessage)
        ));
    }
}
