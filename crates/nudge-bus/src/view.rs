use futures_core::Stream;
use nudge_schema::StateEvent;
use serde_json::{json, Value};

use crate::{BroadcastHub, HubError, Subscription, WireEvent};

/// Frames of the proactive-only stream consumed by lightweight clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProactiveFrame {
    Delta { delta: String },
    Done,
}

impl WireEvent for ProactiveFrame {
    fn name(&self) -> &str {
        match self {
            ProactiveFrame::Delta { .. } => "proactive_delta",
            ProactiveFrame::Done => "proactive_done",
        }
    }

    fn data(&self) -> Value {
        match self {
            ProactiveFrame::Delta { delta } => json!({ "delta": delta }),
            ProactiveFrame::Done => json!({}),
        }
    }
}

/// Filters a user's raw hub stream down to proactive assistant text.
///
/// Registered on the hub like any other subscriber, without the profile/schedule snapshot.
pub struct ProactiveView {
    subscription: Subscription,
    pending_done: bool,
}

impl ProactiveView {
    pub fn new(hub: &BroadcastHub, user_id: &str) -> Result<Self, HubError> {
        Ok(Self {
            subscription: hub.attach(user_id)?,
            pending_done: false,
        })
    }

    pub async fn next(&mut self) -> Option<ProactiveFrame> {
        if self.pending_done {
            self.pending_done = false;
            return Some(ProactiveFrame::Done);
        }
        loop {
            let event = self.subscription.recv().await?;
            if let Some(delta) = proactive_text(&event) {
                self.pending_done = true;
                return Some(ProactiveFrame::Delta { delta });
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = ProactiveFrame> + Send {
        async_stream::stream! {
            let mut view = self;
            while let Some(frame) = view.next().await {
                yield frame;
            }
        }
    }
}

fn proactive_text(event: &StateEvent) -> Option<String> {
    match event {
        StateEvent::ChatMessage(message)
            if message.meta.is_proactive() && !message.text.trim().is_empty() =>
        {
            Some(message.text.clone())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{HubConfig, SnapshotSource, Target};
    use anyhow::Result;
    use async_trait::async_trait;
    use nudge_schema::{ChatMessage, ChatMode, ChatRole, RecordMeta};
    use std::sync::Arc;
    use tokio::time::{timeout, Duration};
    use tokio_stream::StreamExt;

    struct NoState;

    #[async_trait]
    impl SnapshotSource for NoState {
        async fn profile(&self, _user_id: &str) -> Result<Value> {
            Ok(json!({}))
        }

        async fn schedule(&self, _user_id: &str) -> Result<Option<Value>> {
            Ok(None)
        }
    }

    fn message(text: &str, mode: Option<ChatMode>) -> StateEvent {
        StateEvent::ChatMessage(ChatMessage {
            user_id: "u1".into(),
            role: ChatRole::Assistant,
            text: text.into(),
            meta: RecordMeta {
                mode,
                ..RecordMeta::default()
            },
        })
    }

    #[tokio::test]
    async fn only_proactive_text_is_forwarded_as_delta_done_pairs() {
        let hub = BroadcastHub::new(HubConfig::default(), Arc::new(NoState));
        let view = ProactiveView::new(&hub, "u1").unwrap();

        hub.publish(message("passive reply", Some(ChatMode::Passive)), Target::user("u1"));
        hub.publish(message("   ", Some(ChatMode::Proactive)), Target::user("u1"));
        hub.publish(
            StateEvent::ProfileUpdate {
                user_id: "u1".into(),
                profile: json!({}),
            },
            Target::user("u1"),
        );
        hub.publish(message("time for water", Some(ChatMode::Proactive)), Target::user("u1"));
        hub.close();

        let frames: Vec<ProactiveFrame> = timeout(
            Duration::from_millis(200),
            view.into_stream().collect::<Vec<_>>(),
        )
        .await
        .unwrap();
        assert_eq!(
            frames,
            vec![
                ProactiveFrame::Delta {
                    delta: "time for water".into()
                },
                ProactiveFrame::Done,
            ]
        );
    }

    #[test]
    fn frames_encode_as_server_sent_events() {
        let delta = ProactiveFrame::Delta { delta: "hi".into() };
        assert_eq!(
            delta.to_sse_frame(),
            "event: proactive_delta\ndata: {\"delta\":\"hi\"}\n\n"
        );
        assert_eq!(
            ProactiveFrame::Done.to_sse_frame(),
            "event: proactive_done\ndata: {}\n\n"
        );
    }
}
