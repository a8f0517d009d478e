use std::pin::Pin;
use std::sync::Arc;

use anyhow::{bail, Result};
use async_stream::stream;
use async_trait::async_trait;
use futures_core::Stream;
use nudge_memory::{to_messages, ChatHistoryStore, ProfileStore};
use nudge_provider::{LlmMessage, LlmProvider, LlmRequest};
use tokio_stream::StreamExt;
use tracing::warn;

pub const EVENT_MESSAGE: &str = "message";
pub const EVENT_ANSWER: &str = "answer";
pub const EVENT_DONE: &str = "done";
pub const EVENT_INTERRUPT: &str = "interrupt";

/// One `(name, data)` pair emitted while a reply is generated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyEvent {
    pub name: String,
    pub data: String,
}

impl ReplyEvent {
    pub fn new(name: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }

    pub fn message(text: impl Into<String>) -> Self {
        Self::new(EVENT_MESSAGE, text)
    }

    pub fn done() -> Self {
        Self::new(EVENT_DONE, "")
    }
}

pub type ReplyStream = Pin<Box<dyn Stream<Item = Result<ReplyEvent>> + Send>>;

#[derive(Debug, Clone, Default)]
pub struct ReplyRequest {
    pub user_id: String,
    /// Extra system-side context, e.g. an injected trigger block.
    pub extra_context: Option<String>,
    /// The reply opens the conversation instead of answering a user turn.
    pub proactive: bool,
}

#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    async fn generate(&self, request: ReplyRequest) -> Result<ReplyStream>;
}

/// Concatenates `message`/`answer` payloads until `done` or `interrupt`.
///
/// A stream error after some text has arrived ends the reply with what was received.
pub async fn collect_reply(mut stream: ReplyStream) -> Result<String> {
    let mut text = String::new();
    while let Some(event) = stream.next().await {
        let event = match event {
            Ok(event) => event,
            Err(error) if !text.is_empty() => {
                warn!(%error, "reply stream broke off, keeping partial text");
                break;
            }
            Err(error) => return Err(error),
        };
        match event.name.as_str() {
            EVENT_MESSAGE | EVENT_ANSWER => text.push_str(&event.data),
            EVENT_DONE | EVENT_INTERRUPT => break,
            _ => {}
        }
    }
    Ok(text.trim().to_string())
}

const DEFAULT_PERSONA: &str = "You are a warm, upbeat health companion. You help the user with \
meals, glucose, medication and daily habits, keep answers short and conversational, and never \
lecture. Reply in the user's language.";

const PROACTIVE_OPENER: &str = "(The user has not said anything yet. Open the conversation \
yourself, naturally and briefly, based on the context above.)";

pub struct LlmReplyGenerator {
    provider: Arc<dyn LlmProvider>,
    profiles: ProfileStore,
    chats: Arc<ChatHistoryStore>,
    model: String,
    persona: String,
    history_limit: usize,
    max_tokens: u32,
}

impl LlmReplyGenerator {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        profiles: ProfileStore,
        chats: Arc<ChatHistoryStore>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            profiles,
            chats,
            model: model.into(),
            persona: DEFAULT_PERSONA.to_string(),
            history_limit: 20,
            max_tokens: 512,
        }
    }

    pub fn with_persona(mut self, persona: impl Into<String>) -> Self {
        self.persona = persona.into();
        self
    }

    async fn build_request(&self, request: &ReplyRequest) -> Result<LlmRequest> {
        let profile = match self.profiles.load(&request.user_id).await {
            Ok(profile) => profile,
            Err(error) => {
                warn!(user_id = %request.user_id, %error, "profile unavailable for reply");
                serde_json::json!({})
            }
        };
        let history = self
            .chats
            .load(&request.user_id, self.history_limit)
            .await?;

        let system = format!(
            "{}\n\n[PROFILE_JSON]\n{}\n[/PROFILE_JSON]",
            self.persona,
            serde_json::to_string(&profile)?
        );
        let (system, mut messages) =
            to_messages(&history, &system, request.extra_context.as_deref());
        let ends_with_user = messages.last().is_some_and(|m| m.role == "user");
        if request.proactive || !ends_with_user {
            messages.push(LlmMessage::user(PROACTIVE_OPENER));
        }

        Ok(LlmRequest {
            model: self.model.clone(),
            system: Some(system),
            messages,
            max_tokens: self.max_tokens,
            temperature: None,
        })
    }
}

#[async_trait]
impl ReplyGenerator for LlmReplyGenerator {
    async fn generate(&self, request: ReplyRequest) -> Result<ReplyStream> {
        if request.user_id.is_empty() {
            bail!("reply request has no user id");
        }
        let llm_request = self.build_request(&request).await?;
        let mut chunks = self.provider.stream(llm_request).await?;

        let stream = stream! {
            while let Some(chunk) = chunks.next().await {
                match chunk {
                    Ok(chunk) => {
                        if !chunk.delta.is_empty() {
                            yield Ok(ReplyEvent::message(chunk.delta));
                        }
                        if chunk.is_final {
                            break;
                        }
                    }
                    Err(error) => {
                        yield Err(error);
                        return;
                    }
                }
            }
            yield Ok(ReplyEvent::done());
        };
        Ok(Box::pin(stream))
    }
}
