mod openai;
mod types;

pub use openai::*;
pub use types::*;

use std::pin::Pin;

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures_core::Stream;

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn chat(&self, request: LlmRequest) -> Result<LlmResponse>;

    async fn stream(&self, _request: LlmRequest) -> Result<ChunkStream> {
        bail!("streaming not supported by this provider")
    }
}

/// One-shot text completion: a system prompt, a user prompt, trimmed text back.
///
/// An empty answer is reported as an error so callers can treat it like any other failure.
pub async fn complete(
    provider: &dyn LlmProvider,
    model: &str,
    system: &str,
    user: &str,
    max_tokens: u32,
    temperature: f32,
) -> Result<String> {
    let request = LlmRequest {
        model: model.to_string(),
        system: Some(system.to_string()).filter(|s| !s.is_empty()),
        messages: vec![LlmMessage::user(user)],
        max_tokens,
        temperature: Some(temperature),
    };
    let response = provider.chat(request).await?;
    let text = response.text.trim();
    if text.is_empty() {
        bail!("completion returned no text");
    }
    Ok(text.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recording {
        answer: String,
        seen: Mutex<Vec<LlmRequest>>,
    }

    #[async_trait]
    impl LlmProvider for Recording {
        async fn chat(&self, request: LlmRequest) -> Result<LlmResponse> {
            self.seen.lock().unwrap().push(request);
            Ok(LlmResponse {
                text: self.answer.clone(),
                input_tokens: None,
                output_tokens: None,
                stop_reason: None,
            })
        }
    }

    #[tokio::test]
    async fn complete_forwards_limits_and_trims() {
        let provider = Recording {
            answer: "  {\"trigger\": true}\n".into(),
            seen: Mutex::new(Vec::new()),
        };
        let text = complete(&provider, "m", "sys", "pick one", 300, 0.5)
            .await
            .unwrap();
        assert_eq!(text, "{\"trigger\": true}");

        let seen = provider.seen.lock().unwrap();
        assert_eq!(seen[0].max_tokens, 300);
        assert_eq!(seen[0].temperature, Some(0.5));
        assert_eq!(seen[0].system.as_deref(), Some("sys"));
    }

    #[tokio::test]
    async fn blank_completion_is_an_error() {
        let provider = Recording {
            answer: "   ".into(),
            seen: Mutex::new(Vec::new()),
        };
        assert!(complete(&provider, "m", "", "u", 10, 0.0).await.is_err());
    }

    #[tokio::test]
    async fn default_stream_is_unsupported() {
        let provider = Recording {
            answer: String::new(),
            seen: Mutex::new(Vec::new()),
        };
        let req = LlmRequest::simple("m".into(), None, "hi".into());
        assert!(provider.stream(req).await.is_err());
    }
}
