//! Uniform chat / vision / streaming / key-validation over LLM vendors.
//!
//! Each provider exposes three model tiers (reasoning, utility, deep
//! thinking) selected per request by the caller. Streaming responses flow
//! through an mpsc channel of [`StreamEvent`]s terminated by `Done`.

pub mod anthropic;
pub mod google;
pub mod openai;
pub mod sse;
pub mod stream;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub use stream::StreamEvent;

/// Per-provider request deadline.
pub const REQUEST_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Request to an LLM provider. `model` selects the tier explicitly.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub system: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, system: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            system: system.into(),
            messages,
            max_tokens: 4096,
        }
    }
}

/// Non-streaming response with token usage.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub model: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid API key: {0}")]
    InvalidKey(String),

    #[error("Unknown provider: {0}")]
    UnknownProvider(String),
}

/// Common interface for all LLM providers (Anthropic, OpenAI, Google).
#[async_trait]
pub trait AiProvider: Send + Sync {
    /// Provider name for logging and error messages.
    fn name(&self) -> &str;

    fn reasoning_model(&self) -> &str;
    fn utility_model(&self) -> &str;
    fn deep_thinking_model(&self) -> &str;

    /// Whether the vendor ships a native web-search tool (informational).
    fn supports_web_search(&self) -> bool {
        false
    }

    /// Send a non-streaming chat request, wait for the full response.
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError>;

    /// Stream response events through a channel.
    /// Default: falls back to non-streaming chat, emits Chunk + Done.
    async fn chat_stream(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        let resp = self.chat(req).await?;
        let _ = tx
            .send(StreamEvent::Chunk {
                text: resp.content,
            })
            .await;
        let _ = tx
            .send(StreamEvent::Done {
                model: resp.model,
                tokens_in: resp.tokens_in,
                tokens_out: resp.tokens_out,
            })
            .await;
        Ok(())
    }

    /// Chat with an attached image (vision models).
    async fn chat_with_vision(
        &self,
        req: &ChatRequest,
        image_bytes: &[u8],
    ) -> Result<ChatResponse, ProviderError>;

    /// Cheap round trip that proves the key works. Errors on rejection.
    async fn validate_key(&self) -> Result<bool, ProviderError>;
}

/// Model ids for the three tiers; unset tiers fall back to provider defaults.
#[derive(Debug, Clone, Default)]
pub struct ModelSelection {
    pub reasoning: Option<String>,
    pub utility: Option<String>,
    pub deep_thinking: Option<String>,
}

/// Instantiate a provider by id ("anthropic", "openai", "google").
pub fn create_provider(
    provider_id: &str,
    api_key: String,
    models: ModelSelection,
) -> Result<Box<dyn AiProvider>, ProviderError> {
    match provider_id.trim().to_lowercase().as_str() {
        "anthropic" => Ok(Box::new(anthropic::AnthropicProvider::new(api_key, models))),
        "openai" => Ok(Box::new(openai::OpenAiProvider::new(api_key, models))),
        "google" | "gemini" => Ok(Box::new(google::GoogleProvider::new(api_key, models))),
        other => Err(ProviderError::UnknownProvider(other.to_string())),
    }
}

/// Sniff the image media type from magic bytes (defaults to PNG).
pub(crate) fn detect_media_type(image_bytes: &[u8]) -> &'static str {
    if image_bytes.len() >= 3 && image_bytes[..3] == [0xff, 0xd8, 0xff] {
        "image/jpeg"
    } else if image_bytes.len() >= 4 && &image_bytes[..4] == b"RIFF" {
        "image/webp"
    } else {
        "image/png"
    }
}

pub(crate) fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
        .build()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_rejects_unknown_ids() {
        let err = create_provider("acme", "key".to_string(), ModelSelection::default());
        assert!(matches!(err, Err(ProviderError::UnknownProvider(_))));
    }

    #[test]
    fn media_type_sniffing() {
        assert_eq!(detect_media_type(&[0xff, 0xd8, 0xff, 0x00]), "image/jpeg");
        assert_eq!(detect_media_type(b"RIFF....WEBP"), "image/webp");
        assert_eq!(detect_media_type(&[0x89, b'P', b'N', b'G']), "image/png");
        assert_eq!(detect_media_type(&[]), "image/png");
    }

    #[tokio::test]
    async fn default_stream_falls_back_to_chat() {
        struct Fixed;

        #[async_trait]
        impl AiProvider for Fixed {
            fn name(&self) -> &str {
                "fixed"
            }
            fn reasoning_model(&self) -> &str {
                "r"
            }
            fn utility_model(&self) -> &str {
                "u"
            }
            fn deep_thinking_model(&self) -> &str {
                "d"
            }
            async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
                Ok(ChatResponse {
                    content: "hello".to_string(),
                    model: req.model.clone(),
                    tokens_in: 3,
                    tokens_out: 5,
                })
            }
            async fn chat_with_vision(
                &self,
                req: &ChatRequest,
                _image: &[u8],
            ) -> Result<ChatResponse, ProviderError> {
                self.chat(req).await
            }
            async fn validate_key(&self) -> Result<bool, ProviderError> {
                Ok(true)
            }
        }

        let (tx, mut rx) = mpsc::channel(8);
        let req = ChatRequest::new("m", "", vec![ChatMessage::user("hi")]);
        Fixed.chat_stream(&req, tx).await.unwrap();

        match rx.recv().await.unwrap() {
            StreamEvent::Chunk { text } => assert_eq!(text, "hello"),
            other => panic!("expected chunk, got {other:?}"),
        }
        match rx.recv().await.unwrap() {
            StreamEvent::Done {
                tokens_in,
                tokens_out,
                ..
            } => {
                assert_eq!(tokens_in, 3);
                assert_eq!(tokens_out, 5);
            }
            other => panic!("expected done, got {other:?}"),
        }
    }
}
