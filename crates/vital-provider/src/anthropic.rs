use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::sse::{parse_sse_line, LineBuffer, SseParsed};
use crate::stream::StreamEvent;
use crate::{
    detect_media_type, http_client, AiProvider, ChatRequest, ChatResponse, ModelSelection,
    ProviderError, Role,
};

const API_VERSION: &str = "2023-06-01";
const DEFAULT_REASONING_MODEL: &str = "claude-sonnet-4-20250514";
const DEFAULT_UTILITY_MODEL: &str = "claude-haiku-4-5-20251001";

pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    reasoning_model: String,
    utility_model: String,
    deep_thinking_model: String,
}

impl AnthropicProvider {
    pub fn new(api_key: String, models: ModelSelection) -> Self {
        let reasoning = models
            .reasoning
            .unwrap_or_else(|| DEFAULT_REASONING_MODEL.to_string());
        Self {
            client: http_client(),
            api_key,
            base_url: "https://api.anthropic.com".to_string(),
            utility_model: models
                .utility
                .unwrap_or_else(|| DEFAULT_UTILITY_MODEL.to_string()),
            deep_thinking_model: models.deep_thinking.unwrap_or_else(|| reasoning.clone()),
            reasoning_model: reasoning,
        }
    }

    fn request(&self, body: &serde_json::Value) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(body)
    }

    fn build_body(&self, req: &ChatRequest, stream: bool) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = req
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| serde_json::json!({ "role": m.role.as_str(), "content": m.content }))
            .collect();
        let mut body = serde_json::json!({
            "model": req.model,
            "max_tokens": req.max_tokens,
            "messages": messages,
            "stream": stream,
        });
        if !req.system.is_empty() {
            body["system"] = serde_json::json!(req.system);
        }
        body
    }

    async fn post_non_stream(&self, body: serde_json::Value) -> Result<ChatResponse, ProviderError> {
        let resp = self.request(&body).send().await?;
        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "anthropic api error");
            return Err(ProviderError::Api {
                status,
                message: text,
            });
        }
        let api: ApiResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;
        let content = api
            .content
            .into_iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text),
                ContentBlock::Unknown => None,
            })
            .collect::<Vec<_>>()
            .join("");
        Ok(ChatResponse {
            content,
            model: api.model,
            tokens_in: api.usage.input_tokens,
            tokens_out: api.usage.output_tokens,
        })
    }
}

#[async_trait]
impl AiProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn reasoning_model(&self) -> &str {
        &self.reasoning_model
    }

    fn utility_model(&self) -> &str {
        &self.utility_model
    }

    fn deep_thinking_model(&self) -> &str {
        &self.deep_thinking_model
    }

    fn supports_web_search(&self) -> bool {
        true
    }

    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        debug!(model = %req.model, "anthropic chat request");
        self.post_non_stream(self.build_body(req, false)).await
    }

    async fn chat_stream(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        debug!(model = %req.model, "anthropic streaming request");
        let body = self.build_body(req, true);
        let resp = self.request(&body).send().await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "anthropic streaming api error");
            return Err(ProviderError::Api {
                status,
                message: text,
            });
        }

        process_stream(resp, req.model.clone(), tx).await;
        Ok(())
    }

    async fn chat_with_vision(
        &self,
        req: &ChatRequest,
        image_bytes: &[u8],
    ) -> Result<ChatResponse, ProviderError> {
        let media_type = detect_media_type(image_bytes);
        let image_block = serde_json::json!({
            "type": "image",
            "source": {
                "type": "base64",
                "media_type": media_type,
                "data": B64.encode(image_bytes),
            },
        });

        // Attach the image to the last user turn.
        let mut messages: Vec<serde_json::Value> = Vec::new();
        for m in req.messages.iter().filter(|m| m.role != Role::System) {
            if m.role == Role::User {
                messages.push(serde_json::json!({
                    "role": "user",
                    "content": [image_block.clone(), { "type": "text", "text": m.content }],
                }));
            } else {
                messages.push(serde_json::json!({ "role": m.role.as_str(), "content": m.content }));
            }
        }

        let mut body = serde_json::json!({
            "model": req.model,
            "max_tokens": req.max_tokens,
            "messages": messages,
            "stream": false,
        });
        if !req.system.is_empty() {
            body["system"] = serde_json::json!(req.system);
        }
        self.post_non_stream(body).await
    }

    async fn validate_key(&self) -> Result<bool, ProviderError> {
        let body = serde_json::json!({
            "model": self.utility_model,
            "max_tokens": 10,
            "messages": [{ "role": "user", "content": "Hi" }],
        });
        let resp = self.request(&body).send().await?;
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ProviderError::InvalidKey(text));
        }
        Ok(true)
    }
}

/// Parse the Anthropic SSE response and forward StreamEvents.
async fn process_stream(
    resp: reqwest::Response,
    fallback_model: String,
    tx: mpsc::Sender<StreamEvent>,
) {
    let mut current_event = String::new();
    let mut model = fallback_model;
    let mut tokens_in: u32 = 0;
    let mut tokens_out: u32 = 0;
    let mut lines = LineBuffer::default();

    let mut byte_stream = resp.bytes_stream();
    while let Some(chunk) = byte_stream.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                let _ = tx
                    .send(StreamEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
                return;
            }
        };
        let Ok(text) = std::str::from_utf8(&chunk) else {
            continue;
        };

        for line in lines.push(text) {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Some(parsed) = parse_sse_line(line) else {
                continue;
            };
            match parsed {
                SseParsed::Event(ev) => current_event = ev,
                SseParsed::Data(data) => {
                    if let Some(event) = parse_data_block(
                        &current_event,
                        &data,
                        &mut model,
                        &mut tokens_in,
                        &mut tokens_out,
                    ) {
                        if tx.send(event).await.is_err() {
                            return; // receiver dropped
                        }
                    }
                }
            }
        }
    }

    let _ = tx
        .send(StreamEvent::Done {
            model,
            tokens_in,
            tokens_out,
        })
        .await;
}

fn parse_data_block(
    event_type: &str,
    data: &str,
    model: &mut String,
    tokens_in: &mut u32,
    tokens_out: &mut u32,
) -> Option<StreamEvent> {
    match event_type {
        "message_start" => {
            if let Ok(msg) = serde_json::from_str::<MessageStart>(data) {
                *model = msg.message.model;
                *tokens_in += msg.message.usage.input_tokens;
            }
            None
        }
        "content_block_delta" => {
            if let Ok(delta) = serde_json::from_str::<ContentBlockDelta>(data) {
                if delta.delta.delta_type == "text_delta" {
                    if let Some(text) = delta.delta.text {
                        return Some(StreamEvent::Chunk { text });
                    }
                }
            }
            None
        }
        "message_delta" => {
            if let Ok(delta) = serde_json::from_str::<MessageDelta>(data) {
                *tokens_out = delta.usage.output_tokens;
            }
            None
        }
        "error" => {
            warn!(data, "anthropic stream error");
            Some(StreamEvent::Error {
                message: data.to_string(),
            })
        }
        _ => None,
    }
}

// Anthropic API response types (private — deserialization only)

#[derive(Deserialize)]
struct ApiResponse {
    model: String,
    content: Vec<ContentBlock>,
    usage: Usage,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize)]
struct Usage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Deserialize)]
struct MessageStart {
    message: MessageStartInner,
}

#[derive(Deserialize)]
struct MessageStartInner {
    model: String,
    usage: InputUsage,
}

#[derive(Deserialize)]
struct InputUsage {
    input_tokens: u32,
}

#[derive(Deserialize)]
struct ContentBlockDelta {
    delta: DeltaContent,
}

#[derive(Deserialize)]
struct DeltaContent {
    #[serde(rename = "type")]
    delta_type: String,
    text: Option<String>,
}

#[derive(Deserialize)]
struct MessageDelta {
    usage: OutputUsage,
}

#[derive(Deserialize)]
struct OutputUsage {
    output_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChatMessage;

    #[test]
    fn defaults_apply_when_models_unset() {
        let p = AnthropicProvider::new("k".to_string(), ModelSelection::default());
        assert_eq!(p.reasoning_model(), DEFAULT_REASONING_MODEL);
        assert_eq!(p.utility_model(), DEFAULT_UTILITY_MODEL);
        assert_eq!(p.deep_thinking_model(), DEFAULT_REASONING_MODEL);
    }

    #[test]
    fn system_messages_are_lifted_out_of_the_turn_list() {
        let p = AnthropicProvider::new("k".to_string(), ModelSelection::default());
        let req = ChatRequest::new(
            "m",
            "be brief",
            vec![
                ChatMessage {
                    role: Role::System,
                    content: "ignored".to_string(),
                },
                ChatMessage::user("hi"),
            ],
        );
        let body = p.build_body(&req, false);
        assert_eq!(body["system"], "be brief");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn text_deltas_become_chunks() {
        let mut model = String::new();
        let (mut tin, mut tout) = (0, 0);
        let event = parse_data_block(
            "content_block_delta",
            r#"{"delta":{"type":"text_delta","text":"Hel"}}"#,
            &mut model,
            &mut tin,
            &mut tout,
        );
        assert!(matches!(event, Some(StreamEvent::Chunk { text }) if text == "Hel"));

        parse_data_block(
            "message_start",
            r#"{"message":{"model":"claude-x","usage":{"input_tokens":12}}}"#,
            &mut model,
            &mut tin,
            &mut tout,
        );
        assert_eq!(model, "claude-x");
        assert_eq!(tin, 12);

        parse_data_block(
            "message_delta",
            r#"{"usage":{"output_tokens":42}}"#,
            &mut model,
            &mut tin,
            &mut tout,
        );
        assert_eq!(tout, 42);
    }
}
