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

const DEFAULT_REASONING_MODEL: &str = "gpt-4o";
const DEFAULT_UTILITY_MODEL: &str = "gpt-4o-mini";

pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    reasoning_model: String,
    utility_model: String,
    deep_thinking_model: String,
}

impl OpenAiProvider {
    pub fn new(api_key: String, models: ModelSelection) -> Self {
        let reasoning = models
            .reasoning
            .unwrap_or_else(|| DEFAULT_REASONING_MODEL.to_string());
        Self {
            client: http_client(),
            api_key,
            base_url: "https://api.openai.com".to_string(),
            utility_model: models
                .utility
                .unwrap_or_else(|| DEFAULT_UTILITY_MODEL.to_string()),
            deep_thinking_model: models.deep_thinking.unwrap_or_else(|| reasoning.clone()),
            reasoning_model: reasoning,
        }
    }

    fn request(&self, body: &serde_json::Value) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .json(body)
    }

    fn build_messages(&self, req: &ChatRequest) -> Vec<serde_json::Value> {
        let mut messages = Vec::with_capacity(req.messages.len() + 1);
        if !req.system.is_empty() {
            messages.push(serde_json::json!({ "role": "system", "content": req.system }));
        }
        for m in &req.messages {
            messages.push(serde_json::json!({ "role": m.role.as_str(), "content": m.content }));
        }
        messages
    }

    async fn post_non_stream(&self, body: serde_json::Value) -> Result<ChatResponse, ProviderError> {
        let resp = self.request(&body).send().await?;
        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "openai api error");
            return Err(ProviderError::Api {
                status,
                message: text,
            });
        }
        let api: Completion = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;
        let content = api
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        let usage = api.usage.unwrap_or_default();
        Ok(ChatResponse {
            content,
            model: api.model,
            tokens_in: usage.prompt_tokens,
            tokens_out: usage.completion_tokens,
        })
    }
}

#[async_trait]
impl AiProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
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

    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        debug!(model = %req.model, "openai chat request");
        let body = serde_json::json!({
            "model": req.model,
            "max_tokens": req.max_tokens,
            "messages": self.build_messages(req),
        });
        self.post_non_stream(body).await
    }

    async fn chat_stream(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        debug!(model = %req.model, "openai streaming request");
        let body = serde_json::json!({
            "model": req.model,
            "max_tokens": req.max_tokens,
            "messages": self.build_messages(req),
            "stream": true,
            "stream_options": { "include_usage": true },
        });
        let resp = self.request(&body).send().await?;
        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "openai streaming api error");
            return Err(ProviderError::Api {
                status,
                message: text,
            });
        }

        let mut model = req.model.clone();
        let mut tokens_in: u32 = 0;
        let mut tokens_out: u32 = 0;
        let mut lines = LineBuffer::default();
        let mut byte_stream = resp.bytes_stream();

        'outer: while let Some(chunk) = byte_stream.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    let _ = tx
                        .send(StreamEvent::Error {
                            message: e.to_string(),
                        })
                        .await;
                    return Ok(());
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
                let Some(SseParsed::Data(data)) = parse_sse_line(line) else {
                    continue;
                };
                if data.trim() == "[DONE]" {
                    break 'outer;
                }
                let Ok(delta) = serde_json::from_str::<StreamCompletion>(&data) else {
                    continue;
                };
                if !delta.model.is_empty() {
                    model = delta.model;
                }
                if let Some(usage) = delta.usage {
                    tokens_in = usage.prompt_tokens;
                    tokens_out = usage.completion_tokens;
                }
                if let Some(text) = delta
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|c| c.delta.content)
                {
                    if !text.is_empty() && tx.send(StreamEvent::Chunk { text }).await.is_err() {
                        return Ok(());
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
        Ok(())
    }

    async fn chat_with_vision(
        &self,
        req: &ChatRequest,
        image_bytes: &[u8],
    ) -> Result<ChatResponse, ProviderError> {
        let data_url = format!(
            "data:{};base64,{}",
            detect_media_type(image_bytes),
            B64.encode(image_bytes)
        );
        let mut messages = Vec::new();
        if !req.system.is_empty() {
            messages.push(serde_json::json!({ "role": "system", "content": req.system }));
        }
        for m in &req.messages {
            if m.role == Role::User {
                messages.push(serde_json::json!({
                    "role": "user",
                    "content": [
                        { "type": "image_url", "image_url": { "url": data_url } },
                        { "type": "text", "text": m.content },
                    ],
                }));
            } else {
                messages.push(serde_json::json!({ "role": m.role.as_str(), "content": m.content }));
            }
        }
        let body = serde_json::json!({
            "model": req.model,
            "max_tokens": req.max_tokens,
            "messages": messages,
        });
        self.post_non_stream(body).await
    }

    async fn validate_key(&self) -> Result<bool, ProviderError> {
        let resp = self
            .client
            .get(format!("{}/v1/models", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ProviderError::InvalidKey(text));
        }
        Ok(true)
    }
}

// OpenAI API response types (private — deserialization only)

#[derive(Deserialize)]
struct Completion {
    model: String,
    choices: Vec<Choice>,
    usage: Option<CompletionUsage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize, Default)]
struct CompletionUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Deserialize)]
struct StreamCompletion {
    #[serde(default)]
    model: String,
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<CompletionUsage>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChatMessage;

    #[test]
    fn system_prompt_leads_the_message_list() {
        let p = OpenAiProvider::new("k".to_string(), ModelSelection::default());
        let req = ChatRequest::new("m", "sys", vec![ChatMessage::user("hi")]);
        let messages = p.build_messages(&req);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["role"], "user");
    }

    #[test]
    fn stream_chunks_deserialize() {
        let data = r#"{"model":"gpt-4o","choices":[{"delta":{"content":"Hi"}}]}"#;
        let parsed: StreamCompletion = serde_json::from_str(data).unwrap();
        assert_eq!(parsed.choices[0].delta.content.as_deref(), Some("Hi"));
    }
}
