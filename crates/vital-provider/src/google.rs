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

const DEFAULT_REASONING_MODEL: &str = "gemini-2.5-pro";
const DEFAULT_UTILITY_MODEL: &str = "gemini-2.5-flash";

pub struct GoogleProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    reasoning_model: String,
    utility_model: String,
    deep_thinking_model: String,
}

impl GoogleProvider {
    pub fn new(api_key: String, models: ModelSelection) -> Self {
        let reasoning = models
            .reasoning
            .unwrap_or_else(|| DEFAULT_REASONING_MODEL.to_string());
        Self {
            client: http_client(),
            api_key,
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            utility_model: models
                .utility
                .unwrap_or_else(|| DEFAULT_UTILITY_MODEL.to_string()),
            deep_thinking_model: models.deep_thinking.unwrap_or_else(|| reasoning.clone()),
            reasoning_model: reasoning,
        }
    }

    fn build_body(&self, req: &ChatRequest) -> serde_json::Value {
        // Gemini uses "model" for assistant turns and carries the system
        // prompt in a separate systemInstruction block.
        let contents: Vec<serde_json::Value> = req
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| {
                let role = match m.role {
                    Role::Assistant => "model",
                    _ => "user",
                };
                serde_json::json!({ "role": role, "parts": [{ "text": m.content }] })
            })
            .collect();
        let mut body = serde_json::json!({
            "contents": contents,
            "generationConfig": { "maxOutputTokens": req.max_tokens },
        });
        if !req.system.is_empty() {
            body["systemInstruction"] = serde_json::json!({ "parts": [{ "text": req.system }] });
        }
        body
    }

    async fn post(
        &self,
        model: &str,
        action: &str,
        body: &serde_json::Value,
        query: &str,
    ) -> Result<reqwest::Response, ProviderError> {
        let url = format!(
            "{}/models/{}:{}?key={}{}",
            self.base_url, model, action, self.api_key, query
        );
        let resp = self
            .client
            .post(url)
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await?;
        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "google api error");
            return Err(ProviderError::Api {
                status,
                message: text,
            });
        }
        Ok(resp)
    }

    async fn generate(
        &self,
        model: &str,
        body: serde_json::Value,
    ) -> Result<ChatResponse, ProviderError> {
        let resp = self.post(model, "generateContent", &body, "").await?;
        let api: GenerateResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;
        let content = api.text();
        let usage = api.usage_metadata.unwrap_or_default();
        Ok(ChatResponse {
            content,
            model: model.to_string(),
            tokens_in: usage.prompt_token_count,
            tokens_out: usage.candidates_token_count,
        })
    }
}

#[async_trait]
impl AiProvider for GoogleProvider {
    fn name(&self) -> &str {
        "google"
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
        debug!(model = %req.model, "google chat request");
        self.generate(&req.model, self.build_body(req)).await
    }

    async fn chat_stream(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        debug!(model = %req.model, "google streaming request");
        let body = self.build_body(req);
        let resp = self
            .post(&req.model, "streamGenerateContent", &body, "&alt=sse")
            .await?;

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
                let Ok(part) = serde_json::from_str::<GenerateResponse>(&data) else {
                    continue;
                };
                if let Some(usage) = &part.usage_metadata {
                    tokens_in = usage.prompt_token_count;
                    tokens_out = usage.candidates_token_count;
                }
                let text = part.text();
                if !text.is_empty() && tx.send(StreamEvent::Chunk { text }).await.is_err() {
                    return Ok(());
                }
            }
        }

        let _ = tx
            .send(StreamEvent::Done {
                model: req.model.clone(),
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
        let mut body = self.build_body(req);
        let image_part = serde_json::json!({
            "inline_data": {
                "mime_type": detect_media_type(image_bytes),
                "data": B64.encode(image_bytes),
            },
        });
        // Prepend the image to the last user turn's parts.
        if let Some(contents) = body["contents"].as_array_mut() {
            if let Some(last_user) = contents
                .iter_mut()
                .rev()
                .find(|c| c["role"] == "user")
            {
                if let Some(parts) = last_user["parts"].as_array_mut() {
                    parts.insert(0, image_part);
                }
            }
        }
        self.generate(&req.model, body).await
    }

    async fn validate_key(&self) -> Result<bool, ProviderError> {
        let url = format!("{}/models?key={}", self.base_url, self.api_key);
        let resp = self.client.get(url).send().await?;
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ProviderError::InvalidKey(text));
        }
        Ok(true)
    }
}

// Gemini API response types (private — deserialization only)

#[derive(Deserialize, Default)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<UsageMetadata>,
}

impl GenerateResponse {
    fn text(&self) -> String {
        self.candidates
            .iter()
            .flat_map(|c| c.content.parts.iter())
            .filter_map(|p| p.text.as_deref())
            .collect()
    }
}

#[derive(Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Content,
}

#[derive(Deserialize, Default)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Deserialize)]
struct Part {
    text: Option<String>,
}

#[derive(Deserialize, Default)]
struct UsageMetadata {
    #[serde(rename = "promptTokenCount", default)]
    prompt_token_count: u32,
    #[serde(rename = "candidatesTokenCount", default)]
    candidates_token_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChatMessage;

    #[test]
    fn assistant_turns_map_to_model_role() {
        let p = GoogleProvider::new("k".to_string(), ModelSelection::default());
        let req = ChatRequest::new(
            "m",
            "sys",
            vec![ChatMessage::user("hi"), ChatMessage::assistant("hello")],
        );
        let body = p.build_body(&req);
        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "sys");
    }

    #[test]
    fn response_text_concatenates_parts() {
        let raw = r#"{"candidates":[{"content":{"parts":[{"text":"Hel"},{"text":"lo"}]}}],
                      "usageMetadata":{"promptTokenCount":7,"candidatesTokenCount":2}}"#;
        let parsed: GenerateResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.text(), "Hello");
        assert_eq!(parsed.usage_metadata.unwrap().prompt_token_count, 7);
    }
}
