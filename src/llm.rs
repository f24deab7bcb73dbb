//! Generation capability: trait and Anthropic Messages API implementation.
//!
//! The [`Generator`] trait has blocking and streaming modes. The streaming
//! contract: concatenating every yielded token reproduces exactly the text
//! the blocking mode would return for the same request.
//!
//! Prompt templates live with the pipelines; this module only moves text
//! to and from the upstream API.

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::stream::BoxStream;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tracing::debug;

use crate::error::DocChatError;

const ANTHROPIC_MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// One generation call: a system instruction (with any grounding context
/// already stuffed in), the user turn, and the model settings in effect.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub system: String,
    pub user: String,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
}

/// Ordered token sequence; ends when the upstream answer is complete.
pub type TokenStream = BoxStream<'static, Result<String, DocChatError>>;

/// The generate capability.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Produce the full answer text in one call.
    async fn generate(&self, req: &GenerationRequest) -> Result<String, DocChatError>;

    /// Produce the answer token by token. Tokens concatenate to exactly
    /// the text [`Generator::generate`] returns for the same request.
    async fn stream(&self, req: &GenerationRequest) -> Result<TokenStream, DocChatError>;
}

/// Generator backed by the Anthropic Messages API.
///
/// The API key is read from `ANTHROPIC_API_KEY` at call time, so a missing
/// key surfaces as a per-turn generation error rather than preventing
/// startup.
pub struct AnthropicGenerator {
    client: reqwest::Client,
}

impl AnthropicGenerator {
    pub fn new(timeout_secs: u64) -> Result<Self, DocChatError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| DocChatError::Generation(e.to_string()))?;
        Ok(Self { client })
    }

    fn api_key() -> Result<String, DocChatError> {
        std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| DocChatError::Generation("ANTHROPIC_API_KEY not set".to_string()))
    }

    fn request_body(req: &GenerationRequest, stream: bool) -> serde_json::Value {
        serde_json::json!({
            "model": req.model,
            "max_tokens": req.max_tokens,
            "temperature": req.temperature,
            "system": req.system,
            "messages": [{ "role": "user", "content": req.user }],
            "stream": stream,
        })
    }

    async fn post(
        &self,
        req: &GenerationRequest,
        stream: bool,
    ) -> Result<reqwest::Response, DocChatError> {
        let api_key = Self::api_key()?;
        let response = self
            .client
            .post(ANTHROPIC_MESSAGES_URL)
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .json(&Self::request_body(req, stream))
            .send()
            .await
            .map_err(|e| DocChatError::Generation(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DocChatError::Generation(format!(
                "Anthropic API error {}: {}",
                status, body
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl Generator for AnthropicGenerator {
    async fn generate(&self, req: &GenerationRequest) -> Result<String, DocChatError> {
        let response = self.post(req, false).await?;
        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| DocChatError::Generation(e.to_string()))?;

        let text = json
            .get("content")
            .and_then(|c| c.as_array())
            .map(|blocks| {
                blocks
                    .iter()
                    .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                    .collect::<String>()
            })
            .ok_or_else(|| {
                DocChatError::Generation("Invalid Anthropic response: missing content".to_string())
            })?;

        Ok(text)
    }

    async fn stream(&self, req: &GenerationRequest) -> Result<TokenStream, DocChatError> {
        let response = self.post(req, true).await?;
        let mut bytes = response.bytes_stream();
        let (mut tx, rx) = mpsc::channel::<Result<String, DocChatError>>(32);

        tokio::spawn(async move {
            let mut buffer = String::new();
            while let Some(item) = bytes.next().await {
                let chunk = match item {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx.send(Err(DocChatError::Generation(e.to_string()))).await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim_end_matches('\r').to_string();
                    buffer.drain(..=pos);

                    match parse_sse_line(&line) {
                        SseEvent::Token(token) => {
                            // Consumer gone: stop producing.
                            if tx.send(Ok(token)).await.is_err() {
                                return;
                            }
                        }
                        SseEvent::Error(message) => {
                            let _ = tx.send(Err(DocChatError::Generation(message))).await;
                            return;
                        }
                        SseEvent::Stop => return,
                        SseEvent::Ignore => {}
                    }
                }
            }
            debug!("anthropic stream ended without message_stop");
        });

        Ok(rx.boxed())
    }
}

enum SseEvent {
    Token(String),
    Error(String),
    Stop,
    Ignore,
}

/// Parse one SSE line from the Anthropic streaming response. Only
/// `content_block_delta` text deltas carry answer tokens.
fn parse_sse_line(line: &str) -> SseEvent {
    let Some(data) = line.strip_prefix("data: ") else {
        return SseEvent::Ignore;
    };
    let Ok(json) = serde_json::from_str::<serde_json::Value>(data) else {
        return SseEvent::Ignore;
    };

    match json.get("type").and_then(|t| t.as_str()) {
        Some("content_block_delta") => {
            let token = json
                .get("delta")
                .filter(|d| d.get("type").and_then(|t| t.as_str()) == Some("text_delta"))
                .and_then(|d| d.get("text"))
                .and_then(|t| t.as_str());
            match token {
                Some(t) => SseEvent::Token(t.to_string()),
                None => SseEvent::Ignore,
            }
        }
        Some("message_stop") => SseEvent::Stop,
        Some("error") => {
            let message = json
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .unwrap_or("upstream stream error");
            SseEvent::Error(message.to_string())
        }
        _ => SseEvent::Ignore,
    }
}
