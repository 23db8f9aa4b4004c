//! Chat transport: one completion request against an OpenAI-compatible
//! endpoint, plus the retry/backoff policy for transport-level failures.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::config::LlmConfig;
use crate::error::RowError;
use crate::pipeline::pacing::RateGate;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("server error {status}: {body}")]
    Server { status: u16, body: String },
    #[error("client error {status}: {body}")]
    Client { status: u16, body: String },
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("network: {0}")]
    Network(String),
    #[error("empty completion")]
    Empty,
}

impl TransportError {
    /// Rate limits, 5xx, timeouts and connection failures are worth
    /// retrying; 4xx are not.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            TransportError::RateLimited(_)
                | TransportError::Server { .. }
                | TransportError::Timeout(_)
                | TransportError::Network(_)
        )
    }
}

/// One chat completion. The oracle builds prompts and parses responses;
/// implementations only move bytes.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn complete(&self, system: &str, user: &str) -> Result<String, TransportError>;
}

// ─── OpenAI-compatible ───────────────────────────────────

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    top_p: f32,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

pub struct HttpChatTransport {
    client: reqwest::Client,
    config: LlmConfig,
}

impl HttpChatTransport {
    pub fn new(client: reqwest::Client, config: LlmConfig) -> Self {
        Self { client, config }
    }
}

#[async_trait]
impl ChatTransport for HttpChatTransport {
    async fn complete(&self, system: &str, user: &str) -> Result<String, TransportError> {
        let url = format!("{}/v1/chat/completions", self.config.base_url);
        let api_key = self.config.api_key.as_deref().unwrap_or_default();
        let timeout = Duration::from_secs(self.config.timeout_secs);

        let req = ChatRequest {
            model: self.config.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: user.to_string(),
                },
            ],
            temperature: self.config.temperature,
            top_p: self.config.top_p,
            response_format: ResponseFormat {
                format_type: "json_object",
            },
        };

        let resp = self
            .client
            .post(&url)
            .timeout(timeout)
            .header("Authorization", format!("Bearer {api_key}"))
            .json(&req)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout(timeout)
                } else {
                    TransportError::Network(e.to_string())
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(if status.as_u16() == 429 {
                TransportError::RateLimited(body)
            } else if status.is_server_error() {
                TransportError::Server {
                    status: status.as_u16(),
                    body,
                }
            } else {
                TransportError::Client {
                    status: status.as_u16(),
                    body,
                }
            });
        }

        let body: ChatResponse = resp
            .json()
            .await
            .map_err(|e| TransportError::Network(format!("bad completion body: {e}")))?;

        body.choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .filter(|c| !c.is_empty())
            .ok_or(TransportError::Empty)
    }
}

/// Run one completion through the rate gate, retrying retryable transport
/// failures with exponential backoff. Every attempt acquires its own
/// pacing token first.
pub async fn paced_complete(
    transport: &dyn ChatTransport,
    gate: &RateGate,
    config: &LlmConfig,
    system: &str,
    user: &str,
) -> Result<String, RowError> {
    let max_attempts = config.max_transport_attempts.max(1);
    let mut last_err: Option<TransportError> = None;

    for attempt in 1..=max_attempts {
        gate.acquire().await;

        match transport.complete(system, user).await {
            Ok(text) => return Ok(text),
            Err(e) if e.retryable() && attempt < max_attempts => {
                let delay = Duration::from_millis(config.backoff_base_ms << (attempt - 1));
                tracing::warn!(
                    attempt,
                    max_attempts,
                    "LLM transport failure, backing off {delay:?}: {e}"
                );
                tokio::time::sleep(delay).await;
                last_err = Some(e);
            }
            Err(e) => {
                return Err(RowError::LlmTransport {
                    message: e.to_string(),
                    attempts: attempt,
                });
            }
        }
    }

    Err(RowError::LlmTransport {
        message: last_err
            .map(|e| e.to_string())
            .unwrap_or_else(|| "exhausted".to_string()),
        attempts: max_attempts,
    })
}
