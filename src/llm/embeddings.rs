use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::EmbeddingConfig;

/// Maximum characters to send per text to the embedding API. The
/// multilingual MiniLM encoder tokenises German at roughly 1 token per
/// 3 chars; 3 000 chars stays comfortably inside its context window.
const MAX_EMBED_CHARS: usize = 3_000;

/// The semantic leg of retrieval. Implementations must return vectors of
/// a single fixed dimension (384 in production).
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Truncate `text` to at most `max_chars`, splitting on a UTF-8 char boundary.
fn truncate_for_embedding(text: &str, max_chars: usize) -> &str {
    if text.len() <= max_chars {
        return text;
    }
    let mut end = max_chars;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// HTTP embedder speaking either the Ollama or the OpenAI-compatible
/// embedding protocol, selected by `config.provider`.
pub struct HttpEmbedder {
    client: reqwest::Client,
    config: EmbeddingConfig,
}

impl HttpEmbedder {
    pub fn new(client: reqwest::Client, config: EmbeddingConfig) -> Self {
        Self { client, config }
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let truncated = truncate_for_embedding(text, MAX_EMBED_CHARS);

        let embedding = match self.config.provider.as_str() {
            "ollama" => embed_ollama(&self.client, &self.config, truncated).await?,
            "openai" => embed_openai(&self.client, &self.config, truncated).await?,
            other => anyhow::bail!("Unknown embedding provider: {other}"),
        };

        if embedding.len() != self.config.dim {
            anyhow::bail!(
                "Embedding dimension mismatch: expected {}, got {}",
                self.config.dim,
                embedding.len()
            );
        }
        Ok(embedding)
    }
}

// ─── Ollama ──────────────────────────────────────────────

#[derive(Serialize)]
struct OllamaEmbedRequest {
    model: String,
    input: Vec<String>,
    /// Ask Ollama to silently truncate inputs that exceed the model's
    /// context length instead of returning a 400 error.
    truncate: bool,
}

#[derive(Deserialize)]
struct OllamaEmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

async fn embed_ollama(
    client: &reqwest::Client,
    config: &EmbeddingConfig,
    text: &str,
) -> Result<Vec<f32>> {
    let url = format!("{}/api/embed", config.base_url);

    let req = OllamaEmbedRequest {
        model: config.model.clone(),
        input: vec![text.to_string()],
        truncate: true,
    };

    let resp = client
        .post(&url)
        .json(&req)
        .send()
        .await
        .context("Failed to call Ollama embed API")?;

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("Ollama embed API returned {status}: {body}");
    }

    let body: OllamaEmbedResponse = resp
        .json()
        .await
        .context("Failed to parse Ollama embed response")?;

    body.embeddings
        .into_iter()
        .next()
        .context("No embedding returned")
}

// ─── OpenAI-compatible ───────────────────────────────────

#[derive(Serialize)]
struct OpenAiEmbedRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Deserialize)]
struct OpenAiEmbedResponse {
    data: Vec<OpenAiEmbedData>,
}

#[derive(Deserialize)]
struct OpenAiEmbedData {
    embedding: Vec<f32>,
}

async fn embed_openai(
    client: &reqwest::Client,
    config: &EmbeddingConfig,
    text: &str,
) -> Result<Vec<f32>> {
    let url = format!("{}/v1/embeddings", config.base_url);
    let api_key = config.api_key.as_deref().unwrap_or_default();

    let req = OpenAiEmbedRequest {
        model: config.model.clone(),
        input: vec![text.to_string()],
    };

    let resp = client
        .post(&url)
        .header("Authorization", format!("Bearer {api_key}"))
        .json(&req)
        .send()
        .await
        .context("Failed to call OpenAI embed API")?;

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("OpenAI embed API returned {status}: {body}");
    }

    let body: OpenAiEmbedResponse = resp
        .json()
        .await
        .context("Failed to parse OpenAI embed response")?;

    body.data
        .into_iter()
        .next()
        .map(|d| d.embedding)
        .context("No embedding returned")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_short_text() {
        assert_eq!(truncate_for_embedding("short text", 100), "short text");
    }

    #[test]
    fn test_truncate_at_limit() {
        let text = "a".repeat(100);
        assert_eq!(truncate_for_embedding(&text, 100).len(), 100);
    }

    #[test]
    fn test_truncate_over_limit() {
        let text = "a".repeat(200);
        assert_eq!(truncate_for_embedding(&text, 100).len(), 100);
    }

    #[test]
    fn test_truncate_respects_utf8_boundary() {
        // é is 2 bytes in UTF-8
        let text = "é".repeat(100); // 200 bytes
        let result = truncate_for_embedding(&text, 151);
        assert!(result.len() <= 151);
        assert!(result.len() % 2 == 0);
    }
}
