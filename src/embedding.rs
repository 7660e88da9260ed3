//! Batch embedding over an Ollama-compatible embed API

use crate::config::EmbeddingConfig;
use crate::error::{EmbeddingError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error};

/// Trait for embedding providers
///
/// Implementations must preserve input order: `result[i]` embeds `texts[i]`.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Map a batch of texts to fixed-dimension vectors
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Fixed vector dimension for this deployment
    fn dimension(&self) -> usize;

    /// Cheap liveness probe for health reporting
    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// HTTP embedder against `/api/embed`
pub struct HttpEmbedder {
    client: reqwest::Client,
    config: EmbeddingConfig,
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

impl HttpEmbedder {
    pub fn new(config: EmbeddingConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self { client, config })
    }

    fn api_url(&self) -> String {
        format!("{}/api/embed", self.config.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        debug!("Embedding batch of {} texts", texts.len());

        let request = EmbedRequest {
            model: &self.config.model,
            input: texts,
        };

        let response = timeout(
            Duration::from_secs(self.config.timeout_secs),
            self.client.post(self.api_url()).json(&request).send(),
        )
        .await
        .map_err(|_| EmbeddingError::Transient("embed call timed out".to_string()))?
        .map_err(|e| EmbeddingError::Transient(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = response.text().await.unwrap_or_default();
            error!("Embed API error {}: {}", status, body);

            let err = match status.as_u16() {
                429 => EmbeddingError::RateLimited { retry_after },
                402 | 403 if body.to_lowercase().contains("quota") => {
                    EmbeddingError::QuotaExceeded
                }
                _ => EmbeddingError::Transient(format!("{status}: {body}")),
            };
            return Err(err.into());
        }

        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::Transient(e.to_string()))?;

        if parsed.embeddings.len() != texts.len() {
            return Err(EmbeddingError::Transient(format!(
                "embedder returned {} vectors for {} inputs",
                parsed.embeddings.len(),
                texts.len()
            ))
            .into());
        }

        for vector in &parsed.embeddings {
            if vector.len() != self.config.dimension {
                return Err(EmbeddingError::DimensionMismatch {
                    expected: self.config.dimension,
                    actual: vector.len(),
                }
                .into());
            }
        }

        Ok(parsed.embeddings)
    }

    fn dimension(&self) -> usize {
        self.config.dimension
    }

    async fn ping(&self) -> Result<()> {
        self.client
            .get(self.config.base_url.trim_end_matches('/'))
            .send()
            .await
            .map_err(|e| EmbeddingError::Transient(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(base_url: String, dimension: usize) -> EmbeddingConfig {
        EmbeddingConfig {
            base_url,
            model: "test-embed".to_string(),
            dimension,
            timeout_secs: 5,
        }
    }

    #[tokio::test]
    async fn test_embed_batch_preserves_order() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "embeddings": [[1.0, 0.0], [0.0, 1.0]]
            })))
            .mount(&server)
            .await;

        let embedder = HttpEmbedder::new(config(server.uri(), 2)).unwrap();
        let vectors = embedder
            .embed(&["first".to_string(), "second".to_string()])
            .await
            .unwrap();

        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[0], vec![1.0, 0.0]);
        assert_eq!(vectors[1], vec![0.0, 1.0]);
    }

    #[tokio::test]
    async fn test_embed_dimension_mismatch() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "embeddings": [[1.0, 0.0, 0.5]]
            })))
            .mount(&server)
            .await;

        let embedder = HttpEmbedder::new(config(server.uri(), 2)).unwrap();
        let err = embedder.embed(&["text".to_string()]).await.unwrap_err();
        assert!(err.is_dimension_mismatch());
    }

    #[tokio::test]
    async fn test_embed_rate_limited_carries_delay() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "11"))
            .mount(&server)
            .await;

        let embedder = HttpEmbedder::new(config(server.uri(), 2)).unwrap();
        let err = embedder.embed(&["text".to_string()]).await.unwrap_err();
        assert_eq!(err.advised_delay(), Some(Duration::from_secs(11)));
    }

    #[tokio::test]
    async fn test_empty_batch_is_noop() {
        let embedder =
            HttpEmbedder::new(config("http://localhost:1".to_string(), 2)).unwrap();
        let vectors = embedder.embed(&[]).await.unwrap();
        assert!(vectors.is_empty());
    }
}
