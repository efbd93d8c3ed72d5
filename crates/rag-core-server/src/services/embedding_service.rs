use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::EmbeddingConfig;
use crate::resilience::circuit_breaker::CircuitBreakerManager;
use crate::utils::error::AnalysisError;

/// Outward embedding capability. Idempotent per (content, model); blocking
/// calls run behind the circuit breaker.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(
        &self,
        content: &str,
        model_name: &str,
        task_type: &str,
    ) -> Result<Vec<f32>, AnalysisError>;

    async fn embed_batch(
        &self,
        contents: &[String],
        model_name: &str,
        task_type: &str,
    ) -> Result<Vec<Vec<f32>>, AnalysisError>;
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest {
    input: Vec<String>,
    model: String,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

/// HTTP embedding provider speaking the standard `/v1/embeddings` shape.
/// Each call runs under the `embedding` circuit breaker; retries live in
/// the batcher, so the breaker only sees final failures.
pub struct HttpEmbeddingService {
    client: Client,
    config: EmbeddingConfig,
    breakers: Arc<CircuitBreakerManager>,
}

impl HttpEmbeddingService {
    pub const BREAKER_NAME: &'static str = "embedding";

    pub fn new(config: EmbeddingConfig, breakers: Arc<CircuitBreakerManager>) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(config.timeout_seconds))
                .build()
                .unwrap_or_else(|_| Client::new()),
            config,
            breakers,
        }
    }

    async fn request_embeddings(
        &self,
        contents: &[String],
        model_name: &str,
    ) -> Result<Vec<Vec<f32>>, AnalysisError> {
        let url = format!("{}/v1/embeddings", self.config.base_url);
        debug!(
            "Requesting {} embeddings from {} (model {})",
            contents.len(),
            url,
            model_name
        );

        let request = EmbeddingRequest {
            input: contents.to_vec(),
            model: model_name.to_string(),
        };

        let mut builder = self.client.post(&url).json(&request);
        if let Some(key) = &self.config.api_key {
            builder = builder.header("Authorization", format!("Bearer {key}"));
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                AnalysisError::Timeout(self.config.timeout_seconds)
            } else {
                AnalysisError::ProviderTransient(format!("embedding request failed: {e}"))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), &body));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| AnalysisError::ProviderTransient(format!("malformed response: {e}")))?;

        if parsed.data.len() != contents.len() {
            return Err(AnalysisError::ProviderTransient(format!(
                "expected {} embeddings, got {}",
                contents.len(),
                parsed.data.len()
            )));
        }

        let mut vectors = Vec::with_capacity(parsed.data.len());
        for data in parsed.data {
            if data.embedding.len() != self.config.dimension {
                return Err(AnalysisError::ProviderTransient(format!(
                    "embedding dimension mismatch: expected {}, got {}",
                    self.config.dimension,
                    data.embedding.len()
                )));
            }
            vectors.push(data.embedding);
        }

        Ok(vectors)
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingService {
    async fn embed(
        &self,
        content: &str,
        model_name: &str,
        task_type: &str,
    ) -> Result<Vec<f32>, AnalysisError> {
        let batch = self
            .embed_batch(&[content.to_string()], model_name, task_type)
            .await?;
        batch
            .into_iter()
            .next()
            .ok_or_else(|| AnalysisError::ProviderTransient("empty embedding batch".to_string()))
    }

    async fn embed_batch(
        &self,
        contents: &[String],
        model_name: &str,
        _task_type: &str,
    ) -> Result<Vec<Vec<f32>>, AnalysisError> {
        if contents.is_empty() {
            return Ok(Vec::new());
        }

        let breaker = self.breakers.get_or_create(Self::BREAKER_NAME);
        breaker
            .call(|| self.request_embeddings(contents, model_name))
            .await
    }
}

fn classify_status(status: u16, body: &str) -> AnalysisError {
    match status {
        401 | 403 | 429 => AnalysisError::ProviderQuotaOrAuth(format!(
            "embedding API error ({status}): {body}"
        )),
        _ => AnalysisError::ProviderTransient(format!("embedding API error ({status}): {body}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_statuses_are_not_retryable() {
        let err = classify_status(429, "rate limited");
        assert!(matches!(err, AnalysisError::ProviderQuotaOrAuth(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn server_errors_are_transient() {
        let err = classify_status(503, "unavailable");
        assert!(matches!(err, AnalysisError::ProviderTransient(_)));
        assert!(err.is_retryable());
    }
}
