use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::LlmConfig;
use crate::resilience::circuit_breaker::CircuitBreakerManager;
use crate::utils::error::AnalysisError;

#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub max_tokens: usize,
    pub temperature: f32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_tokens: 1_024,
            temperature: 0.2,
        }
    }
}

/// Outward text-generation capability, used for summaries and chat
/// replies.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        config: &GenerationConfig,
    ) -> Result<String, AnalysisError>;
}

#[derive(Debug, Serialize)]
struct CompletionMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct CompletionRequest {
    model: String,
    messages: Vec<CompletionMessage>,
    max_tokens: usize,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionReply,
}

#[derive(Debug, Deserialize)]
struct CompletionReply {
    content: String,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

/// HTTP generation provider speaking the `/v1/chat/completions` shape,
/// wrapped by the `generation` circuit breaker.
pub struct HttpGenerationService {
    client: Client,
    config: LlmConfig,
    breakers: Arc<CircuitBreakerManager>,
}

impl HttpGenerationService {
    pub const BREAKER_NAME: &'static str = "generation";

    pub fn new(config: LlmConfig, breakers: Arc<CircuitBreakerManager>) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(config.timeout_seconds))
                .build()
                .unwrap_or_else(|_| Client::new()),
            config,
            breakers,
        }
    }

    async fn request_completion(
        &self,
        prompt: &str,
        generation: &GenerationConfig,
    ) -> Result<String, AnalysisError> {
        let url = format!("{}/v1/chat/completions", self.config.base_url);
        debug!("Requesting completion from {}", url);

        let request = CompletionRequest {
            model: self.config.model.clone(),
            messages: vec![CompletionMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            max_tokens: generation.max_tokens,
            temperature: generation.temperature,
        };

        let mut builder = self.client.post(&url).json(&request);
        if let Some(key) = &self.config.api_key {
            builder = builder.header("Authorization", format!("Bearer {key}"));
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                AnalysisError::Timeout(self.config.timeout_seconds)
            } else {
                AnalysisError::ProviderTransient(format!("generation request failed: {e}"))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                401 | 403 | 429 => AnalysisError::ProviderQuotaOrAuth(format!(
                    "generation API error ({status}): {body}"
                )),
                _ => AnalysisError::ProviderTransient(format!(
                    "generation API error ({status}): {body}"
                )),
            });
        }

        let parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|e| AnalysisError::ProviderTransient(format!("malformed response: {e}")))?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| AnalysisError::ProviderTransient("empty completion".to_string()))
    }
}

#[async_trait]
impl GenerationProvider for HttpGenerationService {
    async fn generate(
        &self,
        prompt: &str,
        config: &GenerationConfig,
    ) -> Result<String, AnalysisError> {
        let breaker = self.breakers.get_or_create(Self::BREAKER_NAME);
        breaker.call(|| self.request_completion(prompt, config)).await
    }
}
