use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::models::memory::{ConversationMemoryConfig, DecayKind};
use crate::utils::error::AnalysisError;

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct Settings {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub embedding: EmbeddingConfig,
    pub llm: LlmConfig,
    pub chunking: ChunkingConfig,
    pub cache: CacheSettings,
    pub batch: BatchSettings,
    pub optimizer: OptimizerSettings,
    pub memory: MemorySettings,
    pub scoring: ScoringWeights,
    pub breaker: BreakerSettings,
    pub pipeline: PipelineSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            embedding: EmbeddingConfig::default(),
            llm: LlmConfig::default(),
            chunking: ChunkingConfig::default(),
            cache: CacheSettings::default(),
            batch: BatchSettings::default(),
            optimizer: OptimizerSettings::default(),
            memory: MemorySettings::default(),
            scoring: ScoringWeights::default(),
            breaker: BreakerSettings::default(),
            pipeline: PipelineSettings::default(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8090,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
    pub pool_max_size: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "./data/analysis_core.db".to_string(),
            pool_max_size: 8,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub model: String,
    pub base_url: String,
    pub dimension: usize,
    pub api_key: Option<String>,
    pub retry_attempts: u32,
    pub timeout_seconds: u64,
    pub request_delay_ms: u64,
    pub task_type: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: "text-embedding-004".to_string(),
            base_url: "http://127.0.0.1:8081".to_string(),
            dimension: 768,
            api_key: None,
            retry_attempts: 3,
            timeout_seconds: 30,
            request_delay_ms: 100,
            task_type: "semantic_similarity".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct LlmConfig {
    pub model: String,
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout_seconds: u64,
    pub max_tokens: usize,
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: "gemini-1.5-flash".to_string(),
            base_url: "http://127.0.0.1:8082".to_string(),
            api_key: None,
            timeout_seconds: 60,
            max_tokens: 2_048,
            temperature: 0.2,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ChunkingConfig {
    pub max_chunk_size: usize,
    pub chunk_overlap_ratio: f32,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: 512,
            chunk_overlap_ratio: 0.2,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct CacheSettings {
    pub strategy: String,
    pub max_memory_entries: usize,
    pub ttl_seconds: u64,
    pub warm_on_startup: bool,
    pub popular_threshold_access_count: i64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            strategy: "hybrid".to_string(),
            max_memory_entries: 1_000,
            ttl_seconds: 86_400,
            warm_on_startup: true,
            popular_threshold_access_count: 5,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct BatchSettings {
    pub max_batch_size: usize,
    pub max_concurrent_batches: usize,
    pub batch_timeout_seconds: u64,
    pub adaptive_batching: bool,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_batch_size: 50,
            max_concurrent_batches: 3,
            batch_timeout_seconds: 30,
            adaptive_batching: true,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct OptimizerSettings {
    pub strategy: String,
    pub max_memory_usage_mb: u64,
    pub max_concurrent_chunks: usize,
    pub chunk_cache_size: usize,
    pub memory_pressure_threshold: f64,
    pub enable_compression: bool,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            strategy: "balanced".to_string(),
            max_memory_usage_mb: 500,
            max_concurrent_chunks: 10,
            chunk_cache_size: 100,
            memory_pressure_threshold: 0.8,
            enable_compression: true,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct MemorySettings {
    pub max_context_tokens: usize,
    pub relevance_decay_factor: f64,
    pub temporal_decay_hours: f64,
    pub summary_threshold: usize,
    pub topic_similarity_threshold: f32,
    pub max_conversation_length: usize,
    pub decay_kind: String,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            max_context_tokens: 32_000,
            relevance_decay_factor: 0.95,
            temporal_decay_hours: 24.0,
            summary_threshold: 20,
            topic_similarity_threshold: 0.7,
            max_conversation_length: 1_000,
            decay_kind: "combined".to_string(),
        }
    }
}

impl MemorySettings {
    pub fn to_memory_config(&self) -> ConversationMemoryConfig {
        ConversationMemoryConfig {
            max_context_tokens: self.max_context_tokens,
            relevance_decay_factor: self.relevance_decay_factor,
            summary_threshold: self.summary_threshold,
            topic_similarity_threshold: self.topic_similarity_threshold,
            memory_compression_ratio: 0.3,
            temporal_decay_hours: self.temporal_decay_hours,
            max_conversation_length: self.max_conversation_length,
            decay_kind: match self.decay_kind.to_lowercase().as_str() {
                "temporal" => DecayKind::Temporal,
                "positional" => DecayKind::Positional,
                _ => DecayKind::Combined,
            },
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy)]
#[serde(default)]
pub struct ScoringWeights {
    pub tag_similarity: f32,
    pub semantic_similarity: f32,
    pub content_relevance: f32,
    pub structural_quality: f32,
    pub freshness: f32,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            tag_similarity: 0.4,
            semantic_similarity: 0.3,
            content_relevance: 0.2,
            structural_quality: 0.05,
            freshness: 0.05,
        }
    }
}

impl ScoringWeights {
    pub fn sum(&self) -> f32 {
        self.tag_similarity
            + self.semantic_similarity
            + self.content_relevance
            + self.structural_quality
            + self.freshness
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub recovery_timeout_seconds: u64,
    pub success_threshold: u32,
    pub timeout_seconds: u64,
    pub rolling_window_seconds: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_seconds: 60,
            success_threshold: 3,
            timeout_seconds: 120,
            rolling_window_seconds: 300,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct PipelineSettings {
    pub max_concurrent_files: usize,
    pub processing_timeout_seconds: u64,
    pub max_documents_per_query: usize,
    pub document_root: String,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_concurrent_files: 5,
            processing_timeout_seconds: 300,
            max_documents_per_query: 5,
            document_root: "./data/documents".to_string(),
        }
    }
}

impl Settings {
    /// Load configuration from the optional settings file plus `RAG_`
    /// prefixed environment variables. Rejects invalid configurations so
    /// the process never starts with a broken setup.
    pub fn load() -> Result<Self, AnalysisError> {
        dotenvy::dotenv().ok();

        let config = Config::builder()
            .add_source(File::with_name("config/settings").required(false))
            .add_source(
                Environment::with_prefix("RAG")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| AnalysisError::Configuration(e.to_string()))?;

        let settings: Settings = config
            .try_deserialize()
            .map_err(|e| AnalysisError::Configuration(e.to_string()))?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), AnalysisError> {
        let weight_sum = self.scoring.sum();
        if (weight_sum - 1.0).abs() > 0.01 {
            return Err(AnalysisError::Configuration(format!(
                "scoring weights must sum to 1.0, got {weight_sum}"
            )));
        }

        if self.chunking.max_chunk_size == 0 {
            return Err(AnalysisError::Configuration(
                "max_chunk_size must be positive".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.chunking.chunk_overlap_ratio) {
            return Err(AnalysisError::Configuration(
                "chunk_overlap_ratio must be between 0 and 1".to_string(),
            ));
        }

        self.memory.to_memory_config().validate()?;

        if self.batch.max_batch_size == 0 || self.batch.max_concurrent_batches == 0 {
            return Err(AnalysisError::Configuration(
                "batch sizes must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn weight_sum_violation_is_rejected() {
        let mut settings = Settings::default();
        settings.scoring.tag_similarity = 0.9;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("sum to 1.0"));
    }

    #[test]
    fn weight_sum_within_tolerance_is_accepted() {
        let mut settings = Settings::default();
        settings.scoring.tag_similarity = 0.405;
        settings.scoring.freshness = 0.05;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        let mut settings = Settings::default();
        settings.chunking.max_chunk_size = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn low_summary_threshold_is_rejected() {
        let mut settings = Settings::default();
        settings.memory.summary_threshold = 2;
        assert!(settings.validate().is_err());
    }
}
