//! Composition root: one place wires every subsystem together so tests
//! can assemble fresh instances with substitutes.

use std::sync::Arc;

use crate::cache::batch_processor::EmbeddingBatchProcessor;
use crate::cache::embedding_cache::EmbeddingCache;
use crate::config::Settings;
use crate::database::{DbPool, Repository};
use crate::logging::{ActivityLogger, LoggerConfig};
use crate::memory::manager::ConversationMemoryManager;
use crate::processing::optimizer::ChunkOptimizer;
use crate::processing::pipeline::DocumentPipeline;
use crate::resilience::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerManager};
use crate::resilience::degradation::GracefulDegradation;
use crate::resilience::intervention::InterventionManager;
use crate::services::catalog::{DocumentCatalog, FilesystemCatalog};
use crate::services::chat_service::ChatService;
use crate::services::embedding_service::{EmbeddingProvider, HttpEmbeddingService};
use crate::services::llm_service::{GenerationProvider, HttpGenerationService};
use crate::utils::error::AnalysisError;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub repository: Arc<Repository>,
    pub embedding_cache: Arc<EmbeddingCache>,
    pub batch_processor: Arc<EmbeddingBatchProcessor>,
    pub pipeline: Arc<DocumentPipeline>,
    pub memory: Arc<ConversationMemoryManager>,
    pub chat: Arc<ChatService>,
    pub breakers: Arc<CircuitBreakerManager>,
    pub degradation: Arc<GracefulDegradation>,
    pub interventions: Arc<InterventionManager>,
    pub generation_provider: Arc<dyn GenerationProvider>,
    pub activity_logger: ActivityLogger,
}

impl AppState {
    pub async fn build(settings: Settings) -> Result<Self, AnalysisError> {
        let db = DbPool::new(&settings.database).await?;
        let repository = Arc::new(Repository::new(db));

        let breakers = Arc::new(CircuitBreakerManager::new(CircuitBreakerConfig::from(
            &settings.breaker,
        )));

        let embedding_provider: Arc<dyn EmbeddingProvider> = Arc::new(HttpEmbeddingService::new(
            settings.embedding.clone(),
            breakers.clone(),
        ));
        let generation_provider: Arc<dyn GenerationProvider> = Arc::new(
            HttpGenerationService::new(settings.llm.clone(), breakers.clone()),
        );

        let embedding_cache = Arc::new(EmbeddingCache::new(
            settings.cache.clone(),
            repository.clone(),
        ));

        let batch_processor = Arc::new(EmbeddingBatchProcessor::new(
            settings.batch.clone(),
            settings.embedding.clone(),
            embedding_cache.clone(),
            embedding_provider.clone(),
        ));

        let optimizer = Arc::new(ChunkOptimizer::new(settings.optimizer.clone()));
        let pipeline = Arc::new(DocumentPipeline::new(
            settings.pipeline.clone(),
            settings.embedding.clone(),
            optimizer,
            batch_processor.clone(),
        ));

        let interventions = Arc::new(InterventionManager::new(repository.clone()));
        let degradation = Arc::new(GracefulDegradation::new(
            breakers.clone(),
            interventions.clone(),
        ));

        let memory = Arc::new(ConversationMemoryManager::new(
            repository.clone(),
            embedding_provider.clone(),
            generation_provider.clone(),
            settings.memory.to_memory_config(),
            settings.embedding.model.clone(),
        ));

        let catalog: Arc<dyn DocumentCatalog> =
            Arc::new(FilesystemCatalog::new(settings.pipeline.document_root.clone()));

        let chat = Arc::new(ChatService::new(
            memory.clone(),
            repository.clone(),
            embedding_provider,
            generation_provider.clone(),
            interventions.clone(),
            catalog,
            settings.llm.clone(),
            settings.embedding.model.clone(),
            &settings.pipeline,
            settings.scoring,
        ));

        let activity_logger = ActivityLogger::new(repository.clone(), LoggerConfig::default());

        Ok(Self {
            settings: Arc::new(settings),
            repository,
            embedding_cache,
            batch_processor,
            pipeline,
            memory,
            chat,
            breakers,
            degradation,
            interventions,
            generation_provider,
            activity_logger,
        })
    }
}
