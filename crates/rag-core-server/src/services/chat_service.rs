//! Chat orchestration over the memory engine, the relevance selector and
//! the generation provider.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;
use uuid::Uuid;

use crate::config::{LlmConfig, PipelineSettings, ScoringWeights};
use crate::database::Repository;
use crate::memory::keywords::extract_keywords;
use crate::memory::manager::ConversationMemoryManager;
use crate::models::chat::ChatMessage;
use crate::models::tags::TagModel;
use crate::resilience::intervention::InterventionManager;
use crate::selection::tag_selector::{CandidateDocument, TagBasedSelector};
use crate::services::catalog::DocumentCatalog;
use crate::services::embedding_service::EmbeddingProvider;
use crate::services::llm_service::{GenerationConfig, GenerationProvider};
use crate::utils::error::AnalysisError;
use crate::utils::similarity::cosine_similarity;
use crate::utils::token_estimator::estimate_tokens;

const CONTEXT_TOKEN_BUDGET: usize = 16_000;
const MEMORY_TOKEN_BUDGET: usize = 4_000;

#[derive(Debug, Clone, Serialize)]
pub struct ChatSource {
    pub document_path: String,
    pub similarity: f32,
    pub chunk_count: usize,
}

#[derive(Debug, Serialize)]
pub struct ChatOutcome {
    pub conversation_id: String,
    pub reply: String,
    pub sources: Vec<ChatSource>,
    pub agent_steps: Vec<String>,
    pub elapsed_ms: u64,
    pub suggestions: Vec<String>,
    pub partial: bool,
    pub intervention_task_id: Option<String>,
}

pub struct ChatService {
    memory: Arc<ConversationMemoryManager>,
    repository: Arc<Repository>,
    embedding_provider: Arc<dyn EmbeddingProvider>,
    generation_provider: Arc<dyn GenerationProvider>,
    interventions: Arc<InterventionManager>,
    catalog: Arc<dyn DocumentCatalog>,
    selector: TagBasedSelector,
    llm_config: LlmConfig,
    embedding_model: String,
}

impl ChatService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        memory: Arc<ConversationMemoryManager>,
        repository: Arc<Repository>,
        embedding_provider: Arc<dyn EmbeddingProvider>,
        generation_provider: Arc<dyn GenerationProvider>,
        interventions: Arc<InterventionManager>,
        catalog: Arc<dyn DocumentCatalog>,
        llm_config: LlmConfig,
        embedding_model: String,
        pipeline: &PipelineSettings,
        weights: ScoringWeights,
    ) -> Self {
        Self {
            memory,
            repository,
            embedding_provider,
            generation_provider,
            interventions,
            catalog,
            selector: TagBasedSelector::new(pipeline.max_documents_per_query, weights),
            llm_config,
            embedding_model,
        }
    }

    /// Resolve caller-supplied document references: real paths pass
    /// through, bare filenames go through the catalog.
    async fn resolve_documents(&self, document_paths: &[String]) -> Vec<String> {
        let mut resolved = Vec::with_capacity(document_paths.len());

        for reference in document_paths {
            if std::path::Path::new(reference).is_file() {
                resolved.push(reference.clone());
                continue;
            }

            match self.catalog.find_by_filename(reference, "default").await {
                Ok(Some(path)) => {
                    let path = path.to_string_lossy().to_string();
                    match self.catalog.access_allowed(&path, "default", "default").await {
                        Ok(true) => resolved.push(path),
                        Ok(false) => warn!("Access denied for document: {}", path),
                        Err(e) => warn!("Access check failed for {}: {}", path, e),
                    }
                }
                Ok(None) => {
                    let similar = self
                        .catalog
                        .similar(reference, "default", 3)
                        .await
                        .unwrap_or_default();
                    if similar.is_empty() {
                        warn!("Document reference not found: {}", reference);
                    } else {
                        warn!(
                            "Document reference {} not found; similar names: {:?}",
                            reference, similar
                        );
                    }
                }
                Err(e) => warn!("Catalog lookup failed for {}: {}", reference, e),
            }
        }

        resolved
    }

    /// Handle one chat turn. A generation failure still produces a
    /// best-effort reply with `partial = true` and an intervention task id.
    pub async fn handle_message(
        &self,
        conversation_id: Option<String>,
        message: &str,
        document_paths: &[String],
        include_sources: bool,
        max_documents: Option<usize>,
    ) -> Result<ChatOutcome, AnalysisError> {
        let start = Instant::now();
        let conversation_id =
            conversation_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        // stage markers stand in for live agent telemetry
        let mut agent_steps = vec!["understand".to_string()];

        let user_message = ChatMessage::user(message);
        self.memory
            .add_message(&conversation_id, &user_message)
            .await?;

        agent_steps.push("embed".to_string());
        let query_embedding = match self
            .embedding_provider
            .embed(message, &self.embedding_model, "semantic_similarity")
            .await
        {
            Ok(embedding) => Some(embedding),
            Err(e) => {
                warn!("Query embedding failed, falling back to path order: {}", e);
                None
            }
        };

        agent_steps.push("retrieve".to_string());
        let resolved_paths = self.resolve_documents(document_paths).await;
        let sources = self
            .rank_sources(message, &resolved_paths, query_embedding.as_deref(), max_documents)
            .await;

        let context_block = self
            .build_context_block(&sources, query_embedding.as_deref())
            .await;

        let memory_context = self
            .memory
            .relevant_context(&conversation_id, message, MEMORY_TOKEN_BUDGET)
            .await?;

        agent_steps.push("compose".to_string());
        let mut prompt = String::from(
            "You are a document analysis assistant. Answer strictly from the \
             provided context and say so when the context is insufficient.\n\n",
        );
        if !context_block.is_empty() {
            prompt.push_str(&context_block);
            prompt.push('\n');
        }
        if !memory_context.summaries.is_empty() {
            prompt.push_str("CONVERSATION SUMMARIES:\n");
            for summary in &memory_context.summaries {
                prompt.push_str(&format!("- {}\n", summary.content));
            }
            prompt.push('\n');
        }
        for past in &memory_context.messages {
            prompt.push_str(&format!("{}: {}\n", past.role.as_str(), past.content));
        }
        prompt.push_str(&format!("user: {message}\nassistant:"));

        let generation = GenerationConfig {
            max_tokens: self.llm_config.max_tokens,
            temperature: self.llm_config.temperature,
        };

        let (reply, partial, intervention_task_id) = match self
            .generation_provider
            .generate(&prompt, &generation)
            .await
        {
            Ok(reply) => (reply, false, None),
            Err(e) => {
                warn!("Chat generation failed: {}", e);
                let task_id = self
                    .interventions
                    .handle_failure(
                        &e,
                        None,
                        serde_json::json!({ "conversation_id": conversation_id }),
                    )
                    .await
                    .unwrap_or(None);
                (
                    "I could not complete the analysis for this message. The most \
                     relevant sources found so far are listed; please retry shortly."
                        .to_string(),
                    true,
                    task_id,
                )
            }
        };

        let assistant_message = ChatMessage::assistant(reply.clone());
        if let Err(e) = self
            .memory
            .add_message(&conversation_id, &assistant_message)
            .await
        {
            warn!("Failed to record assistant message: {}", e);
        }

        agent_steps.push("finalize".to_string());

        let mut suggestions = Vec::new();
        if sources.is_empty() && !document_paths.is_empty() {
            suggestions
                .push("No indexed chunks matched; re-process the documents first".to_string());
        }
        if query_embedding.is_none() {
            suggestions.push("Embedding provider unavailable; ranking fell back to path order".to_string());
        }

        Ok(ChatOutcome {
            conversation_id,
            reply,
            sources: if include_sources { sources } else { Vec::new() },
            agent_steps,
            elapsed_ms: start.elapsed().as_millis() as u64,
            suggestions,
            partial,
            intervention_task_id,
        })
    }

    /// Rank candidate documents with the tag selector: query keywords as
    /// the target tag set, cached chunk previews and vectors as the
    /// candidate side. Falls back to best-chunk cosine order when tag
    /// scoring selects nothing.
    async fn rank_sources(
        &self,
        message: &str,
        document_paths: &[String],
        query_embedding: Option<&[f32]>,
        max_documents: Option<usize>,
    ) -> Vec<ChatSource> {
        if document_paths.is_empty() {
            return Vec::new();
        }

        let entries = match self
            .repository
            .embeddings_for_documents(document_paths, 500)
            .await
        {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Source lookup failed: {}", e);
                Vec::new()
            }
        };

        let mut grouped: HashMap<String, Vec<&crate::models::embedding::EmbeddingEntry>> =
            HashMap::new();
        for entry in &entries {
            if let Some(path) = &entry.document_path {
                grouped.entry(path.clone()).or_default().push(entry);
            }
        }

        let target_tags: Vec<TagModel> = extract_keywords(message)
            .into_iter()
            .take(5)
            .enumerate()
            .map(|(rank, keyword)| {
                TagModel::new(keyword, (0.9 - rank as f32 * 0.1).max(0.5))
                    .with_category("content")
            })
            .collect();

        let candidates: Vec<CandidateDocument> = grouped
            .iter()
            .map(|(path, chunks)| {
                let corpus: String = chunks
                    .iter()
                    .map(|e| e.content_preview.as_str())
                    .collect::<Vec<_>>()
                    .join(" ");
                let tags: Vec<TagModel> = extract_keywords(&corpus)
                    .into_iter()
                    .take(5)
                    .enumerate()
                    .map(|(rank, keyword)| {
                        TagModel::new(keyword, (0.9 - rank as f32 * 0.1).max(0.5))
                            .with_category("content")
                    })
                    .collect();

                CandidateDocument {
                    file_path: path.clone(),
                    tags,
                    last_analyzed: chunks.iter().map(|e| e.created_at).max(),
                    chunk_embeddings: chunks.iter().map(|e| e.vector.clone()).collect(),
                    structure_score: 0.5,
                }
            })
            .collect();

        let selected = self
            .selector
            .select(&target_tags, &candidates, &[], query_embedding);

        let mut sources: Vec<ChatSource> = if selected.is_empty() {
            // no tag overlap at all: order by best chunk similarity
            let mut by_similarity: Vec<ChatSource> = grouped
                .iter()
                .map(|(path, chunks)| {
                    let similarity = query_embedding
                        .map(|q| {
                            chunks
                                .iter()
                                .filter_map(|e| cosine_similarity(q, &e.vector).ok())
                                .fold(0.0_f32, f32::max)
                        })
                        .unwrap_or(0.0);
                    ChatSource {
                        document_path: path.clone(),
                        similarity,
                        chunk_count: chunks.len(),
                    }
                })
                .collect();
            by_similarity.sort_by(|a, b| {
                b.similarity
                    .partial_cmp(&a.similarity)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            by_similarity
        } else {
            selected
                .into_iter()
                .map(|score| ChatSource {
                    chunk_count: grouped
                        .get(&score.file_path)
                        .map(|chunks| chunks.len())
                        .unwrap_or(0),
                    similarity: score.total_score,
                    document_path: score.file_path,
                })
                .collect()
        };

        if let Some(limit) = max_documents {
            sources.truncate(limit);
        }
        sources
    }

    /// Structured context block over the best chunks of the selected
    /// sources, bounded by the context token budget.
    async fn build_context_block(
        &self,
        sources: &[ChatSource],
        query_embedding: Option<&[f32]>,
    ) -> String {
        if sources.is_empty() {
            return String::new();
        }

        let paths: Vec<String> = sources.iter().map(|s| s.document_path.clone()).collect();
        let entries = match self.repository.embeddings_for_documents(&paths, 500).await {
            Ok(entries) => entries,
            Err(_) => return String::new(),
        };

        let mut context = String::from("AVAILABLE DOCUMENTS:\n\n");
        let mut used_tokens = estimate_tokens(&context);

        for source in sources {
            let mut doc_chunks: Vec<(&crate::models::embedding::EmbeddingEntry, f32)> = entries
                .iter()
                .filter(|e| e.document_path.as_deref() == Some(source.document_path.as_str()))
                .map(|e| {
                    let similarity = query_embedding
                        .and_then(|q| cosine_similarity(q, &e.vector).ok())
                        .unwrap_or(0.0);
                    (e, similarity)
                })
                .collect();
            doc_chunks.sort_by(|a, b| {
                b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal)
            });

            let header = format!(
                "<document path=\"{}\" relevance=\"{:.3}\">\n",
                source.document_path, source.similarity
            );
            if used_tokens + estimate_tokens(&header) > CONTEXT_TOKEN_BUDGET {
                break;
            }
            context.push_str(&header);
            used_tokens += estimate_tokens(&header);

            for (entry, similarity) in doc_chunks {
                let chunk_text = format!(
                    "<chunk ordinal=\"{}\" similarity=\"{:.3}\">\n{}\n</chunk>\n",
                    entry.chunk_index.unwrap_or(0),
                    similarity,
                    entry.content_preview.trim()
                );
                if used_tokens + estimate_tokens(&chunk_text) > CONTEXT_TOKEN_BUDGET {
                    break;
                }
                context.push_str(&chunk_text);
                used_tokens += estimate_tokens(&chunk_text);
            }

            context.push_str("</document>\n\n");
        }

        context
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::DbPool;
    use crate::models::memory::ConversationMemoryConfig;
    use std::path::PathBuf;

    struct StubEmbedder;

    #[async_trait::async_trait]
    impl EmbeddingProvider for StubEmbedder {
        async fn embed(
            &self,
            _content: &str,
            _model_name: &str,
            _task_type: &str,
        ) -> Result<Vec<f32>, AnalysisError> {
            Ok(vec![1.0, 0.0])
        }

        async fn embed_batch(
            &self,
            contents: &[String],
            _model_name: &str,
            _task_type: &str,
        ) -> Result<Vec<Vec<f32>>, AnalysisError> {
            Ok(contents.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    struct StubGenerator {
        fail: bool,
    }

    #[async_trait::async_trait]
    impl GenerationProvider for StubGenerator {
        async fn generate(
            &self,
            _prompt: &str,
            _config: &GenerationConfig,
        ) -> Result<String, AnalysisError> {
            if self.fail {
                Err(AnalysisError::ProviderTransient("down".to_string()))
            } else {
                Ok("generated reply".to_string())
            }
        }
    }

    async fn service(fail_generation: bool) -> ChatService {
        let db = DbPool::in_memory().await.unwrap();
        let repository = Arc::new(Repository::new(db));
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(StubEmbedder);
        let generator: Arc<dyn GenerationProvider> = Arc::new(StubGenerator {
            fail: fail_generation,
        });
        let memory = Arc::new(ConversationMemoryManager::new(
            repository.clone(),
            embedder.clone(),
            generator.clone(),
            ConversationMemoryConfig::default(),
            "test-model".to_string(),
        ));
        let interventions = Arc::new(InterventionManager::new(repository.clone()));
        let catalog: Arc<dyn DocumentCatalog> = Arc::new(
            crate::services::catalog::FilesystemCatalog::new(std::env::temp_dir()),
        );

        ChatService::new(
            memory,
            repository,
            embedder,
            generator,
            interventions,
            catalog,
            LlmConfig::default(),
            "test-model".to_string(),
            &PipelineSettings::default(),
            ScoringWeights::default(),
        )
    }

    #[tokio::test]
    async fn successful_turn_returns_reply_and_conversation_id() {
        let chat = service(false).await;
        let outcome = chat
            .handle_message(None, "what does the cache do", &[], true, None)
            .await
            .unwrap();

        assert_eq!(outcome.reply, "generated reply");
        assert!(!outcome.partial);
        assert!(!outcome.conversation_id.is_empty());
        assert!(outcome.agent_steps.contains(&"compose".to_string()));
    }

    #[tokio::test]
    async fn conversation_id_is_stable_across_turns() {
        let chat = service(false).await;
        let first = chat
            .handle_message(None, "first question", &[], true, None)
            .await
            .unwrap();
        let second = chat
            .handle_message(
                Some(first.conversation_id.clone()),
                "second question",
                &[],
                true,
                None,
            )
            .await
            .unwrap();

        assert_eq!(first.conversation_id, second.conversation_id);

        let state = chat
            .memory
            .get_state(&first.conversation_id)
            .await
            .unwrap()
            .unwrap();
        // two user turns plus two assistant replies
        assert_eq!(state.message_count, 4);
    }

    #[tokio::test]
    async fn generation_failure_degrades_to_partial_reply() {
        let chat = service(true).await;
        let outcome = chat
            .handle_message(None, "a doomed question", &[], true, None)
            .await
            .unwrap();

        assert!(outcome.partial);
        assert!(!outcome.reply.is_empty());
    }

    #[tokio::test]
    async fn sources_rank_documents_with_cached_chunks() {
        let chat = service(false).await;

        // seed cached chunks for a real file
        let doc = std::env::temp_dir().join(format!("{}-chat.md", uuid::Uuid::new_v4()));
        std::fs::write(&doc, "eviction policies for the embedding cache").unwrap();
        let doc_str = doc.to_string_lossy().to_string();

        let entry = crate::models::embedding::EmbeddingEntry {
            content_hash: "k1".to_string(),
            vector: vec![1.0, 0.0],
            model_name: "test-model".to_string(),
            content_preview: "eviction policies for the embedding cache".to_string(),
            token_count: 6,
            created_at: chrono::Utc::now(),
            last_accessed: chrono::Utc::now(),
            access_count: 1,
            content_type: "text".to_string(),
            chunk_index: Some(0),
            document_path: Some(doc_str.clone()),
        };
        chat.repository.upsert_embedding(&entry).await.unwrap();

        let outcome = chat
            .handle_message(
                None,
                "tell me about eviction policies",
                std::slice::from_ref(&doc_str),
                true,
                None,
            )
            .await
            .unwrap();
        std::fs::remove_file(PathBuf::from(&doc_str)).ok();

        assert_eq!(outcome.sources.len(), 1);
        assert_eq!(outcome.sources[0].document_path, doc_str);
        assert_eq!(outcome.sources[0].chunk_count, 1);
        assert!(outcome.sources[0].similarity > 0.0);
    }
}
