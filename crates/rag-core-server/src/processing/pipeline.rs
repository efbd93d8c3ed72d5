//! End-to-end document processing: group by kind, bounded parallelism per
//! kind, extract -> chunk -> optimize -> embed per document.

use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::chunker::{ChunkingStrategy, SmartChunker};
use super::extractor::{ContentExtractor, DocumentKind};
use super::optimizer::ChunkOptimizer;
use crate::cache::batch_processor::EmbeddingBatchProcessor;
use crate::cache::embedding_cache::EmbeddingRequestItem;
use crate::config::{EmbeddingConfig, PipelineSettings};
use crate::models::chunk::ChunkStats;
use crate::utils::error::{AnalysisError, DocumentFailure};

const MIN_EXTRACTION_QUALITY: f32 = 0.1;

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub strategy: ChunkingStrategy,
    pub generate_embeddings: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            strategy: ChunkingStrategy::Adaptive,
            generate_embeddings: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentResult {
    pub document_path: String,
    pub success: bool,
    pub chunk_count: usize,
    pub embedding_count: usize,
    pub extraction_quality: f32,
    pub elapsed_ms: u64,
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BatchProcessingResult {
    pub batch_id: String,
    pub total_documents: usize,
    pub successful_documents: usize,
    pub failed_documents: usize,
    pub total_chunks: usize,
    pub total_embeddings: usize,
    pub elapsed_seconds: f64,
    pub average_extraction_quality: f32,
    pub results: Vec<DocumentResult>,
    pub errors: Vec<DocumentFailure>,
}

pub struct DocumentPipeline {
    settings: PipelineSettings,
    embedding_config: EmbeddingConfig,
    optimizer: Arc<ChunkOptimizer>,
    batcher: Arc<EmbeddingBatchProcessor>,
}

impl DocumentPipeline {
    pub fn new(
        settings: PipelineSettings,
        embedding_config: EmbeddingConfig,
        optimizer: Arc<ChunkOptimizer>,
        batcher: Arc<EmbeddingBatchProcessor>,
    ) -> Self {
        Self {
            settings,
            embedding_config,
            optimizer,
            batcher,
        }
    }

    /// Process a document set. Per-document failures never abort the
    /// batch; they are collected into the result. The whole run is bounded
    /// by the configured processing timeout.
    pub async fn process(
        &self,
        documents: Vec<PathBuf>,
        options: PipelineOptions,
        cancel: CancellationToken,
    ) -> BatchProcessingResult {
        let batch_id = Uuid::new_v4().to_string()[..8].to_string();
        let start = Instant::now();
        let total_documents = documents.len();
        info!(
            "Starting batch {} with {} documents",
            batch_id, total_documents
        );

        let timeout = Duration::from_secs(self.settings.processing_timeout_seconds);
        let mut results = match tokio::time::timeout(
            timeout,
            self.process_inner(&documents, &options, &cancel),
        )
        .await
        {
            Ok(results) => results,
            Err(_) => {
                warn!(
                    "Batch {} hit the {}s processing timeout",
                    batch_id, self.settings.processing_timeout_seconds
                );
                Vec::new()
            }
        };

        // documents that never produced a result (timeout or cancellation)
        // are recorded as failed
        let seen: Vec<String> = results.iter().map(|r| r.document_path.clone()).collect();
        for path in &documents {
            let path_str = path.to_string_lossy().to_string();
            if !seen.contains(&path_str) {
                results.push(DocumentResult {
                    document_path: path_str,
                    success: false,
                    chunk_count: 0,
                    embedding_count: 0,
                    extraction_quality: 0.0,
                    elapsed_ms: 0,
                    error: Some(if cancel.is_cancelled() {
                        AnalysisError::Cancelled.to_string()
                    } else {
                        AnalysisError::Timeout(self.settings.processing_timeout_seconds)
                            .to_string()
                    }),
                });
            }
        }

        let successful = results.iter().filter(|r| r.success).count();
        let errors: Vec<DocumentFailure> = results
            .iter()
            .filter(|r| !r.success)
            .map(|r| DocumentFailure {
                document_path: r.document_path.clone(),
                kind: "document_failed".to_string(),
                message: r.error.clone().unwrap_or_default(),
            })
            .collect();

        let quality_sum: f32 = results.iter().map(|r| r.extraction_quality).sum();

        let batch = BatchProcessingResult {
            batch_id: batch_id.clone(),
            total_documents,
            successful_documents: successful,
            failed_documents: total_documents - successful,
            total_chunks: results.iter().map(|r| r.chunk_count).sum(),
            total_embeddings: results.iter().map(|r| r.embedding_count).sum(),
            elapsed_seconds: start.elapsed().as_secs_f64(),
            average_extraction_quality: if results.is_empty() {
                0.0
            } else {
                quality_sum / results.len() as f32
            },
            results,
            errors,
        };

        info!(
            "Batch {} completed: {}/{} successful, {} chunks, {:.2}s",
            batch_id,
            batch.successful_documents,
            batch.total_documents,
            batch.total_chunks,
            batch.elapsed_seconds
        );
        batch
    }

    /// Group documents by kind; kinds run sequentially (each kind batch is
    /// a barrier), documents within a kind in parallel under the kind's
    /// concurrency bound.
    async fn process_inner(
        &self,
        documents: &[PathBuf],
        options: &PipelineOptions,
        cancel: &CancellationToken,
    ) -> Vec<DocumentResult> {
        let mut by_kind: HashMap<DocumentKind, Vec<PathBuf>> = HashMap::new();
        for path in documents {
            by_kind
                .entry(DocumentKind::from_path(path))
                .or_default()
                .push(path.clone());
        }

        let mut results = Vec::with_capacity(documents.len());

        for (kind, group) in by_kind {
            if cancel.is_cancelled() {
                break;
            }

            let limit = self
                .settings
                .max_concurrent_files
                .min(kind.concurrent_limit())
                .max(1);
            let semaphore = Arc::new(Semaphore::new(limit));

            let tasks = group.into_iter().map(|path| {
                let semaphore = semaphore.clone();
                let cancel = cancel.clone();
                async move {
                    let _permit = semaphore.acquire().await.expect("semaphore not closed");
                    self.process_document(&path, options, &cancel).await
                }
            });

            results.extend(join_all(tasks).await);
        }

        results
    }

    async fn process_document(
        &self,
        path: &Path,
        options: &PipelineOptions,
        cancel: &CancellationToken,
    ) -> DocumentResult {
        let start = Instant::now();
        let path_str = path.to_string_lossy().to_string();

        match self.process_document_inner(path, options, cancel).await {
            Ok((chunk_count, embedding_count, quality)) => DocumentResult {
                document_path: path_str,
                success: true,
                chunk_count,
                embedding_count,
                extraction_quality: quality,
                elapsed_ms: start.elapsed().as_millis() as u64,
                error: None,
            },
            Err(e) => {
                warn!("Document {} failed: {}", path.display(), e);
                DocumentResult {
                    document_path: path_str,
                    success: false,
                    chunk_count: 0,
                    embedding_count: 0,
                    extraction_quality: 0.0,
                    elapsed_ms: start.elapsed().as_millis() as u64,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn process_document_inner(
        &self,
        path: &Path,
        options: &PipelineOptions,
        cancel: &CancellationToken,
    ) -> Result<(usize, usize, f32), AnalysisError> {
        if cancel.is_cancelled() {
            return Err(AnalysisError::Cancelled);
        }

        // accessibility gate before any heavy work
        let metadata = std::fs::metadata(path)
            .map_err(|e| AnalysisError::FileAccess(format!("{}: {}", path.display(), e)))?;
        if !metadata.is_file() {
            return Err(AnalysisError::FileAccess(format!(
                "not a regular file: {}",
                path.display()
            )));
        }

        let owned_path = path.to_path_buf();
        let extracted = tokio::task::spawn_blocking(move || ContentExtractor::extract(&owned_path))
            .await
            .map_err(|e| AnalysisError::ToolInit(e.to_string()))??;

        if extracted.extraction_quality < MIN_EXTRACTION_QUALITY {
            return Err(AnalysisError::DecodeFailed(format!(
                "extraction quality {:.2} below threshold: {}",
                extracted.extraction_quality,
                extracted.processing_notes.join("; ")
            )));
        }

        if cancel.is_cancelled() {
            return Err(AnalysisError::Cancelled);
        }

        let chunks = SmartChunker::chunk_document(
            &extracted.cleaned_content,
            path,
            options.strategy,
            None,
        );

        let (optimized, _metrics) = self
            .optimizer
            .optimize(chunks, &path.to_string_lossy())
            .await;

        let stats = ChunkStats::from_chunks(&optimized);
        debug!(
            "Document {}: {} chunks, avg {:.0} tokens, avg semantic score {:.2}",
            path.display(),
            stats.total_chunks,
            stats.average_tokens,
            stats.average_semantic_score
        );

        let mut embedding_count = 0;
        if options.generate_embeddings && !optimized.is_empty() {
            let items: Vec<EmbeddingRequestItem> = optimized
                .iter()
                .map(|chunk| EmbeddingRequestItem {
                    content: chunk.content.clone(),
                    model_name: self.embedding_config.model.clone(),
                    content_type: chunk.kind.as_str().to_string(),
                    chunk_index: Some(chunk.chunk_index as i64),
                    document_path: Some(path.to_string_lossy().to_string()),
                    token_count: chunk.token_count as i64,
                })
                .collect();

            let outcome = self.batcher.process_batch(items, cancel).await?;
            embedding_count = outcome.successful_items;

            if !outcome.errors.is_empty() {
                return Err(AnalysisError::BatchAggregate {
                    failures: outcome
                        .errors
                        .into_iter()
                        .map(|e| DocumentFailure {
                            document_path: path.to_string_lossy().to_string(),
                            kind: "embedding_failed".to_string(),
                            message: e.message,
                        })
                        .collect(),
                });
            }
        }

        Ok((
            optimized.len(),
            embedding_count,
            extracted.extraction_quality,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::embedding_cache::EmbeddingCache;
    use crate::config::{BatchSettings, CacheSettings, OptimizerSettings};
    use crate::database::{DbPool, Repository};
    use crate::services::embedding_service::EmbeddingProvider;

    struct FixedProvider;

    #[async_trait::async_trait]
    impl EmbeddingProvider for FixedProvider {
        async fn embed(
            &self,
            _content: &str,
            _model_name: &str,
            _task_type: &str,
        ) -> Result<Vec<f32>, AnalysisError> {
            Ok(vec![0.1, 0.2])
        }

        async fn embed_batch(
            &self,
            contents: &[String],
            _model_name: &str,
            _task_type: &str,
        ) -> Result<Vec<Vec<f32>>, AnalysisError> {
            Ok(contents.iter().map(|_| vec![0.1, 0.2]).collect())
        }
    }

    async fn pipeline() -> DocumentPipeline {
        let db = DbPool::in_memory().await.unwrap();
        let cache = Arc::new(EmbeddingCache::new(
            CacheSettings::default(),
            Arc::new(Repository::new(db)),
        ));
        let batcher = Arc::new(EmbeddingBatchProcessor::new(
            BatchSettings::default(),
            EmbeddingConfig::default(),
            cache,
            Arc::new(FixedProvider),
        ));

        DocumentPipeline::new(
            PipelineSettings::default(),
            EmbeddingConfig::default(),
            Arc::new(ChunkOptimizer::new(OptimizerSettings::default())),
            batcher,
        )
    }

    fn write_temp(name: &str, content: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("{}-{}", Uuid::new_v4(), name));
        std::fs::write(&path, content).unwrap();
        path
    }

    #[tokio::test]
    async fn mixed_batch_reports_per_document_outcomes() {
        let pipeline = pipeline().await;
        let good = write_temp("good.md", "# Title\n\nBody text with several words here.\n");
        let missing = PathBuf::from("/definitely/not/here.txt");

        let result = pipeline
            .process(
                vec![good.clone(), missing],
                PipelineOptions::default(),
                CancellationToken::new(),
            )
            .await;
        std::fs::remove_file(&good).ok();

        assert_eq!(result.total_documents, 2);
        assert_eq!(result.successful_documents, 1);
        assert_eq!(result.failed_documents, 1);
        assert_eq!(result.errors.len(), 1);
        assert!(result.total_chunks >= 1);

        let failed = result.results.iter().find(|r| !r.success).unwrap();
        assert!(failed.error.as_deref().unwrap().contains("File access"));
    }

    #[tokio::test]
    async fn embeddings_are_generated_and_counted() {
        let pipeline = pipeline().await;
        let doc = write_temp(
            "doc.txt",
            "First paragraph with words.\n\nSecond paragraph with more words.\n",
        );

        let options = PipelineOptions {
            strategy: ChunkingStrategy::Adaptive,
            generate_embeddings: true,
        };
        let result = pipeline
            .process(vec![doc.clone()], options, CancellationToken::new())
            .await;
        std::fs::remove_file(&doc).ok();

        assert_eq!(result.successful_documents, 1);
        assert!(result.total_embeddings >= 1);
        assert_eq!(result.total_embeddings, result.total_chunks);
    }

    #[tokio::test]
    async fn cancelled_batch_marks_documents_failed() {
        let pipeline = pipeline().await;
        let doc = write_temp("doc.txt", "content for the cancelled run\n");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = pipeline
            .process(vec![doc.clone()], PipelineOptions::default(), cancel)
            .await;
        std::fs::remove_file(&doc).ok();

        assert_eq!(result.successful_documents, 0);
        assert_eq!(result.failed_documents, 1);
    }

    #[tokio::test]
    async fn empty_document_succeeds_with_zero_chunks() {
        let pipeline = pipeline().await;
        let doc = write_temp("empty.txt", "");

        let result = pipeline
            .process(
                vec![doc.clone()],
                PipelineOptions::default(),
                CancellationToken::new(),
            )
            .await;
        std::fs::remove_file(&doc).ok();

        assert_eq!(result.successful_documents, 1);
        assert_eq!(result.total_chunks, 0);
    }
}
