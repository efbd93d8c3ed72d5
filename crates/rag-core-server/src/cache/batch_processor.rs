//! Coalesced embedding production with cache-first lookups and adaptive
//! batch sizing.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::embedding_cache::{EmbeddingCache, EmbeddingRequestItem};
use crate::config::{BatchSettings, EmbeddingConfig};
use crate::services::embedding_service::EmbeddingProvider;
use crate::utils::error::AnalysisError;
use crate::utils::hashing::embedding_cache_key;

const HISTORY_WINDOW: usize = 20;
const SCORE_SAMPLE: usize = 5;
const GROW_ABOVE: f64 = 50.0;
const SHRINK_BELOW: f64 = 20.0;
const SIZE_STEP: usize = 5;
const MIN_BATCH_SIZE: usize = 10;

#[derive(Debug, Clone, serde::Serialize)]
pub struct BatchError {
    pub model_name: String,
    pub message: String,
    pub item_count: usize,
}

/// Result of one batch run. `embeddings` maps cache keys to vectors.
#[derive(Debug)]
pub struct BatchOutcome {
    pub batch_id: String,
    pub total_items: usize,
    pub successful_items: usize,
    pub failed_items: usize,
    pub cached_items: usize,
    pub processing_time: Duration,
    pub embeddings: HashMap<String, Vec<f32>>,
    pub errors: Vec<BatchError>,
}

pub struct EmbeddingBatchProcessor {
    settings: BatchSettings,
    embedding_config: EmbeddingConfig,
    cache: Arc<EmbeddingCache>,
    provider: Arc<dyn EmbeddingProvider>,
    in_flight: Semaphore,
    score_history: Mutex<VecDeque<f64>>,
    optimal_batch_size: AtomicUsize,
    total_batches: AtomicU64,
    total_items: AtomicU64,
}

impl EmbeddingBatchProcessor {
    pub fn new(
        settings: BatchSettings,
        embedding_config: EmbeddingConfig,
        cache: Arc<EmbeddingCache>,
        provider: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        info!(
            "Embedding batch processor initialized: max batch size {}, {} concurrent batches",
            settings.max_batch_size, settings.max_concurrent_batches
        );
        Self {
            in_flight: Semaphore::new(settings.max_concurrent_batches),
            optimal_batch_size: AtomicUsize::new(settings.max_batch_size),
            settings,
            embedding_config,
            cache,
            provider,
            score_history: Mutex::new(VecDeque::with_capacity(HISTORY_WINDOW)),
            total_batches: AtomicU64::new(0),
            total_items: AtomicU64::new(0),
        }
    }

    /// Current optimal batch size; fixed at the configured max when
    /// adaptive sizing is off.
    pub fn optimal_batch_size(&self) -> usize {
        if self.settings.adaptive_batching {
            self.optimal_batch_size.load(Ordering::Relaxed)
        } else {
            self.settings.max_batch_size
        }
    }

    /// Process one batch: cache-first, then provider calls grouped by
    /// model. Provider failures never corrupt the cache; only produced
    /// vectors are persisted. In-flight batches are bounded, excess calls
    /// wait on the semaphore.
    pub async fn process_batch(
        &self,
        items: Vec<EmbeddingRequestItem>,
        cancel: &CancellationToken,
    ) -> Result<BatchOutcome, AnalysisError> {
        let _permit = self
            .in_flight
            .acquire()
            .await
            .map_err(|_| AnalysisError::Cancelled)?;

        let batch_id = Uuid::new_v4().to_string()[..8].to_string();
        let start = Instant::now();
        let total_items = items.len();
        debug!("Processing batch {} with {} items", batch_id, total_items);

        if cancel.is_cancelled() {
            return Err(AnalysisError::Cancelled);
        }

        let lookup = self.cache.batch_get(items).await;
        let cached_items = lookup.hits.len();
        let mut embeddings = lookup.hits;
        let mut errors: Vec<BatchError> = Vec::new();

        // group misses by model so one provider call covers one model
        let mut by_model: HashMap<String, Vec<EmbeddingRequestItem>> = HashMap::new();
        for item in lookup.misses {
            by_model.entry(item.model_name.clone()).or_default().push(item);
        }

        for (model_name, model_items) in by_model {
            if cancel.is_cancelled() {
                return Err(AnalysisError::Cancelled);
            }

            let contents: Vec<String> = model_items.iter().map(|i| i.content.clone()).collect();
            match self.embed_with_retry(&contents, &model_name, cancel).await {
                Ok(vectors) => {
                    let mut produced = HashMap::new();
                    for (item, vector) in model_items.iter().zip(vectors) {
                        let key = embedding_cache_key(&item.content, &item.model_name);
                        produced.insert(key, vector);
                    }

                    if let Err(e) = self.cache.batch_put(&model_items, &produced).await {
                        warn!("Failed to cache batch {} results: {}", batch_id, e);
                    }
                    embeddings.extend(produced);
                }
                Err(e) => {
                    warn!(
                        "Model {} failed in batch {}: {} ({} items)",
                        model_name,
                        batch_id,
                        e,
                        model_items.len()
                    );
                    errors.push(BatchError {
                        model_name,
                        message: e.to_string(),
                        item_count: model_items.len(),
                    });
                }
            }
        }

        let processing_time = start.elapsed();
        let failed_items: usize = errors.iter().map(|e| e.item_count).sum();

        self.total_batches.fetch_add(1, Ordering::Relaxed);
        self.total_items.fetch_add(total_items as u64, Ordering::Relaxed);

        if self.settings.adaptive_batching && total_items > 0 {
            self.record_batch_performance(total_items, processing_time, failed_items);
        }

        info!(
            "Batch {} completed: {}/{} successful, {} cached, {:.2}s",
            batch_id,
            embeddings.len(),
            total_items,
            cached_items,
            processing_time.as_secs_f64()
        );

        Ok(BatchOutcome {
            batch_id,
            total_items,
            successful_items: embeddings.len(),
            failed_items,
            cached_items,
            processing_time,
            embeddings,
            errors,
        })
    }

    /// Process a large item set as a sequence of sub-batches, reporting
    /// progress after each one.
    pub async fn process_streaming<F>(
        &self,
        items: Vec<EmbeddingRequestItem>,
        cancel: &CancellationToken,
        mut on_progress: F,
    ) -> Result<BatchOutcome, AnalysisError>
    where
        F: FnMut(usize, usize),
    {
        let chunk_size = (self.settings.max_batch_size / 2).clamp(1, 20);
        let total = items.len();
        let start = Instant::now();

        let mut embeddings = HashMap::new();
        let mut errors = Vec::new();
        let mut cached_items = 0;
        let batch_id = Uuid::new_v4().to_string()[..8].to_string();

        let chunks: Vec<Vec<EmbeddingRequestItem>> =
            items.chunks(chunk_size).map(|c| c.to_vec()).collect();

        for chunk in chunks {
            if cancel.is_cancelled() {
                return Err(AnalysisError::Cancelled);
            }

            let outcome = self.process_batch(chunk, cancel).await?;
            cached_items += outcome.cached_items;
            embeddings.extend(outcome.embeddings);
            errors.extend(outcome.errors);
            on_progress(embeddings.len(), total);
        }

        let failed_items: usize = errors.iter().map(|e| e.item_count).sum();
        Ok(BatchOutcome {
            batch_id,
            total_items: total,
            successful_items: embeddings.len(),
            failed_items,
            cached_items,
            processing_time: start.elapsed(),
            embeddings,
            errors,
        })
    }

    /// Provider call with in-band retries. Only the final failure escapes
    /// to the caller (and from there to the circuit breaker).
    async fn embed_with_retry(
        &self,
        contents: &[String],
        model_name: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Vec<f32>>, AnalysisError> {
        let attempts = self.embedding_config.retry_attempts.max(1);
        let delay = Duration::from_millis(self.embedding_config.request_delay_ms);
        let mut last_error = AnalysisError::ProviderTransient("no attempt made".to_string());

        for attempt in 1..=attempts {
            if cancel.is_cancelled() {
                return Err(AnalysisError::Cancelled);
            }

            match self
                .provider
                .embed_batch(contents, model_name, &self.embedding_config.task_type)
                .await
            {
                Ok(vectors) => return Ok(vectors),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    warn!(
                        "Embedding attempt {}/{} failed for model {}: {}. Retrying in {}ms",
                        attempt,
                        attempts,
                        model_name,
                        e,
                        delay.as_millis()
                    );
                    last_error = e;
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error)
    }

    /// score = size / max(elapsed, 0.1) * (1 - min(errors/size, 1)).
    /// The mean of the last five scores steers the optimal size.
    fn record_batch_performance(&self, batch_size: usize, elapsed: Duration, error_count: usize) {
        let elapsed_s = elapsed.as_secs_f64().max(0.1);
        let error_ratio = (error_count as f64 / batch_size as f64).min(1.0);
        let score = batch_size as f64 / elapsed_s * (1.0 - error_ratio);

        let mut history = self.score_history.lock();
        history.push_back(score);
        while history.len() > HISTORY_WINDOW {
            history.pop_front();
        }

        if history.len() < SCORE_SAMPLE {
            return;
        }

        let recent: f64 =
            history.iter().rev().take(SCORE_SAMPLE).sum::<f64>() / SCORE_SAMPLE as f64;

        let current = self.optimal_batch_size.load(Ordering::Relaxed);
        let next = if recent > GROW_ABOVE {
            (current + SIZE_STEP).min(self.settings.max_batch_size)
        } else if recent < SHRINK_BELOW {
            current.saturating_sub(SIZE_STEP).max(MIN_BATCH_SIZE)
        } else {
            current
        };

        if next != current {
            debug!(
                "Adaptive batch size {} -> {} (recent score {:.1})",
                current, next, recent
            );
            self.optimal_batch_size.store(next, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{DbPool, Repository};
    use crate::config::CacheSettings;
    use std::sync::atomic::AtomicUsize;

    /// Deterministic stub provider: embeds to a fixed vector, optionally
    /// failing the first N calls.
    struct StubProvider {
        calls: AtomicUsize,
        fail_first: usize,
    }

    #[async_trait::async_trait]
    impl EmbeddingProvider for StubProvider {
        async fn embed(
            &self,
            content: &str,
            model_name: &str,
            task_type: &str,
        ) -> Result<Vec<f32>, AnalysisError> {
            let batch = self
                .embed_batch(&[content.to_string()], model_name, task_type)
                .await?;
            Ok(batch.into_iter().next().unwrap())
        }

        async fn embed_batch(
            &self,
            contents: &[String],
            _model_name: &str,
            _task_type: &str,
        ) -> Result<Vec<Vec<f32>>, AnalysisError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err(AnalysisError::ProviderTransient("flaky".to_string()));
            }
            Ok(contents.iter().map(|c| vec![c.len() as f32, 1.0]).collect())
        }
    }

    async fn processor(fail_first: usize) -> (EmbeddingBatchProcessor, Arc<StubProvider>) {
        let db = DbPool::in_memory().await.unwrap();
        let cache = Arc::new(EmbeddingCache::new(
            CacheSettings::default(),
            Arc::new(Repository::new(db)),
        ));
        let provider = Arc::new(StubProvider {
            calls: AtomicUsize::new(0),
            fail_first,
        });
        let mut embedding_config = EmbeddingConfig::default();
        embedding_config.request_delay_ms = 1;

        (
            EmbeddingBatchProcessor::new(
                BatchSettings::default(),
                embedding_config,
                cache,
                provider.clone(),
            ),
            provider,
        )
    }

    fn items(count: usize) -> Vec<EmbeddingRequestItem> {
        (0..count)
            .map(|i| EmbeddingRequestItem {
                content: format!("content {i}"),
                model_name: "m1".to_string(),
                content_type: "text".to_string(),
                chunk_index: Some(i as i64),
                document_path: Some("doc.md".to_string()),
                token_count: 2,
            })
            .collect()
    }

    #[tokio::test]
    async fn second_run_is_fully_cached() {
        let (processor, provider) = processor(0).await;
        let cancel = CancellationToken::new();

        let first = processor.process_batch(items(4), &cancel).await.unwrap();
        assert_eq!(first.successful_items, 4);
        assert_eq!(first.cached_items, 0);

        let second = processor.process_batch(items(4), &cancel).await.unwrap();
        assert_eq!(second.cached_items, 4);
        // the provider was only consulted once
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_in_band() {
        let (processor, provider) = processor(2).await;
        let cancel = CancellationToken::new();

        let outcome = processor.process_batch(items(3), &cancel).await.unwrap();
        assert_eq!(outcome.successful_items, 3);
        assert!(outcome.errors.is_empty());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_as_batch_errors_without_caching() {
        let (processor, _provider) = processor(100).await;
        let cancel = CancellationToken::new();

        let outcome = processor.process_batch(items(2), &cancel).await.unwrap();
        assert_eq!(outcome.successful_items, 0);
        assert_eq!(outcome.failed_items, 2);
        assert_eq!(outcome.errors.len(), 1);

        // nothing was persisted for the failed content
        let snapshot = processor.cache.stats().await;
        assert_eq!(snapshot.persistent_entries, 0);
        assert!(snapshot.misses >= 2);
    }

    #[tokio::test]
    async fn cancelled_token_aborts_processing() {
        let (processor, _provider) = processor(0).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = processor.process_batch(items(2), &cancel).await;
        assert!(matches!(result, Err(AnalysisError::Cancelled)));
    }

    #[tokio::test]
    async fn good_scores_grow_the_optimal_size() {
        let (processor, _provider) = processor(0).await;
        let start = processor.optimal_batch_size();
        // five fast large batches: score = 50/0.1 = 500 > 50
        for _ in 0..5 {
            processor.record_batch_performance(50, Duration::from_millis(10), 0);
        }
        assert_eq!(
            processor.optimal_batch_size(),
            start.min(processor.settings.max_batch_size)
        );
        // already at the cap; shrink path next
        for _ in 0..5 {
            processor.record_batch_performance(1, Duration::from_secs(1), 0);
        }
        assert_eq!(processor.optimal_batch_size(), start - SIZE_STEP);
    }

    #[tokio::test]
    async fn bad_scores_shrink_down_to_the_floor() {
        let (processor, _provider) = processor(0).await;
        // score = 1/1 * 1 = 1 < 20 every time
        for _ in 0..100 {
            processor.record_batch_performance(1, Duration::from_secs(1), 0);
        }
        assert_eq!(processor.optimal_batch_size(), MIN_BATCH_SIZE);
    }

    #[tokio::test]
    async fn streaming_reports_progress_per_sub_batch() {
        let (processor, _provider) = processor(0).await;
        let cancel = CancellationToken::new();
        let mut reports = Vec::new();

        let outcome = processor
            .process_streaming(items(45), &cancel, |done, total| {
                reports.push((done, total));
            })
            .await
            .unwrap();

        assert_eq!(outcome.successful_items, 45);
        assert!(reports.len() >= 2);
        assert_eq!(reports.last().unwrap(), &(45, 45));
    }
}
