//! Post-chunk optimization keyed to a cost/quality strategy, with an LRU
//! cache of optimized chunks and memory-pressure awareness.

use futures::future::join_all;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::System;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use crate::cache::strategies::{EvictionPolicy, MemoryCache};
use crate::config::OptimizerSettings;
use crate::models::chunk::DocumentChunk;
use crate::utils::hashing::content_digest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizationStrategy {
    Speed,
    Memory,
    Balanced,
}

impl OptimizationStrategy {
    pub fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "speed" => Self::Speed,
            "memory" => Self::Memory,
            _ => Self::Balanced,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OptimizationMetrics {
    pub total_chunks: usize,
    pub processing_time_ms: f64,
    pub memory_delta_mb: f64,
    pub cache_hit_ratio: f64,
    pub average_semantic_score: f64,
    pub chunk_size_variance: f64,
    pub optimization_suggestions: Vec<String>,
}

static INLINE_SPACE_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r" {2,}").unwrap());
static NEWLINE_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

const LARGE_CHUNK_BYTES: usize = 10_000;

pub struct ChunkOptimizer {
    settings: OptimizerSettings,
    strategy: OptimizationStrategy,
    cache: MemoryCache<DocumentChunk>,
    system: Mutex<System>,
    history: Mutex<Vec<OptimizationMetrics>>,
    cache_probes: Mutex<(u64, u64)>, // (hits, total)
}

impl ChunkOptimizer {
    pub fn new(settings: OptimizerSettings) -> Self {
        let strategy = OptimizationStrategy::parse(&settings.strategy);
        info!("Chunk optimizer initialized with strategy {:?}", strategy);
        Self {
            cache: MemoryCache::new(
                EvictionPolicy::Lru,
                settings.chunk_cache_size,
                Duration::from_secs(3600),
            ),
            strategy,
            settings,
            system: Mutex::new(System::new_all()),
            history: Mutex::new(Vec::new()),
            cache_probes: Mutex::new((0, 0)),
        }
    }

    /// Optimize a chunk list. Output preserves ordinal order regardless of
    /// the concurrency underneath.
    pub async fn optimize(
        self: &Arc<Self>,
        chunks: Vec<DocumentChunk>,
        document_path: &str,
    ) -> (Vec<DocumentChunk>, OptimizationMetrics) {
        let start = Instant::now();
        let initial_memory = self.used_memory_mb();
        let original_count = chunks.len();
        debug!(
            "Optimizing {} chunks for document {}",
            original_count, document_path
        );

        let optimized = match self.strategy {
            OptimizationStrategy::Speed => self.optimize_for_speed(chunks).await,
            OptimizationStrategy::Memory => self.optimize_for_memory(chunks),
            OptimizationStrategy::Balanced => self.optimize_balanced(chunks).await,
        };

        let metrics = self.build_metrics(
            &optimized,
            start.elapsed(),
            self.used_memory_mb() - initial_memory,
        );

        self.history.lock().push(metrics.clone());

        info!(
            "Chunk optimization completed: {} chunks, {:.2}ms",
            optimized.len(),
            metrics.processing_time_ms
        );

        (optimized, metrics)
    }

    /// Maximum concurrency under a semaphore; results re-sorted by ordinal.
    async fn optimize_for_speed(self: &Arc<Self>, chunks: Vec<DocumentChunk>) -> Vec<DocumentChunk> {
        let semaphore = Arc::new(Semaphore::new(self.settings.max_concurrent_chunks));

        let tasks = chunks.into_iter().map(|chunk| {
            let semaphore = semaphore.clone();
            let optimizer = self.clone();
            async move {
                let _permit = semaphore.acquire().await.expect("semaphore not closed");
                optimizer.optimize_single(chunk, false)
            }
        });

        let mut optimized: Vec<DocumentChunk> = join_all(tasks).await;
        optimized.sort_by_key(|c| c.chunk_index);
        optimized
    }

    /// Sequential, with aggressive whitespace compression and cache
    /// clearing under memory pressure.
    fn optimize_for_memory(&self, chunks: Vec<DocumentChunk>) -> Vec<DocumentChunk> {
        let mut optimized = Vec::with_capacity(chunks.len());

        for chunk in chunks {
            let pressured = self.memory_pressure() >= self.settings.memory_pressure_threshold;
            let result = self.optimize_single(chunk, pressured && self.settings.enable_compression);
            optimized.push(result);

            if pressured {
                let cleared = self.cache.len();
                self.cache.clear();
                if cleared > 0 {
                    debug!("Cleared chunk cache under memory pressure: {} items", cleared);
                }
            }
        }

        optimized
    }

    /// Batches sized by available memory, each batch routed to the memory
    /// or speed path depending on current pressure.
    async fn optimize_balanced(self: &Arc<Self>, chunks: Vec<DocumentChunk>) -> Vec<DocumentChunk> {
        let batch_size = self.optimal_batch_size(&chunks);
        let mut optimized = Vec::with_capacity(chunks.len());

        let batches: Vec<Vec<DocumentChunk>> =
            chunks.chunks(batch_size).map(|b| b.to_vec()).collect();

        for batch in batches {
            if self.memory_pressure() >= self.settings.memory_pressure_threshold {
                optimized.extend(self.optimize_for_memory(batch));
            } else {
                optimized.extend(self.optimize_for_speed(batch).await);
            }
            tokio::task::yield_now().await;
        }

        optimized
    }

    fn optimize_single(&self, chunk: DocumentChunk, compress: bool) -> DocumentChunk {
        let cache_key = format!(
            "{}_{}_{}",
            chunk.kind.as_str(),
            content_digest(&chunk.content),
            chunk.token_count
        );

        {
            let mut probes = self.cache_probes.lock();
            probes.1 += 1;
            if let Some(cached) = self.cache.get(&cache_key) {
                probes.0 += 1;
                return cached;
            }
        }

        let mut optimized = chunk;
        if compress || optimized.content.len() > LARGE_CHUNK_BYTES {
            let normalized = Self::normalize_whitespace(&optimized.content);
            if normalized.len() < optimized.content.len() {
                optimized.metadata.insert(
                    "compression_ratio".to_string(),
                    serde_json::json!(normalized.len() as f64 / optimized.content.len() as f64),
                );
                optimized.content = normalized;
            }
        }

        let size = optimized.content.len();
        self.cache.put(&cache_key, optimized.clone(), size, None);
        optimized
    }

    fn normalize_whitespace(content: &str) -> String {
        let normalized = INLINE_SPACE_RUNS.replace_all(content, " ");
        let normalized = NEWLINE_RUNS.replace_all(&normalized, "\n\n");
        normalized.trim().to_string()
    }

    /// Batch size = available memory budget / estimated per-chunk cost,
    /// capped by the concurrent limit.
    fn optimal_batch_size(&self, chunks: &[DocumentChunk]) -> usize {
        if chunks.is_empty() {
            return 1;
        }

        let avg_chunk_bytes =
            chunks.iter().map(|c| c.content.len()).sum::<usize>() / chunks.len();
        let estimated_per_chunk = (avg_chunk_bytes * 2).max(1);
        let budget = self.settings.max_memory_usage_mb as usize * 1024 * 1024;
        let by_memory = (budget / estimated_per_chunk).max(1);

        by_memory.min(self.settings.max_concurrent_chunks)
    }

    /// Used/total memory ratio; 0.0 when the probe yields nothing.
    fn memory_pressure(&self) -> f64 {
        let mut system = self.system.lock();
        system.refresh_memory();
        let total = system.total_memory();
        if total == 0 {
            return 0.0;
        }
        system.used_memory() as f64 / total as f64
    }

    fn used_memory_mb(&self) -> f64 {
        let mut system = self.system.lock();
        system.refresh_memory();
        system.used_memory() as f64 / 1024.0 / 1024.0
    }

    fn build_metrics(
        &self,
        chunks: &[DocumentChunk],
        elapsed: Duration,
        memory_delta_mb: f64,
    ) -> OptimizationMetrics {
        let mut metrics = OptimizationMetrics {
            total_chunks: chunks.len(),
            processing_time_ms: elapsed.as_secs_f64() * 1000.0,
            memory_delta_mb,
            ..Default::default()
        };

        {
            let probes = self.cache_probes.lock();
            if probes.1 > 0 {
                metrics.cache_hit_ratio = probes.0 as f64 / probes.1 as f64;
            }
        }

        if !chunks.is_empty() {
            metrics.average_semantic_score = chunks
                .iter()
                .map(|c| c.semantic_score as f64)
                .sum::<f64>()
                / chunks.len() as f64;

            let mean_tokens =
                chunks.iter().map(|c| c.token_count as f64).sum::<f64>() / chunks.len() as f64;
            if mean_tokens > 0.0 {
                let variance = chunks
                    .iter()
                    .map(|c| (c.token_count as f64 - mean_tokens).powi(2))
                    .sum::<f64>()
                    / chunks.len() as f64;
                metrics.chunk_size_variance = variance.sqrt() / mean_tokens;
            }
        }

        metrics.optimization_suggestions = self.suggestions(&metrics);
        metrics
    }

    fn suggestions(&self, metrics: &OptimizationMetrics) -> Vec<String> {
        let mut suggestions = Vec::new();

        if metrics.average_semantic_score < 0.7 && metrics.total_chunks > 0 {
            suggestions
                .push("Low semantic scores: consider the semantic or hybrid strategy".to_string());
        }
        if metrics.chunk_size_variance > 0.3 {
            suggestions.push("High chunk size variance: consider a smaller target size".to_string());
        }
        if metrics.processing_time_ms > 3_000.0 {
            suggestions.push("Slow optimization run: consider the speed strategy".to_string());
        }
        if metrics.memory_delta_mb > self.settings.max_memory_usage_mb as f64 * 0.5 {
            suggestions.push("High memory growth: consider the memory strategy".to_string());
        }

        suggestions
    }

    pub fn performance_history(&self) -> Vec<OptimizationMetrics> {
        self.history.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::chunk::ChunkKind;

    fn chunk(index: usize, content: &str) -> DocumentChunk {
        DocumentChunk::new(
            content.to_string(),
            index,
            0,
            content.len(),
            content.split_whitespace().count(),
            ChunkKind::Paragraph,
        )
    }

    fn optimizer(strategy: &str) -> Arc<ChunkOptimizer> {
        let mut settings = OptimizerSettings::default();
        settings.strategy = strategy.to_string();
        Arc::new(ChunkOptimizer::new(settings))
    }

    #[tokio::test]
    async fn speed_strategy_preserves_ordinal_order() {
        let optimizer = optimizer("speed");
        let chunks: Vec<DocumentChunk> = (0..20)
            .map(|i| chunk(i, &format!("chunk number {i} content")))
            .collect();

        let (optimized, metrics) = optimizer.optimize(chunks, "doc.txt").await;

        assert_eq!(optimized.len(), 20);
        assert_eq!(metrics.total_chunks, 20);
        for (i, c) in optimized.iter().enumerate() {
            assert_eq!(c.chunk_index, i);
        }
    }

    #[tokio::test]
    async fn repeated_chunks_hit_the_cache() {
        let optimizer = optimizer("balanced");
        let chunks: Vec<DocumentChunk> =
            (0..4).map(|i| chunk(i, "identical content here")).collect();

        optimizer.optimize(chunks.clone(), "doc.txt").await;
        let (_, metrics) = optimizer.optimize(chunks, "doc.txt").await;

        assert!(metrics.cache_hit_ratio > 0.0);
    }

    #[tokio::test]
    async fn large_chunks_get_whitespace_trimmed() {
        let optimizer = optimizer("balanced");
        let bloated = format!("start  {}  end", "word    ".repeat(2000));
        let chunks = vec![chunk(0, &bloated)];

        let (optimized, _) = optimizer.optimize(chunks, "doc.txt").await;
        assert!(optimized[0].content.len() < bloated.len());
        assert!(optimized[0].metadata.contains_key("compression_ratio"));
    }

    #[test]
    fn whitespace_normalization_collapses_runs() {
        let input = "a    b\n\n\n\n\nc";
        assert_eq!(ChunkOptimizer::normalize_whitespace(input), "a b\n\nc");
    }

    #[test]
    fn batch_size_respects_concurrent_limit() {
        let optimizer = optimizer("balanced");
        let chunks: Vec<DocumentChunk> = (0..5).map(|i| chunk(i, "tiny")).collect();
        let size = optimizer.optimal_batch_size(&chunks);
        assert!(size >= 1);
        assert!(size <= optimizer.settings.max_concurrent_chunks);
    }

    #[tokio::test]
    async fn metrics_report_semantic_scores_and_variance() {
        let optimizer = optimizer("balanced");
        let mut chunks = vec![chunk(0, "short one"), chunk(1, "a much longer chunk with many more words inside")];
        chunks[0].semantic_score = 0.6;
        chunks[1].semantic_score = 1.0;

        let (_, metrics) = optimizer.optimize(chunks, "doc.txt").await;
        assert!((metrics.average_semantic_score - 0.8).abs() < 1e-9);
        assert!(metrics.chunk_size_variance > 0.0);
    }
}
