//! Two-tier embedding cache: bounded in-memory tier over the embedded
//! store. Reads promote, writes go through.

use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use super::strategies::{EvictionPolicy, MemoryCache, MemoryCacheStats};
use crate::config::CacheSettings;
use crate::database::Repository;
use crate::models::embedding::EmbeddingEntry;
use crate::utils::error::AnalysisError;
use crate::utils::hashing::embedding_cache_key;

const PREVIEW_CHARS: usize = 200;
const CLEANUP_IDLE_DAYS: i64 = 30;
const CLEANUP_MAX_ACCESS: i64 = 3;

/// One item in a batch lookup.
#[derive(Debug, Clone)]
pub struct EmbeddingRequestItem {
    pub content: String,
    pub model_name: String,
    pub content_type: String,
    pub chunk_index: Option<i64>,
    pub document_path: Option<String>,
    pub token_count: i64,
}

/// Result of a coalesced lookup: resolved vectors keyed by cache key, and
/// the items the caller still has to embed.
#[derive(Debug, Default)]
pub struct BatchLookup {
    pub hits: HashMap<String, Vec<f32>>,
    pub misses: Vec<EmbeddingRequestItem>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmbeddingCacheSnapshot {
    pub memory: MemoryCacheStats,
    pub persistent_entries: i64,
    pub persistent_bytes: i64,
    pub memory_hits: u64,
    pub db_hits: u64,
    pub misses: u64,
    pub cache_writes: u64,
    pub warming_events: u64,
}

pub struct EmbeddingCache {
    memory: MemoryCache<EmbeddingEntry>,
    repository: Arc<Repository>,
    settings: CacheSettings,
    memory_hits: AtomicU64,
    db_hits: AtomicU64,
    misses: AtomicU64,
    cache_writes: AtomicU64,
    warming_events: AtomicU64,
}

impl EmbeddingCache {
    pub fn new(settings: CacheSettings, repository: Arc<Repository>) -> Self {
        let policy = EvictionPolicy::parse(&settings.strategy);
        info!(
            "Embedding cache initialized: strategy={}, capacity={}",
            settings.strategy, settings.max_memory_entries
        );

        Self {
            memory: MemoryCache::new(
                policy,
                settings.max_memory_entries,
                Duration::from_secs(settings.ttl_seconds),
            ),
            repository,
            settings,
            memory_hits: AtomicU64::new(0),
            db_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            cache_writes: AtomicU64::new(0),
            warming_events: AtomicU64::new(0),
        }
    }

    /// Look up one vector. Tier-1 first, then the store; a store hit is
    /// promoted into tier 1 (last writer wins against a concurrent put of
    /// the same key, either way the cache stays consistent). Hits on
    /// either tier touch the entry's access counters.
    pub async fn get(&self, content: &str, model_name: &str) -> Option<Vec<f32>> {
        let key = embedding_cache_key(content, model_name);

        if let Some(entry) = self.memory.get_with(&key, EmbeddingEntry::touch) {
            self.memory_hits.fetch_add(1, Ordering::Relaxed);
            debug!("Memory cache hit: {}...", &key[..16.min(key.len())]);
            return Some(entry.vector);
        }

        match self.repository.get_embedding(&key).await {
            Ok(Some(entry)) => {
                self.db_hits.fetch_add(1, Ordering::Relaxed);
                let vector = entry.vector.clone();
                let size = entry.size_bytes();
                self.memory.put(&key, entry, size, None);
                Some(vector)
            }
            Ok(None) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(e) => {
                error!("Persistent cache read failed: {}", e);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Write-through put. The store upsert is a single statement, so an
    /// interrupted put never leaves a half-written row.
    pub async fn put(
        &self,
        content: &str,
        vector: Vec<f32>,
        model_name: &str,
        token_count: i64,
        content_type: &str,
        chunk_index: Option<i64>,
        document_path: Option<String>,
    ) -> Result<(), AnalysisError> {
        let key = embedding_cache_key(content, model_name);
        let now = Utc::now();

        let entry = EmbeddingEntry {
            content_hash: key.clone(),
            vector,
            model_name: model_name.to_string(),
            content_preview: content.chars().take(PREVIEW_CHARS).collect(),
            token_count,
            created_at: now,
            last_accessed: now,
            access_count: 1,
            content_type: content_type.to_string(),
            chunk_index,
            document_path,
        };

        let size = entry.size_bytes();
        self.memory.put(&key, entry.clone(), size, None);
        self.repository.upsert_embedding(&entry).await?;
        self.cache_writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Coalesced lookup for a batch. Memory first, then one store round
    /// trip for the remainder; store hits are promoted.
    pub async fn batch_get(&self, items: Vec<EmbeddingRequestItem>) -> BatchLookup {
        let mut lookup = BatchLookup::default();
        let mut pending: Vec<(String, EmbeddingRequestItem)> = Vec::new();

        for item in items {
            let key = embedding_cache_key(&item.content, &item.model_name);
            if let Some(entry) = self.memory.get_with(&key, EmbeddingEntry::touch) {
                self.memory_hits.fetch_add(1, Ordering::Relaxed);
                lookup.hits.insert(key, entry.vector);
            } else {
                pending.push((key, item));
            }
        }

        if pending.is_empty() {
            return lookup;
        }

        let keys: Vec<String> = pending.iter().map(|(k, _)| k.clone()).collect();
        let db_entries = match self.repository.batch_get_embeddings(&keys).await {
            Ok(entries) => entries,
            Err(e) => {
                error!("Persistent batch read failed: {}", e);
                Vec::new()
            }
        };

        let mut found: HashMap<String, EmbeddingEntry> = db_entries
            .into_iter()
            .map(|e| (e.content_hash.clone(), e))
            .collect();

        for (key, item) in pending {
            if let Some(entry) = found.remove(&key) {
                self.db_hits.fetch_add(1, Ordering::Relaxed);
                let size = entry.size_bytes();
                lookup.hits.insert(key.clone(), entry.vector.clone());
                self.memory.put(&key, entry, size, None);
            } else {
                self.misses.fetch_add(1, Ordering::Relaxed);
                lookup.misses.push(item);
            }
        }

        lookup
    }

    /// Batch write-through of freshly generated vectors.
    pub async fn batch_put(
        &self,
        items: &[EmbeddingRequestItem],
        vectors: &HashMap<String, Vec<f32>>,
    ) -> Result<usize, AnalysisError> {
        let now = Utc::now();
        let mut entries = Vec::new();

        for item in items {
            let key = embedding_cache_key(&item.content, &item.model_name);
            let Some(vector) = vectors.get(&key) else {
                continue;
            };

            let entry = EmbeddingEntry {
                content_hash: key.clone(),
                vector: vector.clone(),
                model_name: item.model_name.clone(),
                content_preview: item.content.chars().take(PREVIEW_CHARS).collect(),
                token_count: item.token_count,
                created_at: now,
                last_accessed: now,
                access_count: 1,
                content_type: item.content_type.clone(),
                chunk_index: item.chunk_index,
                document_path: item.document_path.clone(),
            };

            let size = entry.size_bytes();
            self.memory.put(&key, entry.clone(), size, None);
            entries.push(entry);
        }

        let written = self.repository.batch_upsert_embeddings(&entries).await?;
        self.cache_writes
            .fetch_add(written as u64, Ordering::Relaxed);
        Ok(written)
    }

    /// Startup warm-up: load the most-accessed entries into tier 1, up to a
    /// third of its capacity.
    pub async fn warm_startup(&self) -> usize {
        if !self.settings.warm_on_startup {
            return 0;
        }

        let limit = (self.settings.max_memory_entries / 3) as i64;
        let entries = match self
            .repository
            .most_accessed_embeddings(self.settings.popular_threshold_access_count, limit)
            .await
        {
            Ok(entries) => entries,
            Err(e) => {
                error!("Startup cache warming failed: {}", e);
                return 0;
            }
        };

        let mut warmed = 0;
        for entry in entries {
            let key = entry.content_hash.clone();
            let size = entry.size_bytes();
            if self.memory.put(&key, entry, size, None) {
                warmed += 1;
            }
        }

        self.warming_events.fetch_add(1, Ordering::Relaxed);
        info!("Startup cache warming loaded {} popular embeddings", warmed);
        warmed
    }

    /// Warm tier 1 with entries belonging to specific documents, up to half
    /// of its capacity.
    pub async fn warm_for_documents(&self, document_paths: &[String]) -> usize {
        let limit = (self.settings.max_memory_entries / 2) as i64;
        let entries = match self
            .repository
            .embeddings_for_documents(document_paths, limit)
            .await
        {
            Ok(entries) => entries,
            Err(e) => {
                error!("Document cache warming failed: {}", e);
                return 0;
            }
        };

        let mut warmed = 0;
        for entry in entries {
            let key = entry.content_hash.clone();
            let size = entry.size_bytes();
            if self.memory.put(&key, entry, size, None) {
                warmed += 1;
            }
        }

        self.warming_events.fetch_add(1, Ordering::Relaxed);
        info!(
            "Warmed cache with {} embeddings for {} documents",
            warmed,
            document_paths.len()
        );
        warmed
    }

    /// Drop expired tier-1 entries and stale store rows.
    pub async fn cleanup(&self) -> usize {
        let mut removed = self.memory.cleanup_expired();

        let cutoff = Utc::now() - ChronoDuration::days(CLEANUP_IDLE_DAYS);
        match self
            .repository
            .cleanup_embeddings(cutoff, CLEANUP_MAX_ACCESS)
            .await
        {
            Ok(count) => removed += count as usize,
            Err(e) => error!("Persistent cache cleanup failed: {}", e),
        }

        removed
    }

    pub async fn stats(&self) -> EmbeddingCacheSnapshot {
        let (persistent_entries, persistent_bytes) = self
            .repository
            .embedding_store_stats()
            .await
            .unwrap_or((0, 0));

        EmbeddingCacheSnapshot {
            memory: self.memory.stats(),
            persistent_entries,
            persistent_bytes,
            memory_hits: self.memory_hits.load(Ordering::Relaxed),
            db_hits: self.db_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            cache_writes: self.cache_writes.load(Ordering::Relaxed),
            warming_events: self.warming_events.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::DbPool;

    async fn cache() -> EmbeddingCache {
        let db = DbPool::in_memory().await.unwrap();
        EmbeddingCache::new(CacheSettings::default(), Arc::new(Repository::new(db)))
    }

    fn item(content: &str, model: &str) -> EmbeddingRequestItem {
        EmbeddingRequestItem {
            content: content.to_string(),
            model_name: model.to_string(),
            content_type: "text".to_string(),
            chunk_index: None,
            document_path: None,
            token_count: 1,
        }
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let cache = cache().await;
        cache
            .put("hello", vec![0.1, 0.2, 0.3], "m1", 1, "text", None, None)
            .await
            .unwrap();

        let vector = cache.get("hello", "m1").await.unwrap();
        assert_eq!(vector, vec![0.1, 0.2, 0.3]);

        // the read touched the entry: put counted one access, the get a
        // second
        let key = embedding_cache_key("hello", "m1");
        let entry = cache.memory.get(&key).unwrap();
        assert_eq!(entry.access_count, 2);

        // same content under another model is a distinct key
        assert!(cache.get("hello", "m2").await.is_none());
    }

    #[tokio::test]
    async fn memory_hits_advance_the_access_counters() {
        let cache = cache().await;
        cache
            .put("hot", vec![1.0], "m1", 1, "text", None, None)
            .await
            .unwrap();

        cache.get("hot", "m1").await.unwrap();
        cache.get("hot", "m1").await.unwrap();

        // both hits were served from tier 1 and each bumped the stored
        // entry, not just the returned clone
        let key = embedding_cache_key("hot", "m1");
        let entry = cache.memory.get(&key).unwrap();
        assert_eq!(entry.access_count, 3);
        assert!(entry.last_accessed >= entry.created_at);
        assert_eq!(cache.memory_hits.load(Ordering::Relaxed), 2);

        // batch lookups touch the same way
        let lookup = cache.batch_get(vec![item("hot", "m1")]).await;
        assert_eq!(lookup.hits.len(), 1);
        let entry = cache.memory.get(&key).unwrap();
        assert_eq!(entry.access_count, 4);
    }

    #[tokio::test]
    async fn put_overwrites_previous_vector() {
        let cache = cache().await;
        cache
            .put("k", vec![1.0], "m1", 1, "text", None, None)
            .await
            .unwrap();
        cache
            .put("k", vec![2.0], "m1", 1, "text", None, None)
            .await
            .unwrap();

        assert_eq!(cache.get("k", "m1").await.unwrap(), vec![2.0]);
    }

    #[tokio::test]
    async fn store_hit_survives_memory_loss_and_is_promoted() {
        let db = DbPool::in_memory().await.unwrap();
        let repository = Arc::new(Repository::new(db));
        let cache = EmbeddingCache::new(CacheSettings::default(), repository.clone());

        cache
            .put("persisted", vec![0.5, 0.6], "m1", 2, "text", None, None)
            .await
            .unwrap();
        cache.memory.clear();

        let vector = cache.get("persisted", "m1").await.unwrap();
        assert_eq!(vector, vec![0.5, 0.6]);
        // promoted back into tier 1, with the store read counted as an
        // access on the promoted entry
        assert_eq!(cache.memory.len(), 1);
        assert_eq!(cache.db_hits.load(Ordering::Relaxed), 1);
        let key = embedding_cache_key("persisted", "m1");
        let entry = cache.memory.get(&key).unwrap();
        assert_eq!(entry.access_count, 2);
    }

    #[tokio::test]
    async fn batch_get_partitions_hits_and_misses() {
        let cache = cache().await;
        cache
            .put("known", vec![1.0], "m1", 1, "text", None, None)
            .await
            .unwrap();

        let lookup = cache
            .batch_get(vec![item("known", "m1"), item("unknown", "m1")])
            .await;

        assert_eq!(lookup.hits.len(), 1);
        assert_eq!(lookup.misses.len(), 1);
        assert_eq!(lookup.misses[0].content, "unknown");
    }

    #[tokio::test]
    async fn serialized_entry_round_trips_binary_equal() {
        let cache = cache().await;
        let vector = vec![0.123_456_79_f32, -4.2e-5, 1e30];
        cache
            .put("exact", vector.clone(), "m1", 3, "text", Some(7), Some("doc.md".into()))
            .await
            .unwrap();
        cache.memory.clear();

        let loaded = cache.get("exact", "m1").await.unwrap();
        assert_eq!(loaded, vector);
    }

    #[tokio::test]
    async fn document_warmup_loads_matching_entries() {
        let db = DbPool::in_memory().await.unwrap();
        let repository = Arc::new(Repository::new(db));
        let cache = EmbeddingCache::new(CacheSettings::default(), repository.clone());

        cache
            .put("a", vec![1.0], "m1", 1, "text", Some(0), Some("doc.md".into()))
            .await
            .unwrap();
        cache
            .put("b", vec![2.0], "m1", 1, "text", Some(1), Some("doc.md".into()))
            .await
            .unwrap();
        cache
            .put("c", vec![3.0], "m1", 1, "text", Some(0), Some("other.md".into()))
            .await
            .unwrap();
        cache.memory.clear();

        let warmed = cache.warm_for_documents(&["doc.md".to_string()]).await;
        assert_eq!(warmed, 2);
        assert_eq!(cache.memory.len(), 2);
    }
}
