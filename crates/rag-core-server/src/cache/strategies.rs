//! In-memory cache tier with pluggable eviction.
//!
//! The eviction policies are a small sealed enum dispatched only at the
//! `get`/`put` boundary; the bookkeeping underneath is shared and
//! monomorphic.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    Lru,
    Ttl,
    Hybrid,
}

impl EvictionPolicy {
    pub fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "lru" => Self::Lru,
            "ttl" => Self::Ttl,
            _ => Self::Hybrid,
        }
    }

    fn tracks_ttl(&self) -> bool {
        matches!(self, Self::Ttl | Self::Hybrid)
    }

    fn tracks_lru(&self) -> bool {
        matches!(self, Self::Lru | Self::Hybrid)
    }
}

/// A cached value with its bookkeeping.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub key: String,
    pub value: V,
    pub created_at: Instant,
    pub last_accessed: Instant,
    pub access_count: u64,
    pub size_bytes: usize,
    pub expires_at: Option<Instant>,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|t| Instant::now() > t)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MemoryCacheStats {
    pub cache_size: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub total_requests: u64,
    pub hit_rate: f64,
    pub total_size_bytes: usize,
}

struct Inner<V> {
    entries: HashMap<String, CacheEntry<V>>,
    access_order: Vec<String>,
    hits: u64,
    misses: u64,
    evictions: u64,
    total_requests: u64,
}

/// Thread-safe bounded cache. One lock per cache keeps a slow persistent
/// read from ever blocking tier-1 operations on other caches.
pub struct MemoryCache<V> {
    policy: EvictionPolicy,
    max_size: usize,
    default_ttl: Duration,
    inner: Mutex<Inner<V>>,
}

impl<V: Clone> MemoryCache<V> {
    pub fn new(policy: EvictionPolicy, max_size: usize, default_ttl: Duration) -> Self {
        Self {
            policy,
            max_size,
            default_ttl,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                access_order: Vec::new(),
                hits: 0,
                misses: 0,
                evictions: 0,
                total_requests: 0,
            }),
        }
    }

    /// Get a value. Expired entries count as misses and are removed
    /// eagerly. A hit touches `last_accessed` and the access count in the
    /// same critical section.
    pub fn get(&self, key: &str) -> Option<V> {
        self.get_with(key, |_| {})
    }

    /// Like `get`, but applies `mutate` to the stored value inside the
    /// critical section before cloning it out. This is how domain values
    /// carrying their own access bookkeeping stay in step with the cache's
    /// wrapper counters.
    pub fn get_with(&self, key: &str, mutate: impl FnOnce(&mut V)) -> Option<V> {
        let mut inner = self.inner.lock();
        inner.total_requests += 1;

        let expired = inner.entries.get(key).map(|entry| entry.is_expired());
        let Some(expired) = expired else {
            inner.misses += 1;
            return None;
        };

        if expired {
            inner.entries.remove(key);
            inner.access_order.retain(|k| k != key);
            inner.misses += 1;
            debug!("Removed expired cache entry: {}", key);
            return None;
        }

        let entry = inner.entries.get_mut(key).expect("checked above");
        entry.last_accessed = Instant::now();
        entry.access_count += 1;
        mutate(&mut entry.value);
        let value = entry.value.clone();
        inner.hits += 1;

        if self.policy.tracks_lru() {
            let pos = inner.access_order.iter().position(|k| k == key);
            if let Some(pos) = pos {
                let k = inner.access_order.remove(pos);
                inner.access_order.push(k);
            }
        }

        Some(value)
    }

    /// Insert or replace. When the cache is full the policy selects a
    /// victim: expired entries first (TTL/Hybrid), then LRU order or oldest
    /// creation time.
    pub fn put(&self, key: &str, value: V, size_bytes: usize, ttl: Option<Duration>) -> bool {
        let now = Instant::now();
        let expires_at = self
            .policy
            .tracks_ttl()
            .then(|| now + ttl.unwrap_or(self.default_ttl));

        let entry = CacheEntry {
            key: key.to_string(),
            value,
            created_at: now,
            last_accessed: now,
            access_count: 1,
            size_bytes,
            expires_at,
        };

        let mut inner = self.inner.lock();

        if inner.entries.contains_key(key) {
            inner.entries.insert(key.to_string(), entry);
            if self.policy.tracks_lru() {
                inner.access_order.retain(|k| k != key);
                inner.access_order.push(key.to_string());
            }
            return true;
        }

        while inner.entries.len() >= self.max_size {
            let Some(victim) = self.select_victim(&inner) else {
                debug!("Could not find eviction candidate, cache full");
                return false;
            };
            inner.entries.remove(&victim);
            inner.access_order.retain(|k| k != &victim);
            inner.evictions += 1;
            debug!("Evicted cache entry: {}", victim);
        }

        inner.entries.insert(key.to_string(), entry);
        if self.policy.tracks_lru() {
            inner.access_order.push(key.to_string());
        }
        true
    }

    fn select_victim(&self, inner: &Inner<V>) -> Option<String> {
        if self.policy.tracks_ttl() {
            if let Some(expired) = inner
                .entries
                .values()
                .find(|e| e.is_expired())
                .map(|e| e.key.clone())
            {
                return Some(expired);
            }
        }

        match self.policy {
            EvictionPolicy::Lru | EvictionPolicy::Hybrid => inner.access_order.first().cloned(),
            EvictionPolicy::Ttl => inner
                .entries
                .values()
                .min_by_key(|e| e.created_at)
                .map(|e| e.key.clone()),
        }
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        let mut inner = self.inner.lock();
        inner.access_order.retain(|k| k != key);
        inner.entries.remove(key).map(|e| e.value)
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.access_order.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Drop every expired entry; returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let mut inner = self.inner.lock();
        let expired: Vec<String> = inner
            .entries
            .values()
            .filter(|e| e.is_expired())
            .map(|e| e.key.clone())
            .collect();

        for key in &expired {
            inner.entries.remove(key);
            inner.access_order.retain(|k| k != key);
        }

        expired.len()
    }

    pub fn stats(&self) -> MemoryCacheStats {
        let inner = self.inner.lock();
        let total_size_bytes = inner.entries.values().map(|e| e.size_bytes).sum();
        MemoryCacheStats {
            cache_size: inner.entries.len(),
            max_size: self.max_size,
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            total_requests: inner.total_requests,
            hit_rate: inner.hits as f64 / (inner.total_requests.max(1)) as f64,
            total_size_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lru_cache(max: usize) -> MemoryCache<String> {
        MemoryCache::new(EvictionPolicy::Lru, max, Duration::from_secs(3600))
    }

    #[test]
    fn put_then_get_round_trips() {
        let cache = lru_cache(4);
        assert!(cache.put("a", "alpha".to_string(), 5, None));
        assert_eq!(cache.get("a"), Some("alpha".to_string()));
        assert_eq!(cache.get("missing"), None);
    }

    #[test]
    fn put_overwrites_existing_value() {
        let cache = lru_cache(4);
        cache.put("a", "first".to_string(), 5, None);
        cache.put("a", "second".to_string(), 6, None);
        assert_eq!(cache.get("a"), Some("second".to_string()));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn lru_evicts_least_recently_used() {
        let cache = lru_cache(2);
        cache.put("a", "a".to_string(), 1, None);
        cache.put("b", "b".to_string(), 1, None);
        cache.get("a"); // b is now LRU
        cache.put("c", "c".to_string(), 1, None);

        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn ttl_expires_entries() {
        let cache = MemoryCache::new(EvictionPolicy::Ttl, 4, Duration::from_secs(3600));
        cache.put("a", "a".to_string(), 1, Some(Duration::from_millis(10)));
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.get("a"), None);
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn hybrid_prefers_expired_victims_over_lru() {
        let cache = MemoryCache::new(EvictionPolicy::Hybrid, 2, Duration::from_secs(3600));
        cache.put("stale", "s".to_string(), 1, Some(Duration::from_millis(10)));
        cache.put("fresh", "f".to_string(), 1, None);
        std::thread::sleep(Duration::from_millis(30));
        // "stale" would survive under pure LRU if "fresh" were accessed;
        // expired wins first regardless.
        cache.get("fresh");
        cache.put("new", "n".to_string(), 1, None);

        assert!(cache.get("fresh").is_some());
        assert!(cache.get("new").is_some());
        assert!(cache.get("stale").is_none());
    }

    #[test]
    fn cleanup_expired_reports_count() {
        let cache = MemoryCache::new(EvictionPolicy::Hybrid, 8, Duration::from_secs(3600));
        cache.put("a", "a".to_string(), 1, Some(Duration::from_millis(5)));
        cache.put("b", "b".to_string(), 1, Some(Duration::from_millis(5)));
        cache.put("c", "c".to_string(), 1, None);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.cleanup_expired(), 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn get_with_mutates_the_stored_value_in_place() {
        let cache = lru_cache(4);
        cache.put("a", "v1".to_string(), 2, None);

        let seen = cache.get_with("a", |v| v.push_str("+touched"));
        assert_eq!(seen.as_deref(), Some("v1+touched"));
        // the mutation sticks for later reads
        assert_eq!(cache.get("a").as_deref(), Some("v1+touched"));
        // and misses never invoke the mutator
        assert!(cache.get_with("missing", |_| panic!("mutated a miss")).is_none());
    }

    #[test]
    fn stats_track_hits_and_misses() {
        let cache = lru_cache(4);
        cache.put("a", "a".to_string(), 1, None);
        cache.get("a");
        cache.get("nope");

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.total_requests, 2);
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
    }
}
