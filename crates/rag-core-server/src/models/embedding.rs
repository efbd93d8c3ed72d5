use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A cached embedding with its bookkeeping. The content hash uniquely
/// identifies the (content, model) pair; the vector dimension depends only
/// on the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingEntry {
    pub content_hash: String,
    pub vector: Vec<f32>,
    pub model_name: String,
    pub content_preview: String,
    pub token_count: i64,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub access_count: i64,
    pub content_type: String,
    pub chunk_index: Option<i64>,
    pub document_path: Option<String>,
}

impl EmbeddingEntry {
    /// Approximate in-memory footprint, used for cache size accounting.
    pub fn size_bytes(&self) -> usize {
        self.vector.len() * std::mem::size_of::<f32>()
            + self.content_preview.len()
            + self.model_name.len()
            + self.content_hash.len()
    }

    /// Record one access. The access counters are mutated through this
    /// path only, on both cache tiers.
    pub fn touch(&mut self) {
        self.touch_at(Utc::now());
    }

    /// Record one access at an explicit instant, so a store read can keep
    /// the returned entry aligned with the row it updated in the same
    /// transaction.
    pub fn touch_at(&mut self, at: DateTime<Utc>) {
        self.last_accessed = at;
        self.access_count += 1;
    }
}
