use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::utils::error::AnalysisError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecayKind {
    Temporal,
    Positional,
    Combined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopicChangeKind {
    Gradual,
    Abrupt,
    Return,
    New,
}

impl TopicChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gradual => "gradual",
            Self::Abrupt => "abrupt",
            Self::Return => "return",
            Self::New => "new",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryPriority {
    Critical,
    High,
    Medium,
    Low,
    Archive,
}

impl MemoryPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
            Self::Archive => "archive",
        }
    }

    /// Critical and high priority messages are never pruned.
    pub fn is_prunable(&self) -> bool {
        !matches!(self, Self::Critical | Self::High)
    }
}

/// Memory engine configuration. Validated on construction and at settings
/// load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMemoryConfig {
    pub max_context_tokens: usize,
    pub relevance_decay_factor: f64,
    pub summary_threshold: usize,
    pub topic_similarity_threshold: f32,
    pub memory_compression_ratio: f64,
    pub temporal_decay_hours: f64,
    pub max_conversation_length: usize,
    pub decay_kind: DecayKind,
}

impl Default for ConversationMemoryConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: 32_000,
            relevance_decay_factor: 0.95,
            summary_threshold: 20,
            topic_similarity_threshold: 0.7,
            memory_compression_ratio: 0.3,
            temporal_decay_hours: 24.0,
            max_conversation_length: 1_000,
            decay_kind: DecayKind::Combined,
        }
    }
}

impl ConversationMemoryConfig {
    pub fn validate(&self) -> Result<(), AnalysisError> {
        if !(0.1..=1.0).contains(&self.relevance_decay_factor) {
            return Err(AnalysisError::Configuration(
                "relevance_decay_factor must be between 0.1 and 1.0".to_string(),
            ));
        }
        if self.summary_threshold < 5 {
            return Err(AnalysisError::Configuration(
                "summary_threshold must be at least 5".to_string(),
            ));
        }
        if self.temporal_decay_hours < 1.0 {
            return Err(AnalysisError::Configuration(
                "temporal_decay_hours must be at least 1".to_string(),
            ));
        }
        if self.max_conversation_length < 100 {
            return Err(AnalysisError::Configuration(
                "max_conversation_length must be at least 100".to_string(),
            ));
        }
        Ok(())
    }
}

/// A tracked conversation topic. Keywords are a multiset: the same word can
/// appear more than once and merging extends the counts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTopic {
    pub id: String,
    pub name: String,
    pub keywords: Vec<String>,
    pub relevance_score: f32,
    pub confidence_score: f32,
    pub first_mention: DateTime<Utc>,
    pub last_mention: DateTime<Utc>,
    pub message_count: usize,
    pub embedding: Option<Vec<f32>>,
    pub parent_topic_id: Option<String>,
    pub subtopic_ids: Vec<String>,
}

impl ConversationTopic {
    pub fn new(name: String, keywords: Vec<String>, embedding: Option<Vec<f32>>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            keywords,
            relevance_score: 1.0,
            confidence_score: 0.8,
            first_mention: now,
            last_mention: now,
            message_count: 1,
            embedding,
            parent_topic_id: None,
            subtopic_ids: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRelevance {
    pub message_id: String,
    pub base_relevance: f64,
    pub current_relevance: f64,
    pub decay_factor: f64,
    pub last_updated: DateTime<Utc>,
    pub topic_relevance: HashMap<String, f64>,
    pub priority: MemoryPriority,
    pub access_count: usize,
    pub last_accessed: Option<DateTime<Utc>>,
    pub token_count: usize,
}

impl MessageRelevance {
    pub fn new(message_id: String, priority: MemoryPriority, token_count: usize) -> Self {
        Self {
            message_id,
            base_relevance: 1.0,
            current_relevance: 1.0,
            decay_factor: 1.0,
            last_updated: Utc::now(),
            topic_relevance: HashMap::new(),
            priority,
            access_count: 0,
            last_accessed: None,
            token_count,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: String,
    pub conversation_id: String,
    pub summary_type: String,
    pub content: String,
    pub key_points: Vec<String>,
    pub covered_messages: Vec<String>,
    pub covered_topics: Vec<String>,
    pub compression_ratio: f64,
    pub created_at: DateTime<Utc>,
    pub token_count: usize,
    pub original_token_count: usize,
    pub relevance_score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicTransition {
    pub id: String,
    pub conversation_id: String,
    pub from_topic_id: Option<String>,
    pub to_topic_id: String,
    pub transition_kind: TopicChangeKind,
    pub message_id: String,
    pub confidence: f32,
    pub similarity_score: f32,
    pub created_at: DateTime<Utc>,
    pub bridging_context: Option<String>,
}

/// The bounded active view of a conversation. `active` and `archived`
/// message sets are disjoint; after any pruning pass
/// `current_token_count <= max_token_limit`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextWindow {
    pub conversation_id: String,
    pub active_messages: Vec<String>,
    pub archived_messages: Vec<String>,
    pub active_summaries: Vec<String>,
    pub current_token_count: usize,
    pub max_token_limit: usize,
    pub pruning_threshold: f64,
    pub last_pruned: Option<DateTime<Utc>>,
    pub compression_count: usize,
}

impl ContextWindow {
    pub fn new(conversation_id: String, max_token_limit: usize) -> Self {
        Self {
            conversation_id,
            active_messages: Vec::new(),
            archived_messages: Vec::new(),
            active_summaries: Vec::new(),
            current_token_count: 0,
            max_token_limit,
            pruning_threshold: 0.8,
            last_pruned: None,
            compression_count: 0,
        }
    }

    pub fn needs_pruning(&self) -> bool {
        self.current_token_count as f64 > self.max_token_limit as f64 * self.pruning_threshold
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationState {
    pub conversation_id: String,
    pub current_topic_id: Option<String>,
    pub previous_topic_id: Option<String>,
    pub topic_history: Vec<String>,
    pub message_count: usize,
    pub turn_count: usize,
    pub session_start: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub context_window: ContextWindow,
    pub memory_config: ConversationMemoryConfig,
    pub is_archived: bool,
    pub archive_reason: Option<String>,
}

impl ConversationState {
    pub fn new(conversation_id: String, config: ConversationMemoryConfig) -> Self {
        let now = Utc::now();
        Self {
            context_window: ContextWindow::new(conversation_id.clone(), config.max_context_tokens),
            conversation_id,
            current_topic_id: None,
            previous_topic_id: None,
            topic_history: Vec::new(),
            message_count: 0,
            turn_count: 0,
            session_start: now,
            last_activity: now,
            memory_config: config,
            is_archived: false,
            archive_reason: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryMetrics {
    pub conversation_id: String,
    pub total_messages: usize,
    pub active_messages: usize,
    pub archived_messages: usize,
    pub total_summaries: usize,
    pub compression_ratio: f64,
    pub avg_relevance_score: f64,
    pub topics_identified: usize,
    pub topic_transitions: usize,
    pub processing_time_ms: f64,
    pub last_updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationArchive {
    pub conversation_id: String,
    pub archive_id: String,
    pub final_summary: String,
    pub key_topics: Vec<String>,
    pub important_messages: Vec<String>,
    pub archived_at: DateTime<Utc>,
}
