//! Conversation memory engine: bounded, relevance-ranked multi-turn
//! context with topic tracking, summarization and archival.
//!
//! Messages of one conversation are processed on a single logical lane;
//! lanes are independent. Every operation persists the state row and all
//! dependent rows it touched in one transaction.

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::database::{ConversationUpdate, Repository};
use crate::models::chat::{ChatMessage, MessageRole};
use crate::models::memory::{
    ConversationArchive, ConversationMemoryConfig, ConversationState, ConversationSummary,
    ConversationTopic, DecayKind, MemoryMetrics, MemoryPriority, MessageRelevance,
    TopicChangeKind, TopicTransition,
};
use crate::services::embedding_service::EmbeddingProvider;
use crate::services::llm_service::{GenerationConfig, GenerationProvider};
use crate::utils::error::AnalysisError;
use crate::utils::similarity::cosine_similarity;
use crate::utils::token_estimator::count_tokens;
use super::keywords::{extract_keywords, merge_keywords};

const PRUNE_TARGET_RATIO: f64 = 0.7;
const TOPIC_MATCH_THRESHOLD: f32 = 0.5;
const CONTEXT_TOPIC_LIMIT: usize = 5;
const CONTEXT_SUMMARY_LIMIT: usize = 3;

/// Context assembled for a new query.
#[derive(Debug, Default, Serialize)]
pub struct RelevantContext {
    pub messages: Vec<ChatMessage>,
    pub topics: Vec<ConversationTopic>,
    pub summaries: Vec<ConversationSummary>,
    pub current_topic_id: Option<String>,
}

#[derive(Clone)]
struct ConversationCacheEntry {
    state: ConversationState,
    relevances: HashMap<String, MessageRelevance>,
    topics: Vec<ConversationTopic>,
    messages: HashMap<String, ChatMessage>,
}

pub struct ConversationMemoryManager {
    repository: Arc<Repository>,
    embedding_provider: Arc<dyn EmbeddingProvider>,
    generation_provider: Arc<dyn GenerationProvider>,
    config: ConversationMemoryConfig,
    embedding_model: String,
    conversations: DashMap<String, ConversationCacheEntry>,
    lanes: DashMap<String, Arc<Mutex<()>>>,
}

impl ConversationMemoryManager {
    pub fn new(
        repository: Arc<Repository>,
        embedding_provider: Arc<dyn EmbeddingProvider>,
        generation_provider: Arc<dyn GenerationProvider>,
        config: ConversationMemoryConfig,
        embedding_model: String,
    ) -> Self {
        Self {
            repository,
            embedding_provider,
            generation_provider,
            config,
            embedding_model,
            conversations: DashMap::new(),
            lanes: DashMap::new(),
        }
    }

    fn lane(&self, conversation_id: &str) -> Arc<Mutex<()>> {
        self.lanes
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn initialize_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<ConversationState, AnalysisError> {
        let state = ConversationState::new(conversation_id.to_string(), self.config.clone());

        let update = ConversationUpdate {
            state: Some(state.clone()),
            metrics: Some(MemoryMetrics {
                conversation_id: conversation_id.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        };
        self.repository.persist_conversation_update(&update).await?;

        self.conversations.insert(
            conversation_id.to_string(),
            ConversationCacheEntry {
                state: state.clone(),
                relevances: HashMap::new(),
                topics: Vec::new(),
                messages: HashMap::new(),
            },
        );

        info!("Initialized conversation memory for {}", conversation_id);
        Ok(state)
    }

    async fn ensure_loaded(&self, conversation_id: &str) -> Result<(), AnalysisError> {
        if self.conversations.contains_key(conversation_id) {
            return Ok(());
        }

        if let Some(state) = self.repository.load_conversation_state(conversation_id).await? {
            let relevances = self
                .repository
                .relevances_for_conversation(conversation_id)
                .await?
                .into_iter()
                .map(|r| (r.message_id.clone(), r))
                .collect();
            let topics = self
                .repository
                .topics_for_conversation(conversation_id)
                .await?;

            self.conversations.insert(
                conversation_id.to_string(),
                ConversationCacheEntry {
                    state,
                    relevances,
                    topics,
                    messages: HashMap::new(),
                },
            );
            return Ok(());
        }

        self.initialize_conversation(conversation_id).await?;
        Ok(())
    }

    /// Add a message to conversation memory: assign relevance, extend the
    /// context window, track topics, and trigger pruning, summarization
    /// and archival as thresholds are crossed.
    pub async fn add_message(
        &self,
        conversation_id: &str,
        message: &ChatMessage,
    ) -> Result<(), AnalysisError> {
        let lane = self.lane(conversation_id);
        let _guard = lane.lock().await;
        let started = Instant::now();

        self.ensure_loaded(conversation_id).await?;

        // work on an owned copy so no map guard is held across awaits; the
        // lane guarantees no concurrent writer for this conversation
        let mut entry = self
            .conversations
            .get(conversation_id)
            .map(|e| e.value().clone())
            .expect("loaded above");

        if entry.state.is_archived {
            return Err(AnalysisError::ConversationArchived(
                conversation_id.to_string(),
            ));
        }

        let token_count = count_tokens(&message.content);
        let priority = if message.role == MessageRole::User {
            MemoryPriority::High
        } else {
            MemoryPriority::Medium
        };
        let relevance = MessageRelevance::new(message.id.clone(), priority, token_count);

        entry.state.message_count += 1;
        if message.role == MessageRole::User {
            entry.state.turn_count += 1;
        }
        entry.state.last_activity = Utc::now();
        entry
            .state
            .context_window
            .active_messages
            .push(message.id.clone());
        entry.state.context_window.current_token_count += token_count;
        entry.relevances.insert(message.id.clone(), relevance);
        entry.messages.insert(message.id.clone(), message.clone());

        let mut update = ConversationUpdate::default();
        update
            .relevances
            .push(entry.relevances[&message.id].clone());

        // topic extraction is best-effort: a provider outage never loses
        // the message
        match self.track_topics(&mut entry, message).await {
            Ok((topics, transitions)) => {
                update.topics = topics;
                update.transitions = transitions;
            }
            Err(e) => warn!("Topic tracking failed for {}: {}", conversation_id, e),
        }

        if entry.state.context_window.needs_pruning() {
            self.prune_window(&mut entry, &mut update);
        }

        if entry.state.message_count % entry.state.memory_config.summary_threshold == 0 {
            match self.generate_summary(&mut entry).await {
                Ok(Some(summary)) => update.summaries.push(summary),
                Ok(None) => {}
                Err(e) => warn!("Summarization failed for {}: {}", conversation_id, e),
            }
        }

        if entry.state.message_count > entry.state.memory_config.max_conversation_length {
            update.archive = Some(self.build_archive(&entry));
            entry.state.is_archived = true;
            entry.state.archive_reason = Some("max conversation length reached".to_string());
            info!("Conversation {} archived", conversation_id);
        }

        update.metrics = Some(self.build_metrics(&entry, started.elapsed().as_secs_f64() * 1000.0));
        update.state = Some(entry.state.clone());

        self.repository.persist_conversation_update(&update).await?;
        self.conversations
            .insert(conversation_id.to_string(), entry);

        debug!("Added message {} to conversation {}", message.id, conversation_id);
        Ok(())
    }

    /// Merge the message into a similar topic or open a new one, recording
    /// the transition either way.
    async fn track_topics(
        &self,
        entry: &mut ConversationCacheEntry,
        message: &ChatMessage,
    ) -> Result<(Vec<ConversationTopic>, Vec<TopicTransition>), AnalysisError> {
        let keywords = extract_keywords(&message.content);
        if keywords.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }

        let embedding = self
            .embedding_provider
            .embed(&message.content, &self.embedding_model, "clustering")
            .await
            .ok();

        let mut best: Option<(usize, f32)> = None;
        if let Some(embedding) = &embedding {
            for (i, topic) in entry.topics.iter().enumerate() {
                let Some(topic_embedding) = &topic.embedding else {
                    continue;
                };
                if let Ok(similarity) = cosine_similarity(embedding, topic_embedding) {
                    if best.map_or(true, |(_, s)| similarity > s) {
                        best = Some((i, similarity));
                    }
                }
            }
        }

        let conversation_id = entry.state.conversation_id.clone();
        let mut dirty_topics = Vec::new();
        let mut transitions = Vec::new();

        match best.filter(|(_, s)| *s >= self.config.topic_similarity_threshold) {
            Some((index, similarity)) => {
                let topic = &mut entry.topics[index];
                topic.last_mention = Utc::now();
                topic.message_count += 1;
                merge_keywords(&mut topic.keywords, &keywords);
                let topic_id = topic.id.clone();
                dirty_topics.push(topic.clone());

                if entry.state.current_topic_id.as_deref() != Some(topic_id.as_str()) {
                    transitions.push(TopicTransition {
                        id: Uuid::new_v4().to_string(),
                        conversation_id: conversation_id.clone(),
                        from_topic_id: entry.state.current_topic_id.clone(),
                        to_topic_id: topic_id.clone(),
                        transition_kind: TopicChangeKind::Gradual,
                        message_id: message.id.clone(),
                        confidence: 0.8,
                        similarity_score: similarity,
                        created_at: Utc::now(),
                        bridging_context: None,
                    });
                    entry.state.previous_topic_id = entry.state.current_topic_id.take();
                    entry.state.current_topic_id = Some(topic_id.clone());
                    if !entry.state.topic_history.contains(&topic_id) {
                        entry.state.topic_history.push(topic_id);
                    }
                }
            }
            None => {
                let name = keywords.iter().take(3).cloned().collect::<Vec<_>>().join(" ");
                let topic = ConversationTopic::new(name, keywords, embedding);
                let topic_id = topic.id.clone();

                transitions.push(TopicTransition {
                    id: Uuid::new_v4().to_string(),
                    conversation_id,
                    from_topic_id: None,
                    to_topic_id: topic_id.clone(),
                    transition_kind: TopicChangeKind::New,
                    message_id: message.id.clone(),
                    confidence: 0.8,
                    similarity_score: best.map(|(_, s)| s).unwrap_or(0.0),
                    created_at: Utc::now(),
                    bridging_context: None,
                });

                entry.state.previous_topic_id = entry.state.current_topic_id.take();
                entry.state.current_topic_id = Some(topic_id.clone());
                entry.state.topic_history.push(topic_id);
                dirty_topics.push(topic.clone());
                entry.topics.push(topic);
            }
        }

        Ok((dirty_topics, transitions))
    }

    /// Decay every active message, then archive the least relevant ones
    /// until the window is back at 70% capacity. Critical and high
    /// priority messages never move.
    fn prune_window(&self, entry: &mut ConversationCacheEntry, update: &mut ConversationUpdate) {
        let decay_kind = entry.state.memory_config.decay_kind;
        let decay_factor = entry.state.memory_config.relevance_decay_factor;
        let half_life = entry.state.memory_config.temporal_decay_hours;
        let now = Utc::now();

        for message_id in &entry.state.context_window.active_messages.clone() {
            let Some(relevance) = entry.relevances.get_mut(message_id) else {
                continue;
            };

            if matches!(decay_kind, DecayKind::Temporal | DecayKind::Combined) {
                let hours = (now - relevance.last_updated).num_seconds() as f64 / 3600.0;
                relevance.current_relevance *= (-hours / half_life).exp();
            }
            if matches!(decay_kind, DecayKind::Positional | DecayKind::Combined) {
                relevance.current_relevance *= decay_factor;
            }

            relevance.decay_factor = if relevance.base_relevance > 0.0 {
                relevance.current_relevance / relevance.base_relevance
            } else {
                0.0
            };
            relevance.last_updated = now;
        }

        let target = (entry.state.context_window.max_token_limit as f64 * PRUNE_TARGET_RATIO)
            as usize;

        let mut candidates: Vec<(String, f64, usize)> = entry
            .state
            .context_window
            .active_messages
            .iter()
            .filter_map(|id| {
                let relevance = entry.relevances.get(id)?;
                relevance
                    .priority
                    .is_prunable()
                    .then(|| (id.clone(), relevance.current_relevance, relevance.token_count))
            })
            .collect();
        candidates.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        let mut archived = 0usize;
        for (message_id, _, tokens) in candidates {
            if entry.state.context_window.current_token_count <= target {
                break;
            }

            entry
                .state
                .context_window
                .active_messages
                .retain(|id| id != &message_id);
            entry
                .state
                .context_window
                .archived_messages
                .push(message_id.clone());
            entry.state.context_window.current_token_count = entry
                .state
                .context_window
                .current_token_count
                .saturating_sub(tokens);
            archived += 1;
        }

        entry.state.context_window.last_pruned = Some(now);
        entry.state.context_window.compression_count += 1;

        for message_id in &entry.state.context_window.active_messages {
            if let Some(relevance) = entry.relevances.get(message_id) {
                update.relevances.push(relevance.clone());
            }
        }
        for message_id in &entry.state.context_window.archived_messages {
            if let Some(relevance) = entry.relevances.get(message_id) {
                update.relevances.push(relevance.clone());
            }
        }

        info!(
            "Pruned {} messages from conversation {} ({} tokens active)",
            archived,
            entry.state.conversation_id,
            entry.state.context_window.current_token_count
        );
    }

    /// Summarize the most recent summary-threshold messages. Idempotent:
    /// if a summary already covers this exact message set, nothing new is
    /// produced.
    async fn generate_summary(
        &self,
        entry: &mut ConversationCacheEntry,
    ) -> Result<Option<ConversationSummary>, AnalysisError> {
        let threshold = entry.state.memory_config.summary_threshold;
        let active = &entry.state.context_window.active_messages;
        let covered: Vec<String> = active
            .iter()
            .rev()
            .take(threshold)
            .rev()
            .cloned()
            .collect();

        if covered.is_empty() || self.repository.summary_exists_for(&covered).await? {
            return Ok(None);
        }

        let original_token_count: usize = covered
            .iter()
            .filter_map(|id| entry.relevances.get(id))
            .map(|r| r.token_count)
            .sum();

        let transcript: String = covered
            .iter()
            .filter_map(|id| entry.messages.get(id))
            .map(|m| format!("{}: {}\n", m.role.as_str(), m.content))
            .collect();

        let content = if transcript.is_empty() {
            format!("Summary of {} recent messages", covered.len())
        } else {
            let prompt = format!(
                "Summarize the following conversation excerpt in a short paragraph, \
                 keeping concrete facts and decisions:\n\n{transcript}"
            );
            match self
                .generation_provider
                .generate(&prompt, &GenerationConfig::default())
                .await
            {
                Ok(text) => text,
                Err(e) => {
                    warn!("Summary generation fell back to a stub: {}", e);
                    format!("Summary of {} recent messages", covered.len())
                }
            }
        };

        let token_count = count_tokens(&content);
        let summary = ConversationSummary {
            id: Uuid::new_v4().to_string(),
            conversation_id: entry.state.conversation_id.clone(),
            summary_type: "periodic".to_string(),
            content,
            key_points: Vec::new(),
            covered_messages: covered,
            covered_topics: entry.state.topic_history.clone(),
            compression_ratio: if original_token_count > 0 {
                token_count as f64 / original_token_count as f64
            } else {
                1.0
            },
            created_at: Utc::now(),
            token_count,
            original_token_count,
            relevance_score: 1.0,
        };

        entry
            .state
            .context_window
            .active_summaries
            .push(summary.id.clone());
        entry.state.context_window.current_token_count += token_count;

        info!(
            "Generated summary {} for conversation {}",
            summary.id, entry.state.conversation_id
        );
        Ok(Some(summary))
    }

    fn build_archive(&self, entry: &ConversationCacheEntry) -> ConversationArchive {
        let important: Vec<String> = entry
            .relevances
            .values()
            .filter(|r| !r.priority.is_prunable())
            .map(|r| r.message_id.clone())
            .collect();

        ConversationArchive {
            conversation_id: entry.state.conversation_id.clone(),
            archive_id: Uuid::new_v4().to_string(),
            final_summary: format!(
                "Conversation with {} messages across {} topics",
                entry.state.message_count,
                entry.state.topic_history.len()
            ),
            key_topics: entry.state.topic_history.clone(),
            important_messages: important,
            archived_at: Utc::now(),
        }
    }

    fn build_metrics(&self, entry: &ConversationCacheEntry, processing_ms: f64) -> MemoryMetrics {
        let active = entry.state.context_window.active_messages.len();
        let archived = entry.state.context_window.archived_messages.len();
        let avg_relevance = if entry.relevances.is_empty() {
            0.0
        } else {
            entry
                .relevances
                .values()
                .map(|r| r.current_relevance)
                .sum::<f64>()
                / entry.relevances.len() as f64
        };

        MemoryMetrics {
            conversation_id: entry.state.conversation_id.clone(),
            total_messages: entry.state.message_count,
            active_messages: active,
            archived_messages: archived,
            total_summaries: entry.state.context_window.active_summaries.len(),
            compression_ratio: if entry.state.message_count > 0 {
                archived as f64 / entry.state.message_count as f64
            } else {
                0.0
            },
            avg_relevance_score: avg_relevance,
            topics_identified: entry.topics.len(),
            topic_transitions: entry.state.topic_history.len().saturating_sub(1),
            processing_time_ms: processing_ms,
            last_updated: Some(Utc::now()),
        }
    }

    pub async fn get_state(
        &self,
        conversation_id: &str,
    ) -> Result<Option<ConversationState>, AnalysisError> {
        if let Some(entry) = self.conversations.get(conversation_id) {
            return Ok(Some(entry.state.clone()));
        }
        self.repository.load_conversation_state(conversation_id).await
    }

    pub async fn metrics(
        &self,
        conversation_id: &str,
    ) -> Result<Option<MemoryMetrics>, AnalysisError> {
        self.repository.load_memory_metrics(conversation_id).await
    }

    /// Best-fitting context for a query: top active messages by current
    /// relevance within the token budget, topics whose embedding is close
    /// to the query, and the most recent summaries.
    pub async fn relevant_context(
        &self,
        conversation_id: &str,
        query: &str,
        max_tokens: usize,
    ) -> Result<RelevantContext, AnalysisError> {
        self.ensure_loaded(conversation_id).await?;
        let Some(entry) = self
            .conversations
            .get(conversation_id)
            .map(|e| e.value().clone())
        else {
            return Ok(RelevantContext::default());
        };

        let query_embedding = self
            .embedding_provider
            .embed(query, &self.embedding_model, "semantic_similarity")
            .await
            .ok();

        let mut ranked: Vec<&MessageRelevance> = entry
            .state
            .context_window
            .active_messages
            .iter()
            .filter_map(|id| entry.relevances.get(id))
            .collect();
        ranked.sort_by(|a, b| {
            b.current_relevance
                .partial_cmp(&a.current_relevance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut messages = Vec::new();
        let mut budget = 0usize;
        for relevance in ranked {
            if budget + relevance.token_count > max_tokens {
                continue;
            }
            if let Some(message) = entry.messages.get(&relevance.message_id) {
                budget += relevance.token_count;
                messages.push(message.clone());
            }
        }

        let mut topics: Vec<(ConversationTopic, f32)> = Vec::new();
        if let Some(query_embedding) = &query_embedding {
            for topic in &entry.topics {
                let Some(topic_embedding) = &topic.embedding else {
                    continue;
                };
                if let Ok(similarity) = cosine_similarity(query_embedding, topic_embedding) {
                    if similarity >= TOPIC_MATCH_THRESHOLD {
                        topics.push((topic.clone(), similarity));
                    }
                }
            }
        }
        topics.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        topics.truncate(CONTEXT_TOPIC_LIMIT);

        let summaries = self
            .repository
            .recent_summaries(conversation_id, CONTEXT_SUMMARY_LIMIT as i64)
            .await?;

        Ok(RelevantContext {
            messages,
            topics: topics.into_iter().map(|(t, _)| t).collect(),
            summaries,
            current_topic_id: entry.state.current_topic_id.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::DbPool;

    /// Embeds every text to the same direction, so all messages land on
    /// one topic.
    struct ConstantProvider;

    #[async_trait::async_trait]
    impl EmbeddingProvider for ConstantProvider {
        async fn embed(
            &self,
            _content: &str,
            _model_name: &str,
            _task_type: &str,
        ) -> Result<Vec<f32>, AnalysisError> {
            Ok(vec![1.0, 0.0, 0.0])
        }

        async fn embed_batch(
            &self,
            contents: &[String],
            _model_name: &str,
            _task_type: &str,
        ) -> Result<Vec<Vec<f32>>, AnalysisError> {
            Ok(contents.iter().map(|_| vec![1.0, 0.0, 0.0]).collect())
        }
    }

    struct EchoGenerator;

    #[async_trait::async_trait]
    impl GenerationProvider for EchoGenerator {
        async fn generate(
            &self,
            _prompt: &str,
            _config: &GenerationConfig,
        ) -> Result<String, AnalysisError> {
            Ok("a short generated summary".to_string())
        }
    }

    async fn manager(config: ConversationMemoryConfig) -> ConversationMemoryManager {
        let db = DbPool::in_memory().await.unwrap();
        ConversationMemoryManager::new(
            Arc::new(Repository::new(db)),
            Arc::new(ConstantProvider),
            Arc::new(EchoGenerator),
            config,
            "test-model".to_string(),
        )
    }

    fn message_of(words: usize, text: &str) -> ChatMessage {
        let content = format!("{} ", text).repeat(words).trim().to_string();
        ChatMessage::user(content)
    }

    #[tokio::test]
    async fn messages_accumulate_tokens_and_counts() {
        let manager = manager(ConversationMemoryConfig::default()).await;
        let msg = ChatMessage::user("discussing cache eviction policies today");
        manager.add_message("conv-1", &msg).await.unwrap();

        let state = manager.get_state("conv-1").await.unwrap().unwrap();
        assert_eq!(state.message_count, 1);
        assert_eq!(state.turn_count, 1);
        assert_eq!(state.context_window.active_messages.len(), 1);
        assert!(state.context_window.current_token_count > 0);
    }

    #[tokio::test]
    async fn pruning_archives_low_relevance_messages() {
        let config = ConversationMemoryConfig {
            max_context_tokens: 1_000,
            summary_threshold: 100,
            ..Default::default()
        };
        let manager = manager(config).await;

        // ~80 tokens each, all assistant (medium priority, prunable)
        for i in 0..20 {
            let content = format!("reply {} ", i).repeat(40).trim().to_string();
            let msg = ChatMessage::assistant(content);
            manager.add_message("conv-prune", &msg).await.unwrap();
        }

        let state = manager.get_state("conv-prune").await.unwrap().unwrap();
        assert!(state.context_window.compression_count >= 1);
        assert!(state.context_window.last_pruned.is_some());
        assert!(state.context_window.current_token_count <= 700);
        assert!(!state.context_window.archived_messages.is_empty());

        // active and archived sets stay disjoint
        for id in &state.context_window.archived_messages {
            assert!(!state.context_window.active_messages.contains(id));
        }
    }

    #[tokio::test]
    async fn high_priority_messages_survive_pruning() {
        let config = ConversationMemoryConfig {
            max_context_tokens: 500,
            summary_threshold: 100,
            ..Default::default()
        };
        let manager = manager(config).await;

        let critical = message_of(60, "user question");
        manager.add_message("conv-hp", &critical).await.unwrap();
        for i in 0..10 {
            let content = format!("assistant answer {} ", i).repeat(20);
            manager
                .add_message("conv-hp", &ChatMessage::assistant(content))
                .await
                .unwrap();
        }

        let state = manager.get_state("conv-hp").await.unwrap().unwrap();
        // the user message is high priority and must still be active
        assert!(state
            .context_window
            .active_messages
            .contains(&critical.id));
    }

    #[tokio::test]
    async fn summaries_trigger_on_threshold_and_are_idempotent() {
        let config = ConversationMemoryConfig {
            max_context_tokens: 1_000_000,
            summary_threshold: 5,
            ..Default::default()
        };
        let manager = manager(config).await;

        for i in 0..5 {
            manager
                .add_message("conv-sum", &ChatMessage::user(format!("message {i} about topics")))
                .await
                .unwrap();
        }

        let state = manager.get_state("conv-sum").await.unwrap().unwrap();
        assert_eq!(state.context_window.active_summaries.len(), 1);

        let summaries = manager
            .repository
            .recent_summaries("conv-sum", 10)
            .await
            .unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].covered_messages.len(), 5);
        assert!(summaries[0].token_count <= summaries[0].original_token_count.max(summaries[0].token_count));
    }

    #[tokio::test]
    async fn archival_rejects_further_writes() {
        let config = ConversationMemoryConfig {
            max_conversation_length: 100,
            max_context_tokens: 1_000_000,
            summary_threshold: 1_000,
            ..Default::default()
        };
        let manager = manager(config).await;

        for i in 0..101 {
            manager
                .add_message("conv-arch", &ChatMessage::user(format!("note number {i}")))
                .await
                .unwrap();
        }

        let state = manager.get_state("conv-arch").await.unwrap().unwrap();
        assert!(state.is_archived);

        let result = manager
            .add_message("conv-arch", &ChatMessage::user("one more"))
            .await;
        assert!(matches!(result, Err(AnalysisError::ConversationArchived(_))));
    }

    #[tokio::test]
    async fn similar_messages_merge_into_one_topic() {
        let manager = manager(ConversationMemoryConfig::default()).await;

        manager
            .add_message("conv-topic", &ChatMessage::user("cache eviction strategies"))
            .await
            .unwrap();
        manager
            .add_message("conv-topic", &ChatMessage::user("more about cache eviction"))
            .await
            .unwrap();

        let topics = manager
            .repository
            .topics_for_conversation("conv-topic")
            .await
            .unwrap();
        // the constant embedding makes every message maximally similar
        assert_eq!(topics.len(), 1);
        assert_eq!(topics[0].message_count, 2);
    }

    #[tokio::test]
    async fn relevant_context_respects_the_token_budget() {
        let config = ConversationMemoryConfig {
            max_context_tokens: 1_000_000,
            summary_threshold: 1_000,
            ..Default::default()
        };
        let manager = manager(config).await;

        for i in 0..10 {
            manager
                .add_message(
                    "conv-ctx",
                    &ChatMessage::user(format!("message {i} with exactly seven words total")),
                )
                .await
                .unwrap();
        }

        let context = manager
            .relevant_context("conv-ctx", "seven words", 20)
            .await
            .unwrap();

        let total: usize = context
            .messages
            .iter()
            .map(|m| count_tokens(&m.content))
            .sum();
        assert!(total <= 20);
        assert!(!context.messages.is_empty());
        assert!(context.topics.len() <= 5);
    }
}
