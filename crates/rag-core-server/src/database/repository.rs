use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use super::DbPool;
use crate::logging::ActivityLog;
use crate::models::embedding::EmbeddingEntry;
use crate::models::memory::{
    ConversationArchive, ConversationState, ConversationSummary, ConversationTopic,
    MemoryMetrics, MemoryPriority, MessageRelevance, TopicTransition,
};
use crate::resilience::intervention::InterventionTask;
use crate::utils::error::AnalysisError;

/// Everything one conversation operation mutated. Persisted as a single
/// transaction so a crash never leaves the state row ahead of its
/// dependents.
#[derive(Debug, Default)]
pub struct ConversationUpdate {
    pub state: Option<ConversationState>,
    pub relevances: Vec<MessageRelevance>,
    pub topics: Vec<ConversationTopic>,
    pub summaries: Vec<ConversationSummary>,
    pub transitions: Vec<TopicTransition>,
    pub metrics: Option<MemoryMetrics>,
    pub archive: Option<ConversationArchive>,
}

/// The single SQL surface of the crate. Callers never see rows, only the
/// domain models.
pub struct Repository {
    pool: SqlitePool,
}

impl Repository {
    pub fn new(db: DbPool) -> Self {
        Self {
            pool: db.inner().clone(),
        }
    }

    // ------------------------------------------------------------------
    // Embeddings (cache tier 2)
    // ------------------------------------------------------------------

    /// Read one embedding, bumping its access counters in the same
    /// transaction as the read.
    pub async fn get_embedding(&self, key: &str) -> Result<Option<EmbeddingEntry>, AnalysisError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM embeddings WHERE content_hash = ?")
            .bind(key)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };

        let mut entry = row_to_embedding(&row)?;
        let now = Utc::now();
        sqlx::query(
            "UPDATE embeddings SET last_accessed = ?, access_count = access_count + 1 \
             WHERE content_hash = ?",
        )
        .bind(now)
        .bind(key)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        entry.touch_at(now);
        Ok(Some(entry))
    }

    /// Batch read with access tracking, one transaction for the lot.
    pub async fn batch_get_embeddings(
        &self,
        keys: &[String],
    ) -> Result<Vec<EmbeddingEntry>, AnalysisError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await?;

        let mut builder =
            sqlx::QueryBuilder::<sqlx::Sqlite>::new("SELECT * FROM embeddings WHERE content_hash IN (");
        let mut separated = builder.separated(", ");
        for key in keys {
            separated.push_bind(key);
        }
        separated.push_unseparated(")");

        let rows = builder.build().fetch_all(&mut *tx).await?;

        let now = Utc::now();
        let mut entries = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut entry = row_to_embedding(row)?;
            sqlx::query(
                "UPDATE embeddings SET last_accessed = ?, access_count = access_count + 1 \
                 WHERE content_hash = ?",
            )
            .bind(now)
            .bind(&entry.content_hash)
            .execute(&mut *tx)
            .await?;
            entry.touch_at(now);
            entries.push(entry);
        }

        tx.commit().await?;
        Ok(entries)
    }

    pub async fn upsert_embedding(&self, entry: &EmbeddingEntry) -> Result<(), AnalysisError> {
        let vector_json = serde_json::to_string(&entry.vector)
            .map_err(|e| AnalysisError::Persistence(e.to_string()))?;

        sqlx::query(
            "INSERT OR REPLACE INTO embeddings \
             (content_hash, vector, model_name, content_preview, token_count, \
              created_at, last_accessed, access_count, content_type, chunk_index, document_path) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.content_hash)
        .bind(&vector_json)
        .bind(&entry.model_name)
        .bind(&entry.content_preview)
        .bind(entry.token_count)
        .bind(entry.created_at)
        .bind(entry.last_accessed)
        .bind(entry.access_count)
        .bind(&entry.content_type)
        .bind(entry.chunk_index)
        .bind(&entry.document_path)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn batch_upsert_embeddings(
        &self,
        entries: &[EmbeddingEntry],
    ) -> Result<usize, AnalysisError> {
        if entries.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        for entry in entries {
            let vector_json = serde_json::to_string(&entry.vector)
                .map_err(|e| AnalysisError::Persistence(e.to_string()))?;
            sqlx::query(
                "INSERT OR REPLACE INTO embeddings \
                 (content_hash, vector, model_name, content_preview, token_count, \
                  created_at, last_accessed, access_count, content_type, chunk_index, document_path) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&entry.content_hash)
            .bind(&vector_json)
            .bind(&entry.model_name)
            .bind(&entry.content_preview)
            .bind(entry.token_count)
            .bind(entry.created_at)
            .bind(entry.last_accessed)
            .bind(entry.access_count)
            .bind(&entry.content_type)
            .bind(entry.chunk_index)
            .bind(&entry.document_path)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(entries.len())
    }

    /// Popular entries for startup warm-up, ordered by access count then
    /// recency.
    pub async fn most_accessed_embeddings(
        &self,
        min_access_count: i64,
        limit: i64,
    ) -> Result<Vec<EmbeddingEntry>, AnalysisError> {
        let rows = sqlx::query(
            "SELECT * FROM embeddings WHERE access_count >= ? \
             ORDER BY access_count DESC, last_accessed DESC LIMIT ?",
        )
        .bind(min_access_count)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_embedding).collect()
    }

    pub async fn embeddings_for_documents(
        &self,
        document_paths: &[String],
        limit: i64,
    ) -> Result<Vec<EmbeddingEntry>, AnalysisError> {
        if document_paths.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder = sqlx::QueryBuilder::<sqlx::Sqlite>::new(
            "SELECT * FROM embeddings WHERE document_path IN (",
        );
        let mut separated = builder.separated(", ");
        for path in document_paths {
            separated.push_bind(path);
        }
        separated.push_unseparated(") ORDER BY access_count DESC, last_accessed DESC LIMIT ");
        builder.push_bind(limit);

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_embedding).collect()
    }

    pub async fn embedding_store_stats(&self) -> Result<(i64, i64), AnalysisError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total, COALESCE(SUM(LENGTH(vector)), 0) AS bytes FROM embeddings",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok((row.try_get("total")?, row.try_get("bytes")?))
    }

    /// Remove stale entries: idle beyond the cutoff with low access count.
    pub async fn cleanup_embeddings(
        &self,
        idle_cutoff: DateTime<Utc>,
        max_access_count: i64,
    ) -> Result<u64, AnalysisError> {
        let result = sqlx::query("DELETE FROM embeddings WHERE last_accessed < ? AND access_count < ?")
            .bind(idle_cutoff)
            .bind(max_access_count)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    // ------------------------------------------------------------------
    // Conversation memory
    // ------------------------------------------------------------------

    /// Persist one conversation operation atomically.
    pub async fn persist_conversation_update(
        &self,
        update: &ConversationUpdate,
    ) -> Result<(), AnalysisError> {
        let mut tx = self.pool.begin().await?;

        if let Some(state) = &update.state {
            let topic_history = serde_json::to_string(&state.topic_history)
                .map_err(|e| AnalysisError::Persistence(e.to_string()))?;
            let context_window = serde_json::to_string(&state.context_window)
                .map_err(|e| AnalysisError::Persistence(e.to_string()))?;
            let memory_config = serde_json::to_string(&state.memory_config)
                .map_err(|e| AnalysisError::Persistence(e.to_string()))?;

            sqlx::query(
                "INSERT OR REPLACE INTO conversation_states \
                 (conversation_id, current_topic_id, previous_topic_id, topic_history, \
                  message_count, turn_count, session_start, last_activity, context_window, \
                  memory_config, is_archived, archive_reason, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&state.conversation_id)
            .bind(&state.current_topic_id)
            .bind(&state.previous_topic_id)
            .bind(&topic_history)
            .bind(state.message_count as i64)
            .bind(state.turn_count as i64)
            .bind(state.session_start)
            .bind(state.last_activity)
            .bind(&context_window)
            .bind(&memory_config)
            .bind(state.is_archived as i64)
            .bind(&state.archive_reason)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;
        }

        let conversation_id = update
            .state
            .as_ref()
            .map(|s| s.conversation_id.clone())
            .unwrap_or_default();

        for relevance in &update.relevances {
            let topic_relevance = serde_json::to_string(&relevance.topic_relevance)
                .map_err(|e| AnalysisError::Persistence(e.to_string()))?;
            sqlx::query(
                "INSERT OR REPLACE INTO message_relevance \
                 (message_id, conversation_id, base_relevance, current_relevance, decay_factor, \
                  last_updated, topic_relevance, priority, access_count, last_accessed, token_count) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&relevance.message_id)
            .bind(&conversation_id)
            .bind(relevance.base_relevance)
            .bind(relevance.current_relevance)
            .bind(relevance.decay_factor)
            .bind(relevance.last_updated)
            .bind(&topic_relevance)
            .bind(relevance.priority.as_str())
            .bind(relevance.access_count as i64)
            .bind(relevance.last_accessed)
            .bind(relevance.token_count as i64)
            .execute(&mut *tx)
            .await?;
        }

        for topic in &update.topics {
            let keywords = serde_json::to_string(&topic.keywords)
                .map_err(|e| AnalysisError::Persistence(e.to_string()))?;
            let embedding = match &topic.embedding {
                Some(v) => Some(
                    serde_json::to_string(v)
                        .map_err(|e| AnalysisError::Persistence(e.to_string()))?,
                ),
                None => None,
            };
            let subtopics = serde_json::to_string(&topic.subtopic_ids)
                .map_err(|e| AnalysisError::Persistence(e.to_string()))?;

            sqlx::query(
                "INSERT OR REPLACE INTO topics \
                 (id, conversation_id, name, keywords, relevance_score, confidence_score, \
                  first_mention, last_mention, message_count, embedding, parent_topic_id, subtopic_ids) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&topic.id)
            .bind(&conversation_id)
            .bind(&topic.name)
            .bind(&keywords)
            .bind(topic.relevance_score)
            .bind(topic.confidence_score)
            .bind(topic.first_mention)
            .bind(topic.last_mention)
            .bind(topic.message_count as i64)
            .bind(&embedding)
            .bind(&topic.parent_topic_id)
            .bind(&subtopics)
            .execute(&mut *tx)
            .await?;
        }

        for summary in &update.summaries {
            let key_points = serde_json::to_string(&summary.key_points)
                .map_err(|e| AnalysisError::Persistence(e.to_string()))?;
            let covered_messages = serde_json::to_string(&summary.covered_messages)
                .map_err(|e| AnalysisError::Persistence(e.to_string()))?;
            let covered_topics = serde_json::to_string(&summary.covered_topics)
                .map_err(|e| AnalysisError::Persistence(e.to_string()))?;
            let coverage_key = coverage_key(&summary.covered_messages);

            sqlx::query(
                "INSERT OR IGNORE INTO summaries \
                 (id, conversation_id, summary_type, content, key_points, covered_messages, \
                  coverage_key, covered_topics, compression_ratio, token_count, \
                  original_token_count, relevance_score, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&summary.id)
            .bind(&summary.conversation_id)
            .bind(&summary.summary_type)
            .bind(&summary.content)
            .bind(&key_points)
            .bind(&covered_messages)
            .bind(&coverage_key)
            .bind(&covered_topics)
            .bind(summary.compression_ratio)
            .bind(summary.token_count as i64)
            .bind(summary.original_token_count as i64)
            .bind(summary.relevance_score)
            .bind(summary.created_at)
            .execute(&mut *tx)
            .await?;
        }

        for transition in &update.transitions {
            sqlx::query(
                "INSERT INTO topic_transitions \
                 (id, conversation_id, from_topic_id, to_topic_id, transition_kind, message_id, \
                  confidence, similarity_score, bridging_context, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&transition.id)
            .bind(&transition.conversation_id)
            .bind(&transition.from_topic_id)
            .bind(&transition.to_topic_id)
            .bind(transition.transition_kind.as_str())
            .bind(&transition.message_id)
            .bind(transition.confidence)
            .bind(transition.similarity_score)
            .bind(&transition.bridging_context)
            .bind(transition.created_at)
            .execute(&mut *tx)
            .await?;
        }

        if let Some(metrics) = &update.metrics {
            sqlx::query(
                "INSERT OR REPLACE INTO memory_metrics \
                 (conversation_id, total_messages, active_messages, archived_messages, \
                  total_summaries, compression_ratio, avg_relevance_score, topics_identified, \
                  topic_transitions, processing_time_ms, last_updated) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&metrics.conversation_id)
            .bind(metrics.total_messages as i64)
            .bind(metrics.active_messages as i64)
            .bind(metrics.archived_messages as i64)
            .bind(metrics.total_summaries as i64)
            .bind(metrics.compression_ratio)
            .bind(metrics.avg_relevance_score)
            .bind(metrics.topics_identified as i64)
            .bind(metrics.topic_transitions as i64)
            .bind(metrics.processing_time_ms)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;
        }

        if let Some(archive) = &update.archive {
            let key_topics = serde_json::to_string(&archive.key_topics)
                .map_err(|e| AnalysisError::Persistence(e.to_string()))?;
            let important = serde_json::to_string(&archive.important_messages)
                .map_err(|e| AnalysisError::Persistence(e.to_string()))?;

            sqlx::query(
                "INSERT OR REPLACE INTO conversation_archives \
                 (archive_id, conversation_id, final_summary, key_topics, important_messages, archived_at) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&archive.archive_id)
            .bind(&archive.conversation_id)
            .bind(&archive.final_summary)
            .bind(&key_topics)
            .bind(&important)
            .bind(archive.archived_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn load_conversation_state(
        &self,
        conversation_id: &str,
    ) -> Result<Option<ConversationState>, AnalysisError> {
        let row = sqlx::query("SELECT * FROM conversation_states WHERE conversation_id = ?")
            .bind(conversation_id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let topic_history: Vec<String> =
            serde_json::from_str(&row.try_get::<String, _>("topic_history")?)
                .map_err(|e| AnalysisError::Persistence(e.to_string()))?;
        let context_window = serde_json::from_str(&row.try_get::<String, _>("context_window")?)
            .map_err(|e| AnalysisError::Persistence(e.to_string()))?;
        let memory_config = serde_json::from_str(&row.try_get::<String, _>("memory_config")?)
            .map_err(|e| AnalysisError::Persistence(e.to_string()))?;

        Ok(Some(ConversationState {
            conversation_id: row.try_get("conversation_id")?,
            current_topic_id: row.try_get("current_topic_id")?,
            previous_topic_id: row.try_get("previous_topic_id")?,
            topic_history,
            message_count: row.try_get::<i64, _>("message_count")? as usize,
            turn_count: row.try_get::<i64, _>("turn_count")? as usize,
            session_start: row.try_get("session_start")?,
            last_activity: row.try_get("last_activity")?,
            context_window,
            memory_config,
            is_archived: row.try_get::<i64, _>("is_archived")? != 0,
            archive_reason: row.try_get("archive_reason")?,
        }))
    }

    pub async fn relevances_for_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<MessageRelevance>, AnalysisError> {
        let rows = sqlx::query("SELECT * FROM message_relevance WHERE conversation_id = ?")
            .bind(conversation_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                let topic_relevance =
                    serde_json::from_str(&row.try_get::<String, _>("topic_relevance")?)
                        .map_err(|e| AnalysisError::Persistence(e.to_string()))?;
                Ok(MessageRelevance {
                    message_id: row.try_get("message_id")?,
                    base_relevance: row.try_get("base_relevance")?,
                    current_relevance: row.try_get("current_relevance")?,
                    decay_factor: row.try_get("decay_factor")?,
                    last_updated: row.try_get("last_updated")?,
                    topic_relevance,
                    priority: parse_priority(&row.try_get::<String, _>("priority")?),
                    access_count: row.try_get::<i64, _>("access_count")? as usize,
                    last_accessed: row.try_get("last_accessed")?,
                    token_count: row.try_get::<i64, _>("token_count")? as usize,
                })
            })
            .collect()
    }

    pub async fn topics_for_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<ConversationTopic>, AnalysisError> {
        let rows = sqlx::query("SELECT * FROM topics WHERE conversation_id = ?")
            .bind(conversation_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                let keywords = serde_json::from_str(&row.try_get::<String, _>("keywords")?)
                    .map_err(|e| AnalysisError::Persistence(e.to_string()))?;
                let embedding = match row.try_get::<Option<String>, _>("embedding")? {
                    Some(json) => Some(
                        serde_json::from_str(&json)
                            .map_err(|e| AnalysisError::Persistence(e.to_string()))?,
                    ),
                    None => None,
                };
                let subtopic_ids = serde_json::from_str(&row.try_get::<String, _>("subtopic_ids")?)
                    .map_err(|e| AnalysisError::Persistence(e.to_string()))?;

                Ok(ConversationTopic {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                    keywords,
                    relevance_score: row.try_get("relevance_score")?,
                    confidence_score: row.try_get("confidence_score")?,
                    first_mention: row.try_get("first_mention")?,
                    last_mention: row.try_get("last_mention")?,
                    message_count: row.try_get::<i64, _>("message_count")? as usize,
                    embedding,
                    parent_topic_id: row.try_get("parent_topic_id")?,
                    subtopic_ids,
                })
            })
            .collect()
    }

    pub async fn recent_summaries(
        &self,
        conversation_id: &str,
        limit: i64,
    ) -> Result<Vec<ConversationSummary>, AnalysisError> {
        let rows = sqlx::query(
            "SELECT * FROM summaries WHERE conversation_id = ? ORDER BY created_at DESC LIMIT ?",
        )
        .bind(conversation_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let key_points = serde_json::from_str(&row.try_get::<String, _>("key_points")?)
                    .map_err(|e| AnalysisError::Persistence(e.to_string()))?;
                let covered_messages =
                    serde_json::from_str(&row.try_get::<String, _>("covered_messages")?)
                        .map_err(|e| AnalysisError::Persistence(e.to_string()))?;
                let covered_topics =
                    serde_json::from_str(&row.try_get::<String, _>("covered_topics")?)
                        .map_err(|e| AnalysisError::Persistence(e.to_string()))?;

                Ok(ConversationSummary {
                    id: row.try_get("id")?,
                    conversation_id: row.try_get("conversation_id")?,
                    summary_type: row.try_get("summary_type")?,
                    content: row.try_get("content")?,
                    key_points,
                    covered_messages,
                    covered_topics,
                    compression_ratio: row.try_get("compression_ratio")?,
                    token_count: row.try_get::<i64, _>("token_count")? as usize,
                    original_token_count: row.try_get::<i64, _>("original_token_count")? as usize,
                    relevance_score: row.try_get("relevance_score")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    /// True when a summary already covers exactly this message set.
    pub async fn summary_exists_for(
        &self,
        covered_messages: &[String],
    ) -> Result<bool, AnalysisError> {
        let key = coverage_key(covered_messages);
        let row = sqlx::query("SELECT 1 FROM summaries WHERE coverage_key = ?")
            .bind(&key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn load_memory_metrics(
        &self,
        conversation_id: &str,
    ) -> Result<Option<MemoryMetrics>, AnalysisError> {
        let row = sqlx::query("SELECT * FROM memory_metrics WHERE conversation_id = ?")
            .bind(conversation_id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(MemoryMetrics {
            conversation_id: row.try_get("conversation_id")?,
            total_messages: row.try_get::<i64, _>("total_messages")? as usize,
            active_messages: row.try_get::<i64, _>("active_messages")? as usize,
            archived_messages: row.try_get::<i64, _>("archived_messages")? as usize,
            total_summaries: row.try_get::<i64, _>("total_summaries")? as usize,
            compression_ratio: row.try_get("compression_ratio")?,
            avg_relevance_score: row.try_get("avg_relevance_score")?,
            topics_identified: row.try_get::<i64, _>("topics_identified")? as usize,
            topic_transitions: row.try_get::<i64, _>("topic_transitions")? as usize,
            processing_time_ms: row.try_get("processing_time_ms")?,
            last_updated: row.try_get("last_updated")?,
        }))
    }

    // ------------------------------------------------------------------
    // Intervention queue
    // ------------------------------------------------------------------

    pub async fn upsert_intervention_task(
        &self,
        task: &InterventionTask,
    ) -> Result<(), AnalysisError> {
        let context = serde_json::to_string(&task.context)
            .map_err(|e| AnalysisError::Persistence(e.to_string()))?;
        let steps = serde_json::to_string(&task.resolution_steps)
            .map_err(|e| AnalysisError::Persistence(e.to_string()))?;

        sqlx::query(
            "INSERT OR REPLACE INTO intervention_tasks \
             (id, error_kind, error_message, document_path, context, priority, status, \
              created_at, assigned_to, resolution_notes, resolution_steps, resolved_at, escalation_count) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&task.id)
        .bind(&task.error_kind)
        .bind(&task.error_message)
        .bind(&task.document_path)
        .bind(&context)
        .bind(task.priority.as_str())
        .bind(task.status.as_str())
        .bind(task.created_at)
        .bind(&task.assigned_to)
        .bind(&task.resolution_notes)
        .bind(&steps)
        .bind(task.resolved_at)
        .bind(task.escalation_count as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_intervention_task(
        &self,
        id: &str,
    ) -> Result<Option<InterventionTask>, AnalysisError> {
        let row = sqlx::query("SELECT * FROM intervention_tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_intervention).transpose()
    }

    pub async fn active_intervention_tasks(&self) -> Result<Vec<InterventionTask>, AnalysisError> {
        let rows = sqlx::query(
            "SELECT * FROM intervention_tasks \
             WHERE status IN ('pending', 'in_progress', 'escalated') \
             ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_intervention).collect()
    }

    pub async fn intervention_queue_depth(&self) -> Result<i64, AnalysisError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS depth FROM intervention_tasks \
             WHERE status IN ('pending', 'in_progress', 'escalated')",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("depth")?)
    }

    pub async fn prune_intervention_tasks(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, AnalysisError> {
        let result = sqlx::query(
            "DELETE FROM intervention_tasks \
             WHERE status IN ('resolved', 'dismissed') AND created_at < ?",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn record_failure_event(&self, kind: &str) -> Result<(), AnalysisError> {
        sqlx::query("INSERT INTO failure_events (kind, created_at) VALUES (?, ?)")
            .bind(kind)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn count_failures_since(
        &self,
        kind: &str,
        since: DateTime<Utc>,
    ) -> Result<i64, AnalysisError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total FROM failure_events WHERE kind = ? AND created_at >= ?",
        )
        .bind(kind)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("total")?)
    }

    // ------------------------------------------------------------------
    // Activity log sink
    // ------------------------------------------------------------------

    pub async fn insert_activity_batch(&self, logs: &[ActivityLog]) -> Result<usize, AnalysisError> {
        if logs.is_empty() {
            return Ok(0);
        }

        let mut builder = sqlx::QueryBuilder::<sqlx::Sqlite>::new(
            "INSERT INTO activity_logs \
             (conversation_id, activity_type, activity_status, document_path, message, \
              error_message, token_count, processing_time_ms, custom_fields, created_at) ",
        );

        builder.push_values(logs, |mut b, log| {
            let custom = log
                .custom_fields
                .as_ref()
                .and_then(|f| serde_json::to_string(f).ok());
            b.push_bind(log.conversation_id.clone())
                .push_bind(log.activity_type.as_str())
                .push_bind(log.activity_status.as_str())
                .push_bind(log.document_path.clone())
                .push_bind(log.message.clone())
                .push_bind(log.error_message.clone())
                .push_bind(log.token_count)
                .push_bind(log.processing_time_ms)
                .push_bind(custom)
                .push_bind(log.created_at);
        });

        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected() as usize)
    }
}

/// Deterministic key over a covered message set; duplicate summary enqueues
/// collapse on it.
pub fn coverage_key(covered_messages: &[String]) -> String {
    let mut sorted: Vec<&String> = covered_messages.iter().collect();
    sorted.sort();
    let joined = sorted
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join("|");
    crate::utils::hashing::content_digest(&joined)
}

fn row_to_embedding(row: &sqlx::sqlite::SqliteRow) -> Result<EmbeddingEntry, AnalysisError> {
    let vector: Vec<f32> = serde_json::from_str(&row.try_get::<String, _>("vector")?)
        .map_err(|e| AnalysisError::Persistence(e.to_string()))?;

    Ok(EmbeddingEntry {
        content_hash: row.try_get("content_hash")?,
        vector,
        model_name: row.try_get("model_name")?,
        content_preview: row.try_get("content_preview")?,
        token_count: row.try_get("token_count")?,
        created_at: row.try_get("created_at")?,
        last_accessed: row.try_get("last_accessed")?,
        access_count: row.try_get("access_count")?,
        content_type: row.try_get("content_type")?,
        chunk_index: row.try_get("chunk_index")?,
        document_path: row.try_get("document_path")?,
    })
}

fn row_to_intervention(row: &sqlx::sqlite::SqliteRow) -> Result<InterventionTask, AnalysisError> {
    use crate::resilience::intervention::{InterventionPriority, InterventionStatus};

    let context = serde_json::from_str(&row.try_get::<String, _>("context")?)
        .map_err(|e| AnalysisError::Persistence(e.to_string()))?;
    let steps = serde_json::from_str(&row.try_get::<String, _>("resolution_steps")?)
        .map_err(|e| AnalysisError::Persistence(e.to_string()))?;

    Ok(InterventionTask {
        id: row.try_get("id")?,
        error_kind: row.try_get("error_kind")?,
        error_message: row.try_get("error_message")?,
        document_path: row.try_get("document_path")?,
        context,
        priority: InterventionPriority::parse(&row.try_get::<String, _>("priority")?),
        status: InterventionStatus::parse(&row.try_get::<String, _>("status")?),
        created_at: row.try_get("created_at")?,
        assigned_to: row.try_get("assigned_to")?,
        resolution_notes: row.try_get("resolution_notes")?,
        resolution_steps: steps,
        resolved_at: row.try_get("resolved_at")?,
        escalation_count: row.try_get::<i64, _>("escalation_count")? as u32,
    })
}

fn parse_priority(value: &str) -> MemoryPriority {
    match value {
        "critical" => MemoryPriority::Critical,
        "high" => MemoryPriority::High,
        "low" => MemoryPriority::Low,
        "archive" => MemoryPriority::Archive,
        _ => MemoryPriority::Medium,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::memory::{ConversationMemoryConfig, ConversationState};

    async fn repository() -> Repository {
        let db = DbPool::in_memory().await.unwrap();
        Repository::new(db)
    }

    fn state(conversation_id: &str) -> ConversationState {
        ConversationState::new(
            conversation_id.to_string(),
            ConversationMemoryConfig::default(),
        )
    }

    fn summary(conversation_id: &str, covered: &[&str]) -> ConversationSummary {
        ConversationSummary {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            summary_type: "periodic".to_string(),
            content: "summary text".to_string(),
            key_points: Vec::new(),
            covered_messages: covered.iter().map(|s| s.to_string()).collect(),
            covered_topics: Vec::new(),
            compression_ratio: 0.3,
            created_at: Utc::now(),
            token_count: 2,
            original_token_count: 10,
            relevance_score: 1.0,
        }
    }

    #[tokio::test]
    async fn conversation_state_round_trips() {
        let repo = repository().await;
        let mut state = state("conv-1");
        state.message_count = 7;
        state.topic_history = vec!["t1".to_string(), "t2".to_string()];
        state.context_window.current_token_count = 321;

        let update = ConversationUpdate {
            state: Some(state.clone()),
            ..Default::default()
        };
        repo.persist_conversation_update(&update).await.unwrap();

        let loaded = repo.load_conversation_state("conv-1").await.unwrap().unwrap();
        assert_eq!(loaded.message_count, 7);
        assert_eq!(loaded.topic_history, state.topic_history);
        assert_eq!(loaded.context_window.current_token_count, 321);
        assert!(!loaded.is_archived);
    }

    #[tokio::test]
    async fn duplicate_summary_coverage_collapses_to_one_row() {
        let repo = repository().await;
        let update = ConversationUpdate {
            state: Some(state("conv-2")),
            summaries: vec![summary("conv-2", &["m1", "m2", "m3"])],
            ..Default::default()
        };
        repo.persist_conversation_update(&update).await.unwrap();

        // a second summary over the same message set (different id) is a
        // no-op thanks to the coverage key
        let dup = ConversationUpdate {
            state: Some(state("conv-2")),
            summaries: vec![summary("conv-2", &["m3", "m1", "m2"])],
            ..Default::default()
        };
        repo.persist_conversation_update(&dup).await.unwrap();

        let summaries = repo.recent_summaries("conv-2", 10).await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert!(repo
            .summary_exists_for(&["m1".to_string(), "m2".to_string(), "m3".to_string()])
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn coverage_key_ignores_ordering() {
        let a = coverage_key(&["x".to_string(), "y".to_string()]);
        let b = coverage_key(&["y".to_string(), "x".to_string()]);
        let c = coverage_key(&["x".to_string(), "z".to_string()]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn embedding_access_counters_survive_reads() {
        let repo = repository().await;
        let entry = crate::models::embedding::EmbeddingEntry {
            content_hash: "key-1".to_string(),
            vector: vec![0.25, -0.5],
            model_name: "m1".to_string(),
            content_preview: "preview".to_string(),
            token_count: 2,
            created_at: Utc::now(),
            last_accessed: Utc::now(),
            access_count: 1,
            content_type: "text".to_string(),
            chunk_index: None,
            document_path: None,
        };
        repo.upsert_embedding(&entry).await.unwrap();

        let first = repo.get_embedding("key-1").await.unwrap().unwrap();
        assert_eq!(first.access_count, 2);
        assert_eq!(first.vector, entry.vector);

        let second = repo.get_embedding("key-1").await.unwrap().unwrap();
        assert_eq!(second.access_count, 3);
    }
}
