use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use tracing::info;

use crate::config::DatabaseConfig;
use crate::utils::error::AnalysisError;

/// Embedded SQLite pool. The schema is created on first connection so a
/// fresh deployment needs no external migration step.
#[derive(Clone)]
pub struct DbPool {
    pool: SqlitePool,
}

impl DbPool {
    pub async fn new(config: &DatabaseConfig) -> Result<Self, AnalysisError> {
        if let Some(parent) = Path::new(&config.path).parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(&config.path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.pool_max_size)
            .connect_with(options)
            .await?;

        init_schema(&pool).await?;
        info!("Embedded store ready at {}", config.path);

        Ok(Self { pool })
    }

    /// Single-connection in-memory pool for tests. One connection keeps the
    /// in-memory database alive and shared across queries.
    pub async fn in_memory() -> Result<Self, AnalysisError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        init_schema(&pool).await?;
        Ok(Self { pool })
    }

    pub fn inner(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn init_schema(pool: &SqlitePool) -> Result<(), AnalysisError> {
    let statements = [
        r#"
        CREATE TABLE IF NOT EXISTS embeddings (
            content_hash TEXT PRIMARY KEY,
            vector TEXT NOT NULL,
            model_name TEXT NOT NULL,
            content_preview TEXT,
            token_count INTEGER DEFAULT 0,
            created_at TEXT NOT NULL,
            last_accessed TEXT NOT NULL,
            access_count INTEGER DEFAULT 0,
            content_type TEXT DEFAULT 'text',
            chunk_index INTEGER,
            document_path TEXT
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_embeddings_model ON embeddings(model_name)",
        "CREATE INDEX IF NOT EXISTS idx_embeddings_last_accessed ON embeddings(last_accessed)",
        "CREATE INDEX IF NOT EXISTS idx_embeddings_access_count ON embeddings(access_count)",
        "CREATE INDEX IF NOT EXISTS idx_embeddings_document ON embeddings(document_path)",
        r#"
        CREATE TABLE IF NOT EXISTS conversation_states (
            conversation_id TEXT PRIMARY KEY,
            current_topic_id TEXT,
            previous_topic_id TEXT,
            topic_history TEXT,
            message_count INTEGER DEFAULT 0,
            turn_count INTEGER DEFAULT 0,
            session_start TEXT,
            last_activity TEXT,
            context_window TEXT,
            memory_config TEXT,
            is_archived INTEGER DEFAULT 0,
            archive_reason TEXT,
            updated_at TEXT
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS message_relevance (
            message_id TEXT PRIMARY KEY,
            conversation_id TEXT,
            base_relevance REAL DEFAULT 1.0,
            current_relevance REAL DEFAULT 1.0,
            decay_factor REAL DEFAULT 1.0,
            last_updated TEXT,
            topic_relevance TEXT,
            priority TEXT DEFAULT 'medium',
            access_count INTEGER DEFAULT 0,
            last_accessed TEXT,
            token_count INTEGER DEFAULT 0,
            FOREIGN KEY (conversation_id) REFERENCES conversation_states(conversation_id)
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_relevance_conversation ON message_relevance(conversation_id)",
        "CREATE INDEX IF NOT EXISTS idx_relevance_updated ON message_relevance(last_updated)",
        r#"
        CREATE TABLE IF NOT EXISTS topics (
            id TEXT PRIMARY KEY,
            conversation_id TEXT,
            name TEXT NOT NULL,
            keywords TEXT,
            relevance_score REAL DEFAULT 1.0,
            confidence_score REAL DEFAULT 1.0,
            first_mention TEXT,
            last_mention TEXT,
            message_count INTEGER DEFAULT 1,
            embedding TEXT,
            parent_topic_id TEXT,
            subtopic_ids TEXT,
            FOREIGN KEY (conversation_id) REFERENCES conversation_states(conversation_id)
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_topics_conversation ON topics(conversation_id)",
        "CREATE INDEX IF NOT EXISTS idx_topics_last_mention ON topics(last_mention)",
        r#"
        CREATE TABLE IF NOT EXISTS summaries (
            id TEXT PRIMARY KEY,
            conversation_id TEXT,
            summary_type TEXT NOT NULL,
            content TEXT NOT NULL,
            key_points TEXT,
            covered_messages TEXT,
            coverage_key TEXT,
            covered_topics TEXT,
            compression_ratio REAL,
            token_count INTEGER,
            original_token_count INTEGER,
            relevance_score REAL DEFAULT 1.0,
            created_at TEXT,
            FOREIGN KEY (conversation_id) REFERENCES conversation_states(conversation_id)
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_summaries_conversation ON summaries(conversation_id)",
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_summaries_coverage ON summaries(coverage_key)",
        r#"
        CREATE TABLE IF NOT EXISTS topic_transitions (
            id TEXT PRIMARY KEY,
            conversation_id TEXT,
            from_topic_id TEXT,
            to_topic_id TEXT NOT NULL,
            transition_kind TEXT NOT NULL,
            message_id TEXT NOT NULL,
            confidence REAL,
            similarity_score REAL,
            bridging_context TEXT,
            created_at TEXT,
            FOREIGN KEY (conversation_id) REFERENCES conversation_states(conversation_id)
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_transitions_conversation ON topic_transitions(conversation_id)",
        r#"
        CREATE TABLE IF NOT EXISTS memory_metrics (
            conversation_id TEXT PRIMARY KEY,
            total_messages INTEGER DEFAULT 0,
            active_messages INTEGER DEFAULT 0,
            archived_messages INTEGER DEFAULT 0,
            total_summaries INTEGER DEFAULT 0,
            compression_ratio REAL DEFAULT 0.0,
            avg_relevance_score REAL DEFAULT 0.0,
            topics_identified INTEGER DEFAULT 0,
            topic_transitions INTEGER DEFAULT 0,
            processing_time_ms REAL DEFAULT 0.0,
            last_updated TEXT,
            FOREIGN KEY (conversation_id) REFERENCES conversation_states(conversation_id)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS conversation_archives (
            archive_id TEXT PRIMARY KEY,
            conversation_id TEXT,
            final_summary TEXT,
            key_topics TEXT,
            important_messages TEXT,
            archived_at TEXT
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS intervention_tasks (
            id TEXT PRIMARY KEY,
            error_kind TEXT NOT NULL,
            error_message TEXT,
            document_path TEXT,
            context TEXT,
            priority TEXT NOT NULL,
            status TEXT NOT NULL,
            created_at TEXT,
            assigned_to TEXT,
            resolution_notes TEXT,
            resolution_steps TEXT,
            resolved_at TEXT,
            escalation_count INTEGER DEFAULT 0
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_interventions_status ON intervention_tasks(status)",
        r#"
        CREATE TABLE IF NOT EXISTS failure_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            kind TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_failure_events ON failure_events(kind, created_at)",
        r#"
        CREATE TABLE IF NOT EXISTS activity_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation_id TEXT,
            activity_type TEXT NOT NULL,
            activity_status TEXT NOT NULL,
            document_path TEXT,
            message TEXT,
            error_message TEXT,
            token_count INTEGER,
            processing_time_ms INTEGER,
            custom_fields TEXT,
            created_at TEXT
        )
        "#,
    ];

    for statement in statements {
        sqlx::query(statement).execute(pool).await?;
    }

    Ok(())
}
