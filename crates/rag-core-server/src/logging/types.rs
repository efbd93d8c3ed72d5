use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Activity categories recorded by the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    RequestReceived,
    DocumentProcessed,
    BatchCompleted,
    CacheWarmed,
    CacheCleanup,
    ContextPruned,
    SummaryCreated,
    ConversationArchived,
    BreakerStateChanged,
    InterventionCreated,
    MessageSent,
    ProcessingStage,
}

impl ActivityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RequestReceived => "request_received",
            Self::DocumentProcessed => "document_processed",
            Self::BatchCompleted => "batch_completed",
            Self::CacheWarmed => "cache_warmed",
            Self::CacheCleanup => "cache_cleanup",
            Self::ContextPruned => "context_pruned",
            Self::SummaryCreated => "summary_created",
            Self::ConversationArchived => "conversation_archived",
            Self::BreakerStateChanged => "breaker_state_changed",
            Self::InterventionCreated => "intervention_created",
            Self::MessageSent => "message_sent",
            Self::ProcessingStage => "processing_stage",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityStatus {
    Success,
    Error,
    Warning,
    Info,
}

impl ActivityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Info => "info",
        }
    }
}

/// One activity log row, written asynchronously in batches.
#[derive(Debug, Clone)]
pub struct ActivityLog {
    pub conversation_id: Option<String>,
    pub activity_type: ActivityType,
    pub activity_status: ActivityStatus,
    pub document_path: Option<String>,
    pub message: Option<String>,
    pub error_message: Option<String>,
    pub token_count: Option<i64>,
    pub processing_time_ms: Option<i64>,
    pub custom_fields: Option<HashMap<String, Value>>,
    pub created_at: DateTime<Utc>,
}

impl ActivityLog {
    pub fn builder(activity_type: ActivityType) -> ActivityLogBuilder {
        ActivityLogBuilder::new(activity_type)
    }
}

pub struct ActivityLogBuilder {
    log: ActivityLog,
}

impl ActivityLogBuilder {
    pub fn new(activity_type: ActivityType) -> Self {
        Self {
            log: ActivityLog {
                conversation_id: None,
                activity_type,
                activity_status: ActivityStatus::Success,
                document_path: None,
                message: None,
                error_message: None,
                token_count: None,
                processing_time_ms: None,
                custom_fields: None,
                created_at: Utc::now(),
            },
        }
    }

    pub fn status(mut self, status: ActivityStatus) -> Self {
        self.log.activity_status = status;
        self
    }

    pub fn conversation(mut self, id: impl Into<String>) -> Self {
        self.log.conversation_id = Some(id.into());
        self
    }

    pub fn document(mut self, path: impl Into<String>) -> Self {
        self.log.document_path = Some(path.into());
        self
    }

    pub fn message(mut self, content: impl Into<String>) -> Self {
        self.log.message = Some(content.into());
        self
    }

    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.log.error_message = Some(message.into());
        self.log.activity_status = ActivityStatus::Error;
        self
    }

    pub fn token_count(mut self, count: i64) -> Self {
        self.log.token_count = Some(count);
        self
    }

    pub fn processing_time(mut self, ms: i64) -> Self {
        self.log.processing_time_ms = Some(ms);
        self
    }

    pub fn custom(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.log
            .custom_fields
            .get_or_insert_with(HashMap::new)
            .insert(key.to_string(), value.into());
        self
    }

    pub fn build(self) -> ActivityLog {
        self.log
    }
}
