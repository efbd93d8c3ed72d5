use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Per-document failure collected inside a batch run.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentFailure {
    pub document_path: String,
    pub kind: String,
    pub message: String,
}

/// Failure taxonomy for the analysis core. Every error that crosses a module
/// boundary is one of these.
#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("File access error: {0}")]
    FileAccess(String),

    #[error("Unsupported document kind: {0}")]
    UnsupportedKind(String),

    #[error("Decode failed: {0}")]
    DecodeFailed(String),

    #[error("Tool initialization failed: {0}")]
    ToolInit(String),

    #[error("Transient provider error: {0}")]
    ProviderTransient(String),

    #[error("Provider quota or auth error: {0}")]
    ProviderQuotaOrAuth(String),

    #[error("Operation timed out after {0}s")]
    Timeout(u64),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Circuit breaker '{0}' is open")]
    CircuitOpen(String),

    #[error("Batch completed with {} failed document(s)", failures.len())]
    BatchAggregate { failures: Vec<DocumentFailure> },

    #[error("Tag extraction failed: {0}")]
    TagExtraction(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("All fallbacks exhausted: {0}")]
    FallbackExhausted(String),

    #[error("Conversation {0} is archived")]
    ConversationArchived(String),

    #[error("Persistence error: {0}")]
    Persistence(String),
}

impl AnalysisError {
    /// Stable label used for intervention classification and failure-rate
    /// accounting.
    pub fn kind_label(&self) -> &'static str {
        match self {
            Self::FileAccess(_) => "file_access",
            Self::UnsupportedKind(_) => "unsupported_kind",
            Self::DecodeFailed(_) => "decode_failed",
            Self::ToolInit(_) => "tool_init",
            Self::ProviderTransient(_) => "provider_transient",
            Self::ProviderQuotaOrAuth(_) => "provider_quota_or_auth",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
            Self::CircuitOpen(_) => "circuit_open",
            Self::BatchAggregate { .. } => "batch_aggregate",
            Self::TagExtraction(_) => "tag_extraction",
            Self::Configuration(_) => "configuration",
            Self::FallbackExhausted(_) => "fallback_exhausted",
            Self::ConversationArchived(_) => "conversation_archived",
            Self::Persistence(_) => "persistence",
        }
    }

    /// Whether a retry inside the batcher is worthwhile.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ProviderTransient(_) | Self::Timeout(_))
    }
}

impl From<sqlx::Error> for AnalysisError {
    fn from(err: sqlx::Error) -> Self {
        AnalysisError::Persistence(err.to_string())
    }
}

impl From<std::io::Error> for AnalysisError {
    fn from(err: std::io::Error) -> Self {
        AnalysisError::FileAccess(err.to_string())
    }
}

/// HTTP-facing error wrapper for the thin dispatcher.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<AnalysisError> for ApiError {
    fn from(err: AnalysisError) -> Self {
        match &err {
            AnalysisError::FileAccess(_) | AnalysisError::UnsupportedKind(_) => {
                ApiError::NotFound(err.to_string())
            }
            AnalysisError::Configuration(_) => ApiError::BadRequest(err.to_string()),
            AnalysisError::CircuitOpen(_)
            | AnalysisError::ProviderTransient(_)
            | AnalysisError::ProviderQuotaOrAuth(_) => ApiError::ServiceUnavailable(err.to_string()),
            _ => ApiError::InternalError(err.to_string()),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            ApiError::BadRequest(msg) => {
                tracing::warn!("Bad request: {}", msg);
                (StatusCode::BAD_REQUEST, "BadRequest", msg)
            }
            ApiError::NotFound(msg) => {
                tracing::warn!("Not found: {}", msg);
                (StatusCode::NOT_FOUND, "NotFound", msg)
            }
            ApiError::ServiceUnavailable(msg) => {
                tracing::error!("Service unavailable: {}", msg);
                (StatusCode::SERVICE_UNAVAILABLE, "ServiceUnavailable", msg)
            }
            ApiError::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "InternalError", msg)
            }
        };

        let body = Json(ErrorResponse {
            error: error_type.to_string(),
            message,
        });

        (status, body).into_response()
    }
}
