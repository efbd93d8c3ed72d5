use axum::{Extension, Json};
use serde::Deserialize;

use crate::services::chat_service::ChatOutcome;
use crate::state::AppState;
use crate::utils::error::ApiError;

#[derive(Deserialize)]
pub struct ChatRequest {
    pub conversation_id: Option<String>,
    pub message: String,
    #[serde(default)]
    pub document_paths: Vec<String>,
    #[serde(default = "default_include_sources")]
    pub include_sources: bool,
    pub max_documents: Option<usize>,
}

fn default_include_sources() -> bool {
    true
}

pub async fn chat_handler(
    Extension(state): Extension<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatOutcome>, ApiError> {
    if request.message.trim().is_empty() {
        return Err(ApiError::BadRequest("message must not be empty".to_string()));
    }

    let outcome = state
        .chat
        .handle_message(
            request.conversation_id,
            &request.message,
            &request.document_paths,
            request.include_sources,
            request.max_documents,
        )
        .await?;

    Ok(Json(outcome))
}
