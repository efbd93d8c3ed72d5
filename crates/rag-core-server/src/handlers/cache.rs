use axum::{Extension, Json};
use serde::{Deserialize, Serialize};

use crate::cache::embedding_cache::EmbeddingCacheSnapshot;
use crate::logging::{ActivityLog, ActivityType};
use crate::state::AppState;
use crate::utils::error::ApiError;

#[derive(Deserialize)]
pub struct WarmRequest {
    pub paths: Vec<String>,
}

#[derive(Serialize)]
pub struct WarmResponse {
    pub items_warmed: usize,
}

pub async fn cache_warm(
    Extension(state): Extension<AppState>,
    Json(request): Json<WarmRequest>,
) -> Result<Json<WarmResponse>, ApiError> {
    if request.paths.is_empty() {
        return Err(ApiError::BadRequest("paths must not be empty".to_string()));
    }

    let items_warmed = state.embedding_cache.warm_for_documents(&request.paths).await;

    state.activity_logger.log(
        ActivityLog::builder(ActivityType::CacheWarmed)
            .message(format!("{items_warmed} embeddings warmed"))
            .build(),
    );

    Ok(Json(WarmResponse { items_warmed }))
}

pub async fn cache_stats(
    Extension(state): Extension<AppState>,
) -> Json<EmbeddingCacheSnapshot> {
    Json(state.embedding_cache.stats().await)
}
