use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::logging::{ActivityLog, ActivityType};
use crate::memory::keywords::extract_keywords;
use crate::models::tags::TagModel;
use crate::processing::chunker::ChunkingStrategy;
use crate::processing::extractor::ContentExtractor;
use crate::processing::pipeline::{BatchProcessingResult, PipelineOptions};
use crate::resilience::degradation::DegradedOutcome;
use crate::services::llm_service::GenerationConfig;
use crate::state::AppState;
use crate::utils::error::{AnalysisError, ApiError};

#[derive(Deserialize)]
pub struct AnalyzeRequest {
    pub path: String,
    #[serde(default = "default_max_tags")]
    pub max_tags: usize,
    #[serde(default)]
    pub generate_summary: bool,
}

fn default_max_tags() -> usize {
    10
}

#[derive(Serialize)]
pub struct AnalyzeResponse {
    pub tags: Vec<TagModel>,
    pub summary: Option<String>,
    pub elapsed_ms: u64,
    pub partial: bool,
    pub intervention_task_id: Option<String>,
}

/// Analyze one document: extract, derive tags, optionally summarize. Runs
/// under graceful degradation, so terminal failures return partial tags
/// instead of an error body.
pub async fn analyze_document(
    Extension(state): Extension<AppState>,
    Json(request): Json<AnalyzeRequest>,
) -> Result<Json<AnalyzeResponse>, ApiError> {
    let start = Instant::now();
    let timeout = Duration::from_secs(state.settings.pipeline.processing_timeout_seconds);
    let path = request.path.clone();

    let state_for_op = state.clone();
    let outcome = state
        .degradation
        .run_with_fallback(&request.path, timeout, move || async move {
            analyze_inner(
                &state_for_op,
                Path::new(&path),
                request.max_tags,
                request.generate_summary,
            )
            .await
        })
        .await;

    let elapsed_ms = start.elapsed().as_millis() as u64;
    state.activity_logger.log(
        ActivityLog::builder(ActivityType::DocumentProcessed)
            .document(&request.path)
            .processing_time(elapsed_ms as i64)
            .build(),
    );

    match outcome {
        DegradedOutcome::Full((tags, summary)) => Ok(Json(AnalyzeResponse {
            tags,
            summary,
            elapsed_ms,
            partial: false,
            intervention_task_id: None,
        })),
        DegradedOutcome::Partial {
            partial_tags,
            intervention_task_id,
            ..
        } => Ok(Json(AnalyzeResponse {
            tags: partial_tags,
            summary: None,
            elapsed_ms,
            partial: true,
            intervention_task_id,
        })),
    }
}

async fn analyze_inner(
    state: &AppState,
    path: &Path,
    max_tags: usize,
    generate_summary: bool,
) -> Result<(Vec<TagModel>, Option<String>), AnalysisError> {
    let owned = path.to_path_buf();
    let extracted = tokio::task::spawn_blocking(move || ContentExtractor::extract(&owned))
        .await
        .map_err(|e| AnalysisError::ToolInit(e.to_string()))??;

    if extracted.cleaned_content.is_empty() {
        return Err(AnalysisError::TagExtraction(format!(
            "no analyzable content: {}",
            extracted.processing_notes.join("; ")
        )));
    }

    let keywords = extract_keywords(&extracted.cleaned_content);
    let mut tags: Vec<TagModel> = keywords
        .into_iter()
        .enumerate()
        .map(|(rank, keyword)| {
            // confidence decays with keyword rank
            TagModel::new(keyword, (1.0 - rank as f32 * 0.05).max(0.5))
                .with_category("content")
        })
        .take(max_tags)
        .collect();

    if let Some(language) = &extracted.metadata.language {
        tags.push(TagModel::new(language.clone(), 0.9).with_category("language"));
        tags.truncate(max_tags);
    }

    if tags.is_empty() {
        return Err(AnalysisError::TagExtraction(
            "keyword extraction produced no tags".to_string(),
        ));
    }

    let summary = if generate_summary {
        let excerpt: String = extracted.cleaned_content.chars().take(6_000).collect();
        let prompt = format!(
            "Summarize this document in two or three sentences:\n\n{excerpt}"
        );
        Some(
            state
                .generation_provider
                .generate(&prompt, &GenerationConfig::default())
                .await?,
        )
    } else {
        None
    };

    Ok((tags, summary))
}

#[derive(Deserialize)]
pub struct BatchRequest {
    pub paths: Vec<String>,
    #[serde(default)]
    pub strategy: Option<String>,
    #[serde(default)]
    pub generate_embeddings: bool,
}

/// Batch processing endpoint. Always answers 200 with per-document
/// outcomes; only a malformed request fails the call itself.
pub async fn process_batch(
    Extension(state): Extension<AppState>,
    Json(request): Json<BatchRequest>,
) -> Result<Json<BatchProcessingResult>, ApiError> {
    if request.paths.is_empty() {
        return Err(ApiError::BadRequest("paths must not be empty".to_string()));
    }

    let options = PipelineOptions {
        strategy: request
            .strategy
            .as_deref()
            .map(ChunkingStrategy::parse)
            .unwrap_or_default(),
        generate_embeddings: request.generate_embeddings,
    };

    let documents: Vec<PathBuf> = request.paths.iter().map(PathBuf::from).collect();
    let result = state
        .pipeline
        .process(documents, options, CancellationToken::new())
        .await;

    state.activity_logger.log(
        ActivityLog::builder(ActivityType::BatchCompleted)
            .message(format!(
                "{}/{} documents succeeded",
                result.successful_documents, result.total_documents
            ))
            .processing_time((result.elapsed_seconds * 1000.0) as i64)
            .build(),
    );

    Ok(Json(result))
}
