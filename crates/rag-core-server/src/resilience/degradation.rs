//! Graceful degradation: wrap fallible analysis work with a timeout,
//! produce partial results on terminal failure, and derive process health
//! from breaker and queue state.

use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

use super::circuit_breaker::{BreakerSnapshot, CircuitBreakerManager};
use super::intervention::InterventionManager;
use crate::models::tags::TagModel;
use crate::utils::error::AnalysisError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Healthy,
    Warning,
    Degraded,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub overall_status: HealthLevel,
    pub health_score: f64,
    pub circuit_breakers: Vec<BreakerSnapshot>,
    pub intervention_queue_depth: i64,
}

/// Outcome of a degradation-wrapped operation.
pub enum DegradedOutcome<T> {
    Full(T),
    Partial {
        partial_tags: Vec<TagModel>,
        intervention_task_id: Option<String>,
        error_kind: String,
        message: String,
    },
}

pub struct GracefulDegradation {
    breakers: Arc<CircuitBreakerManager>,
    interventions: Arc<InterventionManager>,
}

impl GracefulDegradation {
    pub fn new(
        breakers: Arc<CircuitBreakerManager>,
        interventions: Arc<InterventionManager>,
    ) -> Self {
        Self {
            breakers,
            interventions,
        }
    }

    /// Run an operation under a timeout. On terminal failure the caller
    /// gets a partial result and the failure lands in the intervention
    /// queue instead of propagating.
    pub async fn run_with_fallback<T, F, Fut>(
        &self,
        document_path: &str,
        timeout: Duration,
        op: F,
    ) -> DegradedOutcome<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AnalysisError>>,
    {
        let result = match tokio::time::timeout(timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(AnalysisError::Timeout(timeout.as_secs())),
        };

        match result {
            Ok(value) => DegradedOutcome::Full(value),
            Err(e) => {
                error!("Processing failed for {}: {}", document_path, e);

                let context = serde_json::json!({
                    "document_path": document_path,
                    "timeout_seconds": timeout.as_secs(),
                });
                let task_id = match self
                    .interventions
                    .handle_failure(&e, Some(document_path), context)
                    .await
                {
                    Ok(task_id) => task_id,
                    Err(persist_err) => {
                        warn!("Could not record intervention task: {}", persist_err);
                        None
                    }
                };

                DegradedOutcome::Partial {
                    partial_tags: Self::fallback_tags(),
                    intervention_task_id: task_id,
                    error_kind: e.kind_label().to_string(),
                    message: e.to_string(),
                }
            }
        }
    }

    /// The fixed partial-analysis markers returned when real tags are
    /// unavailable.
    pub fn fallback_tags() -> Vec<TagModel> {
        vec![
            TagModel::new("processing-interrupted", 0.5)
                .with_category("system")
                .with_description(
                    "Document processing was interrupted and requires manual review",
                ),
            TagModel::new("partial-analysis", 0.4)
                .with_category("system")
                .with_description("Incomplete analysis due to a processing failure"),
        ]
    }

    /// Health score: 1 - open/total breakers, discounted for a deep
    /// intervention queue. Thresholds 0.9 / 0.7 / 0.5 map to warning,
    /// degraded, critical.
    pub async fn health_status(&self) -> HealthStatus {
        let snapshots = self.breakers.all_snapshots();
        let mut score = 1.0 - self.breakers.open_ratio();

        let queue_depth = self.interventions.queue_depth().await.unwrap_or(0);
        if queue_depth > 10 {
            score *= 0.8;
        } else if queue_depth > 5 {
            score *= 0.9;
        }

        let overall_status = if score < 0.5 {
            HealthLevel::Critical
        } else if score < 0.7 {
            HealthLevel::Degraded
        } else if score < 0.9 {
            HealthLevel::Warning
        } else {
            HealthLevel::Healthy
        };

        HealthStatus {
            overall_status,
            health_score: score,
            circuit_breakers: snapshots,
            intervention_queue_depth: queue_depth,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{DbPool, Repository};
    use crate::resilience::circuit_breaker::CircuitBreakerConfig;

    async fn degradation() -> GracefulDegradation {
        let db = DbPool::in_memory().await.unwrap();
        let repository = Arc::new(Repository::new(db));
        GracefulDegradation::new(
            Arc::new(CircuitBreakerManager::new(CircuitBreakerConfig::default())),
            Arc::new(InterventionManager::new(repository)),
        )
    }

    #[tokio::test]
    async fn successful_operations_pass_through() {
        let service = degradation().await;
        let outcome = service
            .run_with_fallback("doc.md", Duration::from_secs(5), || async { Ok(42) })
            .await;

        assert!(matches!(outcome, DegradedOutcome::Full(42)));
    }

    #[tokio::test]
    async fn circuit_open_failure_yields_partial_tags_and_a_task() {
        let service = degradation().await;
        let outcome = service
            .run_with_fallback("doc.md", Duration::from_secs(5), || async {
                Err::<(), _>(AnalysisError::CircuitOpen("embedding".into()))
            })
            .await;

        match outcome {
            DegradedOutcome::Partial {
                partial_tags,
                intervention_task_id,
                error_kind,
                ..
            } => {
                assert_eq!(partial_tags.len(), 2);
                assert_eq!(partial_tags[0].name, "processing-interrupted");
                assert_eq!(partial_tags[1].name, "partial-analysis");
                assert!(intervention_task_id.is_some());
                assert_eq!(error_kind, "circuit_open");
            }
            DegradedOutcome::Full(_) => panic!("expected partial outcome"),
        }
    }

    #[tokio::test]
    async fn slow_operations_degrade_via_timeout() {
        let service = degradation().await;
        let outcome = service
            .run_with_fallback("doc.md", Duration::from_millis(20), || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        match outcome {
            DegradedOutcome::Partial { error_kind, .. } => assert_eq!(error_kind, "timeout"),
            DegradedOutcome::Full(_) => panic!("expected timeout"),
        }
    }

    #[tokio::test]
    async fn health_reflects_open_breakers_and_queue_depth() {
        let db = DbPool::in_memory().await.unwrap();
        let repository = Arc::new(Repository::new(db));
        let breakers = Arc::new(CircuitBreakerManager::new(CircuitBreakerConfig {
            failure_threshold: 1,
            ..CircuitBreakerConfig::default()
        }));
        let service = GracefulDegradation::new(
            breakers.clone(),
            Arc::new(InterventionManager::new(repository)),
        );

        let status = service.health_status().await;
        assert_eq!(status.overall_status, HealthLevel::Healthy);

        // open one of two breakers => score 0.5 => degraded boundary
        let bad = breakers.get_or_create("bad");
        let _good = breakers.get_or_create("good");
        let _ = bad
            .call(|| async { Err::<(), _>(AnalysisError::ProviderTransient("x".into())) })
            .await;

        let status = service.health_status().await;
        assert_eq!(status.overall_status, HealthLevel::Degraded);
    }
}
