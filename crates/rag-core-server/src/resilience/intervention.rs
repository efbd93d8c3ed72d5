//! Persisted manual-intervention queue for failures automation cannot
//! recover from.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::database::Repository;
use crate::utils::error::AnalysisError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterventionPriority {
    Critical,
    High,
    Medium,
    Low,
}

impl InterventionPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "critical" => Self::Critical,
            "high" => Self::High,
            "low" => Self::Low,
            _ => Self::Medium,
        }
    }

    fn escalated(self) -> Self {
        match self {
            Self::Low => Self::Medium,
            Self::Medium => Self::High,
            Self::High | Self::Critical => Self::Critical,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterventionStatus {
    Pending,
    InProgress,
    Resolved,
    Dismissed,
    Escalated,
}

impl InterventionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Resolved => "resolved",
            Self::Dismissed => "dismissed",
            Self::Escalated => "escalated",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "in_progress" => Self::InProgress,
            "resolved" => Self::Resolved,
            "dismissed" => Self::Dismissed,
            "escalated" => Self::Escalated,
            _ => Self::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Resolved | Self::Dismissed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterventionTask {
    pub id: String,
    pub error_kind: String,
    pub error_message: String,
    pub document_path: Option<String>,
    pub context: serde_json::Value,
    pub priority: InterventionPriority,
    pub status: InterventionStatus,
    pub created_at: DateTime<Utc>,
    pub assigned_to: Option<String>,
    pub resolution_notes: Option<String>,
    pub resolution_steps: Vec<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub escalation_count: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct InterventionStatistics {
    pub queue_depth: i64,
    pub by_priority: HashMap<String, usize>,
}

const RETENTION_DAYS: i64 = 30;
const RATE_WINDOW_HOURS: i64 = 24;

pub struct InterventionManager {
    repository: Arc<Repository>,
    escalation_thresholds: HashMap<&'static str, i64>,
}

impl InterventionManager {
    pub fn new(repository: Arc<Repository>) -> Self {
        // per-kind counts within the 24h window before a task is raised
        let escalation_thresholds = HashMap::from([
            ("timeout", 5),
            ("provider_transient", 10),
            ("provider_quota_or_auth", 3),
            ("file_access", 10),
            ("decode_failed", 10),
            ("persistence", 3),
            ("tool_init", 1),
            ("configuration", 1),
        ]);

        Self {
            repository,
            escalation_thresholds,
        }
    }

    /// Priority by failure kind: timeouts are medium, open circuits low,
    /// provider/tool failures high, configuration and fallback exhaustion
    /// critical.
    pub fn priority_for(error: &AnalysisError) -> InterventionPriority {
        match error {
            AnalysisError::Timeout(_) => InterventionPriority::Medium,
            AnalysisError::CircuitOpen(_) => InterventionPriority::Low,
            AnalysisError::ProviderQuotaOrAuth(_)
            | AnalysisError::ProviderTransient(_)
            | AnalysisError::ToolInit(_) => InterventionPriority::High,
            AnalysisError::Configuration(_) | AnalysisError::FallbackExhausted(_) => {
                InterventionPriority::Critical
            }
            _ => InterventionPriority::Medium,
        }
    }

    /// Record a failure and decide whether it warrants a task.
    /// `FallbackExhausted` and `CircuitOpen` always do; other kinds only
    /// once their rolling 24h rate reaches the per-kind threshold.
    pub async fn handle_failure(
        &self,
        error: &AnalysisError,
        document_path: Option<&str>,
        context: serde_json::Value,
    ) -> Result<Option<String>, AnalysisError> {
        let kind = error.kind_label();
        self.repository.record_failure_event(kind).await?;

        let always = matches!(
            error,
            AnalysisError::FallbackExhausted(_) | AnalysisError::CircuitOpen(_)
        );

        if !always {
            let threshold = *self.escalation_thresholds.get(kind).unwrap_or(&5);
            let since = Utc::now() - ChronoDuration::hours(RATE_WINDOW_HOURS);
            let recent = self.repository.count_failures_since(kind, since).await?;
            if recent < threshold {
                return Ok(None);
            }
        }

        let task = InterventionTask {
            id: Uuid::new_v4().to_string(),
            error_kind: kind.to_string(),
            error_message: error.to_string(),
            document_path: document_path.map(|p| p.to_string()),
            context,
            priority: Self::priority_for(error),
            status: InterventionStatus::Pending,
            created_at: Utc::now(),
            assigned_to: None,
            resolution_notes: None,
            resolution_steps: Self::resolution_steps(kind),
            resolved_at: None,
            escalation_count: 0,
        };

        self.repository.upsert_intervention_task(&task).await?;
        warn!(
            "Created intervention task {} ({}, priority {})",
            task.id,
            kind,
            task.priority.as_str()
        );

        Ok(Some(task.id))
    }

    fn resolution_steps(kind: &str) -> Vec<String> {
        match kind {
            "timeout" => vec![
                "Check provider latency and queue depth".to_string(),
                "Re-run the document with a longer timeout".to_string(),
            ],
            "circuit_open" => vec![
                "Wait for the provider to recover".to_string(),
                "Reset the breaker once the provider is healthy".to_string(),
            ],
            "provider_quota_or_auth" => vec![
                "Verify API credentials and quota".to_string(),
            ],
            "configuration" => vec![
                "Fix the configuration and restart the process".to_string(),
            ],
            _ => vec!["Review the error context and re-run manually".to_string()],
        }
    }

    pub async fn update_status(
        &self,
        task_id: &str,
        status: InterventionStatus,
        notes: Option<String>,
    ) -> Result<bool, AnalysisError> {
        let Some(mut task) = self.repository.get_intervention_task(task_id).await? else {
            return Ok(false);
        };

        task.status = status;
        if let Some(notes) = notes {
            task.resolution_notes = Some(match task.resolution_notes {
                Some(existing) => format!("{existing}\n{notes}"),
                None => notes,
            });
        }
        if status.is_terminal() {
            task.resolved_at = Some(Utc::now());
        }

        self.repository.upsert_intervention_task(&task).await?;
        info!("Intervention task {} moved to {}", task_id, status.as_str());
        Ok(true)
    }

    /// Bump a task one priority level and mark it escalated.
    pub async fn escalate(&self, task_id: &str, reason: &str) -> Result<bool, AnalysisError> {
        let Some(mut task) = self.repository.get_intervention_task(task_id).await? else {
            return Ok(false);
        };

        task.escalation_count += 1;
        task.priority = task.priority.escalated();
        task.status = InterventionStatus::Escalated;
        let note = format!(
            "[escalation {}] {}: {}",
            task.escalation_count,
            Utc::now().to_rfc3339(),
            reason
        );
        task.resolution_notes = Some(match task.resolution_notes {
            Some(existing) => format!("{existing}\n{note}"),
            None => note,
        });

        self.repository.upsert_intervention_task(&task).await?;
        warn!(
            "Escalated intervention task {} to {}",
            task_id,
            task.priority.as_str()
        );
        Ok(true)
    }

    pub async fn active_tasks(&self) -> Result<Vec<InterventionTask>, AnalysisError> {
        let mut tasks = self.repository.active_intervention_tasks().await?;
        tasks.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.created_at.cmp(&b.created_at)));
        Ok(tasks)
    }

    pub async fn queue_depth(&self) -> Result<i64, AnalysisError> {
        self.repository.intervention_queue_depth().await
    }

    pub async fn statistics(&self) -> Result<InterventionStatistics, AnalysisError> {
        let tasks = self.active_tasks().await?;
        let mut by_priority: HashMap<String, usize> = HashMap::new();
        for task in &tasks {
            *by_priority
                .entry(task.priority.as_str().to_string())
                .or_insert(0) += 1;
        }

        Ok(InterventionStatistics {
            queue_depth: tasks.len() as i64,
            by_priority,
        })
    }

    /// Drop terminal tasks older than the retention window.
    pub async fn prune(&self) -> Result<u64, AnalysisError> {
        let cutoff = Utc::now() - ChronoDuration::days(RETENTION_DAYS);
        self.repository.prune_intervention_tasks(cutoff).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::DbPool;

    async fn manager() -> InterventionManager {
        let db = DbPool::in_memory().await.unwrap();
        InterventionManager::new(Arc::new(Repository::new(db)))
    }

    #[test]
    fn priority_map_matches_failure_kinds() {
        assert_eq!(
            InterventionManager::priority_for(&AnalysisError::Timeout(30)),
            InterventionPriority::Medium
        );
        assert_eq!(
            InterventionManager::priority_for(&AnalysisError::CircuitOpen("x".into())),
            InterventionPriority::Low
        );
        assert_eq!(
            InterventionManager::priority_for(&AnalysisError::ToolInit("x".into())),
            InterventionPriority::High
        );
        assert_eq!(
            InterventionManager::priority_for(&AnalysisError::Configuration("x".into())),
            InterventionPriority::Critical
        );
        assert_eq!(
            InterventionManager::priority_for(&AnalysisError::FallbackExhausted("x".into())),
            InterventionPriority::Critical
        );
    }

    #[tokio::test]
    async fn circuit_open_always_creates_a_task() {
        let manager = manager().await;
        let task_id = manager
            .handle_failure(
                &AnalysisError::CircuitOpen("embedding".into()),
                Some("doc.md"),
                serde_json::json!({}),
            )
            .await
            .unwrap();

        assert!(task_id.is_some());
        assert_eq!(manager.queue_depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn rate_gated_kinds_need_repeated_failures() {
        let manager = manager().await;

        // persistence threshold is 3: the first two failures stay quiet
        for _ in 0..2 {
            let task_id = manager
                .handle_failure(
                    &AnalysisError::Persistence("disk".into()),
                    None,
                    serde_json::json!({}),
                )
                .await
                .unwrap();
            assert!(task_id.is_none());
        }

        let task_id = manager
            .handle_failure(
                &AnalysisError::Persistence("disk".into()),
                None,
                serde_json::json!({}),
            )
            .await
            .unwrap();
        assert!(task_id.is_some());
    }

    #[tokio::test]
    async fn resolving_sets_the_resolution_time() {
        let manager = manager().await;
        let task_id = manager
            .handle_failure(
                &AnalysisError::CircuitOpen("x".into()),
                None,
                serde_json::json!({}),
            )
            .await
            .unwrap()
            .unwrap();

        manager
            .update_status(&task_id, InterventionStatus::Resolved, Some("done".into()))
            .await
            .unwrap();

        let task = manager
            .repository
            .get_intervention_task(&task_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.status, InterventionStatus::Resolved);
        assert!(task.resolved_at.is_some());
        assert_eq!(manager.queue_depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn escalation_bumps_priority_one_level() {
        let manager = manager().await;
        let task_id = manager
            .handle_failure(
                &AnalysisError::CircuitOpen("x".into()),
                None,
                serde_json::json!({}),
            )
            .await
            .unwrap()
            .unwrap();

        manager.escalate(&task_id, "stuck too long").await.unwrap();

        let task = manager
            .repository
            .get_intervention_task(&task_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.priority, InterventionPriority::Medium);
        assert_eq!(task.escalation_count, 1);
        assert_eq!(task.status, InterventionStatus::Escalated);
    }
}
