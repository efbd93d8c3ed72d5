//! Circuit breakers guarding every outward capability call.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::config::BreakerSettings;
use crate::utils::error::AnalysisError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub success_threshold: u32,
    pub timeout: Duration,
    pub rolling_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 3,
            timeout: Duration::from_secs(120),
            rolling_window: Duration::from_secs(300),
        }
    }
}

impl From<&BreakerSettings> for CircuitBreakerConfig {
    fn from(settings: &BreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold,
            recovery_timeout: Duration::from_secs(settings.recovery_timeout_seconds),
            success_threshold: settings.success_threshold,
            timeout: Duration::from_secs(settings.timeout_seconds),
            rolling_window: Duration::from_secs(settings.rolling_window_seconds),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: usize,
    pub consecutive_successes: u32,
    pub seconds_since_last_failure: Option<u64>,
    pub seconds_since_last_success: Option<u64>,
    pub failure_threshold: u32,
    pub success_threshold: u32,
}

struct BreakerInner {
    state: CircuitState,
    failure_times: VecDeque<Instant>,
    consecutive_successes: u32,
    last_failure: Option<Instant>,
    last_success: Option<Instant>,
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_times: VecDeque::new(),
                consecutive_successes: 0,
                last_failure: None,
                last_success: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Run an operation under this breaker. Open circuits fast-fail
    /// without invoking the operation; the configured timeout counts as a
    /// failure.
    pub async fn call<F, Fut, T>(&self, op: F) -> Result<T, AnalysisError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AnalysisError>>,
    {
        {
            let mut inner = self.inner.lock();

            if inner.state == CircuitState::Open {
                let recovered = inner
                    .last_failure
                    .is_some_and(|t| t.elapsed() >= self.config.recovery_timeout);
                if recovered {
                    inner.state = CircuitState::HalfOpen;
                    inner.consecutive_successes = 0;
                    info!("Circuit breaker {} transitioning to half_open", self.name);
                } else {
                    warn!("Circuit breaker {} is open, failing fast", self.name);
                    return Err(AnalysisError::CircuitOpen(self.name.clone()));
                }
            }
        }

        let result = tokio::time::timeout(self.config.timeout, op()).await;

        match result {
            Ok(Ok(value)) => {
                self.on_success();
                Ok(value)
            }
            Ok(Err(e)) => {
                self.on_failure();
                Err(e)
            }
            Err(_) => {
                self.on_failure();
                Err(AnalysisError::Timeout(self.config.timeout.as_secs()))
            }
        }
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock();
        inner.last_success = Some(Instant::now());

        match inner.state {
            CircuitState::HalfOpen => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.failure_times.clear();
                    info!("Circuit breaker {} transitioning to closed", self.name);
                }
            }
            CircuitState::Closed => {
                // a success in closed state pays down one failure
                inner.failure_times.pop_front();
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        inner.last_failure = Some(now);
        inner.failure_times.push_back(now);

        let window = self.config.rolling_window;
        while inner
            .failure_times
            .front()
            .is_some_and(|t| t.elapsed() > window)
        {
            inner.failure_times.pop_front();
        }

        let failures = inner.failure_times.len() as u32;

        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.consecutive_successes = 0;
                warn!("Circuit breaker {} reopening after half_open failure", self.name);
            }
            CircuitState::Closed if failures >= self.config.failure_threshold => {
                inner.state = CircuitState::Open;
                error!(
                    "Circuit breaker {} opening after {} failures",
                    self.name, failures
                );
            }
            _ => {}
        }
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.failure_times.clear();
        inner.consecutive_successes = 0;
        inner.last_failure = None;
        inner.last_success = None;
        info!("Circuit breaker {} manually reset to closed", self.name);
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_times.len(),
            consecutive_successes: inner.consecutive_successes,
            seconds_since_last_failure: inner.last_failure.map(|t| t.elapsed().as_secs()),
            seconds_since_last_success: inner.last_success.map(|t| t.elapsed().as_secs()),
            failure_threshold: self.config.failure_threshold,
            success_threshold: self.config.success_threshold,
        }
    }
}

/// Process-wide registry, one breaker per capability name. Injected from
/// the composition root; tests build their own.
pub struct CircuitBreakerManager {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    default_config: CircuitBreakerConfig,
}

impl CircuitBreakerManager {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            default_config,
        }
    }

    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(name, self.default_config.clone()))
            })
            .clone()
    }

    pub fn all_snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut snapshots: Vec<BreakerSnapshot> =
            self.breakers.iter().map(|entry| entry.snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    pub fn open_ratio(&self) -> f64 {
        let total = self.breakers.len();
        if total == 0 {
            return 0.0;
        }
        let open = self
            .breakers
            .iter()
            .filter(|entry| entry.state() == CircuitState::Open)
            .count();
        open as f64 / total as f64
    }

    pub fn reset_all(&self) {
        for entry in self.breakers.iter() {
            entry.reset();
        }
        info!("All circuit breakers reset");
    }
}

impl Default for CircuitBreakerManager {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 2,
            recovery_timeout: Duration::from_millis(100),
            success_threshold: 2,
            timeout: Duration::from_secs(5),
            rolling_window: Duration::from_secs(60),
        }
    }

    async fn fail(breaker: &CircuitBreaker) {
        let _ = breaker
            .call(|| async { Err::<(), _>(AnalysisError::ProviderTransient("boom".into())) })
            .await;
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<(), AnalysisError> {
        breaker.call(|| async { Ok(()) }).await
    }

    #[tokio::test]
    async fn below_threshold_failures_keep_the_circuit_closed() {
        let breaker = CircuitBreaker::new("test", fast_config());
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn full_recovery_cycle() {
        let breaker = CircuitBreaker::new("test", fast_config());

        // fail, fail => open
        fail(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        // open circuit fast-fails without invoking the op
        let result = succeed(&breaker).await;
        assert!(matches!(result, Err(AnalysisError::CircuitOpen(_))));

        // wait past recovery, success => half_open
        tokio::time::sleep(Duration::from_millis(120)).await;
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        // second success => closed
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("test", fast_config());
        fail(&breaker).await;
        fail(&breaker).await;
        tokio::time::sleep(Duration::from_millis(120)).await;

        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn closed_success_pays_down_failures() {
        let breaker = CircuitBreaker::new("test", fast_config());
        fail(&breaker).await;
        succeed(&breaker).await.unwrap();
        // the earlier failure was decremented, so one more stays closed
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn timeout_counts_as_failure() {
        let mut config = fast_config();
        config.timeout = Duration::from_millis(20);
        let breaker = CircuitBreaker::new("test", config);

        for _ in 0..2 {
            let result = breaker
                .call(|| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok::<(), AnalysisError>(())
                })
                .await;
            assert!(matches!(result, Err(AnalysisError::Timeout(_))));
        }
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn manager_tracks_open_ratio_and_reset() {
        let manager = CircuitBreakerManager::new(fast_config());
        let a = manager.get_or_create("a");
        let _b = manager.get_or_create("b");

        fail(&a).await;
        fail(&a).await;
        assert!((manager.open_ratio() - 0.5).abs() < 1e-9);

        manager.reset_all();
        assert_eq!(manager.open_ratio(), 0.0);
        assert_eq!(a.state(), CircuitState::Closed);
    }
}
