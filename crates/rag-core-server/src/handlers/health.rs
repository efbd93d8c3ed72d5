use axum::{Extension, Json};
use serde::Serialize;

use crate::resilience::circuit_breaker::BreakerSnapshot;
use crate::resilience::degradation::HealthStatus;
use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    version: String,
    #[serde(flatten)]
    status: HealthStatus,
}

pub async fn health_check(Extension(state): Extension<AppState>) -> Json<HealthResponse> {
    let status = state.degradation.health_status().await;
    Json(HealthResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        status,
    })
}

pub async fn circuit_breakers(
    Extension(state): Extension<AppState>,
) -> Json<Vec<BreakerSnapshot>> {
    Json(state.breakers.all_snapshots())
}

#[derive(Serialize)]
pub struct ResetResponse {
    ok: bool,
}

pub async fn reset_circuit_breakers(
    Extension(state): Extension<AppState>,
) -> Json<ResetResponse> {
    state.breakers.reset_all();
    Json(ResetResponse { ok: true })
}
