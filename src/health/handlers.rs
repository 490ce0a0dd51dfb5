use std::collections::BTreeMap;

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::health::probe::ProbeStatus;
use crate::http::server::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub status: &'static str,
    pub services: BTreeMap<String, ProbeStatus>,
}

/// Liveness: no dependency checks.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "healthy" })
}

/// Readiness: 200 only when every backend probe succeeds.
pub async fn ready(State(state): State<AppState>) -> (StatusCode, Json<ReadyResponse>) {
    let report = state.probe.check_all(&state.routes, &state.breakers).await;

    if report.is_ready() {
        (
            StatusCode::OK,
            Json(ReadyResponse {
                status: "ready",
                services: report.services,
            }),
        )
    } else {
        tracing::warn!(services = ?report.services, "Gateway not ready");
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyResponse {
                status: "not ready",
                services: report.services,
            }),
        )
    }
}
