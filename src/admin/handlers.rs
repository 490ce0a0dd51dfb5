use std::collections::BTreeMap;

use axum::{
    extract::{Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::http::response::GatewayError;
use crate::http::server::AppState;
use crate::resilience::circuit_breaker::CircuitState;

#[derive(Debug, Serialize)]
pub struct BreakerStates {
    pub states: BTreeMap<String, CircuitState>,
}

#[derive(Debug, Deserialize)]
pub struct ResetParams {
    pub service: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ResetResponse {
    pub message: String,
    pub service: String,
}

/// State of every configured service's breaker.
pub async fn get_breaker_states(State(state): State<AppState>) -> Json<BreakerStates> {
    let states = state
        .routes
        .service_names()
        .map(|name| (name.to_string(), state.breakers.state(name)))
        .collect();
    Json(BreakerStates { states })
}

pub async fn reset_breaker(
    State(state): State<AppState>,
    Query(params): Query<ResetParams>,
) -> Result<Json<ResetResponse>, GatewayError> {
    let service = params
        .service
        .filter(|s| !s.is_empty())
        .ok_or(GatewayError::MissingParameter("service"))?;
    if !state.routes.contains(&service) {
        return Err(GatewayError::UnknownService(service));
    }

    state.breakers.reset(&service);
    tracing::info!(service = %service, "Circuit breaker reset by operator");

    Ok(Json(ResetResponse {
        message: format!("Circuit breaker reset for {service}"),
        service,
    }))
}
