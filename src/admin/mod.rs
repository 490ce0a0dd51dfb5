//! Operator surface under `/gateway/`.
//!
//! Unauthenticated; deploy behind a trusted network boundary.

pub mod handlers;

use axum::{
    routing::{get, post},
    Router,
};

use self::handlers::*;
use crate::http::server::AppState;

pub fn admin_router() -> Router<AppState> {
    Router::new()
        .route("/gateway/circuit-breaker/state", get(get_breaker_states))
        .route("/gateway/circuit-breaker/reset", post(reset_breaker))
}
