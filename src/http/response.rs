//! Gateway-produced responses.
//!
//! # Responsibilities
//! - Map gateway and backend failures to HTTP status codes
//! - Keep failure bodies generic; detail only goes to the log
//!
//! # Status Mapping
//! - 400 missing query parameter
//! - 401 identity extraction failed
//! - 404 unknown service
//! - 429 admission denied (with `Retry-After`)
//! - 502 downstream failure (transport error or backend 5xx)
//! - 503 circuit open
//! - 504 downstream deadline exceeded

use std::time::Duration;

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::proxy::DispatchError;
use crate::security::identity::AuthError;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("missing query parameter '{0}'")]
    MissingParameter(&'static str),

    #[error("identity extraction failed: {0}")]
    Unauthorized(#[from] AuthError),

    #[error("unknown service '{0}'")]
    UnknownService(String),

    #[error("rate limit exceeded, retry after {}s", .retry_after.as_secs())]
    RateLimited { retry_after: Duration },

    #[error("circuit open for service '{0}'")]
    CircuitOpen(String),

    #[error("service '{service}' failed: {source}")]
    Upstream {
        service: String,
        #[source]
        source: DispatchError,
    },
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::MissingParameter(_) => StatusCode::BAD_REQUEST,
            GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GatewayError::UnknownService(_) => StatusCode::NOT_FOUND,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::CircuitOpen(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Upstream { source, .. } if source.is_timeout() => {
                StatusCode::GATEWAY_TIMEOUT
            }
            GatewayError::Upstream { .. } => StatusCode::BAD_GATEWAY,
        }
    }

    fn public_message(&self) -> &'static str {
        match self {
            GatewayError::MissingParameter(_) => "Missing required parameter",
            GatewayError::Unauthorized(_) => "Unauthorized",
            GatewayError::UnknownService(_) => "Unknown service",
            GatewayError::RateLimited { .. } => "Rate limit exceeded",
            GatewayError::CircuitOpen(_) => "Service unavailable",
            GatewayError::Upstream { source, .. } if source.is_timeout() => "Request timeout",
            GatewayError::Upstream { .. } => "Service error",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(error = %self, status = status.as_u16(), "Request failed");
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "Request rejected");
        }

        let mut response = (status, self.public_message()).into_response();
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        if let GatewayError::RateLimited { retry_after } = self {
            let secs = retry_after.as_secs().max(1);
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}
