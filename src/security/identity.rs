//! Identity extraction middleware.
//!
//! Resolves the caller id for each request through an [`AuthExtractor`],
//! records it in the [`RequestContext`] and in the `X-User-ID` header that is
//! forwarded to backends. Token verification is the extractor's business; the
//! chain only sees a caller id or an [`AuthError`].

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderValue, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::http::request::{RequestIdExt, X_USER_ID};
use crate::http::response::GatewayError;

const MAX_CALLER_ID_LEN: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("caller id header is empty or not printable ASCII")]
    MalformedCallerId,
    #[error("caller id exceeds {MAX_CALLER_ID_LEN} bytes")]
    CallerIdTooLong,
    #[error("credentials rejected: {0}")]
    Rejected(String),
}

/// Established caller identity, attached to request extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerId(pub String);

impl fmt::Display for CallerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resolves who is calling.
pub trait AuthExtractor: Send + Sync + fmt::Debug {
    fn extract(&self, request: &Request<Body>) -> Result<CallerId, AuthError>;
}

/// Trusts `X-User-ID` when supplied, otherwise derives an anonymous id from
/// the remote address.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeaderAuthExtractor;

impl AuthExtractor for HeaderAuthExtractor {
    fn extract(&self, request: &Request<Body>) -> Result<CallerId, AuthError> {
        match request.headers().get(X_USER_ID) {
            Some(value) => {
                let caller = value
                    .to_str()
                    .map_err(|_| AuthError::MalformedCallerId)?
                    .trim();
                // A blank header is a malformed identity, not a missing one: no anonymous fallback.
                if caller.is_empty() {
                    return Err(AuthError::MalformedCallerId);
                }
                if caller.len() > MAX_CALLER_ID_LEN {
                    return Err(AuthError::CallerIdTooLong);
                }
                Ok(CallerId(caller.to_string()))
            }
            None => Ok(anonymous_caller(request.remote_addr())),
        }
    }
}

fn anonymous_caller(remote: Option<SocketAddr>) -> CallerId {
    let addr = remote
        .map(|a| a.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    CallerId(format!("anonymous-{}", addr.replace(':', "-")))
}

/// Paths that never require a caller identity.
pub fn is_public(path: &str) -> bool {
    path == "/health" || path == "/ready" || path.starts_with("/gateway/")
}

pub async fn identity_middleware(
    State(extractor): State<Arc<dyn AuthExtractor>>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    if is_public(req.uri().path()) {
        return next.run(req).await;
    }

    let caller = match extractor.extract(&req) {
        Ok(caller) => caller,
        Err(e) => return GatewayError::Unauthorized(e).into_response(),
    };

    if let Some(ctx) = req.context() {
        ctx.set_caller_id(caller.0.clone());
    }
    match HeaderValue::from_str(&caller.0) {
        Ok(value) => {
            req.headers_mut().insert(X_USER_ID, value);
        }
        Err(_) => {
            return GatewayError::Unauthorized(AuthError::MalformedCallerId).into_response();
        }
    }
    req.extensions_mut().insert(caller);

    next.run(req).await
}
