//! Request correlation and access logging.
//!
//! # Responsibilities
//! - Reuse the caller's `X-Request-ID` or generate a UUID v4
//! - Carry per-request state ([`RequestContext`]) through the chain
//! - Record the final status exactly once and emit one access-log event
//! - Return the correlation id to the caller on every response
//!
//! # Design Decisions
//! - Request ID added as early as possible for tracing
//! - The id is written back into the inbound headers so the dispatcher forwards it
//! - Logging wraps everything after it, so short-circuiting stages are still logged

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use std::time::Instant;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{HeaderValue, Request, Response, StatusCode};
use tower::{Layer, Service};
use tracing::Instrument;
use uuid::Uuid;

use crate::observability::metrics;

/// Correlation header, accepted from callers and forwarded to backends.
pub const X_REQUEST_ID: &str = "x-request-id";

/// Caller identity header forwarded to backends.
pub const X_USER_ID: &str = "x-user-id";

/// Opaque correlation id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestId(String);

impl RequestId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Take the inbound header if it is present, non-empty and a valid header value.
    pub fn from_request<B>(req: &Request<B>) -> Option<Self> {
        req.headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| Self(v.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn header_value(&self) -> Option<HeaderValue> {
        HeaderValue::from_str(&self.0).ok()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-request state shared by the chain stages.
///
/// Created at request entry (by the panic boundary, or by the correlation
/// stage when used on its own) and dropped with the request.
#[derive(Debug)]
pub struct RequestContext {
    correlation_id: OnceLock<RequestId>,
    caller_id: OnceLock<String>,
    status: OnceLock<StatusCode>,
    started_at: Instant,
}

impl RequestContext {
    pub fn new() -> Self {
        Self {
            correlation_id: OnceLock::new(),
            caller_id: OnceLock::new(),
            status: OnceLock::new(),
            started_at: Instant::now(),
        }
    }

    pub fn correlation_id(&self) -> Option<&RequestId> {
        self.correlation_id.get()
    }

    /// Assigns the correlation id unless one is already set; returns the effective id.
    pub fn set_correlation_id(&self, id: RequestId) -> &RequestId {
        self.correlation_id.get_or_init(|| id)
    }

    pub fn caller_id(&self) -> Option<&str> {
        self.caller_id.get().map(String::as_str)
    }

    pub fn set_caller_id(&self, caller: String) {
        let _ = self.caller_id.set(caller);
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.status.get().copied()
    }

    /// First writer wins; returns false if a status was already captured.
    pub fn capture_status(&self, status: StatusCode) -> bool {
        self.status.set(status).is_ok()
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Extension trait to read request-scoped values.
pub trait RequestIdExt {
    /// The correlation id, if one has been assigned.
    fn request_id(&self) -> Option<String>;

    /// The shared request context, if the chain created one.
    fn context(&self) -> Option<Arc<RequestContext>>;

    /// Remote peer address, when the server was started with connect info.
    fn remote_addr(&self) -> Option<SocketAddr>;
}

impl<B> RequestIdExt for Request<B> {
    fn request_id(&self) -> Option<String> {
        self.headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    fn context(&self) -> Option<Arc<RequestContext>> {
        self.extensions().get::<Arc<RequestContext>>().cloned()
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr)
    }
}

/// Correlation id assignment plus access logging.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestIdLayer;

impl<S> Layer<S> for RequestIdLayer {
    type Service = RequestIdService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestIdService { inner }
    }
}

#[derive(Debug, Clone)]
pub struct RequestIdService<S> {
    inner: S,
}

impl<S> Service<Request<Body>> for RequestIdService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let ctx = match req.context() {
            Some(ctx) => ctx,
            None => {
                let ctx = Arc::new(RequestContext::new());
                req.extensions_mut().insert(ctx.clone());
                ctx
            }
        };

        let candidate = RequestId::from_request(&req)
            .filter(|id| id.header_value().is_some())
            .unwrap_or_else(RequestId::generate);
        let request_id = ctx.set_correlation_id(candidate).clone();
        if let Some(value) = request_id.header_value() {
            req.headers_mut().insert(X_REQUEST_ID, value);
        }

        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let span = tracing::info_span!(
            "request",
            request_id = %request_id,
            method = %method,
            path = %path,
        );

        // Take the service that was driven to readiness, leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(
            async move {
                let mut response = inner.call(req).await?;

                ctx.capture_status(response.status());
                let status = ctx.status().unwrap_or_else(|| response.status());
                let elapsed = ctx.started_at().elapsed();

                log_access(&request_id, ctx.caller_id(), &method, &path, status, elapsed);
                metrics::record_request(method.as_str(), status.as_u16(), elapsed);

                if let Some(value) = request_id.header_value() {
                    response.headers_mut().insert(X_REQUEST_ID, value);
                }
                Ok(response)
            }
            .instrument(span),
        )
    }
}

fn log_access(
    request_id: &RequestId,
    user_id: Option<&str>,
    method: &axum::http::Method,
    path: &str,
    status: StatusCode,
    elapsed: std::time::Duration,
) {
    let duration_ms = elapsed.as_millis() as u64;
    let user_id = user_id.unwrap_or("");
    if status.as_u16() >= 400 {
        tracing::info!(
            request_id = %request_id,
            user_id,
            method = %method,
            path,
            status_code = status.as_u16(),
            duration_ms,
            error = status.canonical_reason().unwrap_or("error"),
            "Request completed"
        );
    } else {
        tracing::info!(
            request_id = %request_id,
            user_id,
            method = %method,
            path,
            status_code = status.as_u16(),
            duration_ms,
            "Request completed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::get, Router};
    use tower::ServiceExt;

    #[test]
    fn test_extract_existing_request_id() {
        let req = Request::builder()
            .header("x-request-id", "existing-id-123")
            .body(Body::empty())
            .unwrap();
        assert_eq!(
            RequestId::from_request(&req).unwrap().as_str(),
            "existing-id-123"
        );
    }

    #[test]
    fn test_blank_request_id_is_ignored() {
        let req = Request::builder()
            .header("x-request-id", "  ")
            .body(Body::empty())
            .unwrap();
        assert!(RequestId::from_request(&req).is_none());
    }

    #[test]
    fn test_generated_ids_are_uuids() {
        let a = RequestId::generate();
        let b = RequestId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
        assert!(Uuid::parse_str(a.as_str()).is_ok());
    }

    #[test]
    fn test_status_captured_once() {
        let ctx = RequestContext::new();
        assert!(ctx.capture_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(!ctx.capture_status(StatusCode::OK));
        assert_eq!(ctx.status(), Some(StatusCode::TOO_MANY_REQUESTS));
    }

    fn app() -> Router {
        Router::new()
            .route(
                "/echo",
                get(|req: Request<Body>| async move { req.request_id().unwrap_or_default() }),
            )
            .layer(RequestIdLayer)
    }

    #[tokio::test]
    async fn test_generates_and_returns_id() {
        let res = app()
            .oneshot(Request::get("/echo").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let header = res.headers()[X_REQUEST_ID].to_str().unwrap().to_string();
        assert!(Uuid::parse_str(&header).is_ok());

        let body = axum::body::to_bytes(res.into_body(), 1024).await.unwrap();
        assert_eq!(body, header.as_bytes(), "inner stages see the same id");
    }

    #[tokio::test]
    async fn test_propagates_supplied_id() {
        let res = app()
            .oneshot(
                Request::get("/echo")
                    .header("x-request-id", "trace-me")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.headers()[X_REQUEST_ID], "trace-me");
    }

    #[tokio::test]
    async fn test_short_circuit_status_is_captured() {
        let ctx = Arc::new(RequestContext::new());
        let app = Router::new()
            .route(
                "/deny",
                get(|| async { (StatusCode::UNAUTHORIZED, "Unauthorized") }),
            )
            .layer(RequestIdLayer);

        let mut req = Request::get("/deny").body(Body::empty()).unwrap();
        req.extensions_mut().insert(ctx.clone());
        let res = app.oneshot(req).await.unwrap();

        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ctx.status(), Some(StatusCode::UNAUTHORIZED));
        assert!(ctx.correlation_id().is_some());
    }
}
