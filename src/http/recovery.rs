//! Outermost fault boundary.
//!
//! Any panic raised while building or polling the inner chain is caught here
//! and turned into a plain `500 Internal server error`. The panic message and
//! the request's correlation id go to the log only; the caller gets the fixed
//! body and the correlation id header.
//!
//! This layer also creates the [`RequestContext`] for the request, so the id
//! assigned by the correlation stage is visible here after an unwind. Requests
//! answered before that stage runs (CORS preflights) get their correlation id
//! and their access-log event here.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{header, HeaderValue, Request, Response, StatusCode};
use futures_util::FutureExt;
use tower::{Layer, Service};

use crate::http::request::{RequestContext, RequestId, X_REQUEST_ID};

#[derive(Debug, Clone, Copy, Default)]
pub struct PanicBoundaryLayer;

impl<S> Layer<S> for PanicBoundaryLayer {
    type Service = PanicBoundary<S>;

    fn layer(&self, inner: S) -> Self::Service {
        PanicBoundary { inner }
    }
}

#[derive(Debug, Clone)]
pub struct PanicBoundary<S> {
    inner: S,
}

impl<S> Service<Request<Body>> for PanicBoundary<S>
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
        let ctx = Arc::new(RequestContext::new());
        req.extensions_mut().insert(ctx.clone());
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let inbound_id = RequestId::from_request(&req).filter(|id| id.header_value().is_some());

        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let future = match std::panic::catch_unwind(AssertUnwindSafe(|| inner.call(req))) {
            Ok(future) => future,
            Err(panic) => {
                return Box::pin(async move { Ok(panic_response(&ctx, inbound_id, panic)) });
            }
        };

        Box::pin(async move {
            match AssertUnwindSafe(future).catch_unwind().await {
                Ok(Ok(mut response)) => {
                    if ctx.correlation_id().is_none() {
                        let request_id = assign_correlation_id(&ctx, inbound_id);
                        tracing::info!(
                            request_id = %request_id,
                            method = %method,
                            path = %path,
                            status_code = response.status().as_u16(),
                            duration_ms = ctx.started_at().elapsed().as_millis() as u64,
                            "Request completed before correlation"
                        );
                        if let Some(value) = request_id.header_value() {
                            response.headers_mut().insert(X_REQUEST_ID, value);
                        }
                    }
                    Ok(response)
                }
                Ok(Err(e)) => Err(e),
                Err(panic) => Ok(panic_response(&ctx, inbound_id, panic)),
            }
        })
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Correlation id for a request that never reached the correlation stage.
fn assign_correlation_id(ctx: &RequestContext, inbound: Option<RequestId>) -> RequestId {
    ctx.set_correlation_id(inbound.unwrap_or_else(RequestId::generate))
        .clone()
}

fn panic_response(
    ctx: &RequestContext,
    inbound_id: Option<RequestId>,
    panic: Box<dyn Any + Send>,
) -> Response<Body> {
    let request_id = match ctx.correlation_id() {
        Some(id) => id.clone(),
        None => assign_correlation_id(ctx, inbound_id),
    };

    tracing::error!(
        request_id = %request_id,
        panic = panic_message(panic.as_ref()),
        "Panic recovered while handling request"
    );
    ctx.capture_status(StatusCode::INTERNAL_SERVER_ERROR);

    let mut response = Response::new(Body::from("Internal server error"));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    if let Some(value) = request_id.header_value() {
        response.headers_mut().insert(X_REQUEST_ID, value);
    }
    response
}
