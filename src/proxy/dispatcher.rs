//! Forwarding of `/api/{service}` requests to backends.
//!
//! # Responsibilities
//! - Build the downstream request (URI rewrite, Host, forwarded headers)
//! - Run the exchange through the service's circuit breaker under the request deadline
//! - Classify the outcome: 5xx, transport errors and timeouts are failures, 4xx is not
//! - Stream the response back, keeping the deadline alive over the body
//!
//! # Design Decisions
//! - Building the request happens outside the breaker; a malformed request is not a backend failure
//! - A backend 5xx body is never forwarded, the caller gets a generic 502
//! - No retries

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderValue, Request, Response, StatusCode, Version};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use thiserror::Error;
use tokio::time::Instant;

use crate::config::TimeoutConfig;
use crate::http::request::RequestIdExt;
use crate::http::response::GatewayError;
use crate::observability::metrics::{self, UpstreamOutcome};
use crate::resilience::circuit_breaker::{BreakerError, CircuitBreakerRegistry};
use crate::resilience::timeouts::{BodyFailure, DeadlineBody};
use crate::routing::RouteMatch;
use crate::security::headers::{add_forwarded_headers, strip_cors_headers, strip_hop_by_hop};

pub type HttpClient = Client<HttpConnector, Body>;

/// Why a downstream call failed.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("downstream deadline exceeded")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(#[source] hyper_util::client::legacy::Error),

    #[error("downstream returned {0}")]
    UpstreamStatus(StatusCode),

    #[error("invalid downstream request: {0}")]
    InvalidRequest(#[from] axum::http::Error),
}

impl DispatchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, DispatchError::Timeout)
    }

    fn outcome(&self) -> UpstreamOutcome {
        match self {
            DispatchError::Timeout => UpstreamOutcome::Timeout,
            DispatchError::UpstreamStatus(_) => UpstreamOutcome::ServerError,
            DispatchError::Transport(_) | DispatchError::InvalidRequest(_) => {
                UpstreamOutcome::Transport
            }
        }
    }
}

/// Pooled HTTP/1.1 client for backends.
pub fn build_client(timeouts: &TimeoutConfig) -> HttpClient {
    let mut connector = HttpConnector::new();
    connector.set_connect_timeout(Some(timeouts.connect()));
    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(timeouts.idle())
        .build(connector)
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    client: HttpClient,
    breakers: Arc<CircuitBreakerRegistry>,
    request_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        client: HttpClient,
        breakers: Arc<CircuitBreakerRegistry>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            client,
            breakers,
            request_timeout,
        }
    }

    pub fn client(&self) -> &HttpClient {
        &self.client
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Forward `req` to the matched backend.
    pub async fn dispatch(
        &self,
        route: RouteMatch,
        req: Request<Body>,
    ) -> Result<Response<Body>, GatewayError> {
        let deadline = Instant::now() + self.request_timeout;
        let service = route.backend.name().to_string();
        let request_id = req.request_id().unwrap_or_default();

        let downstream = build_request(&route, req).map_err(|source| GatewayError::Upstream {
            service: service.clone(),
            source,
        })?;
        tracing::debug!(
            request_id = %request_id,
            service = %service,
            uri = %downstream.uri(),
            "Proxying request"
        );

        let breaker = self.breakers.get(&service);
        let client = self.client.clone();
        let result = breaker
            .call(|| async move {
                match tokio::time::timeout_at(deadline, client.request(downstream)).await {
                    Err(_) => Err(DispatchError::Timeout),
                    Ok(Err(e)) => Err(DispatchError::Transport(e)),
                    Ok(Ok(resp)) if resp.status().is_server_error() => {
                        Err(DispatchError::UpstreamStatus(resp.status()))
                    }
                    Ok(Ok(resp)) => Ok(resp),
                }
            })
            .await;

        let response = match result {
            Ok(response) => response,
            Err(BreakerError::Open) => {
                tracing::warn!(
                    request_id = %request_id,
                    service = %service,
                    "Circuit open, request rejected"
                );
                return Err(GatewayError::CircuitOpen(service));
            }
            Err(BreakerError::Inner(e)) => {
                tracing::warn!(
                    request_id = %request_id,
                    service = %service,
                    error = %e,
                    "Downstream call failed"
                );
                metrics::record_upstream(&service, e.outcome());
                return Err(GatewayError::Upstream { service, source: e });
            }
        };

        let outcome = if response.status().is_client_error() {
            UpstreamOutcome::ClientError
        } else {
            UpstreamOutcome::Success
        };
        metrics::record_upstream(&service, outcome);

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        strip_cors_headers(&mut parts.headers);

        let body = DeadlineBody::new(body, deadline, move |failure| {
            tracing::warn!(
                request_id = %request_id,
                service = %breaker.name(),
                timed_out = failure == BodyFailure::DeadlineExceeded,
                "Response body aborted mid-stream"
            );
            metrics::record_upstream(breaker.name(), UpstreamOutcome::BodyAborted);
            breaker.record_failure();
        });

        Ok(Response::from_parts(parts, Body::new(body)))
    }
}

fn build_request(route: &RouteMatch, req: Request<Body>) -> Result<Request<Body>, DispatchError> {
    let remote = req.remote_addr();
    let (mut parts, body) = req.into_parts();

    parts.uri = route
        .backend
        .target_uri(&route.forward_path)
        .map_err(axum::http::Error::from)?;
    parts.version = Version::HTTP_11;

    strip_hop_by_hop(&mut parts.headers);
    add_forwarded_headers(&mut parts.headers, remote);
    let host = HeaderValue::from_str(route.backend.authority()).map_err(axum::http::Error::from)?;
    parts.headers.insert(header::HOST, host);

    Ok(Request::from_parts(parts, body))
}
