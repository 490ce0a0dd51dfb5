//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define gateway metrics (requests, latency, admission, breakers, backends)
//! - Expose a Prometheus-compatible scrape endpoint when enabled
//!
//! # Metrics
//! - `gateway_requests_total` (counter): requests by method, status
//! - `gateway_request_duration_seconds` (histogram): latency distribution
//! - `gateway_rate_limited_total` (counter): admission denials
//! - `gateway_upstream_requests_total` (counter): downstream outcomes by service
//! - `gateway_circuit_rejected_total` (counter): fast-failed calls by service
//! - `gateway_circuit_state` (gauge): 0=closed, 1=half-open, 2=open
//! - `gateway_backend_health` (gauge): 1=healthy, 0=unhealthy
//!
//! # Design Decisions
//! - Recording is a no-op until an exporter is installed
//! - Labels are low-cardinality: method, status, service, outcome

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::resilience::circuit_breaker::CircuitState;

pub mod names {
    pub const REQUESTS_TOTAL: &str = "gateway_requests_total";
    pub const REQUEST_DURATION_SECONDS: &str = "gateway_request_duration_seconds";
    pub const RATE_LIMITED_TOTAL: &str = "gateway_rate_limited_total";
    pub const UPSTREAM_REQUESTS_TOTAL: &str = "gateway_upstream_requests_total";
    pub const CIRCUIT_REJECTED_TOTAL: &str = "gateway_circuit_rejected_total";
    pub const CIRCUIT_STATE: &str = "gateway_circuit_state";
    pub const BACKEND_HEALTH: &str = "gateway_backend_health";
}

/// Outcome label for `gateway_upstream_requests_total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamOutcome {
    Success,
    ClientError,
    ServerError,
    Timeout,
    Transport,
    BodyAborted,
}

impl UpstreamOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            UpstreamOutcome::Success => "success",
            UpstreamOutcome::ClientError => "client_error",
            UpstreamOutcome::ServerError => "server_error",
            UpstreamOutcome::Timeout => "timeout",
            UpstreamOutcome::Transport => "transport",
            UpstreamOutcome::BodyAborted => "body_aborted",
        }
    }
}

/// Install the Prometheus exporter with an HTTP listener on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    describe_counter!(names::REQUESTS_TOTAL, "Total requests handled by the gateway");
    describe_histogram!(
        names::REQUEST_DURATION_SECONDS,
        "End-to-end request duration in seconds"
    );
    describe_counter!(names::RATE_LIMITED_TOTAL, "Requests denied by admission control");
    describe_counter!(
        names::UPSTREAM_REQUESTS_TOTAL,
        "Downstream calls by service and outcome"
    );
    describe_counter!(
        names::CIRCUIT_REJECTED_TOTAL,
        "Calls fast-failed by an open circuit"
    );
    describe_gauge!(
        names::CIRCUIT_STATE,
        "Circuit breaker state (0 = closed, 1 = half-open, 2 = open)"
    );
    describe_gauge!(
        names::BACKEND_HEALTH,
        "Last readiness probe result (1 = healthy, 0 = unhealthy)"
    );

    tracing::info!(address = %addr, "Prometheus metrics endpoint started");
    Ok(())
}

pub fn record_request(method: &str, status: u16, elapsed: Duration) {
    counter!(
        names::REQUESTS_TOTAL,
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!(names::REQUEST_DURATION_SECONDS, "method" => method.to_string())
        .record(elapsed.as_secs_f64());
}

pub fn record_rate_limited() {
    counter!(names::RATE_LIMITED_TOTAL).increment(1);
}

pub fn record_upstream(service: &str, outcome: UpstreamOutcome) {
    counter!(
        names::UPSTREAM_REQUESTS_TOTAL,
        "service" => service.to_string(),
        "outcome" => outcome.as_str()
    )
    .increment(1);
}

pub fn record_circuit_rejected(service: &str) {
    counter!(names::CIRCUIT_REJECTED_TOTAL, "service" => service.to_string()).increment(1);
}

pub fn record_circuit_state(service: &str, state: CircuitState) {
    let value = match state {
        CircuitState::Closed => 0.0,
        CircuitState::HalfOpen => 1.0,
        CircuitState::Open => 2.0,
    };
    gauge!(names::CIRCUIT_STATE, "service" => service.to_string()).set(value);
}

pub fn record_backend_health(service: &str, healthy: bool) {
    gauge!(names::BACKEND_HEALTH, "service" => service.to_string())
        .set(if healthy { 1.0 } else { 0.0 });
}
