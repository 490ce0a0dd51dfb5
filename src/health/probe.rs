//! Backend readiness probing.
//!
//! # Responsibilities
//! - Probe every configured backend's health endpoint concurrently
//! - Aggregate the results for `/ready`
//! - Force the breaker of every backend that answered back to closed

use std::collections::BTreeMap;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use futures_util::future::join_all;
use serde::Serialize;
use tokio::time;

use crate::observability::metrics;
use crate::proxy::HttpClient;
use crate::resilience::circuit_breaker::CircuitBreakerRegistry;
use crate::routing::{Backend, ServiceRouter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Default)]
pub struct ReadinessReport {
    pub services: BTreeMap<String, ProbeStatus>,
}

impl ReadinessReport {
    pub fn is_ready(&self) -> bool {
        self.services.values().all(|s| *s == ProbeStatus::Healthy)
    }
}

#[derive(Debug, Clone)]
pub struct ReadinessProbe {
    client: HttpClient,
    timeout: Duration,
}

impl ReadinessProbe {
    pub fn new(client: HttpClient, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// Healthy only on a `200` within the probe timeout.
    pub async fn probe(&self, backend: &Backend) -> bool {
        let request = match Request::get(backend.health_uri().clone())
            .header(header::USER_AGENT, "api-gateway-readiness")
            .body(Body::empty())
        {
            Ok(req) => req,
            Err(e) => {
                tracing::error!(service = %backend.name(), error = %e, "Failed to build readiness probe");
                return false;
            }
        };

        match time::timeout(self.timeout, self.client.request(request)).await {
            Ok(Ok(response)) => {
                let healthy = response.status() == StatusCode::OK;
                if !healthy {
                    tracing::warn!(
                        service = %backend.name(),
                        status = %response.status(),
                        "Readiness probe failed: unexpected status"
                    );
                }
                healthy
            }
            Ok(Err(e)) => {
                tracing::warn!(service = %backend.name(), error = %e, "Readiness probe failed: connection error");
                false
            }
            Err(_) => {
                tracing::warn!(service = %backend.name(), "Readiness probe failed: timeout");
                false
            }
        }
    }

    pub async fn check_all(
        &self,
        routes: &ServiceRouter,
        breakers: &CircuitBreakerRegistry,
    ) -> ReadinessReport {
        let checks = routes.backends().map(|backend| async move {
            (backend.name().to_string(), self.probe(backend).await)
        });

        let mut report = ReadinessReport::default();
        for (name, healthy) in join_all(checks).await {
            if healthy {
                breakers.reset(&name);
            }
            metrics::record_backend_health(&name, healthy);
            let status = if healthy {
                ProbeStatus::Healthy
            } else {
                ProbeStatus::Unhealthy
            };
            report.services.insert(name, status);
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ServiceConfig, ServicesConfig, TimeoutConfig};
    use crate::proxy::build_client;
    use crate::resilience::CircuitState;
    use axum::{routing::get, Router};
    use std::net::SocketAddr;

    async fn spawn(status: StatusCode) -> SocketAddr {
        let app = Router::new().route("/health", get(move || async move { status }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn probe() -> ReadinessProbe {
        ReadinessProbe::new(
            build_client(&TimeoutConfig::default()),
            Duration::from_millis(500),
        )
    }

    #[tokio::test]
    async fn test_report_and_breaker_reset() {
        let up = spawn(StatusCode::OK).await;
        let degraded = spawn(StatusCode::NO_CONTENT).await;

        let mut services = ServicesConfig::default();
        services.clear();
        services.push(ServiceConfig::new("up", format!("http://{up}")));
        services.push(ServiceConfig::new("degraded", format!("http://{degraded}")));
        let routes = ServiceRouter::from_config(&services).unwrap();

        let breakers = CircuitBreakerRegistry::new(1, Duration::from_secs(30));
        breakers.get("up").record_failure();
        breakers.get("degraded").record_failure();
        assert_eq!(breakers.state("up"), CircuitState::Open);

        let report = probe().check_all(&routes, &breakers).await;

        assert!(!report.is_ready());
        assert_eq!(report.services["up"], ProbeStatus::Healthy);
        assert_eq!(report.services["degraded"], ProbeStatus::Unhealthy);
        assert_eq!(breakers.state("up"), CircuitState::Closed);
        assert_eq!(breakers.state("degraded"), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_unhealthy() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let backend = Backend::from_config(&ServiceConfig::new("gone", format!("http://{addr}")))
            .unwrap();
        assert!(!probe().probe(&backend).await);
    }
}
