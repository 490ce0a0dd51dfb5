//! API gateway library.
//!
//! One network-facing entry point that authenticates, throttles and forwards
//! `/api/{service}/**` to configured backends, isolating callers from backend
//! failure with a per-service circuit breaker.

pub mod admin;
pub mod config;
pub mod health;
pub mod http;
pub mod lifecycle;
pub mod observability;
pub mod proxy;
pub mod resilience;
pub mod routing;
pub mod security;

pub use config::schema::GatewayConfig;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
