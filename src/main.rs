//! API gateway
//!
//! ```text
//!   Client ──▶ panic boundary ──▶ cors ──▶ request id + access log ──▶ rate limit ──▶ identity
//!                                                                                      │
//!              /health  /ready  /gateway/circuit-breaker/*  ◀──────────────────────────┤
//!                                                                                      ▼
//!   Client ◀── deadline-bounded body ◀── circuit breaker ◀── dispatcher ◀── /api/{service}/**
//!                                              │
//!                                              ▼
//!                                           Backend
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;

use api_gateway::config::load_or_default;
use api_gateway::lifecycle::{spawn_signal_listener, Shutdown};
use api_gateway::observability::{init_metrics, init_tracing};
use api_gateway::HttpServer;

#[derive(Parser)]
#[command(name = "api-gateway", version, about = "API gateway with rate limiting and circuit breaking")]
struct Args {
    /// Path to a TOML configuration file; defaults are used when omitted.
    #[arg(short, long, env = "GATEWAY_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_or_default(args.config.as_deref())?;

    init_tracing(&config.observability)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "api-gateway starting");
    tracing::info!(
        bind_address = %config.listener.bind_address,
        services = config.services.len(),
        request_timeout_secs = config.timeouts.request_secs,
        rate_limit_per_minute = config.rate_limit.requests_per_minute,
        rate_limit_burst = config.rate_limit.burst,
        breaker_max_failures = config.circuit_breaker.max_failures,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse::<SocketAddr>() {
            Ok(addr) => {
                if let Err(e) = init_metrics(addr) {
                    tracing::error!(error = %e, "Failed to start metrics exporter, continuing without metrics");
                }
            }
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    let shutdown = Shutdown::new();
    spawn_signal_listener(shutdown.clone());

    let server = HttpServer::new(config)?;
    server.run(listener, shutdown.subscribe()).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
