//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create the Axum Router with all handlers
//! - Wire up the middleware chain in its fixed order
//! - Bind server to listener and drain on shutdown
//! - Dispatch `/api/{service}/**` to the proxy dispatcher
//!
//! # Middleware Order (outermost first)
//! ```text
//! PanicBoundaryLayer → CorsLayer → RequestIdLayer → rate_limit → identity → handler
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{Request, Response, StatusCode},
    middleware,
    response::IntoResponse,
    routing::{any, get},
    Router,
};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::admin::admin_router;
use crate::config::GatewayConfig;
use crate::health::handlers::{health, ready};
use crate::health::ReadinessProbe;
use crate::http::recovery::PanicBoundaryLayer;
use crate::http::request::RequestIdLayer;
use crate::http::response::GatewayError;
use crate::proxy::{build_client, Dispatcher};
use crate::resilience::circuit_breaker::CircuitBreakerRegistry;
use crate::routing::{RouteError, ServiceRouter};
use crate::security::cors::cors_layer;
use crate::security::identity::{identity_middleware, AuthExtractor, HeaderAuthExtractor};
use crate::security::rate_limit::{rate_limit_middleware, RateLimiter};

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub routes: Arc<ServiceRouter>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub limiter: Arc<RateLimiter>,
    pub dispatcher: Dispatcher,
    pub probe: Arc<ReadinessProbe>,
    pub auth: Arc<dyn AuthExtractor>,
}

impl AppState {
    pub fn new(config: GatewayConfig, auth: Arc<dyn AuthExtractor>) -> Result<Self, RouteError> {
        let routes = Arc::new(ServiceRouter::from_config(&config.services)?);
        let breakers = Arc::new(CircuitBreakerRegistry::from_config(&config.circuit_breaker));
        let limiter = Arc::new(RateLimiter::from_config(&config.rate_limit));

        let client = build_client(&config.timeouts);
        let dispatcher = Dispatcher::new(client.clone(), breakers.clone(), config.timeouts.request());
        let probe = Arc::new(ReadinessProbe::new(client, config.timeouts.probe()));

        Ok(Self {
            config: Arc::new(config),
            routes,
            breakers,
            limiter,
            dispatcher,
            probe,
            auth,
        })
    }
}

/// HTTP server for the gateway.
pub struct HttpServer {
    router: Router,
    state: AppState,
}

impl HttpServer {
    /// Create a server that trusts `X-User-ID` as the caller identity.
    pub fn new(config: GatewayConfig) -> Result<Self, RouteError> {
        Self::with_auth(config, Arc::new(HeaderAuthExtractor))
    }

    pub fn with_auth(
        config: GatewayConfig,
        auth: Arc<dyn AuthExtractor>,
    ) -> Result<Self, RouteError> {
        let state = AppState::new(config, auth)?;
        let router = build_router(state.clone());
        Ok(Self { router, state })
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Run the server until `shutdown` fires, then drain in-flight requests.
    pub async fn run(
        self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        let services: Vec<&str> = self.state.routes.service_names().collect();
        tracing::info!(
            address = %addr,
            services = ?services,
            rate_limit = self.state.config.rate_limit.enabled,
            "HTTP server starting"
        );

        let app = self
            .router
            .into_make_service_with_connect_info::<SocketAddr>();

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                tracing::info!("Shutdown signal received, draining connections");
            })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// Build the Axum router with all middleware layers.
pub fn build_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .merge(admin_router())
        .route("/api/{*rest}", any(proxy_handler))
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(
            state.auth.clone(),
            identity_middleware,
        ));

    if state.config.rate_limit.enabled {
        router = router.layer(middleware::from_fn_with_state(
            state.limiter.clone(),
            rate_limit_middleware,
        ));
    }

    router
        .layer(RequestIdLayer)
        .layer(cors_layer(&state.config.cors))
        .layer(PanicBoundaryLayer)
        .with_state(state)
}

async fn proxy_handler(
    State(state): State<AppState>,
    request: Request<Body>,
) -> Result<Response<Body>, GatewayError> {
    let route = state.routes.resolve(request.uri()).map_err(|e| match e {
        RouteError::UnknownService(name) => GatewayError::UnknownService(name),
        _ => GatewayError::UnknownService(request.uri().path().to_string()),
    })?;
    state.dispatcher.dispatch(route, request).await
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "Not found")
}
