//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use api_gateway::config::{GatewayConfig, ServiceConfig};
use api_gateway::{HttpServer, Shutdown};
use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Request, StatusCode},
    response::IntoResponse,
    Router,
};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// What the backend saw for one request.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub path_and_query: String,
    pub headers: HeaderMap,
}

#[derive(Debug)]
struct Behavior {
    status: StatusCode,
    health_status: StatusCode,
    delay: Duration,
}

#[derive(Debug)]
struct MockState {
    hits: AtomicUsize,
    last: Mutex<Option<Recorded>>,
    behavior: Mutex<Behavior>,
}

/// Programmable backend: answers every path except `/health` with the
/// configured status after the configured delay.
#[derive(Debug, Clone)]
pub struct MockBackend {
    pub addr: SocketAddr,
    state: Arc<MockState>,
}

impl MockBackend {
    pub async fn start() -> Self {
        let state = Arc::new(MockState {
            hits: AtomicUsize::new(0),
            last: Mutex::new(None),
            behavior: Mutex::new(Behavior {
                status: StatusCode::OK,
                health_status: StatusCode::OK,
                delay: Duration::ZERO,
            }),
        });

        let app = Router::new()
            .fallback(mock_handler)
            .with_state(state.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    pub fn set_status(&self, status: u16) {
        self.state.behavior.lock().unwrap().status = StatusCode::from_u16(status).unwrap();
    }

    pub fn set_health_status(&self, status: u16) {
        self.state.behavior.lock().unwrap().health_status = StatusCode::from_u16(status).unwrap();
    }

    pub fn set_delay(&self, delay: Duration) {
        self.state.behavior.lock().unwrap().delay = delay;
    }

    /// Non-health requests received so far.
    pub fn hits(&self) -> usize {
        self.state.hits.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<Recorded> {
        self.state.last.lock().unwrap().clone()
    }
}

async fn mock_handler(State(state): State<Arc<MockState>>, req: Request<Body>) -> impl IntoResponse {
    if req.uri().path() == "/health" {
        let status = state.behavior.lock().unwrap().health_status;
        return (status, [("access-control-allow-origin", "*")], "health".to_string());
    }

    state.hits.fetch_add(1, Ordering::SeqCst);
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_default();
    *state.last.lock().unwrap() = Some(Recorded {
        path_and_query: path_and_query.clone(),
        headers: req.headers().clone(),
    });

    let (status, delay) = {
        let b = state.behavior.lock().unwrap();
        (b.status, b.delay)
    };
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    (
        status,
        [("access-control-allow-origin", "*")],
        format!("backend saw {path_and_query}"),
    )
}

/// Raw TCP backend that sends headers and part of the body, then stalls.
pub async fn start_stalling_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let head = "HTTP/1.1 200 OK\r\nContent-Length: 1000\r\n\r\npartial";
                let _ = socket.write_all(head.as_bytes()).await;
                tokio::time::sleep(Duration::from_secs(30)).await;
            });
        }
    });
    addr
}

/// Config pointing the named services at the given addresses, with a
/// generous rate limit so only tests that want throttling see it.
pub fn config_for(services: &[(&str, SocketAddr)]) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.services.clear();
    for (name, addr) in services {
        config
            .services
            .push(ServiceConfig::new(*name, format!("http://{addr}")));
    }
    config.rate_limit.requests_per_minute = 60_000;
    config.rate_limit.burst = 1_000;
    config.timeouts.request_secs = 5;
    config.timeouts.probe_secs = 1;
    config
}

pub struct TestGateway {
    pub addr: SocketAddr,
    pub shutdown: Shutdown,
    pub handle: JoinHandle<Result<(), std::io::Error>>,
}

impl TestGateway {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

pub async fn start_gateway(config: GatewayConfig) -> TestGateway {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = HttpServer::new(config).unwrap();
    let shutdown = Shutdown::new();
    let rx = shutdown.subscribe();

    let handle = tokio::spawn(async move { server.run(listener, rx).await });
    TestGateway {
        addr,
        shutdown,
        handle,
    }
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .build()
        .unwrap()
}
