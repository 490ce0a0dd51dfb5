//! Per-caller token bucket admission control.
//!
//! Buckets live in a [`DashMap`] keyed by caller id (or remote address before
//! identity is known). Lookup is a read on one shard; first access goes through
//! `entry().or_insert_with`, so concurrent first requests for an unseen key
//! create exactly one bucket. Each bucket has its own mutex, which keeps
//! unrelated keys from contending once their bucket exists.
//!
//! Buckets are never evicted. A caller population with high key cardinality
//! grows the map for the lifetime of the process.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use std::net::SocketAddr;

use crate::config::RateLimitConfig;
use crate::http::request::RequestContext;
use crate::http::response::GatewayError;
use crate::observability::metrics;

/// Result of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// Denied; a token becomes available after `retry_after` (whole seconds, at least 1).
    Denied { retry_after: Duration },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed)
    }
}

/// A token bucket for one admission key.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a full bucket. `refill_rate` is tokens per second.
    pub fn new(capacity: f64, refill_rate: f64, now: Instant) -> Self {
        Self {
            capacity,
            refill_rate,
            tokens: capacity,
            last_refill: now,
        }
    }

    /// Refill for the time elapsed since the last call, then try to spend one token.
    pub fn try_acquire_at(&mut self, now: Instant) -> Admission {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Admission::Allowed;
        }

        let wait_secs = ((1.0 - self.tokens) / self.refill_rate).ceil().max(1.0);
        Admission::Denied {
            retry_after: Duration::from_secs(wait_secs as u64),
        }
    }

    /// Tokens currently available (as of the last refill).
    pub fn tokens(&self) -> f64 {
        self.tokens
    }
}

/// Registry of token buckets, one per admission key.
#[derive(Debug)]
pub struct RateLimiter {
    buckets: DashMap<String, Arc<Mutex<TokenBucket>>>,
    capacity: f64,
    refill_rate: f64,
}

impl RateLimiter {
    /// Create a limiter with the given burst capacity and refill rate (tokens per second).
    pub fn new(capacity: u32, refill_rate: f64) -> Self {
        Self {
            buckets: DashMap::new(),
            capacity: f64::from(capacity),
            refill_rate,
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.burst, config.refill_per_second())
    }

    /// Admission check for `key` at the current instant.
    pub fn allow(&self, key: &str) -> Admission {
        self.allow_at(key, Instant::now())
    }

    /// Admission check for `key` at `now`.
    pub fn allow_at(&self, key: &str, now: Instant) -> Admission {
        let bucket = self.bucket(key, now);
        let mut bucket = bucket.lock().unwrap_or_else(PoisonError::into_inner);
        bucket.try_acquire_at(now)
    }

    /// Number of distinct keys seen so far.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    fn bucket(&self, key: &str, now: Instant) -> Arc<Mutex<TokenBucket>> {
        if let Some(existing) = self.buckets.get(key) {
            return existing.clone();
        }
        self.buckets
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(TokenBucket::new(
                    self.capacity,
                    self.refill_rate,
                    now,
                )))
            })
            .clone()
    }
}

/// Paths that are never throttled.
pub fn is_exempt(path: &str) -> bool {
    path == "/health" || path == "/ready"
}

/// Admission key: the caller id when one has already been established,
/// otherwise the remote IP.
fn admission_key(request: &Request<Body>) -> String {
    if let Some(caller) = request
        .extensions()
        .get::<Arc<RequestContext>>()
        .and_then(|ctx| ctx.caller_id())
    {
        return caller.to_string();
    }
    match request.extensions().get::<ConnectInfo<SocketAddr>>() {
        Some(ConnectInfo(addr)) => addr.ip().to_string(),
        None => "unknown".to_string(),
    }
}

/// Middleware function for per-caller admission control.
pub async fn rate_limit_middleware(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if is_exempt(request.uri().path()) {
        return next.run(request).await;
    }

    let key = admission_key(&request);
    match limiter.allow(&key) {
        Admission::Allowed => next.run(request).await,
        Admission::Denied { retry_after } => {
            tracing::warn!(
                client = %key,
                retry_after_secs = retry_after.as_secs(),
                "Rate limit exceeded"
            );
            metrics::record_rate_limited();
            GatewayError::RateLimited { retry_after }.into_response()
        }
    }
}
