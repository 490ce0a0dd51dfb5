//! Cross-origin policy.
//!
//! Built on `tower_http::cors::CorsLayer`; the allowlist check is
//! [`origin_allowed`]. Preflights are answered by the layer and never reach
//! the stages behind it.

use std::time::Duration;

use axum::http::{header, HeaderName, HeaderValue, Method};
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::config::CorsConfig;
use crate::http::request::{X_REQUEST_ID, X_USER_ID};

const PREFLIGHT_MAX_AGE: Duration = Duration::from_secs(3600);

/// Whether `origin` matches the allowlist.
///
/// Entries match exactly, or as a `*.domain` suffix. An empty allowlist
/// admits any non-empty origin.
pub fn origin_allowed(origin: &str, allowlist: &[String]) -> bool {
    if origin.is_empty() {
        return false;
    }
    if allowlist.is_empty() {
        return true;
    }
    allowlist.iter().any(|allowed| {
        if origin == allowed {
            return true;
        }
        match allowed.strip_prefix('*') {
            Some(domain) if domain.starts_with('.') => origin.ends_with(domain),
            _ => false,
        }
    })
}

pub fn cors_layer(config: &CorsConfig) -> CorsLayer {
    let allowlist = config.allowed_origins.clone();

    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(
            move |origin: &HeaderValue, _parts: &axum::http::request::Parts| {
                origin
                    .to_str()
                    .map(|o| origin_allowed(o, &allowlist))
                    .unwrap_or(false)
            },
        ))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderName::from_static(X_REQUEST_ID),
            HeaderName::from_static(X_USER_ID),
        ])
        .allow_credentials(true)
        .max_age(PREFLIGHT_MAX_AGE)
}
