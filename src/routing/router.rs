//! Service lookup for `/api/{service}/**`.
//!
//! # Responsibilities
//! - Hold the immutable name → backend table
//! - Split an inbound path into the service name and the forwarded path
//! - Build downstream URIs (proxied requests and readiness probes)
//!
//! # Design Decisions
//! - Immutable after construction (thread-safe without locks)
//! - O(1) lookup via HashMap
//! - The service name is a whole path segment; `/api/agentx` is not `agent`
//! - Explicit errors rather than a silent default backend

use std::collections::HashMap;
use std::sync::Arc;

use axum::http::Uri;
use thiserror::Error;
use url::{Position, Url};

use crate::config::{ServiceConfig, ServicesConfig};

const API_PREFIX: &str = "/api/";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("path is not under {API_PREFIX}")]
    NotApi,
    #[error("unknown service '{0}'")]
    UnknownService(String),
    #[error("invalid url '{url}' for service '{name}'")]
    InvalidUrl { name: String, url: String },
}

/// A configured downstream service.
#[derive(Debug)]
pub struct Backend {
    name: String,
    /// Scheme, authority and base path, without a trailing slash.
    base: String,
    authority: String,
    health_uri: Uri,
}

impl Backend {
    pub fn from_config(service: &ServiceConfig) -> Result<Self, RouteError> {
        let invalid = || RouteError::InvalidUrl {
            name: service.name.clone(),
            url: service.url.clone(),
        };

        let url = Url::parse(&service.url).map_err(|_| invalid())?;
        if url.host_str().is_none() {
            return Err(invalid());
        }
        let authority = url[Position::BeforeHost..Position::AfterPort].to_string();
        let base = url[..Position::AfterPath].trim_end_matches('/').to_string();
        let health_uri = format!("{base}{}", service.health_path)
            .parse()
            .map_err(|_| invalid())?;

        Ok(Self {
            name: service.name.clone(),
            base,
            authority,
            health_uri,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `host[:port]`, used for the downstream Host header.
    pub fn authority(&self) -> &str {
        &self.authority
    }

    pub fn health_uri(&self) -> &Uri {
        &self.health_uri
    }

    /// Downstream URI for a forwarded path (which always starts with `/`).
    pub fn target_uri(&self, forward_path: &str) -> Result<Uri, axum::http::uri::InvalidUri> {
        format!("{}{}", self.base, forward_path).parse()
    }
}

/// Result of resolving an inbound `/api/...` request.
#[derive(Debug, Clone)]
pub struct RouteMatch {
    pub backend: Arc<Backend>,
    /// Path with the `/api/{service}` prefix removed, query string preserved.
    pub forward_path: String,
}

/// Immutable service table.
#[derive(Debug, Default)]
pub struct ServiceRouter {
    backends: HashMap<String, Arc<Backend>>,
    order: Vec<String>,
}

impl ServiceRouter {
    pub fn from_config(services: &ServicesConfig) -> Result<Self, RouteError> {
        let mut router = Self::default();
        for service in services.iter() {
            let backend = Backend::from_config(service)?;
            router.order.push(service.name.clone());
            router.backends.insert(service.name.clone(), Arc::new(backend));
        }
        Ok(router)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Backend>> {
        self.backends.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.backends.contains_key(name)
    }

    /// Backends in configuration order.
    pub fn backends(&self) -> impl Iterator<Item = &Arc<Backend>> {
        self.order.iter().filter_map(|name| self.backends.get(name))
    }

    pub fn service_names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn resolve(&self, uri: &Uri) -> Result<RouteMatch, RouteError> {
        let (service, rest) = split_api_path(uri.path()).ok_or(RouteError::NotApi)?;
        let backend = self
            .backends
            .get(service)
            .ok_or_else(|| RouteError::UnknownService(service.to_string()))?;

        let mut forward_path = if rest.is_empty() {
            "/".to_string()
        } else {
            rest.to_string()
        };
        if let Some(query) = uri.query() {
            forward_path.push('?');
            forward_path.push_str(query);
        }

        Ok(RouteMatch {
            backend: backend.clone(),
            forward_path,
        })
    }
}

/// `/api/agent/chat` → `("agent", "/chat")`, `/api/agent` → `("agent", "")`.
fn split_api_path(path: &str) -> Option<(&str, &str)> {
    let tail = path.strip_prefix(API_PREFIX)?;
    Some(match tail.find('/') {
        Some(idx) => (&tail[..idx], &tail[idx..]),
        None => (tail, ""),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> ServiceRouter {
        let mut services = ServicesConfig::default();
        services.push(ServiceConfig::new("prefixed", "http://10.0.0.5:9000/v1/"));
        ServiceRouter::from_config(&services).unwrap()
    }

    #[test]
    fn test_strips_service_prefix() {
        let m = router().resolve(&"/api/agent/chat".parse().unwrap()).unwrap();
        assert_eq!(m.backend.name(), "agent");
        assert_eq!(m.forward_path, "/chat");
        assert_eq!(
            m.backend.target_uri(&m.forward_path).unwrap(),
            "http://localhost:8001/chat"
        );
    }

    #[test]
    fn test_bare_service_path_becomes_root() {
        let m = router().resolve(&"/api/rag".parse().unwrap()).unwrap();
        assert_eq!(m.forward_path, "/");
    }

    #[test]
    fn test_query_is_preserved() {
        let m = router()
            .resolve(&"/api/llm/complete?model=x&n=2".parse().unwrap())
            .unwrap();
        assert_eq!(m.forward_path, "/complete?model=x&n=2");
    }

    #[test]
    fn test_base_path_is_joined() {
        let m = router()
            .resolve(&"/api/prefixed/items".parse().unwrap())
            .unwrap();
        assert_eq!(
            m.backend.target_uri(&m.forward_path).unwrap(),
            "http://10.0.0.5:9000/v1/items"
        );
        assert_eq!(m.backend.authority(), "10.0.0.5:9000");
        assert_eq!(m.backend.health_uri(), "http://10.0.0.5:9000/v1/health");
    }

    #[test]
    fn test_unknown_service() {
        assert_eq!(
            router().resolve(&"/api/agentx/chat".parse().unwrap()).unwrap_err(),
            RouteError::UnknownService("agentx".into())
        );
        assert_eq!(
            router().resolve(&"/health".parse().unwrap()).unwrap_err(),
            RouteError::NotApi
        );
    }

    #[test]
    fn test_configuration_order_is_kept() {
        let names: Vec<_> = router().service_names().map(str::to_string).collect();
        assert_eq!(names, ["agent", "rag", "llm", "prefixed"]);
    }
}
