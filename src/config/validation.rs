//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check service names are usable as routing segments and unique
//! - Validate value ranges (timeouts > 0, thresholds > 0)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GatewayConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;
use thiserror::Error;
use url::Url;

use crate::config::schema::GatewayConfig;

/// A single semantic problem found in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("listener.bind_address '{0}' is not a socket address")]
    BindAddress(String),
    #[error("at least one service must be configured")]
    NoServices,
    #[error("service name '{0}' must be non-empty and contain only [A-Za-z0-9_-]")]
    ServiceName(String),
    #[error("service '{0}' is configured more than once")]
    DuplicateService(String),
    #[error("service '{name}' has invalid url '{url}': {reason}")]
    ServiceUrl {
        name: String,
        url: String,
        reason: String,
    },
    #[error("service '{0}' health_path must start with '/'")]
    HealthPath(String),
    #[error("{0} must be greater than zero")]
    NotPositive(&'static str),
}

/// Validate a configuration, collecting every problem.
pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::BindAddress(
            config.listener.bind_address.clone(),
        ));
    }

    if config.services.is_empty() {
        errors.push(ValidationError::NoServices);
    }

    let mut seen = HashSet::new();
    for service in config.services.iter() {
        if !is_valid_service_name(&service.name) {
            errors.push(ValidationError::ServiceName(service.name.clone()));
        }
        if !seen.insert(service.name.as_str()) {
            errors.push(ValidationError::DuplicateService(service.name.clone()));
        }
        if let Err(reason) = check_service_url(&service.url) {
            errors.push(ValidationError::ServiceUrl {
                name: service.name.clone(),
                url: service.url.clone(),
                reason,
            });
        }
        if !service.health_path.starts_with('/') {
            errors.push(ValidationError::HealthPath(service.name.clone()));
        }
    }

    let positives: [(&'static str, u64); 7] = [
        (
            "rate_limit.requests_per_minute",
            u64::from(config.rate_limit.requests_per_minute),
        ),
        ("rate_limit.burst", u64::from(config.rate_limit.burst)),
        (
            "circuit_breaker.max_failures",
            u64::from(config.circuit_breaker.max_failures),
        ),
        (
            "circuit_breaker.open_timeout_secs",
            config.circuit_breaker.open_timeout_secs,
        ),
        ("timeouts.request_secs", config.timeouts.request_secs),
        ("timeouts.connect_secs", config.timeouts.connect_secs),
        ("timeouts.probe_secs", config.timeouts.probe_secs),
    ];
    for (field, value) in positives {
        if value == 0 {
            errors.push(ValidationError::NotPositive(field));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn is_valid_service_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn check_service_url(raw: &str) -> Result<(), String> {
    let url = Url::parse(raw).map_err(|e| e.to_string())?;
    if url.scheme() != "http" {
        return Err(format!("unsupported scheme '{}'", url.scheme()));
    }
    if url.host_str().is_none() {
        return Err("missing host".to_string());
    }
    if url.query().is_some() || url.fragment().is_some() {
        return Err("query and fragment are not allowed".to_string());
    }
    Ok(())
}
