//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Request to backend:
//!     → circuit_breaker.rs (fast-fail while open, count failures)
//!     → request deadline (connect + headers, enforced by the dispatcher)
//!     → timeouts.rs (same deadline over the streamed body)
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every downstream call has a deadline
//! - No retries: a failed call is reported, not replayed
//! - Circuit breaker prevents cascading failures

pub mod circuit_breaker;
pub mod timeouts;

pub use circuit_breaker::{BreakerError, CircuitBreaker, CircuitBreakerRegistry, CircuitState};
pub use timeouts::{BodyFailure, DeadlineBody};
