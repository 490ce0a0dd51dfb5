//! Health checking subsystem.
//!
//! # Data Flow
//! ```text
//! GET /health (handlers.rs):
//!     → always 200 while the process runs
//!
//! GET /ready (handlers.rs):
//!     → probe.rs probes every backend concurrently
//!     → healthy backend ⇒ its circuit breaker is forced closed
//!     → 200 if all healthy, else 503 with the per-service map
//! ```
//!
//! # Design Decisions
//! - Probes run on demand; there is no background health task
//! - A probe is healthy only on HTTP 200 within `timeouts.probe_secs`

pub mod handlers;
pub mod probe;

pub use probe::{ProbeStatus, ReadinessProbe, ReadinessReport};
