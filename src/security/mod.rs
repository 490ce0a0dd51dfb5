//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request:
//!     → cors.rs (cross-origin policy, answers preflights)
//!     → rate_limit.rs (per-caller token buckets)
//!     → identity.rs (resolve caller id, forward it)
//!     → Pass to routing
//! Forwarding:
//!     → headers.rs (hop-by-hop, X-Forwarded-*, downstream CORS headers)
//! ```
//!
//! # Design Decisions
//! - Fail closed: a failed identity check never reaches a backend
//! - No trust in client input beyond the caller id header

pub mod cors;
pub mod headers;
pub mod identity;
pub mod rate_limit;

pub use cors::{cors_layer, origin_allowed};
pub use identity::{identity_middleware, AuthError, AuthExtractor, CallerId, HeaderAuthExtractor};
pub use rate_limit::{rate_limit_middleware, Admission, RateLimiter, TokenBucket};
