//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming Request (/api/{service}/rest?query)
//!     → router.rs (service lookup, prefix strip)
//!     → Return: RouteMatch or RouteError
//!
//! Table construction (at startup):
//!     ServicesConfig
//!     → parse base URLs
//!     → Freeze as immutable ServiceRouter
//! ```
//!
//! # Design Decisions
//! - Built once at startup, immutable at runtime
//! - No regex in hot path (one prefix strip and a map lookup)

pub mod router;

pub use router::{Backend, RouteError, RouteMatch, ServiceRouter};
