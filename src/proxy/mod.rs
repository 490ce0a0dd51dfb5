//! Proxy subsystem.
//!
//! # Data Flow
//! ```text
//! RouteMatch + inbound request
//!     → dispatcher.rs (rewrite, breaker, deadline, classify)
//!     → streamed backend response or GatewayError
//! ```

pub mod dispatcher;

pub use dispatcher::{build_client, DispatchError, Dispatcher, HttpClient};
