//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, middleware chain)
//!     → recovery.rs (panic boundary, request context)
//!     → request.rs (correlation id, access log)
//!     → [security stages, routing, proxy dispatcher]
//!     → response.rs (gateway error → status + fixed body)
//!     → Send to client
//! ```

pub mod recovery;
pub mod request;
pub mod response;
pub mod server;

pub use recovery::PanicBoundaryLayer;
pub use request::{RequestContext, RequestId, RequestIdExt, RequestIdLayer, X_REQUEST_ID, X_USER_ID};
pub use response::GatewayError;
pub use server::{build_router, AppState, HttpServer};
