//! # Edge Gateway Library
//!
//! An edge gateway that fronts several gRPC backend services behind one
//! HTTP/WebSocket listener. Each inbound request is either
//! - transcoded from HTTP/JSON into a gRPC call (unary, or streamed back as
//!   JSON lines),
//! - upgraded to a WebSocket bound to a backend streaming call, or
//! - forwarded verbatim to a plain-HTTP backend.
//!
//! ## Module Layout
//! - `core`: error type, configuration and the request context
//! - `auth`: the `token` call metadata forwarded to backends
//! - `routing`: the immutable route table
//! - `protocols`: transcoding, the WebSocket proxy, passthrough and the gRPC client
//! - `gateway`: dispatcher and server
//! - `traffic`: drain and force-close control
//! - `observability`: logging and metrics

/// Error type, configuration and shared request types
pub mod core;

/// Call metadata extraction
pub mod auth;

/// Route table with parameterized path patterns
pub mod routing;

/// Backend-facing protocol handlers
pub mod protocols;

/// Dispatcher and listener
pub mod gateway;

/// Drain and force-close lifecycle
pub mod traffic;

/// Logging and metrics
pub mod observability;

pub use core::config::GatewayConfig;
pub use core::error::{GatewayError, GatewayResult};
pub use core::types::{BackendProtocol, HandlerKind, RequestContext};
pub use gateway::{Dispatcher, GatewayServer};
pub use routing::{Route, RouteTable, RouteTableBuilder};
pub use traffic::{DrainController, DrainOutcome};
