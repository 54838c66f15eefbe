//! # Error Handling Module
//!
//! All failures the gateway can report, built on `thiserror`, with the mapping
//! from each failure onto the HTTP status the client sees.
//!
//! ## Error Categories
//! - Startup errors (`Configuration`, `RouteConflict`) abort the process before
//!   any connection is accepted
//! - Per-request errors (`BadRequest`, `NotFound`, `UpstreamUnavailable`, ...) are
//!   turned into a JSON response for that request only
//! - Session and lifecycle events (`StreamAbort`, `ShutdownTimeout`) are logged
//!   and reported, never escalated to other requests
//!
//! Backend RPC failures are not represented here: they carry their own gRPC status
//! and are translated by the transcoder so the backend's code and message survive.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Main result type used throughout the gateway
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Error taxonomy for the edge gateway
#[derive(Debug, Error, Clone)]
pub enum GatewayError {
    /// Invalid listen address, missing backend target, unreadable descriptors, ...
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Two routes registered for the same method and path shape
    #[error("Route conflict: {method} {pattern} collides with {existing}")]
    RouteConflict {
        method: String,
        pattern: String,
        existing: String,
    },

    /// Malformed JSON body, undecodable path parameter, ...
    #[error("Bad request: {reason}")]
    BadRequest { reason: String },

    /// Request body exceeded the configured limit
    #[error("Request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    /// No route matched the method and path
    #[error("No route for {method} {path}")]
    NotFound { method: String, path: String },

    /// Backend call could not be completed (reported as 503)
    #[error("Upstream '{backend}' unavailable: {reason}")]
    UpstreamUnavailable { backend: String, reason: String },

    /// Backend could not be dialed before an upgrade or passthrough (reported as 502)
    #[error("Upstream '{backend}' unreachable: {reason}")]
    UpstreamDial { backend: String, reason: String },

    /// One side of a proxied session disconnected or errored
    #[error("Stream aborted in session {session}: {reason}")]
    StreamAbort { session: String, reason: String },

    /// In-flight work outlived the drain deadline and was force-closed
    #[error("Drain deadline exceeded with {remaining} request(s) still in flight")]
    ShutdownTimeout { remaining: u64 },

    /// The gateway is draining and no longer accepts new requests
    #[error("Service unavailable: {reason}")]
    ServiceUnavailable { reason: String },

    /// Internal server errors for unexpected failures
    #[error("Internal server error: {message}")]
    Internal { message: String },

    /// I/O errors (file operations, sockets, etc.)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// JSON serialization/deserialization errors
    #[error("JSON error: {message}")]
    Json { message: String },

    /// YAML parsing errors for configuration files
    #[error("YAML error: {message}")]
    Yaml { message: String },
}

impl GatewayError {
    /// Create a configuration error with a custom message
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a bad request error
    pub fn bad_request<S: Into<String>>(reason: S) -> Self {
        Self::BadRequest {
            reason: reason.into(),
        }
    }

    pub fn not_found<M: Into<String>, P: Into<String>>(method: M, path: P) -> Self {
        Self::NotFound {
            method: method.into(),
            path: path.into(),
        }
    }

    pub fn upstream_unavailable<B: Into<String>, R: Into<String>>(backend: B, reason: R) -> Self {
        Self::UpstreamUnavailable {
            backend: backend.into(),
            reason: reason.into(),
        }
    }

    pub fn upstream_dial<B: Into<String>, R: Into<String>>(backend: B, reason: R) -> Self {
        Self::UpstreamDial {
            backend: backend.into(),
            reason: reason.into(),
        }
    }

    pub fn stream_abort<S: Into<String>, R: Into<String>>(session: S, reason: R) -> Self {
        Self::StreamAbort {
            session: session.into(),
            reason: reason.into(),
        }
    }

    /// Rejection returned for requests that arrive after draining began
    pub fn draining() -> Self {
        Self::ServiceUnavailable {
            reason: "gateway is draining".to_string(),
        }
    }

    /// Create an internal error with a custom message
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the appropriate HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Configuration { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::RouteConflict { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::UpstreamUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamDial { .. } => StatusCode::BAD_GATEWAY,
            Self::StreamAbort { .. } => StatusCode::BAD_GATEWAY,
            Self::ShutdownTimeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Json { .. } => StatusCode::BAD_REQUEST,
            Self::Yaml { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get a string representation of the error type for API responses
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration_error",
            Self::RouteConflict { .. } => "route_conflict",
            Self::BadRequest { .. } => "bad_request",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::NotFound { .. } => "not_found",
            Self::UpstreamUnavailable { .. } => "upstream_unavailable",
            Self::UpstreamDial { .. } => "upstream_unreachable",
            Self::StreamAbort { .. } => "stream_abort",
            Self::ShutdownTimeout { .. } => "shutdown_timeout",
            Self::ServiceUnavailable { .. } => "service_unavailable",
            Self::Internal { .. } => "internal_error",
            Self::Io { .. } => "io_error",
            Self::Json { .. } => "json_error",
            Self::Yaml { .. } => "yaml_error",
        }
    }

    /// Startup errors stop the process; everything else is scoped to one request.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Configuration { .. } | Self::RouteConflict { .. }
        )
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json {
            message: err.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for GatewayError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Yaml {
            message: err.to_string(),
        }
    }
}

/// Converts errors into the gateway's JSON error envelope
impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let error_response = json!({
            "error": {
                "code": status.as_u16(),
                "message": self.to_string(),
                "type": self.error_type(),
            }
        });

        (status, Json(error_response)).into_response()
    }
}
