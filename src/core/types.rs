//! # Core Types Module
//!
//! Data structures shared by the dispatcher and the protocol handlers.
//!
//! - `HandlerKind` and `BackendProtocol` classify routes and backends
//! - `RequestContext` carries everything a handler needs about one request,
//!   including the cancellation token that ties it to the client connection

use axum::http::{HeaderMap, Method};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::auth::metadata::CallMetadata;
use crate::traffic::shutdown::RequestGuard;

/// How a matched route is served
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerKind {
    /// JSON body in, one JSON reply out
    TranscodeUnary,
    /// JSON-lines over chunked HTTP, or a WebSocket session on upgrade
    TranscodeStream,
    /// Forwarded verbatim to a plain-HTTP backend
    Passthrough,
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerKind::TranscodeUnary => write!(f, "transcode_unary"),
            HandlerKind::TranscodeStream => write!(f, "transcode_stream"),
            HandlerKind::Passthrough => write!(f, "passthrough"),
        }
    }
}

/// Wire protocol spoken by a backend target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendProtocol {
    /// gRPC backend serving unary methods only
    UnaryRpc,
    /// gRPC backend that may serve streaming methods
    StreamingRpc,
    /// Ordinary HTTP backend, reached through passthrough only
    PlainHttp,
}

impl BackendProtocol {
    pub fn is_rpc(&self) -> bool {
        !matches!(self, BackendProtocol::PlainHttp)
    }

    /// Whether routes of the given kind may target this protocol
    pub fn serves(&self, handler: HandlerKind) -> bool {
        match (self, handler) {
            (BackendProtocol::PlainHttp, HandlerKind::Passthrough) => true,
            (BackendProtocol::UnaryRpc, HandlerKind::TranscodeUnary) => true,
            (BackendProtocol::StreamingRpc, HandlerKind::TranscodeUnary) => true,
            (BackendProtocol::StreamingRpc, HandlerKind::TranscodeStream) => true,
            _ => false,
        }
    }
}

impl fmt::Display for BackendProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendProtocol::UnaryRpc => write!(f, "unary_rpc"),
            BackendProtocol::StreamingRpc => write!(f, "streaming_rpc"),
            BackendProtocol::PlainHttp => write!(f, "plain_http"),
        }
    }
}

/// Per-request state owned by the task handling the request
///
/// Dropping the context releases its drain slot. Streaming handlers move the
/// context into the response body or the proxy session so the slot lives as
/// long as the work does.
#[derive(Debug)]
pub struct RequestContext {
    /// Unique identifier for this request (for tracing and logging)
    pub request_id: Uuid,

    pub method: Method,

    pub path: String,

    /// Raw request headers
    pub headers: HeaderMap,

    /// Query parameters, first occurrence wins
    pub query: HashMap<String, String>,

    /// Percent-decoded values captured by `{name}` segments
    pub path_params: HashMap<String, String>,

    /// Metadata forwarded to the backend call
    pub metadata: CallMetadata,

    /// Client's remote address, when the listener recorded it
    pub remote_addr: Option<SocketAddr>,

    /// Cancelled when the client goes away or the gateway force-closes
    pub cancel: CancellationToken,

    /// When the request was received
    pub received_at: Instant,

    inflight: Option<RequestGuard>,
}

impl RequestContext {
    pub fn new(method: Method, path: impl Into<String>, headers: HeaderMap) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            method,
            path: path.into(),
            headers,
            query: HashMap::new(),
            path_params: HashMap::new(),
            metadata: CallMetadata::default(),
            remote_addr: None,
            cancel: CancellationToken::new(),
            received_at: Instant::now(),
            inflight: None,
        }
    }

    pub fn with_query(mut self, query: HashMap<String, String>) -> Self {
        self.query = query;
        self
    }

    pub fn with_path_params(mut self, params: HashMap<String, String>) -> Self {
        self.path_params = params;
        self
    }

    pub fn with_metadata(mut self, metadata: CallMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_remote_addr(mut self, addr: Option<SocketAddr>) -> Self {
        self.remote_addr = addr;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Attach the drain slot acquired by the dispatcher
    pub fn with_inflight(mut self, guard: RequestGuard) -> Self {
        self.inflight = Some(guard);
        self
    }

    pub fn token(&self) -> &str {
        self.metadata.token()
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.received_at.elapsed()
    }
}

/// Parse a raw query string, keeping the first value of repeated keys
pub fn parse_query(raw: Option<&str>) -> HashMap<String, String> {
    let mut params = HashMap::new();
    if let Some(raw) = raw {
        for (key, value) in url::form_urlencoded::parse(raw.as_bytes()) {
            params.entry(key.into_owned()).or_insert_with(|| value.into_owned());
        }
    }
    params
}
