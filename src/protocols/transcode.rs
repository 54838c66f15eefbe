//! # HTTP/JSON Transcoding
//!
//! Turns an HTTP request into a backend rpc call and the reply back into HTTP.
//!
//! ## Request Mapping
//! - The body is parsed as JSON; an empty body is `{}`
//! - Path parameters are written into the request object (dotted names such as
//!   `{user.id}` address nested fields)
//! - For body-less requests, query parameters other than `token` fill fields that
//!   the path did not set
//! - A body that is not valid JSON is answered with 400 and never reaches the backend
//! - A streaming route may carry several JSON values only when the method
//!   streams requests; otherwise more than one value is a 400
//!
//! ## Response Mapping
//! - Unary replies are returned as a JSON object with status 200
//! - Streaming replies are written as JSON lines, `{"result": ...}` per message,
//!   and a backend error ends the stream with an `{"error": ...}` line
//! - Backend status codes map to HTTP as OK→200, InvalidArgument→400,
//!   NotFound→404, Unavailable/DeadlineExceeded→503 and everything else→500
//!
//! Dropping a streaming response (client disconnect) cancels the request token,
//! which aborts the backend call.

use axum::body::Body;
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, StreamExt};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::DropGuard;
use tonic::{Code, Status};
use tracing::{debug, warn};

use crate::auth::metadata::TOKEN_KEY;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::RequestContext;
use crate::observability::metrics;
use crate::protocols::grpc::{CallContext, ReplyStream, RpcBackend, RpcMethod};
use crate::routing::Route;

pub const JSON_LINES: &str = "application/x-ndjson";

/// HTTP status for a backend status code
pub fn http_status(code: Code) -> StatusCode {
    match code {
        Code::Ok => StatusCode::OK,
        Code::InvalidArgument => StatusCode::BAD_REQUEST,
        Code::NotFound => StatusCode::NOT_FOUND,
        Code::Unavailable | Code::DeadlineExceeded => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// grpc-gateway style error body
pub fn status_body(status: &Status) -> Value {
    json!({
        "code": status.code() as i32,
        "message": status.message(),
        "details": [],
    })
}

pub fn status_response(status: &Status) -> Response {
    (http_status(status.code()), Json(status_body(status))).into_response()
}

/// Transcoding settings shared by every route
#[derive(Debug, Clone)]
pub struct Transcoder {
    max_request_size: usize,
    upstream_timeout: Duration,
}

impl Transcoder {
    pub fn new(max_request_size: usize, upstream_timeout: Duration) -> Self {
        Self {
            max_request_size,
            upstream_timeout,
        }
    }

    /// Single request, single reply
    pub async fn handle_unary(&self, route: &Route, ctx: RequestContext, body: Body) -> Response {
        let (backend, method) = match rpc_target(route) {
            Ok(target) => target,
            Err(e) => return e.into_response(),
        };
        let bytes = match self.read_body(&ctx, body).await {
            Ok(bytes) => bytes,
            Err(e) => return e.into_response(),
        };
        let request = match unary_message(&ctx, &bytes) {
            Ok(request) => request,
            Err(e) => {
                debug!(request_id = %ctx.request_id, error = %e, "Rejected request body");
                return e.into_response();
            }
        };

        let started = Instant::now();
        let call = CallContext::for_request(&ctx).with_timeout(self.upstream_timeout);
        let result = backend.unary(&method, request, call).await;

        let code = result.as_ref().map(|_| Code::Ok).unwrap_or_else(|s| s.code());
        metrics::record_backend_call(&route.backend.name, &method.qualified_name(), code, started.elapsed());

        match result {
            Ok(reply) => (StatusCode::OK, Json(reply)).into_response(),
            Err(status) => {
                if http_status(status.code()).is_server_error() {
                    warn!(
                        request_id = %ctx.request_id,
                        rpc = %method.qualified_name(),
                        code = ?status.code(),
                        message = status.message(),
                        "Backend call failed"
                    );
                }
                status_response(&status)
            }
        }
    }

    /// Streaming call answered with chunked JSON lines
    pub async fn handle_server_stream(&self, route: &Route, ctx: RequestContext, body: Body) -> Response {
        let (backend, method) = match rpc_target(route) {
            Ok(target) => target,
            Err(e) => return e.into_response(),
        };
        let bytes = match self.read_body(&ctx, body).await {
            Ok(bytes) => bytes,
            Err(e) => return e.into_response(),
        };
        let requests = match stream_messages(&ctx, &bytes) {
            Ok(requests) => requests,
            Err(e) => return e.into_response(),
        };
        if !method.kind().is_client_streaming() && requests.len() > 1 {
            return GatewayError::bad_request(format!(
                "{} takes a single request message, got {}",
                method.qualified_name(),
                requests.len()
            ))
            .into_response();
        }

        let call = CallContext::for_request(&ctx);
        let replies = match backend
            .streaming(&method, stream::iter(requests).boxed(), call)
            .await
        {
            Ok(replies) => replies,
            Err(status) => {
                metrics::record_backend_call(
                    &route.backend.name,
                    &method.qualified_name(),
                    status.code(),
                    ctx.elapsed(),
                );
                return status_response(&status);
            }
        };

        debug!(request_id = %ctx.request_id, rpc = %method.qualified_name(), "Streaming replies as JSON lines");
        (
            StatusCode::OK,
            [(CONTENT_TYPE, JSON_LINES)],
            Body::from_stream(json_lines(replies, ctx)),
        )
            .into_response()
    }

    async fn read_body(&self, ctx: &RequestContext, body: Body) -> GatewayResult<Bytes> {
        let declared = ctx
            .headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok());
        if declared.map_or(false, |len| len > self.max_request_size) {
            return Err(GatewayError::PayloadTooLarge {
                limit: self.max_request_size,
            });
        }

        let mut chunks = body.into_data_stream();
        let mut buffer = BytesMut::new();
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk
                .map_err(|e| GatewayError::bad_request(format!("Failed to read request body: {}", e)))?;
            if buffer.len() + chunk.len() > self.max_request_size {
                return Err(GatewayError::PayloadTooLarge {
                    limit: self.max_request_size,
                });
            }
            buffer.extend_from_slice(&chunk);
        }
        Ok(buffer.freeze())
    }
}

fn rpc_target(route: &Route) -> GatewayResult<(Arc<dyn RpcBackend>, RpcMethod)> {
    let backend = route.backend.rpc_client().ok_or_else(|| {
        GatewayError::internal(format!(
            "Route {} targets non-rpc backend '{}'",
            route.pattern, route.backend.name
        ))
    })?;
    let method = route
        .rpc
        .clone()
        .ok_or_else(|| GatewayError::internal(format!("Route {} has no rpc method", route.pattern)))?;
    Ok((backend, method))
}

fn is_blank(body: &[u8]) -> bool {
    body.iter().all(u8::is_ascii_whitespace)
}

/// Request object for a unary call
fn unary_message(ctx: &RequestContext, body: &[u8]) -> GatewayResult<Value> {
    if is_blank(body) {
        return merge_params(Value::Object(Map::new()), &ctx.path_params, Some(&ctx.query));
    }
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| GatewayError::bad_request(format!("Malformed JSON body: {}", e)))?;
    merge_params(value, &ctx.path_params, None)
}

/// Request objects for a streaming call; the body may hold several JSON values
fn stream_messages(ctx: &RequestContext, body: &[u8]) -> GatewayResult<Vec<Value>> {
    if is_blank(body) {
        let message = merge_params(Value::Object(Map::new()), &ctx.path_params, Some(&ctx.query))?;
        return Ok(vec![message]);
    }
    serde_json::Deserializer::from_slice(body)
        .into_iter::<Value>()
        .map(|value| {
            let value =
                value.map_err(|e| GatewayError::bad_request(format!("Malformed JSON body: {}", e)))?;
            merge_params(value, &ctx.path_params, None)
        })
        .collect()
}

fn merge_params(
    value: Value,
    path_params: &HashMap<String, String>,
    query: Option<&HashMap<String, String>>,
) -> GatewayResult<Value> {
    let mut object = match value {
        Value::Object(object) => object,
        other if path_params.is_empty() => return Ok(other),
        _ => {
            return Err(GatewayError::bad_request(
                "Path parameters require the body to be a JSON object",
            ))
        }
    };

    for (name, value) in path_params {
        set_field(&mut object, name, value, true)?;
    }
    if let Some(query) = query {
        for (name, value) in query {
            if name != TOKEN_KEY {
                set_field(&mut object, name, value, false)?;
            }
        }
    }
    Ok(Value::Object(object))
}

/// Set a possibly dotted field; `overwrite` false leaves existing values alone
fn set_field(object: &mut Map<String, Value>, path: &str, value: &str, overwrite: bool) -> GatewayResult<()> {
    match path.split_once('.') {
        None => {
            if overwrite || !object.contains_key(path) {
                object.insert(path.to_string(), Value::String(value.to_string()));
            }
            Ok(())
        }
        Some((head, rest)) => {
            let child = object
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            match child {
                Value::Object(child) => set_field(child, rest, value, overwrite),
                _ => Err(GatewayError::bad_request(format!(
                    "Parameter '{}' conflicts with non-object field '{}'",
                    path, head
                ))),
            }
        }
    }
}

/// Keeps the request alive for as long as the response body is being written
struct LineState {
    replies: ReplyStream,
    finished: bool,
    _cancel_on_drop: DropGuard,
    _ctx: RequestContext,
}

fn json_lines(
    replies: ReplyStream,
    ctx: RequestContext,
) -> impl futures::Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
    let cancel = ctx.cancel.clone();
    let stop = async move { cancel.cancelled().await };
    let state = LineState {
        replies: replies.take_until(stop).boxed(),
        finished: false,
        _cancel_on_drop: ctx.cancel.clone().drop_guard(),
        _ctx: ctx,
    };

    stream::unfold(state, |mut state| async move {
        if state.finished {
            return None;
        }
        let line = match state.replies.next().await? {
            Ok(reply) => json!({ "result": reply }),
            Err(status) => {
                state.finished = true;
                json!({ "error": status_body(&status) })
            }
        };
        let mut bytes = line.to_string().into_bytes();
        bytes.push(b'\n');
        Some((Ok(Bytes::from(bytes)), state))
    })
}
