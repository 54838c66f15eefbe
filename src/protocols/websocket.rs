//! # WebSocket Stream Proxy
//!
//! Binds an upgraded client connection to one backend streaming call.
//!
//! ## Session Lifecycle
//! - `Connecting`: the backend is dialed before the upgrade is acknowledged;
//!   a failed dial is answered with 502 and no upgrade takes place
//! - `Open`: two pump tasks run side by side. Client messages (text or binary)
//!   are parsed as JSON and sent as request messages; backend replies are sent
//!   back as `{"result": ...}` text messages, one per reply
//! - `Closing`: entered as soon as either pump stops or the request is cancelled.
//!   The session token is cancelled so the other pump stops, the backend call is
//!   dropped, and a close frame is sent to the client
//! - `Closed`: every half has been released
//!
//! Half-close is not carried through: a client close ends the backend call.
//! Methods that take a single request read the first client message; the
//! session ignores any message after it and stays open while replies flow.

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::http::header::UPGRADE;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing::{debug, info, warn};

use crate::core::error::GatewayError;
use crate::core::types::RequestContext;
use crate::observability::metrics;
use crate::protocols::grpc::{CallContext, ReplyStream, RpcBackend, RpcMethod};
use crate::protocols::transcode::status_body;
use crate::protocols::wants_upgrade;
use crate::routing::Route;

/// Request messages buffered between the client pump and the backend call
const SESSION_BUFFER: usize = 32;

/// Control frames carry at most 125 bytes; two go to the close code
const MAX_CLOSE_REASON: usize = 123;

/// `Connection: upgrade` together with `Upgrade: websocket`
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    wants_upgrade(headers)
        && headers
            .get(UPGRADE)
            .and_then(|value| value.to_str().ok())
            .map_or(false, |value| value.trim().eq_ignore_ascii_case("websocket"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Open => write!(f, "open"),
            SessionState::Closing => write!(f, "closing"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

/// Why the client pump stopped
#[derive(Debug)]
enum ClientEnd {
    Closed,
    InvalidPayload(String),
    Failed(String),
    Cancelled,
}

/// Why the backend pump stopped
#[derive(Debug)]
enum BackendEnd {
    Finished,
    Failed(Status),
    ClientGone(String),
    Cancelled,
}

/// Dial the backend, then acknowledge the upgrade and hand the socket to a session
pub async fn handle_upgrade(route: Arc<Route>, ctx: RequestContext, upgrade: WebSocketUpgrade) -> Response {
    let (backend, method) = match (route.backend.rpc_client(), route.rpc.clone()) {
        (Some(backend), Some(method)) => (backend, method),
        _ => {
            return GatewayError::internal(format!("Route {} cannot open a stream session", route.pattern))
                .into_response()
        }
    };

    let dialed = tokio::select! {
        _ = ctx.cancel.cancelled() => Err(Status::cancelled("request cancelled")),
        dialed = backend.ready() => dialed,
    };
    if let Err(status) = dialed {
        warn!(
            request_id = %ctx.request_id,
            backend = %route.backend.name,
            error = status.message(),
            "Backend dial failed, refusing upgrade"
        );
        return GatewayError::upstream_dial(&route.backend.name, status.message()).into_response();
    }

    let session = ProxySession {
        backend_name: route.backend.name.clone(),
        backend,
        method,
        ctx,
        state: SessionState::Connecting,
    };
    upgrade
        .on_failed_upgrade(|e| debug!(error = %e, "WebSocket handshake failed"))
        .on_upgrade(move |socket| session.run(socket))
}

/// One upgraded client connection bound to one backend streaming call
pub struct ProxySession {
    backend_name: String,
    backend: Arc<dyn RpcBackend>,
    method: RpcMethod,
    ctx: RequestContext,
    state: SessionState,
}

impl ProxySession {
    fn transition(&mut self, next: SessionState) {
        debug!(
            session = %self.ctx.request_id,
            from = %self.state,
            to = %next,
            "Session state change"
        );
        self.state = next;
    }

    async fn run(mut self, socket: WebSocket) {
        let session = self.ctx.cancel.child_token();
        let (mut sink, source) = socket.split();
        let (requests, outbound) = mpsc::channel(SESSION_BUFFER);

        metrics::session_opened(&self.backend_name);
        info!(
            session = %self.ctx.request_id,
            backend = %self.backend_name,
            rpc = %self.method.qualified_name(),
            "Stream session opened"
        );

        // The client pump must run while the call opens; client-streaming calls only return at the end
        let client_pump = tokio::spawn(pump_client(source, requests, session.clone()));

        let call = CallContext::new(self.ctx.metadata.clone(), session.clone());
        let opened = tokio::select! {
            _ = session.cancelled() => Err(Status::cancelled("session closed before the call opened")),
            opened = self
                .backend
                .streaming(&self.method, ReceiverStream::new(outbound).boxed(), call) => opened,
        };

        let (sink, backend_end) = match opened {
            Ok(replies) => {
                self.transition(SessionState::Open);
                match tokio::spawn(pump_backend(sink, replies, session.clone())).await {
                    Ok(finished) => finished,
                    Err(e) => {
                        warn!(session = %self.ctx.request_id, error = %e, "Backend pump panicked");
                        session.cancel();
                        (None, BackendEnd::Cancelled)
                    }
                }
            }
            Err(status) => {
                if status.code() != tonic::Code::Cancelled {
                    let line = json!({ "error": status_body(&status) });
                    let _ = sink.send(Message::Text(line.to_string())).await;
                }
                session.cancel();
                (Some(sink), BackendEnd::Failed(status))
            }
        };

        let client_end = match client_pump.await {
            Ok(end) => end,
            Err(e) => ClientEnd::Failed(format!("client pump panicked: {}", e)),
        };

        self.transition(SessionState::Closing);
        let forced = self.ctx.cancel.is_cancelled();
        if let Some(reason) = abort_reason(&client_end, &backend_end) {
            let event = GatewayError::stream_abort(self.ctx.request_id.to_string(), reason);
            warn!(backend = %self.backend_name, "{}", event);
        }

        if let Some(mut sink) = sink {
            if let Some(frame) = close_frame(&client_end, &backend_end, forced) {
                let _ = sink.send(Message::Close(Some(frame))).await;
            }
            let _ = sink.close().await;
        }

        self.transition(SessionState::Closed);
        metrics::session_closed(&self.backend_name);
        info!(
            session = %self.ctx.request_id,
            backend = %self.backend_name,
            duration_ms = self.ctx.elapsed().as_millis() as u64,
            "Stream session closed"
        );
    }
}

/// Client to backend: each message is one JSON request
async fn pump_client(
    mut source: SplitStream<WebSocket>,
    requests: mpsc::Sender<Value>,
    session: CancellationToken,
) -> ClientEnd {
    // Cleared once the call stops taking input; later messages are read and dropped
    let mut requests = Some(requests);
    let end = loop {
        let message = tokio::select! {
            _ = session.cancelled() => break ClientEnd::Cancelled,
            message = source.next() => message,
        };

        let parsed = match message {
            None | Some(Ok(Message::Close(_))) => break ClientEnd::Closed,
            Some(Err(e)) => break ClientEnd::Failed(e.to_string()),
            Some(Ok(Message::Text(text))) => serde_json::from_str::<Value>(&text),
            Some(Ok(Message::Binary(data))) => serde_json::from_slice::<Value>(&data),
            Some(Ok(_)) => continue,
        };
        let value = match parsed {
            Ok(value) => value,
            Err(e) => break ClientEnd::InvalidPayload(format!("invalid JSON message: {}", e)),
        };

        let Some(sender) = requests.as_ref() else {
            continue;
        };
        let sent = tokio::select! {
            _ = session.cancelled() => break ClientEnd::Cancelled,
            sent = sender.send(value) => sent,
        };
        if sent.is_err() {
            debug!("Backend call takes no more messages; ignoring further client input");
            requests = None;
        }
    };

    session.cancel();
    end
}

/// Backend to client: each reply is one text message
async fn pump_backend(
    mut sink: SplitSink<WebSocket, Message>,
    mut replies: ReplyStream,
    session: CancellationToken,
) -> (Option<SplitSink<WebSocket, Message>>, BackendEnd) {
    let end = loop {
        let reply = tokio::select! {
            _ = session.cancelled() => break BackendEnd::Cancelled,
            reply = replies.next() => reply,
        };

        let (line, failure) = match reply {
            None => break BackendEnd::Finished,
            Some(Ok(value)) => (json!({ "result": value }), None),
            Some(Err(status)) => (json!({ "error": status_body(&status) }), Some(status)),
        };

        let sent = tokio::select! {
            _ = session.cancelled() => break BackendEnd::Cancelled,
            sent = sink.send(Message::Text(line.to_string())) => sent,
        };
        if let Err(e) = sent {
            break BackendEnd::ClientGone(e.to_string());
        }
        if let Some(status) = failure {
            break BackendEnd::Failed(status);
        }
    };

    session.cancel();
    drop(replies);
    (Some(sink), end)
}

/// Reason worth logging when a session did not end cleanly
fn abort_reason(client: &ClientEnd, backend: &BackendEnd) -> Option<String> {
    match (client, backend) {
        (_, BackendEnd::Failed(status)) if status.code() != tonic::Code::Cancelled => {
            Some(format!("backend error {:?}: {}", status.code(), status.message()))
        }
        (ClientEnd::Failed(reason), _) => Some(format!("client connection failed: {}", reason)),
        (_, BackendEnd::ClientGone(reason)) => Some(format!("client write failed: {}", reason)),
        _ => None,
    }
}

/// Close frame sent to the client, if the connection is still usable
fn close_frame(client: &ClientEnd, backend: &BackendEnd, forced: bool) -> Option<CloseFrame<'static>> {
    let (code, reason) = match (client, backend) {
        (ClientEnd::Failed(_), _) | (_, BackendEnd::ClientGone(_)) => return None,
        (ClientEnd::InvalidPayload(reason), _) => (close_code::INVALID, reason.clone()),
        (_, BackendEnd::Failed(status)) => (close_code::ERROR, status.message().to_string()),
        _ if forced => (close_code::AWAY, "gateway shutting down".to_string()),
        _ => (close_code::NORMAL, String::new()),
    };
    Some(CloseFrame {
        code,
        reason: Cow::Owned(truncate_reason(reason)),
    })
}

fn truncate_reason(mut reason: String) -> String {
    if reason.len() > MAX_CLOSE_REASON {
        let mut end = MAX_CLOSE_REASON;
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        reason.truncate(end);
    }
    reason
}
