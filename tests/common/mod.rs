//! Shared fixtures for the integration tests: a scriptable `RpcBackend` and
//! helpers to assemble a gateway around it.

#![allow(dead_code)]

use async_trait::async_trait;
use axum::http::Method;
use futures::stream::{self, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::Status;

use edge_gateway::core::config::ServerConfig;
use edge_gateway::core::types::{BackendProtocol, HandlerKind};
use edge_gateway::protocols::grpc::{CallContext, CallKind, ReplyStream, RequestStream, RpcBackend, RpcMethod};
use edge_gateway::protocols::BackendTarget;
use edge_gateway::{DrainOutcome, GatewayResult, GatewayServer, Route, RouteTableBuilder};

/// Backend double for the `echo.v1.Echo` service
///
/// - `Say` echoes `message`; the messages `missing`, `down` and `boom` fail
///   with NotFound, Unavailable and Internal
/// - `Watch` replies `repeatCount` times
/// - `Chat` echoes every request message
/// - `Tick` takes one request, stops reading input, and replies every 50ms
/// - `Hang` replies once and then waits until the call is cancelled
#[derive(Default)]
pub struct MockBackend {
    pub calls: AtomicUsize,
    pub tokens: Mutex<Vec<String>>,
    pub cancelled: Arc<AtomicBool>,
    pub unreachable: bool,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn unreachable() -> Arc<Self> {
        Arc::new(Self {
            unreachable: true,
            ..Self::default()
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_token(&self) -> Option<String> {
        self.tokens.lock().unwrap().last().cloned()
    }

    pub fn was_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Poll until the backend has seen its call cancelled
    pub async fn wait_cancelled(&self, within: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + within;
        while tokio::time::Instant::now() < deadline {
            if self.was_cancelled() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.was_cancelled()
    }

    fn record(&self, ctx: &CallContext) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.tokens.lock().unwrap().push(ctx.metadata.token().to_string());

        let cancelled = self.cancelled.clone();
        let token = ctx.cancel.clone();
        tokio::spawn(async move {
            token.cancelled().await;
            cancelled.store(true, Ordering::SeqCst);
        });
    }
}

fn echo(request: &Value, sequence: i64) -> Value {
    json!({
        "message": request.get("message").cloned().unwrap_or(Value::String(String::new())),
        "sequence": sequence,
    })
}

fn repeat_count(request: &Value) -> i64 {
    match request.get("repeatCount") {
        Some(Value::Number(n)) => n.as_i64().unwrap_or(1),
        Some(Value::String(s)) => s.parse().unwrap_or(1),
        _ => 1,
    }
}

#[async_trait]
impl RpcBackend for MockBackend {
    async fn ready(&self) -> Result<(), Status> {
        if self.unreachable {
            Err(Status::unavailable("connection refused"))
        } else {
            Ok(())
        }
    }

    async fn unary(&self, method: &RpcMethod, request: Value, ctx: CallContext) -> Result<Value, Status> {
        self.ready().await?;
        self.record(&ctx);
        match (method.name(), request.get("message").and_then(Value::as_str)) {
            ("Say", Some("missing")) => Err(Status::not_found("no such message")),
            ("Say", Some("down")) => Err(Status::unavailable("backend down")),
            ("Say", Some("boom")) => Err(Status::internal("backend exploded")),
            ("Say", _) => Ok(echo(&request, 1)),
            (other, _) => Err(Status::unimplemented(format!("unary {}", other))),
        }
    }

    async fn streaming(
        &self,
        method: &RpcMethod,
        requests: RequestStream,
        ctx: CallContext,
    ) -> Result<ReplyStream, Status> {
        self.ready().await?;
        self.record(&ctx);
        match method.name() {
            "Watch" => {
                let mut requests = requests;
                let request = requests.next().await.unwrap_or_else(|| json!({}));
                let count = repeat_count(&request);
                Ok(stream::iter((1..=count).map(move |n| Ok(echo(&request, n)))).boxed())
            }
            "Tick" => {
                let mut requests = requests;
                let request = requests.next().await.unwrap_or_else(|| json!({}));
                drop(requests);
                let ticks = stream::unfold(1i64, move |n| {
                    let reply = echo(&request, n);
                    async move {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Some((Ok(reply), n + 1))
                    }
                });
                Ok(ticks.boxed())
            }
            "Chat" => Ok(requests
                .enumerate()
                .map(|(i, request)| Ok(echo(&request, i as i64 + 1)))
                .boxed()),
            "Hang" => {
                let first = stream::once(async { Ok(json!({"message": "started", "sequence": 1})) });
                Ok(first.chain(stream::pending()).boxed())
            }
            other => Err(Status::unimplemented(format!("streaming {}", other))),
        }
    }
}

pub fn echo_target(backend: Arc<MockBackend>) -> Arc<BackendTarget> {
    Arc::new(BackendTarget::rpc(
        "echo",
        "mock://echo",
        BackendProtocol::StreamingRpc,
        backend,
    ))
}

pub fn echo_method(name: &str) -> RpcMethod {
    let kind = match name {
        "Say" => CallKind::Unary,
        "Watch" | "Tick" => CallKind::ServerStreaming,
        _ => CallKind::Bidirectional,
    };
    RpcMethod::new("echo.v1.Echo", name, kind)
}

/// Routes onto every mock method
pub fn echo_routes(backend: Arc<MockBackend>) -> Vec<Route> {
    let target = echo_target(backend);
    vec![
        Route::transcode(Method::POST, "/echo/say", HandlerKind::TranscodeUnary, target.clone(), echo_method("Say")),
        Route::transcode(
            Method::GET,
            "/echo/say/{message}",
            HandlerKind::TranscodeUnary,
            target.clone(),
            echo_method("Say"),
        ),
        Route::transcode(Method::GET, "/echo/watch", HandlerKind::TranscodeStream, target.clone(), echo_method("Watch")),
        Route::transcode(Method::GET, "/echo/tick", HandlerKind::TranscodeStream, target.clone(), echo_method("Tick")),
        Route::transcode(Method::GET, "/echo/chat", HandlerKind::TranscodeStream, target.clone(), echo_method("Chat")),
        Route::transcode(Method::GET, "/echo/hang", HandlerKind::TranscodeStream, target, echo_method("Hang")),
    ]
}

pub fn server_config() -> ServerConfig {
    ServerConfig {
        bind_address: "127.0.0.1".to_string(),
        http_port: 5000,
        max_request_size: 64 * 1024,
        drain_timeout: Duration::from_secs(2),
        upstream_timeout: Duration::from_secs(5),
        connect_timeout: Duration::from_millis(500),
    }
}

pub fn gateway(routes: Vec<Route>, config: &ServerConfig) -> GatewayServer {
    let mut builder = RouteTableBuilder::new();
    for route in routes {
        builder.register(route).unwrap();
    }
    GatewayServer::new(builder.build(), config)
}

/// A gateway serving on a loopback port
pub struct RunningGateway {
    pub addr: SocketAddr,
    pub shutdown: CancellationToken,
    pub handle: JoinHandle<GatewayResult<DrainOutcome>>,
}

pub async fn spawn_gateway(server: GatewayServer) -> RunningGateway {
    let listener = GatewayServer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(server.serve(listener, shutdown.clone()));
    RunningGateway { addr, shutdown, handle }
}
