//! # gRPC Backend Client
//!
//! Backend calls made on behalf of transcoded requests.
//!
//! - `RpcBackend` is the seam between the transcoding layer and the transport;
//!   requests and replies cross it as JSON values
//! - `GrpcBackend` implements it over a lazily connected tonic `Channel`, using
//!   descriptors from `DescriptorCatalog` and the dynamic codec
//! - Every call honours the cancellation token in its `CallContext`: when the
//!   token fires the in-flight call is dropped, which resets the HTTP/2 stream
//!   and aborts it on the backend
//!
//! There are no retries; a failed dial or call is reported as is.

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::{Future, StreamExt};
use prost_reflect::{DescriptorPool, MethodDescriptor};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::metadata::AsciiMetadataValue;
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Status};
use tracing::{debug, warn};
use url::Url;

use crate::auth::metadata::CallMetadata;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{HandlerKind, RequestContext};
use crate::protocols::codec::{json_to_message, message_to_json, DynamicCodec};

/// Messages sent to a streaming call
pub type RequestStream = BoxStream<'static, Value>;

/// Replies from a streaming call; an `Err` item ends the stream
pub type ReplyStream = BoxStream<'static, Result<Value, Status>>;

/// Shape of an rpc method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Unary,
    ServerStreaming,
    ClientStreaming,
    Bidirectional,
}

impl CallKind {
    pub fn from_flags(client_streaming: bool, server_streaming: bool) -> Self {
        match (client_streaming, server_streaming) {
            (false, false) => CallKind::Unary,
            (false, true) => CallKind::ServerStreaming,
            (true, false) => CallKind::ClientStreaming,
            (true, true) => CallKind::Bidirectional,
        }
    }

    pub fn is_streaming(&self) -> bool {
        !matches!(self, CallKind::Unary)
    }

    /// Whether the call takes more than one request message
    pub fn is_client_streaming(&self) -> bool {
        matches!(self, CallKind::ClientStreaming | CallKind::Bidirectional)
    }
}

/// A backend rpc method, resolved at startup
#[derive(Debug, Clone)]
pub struct RpcMethod {
    service: String,
    name: String,
    kind: CallKind,
    descriptor: Option<MethodDescriptor>,
}

impl RpcMethod {
    /// Method known only by name; backends that need the schema will refuse it
    pub fn new(service: impl Into<String>, name: impl Into<String>, kind: CallKind) -> Self {
        Self {
            service: service.into(),
            name: name.into(),
            kind,
            descriptor: None,
        }
    }

    pub fn from_descriptor(descriptor: MethodDescriptor) -> Self {
        Self {
            service: descriptor.parent_service().full_name().to_string(),
            name: descriptor.name().to_string(),
            kind: CallKind::from_flags(
                descriptor.is_client_streaming(),
                descriptor.is_server_streaming(),
            ),
            descriptor: Some(descriptor),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> CallKind {
        self.kind
    }

    pub fn descriptor(&self) -> Option<&MethodDescriptor> {
        self.descriptor.as_ref()
    }

    /// `package.Service/Method`
    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.service, self.name)
    }

    /// HTTP/2 path the call is sent to
    pub fn path(&self) -> String {
        format!("/{}/{}", self.service, self.name)
    }

    /// Handler used when a route does not name one
    pub fn default_handler(&self) -> HandlerKind {
        if self.kind.is_streaming() {
            HandlerKind::TranscodeStream
        } else {
            HandlerKind::TranscodeUnary
        }
    }
}

/// Per-call context handed to a backend
#[derive(Debug, Clone)]
pub struct CallContext {
    pub metadata: CallMetadata,

    /// Aborts the call when cancelled
    pub cancel: CancellationToken,

    /// Deadline sent along with the call
    pub timeout: Option<Duration>,
}

impl CallContext {
    pub fn new(metadata: CallMetadata, cancel: CancellationToken) -> Self {
        Self {
            metadata,
            cancel,
            timeout: None,
        }
    }

    pub fn for_request(ctx: &RequestContext) -> Self {
        Self::new(ctx.metadata.clone(), ctx.cancel.clone())
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A backend reachable over its native rpc transport
#[async_trait]
pub trait RpcBackend: Send + Sync {
    /// Dial the backend without issuing a call
    async fn ready(&self) -> Result<(), Status>;

    async fn unary(&self, method: &RpcMethod, request: Value, ctx: CallContext) -> Result<Value, Status>;

    /// Open a streaming call; `requests` ends when the caller half-closes
    async fn streaming(
        &self,
        method: &RpcMethod,
        requests: RequestStream,
        ctx: CallContext,
    ) -> Result<ReplyStream, Status>;
}

/// Protobuf descriptors for every backend service the gateway knows about
#[derive(Debug, Clone, Default)]
pub struct DescriptorCatalog {
    pool: DescriptorPool,
}

impl DescriptorCatalog {
    /// Load compiled `FileDescriptorSet`s (`protoc --include_imports --descriptor_set_out`)
    pub async fn load(paths: &[PathBuf]) -> GatewayResult<Self> {
        let mut pool = DescriptorPool::new();
        for path in paths {
            let bytes = tokio::fs::read(path).await.map_err(|e| {
                GatewayError::config(format!(
                    "Failed to read descriptor set {}: {}",
                    path.display(),
                    e
                ))
            })?;
            pool.decode_file_descriptor_set(bytes.as_slice()).map_err(|e| {
                GatewayError::config(format!(
                    "Invalid descriptor set {}: {}",
                    path.display(),
                    e
                ))
            })?;
            debug!(path = %path.display(), "Loaded descriptor set");
        }
        Ok(Self { pool })
    }

    pub fn from_pool(pool: DescriptorPool) -> Self {
        Self { pool }
    }

    /// Resolve `package.Service/Method` to a method with its schema
    pub fn resolve(&self, rpc: &str) -> GatewayResult<RpcMethod> {
        let (service_name, method_name) = rpc.split_once('/').ok_or_else(|| {
            GatewayError::config(format!("rpc '{}' must look like package.Service/Method", rpc))
        })?;

        let service = self
            .pool
            .get_service_by_name(service_name)
            .ok_or_else(|| GatewayError::config(format!("Unknown rpc service '{}'", service_name)))?;

        let method = service
            .methods()
            .find(|m| m.name() == method_name)
            .ok_or_else(|| {
                GatewayError::config(format!(
                    "Service '{}' has no method '{}'",
                    service_name, method_name
                ))
            })?;

        Ok(RpcMethod::from_descriptor(method))
    }

    pub fn service_names(&self) -> Vec<String> {
        self.pool
            .services()
            .map(|service| service.full_name().to_string())
            .collect()
    }
}

/// gRPC backend reached through a shared, lazily connected channel
pub struct GrpcBackend {
    name: String,
    dial_target: (String, u16),
    channel: Channel,
    connect_timeout: Duration,
}

impl GrpcBackend {
    /// Build the client; no connection is made until the first call or `ready`
    pub fn new(name: impl Into<String>, base_url: &str, connect_timeout: Duration) -> GatewayResult<Self> {
        let name = name.into();
        let url = Url::parse(base_url).map_err(|e| {
            GatewayError::config(format!("Backend '{}' has invalid address '{}': {}", name, base_url, e))
        })?;
        let host = url
            .host_str()
            .ok_or_else(|| GatewayError::config(format!("Backend '{}' address has no host", name)))?
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| GatewayError::config(format!("Backend '{}' address has no port", name)))?;

        let channel = Endpoint::from_shared(base_url.to_string())
            .map_err(|e| GatewayError::config(format!("Backend '{}' endpoint: {}", name, e)))?
            .connect_timeout(connect_timeout)
            .connect_lazy();

        Ok(Self {
            name,
            dial_target: (host, port),
            channel,
            connect_timeout,
        })
    }

    fn request<T>(&self, message: T, ctx: &CallContext) -> tonic::Request<T> {
        let mut request = tonic::Request::new(message);
        for (key, value) in ctx.metadata.pairs() {
            match value.parse::<AsciiMetadataValue>() {
                Ok(value) => {
                    request.metadata_mut().insert(key, value);
                }
                Err(_) => warn!(backend = %self.name, key, "Dropping metadata value that is not valid ASCII"),
            }
        }
        if let Some(timeout) = ctx.timeout {
            request.set_timeout(timeout);
        }
        request
    }

    async fn client(&self) -> Result<tonic::client::Grpc<Channel>, Status> {
        let mut client = tonic::client::Grpc::new(self.channel.clone());
        client
            .ready()
            .await
            .map_err(|e| Status::unavailable(format!("backend '{}' not ready: {}", self.name, e)))?;
        Ok(client)
    }

    fn schema<'a>(&self, method: &'a RpcMethod) -> Result<(&'a MethodDescriptor, PathAndQuery), Status> {
        let descriptor = method.descriptor().ok_or_else(|| {
            Status::unimplemented(format!("no schema loaded for {}", method.qualified_name()))
        })?;
        let path = method
            .path()
            .parse::<PathAndQuery>()
            .map_err(|e| Status::internal(format!("invalid rpc path {}: {}", method.path(), e)))?;
        Ok((descriptor, path))
    }
}

/// Race a call against its cancellation token
async fn cancellable<T>(
    cancel: &CancellationToken,
    call: impl Future<Output = Result<T, Status>>,
) -> Result<T, Status> {
    tokio::select! {
        _ = cancel.cancelled() => Err(Status::cancelled("call cancelled by gateway")),
        result = call => result.map_err(transport_failure),
    }
}

/// Connection failures surface from tonic as `Unknown`; report them as `Unavailable`
fn transport_failure(status: Status) -> Status {
    let from_transport = status.code() == Code::Unknown
        && std::error::Error::source(&status)
            .map_or(false, |source| source.is::<tonic::transport::Error>());
    if from_transport {
        Status::unavailable(format!("backend unreachable: {}", status.message()))
    } else {
        status
    }
}

#[async_trait]
impl RpcBackend for GrpcBackend {
    async fn ready(&self) -> Result<(), Status> {
        let (host, port) = &self.dial_target;
        let dial = tokio::net::TcpStream::connect((host.as_str(), *port));
        match tokio::time::timeout(self.connect_timeout, dial).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(Status::unavailable(format!(
                "backend '{}' unreachable at {}:{}: {}",
                self.name, host, port, e
            ))),
            Err(_) => Err(Status::unavailable(format!(
                "backend '{}' did not accept a connection within {:?}",
                self.name, self.connect_timeout
            ))),
        }
    }

    async fn unary(&self, method: &RpcMethod, request: Value, ctx: CallContext) -> Result<Value, Status> {
        let (descriptor, path) = self.schema(method)?;
        let message = json_to_message(&descriptor.input(), request)?;

        let mut client = cancellable(&ctx.cancel, self.client()).await?;
        let request = self.request(message, &ctx);
        let codec = DynamicCodec::new(descriptor.output());

        let response = cancellable(&ctx.cancel, client.unary(request, path, codec)).await?;
        message_to_json(response.get_ref())
    }

    async fn streaming(
        &self,
        method: &RpcMethod,
        requests: RequestStream,
        ctx: CallContext,
    ) -> Result<ReplyStream, Status> {
        let (descriptor, path) = self.schema(method)?;
        let input = descriptor.input();
        let codec = DynamicCodec::new(descriptor.output());
        let mut client = cancellable(&ctx.cancel, self.client()).await?;

        let replies: BoxStream<'static, Result<prost_reflect::DynamicMessage, Status>> =
            match method.kind() {
                CallKind::Unary | CallKind::ServerStreaming => {
                    let mut requests = requests;
                    let first = tokio::select! {
                        _ = ctx.cancel.cancelled() => return Err(Status::cancelled("call cancelled by gateway")),
                        first = requests.next() => first.unwrap_or_else(|| Value::Object(Default::default())),
                    };
                    let message = json_to_message(&input, first)?;
                    let request = self.request(message, &ctx);
                    if method.kind() == CallKind::Unary {
                        let reply =
                            cancellable(&ctx.cancel, client.unary(request, path, codec)).await?;
                        stream::once(async move { Ok(reply.into_inner()) }).boxed()
                    } else {
                        let response = cancellable(
                            &ctx.cancel,
                            client.server_streaming(request, path, codec),
                        )
                        .await?;
                        response.into_inner().boxed()
                    }
                }
                CallKind::ClientStreaming | CallKind::Bidirectional => {
                    let rejected = Arc::new(OnceLock::new());
                    let outbound = outbound_messages(requests, input, rejected.clone());
                    let request = self.request(outbound, &ctx);

                    let replies = if method.kind() == CallKind::ClientStreaming {
                        let reply = cancellable(
                            &ctx.cancel,
                            client.client_streaming(request, path, codec),
                        )
                        .await?;
                        stream::once(async move { Ok(reply.into_inner()) }).boxed()
                    } else {
                        let response =
                            cancellable(&ctx.cancel, client.streaming(request, path, codec)).await?;
                        response.into_inner().boxed()
                    };

                    // A rejected request message half-closes the call; report it once replies end
                    let tail = stream::once(async move { rejected.get().cloned() })
                        .filter_map(futures::future::ready)
                        .map(Err);
                    replies.chain(tail).boxed()
                }
            };

        let cancel = ctx.cancel.clone();
        let stop = async move { cancel.cancelled().await };
        Ok(replies
            .map(|reply| {
                reply
                    .map_err(transport_failure)
                    .and_then(|message| message_to_json(&message))
            })
            .take_until(stop)
            .boxed())
    }
}

/// Convert outgoing JSON messages, ending the stream at the first invalid one
fn outbound_messages(
    requests: RequestStream,
    input: prost_reflect::MessageDescriptor,
    rejected: Arc<OnceLock<Status>>,
) -> BoxStream<'static, prost_reflect::DynamicMessage> {
    requests
        .map(move |value| match json_to_message(&input, value) {
            Ok(message) => Some(message),
            Err(status) => {
                let _ = rejected.set(status);
                None
            }
        })
        .take_while(|message| futures::future::ready(message.is_some()))
        .filter_map(futures::future::ready)
        .boxed()
}
