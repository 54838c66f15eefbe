//! # Gateway Server
//!
//! Startup wiring and the listener loop.
//!
//! ## Startup
//! 1. Load protobuf descriptor sets
//! 2. Build one client per configured backend (no connection is made yet)
//! 3. Resolve every route's rpc method and register it in the route table
//!
//! ## Shutdown
//! When the shutdown token fires the listener keeps accepting so that late
//! requests receive 503 while in-flight work drains. Once the drain completes,
//! or the grace deadline force-closes what is left, the listener is stopped.

use axum::extract::{Request, State};
use axum::response::Response;
use axum::Router;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::core::config::{GatewayConfig, RouteDefinition, ServerConfig};
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::HandlerKind;
use crate::gateway::dispatcher::Dispatcher;
use crate::protocols::grpc::DescriptorCatalog;
use crate::protocols::transcode::Transcoder;
use crate::protocols::BackendTarget;
use crate::routing::{Route, RouteTable, RouteTableBuilder};
use crate::traffic::shutdown::{DrainController, DrainOutcome};

/// Time allowed for connections to close after the drain has finished
const LISTENER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

pub struct GatewayServer {
    dispatcher: Arc<Dispatcher>,
    drain: DrainController,
    drain_timeout: Duration,
}

impl GatewayServer {
    pub fn new(routes: RouteTable, config: &ServerConfig) -> Self {
        let drain = DrainController::new();
        let transcoder = Transcoder::new(config.max_request_size, config.upstream_timeout);
        Self {
            dispatcher: Arc::new(Dispatcher::new(routes, drain.clone(), transcoder)),
            drain,
            drain_timeout: config.drain_timeout,
        }
    }

    /// Build the server described by a validated configuration
    pub async fn from_config(config: &GatewayConfig) -> GatewayResult<Self> {
        let catalog = DescriptorCatalog::load(&config.descriptor_sets).await?;

        let mut backends = HashMap::new();
        for (name, backend) in &config.backends {
            let target = BackendTarget::from_config(name, backend, &config.server)?;
            info!(backend = %name, address = %target.address, protocol = %target.protocol, "Backend configured");
            backends.insert(name.clone(), Arc::new(target));
        }

        let mut builder = RouteTableBuilder::new();
        for definition in &config.routes {
            builder.register(build_route(definition, &backends, &catalog)?)?;
        }
        let routes = builder.build();
        info!(routes = routes.len(), "Route table built");

        Ok(Self::new(routes, &config.server))
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    pub fn drain_controller(&self) -> DrainController {
        self.drain.clone()
    }

    /// The axum application: every request goes through the dispatcher
    pub fn app(&self) -> Router {
        Router::new()
            .fallback(dispatch)
            .with_state(self.dispatcher.clone())
            .layer(TraceLayer::new_for_http())
    }

    pub async fn bind(addr: SocketAddr) -> GatewayResult<TcpListener> {
        TcpListener::bind(addr)
            .await
            .map_err(|e| GatewayError::internal(format!("Failed to bind gateway listener to {}: {}", addr, e)))
    }

    /// Serve until `shutdown` fires, then drain and stop
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> GatewayResult<DrainOutcome> {
        let local_addr = listener.local_addr()?;
        let stop_listener = CancellationToken::new();

        let app = self.app().into_make_service_with_connect_info::<SocketAddr>();
        let stop = stop_listener.clone();
        let mut server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { stop.cancelled().await })
                .await
        });
        info!(addr = %local_addr, "Gateway listening");

        tokio::select! {
            _ = shutdown.cancelled() => {}
            finished = &mut server => {
                return match finished {
                    Ok(Ok(())) => Ok(DrainOutcome::Completed),
                    Ok(Err(e)) => Err(GatewayError::from(e)),
                    Err(e) => Err(GatewayError::internal(format!("Listener task failed: {}", e))),
                };
            }
        }

        info!(grace = ?self.drain_timeout, in_flight = self.drain.in_flight(), "Shutdown requested, draining");
        let outcome = self.drain.drain(self.drain_timeout).await;

        stop_listener.cancel();
        match tokio::time::timeout(LISTENER_STOP_TIMEOUT, &mut server).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => error!(error = %e, "Listener stopped with an error"),
            Ok(Err(e)) => error!(error = %e, "Listener task failed"),
            Err(_) => {
                warn!("Connections still open after drain, aborting listener");
                server.abort();
            }
        }

        Ok(outcome)
    }
}

async fn dispatch(State(dispatcher): State<Arc<Dispatcher>>, request: Request) -> Response {
    dispatcher.dispatch(request).await
}

fn build_route(
    definition: &RouteDefinition,
    backends: &HashMap<String, Arc<BackendTarget>>,
    catalog: &DescriptorCatalog,
) -> GatewayResult<Route> {
    let method = definition
        .method
        .to_uppercase()
        .parse()
        .map_err(|_| GatewayError::config(format!("Invalid HTTP method '{}'", definition.method)))?;
    let backend = backends.get(&definition.backend).cloned().ok_or_else(|| {
        GatewayError::config(format!(
            "Route '{}' references unknown backend '{}'",
            definition.path, definition.backend
        ))
    })?;

    let route = match (&definition.rpc, definition.handler) {
        (None, Some(HandlerKind::Passthrough)) => Route::passthrough(method, &definition.path, backend),
        (Some(rpc), handler) => {
            let rpc = catalog.resolve(rpc)?;
            let handler = handler.unwrap_or_else(|| rpc.default_handler());
            Route::transcode(method, &definition.path, handler, backend, rpc)
        }
        (None, _) => {
            return Err(GatewayError::config(format!(
                "Route '{}' needs an rpc method unless its handler is passthrough",
                definition.path
            )))
        }
    };

    if !route.backend.protocol.serves(route.handler) {
        return Err(GatewayError::config(format!(
            "Route '{}' handler {} cannot target {} backend '{}'",
            route.pattern, route.handler, route.backend.protocol, route.backend.name
        )));
    }
    Ok(route)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::BackendConfig;
    use crate::core::types::BackendProtocol;
    use crate::protocols::codec::test_support::echo_pool;

    fn backends(server: &ServerConfig) -> HashMap<String, Arc<BackendTarget>> {
        let mut backends = HashMap::new();
        for (name, protocol) in [
            ("echo", BackendProtocol::StreamingRpc),
            ("unary", BackendProtocol::UnaryRpc),
            ("user-http", BackendProtocol::PlainHttp),
        ] {
            let config = BackendConfig {
                address: "127.0.0.1:1".to_string(),
                protocol,
            };
            let target = BackendTarget::from_config(name, &config, server).unwrap();
            backends.insert(name.to_string(), Arc::new(target));
        }
        backends
    }

    fn definition(method: &str, path: &str, backend: &str, rpc: Option<&str>, handler: Option<HandlerKind>) -> RouteDefinition {
        RouteDefinition {
            method: method.to_string(),
            path: path.to_string(),
            backend: backend.to_string(),
            handler,
            rpc: rpc.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_handler_defaults_to_method_shape() {
        let server = ServerConfig::default();
        let backends = backends(&server);
        let catalog = DescriptorCatalog::from_pool(echo_pool());

        let route = build_route(
            &definition("post", "/echo", "echo", Some("echo.v1.Echo/Say"), None),
            &backends,
            &catalog,
        )
        .unwrap();
        assert_eq!(route.handler, HandlerKind::TranscodeUnary);
        assert_eq!(route.method, axum::http::Method::POST);

        let route = build_route(
            &definition("GET", "/echo/watch", "echo", Some("echo.v1.Echo/Watch"), None),
            &backends,
            &catalog,
        )
        .unwrap();
        assert_eq!(route.handler, HandlerKind::TranscodeStream);
    }

    #[tokio::test]
    async fn test_incompatible_routes_are_rejected() {
        let server = ServerConfig::default();
        let backends = backends(&server);
        let catalog = DescriptorCatalog::from_pool(echo_pool());

        // Streaming method on a unary-only backend
        let err = build_route(
            &definition("GET", "/watch", "unary", Some("echo.v1.Echo/Watch"), None),
            &backends,
            &catalog,
        )
        .unwrap_err();
        assert!(matches!(err, GatewayError::Configuration { .. }));

        // Passthrough onto an rpc backend
        let err = build_route(
            &definition("GET", "/raw", "echo", None, Some(HandlerKind::Passthrough)),
            &backends,
            &catalog,
        )
        .unwrap_err();
        assert!(matches!(err, GatewayError::Configuration { .. }));

        let err = build_route(
            &definition("GET", "/x", "missing", Some("echo.v1.Echo/Say"), None),
            &backends,
            &catalog,
        )
        .unwrap_err();
        assert!(matches!(err, GatewayError::Configuration { .. }));
    }

    #[tokio::test]
    async fn test_passthrough_route_is_built() {
        let server = ServerConfig::default();
        let route = build_route(
            &definition(
                "GET",
                "/api/v1/user/avatar/download/{code}",
                "user-http",
                None,
                Some(HandlerKind::Passthrough),
            ),
            &backends(&server),
            &DescriptorCatalog::default(),
        )
        .unwrap();
        assert_eq!(route.handler, HandlerKind::Passthrough);
        assert!(route.rpc.is_none());
    }
}
