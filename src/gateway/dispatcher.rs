//! # Request Dispatcher
//!
//! Single entry point for every inbound request. For each request it:
//! 1. Rejects it with 503 if the gateway is draining
//! 2. Extracts call metadata (the `token`) from headers and query
//! 3. Looks the route up in the immutable route table (404 on a miss)
//! 4. Builds the request context with its cancellation token
//! 5. Hands off to passthrough, the WebSocket proxy, or transcoding

use axum::extract::{ConnectInfo, FromRequestParts, Request, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::auth::metadata::extract_metadata;
use crate::core::error::GatewayError;
use crate::core::types::{parse_query, HandlerKind, RequestContext};
use crate::observability::metrics;
use crate::protocols::transcode::Transcoder;
use crate::protocols::websocket::{self, is_websocket_upgrade};
use crate::routing::{RouteMatch, RouteTable};
use crate::traffic::shutdown::DrainController;

pub struct Dispatcher {
    routes: Arc<RouteTable>,
    drain: DrainController,
    transcoder: Transcoder,
}

impl Dispatcher {
    pub fn new(routes: RouteTable, drain: DrainController, transcoder: Transcoder) -> Self {
        Self {
            routes: Arc::new(routes),
            drain,
            transcoder,
        }
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn drain_controller(&self) -> &DrainController {
        &self.drain
    }

    pub async fn dispatch(&self, request: Request) -> Response {
        let started = Instant::now();
        let method = request.method().clone();

        let (handler, response) = self.route_request(request).await;

        metrics::record_request(&method, handler, response.status(), started.elapsed());
        response
    }

    async fn route_request(&self, request: Request) -> (&'static str, Response) {
        let guard = match self.drain.start_request() {
            Ok(guard) => guard,
            Err(e) => return ("rejected", e.into_response()),
        };

        let method = request.method().clone();
        let path = request.uri().path().to_string();
        let query = parse_query(request.uri().query());
        let metadata = extract_metadata(request.headers(), &query);
        let remote_addr = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);

        let RouteMatch { route, params } = match self.routes.match_route(&method, &path) {
            Ok(matched) => matched,
            Err(e) => {
                debug!(method = %method, path = %path, "No route matched");
                return ("unmatched", e.into_response());
            }
        };

        let ctx = RequestContext::new(method, path, request.headers().clone())
            .with_query(query)
            .with_path_params(params)
            .with_metadata(metadata)
            .with_remote_addr(remote_addr)
            .with_cancel(self.drain.request_token())
            .with_inflight(guard);

        debug!(
            request_id = %ctx.request_id,
            route = %route.pattern,
            handler = %route.handler,
            backend = %route.backend.name,
            "Dispatching request"
        );

        match route.handler {
            HandlerKind::Passthrough => {
                let response = match route.backend.http_client() {
                    Some(forwarder) => forwarder.forward(ctx, request).await,
                    None => GatewayError::internal(format!(
                        "Passthrough route {} targets rpc backend '{}'",
                        route.pattern, route.backend.name
                    ))
                    .into_response(),
                };
                ("passthrough", response)
            }
            HandlerKind::TranscodeStream if is_websocket_upgrade(request.headers()) => {
                let (mut parts, _body) = request.into_parts();
                let response = match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
                    Ok(upgrade) => websocket::handle_upgrade(route, ctx, upgrade).await,
                    Err(rejection) => rejection.into_response(),
                };
                ("websocket", response)
            }
            HandlerKind::TranscodeStream => {
                let response = self
                    .transcoder
                    .handle_server_stream(&route, ctx, request.into_body())
                    .await;
                ("transcode_stream", response)
            }
            HandlerKind::TranscodeUnary => {
                let response = self
                    .transcoder
                    .handle_unary(&route, ctx, request.into_body())
                    .await;
                ("transcode_unary", response)
            }
        }
    }
}
