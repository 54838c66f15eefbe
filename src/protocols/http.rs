//! # HTTP Passthrough Forwarder
//!
//! Forwards requests verbatim to a plain-HTTP backend and streams the backend's
//! response back unchanged. Used for binary endpoints such as avatar upload and
//! download, where transcoding would be lossy.
//!
//! - Method, path, query, headers and body are forwarded as received; only
//!   hop-by-hop headers are dropped and `X-Forwarded-For` is appended
//! - Bodies are streamed in both directions, never buffered
//! - A 101 reply splices the client and backend connections byte for byte
//! - A backend that cannot be reached yields 502

use axum::body::Body;
use axum::extract::Request;
use axum::http::header::{CONNECTION, UPGRADE};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Uri, Version};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use hyper::upgrade::OnUpgrade;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::RequestContext;
use crate::protocols::wants_upgrade;

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Headers that describe a single connection and are never forwarded
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Client for one plain-HTTP backend
#[derive(Clone)]
pub struct HttpForwarder {
    name: String,
    base: String,
    client: Client<HttpConnector, Body>,
}

impl HttpForwarder {
    pub fn new(name: impl Into<String>, base_url: &str) -> GatewayResult<Self> {
        Self::with_connect_timeout(name, base_url, None)
    }

    pub fn with_connect_timeout(
        name: impl Into<String>,
        base_url: &str,
        connect_timeout: Option<Duration>,
    ) -> GatewayResult<Self> {
        let name = name.into();
        let url = Url::parse(base_url).map_err(|e| {
            GatewayError::config(format!("Backend '{}' has invalid address '{}': {}", name, base_url, e))
        })?;
        if url.scheme() != "http" {
            return Err(GatewayError::config(format!(
                "Backend '{}' must use http://, got {}",
                name,
                url.scheme()
            )));
        }

        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(connect_timeout);
        connector.set_nodelay(true);
        let client = Client::builder(TokioExecutor::new()).build(connector);

        Ok(Self {
            name,
            base: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    /// Backend URI for an inbound request URI
    fn target_uri(&self, uri: &Uri) -> GatewayResult<Uri> {
        let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        format!("{}{}", self.base, path_and_query)
            .parse()
            .map_err(|e| GatewayError::internal(format!("Invalid passthrough target: {}", e)))
    }

    /// Forward a request and relay the backend's response
    pub async fn forward(&self, ctx: RequestContext, mut request: Request) -> Response {
        let upgrading = wants_upgrade(request.headers());
        let client_upgrade = if upgrading {
            request.extensions_mut().remove::<OnUpgrade>()
        } else {
            None
        };

        let (mut parts, body) = request.into_parts();
        parts.uri = match self.target_uri(&parts.uri) {
            Ok(uri) => uri,
            Err(e) => return e.into_response(),
        };
        if parts.version == Version::HTTP_2 {
            parts.version = Version::HTTP_11;
        }
        strip_hop_by_hop(&mut parts.headers, upgrading);
        if let Some(addr) = ctx.remote_addr {
            append_forwarded_for(&mut parts.headers, &addr.ip().to_string());
        }

        debug!(
            request_id = %ctx.request_id,
            backend = %self.name,
            uri = %parts.uri,
            "Forwarding request"
        );

        let outbound = Request::from_parts(parts, body);
        let result = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                return GatewayError::upstream_unavailable(&self.name, "request cancelled").into_response();
            }
            result = self.client.request(outbound) => result,
        };

        let mut response = match result {
            Ok(response) => response,
            Err(e) => {
                warn!(request_id = %ctx.request_id, backend = %self.name, error = %e, "Passthrough backend unreachable");
                return GatewayError::upstream_dial(&self.name, e.to_string()).into_response();
            }
        };

        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            if let Some(client_upgrade) = client_upgrade {
                let backend_upgrade = hyper::upgrade::on(&mut response);
                let (parts, _) = response.into_parts();
                tokio::spawn(splice(self.name.clone(), client_upgrade, backend_upgrade, ctx));
                return Response::from_parts(parts, Body::empty());
            }
        }

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers, false);

        // The request stays in flight until the body has been relayed
        let cancel = ctx.cancel.clone();
        let stop = async move { cancel.cancelled().await };
        let relayed = Body::new(body)
            .into_data_stream()
            .map(move |chunk| {
                let _in_flight = &ctx;
                chunk
            })
            .take_until(stop);

        Response::from_parts(parts, Body::from_stream(relayed))
    }
}

/// Copy bytes both ways between two upgraded connections until either side closes
async fn splice(backend: String, client: OnUpgrade, upstream: OnUpgrade, ctx: RequestContext) {
    let (client, upstream) = match tokio::try_join!(client, upstream) {
        Ok(pair) => pair,
        Err(e) => {
            warn!(backend = %backend, error = %e, "Upgrade handshake failed");
            return;
        }
    };
    let mut client = TokioIo::new(client);
    let mut upstream = TokioIo::new(upstream);

    tokio::select! {
        _ = ctx.cancel.cancelled() => {
            debug!(request_id = %ctx.request_id, backend = %backend, "Upgraded connection force closed");
        }
        copied = tokio::io::copy_bidirectional(&mut client, &mut upstream) => match copied {
            Ok((sent, received)) => {
                debug!(request_id = %ctx.request_id, backend = %backend, sent, received, "Upgraded connection closed");
            }
            Err(e) => {
                let event = GatewayError::stream_abort(ctx.request_id.to_string(), e.to_string());
                debug!(backend = %backend, "{}", event);
            }
        },
    }
}

/// Remove connection-scoped headers, keeping the upgrade handshake when asked to
fn strip_hop_by_hop(headers: &mut HeaderMap, keep_upgrade: bool) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        if keep_upgrade && name == UPGRADE {
            continue;
        }
        headers.remove(name);
    }

    for name in HOP_BY_HOP {
        if keep_upgrade && (*name == "connection" || *name == "upgrade") {
            continue;
        }
        headers.remove(*name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, client_ip: &str) {
    let value = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(prior) if !prior.is_empty() => format!("{}, {}", prior, client_ip),
        _ => client_ip.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}
