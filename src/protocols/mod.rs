//! # Protocol Handlers
//!
//! Everything that talks to a backend on behalf of a matched route:
//! - `transcode`: HTTP/JSON to rpc, unary and JSON-lines streaming
//! - `websocket`: upgraded connections bound to a streaming rpc
//! - `http`: verbatim passthrough to plain-HTTP backends
//! - `grpc` and `codec`: the rpc client and its dynamic protobuf codec

pub mod codec;
pub mod grpc;
pub mod http;
pub mod transcode;
pub mod websocket;

use axum::http::header::{CONNECTION, UPGRADE};
use axum::http::HeaderMap;
use std::fmt;
use std::sync::Arc;

use crate::core::config::{BackendConfig, ServerConfig};
use crate::core::error::GatewayResult;
use crate::core::types::BackendProtocol;

pub use grpc::{CallContext, CallKind, DescriptorCatalog, GrpcBackend, RpcBackend, RpcMethod};
pub use http::HttpForwarder;
pub use transcode::Transcoder;

/// Whether the request asks to switch protocols (`Connection: upgrade` plus `Upgrade`)
pub fn wants_upgrade(headers: &HeaderMap) -> bool {
    let connection_upgrade = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    connection_upgrade && headers.contains_key(UPGRADE)
}

/// Client handle for a backend
#[derive(Clone)]
pub enum BackendClient {
    Rpc(Arc<dyn RpcBackend>),
    Http(HttpForwarder),
}

/// A backend service, resolved once at startup and shared read-only
#[derive(Clone)]
pub struct BackendTarget {
    pub name: String,
    pub address: String,
    pub protocol: BackendProtocol,
    pub client: BackendClient,
}

impl BackendTarget {
    pub fn rpc(
        name: impl Into<String>,
        address: impl Into<String>,
        protocol: BackendProtocol,
        client: Arc<dyn RpcBackend>,
    ) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            protocol,
            client: BackendClient::Rpc(client),
        }
    }

    pub fn http(name: impl Into<String>, forwarder: HttpForwarder) -> Self {
        Self {
            name: name.into(),
            address: forwarder.base_url().to_string(),
            protocol: BackendProtocol::PlainHttp,
            client: BackendClient::Http(forwarder),
        }
    }

    /// Build the client a configured backend needs; no connection is made yet
    pub fn from_config(name: &str, config: &BackendConfig, server: &ServerConfig) -> GatewayResult<Self> {
        let base_url = config.base_url();
        match config.protocol {
            BackendProtocol::PlainHttp => {
                let forwarder =
                    HttpForwarder::with_connect_timeout(name, &base_url, Some(server.connect_timeout))?;
                Ok(Self::http(name, forwarder))
            }
            protocol => {
                let client = GrpcBackend::new(name, &base_url, server.connect_timeout)?;
                Ok(Self::rpc(name, base_url, protocol, Arc::new(client)))
            }
        }
    }

    pub fn rpc_client(&self) -> Option<Arc<dyn RpcBackend>> {
        match &self.client {
            BackendClient::Rpc(client) => Some(client.clone()),
            BackendClient::Http(_) => None,
        }
    }

    pub fn http_client(&self) -> Option<&HttpForwarder> {
        match &self.client {
            BackendClient::Http(forwarder) => Some(forwarder),
            BackendClient::Rpc(_) => None,
        }
    }
}

impl fmt::Debug for BackendTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendTarget")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("protocol", &self.protocol)
            .finish()
    }
}
