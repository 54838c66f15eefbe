//! # Configuration Module
//!
//! Configuration structures and loading for the edge gateway.
//!
//! ## Key Features
//! - YAML, JSON or TOML configuration parsing with serde, chosen by file extension
//! - Environment variable override support (`GATEWAY_*`)
//! - Validation that reports every problem at once, before anything binds
//!
//! ## Example
//! ```yaml
//! server:
//!   bind_address: 0.0.0.0
//!   http_port: 5000
//!   drain_timeout: 30s
//! backends:
//!   user:
//!     address: user:9090
//!     protocol: streaming_rpc
//!   user-http:
//!     address: http://user:8080
//!     protocol: plain_http
//! descriptor_sets:
//!   - descriptors/user.pb
//! routes:
//!   - method: POST
//!     path: /api/v1/user/login
//!     backend: user
//!     rpc: user.v1.UserService/Login
//!   - method: GET
//!     path: /api/v1/user/avatar/download/{code}
//!     backend: user-http
//!     handler: passthrough
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{BackendProtocol, HandlerKind};

/// Main gateway configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Listener and timeout settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Backend targets by name
    #[serde(default)]
    pub backends: BTreeMap<String, BackendConfig>,

    /// Compiled protobuf descriptor sets describing the backend services
    #[serde(default)]
    pub descriptor_sets: Vec<PathBuf>,

    /// Route definitions
    #[serde(default)]
    pub routes: Vec<RouteDefinition>,

    /// Logging and metrics settings
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl GatewayConfig {
    /// Load, apply environment overrides and validate, picking the format
    /// from the file extension
    pub async fn load<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let config = Self::load_unvalidated(path).await?;
        config.validate()?;
        Ok(config)
    }

    /// Load and apply environment overrides only; callers that layer more
    /// overrides on top run `validate` once they are done
    pub async fn load_unvalidated<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let path = path.as_ref();
        let content = read_config(path).await?;
        let mut config: GatewayConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&content)
                .map_err(|e| GatewayError::config(format!("Failed to parse JSON config: {}", e)))?,
            Some("toml") => toml::from_str(&content)
                .map_err(|e| GatewayError::config(format!("Failed to parse TOML config: {}", e)))?,
            _ => serde_yaml::from_str(&content)
                .map_err(|e| GatewayError::config(format!("Failed to parse config: {}", e)))?,
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    ///
    /// Environment variables follow the pattern: GATEWAY_<SECTION>_<FIELD>.
    /// Backend addresses use GATEWAY_BACKEND_<NAME>_ADDRESS with the name
    /// upper-cased and dashes replaced by underscores.
    pub fn apply_env_overrides(&mut self) -> GatewayResult<()> {
        use std::env;

        if let Ok(addr) = env::var("GATEWAY_SERVER_BIND_ADDRESS") {
            self.server.bind_address = addr;
        }

        if let Ok(port) = env::var("GATEWAY_SERVER_HTTP_PORT") {
            self.server.http_port = port
                .parse()
                .map_err(|e| GatewayError::config(format!("Invalid GATEWAY_SERVER_HTTP_PORT: {}", e)))?;
        }

        if let Ok(size) = env::var("GATEWAY_SERVER_MAX_REQUEST_SIZE") {
            self.server.max_request_size = size.parse().map_err(|e| {
                GatewayError::config(format!("Invalid GATEWAY_SERVER_MAX_REQUEST_SIZE: {}", e))
            })?;
        }

        if let Ok(timeout) = env::var("GATEWAY_SERVER_DRAIN_TIMEOUT") {
            self.server.drain_timeout = humantime::parse_duration(&timeout).map_err(|e| {
                GatewayError::config(format!("Invalid GATEWAY_SERVER_DRAIN_TIMEOUT: {}", e))
            })?;
        }

        if let Ok(timeout) = env::var("GATEWAY_SERVER_UPSTREAM_TIMEOUT") {
            self.server.upstream_timeout = humantime::parse_duration(&timeout).map_err(|e| {
                GatewayError::config(format!("Invalid GATEWAY_SERVER_UPSTREAM_TIMEOUT: {}", e))
            })?;
        }

        if let Ok(level) = env::var("GATEWAY_LOG_LEVEL") {
            self.observability.logging.level = level;
        }

        if let Ok(format) = env::var("GATEWAY_LOG_FORMAT") {
            self.observability.logging.format = format;
        }

        for (name, backend) in self.backends.iter_mut() {
            if let Ok(address) = env::var(backend_env_var(name)) {
                backend.address = address;
            }
        }

        Ok(())
    }

    /// Point an existing backend at a new address
    pub fn set_backend_address(&mut self, name: &str, address: impl Into<String>) -> GatewayResult<()> {
        let backend = self
            .backends
            .get_mut(name)
            .ok_or_else(|| GatewayError::config(format!("Unknown backend '{}'", name)))?;
        backend.address = address.into();
        Ok(())
    }

    /// Socket address the listener binds to
    pub fn listen_addr(&self) -> GatewayResult<SocketAddr> {
        format!("{}:{}", self.server.bind_address, self.server.http_port)
            .parse()
            .map_err(|e| {
                GatewayError::config(format!(
                    "Invalid listen address {}:{}: {}",
                    self.server.bind_address, self.server.http_port, e
                ))
            })
    }

    /// Comprehensive configuration validation with detailed error messages
    pub fn validate(&self) -> GatewayResult<()> {
        let mut errors = Vec::new();

        if self.server.bind_address.is_empty() {
            errors.push("bind_address cannot be empty".to_string());
        } else if let Err(e) = self.listen_addr() {
            errors.push(e.to_string());
        }

        if self.server.http_port == 0 {
            errors.push("http_port must be greater than 0".to_string());
        }

        if self.server.max_request_size == 0 {
            errors.push("max_request_size must be greater than 0".to_string());
        }

        if self.server.upstream_timeout.is_zero() {
            errors.push("upstream_timeout must be greater than 0".to_string());
        }

        for (name, backend) in &self.backends {
            if backend.address.is_empty() {
                errors.push(format!("Backend '{}' has empty address", name));
                continue;
            }
            if let Err(e) = Url::parse(&backend.base_url()) {
                errors.push(format!(
                    "Backend '{}' has invalid address '{}': {}",
                    name, backend.address, e
                ));
            }
        }

        let needs_descriptors = self.routes.iter().any(|r| r.rpc.is_some());
        if needs_descriptors && self.descriptor_sets.is_empty() {
            errors.push("Routes reference rpc methods but no descriptor_sets are configured".to_string());
        }

        for (index, route) in self.routes.iter().enumerate() {
            if !route.path.starts_with('/') {
                errors.push(format!("Route {} path '{}' must start with '/'", index, route.path));
            }

            if axum::http::Method::from_bytes(route.method.to_uppercase().as_bytes()).is_err() {
                errors.push(format!(
                    "Route '{}' has invalid HTTP method: {}",
                    route.path, route.method
                ));
            }

            let backend = match self.backends.get(&route.backend) {
                Some(backend) => backend,
                None => {
                    errors.push(format!(
                        "Route '{}' references unknown backend '{}'",
                        route.path, route.backend
                    ));
                    continue;
                }
            };

            match (&route.rpc, route.handler) {
                (None, Some(HandlerKind::Passthrough)) => {}
                (None, _) => errors.push(format!(
                    "Route '{}' needs an rpc method unless its handler is passthrough",
                    route.path
                )),
                (Some(_), Some(HandlerKind::Passthrough)) => errors.push(format!(
                    "Route '{}' is passthrough and cannot name an rpc method",
                    route.path
                )),
                (Some(rpc), _) => {
                    if !is_rpc_name(rpc) {
                        errors.push(format!(
                            "Route '{}' rpc '{}' must look like package.Service/Method",
                            route.path, rpc
                        ));
                    }
                }
            }

            if let Some(handler) = route.handler {
                if !backend.protocol.serves(handler) {
                    errors.push(format!(
                        "Route '{}' handler {} cannot target {} backend '{}'",
                        route.path, handler, backend.protocol, route.backend
                    ));
                }
            } else if !backend.protocol.is_rpc() {
                errors.push(format!(
                    "Route '{}' targets plain HTTP backend '{}' without handler: passthrough",
                    route.path, route.backend
                ));
            }
        }

        match self.observability.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => errors.push(format!("Invalid log level: {}", self.observability.logging.level)),
        }

        match self.observability.logging.format.to_lowercase().as_str() {
            "json" | "text" => {}
            _ => errors.push(format!("Invalid log format: {}", self.observability.logging.format)),
        }

        if !errors.is_empty() {
            return Err(GatewayError::config(format!(
                "Configuration validation failed:\n{}",
                errors.join("\n")
            )));
        }

        Ok(())
    }
}

async fn read_config(path: &Path) -> GatewayResult<String> {
    tokio::fs::read_to_string(path).await.map_err(|e| {
        GatewayError::config(format!("Failed to read config file {}: {}", path.display(), e))
    })
}

fn backend_env_var(name: &str) -> String {
    format!(
        "GATEWAY_BACKEND_{}_ADDRESS",
        name.to_uppercase().replace(['-', '.'], "_")
    )
}

fn is_rpc_name(rpc: &str) -> bool {
    match rpc.split_once('/') {
        Some((service, method)) => {
            !service.is_empty() && !method.is_empty() && !method.contains('/')
        }
        None => false,
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server bind address
    pub bind_address: String,

    /// HTTP port for the public listener
    pub http_port: u16,

    /// Maximum request body size read for transcoding
    pub max_request_size: usize,

    /// Grace period given to in-flight work once draining starts
    #[serde(with = "humantime_serde")]
    pub drain_timeout: Duration,

    /// Deadline attached to unary backend calls
    #[serde(with = "humantime_serde")]
    pub upstream_timeout: Duration,

    /// Dial timeout for backend connections
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            http_port: 5000,
            max_request_size: 4 * 1024 * 1024, // 4MB
            drain_timeout: Duration::from_secs(30),
            upstream_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Backend target configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// host:port, or a full http:// URL
    pub address: String,

    pub protocol: BackendProtocol,
}

impl BackendConfig {
    /// Address with an http:// scheme added when none was given
    pub fn base_url(&self) -> String {
        if self.address.contains("://") {
            self.address.clone()
        } else {
            format!("http://{}", self.address)
        }
    }
}

/// Route definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteDefinition {
    /// HTTP method (GET, POST, etc.)
    pub method: String,

    /// Route path pattern (supports whole-segment parameters like /users/{id})
    pub path: String,

    /// Target backend name
    pub backend: String,

    /// Handler kind; derived from the rpc method when omitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<HandlerKind>,

    /// Fully qualified rpc method, `package.Service/Method`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpc: Option<String>,
}

/// Observability configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,

    /// Log format (json, text)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
        }
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable the Prometheus scrape endpoint
    pub prometheus_enabled: bool,

    /// Port for the scrape endpoint
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            prometheus_enabled: false,
            port: 9090,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
server:
  bind_address: 127.0.0.1
  http_port: 5000
  drain_timeout: 10s
backends:
  user:
    address: localhost:9090
    protocol: streaming_rpc
  user-http:
    address: http://localhost:8080
    protocol: plain_http
descriptor_sets:
  - user.pb
routes:
  - method: POST
    path: /api/v1/user/login
    backend: user
    rpc: user.v1.UserService/Login
  - method: GET
    path: /api/v1/user/avatar/download/{code}
    backend: user-http
    handler: passthrough
"#;

    fn sample() -> GatewayConfig {
        serde_yaml::from_str(SAMPLE).unwrap()
    }

    #[test]
    fn test_sample_config_is_valid() {
        let config = sample();
        config.validate().unwrap();
        assert_eq!(config.server.drain_timeout, Duration::from_secs(10));
        assert_eq!(config.server.upstream_timeout, Duration::from_secs(30));
        assert_eq!(config.listen_addr().unwrap().port(), 5000);
        assert_eq!(config.backends["user"].base_url(), "http://localhost:9090");
    }

    #[test]
    fn test_unknown_backend_is_reported() {
        let mut config = sample();
        config.routes[0].backend = "tracking".to_string();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, GatewayError::Configuration { .. }));
        assert!(err.to_string().contains("unknown backend 'tracking'"));
    }

    #[test]
    fn test_invalid_listen_address_is_reported() {
        let mut config = sample();
        config.server.bind_address = "not an address".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Invalid listen address"));
    }

    #[test]
    fn test_handler_protocol_mismatch_is_reported() {
        let mut config = sample();
        config.routes[1].backend = "user".to_string();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("cannot target streaming_rpc backend 'user'"));

        let mut config = sample();
        config.routes[0].handler = Some(HandlerKind::TranscodeStream);
        config.backends.get_mut("user").unwrap().protocol = BackendProtocol::UnaryRpc;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("transcode_stream cannot target unary_rpc"));
    }

    #[test]
    fn test_all_problems_are_collected() {
        let mut config = sample();
        config.routes[0].rpc = Some("NoSlash".to_string());
        config.observability.logging.level = "loud".to_string();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("package.Service/Method"));
        assert!(err.contains("Invalid log level: loud"));
    }

    #[test]
    fn test_set_backend_address() {
        let mut config = sample();
        config.set_backend_address("user", "10.0.0.7:9090").unwrap();
        assert_eq!(config.backends["user"].address, "10.0.0.7:9090");
        assert!(config.set_backend_address("missing", "x:1").is_err());
    }

    #[test]
    fn test_backend_env_override() {
        let mut config = sample();
        config.backends.insert(
            "env-override".to_string(),
            BackendConfig {
                address: "localhost:1".to_string(),
                protocol: BackendProtocol::UnaryRpc,
            },
        );
        std::env::set_var("GATEWAY_BACKEND_ENV_OVERRIDE_ADDRESS", "localhost:2");
        config.apply_env_overrides().unwrap();
        std::env::remove_var("GATEWAY_BACKEND_ENV_OVERRIDE_ADDRESS");
        assert_eq!(config.backends["env-override"].address, "localhost:2");
    }

    #[tokio::test]
    async fn test_load_by_extension() {
        let mut yaml = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        yaml.write_all(SAMPLE.as_bytes()).unwrap();
        let config = GatewayConfig::load(yaml.path()).await.unwrap();
        assert_eq!(config.routes.len(), 2);

        let mut json = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        json.write_all(serde_json::to_string(&sample()).unwrap().as_bytes())
            .unwrap();
        let config = GatewayConfig::load(json.path()).await.unwrap();
        assert_eq!(config.backends.len(), 2);
    }

    #[tokio::test]
    async fn test_placeholder_address_is_checked_after_overrides() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        let placeholder = SAMPLE.replace("address: http://localhost:8080", "address: \"\"");
        file.write_all(placeholder.as_bytes()).unwrap();

        let err = GatewayConfig::load(file.path()).await.unwrap_err();
        assert!(err.to_string().contains("Backend 'user-http' has empty address"));

        let mut config = GatewayConfig::load_unvalidated(file.path()).await.unwrap();
        assert_eq!(config.backends["user-http"].address, "");
        config.set_backend_address("user-http", "http://10.0.0.7:8080").unwrap();
        config.validate().unwrap();
    }

    #[tokio::test]
    async fn test_missing_file_is_configuration_error() {
        let err = GatewayConfig::load("/nonexistent/gateway.yaml").await.unwrap_err();
        assert!(matches!(err, GatewayError::Configuration { .. }));
    }
}
