//! # Edge Gateway - Main Entry Point
//!
//! `edge-gateway start` loads the configuration, applies command-line
//! overrides, builds the route table and serves until SIGINT or SIGTERM.
//! On a signal the gateway drains: new requests get 503, in-flight work gets
//! until `server.drain_timeout` to finish, and whatever remains is force-closed.

use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use edge_gateway::observability::{init_logging, install_prometheus};
use edge_gateway::{DrainOutcome, GatewayConfig, GatewayError, GatewayResult, GatewayServer};

#[derive(Debug, Parser)]
#[command(name = "edge-gateway", version, about = "HTTP/WebSocket edge gateway for gRPC backends")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the gateway
    Start(StartArgs),
}

#[derive(Debug, Args)]
struct StartArgs {
    /// Configuration file (YAML, JSON or TOML)
    #[arg(long, env = "GATEWAY_CONFIG_PATH", default_value = "config/gateway.yaml")]
    config: PathBuf,

    /// Address to listen on
    #[arg(long, env = "HOST")]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long, env = "PORT")]
    port: Option<u16>,

    /// Address of the tracking backend
    #[arg(long, env = "TRACKING_ENDPOINT")]
    tracking: Option<String>,

    /// Address of the user backend
    #[arg(long, env = "USER_ENDPOINT")]
    user: Option<String>,

    /// Address of the user service's plain HTTP endpoint
    #[arg(long = "user-http", env = "USER_HTTP_ENDPOINT")]
    user_http: Option<String>,
}

impl StartArgs {
    fn apply(&self, config: &mut GatewayConfig) -> GatewayResult<()> {
        if let Some(host) = &self.host {
            config.server.bind_address = host.clone();
        }
        if let Some(port) = self.port {
            config.server.http_port = port;
        }

        let endpoints = [
            ("tracking", &self.tracking),
            ("user", &self.user),
            ("user-http", &self.user_http),
        ];
        for (backend, address) in endpoints {
            if let Some(address) = address {
                config.set_backend_address(backend, address.clone())?;
            }
        }

        config.validate()
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let result = match cli.command {
        Command::Start(args) => start(args).await,
    };

    if let Err(e) = result {
        error!(error = %e, fatal = e.is_fatal(), "Gateway failed");
        eprintln!("edge-gateway: {}", e);
        std::process::exit(exit_code(&e));
    }
}

/// `EX_CONFIG` (78) for configuration problems, 1 for anything else
fn exit_code(error: &GatewayError) -> i32 {
    if error.is_fatal() {
        78
    } else {
        1
    }
}

async fn start(args: StartArgs) -> GatewayResult<()> {
    // Flags may fill in addresses the file leaves as placeholders, so validation waits for them
    let mut config = GatewayConfig::load_unvalidated(&args.config).await?;
    args.apply(&mut config)?;

    init_logging(&config.observability.logging);
    info!("🚀 Starting edge gateway v{}", env!("CARGO_PKG_VERSION"));
    info!(config = %args.config.display(), "📋 Configuration loaded");

    if config.observability.metrics.prometheus_enabled {
        let metrics_addr = SocketAddr::new(config.listen_addr()?.ip(), config.observability.metrics.port);
        install_prometheus(metrics_addr)?;
    }

    let server = GatewayServer::from_config(&config).await?;
    let listener = GatewayServer::bind(config.listen_addr()?).await?;

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    match server.serve(listener, shutdown).await? {
        DrainOutcome::Completed => info!("✅ Gateway stopped after draining all requests"),
        DrainOutcome::ForceClosed { remaining } => {
            info!(remaining, "🛑 Gateway stopped, remaining requests were force-closed")
        }
    }
    Ok(())
}

/// Cancel `shutdown` on the first SIGINT or SIGTERM
async fn watch_signals(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("📡 Received SIGINT, draining"),
        _ = terminate => info!("📡 Received SIGTERM, draining"),
    }
    shutdown.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code(&GatewayError::config("no routes")), 78);
        assert_eq!(exit_code(&GatewayError::Io { message: "bind failed".into() }), 1);
    }

    #[test]
    fn test_flags_override_backend_addresses() {
        let cli = Cli::parse_from([
            "edge-gateway",
            "start",
            "--host",
            "127.0.0.1",
            "-p",
            "6000",
            "--user-http",
            "http://10.0.0.7:8080",
        ]);
        let Command::Start(args) = cli.command;

        let mut config: GatewayConfig = serde_yaml::from_str(
            r#"
server:
  bind_address: 0.0.0.0
  http_port: 5000
backends:
  user-http:
    address: ""
    protocol: plain_http
"#,
        )
        .unwrap();
        assert!(config.validate().is_err());

        args.apply(&mut config).unwrap();
        assert_eq!(config.backends["user-http"].address, "http://10.0.0.7:8080");
        assert_eq!(config.server.http_port, 6000);
        assert_eq!(config.server.bind_address, "127.0.0.1");
    }
}
