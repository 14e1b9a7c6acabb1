//! RelayGate gateway server
//!
//! Usage:
//! ```bash
//! # With a server config
//! relaygate-server --config server.yaml
//!
//! # Defaults plus an explicit gateway file
//! relaygate-server --gateway-file ./gateway.yaml
//!
//! # Environment overrides (RELAYGATE_HOST, RELAYGATE_PORT, RELAYGATE_LOG_LEVEL,
//! # RELAYGATE_LOG_JSON, RELAYGATE_GATEWAY_FILE) beat the config file
//! RELAYGATE_PORT=9000 relaygate-server --config server.yaml
//! ```
//!
//! Test with:
//! ```bash
//! curl http://localhost:8080/v1/messages \
//!   -H "x-api-key: rg-your-key" \
//!   -H "anthropic-version: 2023-06-01" \
//!   -H "content-type: application/json" \
//!   -d '{"model": "claude-3-5-sonnet", "max_tokens": 256,
//!        "messages": [{"role": "user", "content": "Hello"}]}'
//! ```

use anyhow::Context;
use clap::Parser;
use relaygate_config_file::GatewayFile;
use relaygate_core::SystemClock;
use relaygate_observability::init_tracing;
use relaygate_server::{ServerConfig, build_gateway};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// RelayGate - multi-tenant LLM API relay
#[derive(Parser)]
#[command(name = "relaygate-server", version)]
#[command(about = "Relays Claude and OpenAI-compatible API calls across a pool of upstream accounts", long_about = None)]
struct Cli {
    /// Path to server configuration file (YAML or TOML)
    #[arg(short, long, value_name = "FILE", env = "RELAYGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Path to the gateway file with accounts, API keys, tenants and prices
    #[arg(short, long, value_name = "FILE")]
    gateway_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::default(),
    };
    config.merge_env();
    if let Some(path) = cli.gateway_file {
        config.gateway_file = path;
    }

    init_tracing(&config.logging)
        .map_err(|e| anyhow::anyhow!("initializing logging: {e}"))?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        commit = env!("RELAYGATE_COMMIT"),
        "Starting RelayGate"
    );
    match &cli.config {
        Some(path) => info!("Loaded configuration from {}", path.display()),
        None => info!("Using default configuration"),
    }

    let backends = GatewayFile::load(&config.gateway_file)
        .and_then(GatewayFile::build)
        .with_context(|| format!("loading gateway file {}", config.gateway_file.display()))?;

    let shutdown = CancellationToken::new();
    let gateway = build_gateway(&config, &backends, Arc::new(SystemClock), shutdown.clone())?;

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", config.host, config.port))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    info!("RelayGate listening on http://{}", addr);
    info!("  Claude API:         http://{}/v1/messages", addr);
    info!("  OpenAI API:         http://{}/v1/chat/completions", addr);
    info!("  Health check:       http://{}/healthz", addr);
    info!("  Readiness check:    http://{}/readyz", addr);
    info!("  Prometheus metrics: http://{}/metrics", addr);

    axum::serve(listener, gateway.router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Abort in-flight upstream calls so open streams finish as canceled.
            shutdown.cancel();
        })
        .await?;

    info!("Server stopped");
    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
