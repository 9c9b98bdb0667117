//! # wsgate
//!
//! WebSocket gateway binary: loads settings, installs logging and metrics,
//! wires the demo backend and serves until Ctrl+C / SIGTERM.

#![deny(unsafe_code)]

mod demo;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use wsgate_server::{ChannelRegistry, GatewayServer, MiddlewareRegistry, Registry};
use wsgate_telemetry::LoggingConfig;

/// WebSocket RPC gateway.
#[derive(Parser, Debug)]
#[command(name = "wsgate", about = "WebSocket RPC gateway", version)]
struct Cli {
    /// Settings file (JSON). Missing keys fall back to defaults.
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = wsgate_settings::load_settings(cli.config.as_deref())
        .context("failed to load settings")?;
    if let Some(host) = cli.host {
        settings.server.host = host;
    }
    if let Some(port) = cli.port {
        settings.server.port = port;
    }

    let logging = LoggingConfig::from_strings(
        &settings.logging.level,
        &settings.logging.modules,
        settings.logging.json,
    )
    .context("invalid logging settings")?;
    wsgate_telemetry::init_logging(&logging).context("failed to initialise logging")?;

    let metrics = wsgate_server::metrics::install_recorder()
        .context("failed to install metrics recorder")?;

    let middlewares = Arc::new(MiddlewareRegistry::new());
    demo::register_middlewares(&middlewares);

    let registry = Arc::new(Registry::new());
    let backend = Arc::new(demo::DemoBackend::new(
        ChannelRegistry::new(registry.clone()),
        settings.dispatch.local_action_prefix.clone(),
    ));

    let use_default_routes = settings.routes.is_empty();
    let server = GatewayServer::new(settings, registry, backend, middlewares)
        .context("failed to build gateway")?
        .with_metrics(metrics);
    if use_default_routes {
        demo::install_default_routes(server.routes()).context("failed to add demo routes")?;
    }

    let (addr, handle) = server.listen().await.context("failed to bind listener")?;
    tracing::info!(%addr, routes = server.routes().len(), "wsgate ready");

    wsgate_server::shutdown::shutdown_signal().await;
    tracing::info!("shutdown signal received");
    server.manager().close_all();
    server.shutdown().graceful_shutdown(vec![handle], None).await;

    Ok(())
}
