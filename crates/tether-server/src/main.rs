//! tether-server binary: the WebRTC signaling relay.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use tether_core::logging::init_tracing;
use tether_server::settings::load_settings;
use tether_server::state::AppState;
use tether_server::{http, metrics};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Command-line overrides; everything else comes from `TETHER_*` env vars.
#[derive(Debug, Parser)]
#[command(name = "tether-server", about = "WebRTC signaling relay", version)]
struct Cli {
    /// Bind address override.
    #[arg(long)]
    host: Option<String>,
    /// Bind port override.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("tether=info,tower_http=warn");
    let cli = Cli::parse();

    let mut settings = load_settings();
    if let Some(host) = cli.host {
        settings.host = host;
    }
    if let Some(port) = cli.port {
        settings.port = port;
    }

    let metrics_handle = metrics::install_recorder();
    let state = AppState::new(settings.clone(), metrics_handle);

    let shutdown = CancellationToken::new();
    let liveness = state.spawn_liveness(shutdown.clone());

    let listener = tokio::net::TcpListener::bind(settings.bind_addr())
        .await
        .with_context(|| format!("failed to bind {}", settings.bind_addr()))?;
    info!(addr = %listener.local_addr()?, "tether signaling relay listening");

    let app = http::router(Arc::clone(&state));
    let shutdown_on_signal = {
        let shutdown = shutdown.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            shutdown.cancel();
        }
    };
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_on_signal)
        .await
        .context("server error")?;

    shutdown.cancel();
    let _ = liveness.await;
    Ok(())
}
