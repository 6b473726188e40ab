use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use copilot_terminal_server::config::Config;
use copilot_terminal_server::http;
use copilot_terminal_server::logging;
use copilot_terminal_server::session::SessionManager;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().context("loading configuration")?;
    let _log_guard = logging::init(&config).context("initializing logging")?;

    http::ensure_data_dirs(&config).context("creating data directories")?;

    info!(host = %config.host, port = config.port, data_dir = ?config.data_dir, "starting server");

    let config = Arc::new(config);
    let manager = SessionManager::new(Arc::clone(&config));
    let app = http::build_router(Arc::clone(&manager), Arc::clone(&config));

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("parsing bind address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;

    info!(%addr, "listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("shutting down session manager");
    manager.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
