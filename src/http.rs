//! HTTP surface: health check, static frontend serving, and the
//! localhost-binding middleware wrapping every route — the ambient pieces
//! spec.md calls out as external collaborators to the channel endpoint.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{ConnectInfo, State};
use axum::http::{Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::config::Config;
use crate::session::SessionManager;
use crate::ws;

pub type AppState = (Arc<SessionManager>, Arc<Config>);

/// Builds the full axum app: `/health`, `/ws`, static frontend (or a JSON
/// placeholder if `FRONTEND_DIR` doesn't exist), wrapped in the
/// localhost-only middleware and request tracing.
pub fn build_router(manager: Arc<SessionManager>, config: Arc<Config>) -> Router {
    let frontend_dir = PathBuf::from(std::env::var("FRONTEND_DIR").unwrap_or_else(|_| "./frontend/dist".to_string()));
    let state: AppState = (manager, Arc::clone(&config));

    let mut router = Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws::upgrade));

    router = if frontend_dir.exists() {
        let index_path = frontend_dir.join("index.html");
        router
            .nest_service("/assets", ServeDir::new(frontend_dir.join("assets")))
            .fallback_service(ServeFile::new(index_path))
    } else {
        router.fallback(no_frontend)
    };

    router
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn_with_state(config, localhost_only))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "healthy" }))
}

async fn no_frontend() -> impl IntoResponse {
    Json(json!({
        "message": "Frontend not built. Run the frontend build, then set FRONTEND_DIR.",
        "api": "WebSocket available at /ws",
    }))
}

/// Rejects any request from a non-loopback peer with a 403 unless
/// `ALLOW_NON_LOCALHOST` is set (spec §6, "localhost-binding middleware").
/// Applied ahead of the `/ws` upgrade too, since the upgrade is plain HTTP
/// until the 101 response is sent.
async fn localhost_only(
    State(config): State<Arc<Config>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    if !addr.ip().is_loopback() && !config.allow_non_localhost {
        warn!(%addr, path = %request.uri(), "rejected non-localhost request");
        return (
            StatusCode::FORBIDDEN,
            Json(json!({ "detail": "Access denied: localhost only" })),
        )
            .into_response();
    }
    next.run(request).await
}

/// Creates `DATA_DIR` and its `sessions/`/`logs/` subdirectories if absent.
pub fn ensure_data_dirs(config: &Config) -> std::io::Result<()> {
    std::fs::create_dir_all(crate::paths::sessions_dir(&config.data_dir))?;
    std::fs::create_dir_all(crate::paths::logs_dir(&config.data_dir))?;
    Ok(())
}
