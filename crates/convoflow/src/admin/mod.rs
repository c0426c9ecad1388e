use std::path::PathBuf;

use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use tokio_util::sync::CancellationToken;

pub mod progress;

#[derive(Clone)]
pub struct AdminState {
    pub batch_dir: PathBuf,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/progress", get(progress::progress))
        .route("/health", get(health))
        .with_state(state)
}

pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Serve the admin endpoints until `shutdown` fires.
///
/// A bind or serve failure cancels `shutdown`, so a run sharing the token
/// stops the same way it does on a signal: in-flight items finish first.
pub async fn serve(
    addr: &str,
    state: AdminState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let res = bind_and_serve(addr, state, shutdown.clone()).await;
    if let Err(e) = &res {
        tracing::error!(addr, error = %e, "admin server failed; stopping the run");
        shutdown.cancel();
    }
    res
}

async fn bind_and_serve(
    addr: &str,
    state: AdminState,
    stop: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "progress endpoint listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { stop.cancelled().await })
        .await
}
