// backupagent/src/server/mod.rs
use anyhow::Context;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use crate::backup::Orchestrator;

pub const GREETING: &str = "Welcome to Backup File! Server";

#[derive(Debug, Serialize)]
struct StatusBody {
    running: bool,
    phase: String,
    pending_notifications: usize,
}

pub fn create_router(orchestrator: Arc<Orchestrator>) -> Router {
    Router::new()
        .route("/", get(greeting))
        .route("/status", get(status))
        .with_state(orchestrator)
}

async fn greeting() -> &'static str {
    GREETING
}

async fn status(State(orchestrator): State<Arc<Orchestrator>>) -> Json<StatusBody> {
    let state = orchestrator.state();
    Json(StatusBody {
        running: state.is_active(),
        phase: state.phase().to_string(),
        pending_notifications: state.pending().await.len(),
    })
}

pub async fn bind(addr: SocketAddr) -> anyhow::Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))
}

/// Serves the health routes until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, orchestrator: Arc<Orchestrator>, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!("Listening on {}", addr);
    }
    axum::serve(listener, create_router(orchestrator))
        .with_graceful_shutdown(shutdown)
        .await
        .context("health server failed")
}
