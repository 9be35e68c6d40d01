//! The HTTP surface: JSON-RPC dispatch, SSE subscriptions, NDJSON import,
//! and health.

pub mod auth;
pub mod import;
pub mod rpc;
pub mod sse;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::pubsub::PubSub;
use crate::store::Storage;
use crate::Result;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Storage>,
    pub pubsub: PubSub,
    /// Accept any or missing credentials and map them to the `default`
    /// namespace.
    pub test_mode: bool,
    /// Pre-seeded token for the auto-created `default` namespace.
    pub default_token: Option<String>,
    /// Serializes auto-creation of the `default` namespace so two
    /// concurrent first-writes don't both try to create it.
    pub(crate) default_ns_init: Arc<tokio::sync::Mutex<()>>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn Storage>,
        test_mode: bool,
        default_token: Option<String>,
    ) -> Self {
        AppState {
            store,
            pubsub: PubSub::new(),
            test_mode,
            default_token,
            default_ns_init: Arc::new(tokio::sync::Mutex::new(())),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/rpc", post(rpc::dispatch))
        .route("/subscribe", get(sse::subscribe))
        .route("/import", post(import::import))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// Binds the listener and serves until SIGINT/SIGTERM. Shutdown closes the
/// bus first so SSE connections drain, then the storage pools.
pub async fn serve(state: AppState, port: u16) -> Result<()> {
    let store = state.store.clone();
    let pubsub = state.pubsub.clone();
    let router = build_router(state);

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "server listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            pubsub.close();
        })
        .await?;

    store.close().await;
    info!("server shut down gracefully");
    Ok(())
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful
/// shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
