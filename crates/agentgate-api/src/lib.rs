//! HTTP and WebSocket surface of the control plane
//!
//! Every long-lived socket is entered into the control plane's task tracker
//! before it is upgraded, so a shutdown drains them like any other tunnel
//! task.

pub mod error;
pub mod handlers;
pub mod models;
pub mod websocket;

pub use error::{ApiError, ApiResult};
pub use models::{Response, ValidationError};
pub use websocket::{websocket_close_reason, WebSocketIo, WebSocketMessages};

use agentgate_control::ControlPlane;
use agentgate_metrics_cache::Cache;
use axum::{
    extract::connect_info::Connected,
    routing::{get, post},
    serve::IncomingStream,
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

/// State shared across handlers
#[derive(Clone)]
pub struct ServerState {
    pub plane: Arc<ControlPlane>,
    pub cache: Arc<Cache>,
}

/// Both ends of an accepted TCP connection
///
/// The relay uses the remote address for allocation quotas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionAddrs {
    pub remote: SocketAddr,
    pub local: SocketAddr,
}

impl Connected<IncomingStream<'_, TcpListener>> for ConnectionAddrs {
    fn connect_info(stream: IncomingStream<'_, TcpListener>) -> Self {
        let remote = *stream.remote_addr();
        let local = stream.io().local_addr().unwrap_or(remote);
        Self { remote, local }
    }
}

/// Build the router with all routes
pub fn router(state: ServerState) -> Router {
    Router::new()
        // Agent-facing routes
        .route(
            "/api/v2/workspaceagents/me/listen",
            get(handlers::workspace_agent_listen),
        )
        .route(
            "/api/v2/workspaceagents/me/node",
            get(handlers::workspace_agent_node),
        )
        .route(
            "/api/v2/metrics/report-agent-stats",
            get(handlers::workspace_agent_report_stats),
        )
        .route("/api/v2/turn", get(handlers::workspace_agent_turn))
        // Client-facing routes
        .route(
            "/api/v2/workspaceagents/{id}",
            get(handlers::workspace_agent),
        )
        .route(
            "/api/v2/workspaceagents/{id}/dial",
            get(handlers::workspace_agent_dial),
        )
        .route(
            "/api/v2/workspaceagents/{id}/pty",
            get(handlers::workspace_agent_pty),
        )
        .route(
            "/api/v2/workspaceagents/{id}/node",
            post(handlers::post_workspace_agent_node),
        )
        .route("/api/v2/metrics/daus", get(handlers::daus))
        .fallback(handlers::not_found)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Serve the API on `listener` until `shutdown` fires
pub async fn serve(
    listener: TcpListener,
    state: ServerState,
    shutdown: CancellationToken,
) -> Result<(), anyhow::Error> {
    info!("Starting API server on {}", listener.local_addr()?);

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<ConnectionAddrs>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await
    .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    Ok(())
}
