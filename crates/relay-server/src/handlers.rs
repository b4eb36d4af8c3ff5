//! HTTP and WebSocket handlers for the relay server.
//!
//! This module wires the hub into axum: the upgrade endpoint, the health
//! check, static assets and graceful shutdown.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use relay_core::{Hub, HubError};
use relay_transport::{Connection, WebSocketConnection};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The connection hub.
    pub hub: Arc<Hub>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create the app state and start the hub's dispatch loop.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn new(config: Config) -> (Arc<Self>, JoinHandle<()>) {
        let (hub, dispatch) = Hub::start(config.hub_config());
        (Arc::new(Self { hub, config }), dispatch)
    }
}

/// Run the HTTP/WebSocket server until Ctrl-C or SIGTERM.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let addr = config.bind_addr()?;
    let (state, dispatch) = AppState::new(config.clone());

    // Start metrics server if enabled
    if config.metrics.enabled {
        let metrics_addr = SocketAddr::new(addr.ip(), config.metrics.port);
        match metrics::start_metrics_server(metrics_addr) {
            Ok(()) => {
                metrics::init_metrics();
                metrics::spawn_stats_reporter(
                    Arc::clone(&state.hub),
                    Duration::from_millis(config.metrics.report_interval_ms),
                );
            }
            Err(e) => error!(error = %e, "Metrics disabled"),
        }
    }

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("Relay server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    let hub = Arc::clone(&state.hub);
    tokio::spawn(async move {
        shutdown_signal().await;
        hub.shutdown();
    });

    serve(listener, state).await?;

    if let Err(e) = dispatch.await {
        error!(error = %e, "Dispatch loop failed");
    }
    info!("Relay server stopped");

    Ok(())
}

/// Serve the app on an already bound listener until the hub shuts down.
///
/// # Errors
///
/// Returns an error if the listener fails.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<()> {
    let hub = Arc::clone(&state.hub);
    let app = build_app(state);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { hub.wait_for_shutdown().await })
    .await?;

    Ok(())
}

/// Build the router: upgrade endpoint, health check and static assets.
pub fn build_app(state: Arc<AppState>) -> Router {
    let mut app = Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler));

    if state.config.static_files.enabled {
        app = app.fallback_service(ServeDir::new(&state.config.static_files.dir));
    }

    app.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Wait for Ctrl-C or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
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
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("Received shutdown signal");
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let status = if state.hub.is_shutdown() {
        "shutting_down"
    } else {
        "ok"
    };
    axum::Json(serde_json::json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "connections": state.hub.connection_count(),
    }))
}

/// WebSocket upgrade handler.
///
/// Rejections apply to this request only.
async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> Response {
    if state.hub.is_shutdown() {
        return (StatusCode::SERVICE_UNAVAILABLE, "Server is shutting down").into_response();
    }

    let max_connections = state.config.limits.max_connections;
    if state.hub.connection_count() >= max_connections {
        warn!(remote = %addr, max_connections, "Connection limit reached");
        metrics::record_error("connection_limit");
        return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
    }

    ws.max_message_size(state.config.limits.max_message_size)
        .on_failed_upgrade(move |e| {
            warn!(remote = %addr, error = %e, "WebSocket upgrade failed");
            metrics::record_error("upgrade");
        })
        .on_upgrade(move |socket| handle_websocket(socket, addr, state))
}

/// Hand an upgraded socket to the hub and wait for it to terminate.
async fn handle_websocket(socket: WebSocket, addr: SocketAddr, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let connection = WebSocketConnection::new(socket)
        .with_remote_addr(addr)
        .with_max_message_size(state.config.limits.max_message_size);
    let connection_id = connection.id().clone();

    debug!(connection = %connection_id, remote = %addr, "WebSocket connected");

    match state.hub.run_connection(Box::new(connection)).await {
        Ok(reason) => {
            metrics::record_close_reason(reason);
            debug!(connection = %connection_id, reason = reason.as_str(), "WebSocket disconnected");
        }
        Err(HubError::ShuttingDown) => {
            debug!(connection = %connection_id, "Rejected, hub shutting down");
        }
        Err(e @ HubError::DuplicateConnection(_)) => {
            warn!(connection = %connection_id, error = %e, "Rejected");
            metrics::record_error("duplicate_connection");
        }
    }
}
