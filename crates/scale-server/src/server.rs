use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use scale_core::{ClientId, DEFAULT_CAPACITY, DEFAULT_REPLAY_LIMIT};
use scale_store::{HistoryStore, DEFAULT_HISTORY_FILE};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::client::{self, ConnectionSettings};
use crate::relay::{self, Relay, RelayConfig, RelayEvent, RelayStats, DEFAULT_FLUSH_EVERY};

/// WebSocket route.
pub const WS_PATH: &str = "/ws";

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub history_path: PathBuf,
    pub history_capacity: usize,
    pub replay_limit: usize,
    pub flush_every: usize,
    pub max_send_queue: usize,
    pub heartbeat_interval: Duration,
    /// Capacity of the channel feeding the relay task.
    pub event_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            history_path: PathBuf::from(DEFAULT_HISTORY_FILE),
            history_capacity: DEFAULT_CAPACITY,
            replay_limit: DEFAULT_REPLAY_LIMIT,
            flush_every: DEFAULT_FLUSH_EVERY,
            max_send_queue: 256,
            heartbeat_interval: Duration::from_secs(30),
            event_queue: 1024,
        }
    }
}

impl ServerConfig {
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            history_capacity: self.history_capacity,
            replay_limit: self.replay_limit,
            flush_every: self.flush_every,
        }
    }

    fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            max_send_queue: self.max_send_queue,
            heartbeat_interval: self.heartbeat_interval,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub relay: mpsc::Sender<RelayEvent>,
    pub connection: ConnectionSettings,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(WS_PATH, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Load history, bind the listener and start serving.
///
/// A bind failure is returned to the caller; nothing is left running.
pub async fn start<S>(config: ServerConfig, store: S) -> Result<ServerHandle, std::io::Error>
where
    S: HistoryStore + 'static,
{
    let relay = Relay::load(store, &config.relay_config());

    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    let local_addr = listener.local_addr()?;

    let (event_tx, event_rx) = mpsc::channel::<RelayEvent>(config.event_queue.max(1));
    let relay_shutdown = CancellationToken::new();
    let relay_task = tokio::spawn(relay.run(event_rx, relay_shutdown.clone()));

    let router = build_router(AppState {
        relay: event_tx.clone(),
        connection: config.connection_settings(),
    });

    let stop_serving = CancellationToken::new();
    let serve_stop = stop_serving.clone();
    let server_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(serve_stop.cancelled_owned())
            .await
        {
            tracing::error!(error = %e, "server error");
        }
    });

    tracing::info!(addr = %local_addr, path = WS_PATH, "scale relay listening");

    Ok(ServerHandle {
        addr: local_addr,
        events: event_tx,
        relay_shutdown,
        stop_serving,
        relay_task,
        server_task,
    })
}

/// Handle returned by `start()`; keeps background tasks alive.
pub struct ServerHandle {
    addr: SocketAddr,
    events: mpsc::Sender<RelayEvent>,
    relay_shutdown: CancellationToken,
    stop_serving: CancellationToken,
    relay_task: JoinHandle<RelayStats>,
    server_task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Current relay counters, `None` if the relay has stopped.
    pub async fn stats(&self) -> Option<RelayStats> {
        relay::request_stats(&self.events).await
    }

    /// Stop the relay (which writes the final snapshot), then release
    /// the listener. Returns the relay's last counters.
    pub async fn shutdown(self) -> Result<RelayStats, tokio::task::JoinError> {
        self.relay_shutdown.cancel();
        let stats = self.relay_task.await?;

        self.stop_serving.cancel();
        // Open sockets keep graceful shutdown waiting; they get a short grace period.
        let server_task = self.server_task;
        if tokio::time::timeout(Duration::from_secs(5), server_task).await.is_err() {
            tracing::warn!("listener did not stop within 5s");
        }
        Ok(stats)
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        client::handle_ws_connection(socket, ClientId::new(), state.relay, state.connection)
    })
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    match relay::request_stats(&state.relay).await {
        Some(stats) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "healthy",
                "connections": stats.connections,
                "history": stats.history,
                "readings": stats.readings,
                "saves": stats.saves,
                "saveFailures": stats.save_failures,
            })),
        ),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "stopping" })),
        ),
    }
}

/// Resolve on Ctrl-C, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl+c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
