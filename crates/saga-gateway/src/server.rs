use std::net::SocketAddr;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::bus::LocalBus;
use crate::gateway::Gateway;
use crate::socket::handle_socket;

/// Origin used when the upgrade request carries no `Origin` header.
pub const UNKNOWN_ORIGIN: &str = "unknown";

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Gateway,
    pub bus: LocalBus,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/metrics", get(metrics_handler))
        .route("/metrics/ops", get(ops_metrics_handler))
        .route("/health", get(health_handler))
        .route("/bus/publish", post(publish_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Bind the configured address and serve until `shutdown` is cancelled.
pub async fn listen(
    gateway: Gateway,
    bus: LocalBus,
    shutdown: CancellationToken,
) -> Result<ServerHandle, std::io::Error> {
    let addr = gateway.config().bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    let router = build_router(AppState { gateway, bus });
    tracing::info!(addr = %local_addr, "saga gateway listening");

    let token = shutdown.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "http server failed");
        }
    });

    Ok(ServerHandle {
        addr: local_addr,
        server,
        shutdown,
    })
}

/// Handle returned by [`listen`].
pub struct ServerHandle {
    pub addr: SocketAddr,
    server: JoinHandle<()>,
    shutdown: CancellationToken,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Ask the HTTP server to stop accepting connections.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn into_task(self) -> JoinHandle<()> {
        self.server
    }
}

/// WebSocket upgrade handler. Admission runs on the upgraded socket.
async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let origin = origin_of(&headers);
    let gateway = state.gateway;
    ws.on_upgrade(move |socket| handle_socket(socket, gateway, origin))
}

fn origin_of(headers: &HeaderMap) -> String {
    headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(UNKNOWN_ORIGIN)
        .to_string()
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.gateway.snapshot())
}

async fn ops_metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.gateway.recorder().snapshot())
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let draining = state.gateway.registry().is_draining();
    let status = if draining {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    let body = json!({
        "status": if draining { "draining" } else { "ok" },
        "uptimeSecs": state.gateway.uptime().as_secs(),
        "connections": state.gateway.registry().connection_count(),
    });
    (status, Json(body))
}

/// Publish one raw envelope to the local bus. Validation happens in the relay.
async fn publish_handler(State(state): State<AppState>, body: String) -> impl IntoResponse {
    let receivers = state.bus.publish_raw(&body);
    tracing::debug!(bytes = body.len(), receivers, "bus payload ingested");
    (StatusCode::ACCEPTED, Json(json!({ "receivers": receivers })))
}
