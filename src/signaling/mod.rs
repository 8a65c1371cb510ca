#![forbid(unsafe_code)]

// Signaling server — WebSocket endpoint plus the ingest HTTP surface.

pub mod connection;
pub mod protocol;

use crate::config::ServerConfig;
use crate::ingest::{self, CameraPath, GatewayClient};
use crate::metrics::ServerMetrics;
use crate::room::{Rooms, SessionError};
use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

/// Shared server state.
#[derive(Clone)]
pub struct SignalingServer {
    rooms: Rooms,
    metrics: ServerMetrics,
    connection_semaphore: Arc<Semaphore>,
    gateway: Option<Arc<GatewayClient>>,
    announced_ip: IpAddr,
}

impl SignalingServer {
    pub fn new(rooms: Rooms, metrics: ServerMetrics, config: &ServerConfig) -> Self {
        info!("Max connections: {}", config.max_connections);

        let gateway = config.gateway_api_url.as_deref().and_then(|url| {
            match GatewayClient::new(url) {
                Ok(client) => Some(Arc::new(client)),
                Err(e) => {
                    warn!("Gateway client for {} unavailable: {}", url, e);
                    None
                }
            }
        });

        Self {
            rooms,
            metrics,
            connection_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            gateway,
            announced_ip: config.announced_ip,
        }
    }

    /// Builds the HTTP router.
    pub fn router(self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/ingest/create", post(ingest_create_handler))
            .route(
                "/ingest/cameras",
                post(add_camera_handler).get(list_cameras_handler),
            )
            .with_state(self)
            .layer(CorsLayer::permissive())
    }

    /// Binds and serves until the process is shut down.
    ///
    /// # Errors
    /// Returns an error if the server fails to bind to the port.
    pub async fn serve(self, port: u16) -> anyhow::Result<()> {
        let addr = format!("0.0.0.0:{port}");
        info!("Starting signaling server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        axum::serve(listener, self.router()).await?;
        Ok(())
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(server): State<SignalingServer>) -> Response {
    let permit = match server.connection_semaphore.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            warn!("Connection limit reached, rejecting WebSocket upgrade");
            return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
        }
    };

    ws.max_message_size(65_536)
        .on_failed_upgrade(|error| {
            warn!("WebSocket upgrade failed: {}", error);
        })
        .on_upgrade(move |socket| {
            connection::handle_connection(socket, server.rooms, server.metrics, permit)
        })
}

async fn health_handler(State(server): State<SignalingServer>) -> Json<serde_json::Value> {
    let rooms = server.rooms.room_count();
    let peers = server.rooms.peer_count().await;
    Json(serde_json::json!({
        "status": "ok",
        "rooms": rooms,
        "peers": peers,
    }))
}

/// Prometheus text exposition format.
async fn metrics_handler(State(server): State<SignalingServer>) -> Response {
    let rooms = server.rooms.room_count();
    let peers = server.rooms.peer_count().await;
    let body = server.metrics.render_prometheus(rooms, peers);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IngestCreateRequest {
    room_id: String,
    #[serde(default)]
    label: String,
    #[serde(default)]
    path: String,
}

/// Allocates an ingest endpoint and producer for an externally pushed RTP
/// stream. Codec-resolution failures are a 500 with an error body.
async fn ingest_create_handler(
    State(server): State<SignalingServer>,
    Json(request): Json<IngestCreateRequest>,
) -> Response {
    match ingest::create_ingest_producer(
        &server.rooms,
        server.announced_ip,
        &request.room_id,
        &request.label,
        &request.path,
    )
    .await
    {
        Ok(created) => (StatusCode::OK, Json(created)).into_response(),
        Err(e) => error_response(e),
    }
}

/// Thin proxy: push a camera path into the gateway configuration.
async fn add_camera_handler(
    State(server): State<SignalingServer>,
    Json(path): Json<CameraPath>,
) -> Response {
    let Some(gateway) = &server.gateway else {
        return gateway_unconfigured();
    };
    match gateway.add_path(&path).await {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({ "ok": true }))).into_response(),
        Err(e) => error_response(e),
    }
}

/// Thin proxy: the gateway's configured paths, verbatim.
async fn list_cameras_handler(State(server): State<SignalingServer>) -> Response {
    let Some(gateway) = &server.gateway else {
        return gateway_unconfigured();
    };
    match gateway.list_paths().await {
        Ok(paths) => (StatusCode::OK, Json(paths)).into_response(),
        Err(e) => error_response(e),
    }
}

fn gateway_unconfigured() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(serde_json::json!({ "error": "gateway not configured" })),
    )
        .into_response()
}

/// Maps session errors onto HTTP responses; gateway failures keep the
/// upstream status.
fn error_response(error: SessionError) -> Response {
    let status = match &error {
        SessionError::Gateway { status, .. } => {
            StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(serde_json::json!({ "error": error.to_string() })),
    )
        .into_response()
}
