#![forbid(unsafe_code)]

// Signaling surface: the /ws endpoint that carries the JSON protocol, plus
// /health and /metrics for operators.

pub mod connection;
pub mod dispatcher;
pub mod protocol;

use crate::config::ServerConfig;
use crate::room::RoomRegistry;
use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use dispatcher::{validate_id, SignalingDispatcher};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

/// Largest inbound WebSocket frame
const MAX_MESSAGE_SIZE: usize = 65_536;

/// Shared state of the HTTP side. Cheap to clone; one copy per request.
#[derive(Clone)]
pub struct SignalingServer {
    dispatcher: SignalingDispatcher,
    connection_semaphore: Arc<Semaphore>,
    idle_timeout: Duration,
    metrics_token: Option<Arc<str>>,
}

/// Query string of `GET /ws`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    #[serde(default)]
    pub room_id: String,
    #[serde(default)]
    pub peer_id: String,
}

impl SignalingServer {
    pub fn new(registry: RoomRegistry, config: &ServerConfig) -> Self {
        info!("Max connections: {}", config.max_connections);
        if config.metrics_token.is_none() {
            info!("METRICS_TOKEN not set, /metrics is unauthenticated");
        }
        Self {
            dispatcher: SignalingDispatcher::new(registry),
            connection_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            idle_timeout: config.idle_timeout,
            metrics_token: config.metrics_token.as_deref().map(Arc::from),
        }
    }

    pub fn registry(&self) -> &RoomRegistry {
        self.dispatcher.registry()
    }

    /// `/ws`, `/health` and `/metrics`, with permissive CORS
    pub fn router(self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(self)
            .layer(CorsLayer::permissive())
    }

    /// Binds all interfaces on `port` and serves until the listener fails
    pub async fn serve(self, port: u16) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
        info!("Signaling listening on {}", listener.local_addr()?);
        axum::serve(listener, self.router()).await?;

        Ok(())
    }
}

/// Liveness plus room and peer gauges
async fn health_handler(State(server): State<SignalingServer>) -> Json<serde_json::Value> {
    let gauges = server.registry().gauges().await;
    Json(serde_json::json!({
        "status": "ok",
        "rooms": gauges.rooms,
        "peers": gauges.peers,
        "disconnectedPeers": gauges.disconnected_peers,
    }))
}

/// Prometheus text format. Requires `Authorization: Bearer <METRICS_TOKEN>` when a token is configured.
async fn metrics_handler(State(server): State<SignalingServer>, headers: HeaderMap) -> Response {
    if let Some(expected) = server.metrics_token.as_deref() {
        let authorized = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .is_some_and(|token| token == expected);
        if !authorized {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    let registry = server.registry();
    let gauges = registry.gauges().await;
    let body = registry.services().metrics.render_prometheus(gauges);
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}

/// Validates the ids, takes a connection slot and hands the socket to the connection task
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(server): State<SignalingServer>,
) -> Response {
    if let Err(e) = validate_id("roomId", &params.room_id).and_then(|_| validate_id("peerId", &params.peer_id)) {
        return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
    }

    // Refuse rather than queue when every slot is taken
    let permit = match server.connection_semaphore.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            warn!("Refusing peer {} in room {}: connection limit reached", params.peer_id, params.room_id);
            return (StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response();
        }
    };

    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_failed_upgrade(|error| {
            warn!("Upgrade to WebSocket failed: {}", error);
        })
        .on_upgrade(move |socket| {
            connection::handle_connection(
                socket,
                server.dispatcher,
                params.room_id,
                params.peer_id,
                server.idle_timeout,
                permit,
            )
        })
}
