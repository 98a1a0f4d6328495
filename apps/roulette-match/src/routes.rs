use std::sync::Arc;

use axum::{
    extract::{State, WebSocketUpgrade},
    http::header,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::server::MatchServer;

pub fn build_router(server: Arc<MatchServer>) -> Router {
    Router::new()
        .route("/", get(status))
        .route("/ws", get(websocket_handler))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(server)
}

async fn status() -> impl IntoResponse {
    let body = json!({
        "app": "roulette",
        "service": "matchmaker",
        "version": env!("CARGO_PKG_VERSION"),
        "info": "Pairs strangers for terminal video chat",
        "description": "This is the WebRTC signaling server for terminal roulette.",
    });
    (
        [(header::CONTENT_TYPE, "application/json")],
        serde_json::to_string_pretty(&body).unwrap_or_default(),
    )
}

async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(server): State<Arc<MatchServer>>,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        server.admit(socket);
    })
}

async fn metrics(State(server): State<Arc<MatchServer>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        server.metrics().render(),
    )
}
