//! Local WebSocket hub that connects an avatar front end, command clients,
//! agent hooks and editor clients.
//!
//! Every peer registers under one or more roles and then exchanges
//! envelopes through the hub, which routes them by role or client id,
//! correlates request/response pairs, suppresses repeated hook
//! notifications and attaches synthesized speech to avatar text.

pub mod config;
mod conversation;
pub mod correlator;
pub mod dedup;
mod hub;
pub mod logging;
pub mod registry;
mod router;
mod session;
pub mod tts;

pub use hub::Hub;
pub use router::RouteError;

use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Router,
};
use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;

pub fn app(hub: Arc<Hub>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(|| async { "ok" }))
        .with_state(hub)
}

/// Serves until the hub's shutdown token is cancelled.
pub async fn serve(listener: TcpListener, hub: Arc<Hub>) -> std::io::Result<()> {
    hub.start_stale_reaper();
    let shutdown = hub.shutdown_token();
    axum::serve(
        listener,
        app(hub).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(hub): State<Arc<Hub>>,
) -> impl IntoResponse {
    if !addr.ip().is_loopback() {
        return StatusCode::FORBIDDEN.into_response();
    }
    let max = hub.config().max_envelope_bytes;
    ws.max_message_size(max.saturating_mul(2))
        .on_upgrade(move |socket| session::run(hub, socket, addr))
}
