use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, State},
    response::Response,
};
use std::net::SocketAddr;

use crate::state::AppState;
use crate::ws::actor;

/// GET /ws (and GET / on the device port)
/// WebSocket upgrade endpoint for devices. No authentication: a device
/// identifies itself by sending its MAC address after the upgrade.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    tracing::debug!(peer = %peer, "WebSocket upgrade requested");
    ws.on_upgrade(move |socket| actor::run_connection(socket, state, peer))
}
