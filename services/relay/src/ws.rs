//! WebSocket upgrade frontend.
//!
//! Accepts the upgrade on `GET /`, mints a client and hands it to the core
//! as a registration; the connection's own tasks take it from there.

use crate::client::{self, Client, SEND_BUFFER_CAPACITY};
use crate::server::RelayState;
use axum::extract::State;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::debug;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
) -> Response {
    if !origin_allowed(
        &state.cfg.allowed_origins,
        headers.get(header::ORIGIN),
    ) {
        return StatusCode::FORBIDDEN.into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state))
        .into_response()
}

/// Browser origin policy. A missing Origin header is allowed; wallets are
/// native apps and send none.
fn origin_allowed(allowed: &[String], origin: Option<&HeaderValue>) -> bool {
    if allowed.iter().any(|entry| entry == "*") {
        return true;
    }
    match origin.and_then(|value| value.to_str().ok()) {
        Some(origin) => allowed.iter().any(|entry| entry == origin),
        None => true,
    }
}

async fn handle_socket(socket: WebSocket, state: Arc<RelayState>) {
    let (sendbuf_tx, sendbuf_rx) = mpsc::channel(SEND_BUFFER_CAPACITY);
    let client = Arc::new(Client::new(sendbuf_tx, state.unregister_tx.clone()));
    debug!(client = %client.id, "new websocket connection");
    if state.register_tx.send(client.clone()).await.is_err() {
        return;
    }
    client::spawn_io(
        client,
        socket,
        sendbuf_rx,
        state.local_tx.clone(),
        Duration::from_secs(state.cfg.heartbeat_interval),
    );
}
