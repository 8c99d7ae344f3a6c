pub mod bus;
pub mod client;
pub mod config;
pub mod handlers;
pub mod metrics;
pub mod pending;
pub mod server;
pub mod topics;
pub mod ws;

pub use server::{RelayState, WsServer};

use axum::Router;
use axum::routing::get;
use std::sync::Arc;

/// The relay listener: WebSocket upgrades on `/` and a liveness probe.
pub fn build_router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/", get(ws::ws_handler))
        .route("/ping", get(ping))
        .with_state(state)
}

/// The metrics listener.
pub fn build_metrics_router() -> Router {
    Router::new().route("/metrics", get(metrics::metrics_handler))
}

async fn ping() -> &'static str {
    "pong"
}
