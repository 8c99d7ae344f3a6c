//! Prometheus metrics, namespace `wc`, subsystem `relay`.
//!
//! Counters self-register in the default registry on first use;
//! `register_all` touches every one at boot so `/metrics` exposes the full
//! family from the start.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    IntCounter, IntCounterVec, IntGauge, Opts, TextEncoder, register_int_counter,
    register_int_counter_vec, register_int_gauge,
};
use std::sync::LazyLock;

fn opts(name: &str, help: &str) -> Opts {
    Opts::new(name, help).namespace("wc").subsystem("relay")
}

// ---------------------------------------------------------------------------
// Connections
// ---------------------------------------------------------------------------

static NEW_CONNECTIONS: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(opts("new_connections", "Number of new connections"))
        .expect("register new_connections")
});

static CLOSED_CONNECTIONS: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(opts("closed_connections", "Number of closed connections"))
        .expect("register closed_connections")
});

static CURRENT_CONNECTIONS: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge!(opts("current_connections", "Number of current connections"))
        .expect("register current_connections")
});

static SEND_BLOCKINGS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        opts("send_blockings", "Number of messages dropped on a full send buffer"),
        &["sendbuflen"]
    )
    .expect("register send_blockings")
});

pub fn inc_new_connection() {
    NEW_CONNECTIONS.inc();
}

pub fn inc_closed_connection() {
    CLOSED_CONNECTIONS.inc();
}

pub fn set_current_connections(num: i64) {
    CURRENT_CONNECTIONS.set(num);
}

pub fn inc_send_blocking(sendbuf_len: usize) {
    SEND_BLOCKINGS
        .with_label_values(&[sendbuf_len.to_string().as_str()])
        .inc();
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

// total messages = directly forwarded messages + cached messages
static TOTAL_MESSAGES: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(opts("total_messages", "Number of total messages"))
        .expect("register total_messages")
});

static CACHED_MESSAGES: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(opts("new_cached_messages", "Number of new cached messages"))
        .expect("register new_cached_messages")
});

static UNCACHED_MESSAGES: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(opts("new_uncached_messages", "Number of cached messages consumed"))
        .expect("register new_uncached_messages")
});

static MESSAGES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(opts("messages", "Number of messages"), &["phase"])
        .expect("register messages")
});

pub fn inc_total_messages() {
    TOTAL_MESSAGES.inc();
    MESSAGES.with_label_values(&["total"]).inc();
}

pub fn inc_cached_messages() {
    CACHED_MESSAGES.inc();
    MESSAGES.with_label_values(&["pending"]).inc();
}

pub fn inc_uncached_messages() {
    UNCACHED_MESSAGES.inc();
    MESSAGES.with_label_values(&["delay_delivered"]).inc();
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

static SESSIONS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(opts("sessions", "Number of sessions by phase"), &["phase"])
        .expect("register sessions")
});

static NEW_REQUESTED_SESSIONS: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(opts("new_sessions", "Number of new pending sessions"))
        .expect("register new_sessions")
});

static RECEIVED_SESSIONS: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(opts("received_sessions", "Number of received sessions"))
        .expect("register received_sessions")
});

static ESTABLISHED_SESSIONS: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(opts("established_sessions", "Number of established sessions"))
        .expect("register established_sessions")
});

static EXPIRED_SESSIONS: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(opts("expired_sessions", "Number of expired sessions"))
        .expect("register expired_sessions")
});

pub fn inc_new_requested_sessions() {
    NEW_REQUESTED_SESSIONS.inc();
    SESSIONS.with_label_values(&["new"]).inc();
}

pub fn inc_received_sessions() {
    RECEIVED_SESSIONS.inc();
    SESSIONS.with_label_values(&["received"]).inc();
}

pub fn inc_established_sessions() {
    ESTABLISHED_SESSIONS.inc();
    SESSIONS.with_label_values(&["established"]).inc();
}

pub fn inc_expired_sessions() {
    EXPIRED_SESSIONS.inc();
    SESSIONS.with_label_values(&["expired"]).inc();
}

// ---------------------------------------------------------------------------
// Test observation and exposition
// ---------------------------------------------------------------------------

pub fn send_blocking_total(sendbuf_len: usize) -> u64 {
    SEND_BLOCKINGS
        .with_label_values(&[sendbuf_len.to_string().as_str()])
        .get()
}

pub fn received_sessions_total() -> u64 {
    RECEIVED_SESSIONS.get()
}

pub fn expired_sessions_total() -> u64 {
    EXPIRED_SESSIONS.get()
}

pub fn established_sessions_total() -> u64 {
    ESTABLISHED_SESSIONS.get()
}

/// Force registration of the whole metric family.
pub fn register_all() {
    let _ = NEW_CONNECTIONS.get();
    let _ = CLOSED_CONNECTIONS.get();
    let _ = CURRENT_CONNECTIONS.get();
    let _ = SEND_BLOCKINGS.with_label_values(&["8"]);
    let _ = TOTAL_MESSAGES.get();
    let _ = CACHED_MESSAGES.get();
    let _ = UNCACHED_MESSAGES.get();
    let _ = MESSAGES.with_label_values(&["total"]);
    let _ = SESSIONS.with_label_values(&["new"]);
    let _ = NEW_REQUESTED_SESSIONS.get();
    let _ = RECEIVED_SESSIONS.get();
    let _ = ESTABLISHED_SESSIONS.get();
    let _ = EXPIRED_SESSIONS.get();
}

/// `GET /metrics` on the metrics listener.
pub async fn metrics_handler() -> impl IntoResponse {
    let families = prometheus::gather();
    let mut body = String::new();
    match TextEncoder::new().encode_utf8(&families, &mut body) {
        Ok(()) => (StatusCode::OK, body).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}
