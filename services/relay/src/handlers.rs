//! Publish, subscribe and expiry handling.
//!
//! These run off the core event loop: publish and subscribe touch the
//! external store, so the core spawns one short-lived task per request. The
//! sweeper is a single periodic task. None of them touch the topic indices.

use crate::client::{Client, Role};
use crate::metrics;
use crate::server::RelayState;
use std::sync::Arc;
use tokio::time::{Duration, Instant, interval};
use tracing::{debug, warn};
use wc_protocol::{
    MessageType, SocketMessage, cached_messages_key, dapp_notify_channel, message_channel, phase,
    role,
};

/// Reply to an application-layer ping.
pub fn pong_reply() -> SocketMessage {
    SocketMessage {
        role: role::RELAY.to_owned(),
        ..SocketMessage::of_kind(MessageType::Pong)
    }
}

/// Handle a local `pub`: fan out through the bus, or cache for whoever
/// subscribes later.
pub async fn publish_message(state: Arc<RelayState>, message: SocketMessage, publisher: Arc<Client>) {
    let topic = message.topic.clone();

    if message.role == role::DAPP {
        // The dapp-notify channel carries the wallet-presence events this
        // dapp will want from now on.
        if let Err(e) = state.bus.subscribe(&dapp_notify_channel(&topic)).await {
            warn!(topic = %topic, error = %e, "dapp notify subscribe failed");
        }
        if message.phase == phase::SESSION_START {
            // The dapp is only announcing that the handshake went through;
            // nothing to fan out.
            metrics::inc_established_sessions();
            state.pending.lock().unwrap().delete_by_topic(&topic);
            return;
        }
    }

    metrics::inc_total_messages();
    let payload = match serde_json::to_string(&message) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(topic = %topic, error = %e, "unencodable publish");
            return;
        }
    };

    match state.bus.publish(&message_channel(&topic), payload.clone()).await {
        Ok(receivers) if receivers >= 1 => {
            debug!(client = %publisher.id, topic = %topic, receivers, "message published");
            if publisher.role() == Role::Dapp {
                // Delivery confirmation so the dapp is not left waiting for
                // a wallet that will only ack at the application layer.
                publisher.send(SocketMessage {
                    topic: topic.clone(),
                    role: role::WALLET.to_owned(),
                    ..SocketMessage::of_kind(MessageType::Ack)
                });
            }
        }
        Ok(_) => {
            debug!(client = %publisher.id, topic = %topic, "no receiver, cache message");
            metrics::inc_cached_messages();
            if message.phase == phase::SESSION_REQUEST {
                metrics::inc_new_requested_sessions();
                let expires_at =
                    Instant::now() + Duration::from_secs(state.cfg.pending_session_cache_time);
                state
                    .pending
                    .lock()
                    .unwrap()
                    .insert(&topic, expires_at, publisher.clone());
            }
            if let Err(e) = state
                .bus
                .cache_push(
                    &cached_messages_key(&topic),
                    payload,
                    state.cfg.message_cache_time,
                )
                .await
            {
                warn!(topic = %topic, error = %e, "cache message failed");
            }
        }
        Err(e) => warn!(topic = %topic, error = %e, "bus publish failed"),
    }
}

/// Handle a local `sub`: join the topic's bus channel and replay anything
/// that was published while nobody listened.
pub async fn subscribe_topic(state: Arc<RelayState>, message: SocketMessage, subscriber: Arc<Client>) {
    let topic = message.topic.clone();

    if let Err(e) = state.bus.subscribe(&message_channel(&topic)).await {
        warn!(topic = %topic, client = %subscriber.id, error = %e, "subscribe to topic failed");
    }
    debug!(topic = %topic, client = %subscriber.id, "subscribed to topic");

    let cached = drain_cached_messages(&state, &topic).await;
    debug!(topic = %topic, client = %subscriber.id, pending = cached.len(), "cached messages drained");
    for message in &cached {
        subscriber.send(message.clone());
    }

    if message.role == role::DAPP {
        return;
    }

    // A wallet subscribing either just scanned the QR code (drained session
    // requests) or woke up from hibernation; its dapp wants to know both.
    for cached in &cached {
        if cached.phase == phase::SESSION_REQUEST {
            metrics::inc_received_sessions();
            debug!(topic = %cached.topic, client = %subscriber.id, "session request picked up");
            publish_dapp_notice(
                &state,
                &cached.topic,
                SocketMessage {
                    topic: cached.topic.clone(),
                    role: role::RELAY.to_owned(),
                    phase: phase::SESSION_RECEIVED.to_owned(),
                    ..SocketMessage::of_kind(MessageType::Ack)
                },
            )
            .await;
        }
    }
    publish_dapp_notice(
        &state,
        &topic,
        SocketMessage {
            topic: topic.clone(),
            role: role::RELAY.to_owned(),
            phase: phase::SESSION_RESUMED.to_owned(),
            ..SocketMessage::of_kind(MessageType::Pub)
        },
    )
    .await;
}

async fn drain_cached_messages(state: &RelayState, topic: &str) -> Vec<SocketMessage> {
    let raw = match state.bus.cache_drain(&cached_messages_key(topic)).await {
        Ok(raw) => raw,
        Err(e) => {
            warn!(topic = %topic, error = %e, "cache drain failed");
            return Vec::new();
        }
    };
    let mut messages = Vec::with_capacity(raw.len());
    for entry in raw {
        match serde_json::from_str::<SocketMessage>(&entry) {
            Ok(message) => messages.push(message),
            Err(e) => warn!(topic = %topic, error = %e, "malformed cached message skipped"),
        }
    }
    if !messages.is_empty() {
        metrics::inc_uncached_messages();
    }
    messages
}

async fn publish_dapp_notice(state: &RelayState, topic: &str, notice: SocketMessage) {
    let payload = match serde_json::to_string(&notice) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(topic = %topic, error = %e, "unencodable dapp notice");
            return;
        }
    };
    if let Err(e) = state.bus.publish(&dapp_notify_channel(topic), payload).await {
        warn!(topic = %topic, error = %e, "dapp notice publish failed");
    }
}

/// Periodically expire session requests no wallet ever answered.
pub async fn run_expiry_sweeper(state: Arc<RelayState>) {
    let mut ticker = interval(Duration::from_secs(state.cfg.check_session_expire_interval));
    ticker.tick().await;
    loop {
        ticker.tick().await;
        sweep_expired(&state);
    }
}

/// One sweep pass. Returns how many sessions expired.
pub fn sweep_expired(state: &RelayState) -> usize {
    let expired = state.pending.lock().unwrap().pop_expired(Instant::now());
    let count = expired.len();
    for session in expired {
        metrics::inc_expired_sessions();
        debug!(topic = %session.topic, client = %session.dapp.id, "pending session expired");
        if session.dapp.is_terminated() {
            continue;
        }
        session.dapp.send(SocketMessage {
            topic: session.topic.clone(),
            role: role::RELAY.to_owned(),
            phase: phase::SESSION_EXPIRED.to_owned(),
            ..SocketMessage::of_kind(MessageType::Pub)
        });
    }
    count
}
