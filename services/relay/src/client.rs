//! A single WebSocket peer.
//!
//! Each connection runs three tasks over a split socket: a reader feeding the
//! core's local queue, a writer draining the bounded outbound buffer, and a
//! heartbeat pinging the peer. Termination is arbitrated once through a
//! compare-and-swap on the terminated flag; the winner signals quit and emits
//! the connection's single unregister event.

use crate::metrics;
use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, interval, timeout};
use tracing::{debug, warn};
use uuid::Uuid;
use wc_protocol::SocketMessage;

/// Outbound buffer depth. Enqueue past this drops the message.
pub const SEND_BUFFER_CAPACITY: usize = 8;

const PING_WRITE_DEADLINE: Duration = Duration::from_secs(5);

/// What a connection has identified itself as, learned from the `role`
/// field of its messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    Dapp,
    Wallet,
    #[default]
    Unknown,
}

impl Role {
    fn parse(role: &str) -> Role {
        match role.to_ascii_lowercase().as_str() {
            wc_protocol::role::DAPP => Role::Dapp,
            wc_protocol::role::WALLET => Role::Wallet,
            _ => Role::Unknown,
        }
    }
}

/// Why a connection went away. Carried on the unregister event and logged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    HeartbeatFail,
    PeerClosed,
    Read(String),
    Write(String),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::HeartbeatFail => write!(f, "heartbeat fail"),
            DisconnectReason::PeerClosed => write!(f, "peer closed connection"),
            DisconnectReason::Read(e) => write!(f, "read error: {e}"),
            DisconnectReason::Write(e) => write!(f, "write error: {e}"),
        }
    }
}

/// The one lifecycle-ending event a connection emits.
#[derive(Debug)]
pub struct UnregisterEvent {
    pub id: Uuid,
    pub reason: DisconnectReason,
}

/// A local inbound message stamped with the connection it arrived on.
pub struct InboundMessage {
    pub client: Arc<Client>,
    pub message: SocketMessage,
}

pub struct Client {
    /// Random identifier, only for logs and index keys.
    pub id: Uuid,
    role: RwLock<Role>,
    sendbuf: mpsc::Sender<SocketMessage>,
    quit: watch::Sender<bool>,
    terminated: AtomicBool,
    pong_seen: AtomicBool,
    unregister_tx: mpsc::Sender<UnregisterEvent>,
}

impl Client {
    pub fn new(
        sendbuf: mpsc::Sender<SocketMessage>,
        unregister_tx: mpsc::Sender<UnregisterEvent>,
    ) -> Client {
        let (quit, _) = watch::channel(false);
        Client {
            id: Uuid::new_v4(),
            role: RwLock::new(Role::Unknown),
            sendbuf,
            quit,
            terminated: AtomicBool::new(false),
            // Grace for the first heartbeat interval.
            pong_seen: AtomicBool::new(true),
            unregister_tx,
        }
    }

    pub fn role(&self) -> Role {
        *self.role.read().unwrap()
    }

    /// Record the role carried in a message; empty role fields leave the
    /// current role untouched.
    pub fn record_role(&self, role: &str) {
        if !role.is_empty() {
            *self.role.write().unwrap() = Role::parse(role);
        }
    }

    /// Non-blocking enqueue onto the outbound buffer. A full buffer drops
    /// the message so a slow peer cannot stall the caller.
    pub fn send(&self, message: SocketMessage) {
        match self.sendbuf.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                let queued = self.sendbuf.max_capacity() - self.sendbuf.capacity();
                metrics::inc_send_blocking(queued);
                warn!(client = %self.id, sendbuflen = queued, "send buffer full, message dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(client = %self.id, "send after writer exit");
            }
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    fn quit_signal(&self) -> watch::Receiver<bool> {
        self.quit.subscribe()
    }

    fn record_pong(&self) {
        self.pong_seen.store(true, Ordering::SeqCst);
    }

    fn take_pong(&self) -> bool {
        self.pong_seen.swap(false, Ordering::SeqCst)
    }

    /// Tear the connection down. Idempotent: only the first caller signals
    /// quit and emits the unregister event.
    pub fn terminate(&self, reason: DisconnectReason) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.quit.send(true);
        let event = UnregisterEvent {
            id: self.id,
            reason,
        };
        if let Err(mpsc::error::TrySendError::Full(event)) = self.unregister_tx.try_send(event) {
            let tx = self.unregister_tx.clone();
            tokio::spawn(async move {
                let _ = tx.send(event).await;
            });
        }
    }
}

/// Start the reader, writer and heartbeat tasks for a freshly upgraded
/// socket.
pub fn spawn_io(
    client: Arc<Client>,
    socket: WebSocket,
    sendbuf_rx: mpsc::Receiver<SocketMessage>,
    local_tx: mpsc::Sender<InboundMessage>,
    heartbeat_interval: Duration,
) {
    let (sink, stream) = socket.split();
    let (ping_tx, ping_rx) = mpsc::channel(1);

    tokio::spawn(read_loop(client.clone(), stream, local_tx));
    tokio::spawn(write_loop(client.clone(), sink, sendbuf_rx, ping_rx));
    tokio::spawn(heartbeat_loop(client, ping_tx, heartbeat_interval));
}

async fn read_loop(
    client: Arc<Client>,
    mut stream: SplitStream<WebSocket>,
    local_tx: mpsc::Sender<InboundMessage>,
) {
    let mut quit = client.quit_signal();
    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let message: SocketMessage = match serde_json::from_str(&text) {
                        Ok(message) => message,
                        Err(e) => {
                            warn!(client = %client.id, error = %e, raw = %text.as_str(), "malformed text message");
                            continue;
                        }
                    };
                    client.record_role(&message.role);
                    if local_tx
                        .send(InboundMessage { client: client.clone(), message })
                        .await
                        .is_err()
                    {
                        client.terminate(DisconnectReason::Read("relay core gone".to_owned()));
                        return;
                    }
                }
                Some(Ok(Message::Pong(_))) => client.record_pong(),
                Some(Ok(Message::Close(_))) | None => {
                    client.terminate(DisconnectReason::PeerClosed);
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    client.terminate(DisconnectReason::Read(e.to_string()));
                    return;
                }
            },
            _ = quit.changed() => return,
        }
    }
}

async fn write_loop(
    client: Arc<Client>,
    mut sink: SplitSink<WebSocket, Message>,
    mut sendbuf_rx: mpsc::Receiver<SocketMessage>,
    mut ping_rx: mpsc::Receiver<()>,
) {
    let mut quit = client.quit_signal();
    loop {
        tokio::select! {
            message = sendbuf_rx.recv() => {
                let Some(message) = message else { return };
                let json = match serde_json::to_string(&message) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(client = %client.id, error = %e, "unencodable outbound message");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(json.into())).await {
                    client.terminate(DisconnectReason::Write(e.to_string()));
                    return;
                }
            }
            Some(()) = ping_rx.recv() => {
                let ping = sink.send(Message::Ping(Bytes::new()));
                match timeout(PING_WRITE_DEADLINE, ping).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        client.terminate(DisconnectReason::Write(e.to_string()));
                        return;
                    }
                    Err(_) => {
                        client.terminate(DisconnectReason::Write("ping write timed out".to_owned()));
                        return;
                    }
                }
            }
            _ = quit.changed() => {
                let _ = sink.send(Message::Close(None)).await;
                return;
            }
        }
    }
}

async fn heartbeat_loop(client: Arc<Client>, ping_tx: mpsc::Sender<()>, period: Duration) {
    let mut quit = client.quit_signal();
    let mut ticker = interval(period);
    ticker.tick().await;
    let mut missed = 0u32;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if client.take_pong() {
                    missed = 0;
                } else {
                    missed += 1;
                    if missed >= 2 {
                        client.terminate(DisconnectReason::HeartbeatFail);
                        return;
                    }
                }
                // Skipped when the writer still has the previous ping queued.
                if let Err(mpsc::error::TrySendError::Closed(())) = ping_tx.try_send(()) {
                    return;
                }
            }
            _ = quit.changed() => return,
        }
    }
}

#[cfg(test)]
pub(crate) fn test_client() -> (Arc<Client>, mpsc::Receiver<SocketMessage>) {
    let (sendbuf_tx, sendbuf_rx) = mpsc::channel(SEND_BUFFER_CAPACITY);
    let (unregister_tx, _) = mpsc::channel(16);
    (Arc::new(Client::new(sendbuf_tx, unregister_tx)), sendbuf_rx)
}
