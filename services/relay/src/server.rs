//! Relay core: the single event loop that owns the client set and the topic
//! indices.
//!
//! Four queues feed the loop: registrations, unregistrations, local inbound
//! messages from the reader tasks, and remote deliveries from the bus. Each
//! event is processed to completion before the next is selected, so all index
//! mutation is serialized here. Publish and subscribe work that touches the
//! external store is spawned off the loop.

use crate::bus::{BusDelivery, MessageBus};
use crate::client::{Client, InboundMessage, Role, UnregisterEvent};
use crate::config::WsConfig;
use crate::handlers;
use crate::metrics;
use crate::pending::PendingSessionTracker;
use crate::topics::TopicClientSet;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;
use wc_protocol::{MessageType, SocketMessage, dapp_notify_channel, is_dapp_notify_channel, message_channel, phase, role};

const REGISTER_QUEUE_DEPTH: usize = 4096;
const LOCAL_QUEUE_DEPTH: usize = 1024;

/// State shared between the core loop, the connection tasks and the spawned
/// publish/subscribe/sweeper tasks.
pub struct RelayState {
    pub cfg: WsConfig,
    pub bus: Arc<dyn MessageBus>,
    pub pending: Mutex<PendingSessionTracker>,
    pub register_tx: tokio::sync::mpsc::Sender<Arc<Client>>,
    pub unregister_tx: tokio::sync::mpsc::Sender<UnregisterEvent>,
    pub local_tx: tokio::sync::mpsc::Sender<InboundMessage>,
}

struct ClientEntry {
    client: Arc<Client>,
    pub_topics: HashSet<String>,
    sub_topics: HashSet<String>,
}

pub struct WsServer {
    state: Arc<RelayState>,
    clients: HashMap<Uuid, ClientEntry>,
    publishers: TopicClientSet,
    subscribers: TopicClientSet,
    register_rx: tokio::sync::mpsc::Receiver<Arc<Client>>,
    unregister_rx: tokio::sync::mpsc::Receiver<UnregisterEvent>,
    local_rx: tokio::sync::mpsc::Receiver<InboundMessage>,
    remote_rx: tokio::sync::mpsc::Receiver<BusDelivery>,
}

impl WsServer {
    pub fn new(
        cfg: WsConfig,
        bus: Arc<dyn MessageBus>,
        remote_rx: tokio::sync::mpsc::Receiver<BusDelivery>,
    ) -> (WsServer, Arc<RelayState>) {
        let (register_tx, register_rx) = tokio::sync::mpsc::channel(REGISTER_QUEUE_DEPTH);
        let (unregister_tx, unregister_rx) = tokio::sync::mpsc::channel(REGISTER_QUEUE_DEPTH);
        let (local_tx, local_rx) = tokio::sync::mpsc::channel(LOCAL_QUEUE_DEPTH);
        let state = Arc::new(RelayState {
            cfg,
            bus,
            pending: Mutex::new(PendingSessionTracker::new()),
            register_tx,
            unregister_tx,
            local_tx,
        });
        let server = WsServer {
            state: state.clone(),
            clients: HashMap::new(),
            publishers: TopicClientSet::new(),
            subscribers: TopicClientSet::new(),
            register_rx,
            unregister_rx,
            local_rx,
            remote_rx,
        };
        (server, state)
    }

    pub async fn run(mut self) {
        info!("relay core started");
        loop {
            // Biased so a registration enqueued before a connection's first
            // message is always processed first, and an unregistration before
            // any straggler messages from the same connection.
            tokio::select! {
                biased;
                Some(client) = self.register_rx.recv() => self.handle_register(client),
                Some(event) = self.unregister_rx.recv() => self.handle_unregister(&event),
                Some(delivery) = self.remote_rx.recv() => self.handle_remote(&delivery),
                Some(inbound) = self.local_rx.recv() => self.handle_local(inbound),
                else => break,
            }
        }
        info!("relay core stopped");
    }

    fn handle_register(&mut self, client: Arc<Client>) {
        metrics::inc_new_connection();
        debug!(client = %client.id, "client registered");
        self.clients.insert(
            client.id,
            ClientEntry {
                client,
                pub_topics: HashSet::new(),
                sub_topics: HashSet::new(),
            },
        );
        metrics::set_current_connections(self.clients.len() as i64);
    }

    fn handle_unregister(&mut self, event: &UnregisterEvent) {
        let Some(entry) = self.clients.remove(&event.id) else {
            return;
        };
        self.handle_client_disconnect(&entry);
        metrics::inc_closed_connection();
        metrics::set_current_connections(self.clients.len() as i64);
        info!(client = %event.id, reason = %event.reason, "client disconnected");
    }

    fn handle_local(&mut self, inbound: InboundMessage) {
        let InboundMessage { client, message } = inbound;
        let Some(entry) = self.clients.get_mut(&client.id) else {
            debug!(client = %client.id, "message from unregistered client dropped");
            return;
        };
        match message.kind {
            MessageType::Pub => {
                entry.pub_topics.insert(message.topic.clone());
                self.publishers.set(&message.topic, &client);
                debug!(client = %client.id, topic = %message.topic, "local publish");
                tokio::spawn(handlers::publish_message(self.state.clone(), message, client));
            }
            MessageType::Sub => {
                entry.sub_topics.insert(message.topic.clone());
                self.subscribers.set(&message.topic, &client);
                debug!(client = %client.id, topic = %message.topic, "local subscribe");
                tokio::spawn(handlers::subscribe_topic(self.state.clone(), message, client));
            }
            MessageType::Ping => client.send(handlers::pong_reply()),
            // Application-layer wallet acks are ferried by the wallet's own
            // node; nothing to do here.
            MessageType::Ack | MessageType::Pong => {}
        }
    }

    fn handle_remote(&mut self, delivery: &BusDelivery) {
        let message: SocketMessage = match serde_json::from_str(&delivery.payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(channel = %delivery.channel, error = %e, "malformed message from remote");
                return;
            }
        };
        if is_dapp_notify_channel(&delivery.channel) {
            // sessionReceived closes the pending window: the wallet has the
            // request, so it must no longer expire.
            if message.phase == phase::SESSION_RECEIVED {
                self.state
                    .pending
                    .lock()
                    .unwrap()
                    .delete_by_topic(&message.topic);
            }
            for publisher in self.publishers.clients(&message.topic) {
                if publisher.role() == Role::Dapp {
                    debug!(client = %publisher.id, topic = %message.topic, "wallet update, notify dapp");
                    publisher.send(message.clone());
                }
            }
        } else {
            for subscriber in self.subscribers.clients(&message.topic) {
                debug!(client = %subscriber.id, topic = %message.topic, "forward to subscriber");
                subscriber.send(message.clone());
            }
        }
    }

    fn handle_client_disconnect(&mut self, entry: &ClientEntry) {
        let client = &entry.client;
        let mut channels_to_clear: Vec<String> = Vec::new();

        for topic in &entry.sub_topics {
            self.subscribers.unset(topic, client.id);
            if self.subscribers.len(topic) == 0 {
                self.subscribers.clear(topic);
                channels_to_clear.push(message_channel(topic));
            }
        }
        for topic in &entry.pub_topics {
            self.publishers.unset(topic, client.id);
            if self.publishers.len(topic) == 0 {
                self.publishers.clear(topic);
                channels_to_clear.push(message_channel(topic));
                if client.role() == Role::Dapp {
                    channels_to_clear.push(dapp_notify_channel(topic));
                }
            }
        }

        // Only unsubscribe with a non-empty list: the store reads an empty
        // argument list as "unsubscribe from every channel".
        if !channels_to_clear.is_empty() {
            info!(client = %client.id, channels = ?channels_to_clear, "clear bus channels");
            let bus = self.state.bus.clone();
            tokio::spawn(async move {
                if let Err(e) = bus.unsubscribe(&channels_to_clear).await {
                    warn!(error = %e, "bus unsubscribe failed");
                }
            });
        }

        // A vanished wallet (or never-identified peer) suspends its sessions.
        if client.role() == Role::Dapp {
            return;
        }
        for topic in &entry.sub_topics {
            let notice = SocketMessage {
                topic: topic.clone(),
                role: role::WALLET.to_owned(),
                phase: phase::SESSION_SUSPENDED.to_owned(),
                ..SocketMessage::of_kind(MessageType::Pub)
            };
            debug!(client = %client.id, topic = %topic, "notify dapp about wallet suspension");
            let bus = self.state.bus.clone();
            let channel = dapp_notify_channel(topic);
            tokio::spawn(async move {
                match serde_json::to_string(&notice) {
                    Ok(payload) => {
                        if let Err(e) = bus.publish(&channel, payload).await {
                            warn!(channel = %channel, error = %e, "suspension notice failed");
                        }
                    }
                    Err(e) => warn!(error = %e, "unencodable suspension notice"),
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryHub;
    use crate::client::{DisconnectReason, test_client};
    use tokio::sync::mpsc;
    use tokio::time::{Duration, sleep};

    fn test_server() -> (WsServer, Arc<RelayState>, MemoryHub) {
        let hub = MemoryHub::new();
        let (remote_tx, remote_rx) = mpsc::channel(64);
        let bus = Arc::new(hub.node(remote_tx));
        let (server, state) = WsServer::new(WsConfig::default(), bus, remote_rx);
        (server, state, hub)
    }

    fn local(client: &Arc<Client>, kind: MessageType, topic: &str, msg_role: &str) -> InboundMessage {
        client.record_role(msg_role);
        InboundMessage {
            client: client.clone(),
            message: SocketMessage {
                topic: topic.to_owned(),
                role: msg_role.to_owned(),
                ..SocketMessage::of_kind(kind)
            },
        }
    }

    async fn settle() {
        // Let spawned bus tasks run.
        sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn indices_mirror_per_client_topic_sets() {
        let (mut server, _state, _hub) = test_server();
        let (a, _rx_a) = test_client();
        let (b, _rx_b) = test_client();
        server.handle_register(a.clone());
        server.handle_register(b.clone());

        server.handle_local(local(&a, MessageType::Pub, "t1", role::DAPP));
        server.handle_local(local(&a, MessageType::Sub, "t2", role::DAPP));
        server.handle_local(local(&b, MessageType::Sub, "t1", role::WALLET));
        server.handle_local(local(&b, MessageType::Sub, "t2", role::WALLET));

        for (id, entry) in &server.clients {
            for topic in &entry.pub_topics {
                assert!(server.publishers.contains(topic, *id));
            }
            for topic in &entry.sub_topics {
                assert!(server.subscribers.contains(topic, *id));
            }
        }
        assert_eq!(server.publishers.topics_of(a.id), vec!["t1".to_owned()]);
        assert_eq!(server.subscribers.topics_of(a.id), vec!["t2".to_owned()]);
        assert_eq!(server.subscribers.len("t1"), 1);
        assert_eq!(server.subscribers.len("t2"), 2);
    }

    #[tokio::test]
    async fn unregister_scrubs_the_client_from_every_index() {
        let (mut server, _state, _hub) = test_server();
        let (a, _rx_a) = test_client();
        let (b, _rx_b) = test_client();
        server.handle_register(a.clone());
        server.handle_register(b.clone());
        server.handle_local(local(&a, MessageType::Pub, "t1", role::DAPP));
        server.handle_local(local(&a, MessageType::Sub, "t2", role::DAPP));
        server.handle_local(local(&b, MessageType::Sub, "t2", role::WALLET));

        server.handle_unregister(&UnregisterEvent {
            id: a.id,
            reason: DisconnectReason::PeerClosed,
        });

        assert!(!server.clients.contains_key(&a.id));
        assert!(server.publishers.topics_of(a.id).is_empty());
        assert!(server.subscribers.topics_of(a.id).is_empty());
        // b's subscription is untouched.
        assert!(server.subscribers.contains("t2", b.id));

        // Dropping the same client twice is harmless.
        server.handle_unregister(&UnregisterEvent {
            id: a.id,
            reason: DisconnectReason::PeerClosed,
        });
    }

    #[tokio::test]
    async fn messages_from_unregistered_clients_are_dropped() {
        let (mut server, _state, _hub) = test_server();
        let (ghost, _rx) = test_client();

        server.handle_local(local(&ghost, MessageType::Sub, "t1", role::WALLET));
        assert_eq!(server.subscribers.len("t1"), 0);
    }

    #[tokio::test]
    async fn remote_message_channel_delivery_reaches_subscribers_only() {
        let (mut server, _state, _hub) = test_server();
        let (dapp, mut dapp_rx) = test_client();
        let (wallet, mut wallet_rx) = test_client();
        server.handle_register(dapp.clone());
        server.handle_register(wallet.clone());
        server.handle_local(local(&dapp, MessageType::Pub, "t1", role::DAPP));
        server.handle_local(local(&wallet, MessageType::Sub, "t1", role::WALLET));

        let payload = serde_json::to_string(&SocketMessage {
            topic: "t1".to_owned(),
            payload: "blob".to_owned(),
            role: role::DAPP.to_owned(),
            ..SocketMessage::of_kind(MessageType::Pub)
        })
        .unwrap();
        server.handle_remote(&BusDelivery {
            channel: message_channel("t1"),
            payload,
        });

        assert_eq!(wallet_rx.try_recv().unwrap().payload, "blob");
        assert!(dapp_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn remote_dapp_notify_delivery_reaches_dapp_publishers_only() {
        let (mut server, state, _hub) = test_server();
        let (dapp, mut dapp_rx) = test_client();
        let (wallet, mut wallet_rx) = test_client();
        server.handle_register(dapp.clone());
        server.handle_register(wallet.clone());
        server.handle_local(local(&dapp, MessageType::Pub, "t1", role::DAPP));
        // A wallet that published on the same topic must not be notified.
        server.handle_local(local(&wallet, MessageType::Pub, "t1", role::WALLET));

        state.pending.lock().unwrap().insert(
            "t1",
            tokio::time::Instant::now() + Duration::from_secs(60),
            dapp.clone(),
        );

        let payload = serde_json::to_string(&SocketMessage {
            topic: "t1".to_owned(),
            role: role::RELAY.to_owned(),
            phase: phase::SESSION_RECEIVED.to_owned(),
            ..SocketMessage::of_kind(MessageType::Ack)
        })
        .unwrap();
        server.handle_remote(&BusDelivery {
            channel: dapp_notify_channel("t1"),
            payload,
        });

        let notice = dapp_rx.try_recv().unwrap();
        assert_eq!(notice.phase, phase::SESSION_RECEIVED);
        assert!(wallet_rx.try_recv().is_err());
        // The wallet picked the session up, so it can no longer expire.
        assert!(!state.pending.lock().unwrap().contains("t1"));
    }

    #[tokio::test]
    async fn wallet_disconnect_suspends_sessions_and_batches_unsubscribes() {
        let (mut server, state, hub) = test_server();
        let (dapp, mut dapp_rx) = test_client();
        let (wallet, _wallet_rx) = test_client();
        server.handle_register(dapp.clone());
        server.handle_register(wallet.clone());
        server.handle_local(local(&dapp, MessageType::Pub, "t1", role::DAPP));
        server.handle_local(local(&wallet, MessageType::Sub, "t1", role::WALLET));
        settle().await;

        server.handle_unregister(&UnregisterEvent {
            id: wallet.id,
            reason: DisconnectReason::HeartbeatFail,
        });
        settle().await;

        // subscribers[t1] is empty and the message channel was unsubscribed
        // in a single batched call.
        assert_eq!(server.subscribers.len("t1"), 0);
        assert!(!hub.is_subscribed(&message_channel("t1")));
        let calls = hub.unsubscribe_calls();
        assert!(!calls.is_empty());
        assert!(calls.iter().all(|channels| !channels.is_empty()));
        assert!(
            calls
                .iter()
                .any(|channels| channels.contains(&message_channel("t1")))
        );

        // The dapp hears about the suspension through its notify channel:
        // the hub delivers it back to this node, whose core routes it to the
        // dapp publisher of t1. Pump the remote queue by hand since the loop
        // is not running in this test.
        while let Ok(delivery) = server.remote_rx.try_recv() {
            server.handle_remote(&delivery);
        }
        let notice = loop {
            let message = dapp_rx.try_recv().expect("suspension notice delivered");
            if message.phase == phase::SESSION_SUSPENDED {
                break message;
            }
        };
        assert_eq!(notice.role, role::WALLET);
        assert_eq!(notice.topic, "t1");
        drop(state);
    }

    #[tokio::test]
    async fn dapp_disconnect_clears_its_notify_channel_but_stays_silent() {
        let (mut server, _state, hub) = test_server();
        let (dapp, _dapp_rx) = test_client();
        server.handle_register(dapp.clone());
        server.handle_local(local(&dapp, MessageType::Pub, "t1", role::DAPP));
        settle().await;
        assert!(hub.is_subscribed(&dapp_notify_channel("t1")));

        server.handle_unregister(&UnregisterEvent {
            id: dapp.id,
            reason: DisconnectReason::PeerClosed,
        });
        settle().await;

        assert!(!hub.is_subscribed(&dapp_notify_channel("t1")));
        let calls = hub.unsubscribe_calls();
        assert!(calls.iter().all(|channels| !channels.is_empty()));
        assert!(
            calls
                .iter()
                .any(|channels| channels.contains(&dapp_notify_channel("t1")))
        );
    }

    #[tokio::test]
    async fn disconnect_with_no_topics_never_touches_the_bus() {
        let (mut server, _state, hub) = test_server();
        let (idle, _rx) = test_client();
        server.handle_register(idle.clone());

        server.handle_unregister(&UnregisterEvent {
            id: idle.id,
            reason: DisconnectReason::PeerClosed,
        });
        settle().await;

        assert!(hub.unsubscribe_calls().is_empty());
    }

    #[tokio::test]
    async fn ping_gets_a_relay_pong_on_the_same_connection() {
        let (mut server, _state, _hub) = test_server();
        let (client, mut rx) = test_client();
        server.handle_register(client.clone());

        server.handle_local(local(&client, MessageType::Ping, "", ""));
        let reply = rx.try_recv().unwrap();
        assert_eq!(reply.kind, MessageType::Pong);
        assert_eq!(reply.role, role::RELAY);
    }
}
