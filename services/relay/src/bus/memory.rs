//! In-process bus backend.
//!
//! A `MemoryHub` stands in for the external store; each `MemoryBus` handle is
//! one node's connection to it. Pub/sub semantics mirror the real store:
//! `publish` counts subscribed nodes, and an empty `unsubscribe` clears every
//! subscription the node holds, the same footgun the caller must guard
//! against in production. The hub records every unsubscribe call so tests can
//! verify the guard.

use super::{BusDelivery, BusError, MessageBus};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};

#[derive(Default)]
struct HubInner {
    nodes: HashMap<usize, NodeSlot>,
    next_node: usize,
    cache: HashMap<String, CacheList>,
    unsubscribe_calls: Vec<Vec<String>>,
}

struct NodeSlot {
    channels: HashSet<String>,
    delivery_tx: mpsc::Sender<BusDelivery>,
}

struct CacheList {
    entries: Vec<String>,
    expires_at: Instant,
}

/// Shared in-process store. Clone handles freely; all nodes see one state.
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<Mutex<HubInner>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        MemoryHub::default()
    }

    /// Attach a node; its deliveries flow into `delivery_tx`.
    pub fn node(&self, delivery_tx: mpsc::Sender<BusDelivery>) -> MemoryBus {
        let mut inner = self.inner.lock().unwrap();
        let node_id = inner.next_node;
        inner.next_node += 1;
        inner.nodes.insert(
            node_id,
            NodeSlot {
                channels: HashSet::new(),
                delivery_tx,
            },
        );
        MemoryBus {
            hub: self.clone(),
            node_id,
        }
    }

    /// Current (unexpired) cache list at `key`.
    pub fn cached(&self, key: &str) -> Vec<String> {
        let mut inner = self.inner.lock().unwrap();
        prune_expired(&mut inner);
        inner
            .cache
            .get(key)
            .map(|list| list.entries.clone())
            .unwrap_or_default()
    }

    /// Whether any node is subscribed to `channel`.
    pub fn is_subscribed(&self, channel: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .nodes
            .values()
            .any(|node| node.channels.contains(channel))
    }

    /// Every `unsubscribe` argument list seen so far, in call order.
    pub fn unsubscribe_calls(&self) -> Vec<Vec<String>> {
        self.inner.lock().unwrap().unsubscribe_calls.clone()
    }
}

fn prune_expired(inner: &mut HubInner) {
    let now = Instant::now();
    inner.cache.retain(|_, list| list.expires_at > now);
}

/// One node's connection to a `MemoryHub`.
pub struct MemoryBus {
    hub: MemoryHub,
    node_id: usize,
}

impl Drop for MemoryBus {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.hub.inner.lock() {
            inner.nodes.remove(&self.node_id);
        }
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, channel: &str, payload: String) -> Result<u64, BusError> {
        let receivers: Vec<mpsc::Sender<BusDelivery>> = {
            let inner = self.hub.inner.lock().unwrap();
            inner
                .nodes
                .values()
                .filter(|node| node.channels.contains(channel))
                .map(|node| node.delivery_tx.clone())
                .collect()
        };
        let count = receivers.len() as u64;
        for tx in receivers {
            let _ = tx
                .send(BusDelivery {
                    channel: channel.to_owned(),
                    payload: payload.clone(),
                })
                .await;
        }
        Ok(count)
    }

    async fn subscribe(&self, channel: &str) -> Result<(), BusError> {
        let mut inner = self.hub.inner.lock().unwrap();
        let node = inner.nodes.get_mut(&self.node_id).ok_or(BusError::Closed)?;
        node.channels.insert(channel.to_owned());
        Ok(())
    }

    async fn unsubscribe(&self, channels: &[String]) -> Result<(), BusError> {
        let mut inner = self.hub.inner.lock().unwrap();
        inner.unsubscribe_calls.push(channels.to_vec());
        let node = inner.nodes.get_mut(&self.node_id).ok_or(BusError::Closed)?;
        if channels.is_empty() {
            // Store semantics: no arguments means drop every subscription.
            node.channels.clear();
        } else {
            for channel in channels {
                node.channels.remove(channel);
            }
        }
        Ok(())
    }

    async fn cache_push(&self, key: &str, payload: String, ttl_secs: u64) -> Result<(), BusError> {
        let mut inner = self.hub.inner.lock().unwrap();
        prune_expired(&mut inner);
        let expires_at = Instant::now() + Duration::from_secs(ttl_secs);
        let list = inner.cache.entry(key.to_owned()).or_insert(CacheList {
            entries: Vec::new(),
            expires_at,
        });
        list.entries.push(payload);
        list.expires_at = expires_at;
        Ok(())
    }

    async fn cache_drain(&self, key: &str) -> Result<Vec<String>, BusError> {
        let mut inner = self.hub.inner.lock().unwrap();
        prune_expired(&mut inner);
        Ok(inner
            .cache
            .remove(key)
            .map(|list| list.entries)
            .unwrap_or_default())
    }
}
