//! The shared message bus and key-value store.
//!
//! Cross-node fan-out and the offline message cache both live in an external
//! pub/sub-capable store. The relay talks to it through `MessageBus` with two
//! interchangeable backends:
//! - `RedisBus`: the production backend.
//! - `MemoryBus`: a single-process hub for development and tests.
//!
//! Incoming channel deliveries are pushed onto an mpsc queue consumed by the
//! relay core; the trait itself only covers the outbound operations.

mod memory;
mod redis;

pub use memory::{MemoryBus, MemoryHub};
pub use redis::RedisBus;

use async_trait::async_trait;

/// One message received from a bus channel this node is subscribed to.
#[derive(Debug, Clone)]
pub struct BusDelivery {
    pub channel: String,
    pub payload: String,
}

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("store error: {0}")]
    Store(#[from] ::redis::RedisError),
    #[error("bus connection closed")]
    Closed,
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish `payload` onto `channel`. Returns how many bus subscribers
    /// (nodes, including this one) received it.
    async fn publish(&self, channel: &str, payload: String) -> Result<u64, BusError>;

    /// Subscribe this node's bus connection to `channel`. Idempotent.
    async fn subscribe(&self, channel: &str) -> Result<(), BusError>;

    /// Unsubscribe from the given channels.
    ///
    /// The store interprets an empty argument list as "unsubscribe from
    /// everything"; callers must never pass one.
    async fn unsubscribe(&self, channels: &[String]) -> Result<(), BusError>;

    /// Append `payload` to the cache list at `key` and refresh its TTL.
    async fn cache_push(&self, key: &str, payload: String, ttl_secs: u64) -> Result<(), BusError>;

    /// Read the whole cache list at `key` and delete it, atomically.
    async fn cache_drain(&self, key: &str) -> Result<Vec<String>, BusError>;
}
