//! Redis backend: a multiplexed connection for commands and a dedicated
//! pub/sub connection whose receive half feeds the core's remote queue.

use super::{BusDelivery, BusError, MessageBus};
use async_trait::async_trait;
use futures_util::StreamExt;
use redis::AsyncCommands;
use redis::aio::{MultiplexedConnection, PubSubSink};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

pub struct RedisBus {
    conn: MultiplexedConnection,
    sub: Mutex<PubSubSink>,
}

impl RedisBus {
    /// Connect to the store and start forwarding channel deliveries into
    /// `delivery_tx`. The forwarding task ends when the pub/sub connection
    /// drops or the receiving side goes away.
    pub async fn connect(
        server_addr: &str,
        password: &str,
        delivery_tx: mpsc::Sender<BusDelivery>,
    ) -> Result<Self, BusError> {
        let url = if password.is_empty() {
            format!("redis://{server_addr}")
        } else {
            format!("redis://:{password}@{server_addr}")
        };
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_tokio_connection().await?;
        let pubsub = client.get_async_pubsub().await?;
        let (sink, mut stream) = pubsub.split();

        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                let channel = msg.get_channel_name().to_owned();
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "non-text bus delivery dropped");
                        continue;
                    }
                };
                if delivery_tx
                    .send(BusDelivery { channel, payload })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            debug!("bus delivery stream ended");
        });

        Ok(RedisBus {
            conn,
            sub: Mutex::new(sink),
        })
    }
}

#[async_trait]
impl MessageBus for RedisBus {
    async fn publish(&self, channel: &str, payload: String) -> Result<u64, BusError> {
        let mut conn = self.conn.clone();
        let receivers: u64 = conn.publish(channel, payload).await?;
        Ok(receivers)
    }

    async fn subscribe(&self, channel: &str) -> Result<(), BusError> {
        self.sub.lock().await.subscribe(channel).await?;
        Ok(())
    }

    async fn unsubscribe(&self, channels: &[String]) -> Result<(), BusError> {
        self.sub.lock().await.unsubscribe(channels.to_vec()).await?;
        Ok(())
    }

    async fn cache_push(&self, key: &str, payload: String, ttl_secs: u64) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.rpush(key, payload).await?;
        let _: i64 = conn.expire(key, ttl_secs.try_into().unwrap_or(i64::MAX)).await?;
        Ok(())
    }

    async fn cache_drain(&self, key: &str) -> Result<Vec<String>, BusError> {
        let mut conn = self.conn.clone();
        // LRANGE and DEL in one transaction so a drained key is gone before
        // any concurrent publisher can observe the old list.
        let (entries, _deleted): (Vec<String>, i64) = redis::pipe()
            .atomic()
            .lrange(key, 0, -1)
            .del(key)
            .query_async(&mut conn)
            .await?;
        Ok(entries)
    }
}
