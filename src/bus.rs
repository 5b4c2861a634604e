//! C3/C4 — AMQP message bus. One publisher channel and one consumer per
//! process; the consumer's bindings are driven by the router (`router.rs`)
//! as sessions come and go.
//!
//! Reconnects with exponential backoff capped at `amqpReconnectTimeout`,
//! mirroring `tunnel/client.rs`'s reconnect loop. A lost connection drops all
//! bindings; on reconnect the caller (`router.rs`) re-applies its bound set.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Connection, ConnectionProperties, Consumer, ExchangeKind};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::BusConfig;
use crate::error::UpstreamError;

const EXCHANGE_KIND: ExchangeKind = ExchangeKind::Topic;

/// Exactly one logical publisher per process; cheap to clone and share.
///
/// Each named topic (`connectorLogTopic`, `deviceLogTopic`, `eventTopic`, ...)
/// is a durable queue reached via the broker's default exchange, so
/// `publish(topic, payload)` can target any of them without per-topic setup —
/// mirroring the original's `amqp_wrapper_lib.Connection.Publish(topic, ...)`,
/// which treated each configured topic as an independent destination rather
/// than a routing key within one shared exchange.
#[derive(Clone)]
pub struct Publisher {
    inner: Arc<Mutex<Connection>>,
    declared_queues: Arc<Mutex<HashSet<String>>>,
    amqp_url: String,
    reconnect_timeout: Duration,
}

impl Publisher {
    pub async fn connect(cfg: &BusConfig) -> Result<Self, UpstreamError> {
        let conn = dial(&cfg.amqp_url).await?;
        Ok(Self {
            inner: Arc::new(Mutex::new(conn)),
            declared_queues: Arc::new(Mutex::new(HashSet::new())),
            amqp_url: cfg.amqp_url.clone(),
            reconnect_timeout: Duration::from_secs(cfg.amqp_reconnect_timeout_secs),
        })
    }

    /// Publish `payload` to `topic`. Synchronous from the caller's
    /// perspective: the underlying channel may buffer internally, but this
    /// call does not return until the broker has confirmed the publish. On a
    /// dead connection, reconnects with backoff once before giving up.
    pub async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), UpstreamError> {
        match self.try_publish(topic, payload).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("bus: publish to {topic} failed ({e}), reconnecting");
                self.reconnect().await;
                self.try_publish(topic, payload).await
            }
        }
    }

    async fn try_publish(&self, topic: &str, payload: &[u8]) -> Result<(), UpstreamError> {
        let channel = {
            let conn = self.inner.lock().await;
            conn.create_channel()
                .await
                .map_err(|e| UpstreamError(format!("opening publish channel: {e}")))?
        };
        self.ensure_queue(&channel, topic).await?;
        channel
            .basic_publish(
                "",
                topic,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default().with_content_type("application/json".into()),
            )
            .await
            .map_err(|e| UpstreamError(format!("publishing to {topic}: {e}")))?
            .await
            .map_err(|e| UpstreamError(format!("publish not confirmed for {topic}: {e}")))?;
        Ok(())
    }

    async fn ensure_queue(&self, channel: &lapin::Channel, topic: &str) -> Result<(), UpstreamError> {
        let mut declared = self.declared_queues.lock().await;
        if declared.contains(topic) {
            return Ok(());
        }
        channel
            .queue_declare(
                topic,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| UpstreamError(format!("declaring queue {topic}: {e}")))?;
        declared.insert(topic.to_string());
        Ok(())
    }

    /// Reconnect with backoff capped at `amqpReconnectTimeout`.
    async fn reconnect(&self) {
        let mut delay = Duration::from_secs(1);
        loop {
            match dial(&self.amqp_url).await {
                Ok(conn) => {
                    *self.inner.lock().await = conn;
                    self.declared_queues.lock().await.clear();
                    info!("bus: publisher reconnected");
                    return;
                }
                Err(e) => {
                    warn!("bus: publisher reconnect failed: {e}, retrying in {}s", delay.as_secs());
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.reconnect_timeout);
                }
            }
        }
    }
}

struct SubscriberInner {
    conn: Connection,
    channel: lapin::Channel,
}

/// Inbound subscriber (C4). Owns a dedicated queue bound to the protocol
/// exchange; bindings are per-device routing keys, added/removed as sessions
/// attach and detach.
///
/// Shared via `Arc` between the router (which calls `bind`/`unbind`) and the
/// delivery loop spawned in `main.rs` (which calls `run` and may swap the
/// connection out from under a live bind/unbind call on reconnect) — the
/// inner connection/channel pair is therefore behind its own mutex rather
/// than requiring unique ownership the way `run` alone would.
pub struct Subscriber {
    inner: Mutex<SubscriberInner>,
    amqp_url: String,
    queue_name: String,
    exchange: String,
    reconnect_timeout: Duration,
}

impl Subscriber {
    /// Declare an exclusive, auto-delete queue named after `consumer_name` on
    /// the protocol exchange, with no bindings yet.
    pub async fn init(cfg: &BusConfig) -> Result<Self, UpstreamError> {
        let (conn, channel) = Self::connect_and_declare(cfg).await?;
        Ok(Self {
            inner: Mutex::new(SubscriberInner { conn, channel }),
            amqp_url: cfg.amqp_url.clone(),
            queue_name: cfg.consumer_name.clone(),
            exchange: cfg.protocol_topic.clone(),
            reconnect_timeout: Duration::from_secs(cfg.amqp_reconnect_timeout_secs),
        })
    }

    async fn connect_and_declare(cfg: &BusConfig) -> Result<(Connection, lapin::Channel), UpstreamError> {
        let conn = dial(&cfg.amqp_url).await?;
        let channel = conn
            .create_channel()
            .await
            .map_err(|e| UpstreamError(format!("opening consumer channel: {e}")))?;
        declare_topic_exchange(&conn, &cfg.protocol_topic).await?;

        channel
            .queue_declare(
                &cfg.consumer_name,
                QueueDeclareOptions {
                    durable: false,
                    exclusive: true,
                    auto_delete: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| UpstreamError(format!("declaring consumer queue: {e}")))?;

        Ok((conn, channel))
    }

    /// Idempotent: binding an already-bound device is a no-op as far as the
    /// caller can observe (the broker itself treats a duplicate bind as a
    /// no-op).
    pub async fn bind(&self, device_id: &str) -> Result<(), UpstreamError> {
        let inner = self.inner.lock().await;
        inner
            .channel
            .queue_bind(
                &self.queue_name,
                &self.exchange,
                device_id,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| UpstreamError(format!("binding {device_id}: {e}")))
    }

    /// Idempotent: unbinding a key that was never bound is a no-op.
    pub async fn unbind(&self, device_id: &str) -> Result<(), UpstreamError> {
        let inner = self.inner.lock().await;
        inner
            .channel
            .queue_unbind(&self.queue_name, &self.exchange, device_id, FieldTable::default())
            .await
            .map_err(|e| UpstreamError(format!("unbinding {device_id}: {e}")))
    }

    /// Drop every binding on the consumer queue at once, used once at router
    /// startup to reconcile stale bindings from a previous process.
    pub async fn reset_all_bindings(&self, device_ids: &[String]) -> Result<(), UpstreamError> {
        for id in device_ids {
            self.unbind(id).await?;
        }
        Ok(())
    }

    async fn consume(&self) -> Result<Consumer, UpstreamError> {
        let inner = self.inner.lock().await;
        inner
            .channel
            .basic_consume(
                &self.queue_name,
                "connector",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| UpstreamError(format!("starting consume: {e}")))
    }

    /// Drive delivery dispatch until the connection drops, reconnecting with
    /// backoff capped at `amqpReconnectTimeout`. `handler` is invoked with
    /// `(routing_key, payload)` for each delivery; its errors are logged and
    /// do not stop the loop (an individual bad message must not take down
    /// the whole consumer). Runs for the life of the process; callers spawn
    /// it and abort the task on shutdown.
    pub async fn run<F>(self: Arc<Self>, cfg: BusConfig, mut handler: F)
    where
        F: FnMut(&str, &[u8]) + Send,
    {
        let mut delay = Duration::from_secs(1);
        let max_delay = Duration::from_secs(cfg.amqp_reconnect_timeout_secs);

        loop {
            let consumer = match self.consume().await {
                Ok(c) => c,
                Err(e) => {
                    warn!("bus: consumer setup failed: {e}, retrying in {}s", delay.as_secs());
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(max_delay);
                    self.reconnect().await;
                    continue;
                }
            };
            delay = Duration::from_secs(1);

            use futures::StreamExt;
            let mut consumer = consumer;
            let mut lost = false;
            while let Some(delivery) = consumer.next().await {
                match delivery {
                    Ok(delivery) => {
                        handler(delivery.routing_key.as_str(), &delivery.data);
                        if let Err(e) = delivery.ack(lapin::options::BasicAckOptions::default()).await {
                            warn!("bus: ack failed: {e}");
                        }
                    }
                    Err(e) => {
                        warn!("bus: delivery stream error: {e}");
                        lost = true;
                        break;
                    }
                }
            }
            if !lost {
                warn!("bus: delivery stream ended");
            }
            self.reconnect().await;
        }
    }

    async fn reconnect(&self) {
        let mut delay = Duration::from_secs(1);
        loop {
            match Self::dial_fresh(&self.amqp_url, &self.queue_name, &self.exchange).await {
                Ok((conn, channel)) => {
                    let mut inner = self.inner.lock().await;
                    inner.conn = conn;
                    inner.channel = channel;
                    info!("bus: subscriber reconnected");
                    return;
                }
                Err(e) => {
                    warn!("bus: subscriber reconnect attempt failed: {e}, retrying in {}s", delay.as_secs());
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.reconnect_timeout);
                }
            }
        }
    }

    async fn dial_fresh(amqp_url: &str, queue_name: &str, exchange: &str) -> Result<(Connection, lapin::Channel), UpstreamError> {
        let conn = dial(amqp_url).await?;
        let channel = conn
            .create_channel()
            .await
            .map_err(|e| UpstreamError(format!("opening consumer channel: {e}")))?;
        declare_topic_exchange(&conn, exchange).await?;
        channel
            .queue_declare(
                queue_name,
                QueueDeclareOptions {
                    durable: false,
                    exclusive: true,
                    auto_delete: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| UpstreamError(format!("declaring consumer queue: {e}")))?;
        Ok((conn, channel))
    }

    pub async fn close(&self) -> Result<(), UpstreamError> {
        let inner = self.inner.lock().await;
        inner
            .conn
            .close(0, "shutdown")
            .await
            .map_err(|e| UpstreamError(format!("closing subscriber connection: {e}")))
    }
}

async fn dial(amqp_url: &str) -> Result<Connection, UpstreamError> {
    Connection::connect(amqp_url, ConnectionProperties::default())
        .await
        .map_err(|e| UpstreamError(format!("connecting to bus at {amqp_url}: {e}")))
}

async fn declare_topic_exchange(conn: &Connection, name: &str) -> Result<(), UpstreamError> {
    let channel = conn
        .create_channel()
        .await
        .map_err(|e| UpstreamError(format!("opening setup channel: {e}")))?;
    channel
        .exchange_declare(
            name,
            EXCHANGE_KIND,
            ExchangeDeclareOptions {
                durable: true,
                ..ExchangeDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| UpstreamError(format!("declaring exchange {name}: {e}")))
}
