//! Broker transport abstraction.
//!
//! The bus never talks to a broker client directly. It needs two narrow
//! contracts:
//!
//! - [`Transport`] + [`Channel`]: the consuming side. Declares exchanges and
//!   queues, binds them, consumes deliveries, acknowledges and republishes.
//! - [`Producer`]: the sending side. Publishes to a message type's exchange or
//!   sends straight to a queue.
//!
//! [`TransportProducer`] implements [`Producer`] on top of any [`Transport`],
//! so a broker binding only has to provide the channel operations.
//!
//! The vocabulary is AMQP's: fan-out exchanges broadcast to every bound queue,
//! direct exchanges route on exact routing-key match, and the default exchange
//! (`""`) routes to the queue named by the routing key.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, trace};

use crate::core::{exchange_name, Headers};

/// The default exchange: routes to the queue named by the routing key.
pub const DEFAULT_EXCHANGE: &str = "";

/// Queue argument: milliseconds a message waits before it is dead-lettered.
pub const MESSAGE_TTL: &str = "x-message-ttl";
/// Queue argument: exchange that receives expired messages.
pub const DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Queue argument: routing key used when dead-lettering.
pub const DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";

/// Queue and exchange arguments (`x-message-ttl`, `x-dead-letter-exchange`, ...).
pub type Arguments = Headers;

// =============================================================================
// Errors
// =============================================================================

/// Errors raised by a transport implementation.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The broker could not be reached.
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// The channel was closed, by us or by the broker.
    #[error("channel closed")]
    ChannelClosed,

    #[error("exchange not found: {0}")]
    ExchangeNotFound(String),

    #[error("queue not found: {0}")]
    QueueNotFound(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

// =============================================================================
// Topology Types
// =============================================================================

/// Exchange routing behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    /// Every bound queue receives every message.
    Fanout,
    /// Queues bound with exactly the message's routing key receive it.
    Direct,
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeKind::Fanout => write!(f, "fanout"),
            ExchangeKind::Direct => write!(f, "direct"),
        }
    }
}

/// Options for declaring a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub arguments: Arguments,
}

impl QueueOptions {
    /// A durable, shared, persistent queue.
    pub fn durable() -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
            arguments: Arguments::new(),
        }
    }

    pub fn with_arguments(mut self, arguments: Arguments) -> Self {
        self.arguments = arguments;
        self
    }
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self::durable()
    }
}

/// A message handed to a consumer by the broker.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Broker-assigned tag used to acknowledge this delivery.
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub headers: Headers,
    pub body: Bytes,
}

// =============================================================================
// Transport / Channel
// =============================================================================

/// A connection to a broker.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a new channel.
    ///
    /// Failing to connect is fatal for the caller: the bus surfaces it from
    /// `start_consuming`.
    async fn open_channel(&self) -> Result<Arc<dyn Channel>, TransportError>;
}

/// One channel on a broker connection.
///
/// All declarations are idempotent: declaring an existing exchange or queue
/// with the same settings is a no-op.
#[async_trait]
pub trait Channel: Send + Sync {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), TransportError>;

    /// Declare a queue. Returns the queue's name.
    async fn declare_queue(
        &self,
        name: &str,
        options: &QueueOptions,
    ) -> Result<String, TransportError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: &Arguments,
    ) -> Result<(), TransportError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        headers: Headers,
        body: Bytes,
    ) -> Result<(), TransportError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError>;

    /// Start consuming a queue.
    async fn consume(&self, queue: &str) -> Result<Box<dyn DeliveryStream>, TransportError>;

    /// Close the channel. Calling this on a closed channel is a no-op.
    async fn close(&self);

    fn is_open(&self) -> bool;
}

/// Stream of deliveries from one queue subscription.
#[async_trait]
pub trait DeliveryStream: Send {
    /// Next delivery, or `None` once the subscription has ended.
    async fn next(&mut self) -> Option<Delivery>;
}

// =============================================================================
// Producer
// =============================================================================

/// Sending side of the transport.
///
/// Payloads arrive already serialized; the bus owns serialization and sets
/// the reserved headers.
#[async_trait]
pub trait Producer: Send + Sync + 'static {
    /// Publish to every subscriber of `message_type`.
    async fn publish(
        &self,
        message_type: &str,
        body: Bytes,
        headers: Headers,
    ) -> Result<(), TransportError>;

    /// Send to the queue mapped for `message_type`.
    ///
    /// Returns `Ok(false)` when no mapping exists for the type.
    async fn send(
        &self,
        message_type: &str,
        body: Bytes,
        headers: Headers,
    ) -> Result<bool, TransportError>;

    /// Send straight to a queue.
    async fn send_to(
        &self,
        endpoint: &str,
        message_type: &str,
        body: Bytes,
        headers: Headers,
    ) -> Result<(), TransportError>;

    /// Drop the underlying channel. Safe to call repeatedly; the next send
    /// reconnects.
    async fn disconnect(&self);
}

/// [`Producer`] backed by a [`Transport`] channel.
///
/// The channel is opened lazily on first use and reopened after
/// [`Producer::disconnect`] or a closed-channel error.
pub struct TransportProducer {
    transport: Arc<dyn Transport>,
    queue_mappings: HashMap<String, String>,
    channel: tokio::sync::Mutex<Option<Arc<dyn Channel>>>,
    declared: Mutex<HashSet<String>>,
}

impl TransportProducer {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_queue_mappings(transport, HashMap::new())
    }

    pub fn with_queue_mappings(
        transport: Arc<dyn Transport>,
        queue_mappings: HashMap<String, String>,
    ) -> Self {
        Self {
            transport,
            queue_mappings,
            channel: tokio::sync::Mutex::new(None),
            declared: Mutex::new(HashSet::new()),
        }
    }

    async fn channel(&self) -> Result<Arc<dyn Channel>, TransportError> {
        let mut guard = self.channel.lock().await;
        if let Some(channel) = guard.as_ref() {
            if channel.is_open() {
                return Ok(channel.clone());
            }
        }

        debug!("producer opening channel");
        let channel = self.transport.open_channel().await?;
        *guard = Some(channel.clone());
        self.declared
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        Ok(channel)
    }

    async fn forget_channel_on_close(&self, err: &TransportError) {
        if matches!(err, TransportError::ChannelClosed) {
            *self.channel.lock().await = None;
        }
    }

    async fn ensure_exchange(
        &self,
        channel: &Arc<dyn Channel>,
        exchange: &str,
    ) -> Result<(), TransportError> {
        let known = self
            .declared
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(exchange);
        if !known {
            channel
                .declare_exchange(exchange, ExchangeKind::Fanout, true)
                .await?;
            self.declared
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(exchange.to_owned());
        }
        Ok(())
    }
}

#[async_trait]
impl Producer for TransportProducer {
    async fn publish(
        &self,
        message_type: &str,
        body: Bytes,
        headers: Headers,
    ) -> Result<(), TransportError> {
        let channel = self.channel().await?;
        let exchange = exchange_name(message_type);

        let result = async {
            self.ensure_exchange(&channel, &exchange).await?;
            trace!(%exchange, "publishing");
            channel.publish(&exchange, "", headers, body).await
        }
        .await;

        if let Err(e) = &result {
            self.forget_channel_on_close(e).await;
        }
        result
    }

    async fn send(
        &self,
        message_type: &str,
        body: Bytes,
        headers: Headers,
    ) -> Result<bool, TransportError> {
        let Some(queue) = self.queue_mappings.get(message_type) else {
            return Ok(false);
        };
        self.send_to(queue, message_type, body, headers).await?;
        Ok(true)
    }

    async fn send_to(
        &self,
        endpoint: &str,
        message_type: &str,
        body: Bytes,
        headers: Headers,
    ) -> Result<(), TransportError> {
        let channel = self.channel().await?;
        trace!(queue = %endpoint, %message_type, "sending");
        let result = channel
            .publish(DEFAULT_EXCHANGE, endpoint, headers, body)
            .await;
        if let Err(e) = &result {
            self.forget_channel_on_close(e).await;
        }
        result
    }

    async fn disconnect(&self) {
        if let Some(channel) = self.channel.lock().await.take() {
            channel.close().await;
        }
    }
}

impl fmt::Debug for TransportProducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportProducer")
            .field("queue_mappings", &self.queue_mappings)
            .finish_non_exhaustive()
    }
}
