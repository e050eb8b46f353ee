//! # servicebus
//!
//! A message-bus runtime: broker consumption with retry and dead-lettering,
//! dispatch to handlers and process managers, and request/reply correlation
//! over an asynchronous transport.
//!
//! ## Core Concepts
//!
//! - [`Message`] = an application payload with a [`CorrelationId`]
//! - [`MessageHandler`] = reacts to one message type
//! - [`ProcessManager`] = a saga whose state survives between messages
//! - [`Bus`] = publishes, sends, requests, and consumes its work queue
//!
//! ## Architecture
//!
//! ```text
//! broker delivery
//!     │
//!     ▼
//! Consumer ── ack ── failed? ──► Q.Retries ──(TTL)──► Q
//!     │                   └──── exhausted ──► errors
//!     ▼ on_message()
//! Dispatcher
//!     ├─► MessageHandlers (all run, failures aggregated)
//!     ├─► ProcessManagerEngine (load → handle → save / delete)
//!     └─► RequestRegistry (SourceAddress → pending continuation)
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Ack then escalate** - Every delivery is acknowledged; failures are
//!    republished, never redelivered by the broker
//! 2. **Failure is binary** - Any handler error or panic fails the whole delivery
//! 3. **Replies complete once** - A pending request is removed before its
//!    continuation runs
//! 4. **One writer per instance** - Process-manager cycles for one correlation
//!    id never interleave
//!
//! ## Example
//!
//! ```ignore
//! use servicebus::{async_trait, Bus, BusConfig, ConsumeContext, CorrelationId, InMemoryBroker, Message, MessageHandler};
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct Ping { correlation_id: CorrelationId }
//! impl Message for Ping {
//!     fn correlation_id(&self) -> CorrelationId { self.correlation_id }
//!     fn message_type() -> &'static str { "Demo.Ping" }
//! }
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct Pong { correlation_id: CorrelationId }
//! impl Message for Pong {
//!     fn correlation_id(&self) -> CorrelationId { self.correlation_id }
//!     fn message_type() -> &'static str { "Demo.Pong" }
//! }
//!
//! struct Responder;
//!
//! #[async_trait]
//! impl MessageHandler<Ping> for Responder {
//!     async fn handle(&self, ping: Ping, ctx: &ConsumeContext) -> anyhow::Result<()> {
//!         ctx.reply(&Pong { correlation_id: ping.correlation_id }).await?;
//!         Ok(())
//!     }
//! }
//!
//! let broker = InMemoryBroker::new();
//! let server = Bus::builder()
//!     .with_config(BusConfig::new("server"))
//!     .with_transport(broker.clone())
//!     .with_handler::<Ping, _>(Arc::new(Responder))
//!     .build()?;
//! let client = Bus::builder()
//!     .with_config(BusConfig::new("client").with_queue_mapping::<Ping>("server"))
//!     .with_transport(broker)
//!     .build()?;
//!
//! server.start_consuming().await?;
//! client.start_consuming().await?;
//!
//! let pong: Pong = client.send_request(&Ping { correlation_id: CorrelationId::new() }).await?;
//! ```

mod bus;
mod config;
mod consumer;
mod context;
mod core;
mod dispatch;
mod error;
mod handler;
mod memory;
mod persistence;
mod process_manager;
mod request;
mod serializer;
mod transport;

pub use crate::core::{
    exchange_name, CorrelationId, DecodedMessage, HeaderValue, Headers, Message, MESSAGE_ID,
    MESSAGE_TYPE, REPLY_ADDRESS, RETRY_COUNT, SOURCE_ADDRESS, TIME_SENT,
};

pub use bus::{Bus, BusBuilder};
pub use config::{BusConfig, QueueSettings};
pub use consumer::{Consumer, DeliveryHandler, ERROR_EXCHANGE, ERROR_QUEUE};
pub use context::ConsumeContext;
pub use dispatch::Dispatcher;
pub use error::BusError;
pub use handler::{
    handler_fn, FnHandler, HandlerCategory, HandlerReference, HandlerRegistry, MessageHandler,
};
pub use memory::{InMemoryBroker, PublishedMessage, DEFAULT_PUBLISH_LOG_LIMIT};
pub use persistence::{
    InMemoryProcessManagerFinder, ProcessManagerFinder, Revision, StoreError, StoredData,
};
pub use process_manager::{
    ProcessManager, ProcessManagerEngine, ProcessManagerHandler, ProcessState,
    StartProcessManager,
};
pub use request::{PendingRequest, ReplyMatch, RequestRegistry};
pub use serializer::{JsonSerializer, MessageSerializer, MessageTypes, SerializationError, TYPE_FIELD};
pub use transport::{
    Arguments, Channel, Delivery, DeliveryStream, ExchangeKind, Producer, QueueOptions, Transport,
    TransportError, TransportProducer, DEAD_LETTER_EXCHANGE, DEAD_LETTER_ROUTING_KEY,
    DEFAULT_EXCHANGE, MESSAGE_TTL,
};

// Re-export async_trait for convenience
pub use async_trait::async_trait;
