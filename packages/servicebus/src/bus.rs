//! The bus handle.
//!
//! [`Bus`] ties the pieces together: it serializes and sends outgoing
//! messages through a [`Producer`], owns the consumers of its work queue, and
//! routes every delivery through the [`Dispatcher`].
//!
//! # Example
//!
//! ```ignore
//! let broker = InMemoryBroker::new();
//! let bus = Bus::builder()
//!     .with_config(BusConfig::new("Kitchen"))
//!     .with_transport(broker.clone())
//!     .with_handler::<CookBurger, _>(Arc::new(Grill))
//!     .build()?;
//!
//! bus.start_consuming().await?;
//! bus.publish(&BurgerCooked { correlation_id }).await?;
//! ```
//!
//! Cloning a `Bus` is cheap; clones share consumers, pending requests and
//! process-manager locks.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use tokio::sync::oneshot;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::BusConfig;
use crate::consumer::{Consumer, DeliveryHandler};
use crate::core::{
    CorrelationId, DecodedMessage, Headers, Message, MESSAGE_ID, MESSAGE_TYPE, REPLY_ADDRESS,
    SOURCE_ADDRESS, TIME_SENT,
};
use crate::dispatch::Dispatcher;
use crate::error::BusError;
use crate::handler::{HandlerRegistry, MessageHandler};
use crate::persistence::{InMemoryProcessManagerFinder, ProcessManagerFinder};
use crate::process_manager::{ProcessManagerEngine, ProcessManagerHandler, StartProcessManager};
use crate::request::{PendingRequest, RequestRegistry};
use crate::serializer::{JsonSerializer, MessageSerializer};
use crate::transport::{Producer, Transport, TransportProducer};

struct BusInner {
    config: BusConfig,
    transport: Option<Arc<dyn Transport>>,
    producer: Arc<dyn Producer>,
    serializer: Arc<dyn MessageSerializer>,
    registry: HandlerRegistry,
    process_managers: ProcessManagerEngine,
    requests: RequestRegistry,
    consumers: tokio::sync::Mutex<Vec<Consumer>>,
    stopping: AtomicBool,
}

/// Handle to a message bus.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Bus {
    pub fn builder() -> BusBuilder {
        BusBuilder::new()
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// The work queue this bus consumes.
    pub fn queue_name(&self) -> &str {
        &self.inner.config.queue_name
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.inner.registry
    }

    pub fn serializer(&self) -> &dyn MessageSerializer {
        self.inner.serializer.as_ref()
    }

    /// Requests still waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.inner.requests.len()
    }

    pub(crate) fn requests(&self) -> &RequestRegistry {
        &self.inner.requests
    }

    pub(crate) fn process_managers(&self) -> &ProcessManagerEngine {
        &self.inner.process_managers
    }

    // =========================================================================
    // Sending
    // =========================================================================

    /// Publish to every queue subscribed to `M`.
    pub async fn publish<M: Message>(&self, message: &M) -> Result<(), BusError> {
        self.publish_with_headers(message, Headers::new()).await
    }

    pub async fn publish_with_headers<M: Message>(
        &self,
        message: &M,
        headers: Headers,
    ) -> Result<(), BusError> {
        let (body, headers) = self.encode(message, headers)?;
        debug!(message_type = M::message_type(), "publish");
        self.inner
            .producer
            .publish(M::message_type(), body, headers)
            .await?;
        Ok(())
    }

    /// Send to the queue mapped for `M`.
    pub async fn send<M: Message>(&self, message: &M) -> Result<(), BusError> {
        self.send_with_headers(message, Headers::new()).await
    }

    pub async fn send_with_headers<M: Message>(
        &self,
        message: &M,
        headers: Headers,
    ) -> Result<(), BusError> {
        let (body, headers) = self.encode(message, headers)?;
        debug!(message_type = M::message_type(), "send");
        let sent = self
            .inner
            .producer
            .send(M::message_type(), body, headers)
            .await?;
        if !sent {
            return Err(BusError::NoQueueMapping {
                message_type: M::message_type().to_string(),
            });
        }
        Ok(())
    }

    /// Send straight to `endpoint`.
    pub async fn send_to<M: Message>(&self, endpoint: &str, message: &M) -> Result<(), BusError> {
        self.send_to_with_headers(endpoint, message, Headers::new())
            .await
    }

    pub async fn send_to_with_headers<M: Message>(
        &self,
        endpoint: &str,
        message: &M,
        headers: Headers,
    ) -> Result<(), BusError> {
        let (body, headers) = self.encode(message, headers)?;
        debug!(message_type = M::message_type(), queue = %endpoint, "send");
        self.inner
            .producer
            .send_to(endpoint, M::message_type(), body, headers)
            .await?;
        Ok(())
    }

    /// Serialize `message` and stamp the standard headers.
    ///
    /// `MessageType` and `TimeSent` are always set by the bus and replace any
    /// caller value. A caller-supplied `MessageId` is kept; otherwise a new
    /// one is generated.
    fn encode<M: Message>(&self, message: &M, mut headers: Headers) -> Result<(Bytes, Headers), BusError> {
        let text = self.inner.serializer.serialize(M::message_type(), message)?;
        headers.insert(MESSAGE_TYPE, M::message_type());
        if !headers.contains_key(MESSAGE_ID) {
            headers.insert(MESSAGE_ID, Uuid::now_v7().to_string());
        }
        headers.insert(TIME_SENT, Utc::now().to_rfc3339());
        Ok((Bytes::from(text), headers))
    }

    // =========================================================================
    // Request / Reply
    // =========================================================================

    /// Send `message` and wait for a reply of type `Rep`.
    ///
    /// Waits indefinitely; use [`Bus::send_request_timeout`] to bound it.
    pub async fn send_request<Req, Rep>(&self, message: &Req) -> Result<Rep, BusError>
    where
        Req: Message,
        Rep: Message,
    {
        let (id, rx) = self.request_with_receiver::<Req, Rep>(None, message).await?;
        rx.await
            .map_err(|_| BusError::RequestCancelled { correlation_id: id })?
    }

    /// Like [`Bus::send_request`], to an explicit queue.
    pub async fn send_request_to<Req, Rep>(&self, endpoint: &str, message: &Req) -> Result<Rep, BusError>
    where
        Req: Message,
        Rep: Message,
    {
        let (id, rx) = self
            .request_with_receiver::<Req, Rep>(Some(endpoint), message)
            .await?;
        rx.await
            .map_err(|_| BusError::RequestCancelled { correlation_id: id })?
    }

    /// Like [`Bus::send_request`], giving up after `timeout`.
    ///
    /// On timeout the pending request is dropped, so a late reply is ignored.
    pub async fn send_request_timeout<Req, Rep>(&self, message: &Req, timeout: Duration) -> Result<Rep, BusError>
    where
        Req: Message,
        Rep: Message,
    {
        let (id, rx) = self.request_with_receiver::<Req, Rep>(None, message).await?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(reply) => reply.map_err(|_| BusError::RequestCancelled { correlation_id: id })?,
            Err(_) => {
                self.inner.requests.remove(&id);
                Err(BusError::RequestTimeout {
                    correlation_id: id,
                    duration: timeout,
                })
            }
        }
    }

    /// Send `message`; `callback` runs once with the reply.
    pub async fn send_request_with_callback<Req, Rep, F>(&self, message: &Req, callback: F) -> Result<(), BusError>
    where
        Req: Message,
        Rep: Message,
        F: FnOnce(Rep) + Send + 'static,
    {
        self.request::<Req, Rep>(None, message, callback_continuation(callback))
            .await
            .map(|_| ())
    }

    pub async fn send_request_with_callback_to<Req, Rep, F>(
        &self,
        endpoint: &str,
        message: &Req,
        callback: F,
    ) -> Result<(), BusError>
    where
        Req: Message,
        Rep: Message,
        F: FnOnce(Rep) + Send + 'static,
    {
        self.request::<Req, Rep>(Some(endpoint), message, callback_continuation(callback))
            .await
            .map(|_| ())
    }

    async fn request_with_receiver<Req, Rep>(
        &self,
        endpoint: Option<&str>,
        message: &Req,
    ) -> Result<(String, oneshot::Receiver<Result<Rep, BusError>>), BusError>
    where
        Req: Message,
        Rep: Message,
    {
        let (tx, rx) = oneshot::channel();
        let continuation = Box::new(move |reply: DecodedMessage| {
            let result = reply
                .downcast_ref::<Rep>()
                .cloned()
                .ok_or(BusError::UnexpectedReply {
                    expected: Rep::message_type(),
                    actual: reply.type_name,
                });
            // The requester may have stopped waiting.
            let _ = tx.send(result);
        });
        let id = self.request::<Req, Rep>(endpoint, message, continuation).await?;
        Ok((id, rx))
    }

    /// Register the pending request, then send. Returns the `SourceAddress`.
    async fn request<Req, Rep>(
        &self,
        endpoint: Option<&str>,
        message: &Req,
        continuation: Box<dyn FnOnce(DecodedMessage) + Send>,
    ) -> Result<String, BusError>
    where
        Req: Message,
        Rep: Message,
    {
        self.inner.registry.types().register::<Rep>();

        let id = CorrelationId::new().to_string();
        self.inner
            .requests
            .register(id.clone(), PendingRequest::new(Rep::message_type(), continuation));

        // A request registered after stop_consuming drained the registry
        // could never be answered.
        if self.inner.stopping.load(Ordering::SeqCst) {
            self.inner.requests.remove(&id);
            return Err(BusError::RequestCancelled { correlation_id: id });
        }

        let headers = Headers::new()
            .with(SOURCE_ADDRESS, id.clone())
            .with(REPLY_ADDRESS, self.queue_name());
        let sent = match endpoint {
            Some(endpoint) => self.send_to_with_headers(endpoint, message, headers).await,
            None => self.send_with_headers(message, headers).await,
        };

        if let Err(e) = sent {
            self.inner.requests.remove(&id);
            return Err(e);
        }
        Ok(id)
    }

    // =========================================================================
    // Consuming
    // =========================================================================

    /// Start one consumer on the work queue per handled message type.
    ///
    /// With no handlers a single consumer still runs so replies to this bus's
    /// requests are received. Calling this while consuming is a no-op.
    pub async fn start_consuming(&self) -> Result<(), BusError> {
        let transport = self.inner.transport.clone().ok_or_else(|| {
            BusError::Config("consuming requires a transport (BusBuilder::with_transport)".into())
        })?;

        let mut consumers = self.inner.consumers.lock().await;
        if !consumers.is_empty() {
            return Ok(());
        }

        let receiver: Arc<dyn DeliveryHandler> = Arc::new(BusReceiver {
            bus: Arc::downgrade(&self.inner),
        });

        let mut message_types = self.inner.registry.message_types();
        if message_types.is_empty() {
            message_types.push("");
        }

        for message_type in message_types {
            let consumer = Consumer::new(Arc::clone(&transport), &self.inner.config);
            if let Err(e) = consumer
                .start_consuming(Arc::clone(&receiver), message_type, self.queue_name())
                .await
            {
                for started in consumers.drain(..) {
                    started.stop_consuming().await;
                }
                return Err(e);
            }
            consumers.push(consumer);
        }

        info!(queue = %self.queue_name(), consumers = consumers.len(), "bus consuming");
        Ok(())
    }

    /// Stop every consumer. In-flight deliveries finish first.
    ///
    /// Replies can only arrive through the consumers being stopped, so every
    /// pending request is cancelled up front. Callers waiting on
    /// [`Bus::send_request`] get [`BusError::RequestCancelled`], and so do
    /// requests issued while the stop is in progress.
    pub async fn stop_consuming(&self) {
        self.inner.stopping.store(true, Ordering::SeqCst);
        let cancelled = self.inner.requests.cancel_all();
        if cancelled > 0 {
            info!(queue = %self.queue_name(), cancelled, "pending requests cancelled");
        }

        let consumers: Vec<Consumer> = self.inner.consumers.lock().await.drain(..).collect();
        for consumer in &consumers {
            consumer.stop_consuming().await;
        }
        self.inner.stopping.store(false, Ordering::SeqCst);
    }

    pub async fn is_consuming(&self) -> bool {
        !self.inner.consumers.lock().await.is_empty()
    }

    /// Stop consuming and disconnect the producer.
    pub async fn shutdown(&self) {
        self.stop_consuming().await;
        self.inner.producer.disconnect().await;
        info!(queue = %self.queue_name(), "bus shut down");
    }

    /// Dispatch one raw delivery as if it had arrived from the broker.
    pub async fn consume_message_event(&self, body: &[u8], headers: &Headers) -> bool {
        Dispatcher::new(self.clone())
            .consume_message_event(body, headers)
            .await
    }
}

fn callback_continuation<Rep, F>(callback: F) -> Box<dyn FnOnce(DecodedMessage) + Send>
where
    Rep: Message,
    F: FnOnce(Rep) + Send + 'static,
{
    Box::new(move |reply: DecodedMessage| match reply.downcast_ref::<Rep>() {
        Some(reply) => callback(reply.clone()),
        None => tracing::warn!(
            expected = Rep::message_type(),
            actual = reply.type_name,
            "reply payload has an unexpected type"
        ),
    })
}

impl fmt::Debug for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bus")
            .field("queue", &self.inner.config.queue_name)
            .field("registry", &self.inner.registry)
            .field("pending_requests", &self.inner.requests.len())
            .finish_non_exhaustive()
    }
}

/// Consumer callback. Holds the bus weakly so consumers owned by the bus do
/// not keep it alive.
struct BusReceiver {
    bus: Weak<BusInner>,
}

#[async_trait]
impl DeliveryHandler for BusReceiver {
    async fn on_message(&self, body: Bytes, headers: &Headers) -> bool {
        let Some(inner) = self.bus.upgrade() else {
            return false;
        };
        Bus { inner }.consume_message_event(&body, headers).await
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`Bus`].
///
/// A transport is required to consume. Sending needs either a transport (a
/// [`TransportProducer`] is created over it) or an explicit producer.
#[derive(Default)]
pub struct BusBuilder {
    config: BusConfig,
    transport: Option<Arc<dyn Transport>>,
    producer: Option<Arc<dyn Producer>>,
    serializer: Option<Arc<dyn MessageSerializer>>,
    finder: Option<Arc<dyn ProcessManagerFinder>>,
    registry: HandlerRegistry,
}

impl BusBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: BusConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_transport(mut self, transport: impl Transport) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    pub fn with_producer(mut self, producer: impl Producer) -> Self {
        self.producer = Some(Arc::new(producer));
        self
    }

    pub fn with_serializer(mut self, serializer: impl MessageSerializer) -> Self {
        self.serializer = Some(Arc::new(serializer));
        self
    }

    pub fn with_process_manager_finder(mut self, finder: Arc<dyn ProcessManagerFinder>) -> Self {
        self.finder = Some(finder);
        self
    }

    pub fn with_handler<M, H>(mut self, handler: Arc<H>) -> Self
    where
        M: Message,
        H: MessageHandler<M>,
    {
        self.registry.register_handler::<M, H>(handler);
        self
    }

    pub fn with_process_manager_start<M, P>(mut self, process_manager: Arc<P>) -> Self
    where
        M: Message,
        P: StartProcessManager<M>,
    {
        self.registry
            .register_process_manager_start::<M, P>(process_manager);
        self
    }

    pub fn with_process_manager_handler<M, P>(mut self, process_manager: Arc<P>) -> Self
    where
        M: Message,
        P: ProcessManagerHandler<M>,
    {
        self.registry
            .register_process_manager_handler::<M, P>(process_manager);
        self
    }

    /// Make `M` decodable on this bus without handling it.
    pub fn with_message_type<M: Message>(mut self) -> Self {
        self.registry.register_message_type::<M>();
        self
    }

    pub fn build(self) -> Result<Bus, BusError> {
        if self.config.queue_name.is_empty() {
            return Err(BusError::Config("queue name must not be empty".into()));
        }

        let producer: Arc<dyn Producer> = match (self.producer, &self.transport) {
            (Some(producer), _) => producer,
            (None, Some(transport)) => Arc::new(TransportProducer::with_queue_mappings(
                Arc::clone(transport),
                self.config.queue_mappings.clone(),
            )),
            (None, None) => {
                return Err(BusError::Config(
                    "a transport or a producer is required".into(),
                ))
            }
        };

        let finder = self
            .finder
            .unwrap_or_else(|| Arc::new(InMemoryProcessManagerFinder::new()));

        Ok(Bus {
            inner: Arc::new(BusInner {
                config: self.config,
                transport: self.transport,
                producer,
                serializer: self.serializer.unwrap_or_else(|| Arc::new(JsonSerializer::new())),
                registry: self.registry,
                process_managers: ProcessManagerEngine::new(finder),
                requests: RequestRegistry::new(),
                consumers: tokio::sync::Mutex::new(Vec::new()),
                stopping: AtomicBool::new(false),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryBroker;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Greet {
        correlation_id: CorrelationId,
        name: String,
    }

    impl Message for Greet {
        fn correlation_id(&self) -> CorrelationId {
            self.correlation_id
        }

        fn message_type() -> &'static str {
            "Tests.Greet"
        }
    }

    fn greet() -> Greet {
        Greet {
            correlation_id: CorrelationId::new(),
            name: "ada".into(),
        }
    }

    #[test]
    fn test_build_requires_transport_or_producer() {
        let err = Bus::builder().build().unwrap_err();
        assert!(matches!(err, BusError::Config(_)));
    }

    #[tokio::test]
    async fn test_start_consuming_requires_transport() {
        let bus = Bus::builder()
            .with_producer(TransportProducer::new(Arc::new(InMemoryBroker::new())))
            .build()
            .unwrap();
        assert!(matches!(
            bus.start_consuming().await,
            Err(BusError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_outgoing_headers() {
        let broker = InMemoryBroker::new();
        let bus = Bus::builder().with_transport(broker.clone()).build().unwrap();

        bus.send_to("elsewhere", &greet()).await.unwrap();

        let sent = broker.published_to("", "elsewhere");
        assert_eq!(sent.len(), 1);
        let headers = &sent[0].headers;
        assert_eq!(headers.message_type().as_deref(), Some("Tests.Greet"));
        assert!(headers.message_id().is_some());
        assert!(headers.contains_key(TIME_SENT));
        assert!(headers.source_address().is_none());
    }

    #[tokio::test]
    async fn test_caller_headers_and_reserved_keys() {
        let broker = InMemoryBroker::new();
        let bus = Bus::builder().with_transport(broker.clone()).build().unwrap();

        let headers = Headers::new()
            .with(MESSAGE_ID, "order-17")
            .with(MESSAGE_TYPE, "Tests.Spoofed")
            .with(TIME_SENT, "yesterday")
            .with("Tenant", "north");
        bus.send_to_with_headers("elsewhere", &greet(), headers)
            .await
            .unwrap();

        let sent = &broker.published_to("", "elsewhere")[0].headers;
        assert_eq!(sent.message_id().as_deref(), Some("order-17"));
        assert_eq!(sent.message_type().as_deref(), Some("Tests.Greet"));
        assert_ne!(sent.get_text(TIME_SENT).as_deref(), Some("yesterday"));
        assert_eq!(sent.get_text("Tenant").as_deref(), Some("north"));
    }

    #[tokio::test]
    async fn test_send_without_mapping() {
        let bus = Bus::builder()
            .with_transport(InMemoryBroker::new())
            .build()
            .unwrap();

        let err = bus.send(&greet()).await.unwrap_err();
        assert!(matches!(err, BusError::NoQueueMapping { .. }));
    }

    #[tokio::test]
    async fn test_failed_request_send_leaves_nothing_pending() {
        let bus = Bus::builder()
            .with_transport(InMemoryBroker::new())
            .build()
            .unwrap();

        let err = bus
            .send_request_with_callback::<Greet, Greet, _>(&greet(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::NoQueueMapping { .. }));
        assert_eq!(bus.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_request_timeout_removes_pending_entry() {
        let bus = Bus::builder()
            .with_config(BusConfig::new("client").with_queue_mapping::<Greet>("nobody"))
            .with_transport(InMemoryBroker::new())
            .build()
            .unwrap();

        let err = bus
            .send_request_timeout::<Greet, Greet>(&greet(), Duration::from_millis(20))
            .await
            .unwrap_err();

        assert!(matches!(err, BusError::RequestTimeout { .. }));
        assert_eq!(bus.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_consume_message_event_without_handlers() {
        let bus = Bus::builder()
            .with_transport(InMemoryBroker::new())
            .with_message_type::<Greet>()
            .build()
            .unwrap();

        let body = serde_json::to_vec(&greet()).unwrap();
        let headers = Headers::new().with(MESSAGE_TYPE, "Tests.Greet");
        assert!(bus.consume_message_event(&body, &headers).await);

        let unknown = Headers::new().with(MESSAGE_TYPE, "Tests.Unknown");
        assert!(!bus.consume_message_event(&body, &unknown).await);
    }
}
