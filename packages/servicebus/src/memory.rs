//! In-process broker.
//!
//! [`InMemoryBroker`] implements [`Transport`] with the AMQP routing model the
//! consumer relies on:
//!
//! - fan-out, direct and default (`""`) exchanges
//! - competing consumers: every stream on a queue shares one receiver
//! - `x-message-ttl` + `x-dead-letter-exchange` (+ `x-dead-letter-routing-key`)
//!   queue arguments. Messages routed to such a queue are held for the TTL and
//!   then re-routed through the dead-letter exchange.
//!
//! It also records what is published through it, so tests can assert on
//! retry and error traffic the same way they would inspect a broker's
//! management UI. The record keeps the most recent
//! [`DEFAULT_PUBLISH_LOG_LIMIT`] messages unless configured otherwise.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::core::Headers;
use crate::transport::{
    Arguments, Channel, Delivery, DeliveryStream, ExchangeKind, QueueOptions, Transport,
    TransportError, DEAD_LETTER_EXCHANGE, DEAD_LETTER_ROUTING_KEY, DEFAULT_EXCHANGE, MESSAGE_TTL,
};

/// How many published messages [`InMemoryBroker::new`] remembers.
pub const DEFAULT_PUBLISH_LOG_LIMIT: usize = 10_000;

/// A message as it was handed to [`Channel::publish`].
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub headers: Headers,
    pub body: Bytes,
}

// =============================================================================
// Broker State
// =============================================================================

#[derive(Debug)]
struct Exchange {
    kind: ExchangeKind,
    durable: bool,
    bindings: Vec<(String, String)>,
}

struct Queue {
    options: QueueOptions,
    sender: mpsc::UnboundedSender<Delivery>,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Delivery>>>,
    depth: Arc<AtomicUsize>,
    held: Arc<AtomicUsize>,
    dead_letter: Option<DeadLetter>,
}

#[derive(Debug, Clone)]
struct DeadLetter {
    ttl: Duration,
    exchange: String,
    routing_key: Option<String>,
}

impl DeadLetter {
    fn from_arguments(arguments: &Arguments) -> Option<Self> {
        let ttl = arguments.get(MESSAGE_TTL)?.as_int()?;
        let exchange = arguments.get_text(DEAD_LETTER_EXCHANGE)?;
        Some(Self {
            ttl: Duration::from_millis(u64::try_from(ttl).ok()?),
            exchange,
            routing_key: arguments.get_text(DEAD_LETTER_ROUTING_KEY),
        })
    }
}

#[derive(Default)]
struct State {
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Queue>,
    unacked: HashMap<u64, String>,
}

struct BrokerInner {
    state: Mutex<State>,
    available: AtomicBool,
    next_tag: AtomicU64,
    channels_opened: AtomicUsize,
    acked: AtomicUsize,
    published: Mutex<PublishLog>,
}

/// Bounded record of published messages; the oldest entry goes first.
struct PublishLog {
    entries: VecDeque<PublishedMessage>,
    limit: usize,
}

impl PublishLog {
    fn push(&mut self, message: PublishedMessage) {
        if self.limit == 0 {
            return;
        }
        if self.entries.len() == self.limit {
            self.entries.pop_front();
        }
        self.entries.push_back(message);
    }
}

impl BrokerInner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_available(&self) -> Result<(), TransportError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::Unavailable(
                "in-memory broker is offline".into(),
            ))
        }
    }

    /// Route a message through `exchange`. Unroutable messages are dropped,
    /// as a broker does without the mandatory flag.
    fn route(
        self: &Arc<Self>,
        exchange: &str,
        routing_key: &str,
        headers: Headers,
        body: Bytes,
    ) -> Result<(), TransportError> {
        let state = self.state();

        let targets: Vec<String> = if exchange == DEFAULT_EXCHANGE {
            vec![routing_key.to_owned()]
        } else {
            let ex = state
                .exchanges
                .get(exchange)
                .ok_or_else(|| TransportError::ExchangeNotFound(exchange.to_owned()))?;
            ex.bindings
                .iter()
                .filter(|(_, key)| ex.kind == ExchangeKind::Fanout || key == routing_key)
                .map(|(queue, _)| queue.clone())
                .collect()
        };

        for target in targets {
            let Some(queue) = state.queues.get(&target) else {
                debug!(queue = %target, "dropping message for undeclared queue");
                continue;
            };

            match &queue.dead_letter {
                Some(dead_letter) => self.hold(
                    queue,
                    dead_letter.clone(),
                    routing_key,
                    headers.clone(),
                    body.clone(),
                ),
                None => {
                    let delivery = Delivery {
                        delivery_tag: self.next_tag.fetch_add(1, Ordering::SeqCst) + 1,
                        exchange: exchange.to_owned(),
                        routing_key: routing_key.to_owned(),
                        headers: headers.clone(),
                        body: body.clone(),
                    };
                    trace!(queue = %target, tag = delivery.delivery_tag, "enqueued");
                    queue.depth.fetch_add(1, Ordering::SeqCst);
                    if queue.sender.send(delivery).is_err() {
                        queue.depth.fetch_sub(1, Ordering::SeqCst);
                    }
                }
            }
        }

        Ok(())
    }

    /// Hold a message for the queue's TTL, then dead-letter it.
    fn hold(
        self: &Arc<Self>,
        queue: &Queue,
        dead_letter: DeadLetter,
        routing_key: &str,
        headers: Headers,
        body: Bytes,
    ) {
        let broker = Arc::clone(self);
        let held = Arc::clone(&queue.held);
        let routing_key = dead_letter
            .routing_key
            .clone()
            .unwrap_or_else(|| routing_key.to_owned());

        held.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            tokio::time::sleep(dead_letter.ttl).await;
            held.fetch_sub(1, Ordering::SeqCst);
            if let Err(e) = broker.route(&dead_letter.exchange, &routing_key, headers, body) {
                debug!(error = %e, exchange = %dead_letter.exchange, "dead-lettering failed");
            }
        });
    }
}

// =============================================================================
// Broker
// =============================================================================

/// An in-process broker. Clones share the same exchanges and queues.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_publish_log_limit(DEFAULT_PUBLISH_LOG_LIMIT)
    }

    /// A broker that remembers at most `limit` published messages. Zero turns
    /// the record off, for long-running processes that never inspect it.
    pub fn with_publish_log_limit(limit: usize) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(State::default()),
                available: AtomicBool::new(true),
                next_tag: AtomicU64::new(0),
                channels_opened: AtomicUsize::new(0),
                acked: AtomicUsize::new(0),
                published: Mutex::new(PublishLog {
                    entries: VecDeque::new(),
                    limit,
                }),
            }),
        }
    }

    /// Take the broker offline (or back online). While offline, opening a
    /// channel or publishing fails with [`TransportError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Recorded publishes, oldest first.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.inner
            .published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .iter()
            .cloned()
            .collect()
    }

    /// Messages published with the given exchange and routing key.
    pub fn published_to(&self, exchange: &str, routing_key: &str) -> Vec<PublishedMessage> {
        self.published()
            .into_iter()
            .filter(|m| m.exchange == exchange && m.routing_key == routing_key)
            .collect()
    }

    pub fn clear_published(&self) {
        self.inner
            .published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .clear();
    }

    pub fn channels_opened(&self) -> usize {
        self.inner.channels_opened.load(Ordering::SeqCst)
    }

    pub fn acked_count(&self) -> usize {
        self.inner.acked.load(Ordering::SeqCst)
    }

    pub fn unacked_count(&self) -> usize {
        self.inner.state().unacked.len()
    }

    pub fn exchange_kind(&self, name: &str) -> Option<ExchangeKind> {
        self.inner.state().exchanges.get(name).map(|e| e.kind)
    }

    pub fn exchange_is_durable(&self, name: &str) -> Option<bool> {
        self.inner.state().exchanges.get(name).map(|e| e.durable)
    }

    /// `(queue, routing key)` pairs bound to an exchange.
    pub fn bindings(&self, exchange: &str) -> Vec<(String, String)> {
        self.inner
            .state()
            .exchanges
            .get(exchange)
            .map(|e| e.bindings.clone())
            .unwrap_or_default()
    }

    pub fn queue_options(&self, name: &str) -> Option<QueueOptions> {
        self.inner.state().queues.get(name).map(|q| q.options.clone())
    }

    /// Messages waiting in a queue.
    pub fn queue_depth(&self, name: &str) -> usize {
        self.inner
            .state()
            .queues
            .get(name)
            .map(|q| q.depth.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Messages parked in a TTL queue, waiting to be dead-lettered.
    pub fn held_count(&self, name: &str) -> usize {
        self.inner
            .state()
            .queues
            .get(name)
            .map(|q| q.held.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Pop one waiting message without a subscription, like `basic.get` with
    /// auto-ack. Returns `None` if the queue is empty or a consumer is
    /// currently receiving from it.
    pub fn try_get(&self, name: &str) -> Option<Delivery> {
        let (receiver, depth) = {
            let state = self.inner.state();
            let queue = state.queues.get(name)?;
            (Arc::clone(&queue.receiver), Arc::clone(&queue.depth))
        };
        let delivery = receiver.try_lock().ok()?.try_recv().ok()?;
        depth.fetch_sub(1, Ordering::SeqCst);
        Some(delivery)
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state();
        f.debug_struct("InMemoryBroker")
            .field("exchanges", &state.exchanges.len())
            .field("queues", &state.queues.len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Transport for InMemoryBroker {
    async fn open_channel(&self) -> Result<Arc<dyn Channel>, TransportError> {
        self.inner.ensure_available()?;
        self.inner.channels_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(InMemoryChannel {
            broker: Arc::clone(&self.inner),
            closed: CancellationToken::new(),
        }))
    }
}

// =============================================================================
// Channel
// =============================================================================

struct InMemoryChannel {
    broker: Arc<BrokerInner>,
    closed: CancellationToken,
}

impl InMemoryChannel {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::ChannelClosed);
        }
        self.broker.ensure_available()
    }
}

#[async_trait]
impl Channel for InMemoryChannel {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut state = self.broker.state();
        if let Some(existing) = state.exchanges.get(name) {
            if existing.kind != kind || existing.durable != durable {
                return Err(TransportError::Other(anyhow::anyhow!(
                    "exchange {name} already declared as {} (durable: {})",
                    existing.kind,
                    existing.durable
                )));
            }
            return Ok(());
        }

        debug!(exchange = %name, %kind, durable, "declared exchange");
        state.exchanges.insert(
            name.to_owned(),
            Exchange {
                kind,
                durable,
                bindings: Vec::new(),
            },
        );
        Ok(())
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: &QueueOptions,
    ) -> Result<String, TransportError> {
        self.ensure_open()?;
        let mut state = self.broker.state();
        if let Some(existing) = state.queues.get(name) {
            if &existing.options != options {
                return Err(TransportError::Other(anyhow::anyhow!(
                    "queue {name} already declared with different options"
                )));
            }
            return Ok(name.to_owned());
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        debug!(queue = %name, durable = options.durable, "declared queue");
        state.queues.insert(
            name.to_owned(),
            Queue {
                options: options.clone(),
                sender,
                receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
                depth: Arc::new(AtomicUsize::new(0)),
                held: Arc::new(AtomicUsize::new(0)),
                dead_letter: DeadLetter::from_arguments(&options.arguments),
            },
        );
        Ok(name.to_owned())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        _arguments: &Arguments,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut state = self.broker.state();
        if !state.queues.contains_key(queue) {
            return Err(TransportError::QueueNotFound(queue.to_owned()));
        }
        let ex = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| TransportError::ExchangeNotFound(exchange.to_owned()))?;

        let binding = (queue.to_owned(), routing_key.to_owned());
        if !ex.bindings.contains(&binding) {
            ex.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        headers: Headers,
        body: Bytes,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.broker
            .published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(PublishedMessage {
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
                headers: headers.clone(),
                body: body.clone(),
            });
        self.broker.route(exchange, routing_key, headers, body)
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        self.ensure_open()?;
        let removed = self.broker.state().unacked.remove(&delivery_tag);
        match removed {
            Some(_) => {
                self.broker.acked.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            None => Err(TransportError::Other(anyhow::anyhow!(
                "unknown delivery tag {delivery_tag}"
            ))),
        }
    }

    async fn consume(&self, queue: &str) -> Result<Box<dyn DeliveryStream>, TransportError> {
        self.ensure_open()?;
        let state = self.broker.state();
        let q = state
            .queues
            .get(queue)
            .ok_or_else(|| TransportError::QueueNotFound(queue.to_owned()))?;

        Ok(Box::new(InMemoryDeliveryStream {
            queue: queue.to_owned(),
            broker: Arc::clone(&self.broker),
            receiver: Arc::clone(&q.receiver),
            depth: Arc::clone(&q.depth),
            closed: self.closed.clone(),
        }))
    }

    async fn close(&self) {
        self.closed.cancel();
    }

    fn is_open(&self) -> bool {
        !self.closed.is_cancelled()
    }
}

struct InMemoryDeliveryStream {
    queue: String,
    broker: Arc<BrokerInner>,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Delivery>>>,
    depth: Arc<AtomicUsize>,
    closed: CancellationToken,
}

#[async_trait]
impl DeliveryStream for InMemoryDeliveryStream {
    async fn next(&mut self) -> Option<Delivery> {
        let delivery = tokio::select! {
            _ = self.closed.cancelled() => None,
            delivery = async { self.receiver.lock().await.recv().await } => delivery,
        }?;

        self.depth.fetch_sub(1, Ordering::SeqCst);
        self.broker
            .state()
            .unacked
            .insert(delivery.delivery_tag, self.queue.clone());
        Some(delivery)
    }
}
