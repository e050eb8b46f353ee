//! Queue consumption with retry and dead-letter escalation.
//!
//! # Topology
//!
//! For a work queue `Q` consuming message type `T`:
//!
//! ```text
//! exchange T (fanout) ──────────────────────────────▶ Q ──▶ handler
//!                                                     ▲        │ failed, retries left
//! Q.Retries.DeadLetter (direct, key Q) ───────────────┘        ▼
//!        ▲                                                Q.Retries (TTL = retry delay)
//!        └──────────────── expires ───────────────────────────┘
//!
//! errors (direct) ──▶ errors        ◀── failed, retries exhausted
//! ```
//!
//! # Per delivery
//!
//! Every delivery is acknowledged once the handler returns, whatever the
//! outcome. A failed delivery is then republished: to `Q.Retries` with
//! `RetryCount + 1` while retries remain, otherwise to the `errors` exchange.
//! Republishing is best-effort; a failed republish is logged and the message
//! is lost.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::{BusConfig, QueueSettings};
use crate::core::{exchange_name, Headers};
use crate::error::BusError;
use crate::transport::{
    Arguments, Channel, Delivery, DeliveryStream, ExchangeKind, QueueOptions, Transport,
    DEAD_LETTER_EXCHANGE, DEAD_LETTER_ROUTING_KEY, DEFAULT_EXCHANGE, MESSAGE_TTL,
};

/// Exchange and queue receiving messages that exhausted their retries.
pub const ERROR_EXCHANGE: &str = "errors";
pub const ERROR_QUEUE: &str = "errors";

/// Receives raw deliveries. Returns whether processing succeeded.
#[async_trait]
pub trait DeliveryHandler: Send + Sync + 'static {
    async fn on_message(&self, body: Bytes, headers: &Headers) -> bool;
}

#[derive(Debug, Clone)]
struct Settings {
    retry_delay: Duration,
    max_retries: u32,
    queue: QueueSettings,
}

struct Subscription {
    channel: Arc<dyn Channel>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

/// One subscription to a work queue.
pub struct Consumer {
    transport: Arc<dyn Transport>,
    settings: Settings,
    subscription: tokio::sync::Mutex<Option<Subscription>>,
}

impl Consumer {
    pub fn new(transport: Arc<dyn Transport>, config: &BusConfig) -> Self {
        Self {
            transport,
            settings: Settings {
                retry_delay: config.retry_delay,
                max_retries: config.max_retries,
                queue: config.queue.clone(),
            },
            subscription: tokio::sync::Mutex::new(None),
        }
    }

    /// Declare topology and start delivering `queue_name` to `handler`.
    ///
    /// An empty `message_type_name` subscribes without binding any message
    /// exchange (replies only).
    pub async fn start_consuming(
        &self,
        handler: Arc<dyn DeliveryHandler>,
        message_type_name: &str,
        queue_name: &str,
    ) -> Result<(), BusError> {
        let mut subscription = self.subscription.lock().await;
        if subscription.is_some() {
            return Err(BusError::Config(format!(
                "consumer for {queue_name} is already running"
            )));
        }

        let channel = self.transport.open_channel().await?;
        if let Err(e) = self.declare_topology(&channel, message_type_name, queue_name).await {
            channel.close().await;
            return Err(e);
        }
        let stream = match channel.consume(queue_name).await {
            Ok(stream) => stream,
            Err(e) => {
                channel.close().await;
                return Err(e.into());
            }
        };

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        tokio::spawn(delivery_loop(
            stream,
            DeliveryContext {
                channel: Arc::clone(&channel),
                handler,
                queue: queue_name.to_owned(),
                retry_queue: retry_queue_name(queue_name),
                max_retries: self.settings.max_retries,
            },
            cancel.clone(),
            tracker.clone(),
        ));

        info!(queue = %queue_name, message_type = %message_type_name, "consumer started");
        *subscription = Some(Subscription {
            channel,
            cancel,
            tracker,
        });
        Ok(())
    }

    /// Stop receiving, wait for in-flight deliveries, close the channel.
    ///
    /// Safe to call on a stopped consumer.
    pub async fn stop_consuming(&self) {
        let Some(subscription) = self.subscription.lock().await.take() else {
            return;
        };

        subscription.cancel.cancel();
        subscription.tracker.close();
        subscription.tracker.wait().await;
        subscription.channel.close().await;
        info!("consumer stopped");
    }

    pub async fn is_consuming(&self) -> bool {
        self.subscription.lock().await.is_some()
    }

    async fn declare_topology(
        &self,
        channel: &Arc<dyn Channel>,
        message_type_name: &str,
        queue_name: &str,
    ) -> Result<(), BusError> {
        channel.declare_queue(queue_name, &self.settings.queue).await?;

        if !message_type_name.is_empty() {
            let exchange = exchange_name(message_type_name);
            channel
                .declare_exchange(&exchange, ExchangeKind::Fanout, true)
                .await?;
            channel
                .bind_queue(queue_name, &exchange, "", &Arguments::new())
                .await?;
        }

        let retry_exchange = format!("{queue_name}.Retries.DeadLetter");
        channel
            .declare_exchange(&retry_exchange, ExchangeKind::Direct, true)
            .await?;
        channel
            .bind_queue(queue_name, &retry_exchange, queue_name, &Arguments::new())
            .await?;

        let retry_arguments = Arguments::new()
            .with(MESSAGE_TTL, duration_millis(self.settings.retry_delay))
            .with(DEAD_LETTER_EXCHANGE, retry_exchange.as_str())
            .with(DEAD_LETTER_ROUTING_KEY, queue_name);
        channel
            .declare_queue(
                &retry_queue_name(queue_name),
                &QueueOptions::durable().with_arguments(retry_arguments),
            )
            .await?;

        channel
            .declare_exchange(ERROR_EXCHANGE, ExchangeKind::Direct, true)
            .await?;
        channel
            .declare_queue(ERROR_QUEUE, &QueueOptions::durable())
            .await?;
        channel
            .bind_queue(ERROR_QUEUE, ERROR_EXCHANGE, "", &Arguments::new())
            .await?;

        debug!(queue = %queue_name, message_type = %message_type_name, "topology declared");
        Ok(())
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        if let Ok(mut subscription) = self.subscription.try_lock() {
            if let Some(subscription) = subscription.take() {
                subscription.cancel.cancel();
            }
        }
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

fn retry_queue_name(queue_name: &str) -> String {
    format!("{queue_name}.Retries")
}

fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

// =============================================================================
// Delivery Loop
// =============================================================================

#[derive(Clone)]
struct DeliveryContext {
    channel: Arc<dyn Channel>,
    handler: Arc<dyn DeliveryHandler>,
    queue: String,
    retry_queue: String,
    max_retries: u32,
}

async fn delivery_loop(
    mut stream: Box<dyn DeliveryStream>,
    ctx: DeliveryContext,
    cancel: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        let delivery = tokio::select! {
            _ = cancel.cancelled() => break,
            delivery = stream.next() => delivery,
        };
        let Some(delivery) = delivery else {
            debug!(queue = %ctx.queue, "delivery stream ended");
            break;
        };

        tracker.spawn(handle_delivery(ctx.clone(), delivery));
    }
}

async fn handle_delivery(ctx: DeliveryContext, delivery: Delivery) {
    let Delivery {
        delivery_tag,
        headers,
        body,
        ..
    } = delivery;

    let success = AssertUnwindSafe(ctx.handler.on_message(body.clone(), &headers))
        .catch_unwind()
        .await
        .unwrap_or(false);

    if let Err(e) = ctx.channel.ack(delivery_tag).await {
        warn!(queue = %ctx.queue, delivery_tag, error = %e, "ack failed");
    }

    if success {
        return;
    }

    let mut headers = headers;
    let retry_count = headers.retry_count();
    if retry_count < ctx.max_retries {
        headers.set_retry_count(retry_count + 1);
        debug!(queue = %ctx.queue, retry_count = retry_count + 1, "scheduling retry");
        if let Err(e) = ctx
            .channel
            .publish(DEFAULT_EXCHANGE, &ctx.retry_queue, headers, body)
            .await
        {
            warn!(queue = %ctx.queue, error = %e, "failed to republish for retry");
        }
    } else {
        error!(
            queue = %ctx.queue,
            message_id = ?headers.message_id(),
            message_type = ?headers.message_type(),
            retry_count,
            "max retries reached, moving to error queue"
        );
        if let Err(e) = ctx
            .channel
            .publish(ERROR_EXCHANGE, "", headers, body)
            .await
        {
            warn!(queue = %ctx.queue, error = %e, "failed to publish to error queue");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{MESSAGE_ID, RETRY_COUNT};
    use crate::memory::InMemoryBroker;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails the first `failures` deliveries, then succeeds.
    struct Flaky {
        failures: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DeliveryHandler for Flaky {
        async fn on_message(&self, _body: Bytes, _headers: &Headers) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst) >= self.failures
        }
    }

    struct Panics;

    #[async_trait]
    impl DeliveryHandler for Panics {
        async fn on_message(&self, _body: Bytes, _headers: &Headers) -> bool {
            panic!("handler exploded");
        }
    }

    fn config() -> BusConfig {
        BusConfig::new("work")
            .with_retry_delay(Duration::from_millis(100))
            .with_max_retries(2)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    // =========================================================================
    // Topology
    // =========================================================================

    #[tokio::test]
    async fn test_declares_full_topology() {
        let broker = InMemoryBroker::new();
        let consumer = Consumer::new(Arc::new(broker.clone()), &config());
        let handler = Arc::new(Flaky {
            failures: 0,
            calls: AtomicUsize::new(0),
        });

        consumer
            .start_consuming(handler, "Shop.NewOrder", "work")
            .await
            .unwrap();

        assert_eq!(broker.exchange_kind("ShopNewOrder"), Some(ExchangeKind::Fanout));
        assert_eq!(broker.bindings("ShopNewOrder"), vec![("work".to_string(), "".to_string())]);
        assert_eq!(
            broker.exchange_kind("work.Retries.DeadLetter"),
            Some(ExchangeKind::Direct)
        );
        assert_eq!(
            broker.bindings("work.Retries.DeadLetter"),
            vec![("work".to_string(), "work".to_string())]
        );

        let retry = broker.queue_options("work.Retries").unwrap();
        assert!(retry.durable);
        assert_eq!(retry.arguments.get(MESSAGE_TTL).and_then(|v| v.as_int()), Some(100));
        assert_eq!(
            retry.arguments.get_text(DEAD_LETTER_EXCHANGE).as_deref(),
            Some("work.Retries.DeadLetter")
        );

        assert_eq!(broker.exchange_kind("errors"), Some(ExchangeKind::Direct));
        assert_eq!(broker.bindings("errors"), vec![("errors".to_string(), "".to_string())]);

        consumer.stop_consuming().await;
    }

    #[tokio::test]
    async fn test_empty_message_type_skips_exchange() {
        let broker = InMemoryBroker::new();
        let consumer = Consumer::new(Arc::new(broker.clone()), &config());
        let handler = Arc::new(Flaky {
            failures: 0,
            calls: AtomicUsize::new(0),
        });

        consumer.start_consuming(handler, "", "work").await.unwrap();

        assert!(broker.exchange_kind("").is_none());
        assert!(broker.queue_options("work").is_some());
        consumer.stop_consuming().await;
    }

    #[tokio::test]
    async fn test_unavailable_broker_fails_start() {
        let broker = InMemoryBroker::new();
        broker.set_available(false);
        let consumer = Consumer::new(Arc::new(broker), &config());
        let handler = Arc::new(Flaky {
            failures: 0,
            calls: AtomicUsize::new(0),
        });

        let err = consumer
            .start_consuming(handler, "T", "work")
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(!consumer.is_consuming().await);
    }

    // =========================================================================
    // Escalation
    // =========================================================================

    #[tokio::test]
    async fn test_failure_is_acked_and_retried_once() {
        let broker = InMemoryBroker::new();
        let consumer = Consumer::new(Arc::new(broker.clone()), &config());
        let handler = Arc::new(Flaky {
            failures: 1,
            calls: AtomicUsize::new(0),
        });

        consumer
            .start_consuming(handler.clone(), "T", "work")
            .await
            .unwrap();

        let publisher = broker.open_channel().await.unwrap();
        publisher
            .publish("", "work", Headers::new().with(MESSAGE_ID, "m-1"), Bytes::from_static(b"{}"))
            .await
            .unwrap();

        // First attempt fails, retry arrives after the TTL and succeeds.
        wait_until(|| handler.calls.load(Ordering::SeqCst) == 2).await;
        wait_until(|| broker.acked_count() == 2).await;

        let retries = broker.published_to("", "work.Retries");
        assert_eq!(retries.len(), 1);
        assert_eq!(retries[0].headers.retry_count(), 1);
        assert_eq!(retries[0].headers.message_id().as_deref(), Some("m-1"));
        assert!(broker.published_to("errors", "").is_empty());

        consumer.stop_consuming().await;
    }

    #[tokio::test]
    async fn test_exhausted_retries_go_to_errors() {
        let broker = InMemoryBroker::new();
        let consumer = Consumer::new(Arc::new(broker.clone()), &config());
        let handler = Arc::new(Flaky {
            failures: usize::MAX,
            calls: AtomicUsize::new(0),
        });

        consumer
            .start_consuming(handler.clone(), "T", "work")
            .await
            .unwrap();

        let publisher = broker.open_channel().await.unwrap();
        publisher
            .publish(
                "",
                "work",
                Headers::new().with(RETRY_COUNT, 2i64),
                Bytes::from_static(b"{}"),
            )
            .await
            .unwrap();

        wait_until(|| broker.queue_depth("errors") == 1).await;
        assert!(broker.published_to("", "work.Retries").is_empty());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

        consumer.stop_consuming().await;
    }

    #[tokio::test]
    async fn test_panicking_handler_counts_as_failure() {
        let broker = InMemoryBroker::new();
        let consumer = Consumer::new(Arc::new(broker.clone()), &config());

        consumer
            .start_consuming(Arc::new(Panics), "T", "work")
            .await
            .unwrap();

        let publisher = broker.open_channel().await.unwrap();
        publisher
            .publish("", "work", Headers::new(), Bytes::from_static(b"{}"))
            .await
            .unwrap();

        wait_until(|| broker.published_to("", "work.Retries").len() == 1).await;
        consumer.stop_consuming().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let broker = InMemoryBroker::new();
        let consumer = Consumer::new(Arc::new(broker), &config());
        let handler = Arc::new(Flaky {
            failures: 0,
            calls: AtomicUsize::new(0),
        });

        consumer.start_consuming(handler, "T", "work").await.unwrap();
        assert!(consumer.is_consuming().await);

        consumer.stop_consuming().await;
        consumer.stop_consuming().await;
        assert!(!consumer.is_consuming().await);
    }
}
