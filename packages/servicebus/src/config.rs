use std::collections::HashMap;
use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;

use crate::core::Message;
use crate::transport::QueueOptions;

/// Settings for the bus's work queue.
pub type QueueSettings = QueueOptions;

/// Bus configuration.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Work queue this bus consumes from. Replies to its requests arrive here too.
    pub queue_name: String,
    /// How long a failed message waits in the retry queue.
    pub retry_delay: Duration,
    /// Retries before a message is moved to the `errors` queue.
    pub max_retries: u32,
    pub queue: QueueSettings,
    /// Message type name → destination queue, for `send`.
    pub queue_mappings: HashMap<String, String>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_name: "servicebus".to_string(),
            retry_delay: Duration::from_secs(3),
            max_retries: 3,
            queue: QueueSettings::durable(),
            queue_mappings: HashMap::new(),
        }
    }
}

impl BusConfig {
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            ..Self::default()
        }
    }

    /// Load configuration from environment variables
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `SERVICEBUS_QUEUE` | `servicebus` |
    /// | `SERVICEBUS_RETRY_DELAY_MS` | `3000` |
    /// | `SERVICEBUS_MAX_RETRIES` | `3` |
    /// | `SERVICEBUS_QUEUE_DURABLE` | `true` |
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        dotenv().ok();

        let defaults = Self::default();
        Ok(Self {
            queue_name: env::var("SERVICEBUS_QUEUE").unwrap_or(defaults.queue_name),
            retry_delay: Duration::from_millis(
                env::var("SERVICEBUS_RETRY_DELAY_MS")
                    .unwrap_or_else(|_| "3000".to_string())
                    .parse()
                    .context("SERVICEBUS_RETRY_DELAY_MS must be a number of milliseconds")?,
            ),
            max_retries: env::var("SERVICEBUS_MAX_RETRIES")
                .unwrap_or_else(|_| "3".to_string())
                .parse()
                .context("SERVICEBUS_MAX_RETRIES must be a valid number")?,
            queue: QueueSettings {
                durable: env::var("SERVICEBUS_QUEUE_DURABLE")
                    .unwrap_or_else(|_| "true".to_string())
                    .parse()
                    .context("SERVICEBUS_QUEUE_DURABLE must be true or false")?,
                ..defaults.queue
            },
            queue_mappings: defaults.queue_mappings,
        })
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_queue_settings(mut self, settings: QueueSettings) -> Self {
        self.queue = settings;
        self
    }

    /// Route `send::<M>` to `queue`.
    pub fn add_queue_mapping<M: Message>(&mut self, queue: impl Into<String>) -> &mut Self {
        self.queue_mappings
            .insert(M::message_type().to_string(), queue.into());
        self
    }

    pub fn with_queue_mapping<M: Message>(mut self, queue: impl Into<String>) -> Self {
        self.add_queue_mapping::<M>(queue);
        self
    }
}
