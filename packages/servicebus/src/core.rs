//! Core types for the service bus.
//!
//! # Overview
//!
//! - [`Message`] = an application payload that travels over the broker
//! - [`CorrelationId`] = identity of one causal chain of messages
//! - [`Headers`] = transport metadata attached to every delivery
//! - [`DecodedMessage`] = a deserialized, type-erased message ready for dispatch
//!
//! # Correlation
//!
//! Every message carries a [`CorrelationId`]. It links the messages of one
//! saga instance, or the two halves of a request/reply round-trip. The
//! request/reply engine additionally uses the `SourceAddress` header so that
//! the application's own correlation id is left untouched.

use std::any::{Any, TypeId};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// Reserved Header Keys
// =============================================================================

/// Carries the request/reply correlation id.
pub const SOURCE_ADDRESS: &str = "SourceAddress";

/// Carries the retry escalation count. Written only by the consumer.
pub const RETRY_COUNT: &str = "RetryCount";

/// Wire type name of the payload.
pub const MESSAGE_TYPE: &str = "MessageType";

/// Unique id of one send or publish.
pub const MESSAGE_ID: &str = "MessageId";

/// RFC 3339 timestamp set when the message left the producer.
pub const TIME_SENT: &str = "TimeSent";

/// Queue on which the requester consumes replies.
pub const REPLY_ADDRESS: &str = "ReplyAddress";

// =============================================================================
// Correlation ID
// =============================================================================

/// Correlation ID linking every message of one causal chain.
///
/// Use `CorrelationId::NONE` for messages that are not part of a chain, or
/// `CorrelationId::new()` to start a new one.
///
/// # Example
///
/// ```
/// use servicebus::CorrelationId;
///
/// let cid = CorrelationId::new();
/// assert!(cid.is_some());
///
/// let parsed: CorrelationId = cid.to_string().parse().unwrap();
/// assert_eq!(parsed, cid);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Sentinel value for uncorrelated messages.
    ///
    /// Uses nil UUID (`00000000-0000-0000-0000-000000000000`).
    pub const NONE: Self = Self(Uuid::nil());

    /// Create a new random correlation ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Check if this is the NONE sentinel value.
    pub fn is_none(&self) -> bool {
        self.0.is_nil()
    }

    /// Check if this is a real correlation ID (not NONE).
    pub fn is_some(&self) -> bool {
        !self.is_none()
    }

    /// Get the inner UUID value.
    pub fn into_inner(self) -> Uuid {
        self.0
    }

    /// Get a reference to the inner UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::NONE
    }
}

impl From<Uuid> for CorrelationId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<CorrelationId> for Uuid {
    fn from(cid: CorrelationId) -> Uuid {
        cid.0
    }
}

impl FromStr for CorrelationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

impl fmt::Display for CorrelationId {
    // Always the hyphenated UUID: this string goes on the wire as `SourceAddress`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Headers
// =============================================================================

/// An opaque header value.
///
/// Brokers hand header values back in whatever shape they stored them, so the
/// typed accessors on [`Headers`] accept every variant where it makes sense.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    Bytes(Bytes),
    String(String),
    Int(i64),
}

impl HeaderValue {
    /// Interpret the value as text. Byte values must be valid UTF-8.
    pub fn as_text(&self) -> Option<String> {
        match self {
            HeaderValue::String(s) => Some(s.clone()),
            HeaderValue::Bytes(b) => std::str::from_utf8(b).ok().map(str::to_owned),
            HeaderValue::Int(i) => Some(i.to_string()),
        }
    }

    /// Interpret the value as an integer.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            HeaderValue::Int(i) => Some(*i),
            other => other.as_text()?.trim().parse().ok(),
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::String(value.to_owned())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::String(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<Bytes> for HeaderValue {
    fn from(value: Bytes) -> Self {
        HeaderValue::Bytes(value)
    }
}

/// Headers attached to a transport delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(BTreeMap<String, HeaderValue>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&HeaderValue> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<HeaderValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<HeaderValue> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &HeaderValue)> {
        self.0.iter()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.insert(key, value);
        self
    }

    /// Text value of a header.
    pub fn get_text(&self, key: &str) -> Option<String> {
        self.get(key).and_then(HeaderValue::as_text)
    }

    /// The request/reply correlation id, if present.
    pub fn source_address(&self) -> Option<String> {
        self.get_text(SOURCE_ADDRESS)
    }

    /// The retry count. Missing or unreadable values count as zero.
    pub fn retry_count(&self) -> u32 {
        self.get(RETRY_COUNT)
            .and_then(HeaderValue::as_int)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(0)
    }

    pub fn set_retry_count(&mut self, count: u32) {
        self.insert(RETRY_COUNT, i64::from(count));
    }

    pub fn message_type(&self) -> Option<String> {
        self.get_text(MESSAGE_TYPE)
    }

    pub fn message_id(&self) -> Option<String> {
        self.get_text(MESSAGE_ID)
    }

    pub fn reply_address(&self) -> Option<String> {
        self.get_text(REPLY_ADDRESS)
    }
}

impl FromIterator<(String, HeaderValue)> for Headers {
    fn from_iter<T: IntoIterator<Item = (String, HeaderValue)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

// =============================================================================
// Message
// =============================================================================

/// An application message.
///
/// Messages are immutable once sent. The wire type name defaults to the Rust
/// type path; override [`Message::message_type`] to keep it stable across
/// refactors.
///
/// # Example
///
/// ```
/// use serde::{Deserialize, Serialize};
/// use servicebus::{CorrelationId, Message};
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// struct OrderPlaced {
///     correlation_id: CorrelationId,
///     total: u32,
/// }
///
/// impl Message for OrderPlaced {
///     fn correlation_id(&self) -> CorrelationId {
///         self.correlation_id
///     }
///
///     fn message_type() -> &'static str {
///         "Shop.OrderPlaced"
///     }
/// }
/// ```
pub trait Message: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// The causal chain this message belongs to.
    fn correlation_id(&self) -> CorrelationId;

    /// Stable wire name for this message type.
    fn message_type() -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Exchange name for a message type: the wire name without separators.
pub fn exchange_name(message_type: &str) -> String {
    message_type
        .chars()
        .filter(|c| !matches!(c, '.' | ':'))
        .collect()
}

// =============================================================================
// Decoded Message
// =============================================================================

/// A deserialized message with its type identity erased.
///
/// This is what the dispatch engine routes: handlers downcast back to their
/// concrete type, which always succeeds because routing is keyed by the same
/// type name the decoder was registered under.
#[derive(Clone)]
pub struct DecodedMessage {
    /// Wire type name the payload was decoded as.
    pub type_name: &'static str,
    pub type_id: TypeId,
    pub correlation_id: CorrelationId,
    pub payload: Arc<dyn Any + Send + Sync>,
}

impl DecodedMessage {
    pub fn new<M: Message>(message: M) -> Self {
        Self {
            type_name: M::message_type(),
            type_id: TypeId::of::<M>(),
            correlation_id: message.correlation_id(),
            payload: Arc::new(message),
        }
    }

    /// Downcast the payload to a concrete message type.
    pub fn downcast_ref<M: Any>(&self) -> Option<&M> {
        self.payload.downcast_ref()
    }

    pub fn is<M: Any>(&self) -> bool {
        self.type_id == TypeId::of::<M>()
    }
}

impl fmt::Debug for DecodedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedMessage")
            .field("type_name", &self.type_name)
            .field("correlation_id", &self.correlation_id)
            .finish_non_exhaustive()
    }
}
