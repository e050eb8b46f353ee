//! Wire serialization.
//!
//! The bus moves messages as text. A [`MessageSerializer`] turns a message
//! into text and back; a [`MessageTypes`] registry knows how to materialize
//! each registered message type from any serde format.
//!
//! Decoders are stored type-erased through `erased_serde`, so the registry
//! is shared by every serializer implementation and a new wire format only
//! has to provide a `serde::Deserializer`.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;

use crate::core::{DecodedMessage, Message};

/// Field that names the message type inside a payload, for senders that do
/// not set the `MessageType` header.
pub const TYPE_FIELD: &str = "$type";

/// Errors from encoding or decoding a payload.
#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("payload does not carry a $type field")]
    MissingTypeField,

    #[error("failed to decode {message_type}: {source}")]
    Decode {
        message_type: String,
        #[source]
        source: erased_serde::Error,
    },

    #[error("failed to encode {message_type}: {source}")]
    Encode {
        message_type: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),
}

// =============================================================================
// Message Type Registry
// =============================================================================

type DecodeFn =
    for<'de> fn(&mut dyn erased_serde::Deserializer<'de>) -> Result<DecodedMessage, erased_serde::Error>;

fn decode<M: Message>(
    deserializer: &mut dyn erased_serde::Deserializer<'_>,
) -> Result<DecodedMessage, erased_serde::Error> {
    let message: M = erased_serde::deserialize(deserializer)?;
    Ok(DecodedMessage::new(message))
}

/// Registry of decodable message types, keyed by wire type name.
///
/// Cloning is cheap; clones share the same table.
#[derive(Clone, Default)]
pub struct MessageTypes {
    decoders: Arc<DashMap<String, DecodeFn>>,
}

impl MessageTypes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `M` under [`Message::message_type`]. Registering twice is a
    /// no-op.
    pub fn register<M: Message>(&self) {
        self.decoders
            .insert(M::message_type().to_owned(), decode::<M> as DecodeFn);
    }

    pub fn contains(&self, message_type: &str) -> bool {
        self.decoders.contains_key(message_type)
    }

    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }

    /// Registered type names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.decoders.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Decode a payload of `message_type` from any erased deserializer.
    pub fn decode(
        &self,
        message_type: &str,
        deserializer: &mut dyn erased_serde::Deserializer<'_>,
    ) -> Result<DecodedMessage, SerializationError> {
        let decoder = *self
            .decoders
            .get(message_type)
            .ok_or_else(|| SerializationError::UnknownMessageType(message_type.to_owned()))?;

        decoder(deserializer).map_err(|source| SerializationError::Decode {
            message_type: message_type.to_owned(),
            source,
        })
    }
}

impl fmt::Debug for MessageTypes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageTypes")
            .field("types", &self.names())
            .finish()
    }
}

// =============================================================================
// Serializer
// =============================================================================

/// Converts messages to and from their wire text.
pub trait MessageSerializer: Send + Sync + 'static {
    /// MIME type of the produced text.
    fn content_type(&self) -> &'static str;

    fn serialize(
        &self,
        message_type: &str,
        message: &dyn erased_serde::Serialize,
    ) -> Result<String, SerializationError>;

    /// Decode text known to be of `message_type`.
    fn deserialize(
        &self,
        types: &MessageTypes,
        message_type: &str,
        text: &str,
    ) -> Result<DecodedMessage, SerializationError>;

    /// Decode text whose type is named inside the payload itself.
    fn deserialize_inferred(
        &self,
        types: &MessageTypes,
        text: &str,
    ) -> Result<DecodedMessage, SerializationError>;
}

/// JSON via `serde_json`. Fields are written in declaration order.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl JsonSerializer {
    pub fn new() -> Self {
        Self
    }
}

impl MessageSerializer for JsonSerializer {
    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn serialize(
        &self,
        message_type: &str,
        message: &dyn erased_serde::Serialize,
    ) -> Result<String, SerializationError> {
        serde_json::to_string(message).map_err(|source| SerializationError::Encode {
            message_type: message_type.to_owned(),
            source,
        })
    }

    fn deserialize(
        &self,
        types: &MessageTypes,
        message_type: &str,
        text: &str,
    ) -> Result<DecodedMessage, SerializationError> {
        let mut json = serde_json::Deserializer::from_str(text);
        let decoded = {
            let mut erased = <dyn erased_serde::Deserializer>::erase(&mut json);
            types.decode(message_type, &mut erased)?
        };
        json.end()?;
        Ok(decoded)
    }

    fn deserialize_inferred(
        &self,
        types: &MessageTypes,
        text: &str,
    ) -> Result<DecodedMessage, SerializationError> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        let message_type = value
            .get(TYPE_FIELD)
            .and_then(serde_json::Value::as_str)
            .ok_or(SerializationError::MissingTypeField)?
            .to_owned();

        let mut erased = <dyn erased_serde::Deserializer>::erase(value);
        types.decode(&message_type, &mut erased)
    }
}
