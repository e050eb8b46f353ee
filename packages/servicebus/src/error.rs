//! Structured errors for the service bus.
//!
//! `BusError` provides pattern-matchable errors at the framework boundary.
//! Application handlers return `anyhow::Result`; whatever they return is
//! logged by the dispatch engine and folded into the delivery's success flag.
//!
//! # The Error Boundary Rule
//!
//! > **No handler error ever escapes the consumer.**
//!
//! - Handler, process-manager and deserialization failures become a `false`
//!   delivery result, which drives retry and dead-lettering.
//! - Only setup failures (connecting, declaring topology) and caller-facing
//!   operations (`publish`, `send`, `send_request`) return `BusError`.

use std::time::Duration;

use thiserror::Error;

use crate::persistence::StoreError;
use crate::serializer::SerializationError;
use crate::transport::TransportError;

/// Errors returned by bus operations.
#[derive(Debug, Error)]
pub enum BusError {
    /// The broker rejected an operation or could not be reached.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A payload could not be serialized or deserialized.
    #[error(transparent)]
    Serialization(#[from] SerializationError),

    /// `send` was called for a message type with no queue mapping.
    #[error("no queue mapping for message type {message_type}")]
    NoQueueMapping { message_type: String },

    /// Process-manager state could not be loaded or saved.
    #[error("process manager store error: {0}")]
    Store(#[from] StoreError),

    /// One or more handlers failed while dispatching a delivery.
    #[error("{failed} of {total} handlers failed for {message_type}: {first_error}")]
    Handlers {
        message_type: String,
        failed: usize,
        total: usize,
        first_error: String,
    },

    /// The pending request was dropped before a reply arrived.
    #[error("request {correlation_id} was cancelled before a reply arrived")]
    RequestCancelled { correlation_id: String },

    /// No reply arrived within the caller's deadline.
    #[error("request {correlation_id} timed out after {duration:?}")]
    RequestTimeout {
        correlation_id: String,
        duration: Duration,
    },

    /// The reply had a different type than the request expected.
    #[error("expected reply of type {expected}, got {actual}")]
    UnexpectedReply {
        expected: &'static str,
        actual: &'static str,
    },

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl BusError {
    /// Returns true if retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BusError::Transport(TransportError::Unavailable(_))
                | BusError::Transport(TransportError::ChannelClosed)
                | BusError::Store(StoreError::Conflict)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handlers_error_display() {
        let err = BusError::Handlers {
            message_type: "Shop.NewOrder".into(),
            failed: 1,
            total: 2,
            first_error: "boom".into(),
        };
        assert_eq!(
            err.to_string(),
            "1 of 2 handlers failed for Shop.NewOrder: boom"
        );
    }

    #[test]
    fn test_is_transient() {
        assert!(BusError::Store(StoreError::Conflict).is_transient());
        assert!(BusError::Transport(TransportError::ChannelClosed).is_transient());
        assert!(!BusError::NoQueueMapping {
            message_type: "x".into()
        }
        .is_transient());
    }

    #[test]
    fn test_from_transport_error() {
        let err: BusError = TransportError::QueueNotFound("orders".into()).into();
        assert!(matches!(err, BusError::Transport(_)));
        assert!(err.to_string().contains("orders"));
    }
}
