//! Routes one delivery through handlers, process managers and pending
//! requests.
//!
//! The order is fixed:
//!
//! 1. Decode the payload (by `MessageType` header, else from the payload).
//! 2. Run every message handler for the type. All of them run; failures are
//!    collected.
//! 3. Run the process-manager registrations for the type.
//! 4. Offer the message to the pending-request table.
//!
//! The result is a single `bool`. Anything that goes wrong, including a
//! panic, makes it `false` and the consumer retries the delivery.

use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tracing::{debug, error, trace, warn};

use crate::bus::Bus;
use crate::context::ConsumeContext;
use crate::core::{DecodedMessage, Headers};
use crate::error::BusError;
use crate::handler::HandlerCategory;
use crate::persistence::StoreError;
use crate::request::ReplyMatch;
use crate::serializer::SerializationError;

/// Dispatches decoded deliveries for one bus.
pub struct Dispatcher {
    bus: Bus,
}

impl Dispatcher {
    pub fn new(bus: Bus) -> Self {
        Self { bus }
    }

    /// Handle one raw delivery. Returns whether it was processed successfully.
    pub async fn consume_message_event(&self, body: &[u8], headers: &Headers) -> bool {
        let message = match self.decode(body, headers) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    error = %e,
                    message_type = ?headers.message_type(),
                    message_id = ?headers.message_id(),
                    "could not decode delivery"
                );
                return false;
            }
        };

        let message_type = message.type_name;
        let correlation_id = message.correlation_id;
        trace!(message_type, %correlation_id, "dispatching");

        let ctx = ConsumeContext::new(self.bus.clone(), headers.clone());
        match AssertUnwindSafe(self.dispatch(message, ctx)).catch_unwind().await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(message_type, %correlation_id, error = %e, "delivery failed");
                false
            }
            Err(panic_info) => {
                let panic_msg = extract_panic_message(&panic_info);
                error!(message_type, %correlation_id, panic = %panic_msg, "dispatch panicked");
                false
            }
        }
    }

    fn decode(&self, body: &[u8], headers: &Headers) -> Result<DecodedMessage, SerializationError> {
        let text = std::str::from_utf8(body)?;
        let serializer = self.bus.serializer();
        let types = self.bus.registry().types();

        match headers.message_type() {
            Some(message_type) => serializer.deserialize(types, &message_type, text),
            None => serializer.deserialize_inferred(types, text),
        }
    }

    async fn dispatch(&self, message: DecodedMessage, ctx: ConsumeContext) -> Result<(), BusError> {
        self.run_message_handlers(&message, &ctx).await?;
        self.run_process_managers(&message, &ctx).await?;
        self.match_reply(message, &ctx);
        Ok(())
    }

    async fn run_message_handlers(&self, message: &DecodedMessage, ctx: &ConsumeContext) -> Result<(), BusError> {
        let registry = self.bus.registry();
        let handlers: Vec<_> = registry
            .registrations_for(message.type_name, |c| c == HandlerCategory::MessageHandler)
            .collect();

        let total = handlers.len();
        let mut failed = 0;
        let mut first_error = None;

        for registration in handlers {
            let fut = (registration.invoke)(message.clone(), ctx.clone());
            let outcome = match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(result) => result,
                Err(panic_info) => Err(anyhow::anyhow!(
                    "handler panicked: {}",
                    extract_panic_message(&panic_info)
                )),
            };

            if let Err(e) = outcome {
                warn!(
                    handler = registration.reference.handler_type,
                    message_type = message.type_name,
                    error = %e,
                    "handler failed"
                );
                failed += 1;
                first_error.get_or_insert_with(|| format!("{:#}", e));
            }
        }

        match first_error {
            None => Ok(()),
            Some(first_error) => Err(BusError::Handlers {
                message_type: message.type_name.to_string(),
                failed,
                total,
                first_error,
            }),
        }
    }

    async fn run_process_managers(&self, message: &DecodedMessage, ctx: &ConsumeContext) -> Result<(), BusError> {
        let registry = self.bus.registry();
        for registration in registry.registrations_for(message.type_name, HandlerCategory::is_process_manager) {
            trace!(
                process_manager = registration.reference.handler_type,
                category = ?registration.reference.category,
                "running process manager"
            );
            (registration.invoke)(message.clone(), ctx.clone())
                .await
                .map_err(|e| match e.downcast::<StoreError>() {
                    Ok(store) => BusError::Store(store),
                    Err(e) => BusError::Handlers {
                        message_type: message.type_name.to_string(),
                        failed: 1,
                        total: 1,
                        first_error: format!("{}: {:#}", registration.reference.handler_type, e),
                    },
                })?;
        }
        Ok(())
    }

    fn match_reply(&self, message: DecodedMessage, ctx: &ConsumeContext) {
        let type_name = message.type_name;
        match self.bus.requests().complete(ctx.headers(), message) {
            ReplyMatch::Completed => debug!(reply = type_name, "request completed"),
            ReplyMatch::NoSourceAddress | ReplyMatch::NoPendingRequest => {}
            ReplyMatch::TypeMismatch => trace!(reply = type_name, "pending request awaits another type"),
        }
    }
}

/// Extract a readable message from a panic payload.
fn extract_panic_message(panic_info: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic_info.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
