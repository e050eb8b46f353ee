//! Per-delivery context handed to handlers.

use crate::bus::Bus;
use crate::core::{Headers, Message, SOURCE_ADDRESS};
use crate::error::BusError;

/// The bus and the headers of the delivery being handled.
///
/// Created fresh for every delivery. Cloning is cheap.
#[derive(Debug, Clone)]
pub struct ConsumeContext {
    bus: Bus,
    headers: Headers,
}

impl ConsumeContext {
    pub fn new(bus: Bus, headers: Headers) -> Self {
        Self { bus, headers }
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// How many times this delivery has been retried.
    pub fn retry_count(&self) -> u32 {
        self.headers.retry_count()
    }

    /// Whether the delivery is a request someone is waiting on.
    pub fn is_request(&self) -> bool {
        self.headers.source_address().is_some()
    }

    /// Answer the request being handled.
    ///
    /// The reply goes to the requester's `ReplyAddress`, or through the
    /// queue mapping for `M` when the request did not name one. The
    /// `SourceAddress` header is carried over so the requester can match it.
    pub async fn reply<M: Message>(&self, message: &M) -> Result<(), BusError> {
        let mut headers = Headers::new();
        if let Some(source) = self.headers.get(SOURCE_ADDRESS) {
            headers.insert(SOURCE_ADDRESS, source.clone());
        }

        match self.headers.reply_address() {
            Some(address) => self.bus.send_to_with_headers(&address, message, headers).await,
            None => self.bus.send_with_headers(message, headers).await,
        }
    }
}
