//! Request/reply correlation.
//!
//! A request travels with a `SourceAddress` header holding a fresh
//! correlation id, and the responder copies that header onto its reply. The
//! [`RequestRegistry`] maps each outstanding id to a one-shot continuation.
//!
//! The application's own [`Message::correlation_id`] is not involved, so a
//! saga can issue requests without disturbing its correlation.
//!
//! [`Message::correlation_id`]: crate::Message::correlation_id

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use tracing::{debug, trace};

use crate::core::{DecodedMessage, Headers};

pub(crate) type Continuation = Box<dyn FnOnce(DecodedMessage) + Send>;

/// An outstanding request.
pub struct PendingRequest {
    /// Wire type name of the reply this request waits for.
    pub expected_type: &'static str,
    continuation: Continuation,
}

impl PendingRequest {
    pub(crate) fn new(expected_type: &'static str, continuation: Continuation) -> Self {
        Self {
            expected_type,
            continuation,
        }
    }
}

impl fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequest")
            .field("expected_type", &self.expected_type)
            .finish_non_exhaustive()
    }
}

/// What happened when a delivery was offered to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyMatch {
    /// The delivery completed a pending request.
    Completed,
    /// No `SourceAddress` header; not a reply.
    NoSourceAddress,
    /// No pending request under that id (already completed, timed out, or
    /// owned by another process).
    NoPendingRequest,
    /// A request is pending under that id but waits for another type.
    TypeMismatch,
}

/// Outstanding requests keyed by `SourceAddress`.
#[derive(Default)]
pub struct RequestRegistry {
    pending: Mutex<HashMap<String, PendingRequest>>,
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, id: String, request: PendingRequest) {
        trace!(source_address = %id, expected = request.expected_type, "request registered");
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, request);
    }

    /// Drop a pending request. Returns whether it was still pending.
    pub fn remove(&self, id: &str) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
            .is_some()
    }

    /// Drop every pending request without running its continuation.
    ///
    /// Waiters see their reply channel close. Returns how many were dropped.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<(String, PendingRequest)> = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();
        for (id, request) in &drained {
            debug!(source_address = %id, expected = request.expected_type, "request cancelled");
        }
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Offer a decoded delivery as a reply.
    ///
    /// The entry is removed under the lock and its continuation runs after
    /// the lock is released, so each request completes at most once no
    /// matter how many copies of the reply arrive.
    pub fn complete(&self, headers: &Headers, message: DecodedMessage) -> ReplyMatch {
        let Some(id) = headers.source_address() else {
            return ReplyMatch::NoSourceAddress;
        };

        let request = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            match pending.get(&id) {
                None => return ReplyMatch::NoPendingRequest,
                Some(request) if request.expected_type != message.type_name => {
                    trace!(
                        source_address = %id,
                        expected = request.expected_type,
                        actual = message.type_name,
                        "not the awaited reply type"
                    );
                    return ReplyMatch::TypeMismatch;
                }
                Some(_) => pending.remove(&id),
            }
        };

        match request {
            Some(request) => {
                debug!(source_address = %id, reply = message.type_name, "reply matched");
                (request.continuation)(message);
                ReplyMatch::Completed
            }
            None => ReplyMatch::NoPendingRequest,
        }
    }
}

impl fmt::Debug for RequestRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestRegistry")
            .field("pending", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{CorrelationId, Message, SOURCE_ADDRESS};
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Pong {
        correlation_id: CorrelationId,
    }

    impl Message for Pong {
        fn correlation_id(&self) -> CorrelationId {
            self.correlation_id
        }

        fn message_type() -> &'static str {
            "Tests.Pong"
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Ping {
        correlation_id: CorrelationId,
    }

    impl Message for Ping {
        fn correlation_id(&self) -> CorrelationId {
            self.correlation_id
        }

        fn message_type() -> &'static str {
            "Tests.Ping"
        }
    }

    fn pong() -> DecodedMessage {
        DecodedMessage::new(Pong {
            correlation_id: CorrelationId::NONE,
        })
    }

    fn counting_request(counter: &Arc<AtomicUsize>) -> PendingRequest {
        let counter = Arc::clone(counter);
        PendingRequest::new(
            "Tests.Pong",
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    #[test]
    fn test_reply_completes_once() {
        let registry = RequestRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        registry.register("abc".into(), counting_request(&calls));

        let headers = Headers::new().with(SOURCE_ADDRESS, "abc");
        assert_eq!(registry.complete(&headers, pong()), ReplyMatch::Completed);
        assert_eq!(registry.complete(&headers, pong()), ReplyMatch::NoPendingRequest);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_missing_header_is_not_a_reply() {
        let registry = RequestRegistry::new();
        assert_eq!(
            registry.complete(&Headers::new(), pong()),
            ReplyMatch::NoSourceAddress
        );
    }

    #[test]
    fn test_wrong_type_leaves_request_pending() {
        let registry = RequestRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        registry.register("abc".into(), counting_request(&calls));

        let headers = Headers::new().with(SOURCE_ADDRESS, "abc");
        let ping = DecodedMessage::new(Ping {
            correlation_id: CorrelationId::NONE,
        });
        assert_eq!(registry.complete(&headers, ping), ReplyMatch::TypeMismatch);
        assert_eq!(registry.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_remove() {
        let registry = RequestRegistry::new();
        registry.register("abc".into(), counting_request(&Arc::new(AtomicUsize::new(0))));
        assert!(registry.remove("abc"));
        assert!(!registry.remove("abc"));
    }

    #[tokio::test]
    async fn test_cancel_all_closes_waiters() {
        let registry = RequestRegistry::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        registry.register(
            "abc".into(),
            PendingRequest::new("Tests.Pong", Box::new(move |_| {
                let _ = tx.send(());
            })),
        );
        let calls = Arc::new(AtomicUsize::new(0));
        registry.register("def".into(), counting_request(&calls));

        assert_eq!(registry.cancel_all(), 2);
        assert!(registry.is_empty());
        assert!(rx.await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let headers = Headers::new().with(SOURCE_ADDRESS, "def");
        assert_eq!(registry.complete(&headers, pong()), ReplyMatch::NoPendingRequest);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_replies_complete_once() {
        let registry = Arc::new(RequestRegistry::new());
        let calls = Arc::new(AtomicUsize::new(0));
        registry.register("abc".into(), counting_request(&calls));

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    let headers = Headers::new().with(SOURCE_ADDRESS, "abc");
                    registry.complete(&headers, pong())
                })
            })
            .collect();

        let mut completed = 0;
        for handle in handles {
            if handle.await.unwrap() == ReplyMatch::Completed {
                completed += 1;
            }
        }

        assert_eq!(completed, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
