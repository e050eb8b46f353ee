//! Handler registration.
//!
//! Handlers are registered explicitly through the bus builder. Each
//! registration produces a [`HandlerReference`] (what the topology and logs
//! see) and a boxed invoker keyed by message type name (what dispatch calls).
//! There is no reflection: the table is built once and is read-only after.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::{Future, FutureExt};

use crate::context::ConsumeContext;
use crate::core::{DecodedMessage, Message};
use crate::process_manager::{ProcessManagerHandler, StartProcessManager};
use crate::serializer::MessageTypes;

// =============================================================================
// Message Handler
// =============================================================================

/// Handles one message type.
///
/// Returning an error fails the delivery; the consumer then retries it.
///
/// # Example
///
/// ```ignore
/// struct PrintOrder;
///
/// #[async_trait]
/// impl MessageHandler<NewOrder> for PrintOrder {
///     async fn handle(&self, message: NewOrder, _ctx: &ConsumeContext) -> anyhow::Result<()> {
///         println!("order {:?}", message.size);
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait MessageHandler<M: Message>: Send + Sync + 'static {
    async fn handle(&self, message: M, ctx: &ConsumeContext) -> Result<()>;
}

/// Adapts an async closure into a [`MessageHandler`].
pub struct FnHandler<M, F> {
    f: F,
    _message: PhantomData<fn(M)>,
}

/// Build a handler from `|message, ctx| async move { ... }`.
pub fn handler_fn<M, F, Fut>(f: F) -> FnHandler<M, F>
where
    M: Message,
    F: Fn(M, ConsumeContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    FnHandler {
        f,
        _message: PhantomData,
    }
}

#[async_trait]
impl<M, F, Fut> MessageHandler<M> for FnHandler<M, F>
where
    M: Message,
    F: Fn(M, ConsumeContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, message: M, ctx: &ConsumeContext) -> Result<()> {
        (self.f)(message, ctx.clone()).await
    }
}

// =============================================================================
// References
// =============================================================================

/// What kind of handler a registration is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerCategory {
    MessageHandler,
    ProcessManagerStart,
    ProcessManagerContinuation,
}

impl HandlerCategory {
    pub fn is_process_manager(self) -> bool {
        !matches!(self, HandlerCategory::MessageHandler)
    }
}

/// One registration: which handler type handles which message type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerReference {
    pub message_type: &'static str,
    pub handler_type: &'static str,
    pub category: HandlerCategory,
}

pub(crate) type Invoker =
    Arc<dyn Fn(DecodedMessage, ConsumeContext) -> BoxFuture<'static, Result<()>> + Send + Sync>;

#[derive(Clone)]
pub(crate) struct Registration {
    pub reference: HandlerReference,
    pub invoke: Invoker,
}

fn downcast<M: Message>(message: &DecodedMessage) -> Result<M> {
    message
        .downcast_ref::<M>()
        .cloned()
        .ok_or_else(|| anyhow!("payload {} is not a {}", message.type_name, M::message_type()))
}

// =============================================================================
// Registry
// =============================================================================

/// The handler table.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    registrations: Vec<Registration>,
    by_type: HashMap<&'static str, Vec<usize>>,
    types: MessageTypes,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_handler<M, H>(&mut self, handler: Arc<H>)
    where
        M: Message,
        H: MessageHandler<M>,
    {
        let invoke: Invoker = Arc::new(move |message: DecodedMessage, ctx: ConsumeContext| {
            let handler = Arc::clone(&handler);
            async move {
                let message = downcast::<M>(&message)?;
                handler.handle(message, &ctx).await
            }
            .boxed()
        });
        self.push::<M>(
            std::any::type_name::<H>(),
            HandlerCategory::MessageHandler,
            invoke,
        );
    }

    pub fn register_process_manager_start<M, P>(&mut self, process_manager: Arc<P>)
    where
        M: Message,
        P: StartProcessManager<M>,
    {
        let invoke: Invoker = Arc::new(move |message: DecodedMessage, ctx: ConsumeContext| {
            let process_manager = Arc::clone(&process_manager);
            async move {
                let message = downcast::<M>(&message)?;
                let engine = ctx.bus().process_managers();
                engine.start(&*process_manager, message, &ctx).await
            }
            .boxed()
        });
        self.push::<M>(
            std::any::type_name::<P>(),
            HandlerCategory::ProcessManagerStart,
            invoke,
        );
    }

    pub fn register_process_manager_handler<M, P>(&mut self, process_manager: Arc<P>)
    where
        M: Message,
        P: ProcessManagerHandler<M>,
    {
        let invoke: Invoker = Arc::new(move |message: DecodedMessage, ctx: ConsumeContext| {
            let process_manager = Arc::clone(&process_manager);
            async move {
                let message = downcast::<M>(&message)?;
                let engine = ctx.bus().process_managers();
                engine.handle(&*process_manager, message, &ctx).await
            }
            .boxed()
        });
        self.push::<M>(
            std::any::type_name::<P>(),
            HandlerCategory::ProcessManagerContinuation,
            invoke,
        );
    }

    /// Make `M` decodable without handling it (reply types).
    pub fn register_message_type<M: Message>(&mut self) {
        self.types.register::<M>();
    }

    fn push<M: Message>(
        &mut self,
        handler_type: &'static str,
        category: HandlerCategory,
        invoke: Invoker,
    ) {
        self.types.register::<M>();
        let index = self.registrations.len();
        self.registrations.push(Registration {
            reference: HandlerReference {
                message_type: M::message_type(),
                handler_type,
                category,
            },
            invoke,
        });
        self.by_type.entry(M::message_type()).or_default().push(index);
    }

    pub fn handler_references(&self) -> Vec<HandlerReference> {
        self.registrations
            .iter()
            .map(|r| r.reference.clone())
            .collect()
    }

    pub fn handler_references_for(&self, category: HandlerCategory) -> Vec<HandlerReference> {
        self.registrations
            .iter()
            .filter(|r| r.reference.category == category)
            .map(|r| r.reference.clone())
            .collect()
    }

    /// Distinct handled message types, in registration order.
    pub fn message_types(&self) -> Vec<&'static str> {
        let mut seen = Vec::new();
        for r in &self.registrations {
            if !seen.contains(&r.reference.message_type) {
                seen.push(r.reference.message_type);
            }
        }
        seen
    }

    /// Decoders for every handled or explicitly registered type.
    pub fn types(&self) -> &MessageTypes {
        &self.types
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Registrations for `message_type` that match `filter`, in registration order.
    pub(crate) fn registrations_for<'a>(
        &'a self,
        message_type: &str,
        filter: impl Fn(HandlerCategory) -> bool + 'a,
    ) -> impl Iterator<Item = &'a Registration> + 'a {
        self.by_type
            .get(message_type)
            .into_iter()
            .flatten()
            .map(|&i| &self.registrations[i])
            .filter(move |r| filter(r.reference.category))
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.handler_references())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::CorrelationId;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct NewOrder {
        correlation_id: CorrelationId,
    }

    impl Message for NewOrder {
        fn correlation_id(&self) -> CorrelationId {
            self.correlation_id
        }

        fn message_type() -> &'static str {
            "Tests.NewOrder"
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Refund {
        correlation_id: CorrelationId,
    }

    impl Message for Refund {
        fn correlation_id(&self) -> CorrelationId {
            self.correlation_id
        }

        fn message_type() -> &'static str {
            "Tests.Refund"
        }
    }

    struct Audit;

    #[async_trait]
    impl MessageHandler<NewOrder> for Audit {
        async fn handle(&self, _message: NewOrder, _ctx: &ConsumeContext) -> Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl MessageHandler<Refund> for Audit {
        async fn handle(&self, _message: Refund, _ctx: &ConsumeContext) -> Result<()> {
            Ok(())
        }
    }

    fn registry() -> HandlerRegistry {
        let audit = Arc::new(Audit);
        let mut registry = HandlerRegistry::new();
        registry.register_handler::<NewOrder, _>(audit.clone());
        registry.register_handler::<Refund, _>(audit.clone());
        registry.register_handler::<NewOrder, _>(Arc::new(handler_fn(
            |_m: NewOrder, _ctx| async { Ok(()) },
        )));
        registry
    }

    #[test]
    fn test_references_in_registration_order() {
        let refs = registry().handler_references();
        assert_eq!(refs.len(), 3);
        assert_eq!(refs[0].message_type, "Tests.NewOrder");
        assert!(refs[0].handler_type.ends_with("Audit"));
        assert_eq!(refs[1].message_type, "Tests.Refund");
        assert_eq!(refs[2].category, HandlerCategory::MessageHandler);
    }

    #[test]
    fn test_message_types_are_distinct() {
        assert_eq!(
            registry().message_types(),
            vec!["Tests.NewOrder", "Tests.Refund"]
        );
    }

    #[test]
    fn test_references_for_category() {
        let registry = registry();
        assert_eq!(
            registry
                .handler_references_for(HandlerCategory::MessageHandler)
                .len(),
            3
        );
        assert!(registry
            .handler_references_for(HandlerCategory::ProcessManagerStart)
            .is_empty());
    }

    #[test]
    fn test_registrations_for_type() {
        let registry = registry();
        assert_eq!(
            registry
                .registrations_for("Tests.NewOrder", |c| !c.is_process_manager())
                .count(),
            2
        );
        assert_eq!(registry.registrations_for("Tests.Missing", |_| true).count(), 0);
    }

    #[test]
    fn test_handled_types_are_decodable() {
        let mut registry = registry();
        assert!(registry.types().contains("Tests.NewOrder"));

        #[derive(Debug, Clone, Serialize, Deserialize)]
        struct Receipt {
            correlation_id: CorrelationId,
        }
        impl Message for Receipt {
            fn correlation_id(&self) -> CorrelationId {
                self.correlation_id
            }
        }

        registry.register_message_type::<Receipt>();
        assert!(registry.types().contains(Receipt::message_type()));
        assert_eq!(registry.message_types().len(), 2);
    }
}
