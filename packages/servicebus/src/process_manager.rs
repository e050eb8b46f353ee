//! Process managers (sagas).
//!
//! # Overview
//!
//! A process manager coordinates a long-running workflow. Each instance is
//! identified by a [`CorrelationId`] and owns a piece of data that survives
//! between messages:
//!
//! ```text
//! NewOrder ──start──▶ [instance cid=42] ──FoodPrepped──▶ [42] ──BurgerCooked──▶ complete
//! ```
//!
//! - A **start** message creates the instance (or reloads it, if the same
//!   correlation id was seen before).
//! - A **continuation** message loads the instance by the message's
//!   correlation id. Continuations for unknown instances are ignored.
//! - Once a handler marks the state complete, the instance is deleted.
//!
//! # Concurrency
//!
//! Two deliveries for the same instance must not interleave their
//! load → handle → save cycles. In-process they are serialized by a
//! per-instance async lock; across processes the finder's revision check
//! turns a lost update into [`StoreError::Conflict`], which fails the delivery
//! so it is retried against fresh state.
//!
//! [`StoreError::Conflict`]: crate::persistence::StoreError::Conflict

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::context::ConsumeContext;
use crate::core::{CorrelationId, Message};
use crate::persistence::{ProcessManagerFinder, Revision, StoreError};

// =============================================================================
// Traits
// =============================================================================

/// A saga definition.
pub trait ProcessManager: Send + Sync + 'static {
    /// Data persisted between messages.
    type Data: Serialize + DeserializeOwned + Default + Clone + Send + Sync + 'static;

    /// Stable name; part of the persistence key.
    fn name(&self) -> &'static str;
}

/// Handles a message that starts a process.
#[async_trait]
pub trait StartProcessManager<M: Message>: ProcessManager {
    async fn handle_start(
        &self,
        message: M,
        state: &mut ProcessState<Self::Data>,
        ctx: &ConsumeContext,
    ) -> Result<()>;
}

/// Handles a message for an already running process.
#[async_trait]
pub trait ProcessManagerHandler<M: Message>: ProcessManager {
    async fn handle(
        &self,
        message: M,
        state: &mut ProcessState<Self::Data>,
        ctx: &ConsumeContext,
    ) -> Result<()>;
}

/// Persisted state of one process instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessState<D> {
    pub correlation_id: CorrelationId,
    pub data: D,
    pub complete: bool,
}

impl<D> ProcessState<D> {
    pub fn new(correlation_id: CorrelationId, data: D) -> Self {
        Self {
            correlation_id,
            data,
            complete: false,
        }
    }

    /// Finish the process. Its data is deleted after this delivery.
    pub fn mark_complete(&mut self) {
        self.complete = true;
    }
}

// =============================================================================
// Engine
// =============================================================================

type InstanceKey = (&'static str, CorrelationId);

/// Runs process-manager handlers against persisted state.
pub struct ProcessManagerEngine {
    finder: Arc<dyn ProcessManagerFinder>,
    locks: DashMap<InstanceKey, Arc<tokio::sync::Mutex<()>>>,
}

impl ProcessManagerEngine {
    pub fn new(finder: Arc<dyn ProcessManagerFinder>) -> Self {
        Self {
            finder,
            locks: DashMap::new(),
        }
    }

    pub fn finder(&self) -> &Arc<dyn ProcessManagerFinder> {
        &self.finder
    }

    /// Handle a start message.
    pub async fn start<M, P>(&self, process_manager: &P, message: M, ctx: &ConsumeContext) -> Result<()>
    where
        M: Message,
        P: StartProcessManager<M>,
    {
        let name = process_manager.name();
        let mut correlation_id = message.correlation_id();
        if correlation_id.is_none() {
            correlation_id = CorrelationId::new();
        }

        self.with_lock((name, correlation_id), async {
            let (mut state, revision) = match self.load::<P::Data>(name, correlation_id).await? {
                Some((state, revision)) => (state, Some(revision)),
                None => (ProcessState::new(correlation_id, P::Data::default()), None),
            };

            process_manager.handle_start(message, &mut state, ctx).await?;
            self.save(name, correlation_id, &state, revision).await
        })
        .await
    }

    /// Handle a continuation message. Unknown instances are a no-op.
    pub async fn handle<M, P>(&self, process_manager: &P, message: M, ctx: &ConsumeContext) -> Result<()>
    where
        M: Message,
        P: ProcessManagerHandler<M>,
    {
        let name = process_manager.name();
        let correlation_id = message.correlation_id();
        if correlation_id.is_none() {
            debug!(process_manager = name, message_type = M::message_type(), "uncorrelated message, no instance to load");
            return Ok(());
        }

        self.with_lock((name, correlation_id), async {
            let Some((mut state, revision)) = self.load::<P::Data>(name, correlation_id).await? else {
                debug!(
                    process_manager = name,
                    %correlation_id,
                    message_type = M::message_type(),
                    "no process instance, ignoring"
                );
                return Ok(());
            };

            process_manager.handle(message, &mut state, ctx).await?;
            self.save(name, correlation_id, &state, Some(revision)).await
        })
        .await
    }

    async fn with_lock<T>(&self, key: InstanceKey, work: impl std::future::Future<Output = T>) -> T {
        let lock = self.locks.entry(key).or_default().clone();
        let result = {
            let _guard = lock.lock().await;
            work.await
        };
        drop(lock);
        self.locks.remove_if(&key, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    async fn load<D: DeserializeOwned>(
        &self,
        name: &str,
        correlation_id: CorrelationId,
    ) -> Result<Option<(ProcessState<D>, Revision)>, StoreError> {
        let Some(stored) = self.finder.find_by_id(name, correlation_id).await? else {
            return Ok(None);
        };
        let state = serde_json::from_value(stored.data)?;
        Ok(Some((state, stored.revision)))
    }

    /// Persist `state`. `revision` is where it was loaded from, if it was.
    async fn save<D: Serialize>(
        &self,
        name: &'static str,
        loaded_as: CorrelationId,
        state: &ProcessState<D>,
        revision: Option<Revision>,
    ) -> Result<()> {
        if state.complete {
            if revision.is_some() {
                trace!(process_manager = name, correlation_id = %loaded_as, "process complete, deleting");
                self.finder.delete_data(name, loaded_as).await?;
            }
            return Ok(());
        }

        let value = serde_json::to_value(state)?;
        match revision {
            Some(revision) if state.correlation_id == loaded_as => {
                self.finder
                    .update_data(name, loaded_as, value, revision)
                    .await?;
            }
            Some(_) => {
                // The handler moved the instance to a new correlation id.
                self.finder
                    .insert_data(name, state.correlation_id, value)
                    .await?;
                self.finder.delete_data(name, loaded_as).await?;
            }
            None => {
                self.finder
                    .insert_data(name, state.correlation_id, value)
                    .await?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for ProcessManagerEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessManagerEngine")
            .field("active_locks", &self.locks.len())
            .finish_non_exhaustive()
    }
}
