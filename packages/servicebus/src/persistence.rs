//! Persistence for process managers that exist across time.
//!
//! # Overview
//!
//! A process manager instance is stored as a JSON document keyed by
//! `(process manager name, correlation id)`. The engine owns the load →
//! handle → save cycle; a [`ProcessManagerFinder`] only stores documents.
//!
//! # The Contract
//!
//! 1. **Load before handle.** Every correlated message loads the current
//!    document (or creates a new one for a start message).
//!
//! 2. **Revision-checked writes.** `update_data` must be given the revision
//!    that was loaded. A mismatch is [`StoreError::Conflict`]: another writer
//!    got there first, and the delivery fails so the consumer retries it with
//!    fresh state.
//!
//! 3. **Delete on completion.** Once an instance reports complete its
//!    document is removed.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::core::CorrelationId;

// =============================================================================
// Store Error
// =============================================================================

/// Errors from process-manager storage.
///
/// - [`StoreError::Conflict`] means another writer modified the instance.
///   The delivery should be reprocessed.
/// - [`StoreError::Backend`] means storage failed (timeout, connection, etc).
#[derive(Debug)]
pub enum StoreError {
    /// Another writer modified the instance since we loaded it.
    Conflict,

    /// Storage backend failed (timeout, connection, serialization).
    Backend(anyhow::Error),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Conflict => write!(f, "revision conflict: state was modified concurrently"),
            StoreError::Backend(e) => write!(f, "storage backend error: {}", e),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Conflict => None,
            StoreError::Backend(e) => Some(e.as_ref()),
        }
    }
}

impl From<anyhow::Error> for StoreError {
    fn from(err: anyhow::Error) -> Self {
        StoreError::Backend(err)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Backend(err.into())
    }
}

// =============================================================================
// Revision
// =============================================================================

/// Revision for optimistic concurrency control.
///
/// [`Revision::NONE`] means "never saved". Every successful write advances
/// the revision by one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Revision(pub u64);

impl Revision {
    pub const NONE: Revision = Revision(0);

    pub fn next(self) -> Self {
        Revision(self.0.saturating_add(1))
    }

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_none() {
            write!(f, "NONE")
        } else {
            write!(f, "r{}", self.0)
        }
    }
}

// =============================================================================
// Finder
// =============================================================================

/// A stored process-manager document and the revision it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredData {
    pub data: serde_json::Value,
    pub revision: Revision,
}

/// Locates and persists process-manager instances.
#[async_trait]
pub trait ProcessManagerFinder: Send + Sync + 'static {
    /// Load an instance. `None` if it was never saved or has been deleted.
    async fn find_by_id(
        &self,
        process_manager: &str,
        correlation_id: CorrelationId,
    ) -> Result<Option<StoredData>, StoreError>;

    /// Persist a new instance.
    ///
    /// Returns [`StoreError::Conflict`] if an instance already exists.
    async fn insert_data(
        &self,
        process_manager: &str,
        correlation_id: CorrelationId,
        data: serde_json::Value,
    ) -> Result<Revision, StoreError>;

    /// Overwrite an instance loaded at `expected`.
    ///
    /// Returns [`StoreError::Conflict`] if the stored revision differs.
    async fn update_data(
        &self,
        process_manager: &str,
        correlation_id: CorrelationId,
        data: serde_json::Value,
        expected: Revision,
    ) -> Result<Revision, StoreError>;

    /// Remove an instance. Removing a missing instance is a no-op.
    async fn delete_data(
        &self,
        process_manager: &str,
        correlation_id: CorrelationId,
    ) -> Result<(), StoreError>;
}

// =============================================================================
// In-Memory Finder
// =============================================================================

type Key = (String, CorrelationId);

/// Process-manager store backed by a HashMap.
#[derive(Debug, Default)]
pub struct InMemoryProcessManagerFinder {
    data: Mutex<HashMap<Key, StoredData>>,
}

impl InMemoryProcessManagerFinder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live instances across all process managers.
    pub fn len(&self) -> usize {
        self.data.lock().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<Key, StoredData>>, StoreError> {
        self.data
            .lock()
            .map_err(|e| StoreError::Backend(anyhow::anyhow!("mutex poisoned: {}", e)))
    }
}

#[async_trait]
impl ProcessManagerFinder for InMemoryProcessManagerFinder {
    async fn find_by_id(
        &self,
        process_manager: &str,
        correlation_id: CorrelationId,
    ) -> Result<Option<StoredData>, StoreError> {
        let data = self.lock()?;
        Ok(data
            .get(&(process_manager.to_owned(), correlation_id))
            .cloned())
    }

    async fn insert_data(
        &self,
        process_manager: &str,
        correlation_id: CorrelationId,
        value: serde_json::Value,
    ) -> Result<Revision, StoreError> {
        let mut data = self.lock()?;
        let key = (process_manager.to_owned(), correlation_id);
        if data.contains_key(&key) {
            return Err(StoreError::Conflict);
        }

        let revision = Revision::NONE.next();
        data.insert(
            key,
            StoredData {
                data: value,
                revision,
            },
        );
        Ok(revision)
    }

    async fn update_data(
        &self,
        process_manager: &str,
        correlation_id: CorrelationId,
        value: serde_json::Value,
        expected: Revision,
    ) -> Result<Revision, StoreError> {
        let mut data = self.lock()?;
        let key = (process_manager.to_owned(), correlation_id);

        let current = data.get(&key).map(|s| s.revision).unwrap_or(Revision::NONE);
        if current != expected || current.is_none() {
            return Err(StoreError::Conflict);
        }

        let revision = expected.next();
        data.insert(
            key,
            StoredData {
                data: value,
                revision,
            },
        );
        Ok(revision)
    }

    async fn delete_data(
        &self,
        process_manager: &str,
        correlation_id: CorrelationId,
    ) -> Result<(), StoreError> {
        let mut data = self.lock()?;
        data.remove(&(process_manager.to_owned(), correlation_id));
        Ok(())
    }
}
