// crates/fsm-storage-core/src/interfaces/mod.rs
// ============================================================================
// Module: FSM Storage Interfaces
// Description: Backend-agnostic storage contract consumed by the dispatcher.
// Purpose: Define the operations every FSM storage adapter must provide.
// Dependencies: crate::core, thiserror
// ============================================================================

//! ## Overview
//! [`FsmStorage`] is the contract between the dispatcher and a storage
//! backend. Each call is an independent request: adapters add no batching,
//! locking, or ordering across keys. Calls block the current thread; hosts
//! running on an async runtime should dispatch them onto a blocking pool.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;

use thiserror::Error;

use crate::core::data::DataMap;
use crate::core::identifiers::StorageKey;
use crate::core::state::StateName;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// FSM storage errors.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
/// - Messages never embed stored data or bucket payloads.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Backend unreachable, file not openable, or adapter already closed.
    #[error("fsm storage connection error: {0}")]
    Connection(String),
    /// Backend rejected a statement.
    #[error("fsm storage database error: {0}")]
    Database(String),
    /// Stored payload failed to decode.
    #[error("fsm storage corruption: {0}")]
    Corrupt(String),
    /// Caller supplied invalid input.
    #[error("fsm storage invalid input: {0}")]
    Invalid(String),
    /// Adapter construction parameters are missing or invalid.
    #[error("fsm storage config error: {0}")]
    Config(String),
}

impl StorageError {
    /// Returns true when the error reports lost or released connectivity.
    #[must_use]
    pub const fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

// ============================================================================
// SECTION: Storage Contract
// ============================================================================

/// Persistent FSM storage for chat-bot conversations.
///
/// Data and bucket mappings are independent records: writing one never
/// touches the other. Writing an empty mapping removes the record, so reads
/// cannot distinguish "empty" from "absent".
pub trait FsmStorage {
    /// Returns the stored state for `key`, or `None` when absent.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] when the backend cannot be queried.
    fn get_state(&self, key: StorageKey) -> Result<Option<StateName>, StorageError>;

    /// Upserts the state for `key`; `None` removes it.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] when the write fails.
    fn set_state(&self, key: StorageKey, state: Option<&StateName>) -> Result<(), StorageError>;

    /// Returns the data mapping for `key`, or an empty mapping when absent.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] when the backend cannot be queried or the
    /// stored payload is corrupt.
    fn get_data(&self, key: StorageKey) -> Result<DataMap, StorageError>;

    /// Replaces the data mapping for `key`; an empty mapping removes it.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] when the write fails.
    fn set_data(&self, key: StorageKey, data: &DataMap) -> Result<(), StorageError>;

    /// Shallow-merges `patch` into the data mapping for `key`.
    ///
    /// The merge is atomic with respect to other writers of the same key.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] when the merge fails.
    fn update_data(&self, key: StorageKey, patch: &DataMap) -> Result<(), StorageError>;

    /// Reports whether the backend persists bucket records.
    fn has_bucket(&self) -> bool {
        false
    }

    /// Returns the bucket mapping for `key`, or an empty mapping when absent.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] when the backend cannot be queried or the
    /// stored payload is corrupt.
    fn get_bucket(&self, key: StorageKey) -> Result<DataMap, StorageError>;

    /// Replaces the bucket mapping for `key`; an empty mapping removes it.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] when the write fails.
    fn set_bucket(&self, key: StorageKey, bucket: &DataMap) -> Result<(), StorageError>;

    /// Shallow-merges `patch` into the bucket mapping for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] when the merge fails.
    fn update_bucket(&self, key: StorageKey, patch: &DataMap) -> Result<(), StorageError>;

    /// Removes the data mapping for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] when the write fails.
    fn reset_data(&self, key: StorageKey) -> Result<(), StorageError> {
        self.set_data(key, &DataMap::new())
    }

    /// Removes the state for `key`, and its data mapping when `with_data` is set.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] when a write fails.
    fn reset_state(&self, key: StorageKey, with_data: bool) -> Result<(), StorageError> {
        self.set_state(key, None)?;
        if with_data {
            self.reset_data(key)?;
        }
        Ok(())
    }

    /// Ends the conversation for `key`: removes its state and data.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] when a write fails.
    fn finish(&self, key: StorageKey) -> Result<(), StorageError> {
        self.reset_state(key, true)
    }

    /// Lists every key that currently holds a state, ordered by chat then user.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] when the backend cannot be queried.
    fn list_states(&self) -> Result<Vec<StorageKey>, StorageError>;

    /// Clears all states, and all data and bucket records when `full` is set.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] when the delete fails.
    fn reset_all(&self, full: bool) -> Result<(), StorageError>;

    /// Reports backend readiness for health checks.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] when the backend is unavailable.
    fn readiness(&self) -> Result<(), StorageError> {
        Ok(())
    }

    /// Releases the backend connection or pool.
    ///
    /// Closing is idempotent. Every other operation fails with
    /// [`StorageError::Connection`] afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] when the backend reports a failure while
    /// releasing resources.
    fn close(&self) -> Result<(), StorageError>;
}

// ============================================================================
// SECTION: Shared Storage
// ============================================================================

/// Shared FSM storage wrapper for thread-safe access.
///
/// # Invariants
/// - Clones share the same backend; closing through one clone closes all.
#[derive(Clone)]
pub struct SharedFsmStorage {
    /// Shared backend implementation.
    inner: Arc<dyn FsmStorage + Send + Sync>,
}

impl SharedFsmStorage {
    /// Wraps an FSM storage backend in a shared, thread-safe wrapper.
    #[must_use]
    pub fn from_storage(storage: impl FsmStorage + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(storage),
        }
    }

    /// Wraps an already shared FSM storage backend.
    #[must_use]
    pub fn new(storage: Arc<dyn FsmStorage + Send + Sync>) -> Self {
        Self {
            inner: storage,
        }
    }
}

impl FsmStorage for SharedFsmStorage {
    fn get_state(&self, key: StorageKey) -> Result<Option<StateName>, StorageError> {
        self.inner.get_state(key)
    }

    fn set_state(&self, key: StorageKey, state: Option<&StateName>) -> Result<(), StorageError> {
        self.inner.set_state(key, state)
    }

    fn get_data(&self, key: StorageKey) -> Result<DataMap, StorageError> {
        self.inner.get_data(key)
    }

    fn set_data(&self, key: StorageKey, data: &DataMap) -> Result<(), StorageError> {
        self.inner.set_data(key, data)
    }

    fn update_data(&self, key: StorageKey, patch: &DataMap) -> Result<(), StorageError> {
        self.inner.update_data(key, patch)
    }

    fn has_bucket(&self) -> bool {
        self.inner.has_bucket()
    }

    fn get_bucket(&self, key: StorageKey) -> Result<DataMap, StorageError> {
        self.inner.get_bucket(key)
    }

    fn set_bucket(&self, key: StorageKey, bucket: &DataMap) -> Result<(), StorageError> {
        self.inner.set_bucket(key, bucket)
    }

    fn update_bucket(&self, key: StorageKey, patch: &DataMap) -> Result<(), StorageError> {
        self.inner.update_bucket(key, patch)
    }

    fn reset_data(&self, key: StorageKey) -> Result<(), StorageError> {
        self.inner.reset_data(key)
    }

    fn reset_state(&self, key: StorageKey, with_data: bool) -> Result<(), StorageError> {
        self.inner.reset_state(key, with_data)
    }

    fn finish(&self, key: StorageKey) -> Result<(), StorageError> {
        self.inner.finish(key)
    }

    fn list_states(&self) -> Result<Vec<StorageKey>, StorageError> {
        self.inner.list_states()
    }

    fn reset_all(&self, full: bool) -> Result<(), StorageError> {
        self.inner.reset_all(full)
    }

    fn readiness(&self) -> Result<(), StorageError> {
        self.inner.readiness()
    }

    fn close(&self) -> Result<(), StorageError> {
        self.inner.close()
    }
}
