// crates/fsm-storage-sqlite/src/lib.rs
// ============================================================================
// Module: FSM Storage SQLite
// Description: Embedded FSM storage adapter backed by SQLite.
// Purpose: Persist FSM state, data, and buckets in a local database file.
// Dependencies: fsm-storage-core, rusqlite, serde, serde_json, thiserror, tracing
// ============================================================================

//! ## Overview
//! [`SqliteFsmStorage`] implements [`fsm_storage_core::FsmStorage`] over a
//! single `SQLite` connection. File locking between processes is whatever the
//! `SQLite` engine provides.

/// `SQLite` FSM storage implementation.
pub mod storage;

pub use storage::SqliteFsmStorage;
pub use storage::SqliteJournalMode;
pub use storage::SqliteStorageConfig;
pub use storage::SqliteStorageError;
pub use storage::SqliteSyncMode;
