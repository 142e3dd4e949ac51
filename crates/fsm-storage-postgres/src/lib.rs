// crates/fsm-storage-postgres/src/lib.rs
// ============================================================================
// Module: FSM Storage Postgres
// Description: Relational FSM storage adapter backed by PostgreSQL.
// Purpose: Persist FSM state, data, and buckets in a shared database.
// Dependencies: fsm-storage-core, postgres, r2d2, r2d2_postgres, serde, thiserror, tracing
// ============================================================================

//! ## Overview
//! [`PostgresFsmStorage`] implements [`fsm_storage_core::FsmStorage`] over an
//! `r2d2` pool of blocking `postgres` clients. Mappings are stored as `JSONB`
//! and merged server-side, so `update_*` is a single atomic statement.

/// Postgres FSM storage implementation.
pub mod storage;

pub use storage::PostgresFsmStorage;
pub use storage::PostgresStorageConfig;
pub use storage::PostgresStorageError;
pub use storage::shared_postgres_storage;
