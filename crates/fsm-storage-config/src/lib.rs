// crates/fsm-storage-config/src/lib.rs
// ============================================================================
// Module: FSM Storage Config Library
// Description: Configuration model and backend factory for FSM storage.
// Purpose: Single source of truth for fsm-storage.toml semantics.
// Dependencies: fsm-storage-core, fsm-storage-postgres, fsm-storage-sqlite, serde, toml
// ============================================================================

//! ## Overview
//! `fsm-storage-config` loads `fsm-storage.toml`, validates it fail-closed,
//! and opens the selected backend as a
//! [`fsm_storage_core::SharedFsmStorage`].

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod config;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use config::*;
