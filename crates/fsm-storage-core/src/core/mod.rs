// crates/fsm-storage-core/src/core/mod.rs
// ============================================================================
// Module: FSM Storage Core Types
// Description: Value types shared by the storage contract and its backends.
// Purpose: Group identifiers, state names, mappings, and table naming.
// ============================================================================

/// Data and bucket mapping helpers.
pub mod data;
/// Chat, user, and composite storage key identifiers.
pub mod identifiers;
/// FSM state names.
pub mod state;
/// Table naming convention for persisted records.
pub mod tables;
