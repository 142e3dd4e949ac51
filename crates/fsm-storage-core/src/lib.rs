// crates/fsm-storage-core/src/lib.rs
// ============================================================================
// Module: FSM Storage Core
// Description: Backend-agnostic FSM storage contract and shared types.
// Purpose: Define what every FSM storage adapter must provide.
// Dependencies: serde, serde_json, thiserror
// ============================================================================

//! ## Overview
//! `fsm-storage-core` defines the storage contract a chat-bot dispatcher uses
//! to persist conversational state. Every record is addressed by a
//! [`StorageKey`] made of a chat and a user identifier, and three record kinds
//! live under that key: the current [`StateName`], a free-form data
//! [`DataMap`], and a separate bucket [`DataMap`].
//!
//! Backends implement [`FsmStorage`]; the dispatcher holds a
//! [`SharedFsmStorage`] so the backend can be chosen at startup.

/// Core data types: identifiers, state names, mappings, table names.
pub mod core;
/// Storage contract and error types.
pub mod interfaces;

pub use crate::core::data::DataMap;
pub use crate::core::data::merge_data;
pub use crate::core::data::parse_data_map;
pub use crate::core::identifiers::ChatId;
pub use crate::core::identifiers::StorageKey;
pub use crate::core::identifiers::UserId;
pub use crate::core::state::StateName;
pub use crate::core::tables::DEFAULT_BUCKET_TABLE;
pub use crate::core::tables::DEFAULT_DATA_TABLE;
pub use crate::core::tables::DEFAULT_STATE_TABLE;
pub use crate::core::tables::TableNames;
pub use crate::interfaces::FsmStorage;
pub use crate::interfaces::SharedFsmStorage;
pub use crate::interfaces::StorageError;
