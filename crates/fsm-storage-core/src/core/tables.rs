// crates/fsm-storage-core/src/core/tables.rs
// ============================================================================
// Module: FSM Table Names
// Description: Naming convention for the three persisted FSM tables.
// Purpose: Keep table names configurable but safe to splice into SQL.
// Dependencies: serde
// ============================================================================

//! ## Overview
//! Every adapter persists three tables (state, data, bucket). Their names are
//! interpolated into SQL text because identifiers cannot be bound as
//! parameters, so [`TableNames::validate`] restricts them to plain
//! identifiers before any statement is built.
//!
//! Adapters assume they own these tables. Reusing the names for unrelated
//! tables in the same database is not detected and is undefined behaviour.

use serde::Deserialize;
use serde::Serialize;

use crate::interfaces::StorageError;

/// Default state table name.
pub const DEFAULT_STATE_TABLE: &str = "fsm_state";
/// Default data table name.
pub const DEFAULT_DATA_TABLE: &str = "fsm_data";
/// Default bucket table name.
pub const DEFAULT_BUCKET_TABLE: &str = "fsm_bucket";
/// Maximum identifier length (`PostgreSQL` truncates beyond 63 bytes).
const MAX_TABLE_NAME_LENGTH: usize = 63;

/// Table names used by an adapter instance.
///
/// # Invariants
/// - After [`TableNames::validate`], each name matches `[A-Za-z_][A-Za-z0-9_]*`,
///   is at most 63 bytes, and the three names are pairwise distinct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TableNames {
    /// Table holding one state per key.
    pub state: String,
    /// Table holding one data mapping per key.
    pub data: String,
    /// Table holding one bucket mapping per key.
    pub bucket: String,
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            state: DEFAULT_STATE_TABLE.to_string(),
            data: DEFAULT_DATA_TABLE.to_string(),
            bucket: DEFAULT_BUCKET_TABLE.to_string(),
        }
    }
}

impl TableNames {
    /// Builds table names sharing a common prefix (`<prefix>_state`, ...).
    #[must_use]
    pub fn with_prefix(prefix: &str) -> Self {
        Self {
            state: format!("{prefix}_state"),
            data: format!("{prefix}_data"),
            bucket: format!("{prefix}_bucket"),
        }
    }

    /// Validates that every name is a safe, distinct SQL identifier.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Config`] when a name is empty, too long,
    /// contains characters outside `[A-Za-z0-9_]`, starts with a digit, or
    /// duplicates another table name.
    pub fn validate(&self) -> Result<(), StorageError> {
        for (role, name) in [("state", &self.state), ("data", &self.data), ("bucket", &self.bucket)]
        {
            validate_identifier(role, name)?;
        }
        if self.state == self.data || self.state == self.bucket || self.data == self.bucket {
            return Err(StorageError::Config("table names must be distinct".to_string()));
        }
        Ok(())
    }
}

/// Validates a single table identifier.
fn validate_identifier(role: &str, name: &str) -> Result<(), StorageError> {
    if name.is_empty() {
        return Err(StorageError::Config(format!("{role} table name must not be empty")));
    }
    if name.len() > MAX_TABLE_NAME_LENGTH {
        return Err(StorageError::Config(format!(
            "{role} table name exceeds {MAX_TABLE_NAME_LENGTH} bytes"
        )));
    }
    let mut chars = name.chars();
    let starts_ok = chars.next().is_some_and(|ch| ch.is_ascii_alphabetic() || ch == '_');
    if !starts_ok || !chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_') {
        return Err(StorageError::Config(format!(
            "{role} table name must match [A-Za-z_][A-Za-z0-9_]*: {name}"
        )));
    }
    Ok(())
}
