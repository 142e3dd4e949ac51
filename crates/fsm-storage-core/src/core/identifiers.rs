// crates/fsm-storage-core/src/core/identifiers.rs
// ============================================================================
// Module: FSM Storage Identifiers
// Description: Chat, user, and composite storage key identifiers.
// Purpose: Provide strongly typed keys with stable wire and column forms.
// Dependencies: serde
// ============================================================================

//! ## Overview
//! Chat platforms hand out signed 64-bit identifiers; group chats commonly
//! use negative values. Identifiers here are thin wrappers so a chat id can
//! never be passed where a user id is expected.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::interfaces::StorageError;

// ============================================================================
// SECTION: Identifier Types
// ============================================================================

/// Chat identifier.
///
/// # Invariants
/// - Any `i64` is accepted; negative values denote group chats on most platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatId(i64);

impl ChatId {
    /// Creates a chat identifier.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Returns the raw identifier value.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<i64> for ChatId {
    fn from(value: i64) -> Self {
        Self::new(value)
    }
}

/// User identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(i64);

impl UserId {
    /// Creates a user identifier.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Returns the raw identifier value.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<i64> for UserId {
    fn from(value: i64) -> Self {
        Self::new(value)
    }
}

// ============================================================================
// SECTION: Storage Key
// ============================================================================

/// Composite key addressing every FSM record.
///
/// # Invariants
/// - Ordering is by chat first, then user; listings rely on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StorageKey {
    /// Chat identifier.
    pub chat: ChatId,
    /// User identifier.
    pub user: UserId,
}

impl StorageKey {
    /// Creates a storage key from a chat and user identifier.
    #[must_use]
    pub const fn new(chat: ChatId, user: UserId) -> Self {
        Self {
            chat,
            user,
        }
    }

    /// Creates a storage key from raw identifier values.
    #[must_use]
    pub const fn from_raw(chat: i64, user: i64) -> Self {
        Self::new(ChatId::new(chat), UserId::new(user))
    }

    /// Resolves a key when the dispatcher only knows one side of it.
    ///
    /// A private chat shares its id with the user, so a missing half is
    /// filled from the one that was supplied.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Invalid`] when neither identifier is supplied.
    pub fn resolve(chat: Option<ChatId>, user: Option<UserId>) -> Result<Self, StorageError> {
        match (chat, user) {
            (Some(chat), Some(user)) => Ok(Self::new(chat, user)),
            (Some(chat), None) => Ok(Self::new(chat, UserId::new(chat.get()))),
            (None, Some(user)) => Ok(Self::new(ChatId::new(user.get()), user)),
            (None, None) => Err(StorageError::Invalid(
                "storage key requires a chat or a user identifier".to_string(),
            )),
        }
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.chat, self.user)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, reason = "Unit tests use expect for setup clarity.")]

    use super::ChatId;
    use super::StorageKey;
    use super::UserId;

    #[test]
    fn storage_key_orders_by_chat_then_user() {
        let mut keys =
            vec![StorageKey::from_raw(2, 1), StorageKey::from_raw(1, 9), StorageKey::from_raw(1, 3)];
        keys.sort();
        assert_eq!(
            keys,
            vec![StorageKey::from_raw(1, 3), StorageKey::from_raw(1, 9), StorageKey::from_raw(2, 1)]
        );
    }

    #[test]
    fn storage_key_display_joins_ids() {
        let key = StorageKey::new(ChatId::new(-100), UserId::new(42));
        assert_eq!(key.to_string(), "-100:42");
    }

    #[test]
    fn storage_key_resolve_prefers_both_when_given() {
        let key = StorageKey::resolve(Some(ChatId::new(5)), Some(UserId::new(6))).expect("resolve");
        assert_eq!(key, StorageKey::from_raw(5, 6));
    }
}
