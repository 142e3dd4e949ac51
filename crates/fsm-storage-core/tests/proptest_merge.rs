// crates/fsm-storage-core/tests/proptest_merge.rs
// ============================================================================
// Module: Merge Property Tests
// Description: Property-based checks for the shallow merge law.
// Purpose: Ensure update_data semantics hold for arbitrary mappings.
// ============================================================================

//! Property-based tests for `merge_data` and key resolution.

#![allow(clippy::unwrap_used, reason = "Test-only assertions and helpers are permitted.")]

use fsm_storage_core::ChatId;
use fsm_storage_core::DataMap;
use fsm_storage_core::StorageKey;
use fsm_storage_core::UserId;
use fsm_storage_core::merge_data;
use proptest::prelude::*;
use serde_json::Value;

fn scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::from),
        "[a-z]{0,8}".prop_map(Value::from),
    ]
}

fn data_map() -> impl Strategy<Value = DataMap> {
    prop::collection::btree_map("[a-e]{1,2}", scalar(), 0 .. 6)
        .prop_map(|entries| entries.into_iter().collect())
}

proptest! {
    #[test]
    fn merge_keeps_patch_values_and_untouched_base_keys(base in data_map(), patch in data_map()) {
        let mut merged = base.clone();
        merge_data(&mut merged, &patch);

        for (key, value) in &patch {
            prop_assert_eq!(merged.get(key), Some(value));
        }
        for (key, value) in &base {
            if !patch.contains_key(key) {
                prop_assert_eq!(merged.get(key), Some(value));
            }
        }
        prop_assert!(merged.keys().all(|key| base.contains_key(key) || patch.contains_key(key)));
    }

    #[test]
    fn merge_is_idempotent(base in data_map(), patch in data_map()) {
        let mut once = base;
        merge_data(&mut once, &patch);
        let mut twice = once.clone();
        merge_data(&mut twice, &patch);
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn resolve_fills_missing_half(id in any::<i64>()) {
        let from_chat = StorageKey::resolve(Some(ChatId::new(id)), None).unwrap();
        let from_user = StorageKey::resolve(None, Some(UserId::new(id))).unwrap();
        prop_assert_eq!(from_chat, StorageKey::from_raw(id, id));
        prop_assert_eq!(from_user, from_chat);
    }
}

#[test]
fn resolve_rejects_missing_key() {
    assert!(StorageKey::resolve(None, None).is_err());
}
