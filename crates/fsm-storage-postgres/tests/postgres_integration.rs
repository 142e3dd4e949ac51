// crates/fsm-storage-postgres/tests/postgres_integration.rs
// ============================================================================
// Module: Postgres FSM Storage Integration Tests
// Description: Behavioural tests against a live PostgreSQL server.
// Purpose: Validate CRUD, merge, listing, reset, and close semantics.
// ============================================================================

//! ## Overview
//! Requires the `postgres-integration` feature and a reachable server. The
//! connection is read from `FSM_STORAGE_PG_HOST`, `FSM_STORAGE_PG_PORT`,
//! `FSM_STORAGE_PG_USER`, `FSM_STORAGE_PG_PASSWORD`, and
//! `FSM_STORAGE_PG_DATABASE`. Each test uses its own table prefix.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    reason = "Test-only assertions and helpers are permitted."
)]

use std::env;
use std::sync::Arc;
use std::thread;

use fsm_storage_core::DataMap;
use fsm_storage_core::FsmStorage;
use fsm_storage_core::StateName;
use fsm_storage_core::StorageError;
use fsm_storage_core::StorageKey;
use fsm_storage_core::TableNames;
use fsm_storage_postgres::PostgresFsmStorage;
use fsm_storage_postgres::PostgresStorageConfig;
use serde_json::json;

// ============================================================================
// SECTION: Helpers
// ============================================================================

fn env_or(name: &str, fallback: &str) -> String {
    env::var(name).unwrap_or_else(|_| fallback.to_string())
}

fn config(prefix: &str) -> PostgresStorageConfig {
    let mut config = PostgresStorageConfig::new(
        env_or("FSM_STORAGE_PG_USER", "postgres"),
        env_or("FSM_STORAGE_PG_PASSWORD", "postgres"),
        env_or("FSM_STORAGE_PG_DATABASE", "postgres"),
    );
    config.host = env_or("FSM_STORAGE_PG_HOST", "localhost");
    config.port = env_or("FSM_STORAGE_PG_PORT", "5432").parse().expect("numeric port");
    config.tables = TableNames::with_prefix(&format!("fsm_it_{prefix}"));
    config
}

fn open(prefix: &str) -> PostgresFsmStorage {
    let storage = PostgresFsmStorage::new(&config(prefix)).expect("connect to postgres");
    storage.reset_all(true).expect("clean tables");
    storage
}

fn map(value: serde_json::Value) -> DataMap {
    value.as_object().cloned().expect("object literal")
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[test]
fn state_roundtrip_and_delete() {
    let storage = open("state");
    let key = StorageKey::from_raw(-1001, 42);

    assert_eq!(storage.get_state(key).unwrap(), None);
    storage.set_state(key, Some(&StateName::new("Form:name"))).unwrap();
    storage.set_state(key, Some(&StateName::new("Form:age"))).unwrap();
    assert_eq!(storage.get_state(key).unwrap(), Some(StateName::new("Form:age")));

    storage.set_state(key, None).unwrap();
    assert_eq!(storage.get_state(key).unwrap(), None);
    assert!(storage.list_states().unwrap().is_empty());
}

#[test]
fn data_and_bucket_are_independent() {
    let storage = open("indep");
    let key = StorageKey::from_raw(1, 2);
    storage.set_data(key, &map(json!({"name": "Ada", "nested": {"x": [1, 2]}}))).unwrap();
    storage.set_bucket(key, &map(json!({"hits": 3}))).unwrap();

    assert_eq!(storage.get_data(key).unwrap(), map(json!({"name": "Ada", "nested": {"x": [1, 2]}})));
    assert_eq!(storage.get_bucket(key).unwrap(), map(json!({"hits": 3})));
    assert!(storage.get_data(StorageKey::from_raw(2, 1)).unwrap().is_empty());

    storage.set_data(key, &DataMap::new()).unwrap();
    assert!(storage.get_data(key).unwrap().is_empty());
    assert_eq!(storage.get_bucket(key).unwrap(), map(json!({"hits": 3})));
}

#[test]
fn update_merges_top_level_keys() {
    let storage = open("merge");
    let key = StorageKey::from_raw(5, 5);
    storage.update_data(key, &map(json!({"a": 1, "b": {"x": 1}}))).unwrap();
    storage.update_data(key, &map(json!({"b": {"y": 2}, "c": null}))).unwrap();
    assert_eq!(storage.get_data(key).unwrap(), map(json!({"a": 1, "b": {"y": 2}, "c": null})));

    storage.update_bucket(key, &map(json!({"n": 1}))).unwrap();
    storage.update_bucket(key, &DataMap::new()).unwrap();
    assert_eq!(storage.get_bucket(key).unwrap(), map(json!({"n": 1})));
}

#[test]
fn concurrent_updates_keep_every_key() {
    let storage = Arc::new(open("concurrent"));
    let key = StorageKey::from_raw(9, 9);
    let handles: Vec<_> = (0 .. 8)
        .map(|worker| {
            let storage = Arc::clone(&storage);
            thread::spawn(move || {
                for step in 0 .. 5 {
                    let field = format!("w{worker}_{step}");
                    storage.update_data(key, &map(json!({ field: step }))).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(storage.get_data(key).unwrap().len(), 40);
}

#[test]
fn reset_all_respects_full_flag() {
    let storage = open("reset");
    let key = StorageKey::from_raw(3, 4);
    storage.set_state(key, Some(&StateName::new("S"))).unwrap();
    storage.set_data(key, &map(json!({"k": "v"}))).unwrap();
    assert_eq!(storage.list_states().unwrap(), vec![key]);

    storage.reset_all(false).unwrap();
    assert!(storage.list_states().unwrap().is_empty());
    assert_eq!(storage.get_data(key).unwrap(), map(json!({"k": "v"})));

    storage.reset_all(true).unwrap();
    assert!(storage.get_data(key).unwrap().is_empty());
}

#[test]
fn reopening_keeps_existing_rows() {
    let first = open("reopen");
    let key = StorageKey::from_raw(7, 8);
    first.set_state(key, Some(&StateName::new("Kept"))).unwrap();
    first.close().unwrap();

    let second = PostgresFsmStorage::new(&config("reopen")).unwrap();
    assert_eq!(second.get_state(key).unwrap(), Some(StateName::new("Kept")));
    assert!(second.readiness().is_ok());
}

#[test]
fn close_is_idempotent_and_blocks_later_calls() {
    let storage = open("close");
    storage.close().unwrap();
    storage.close().unwrap();
    let key = StorageKey::from_raw(1, 1);
    assert!(storage.get_state(key).unwrap_err().is_connection());
    assert!(storage.update_data(key, &DataMap::new()).unwrap_err().is_connection());
    assert!(storage.update_bucket(key, &DataMap::new()).unwrap_err().is_connection());
    assert!(storage.readiness().is_err());
}

#[test]
fn nul_characters_are_rejected_as_invalid() {
    let storage = open("nul");
    let key = StorageKey::from_raw(6, 6);
    let err = storage.set_data(key, &map(json!({"name": "a\u{0}b"}))).unwrap_err();
    assert!(matches!(err, StorageError::Invalid(_)));
    let err = storage.set_state(key, Some(&StateName::new("S\u{0}"))).unwrap_err();
    assert!(matches!(err, StorageError::Invalid(_)));
    assert!(storage.get_data(key).unwrap().is_empty());
    assert_eq!(storage.get_state(key).unwrap(), None);
}
