// crates/fsm-storage-postgres/src/storage/tests.rs
// ============================================================================
// Module: Postgres FSM Storage Unit Tests
// Description: SQL rendering, config, and error mapping checks.
// Purpose: Cover logic that does not need a live server.
// ============================================================================

//! Unit tests for Postgres statement rendering and error mapping.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    clippy::panic,
    reason = "Test-only assertions and helpers are permitted."
)]

use std::sync::Arc;
use std::sync::Mutex;
use std::thread;

use fsm_storage_core::DataMap;
use fsm_storage_core::FsmStorage;
use fsm_storage_core::StateName;
use fsm_storage_core::StorageError;
use fsm_storage_core::StorageKey;
use fsm_storage_core::TableNames;
use serde_json::json;

use super::PostgresFsmStorage;
use super::PostgresStatements;
use super::PostgresStorageConfig;
use super::PostgresStorageError;
use super::encode_map;

/// Builds a storage whose pool has already been released.
fn closed_storage() -> PostgresFsmStorage {
    let tables = TableNames::default();
    PostgresFsmStorage {
        pool: Mutex::new(None),
        statements: PostgresStatements::new(&tables),
        tables,
    }
}

fn map(value: serde_json::Value) -> DataMap {
    value.as_object().cloned().expect("object literal")
}

#[test]
fn statements_use_configured_tables() {
    let tables = TableNames::with_prefix("bot1");
    let statements = PostgresStatements::new(&tables);
    assert!(statements.create.contains("\"bot1_state\""));
    assert!(statements.create.contains("\"bot1_data\""));
    assert!(statements.create.contains("\"bot1_bucket\""));
    assert!(statements.state.select.contains("FROM \"bot1_state\""));
    assert!(statements.bucket.clear.ends_with("\"bot1_bucket\""));
}

#[test]
fn merge_statements_use_jsonb_concatenation() {
    let statements = PostgresStatements::new(&TableNames::default());
    assert!(statements.merge_data.contains("\"fsm_data\".data || EXCLUDED.data"));
    assert!(statements.merge_bucket.contains("\"fsm_bucket\".bucket || EXCLUDED.bucket"));
    assert!(statements.data.upsert.contains("$3::TEXT::JSONB"));
    assert!(statements.data.select.starts_with("SELECT data::TEXT"));
}

#[test]
fn create_batch_declares_composite_keys() {
    let statements = PostgresStatements::new(&TableNames::default());
    assert_eq!(statements.create.matches("PRIMARY KEY (chat_id, user_id)").count(), 3);
    assert_eq!(statements.create.matches("CREATE TABLE IF NOT EXISTS").count(), 3);
}

#[test]
fn list_states_is_ordered() {
    let statements = PostgresStatements::new(&TableNames::default());
    assert!(statements.list_states.ends_with("ORDER BY chat_id, user_id"));
}

#[test]
fn debug_output_redacts_password() {
    let config = PostgresStorageConfig::new("bot", "hunter2", "fsm");
    let rendered = format!("{config:?}");
    assert!(!rendered.contains("hunter2"));
    assert!(rendered.contains("<redacted>"));
}

#[test]
fn errors_map_to_storage_kinds() {
    let config: StorageError = PostgresStorageError::Config("bad".to_string()).into();
    let connection: StorageError = PostgresStorageError::Connection("down".to_string()).into();
    let database: StorageError = PostgresStorageError::Postgres("boom".to_string()).into();
    assert!(matches!(config, StorageError::Config(_)));
    assert!(connection.is_connection());
    assert!(matches!(database, StorageError::Database(_)));
}

#[test]
fn pg_config_carries_statement_timeout() {
    let mut config = PostgresStorageConfig::new("bot", "secret", "fsm");
    config.statement_timeout_ms = 1_500;
    let pg_config = config.pg_config();
    assert_eq!(pg_config.get_options(), Some("-c statement_timeout=1500"));
    assert_eq!(pg_config.get_dbname(), Some("fsm"));
    assert_eq!(pg_config.get_ports(), &[5432]);
}

#[test]
fn debug_output_omits_missing_password() {
    let mut config = PostgresStorageConfig::new("bot", "hunter2", "fsm");
    config.password = None;
    config.password_env = Some("FSM_PG_PASSWORD".to_string());
    let rendered = format!("{config:?}");
    assert!(rendered.contains("password: None"));
    assert!(rendered.contains("FSM_PG_PASSWORD"));
}

#[test]
fn closed_storage_rejects_empty_merges() {
    let storage = closed_storage();
    let key = StorageKey::from_raw(1, 2);
    assert!(storage.update_data(key, &DataMap::new()).unwrap_err().is_connection());
    assert!(storage.update_bucket(key, &DataMap::new()).unwrap_err().is_connection());
    assert!(storage.set_state(key, None).unwrap_err().is_connection());
    assert!(storage.readiness().unwrap_err().is_connection());
    storage.close().unwrap();
}

#[test]
fn poisoned_pool_lock_maps_to_connection_everywhere() {
    let storage = Arc::new(closed_storage());
    let holder = Arc::clone(&storage);
    let joined = thread::spawn(move || {
        let _guard = holder.pool.lock().unwrap();
        panic!("poison the pool lock");
    })
    .join();
    assert!(joined.is_err());

    let key = StorageKey::from_raw(3, 4);
    assert!(storage.get_state(key).unwrap_err().is_connection());
    assert!(storage.update_data(key, &DataMap::new()).unwrap_err().is_connection());
    assert!(storage.close().unwrap_err().is_connection());
}

#[test]
fn encode_map_rejects_nul_characters() {
    let nested = map(json!({"outer": {"list": ["ok", "bad\u{0}"]}}));
    assert!(matches!(encode_map(&nested), Err(StorageError::Invalid(_))));

    let mut key_with_nul = DataMap::new();
    key_with_nul.insert("k\u{0}".to_string(), json!(1));
    assert!(matches!(encode_map(&key_with_nul), Err(StorageError::Invalid(_))));

    let escaped = map(json!({"path": "C:\\u0000"}));
    assert_eq!(encode_map(&escaped).unwrap(), r#"{"path":"C:\\u0000"}"#);
}

#[test]
fn closed_check_precedes_state_validation() {
    let storage = closed_storage();
    let state = StateName::new("Form\u{0}name");
    let err = storage.set_state(StorageKey::from_raw(1, 1), Some(&state)).unwrap_err();
    assert!(err.is_connection());
}
