// crates/fsm-storage-sqlite/src/storage.rs
// ============================================================================
// Module: SQLite FSM Storage
// Description: FsmStorage backed by a single SQLite connection.
// Purpose: Persist per-key FSM state, data, and bucket records in a file.
// Dependencies: fsm-storage-core, rusqlite, serde, serde_json, thiserror, tracing
// ============================================================================

//! ## Overview
//! This module implements [`FsmStorage`] using `SQLite`. Three tables hold
//! state, data, and bucket records keyed by `(chat_id, user_id)`; they are
//! created on open with `CREATE TABLE IF NOT EXISTS`, so opening the same
//! file twice is harmless. Mappings are stored as JSON text and decoded on
//! read; anything that is not a JSON object is reported as corruption.
//!
//! Merges run inside an `IMMEDIATE` transaction, which takes the database
//! write lock before reading, so concurrent merges from other connections or
//! processes cannot interleave with the read-modify-write.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use fsm_storage_core::DataMap;
use fsm_storage_core::FsmStorage;
use fsm_storage_core::StateName;
use fsm_storage_core::StorageError;
use fsm_storage_core::StorageKey;
use fsm_storage_core::TableNames;
use fsm_storage_core::merge_data;
use fsm_storage_core::parse_data_map;
use rusqlite::Connection;
use rusqlite::OpenFlags;
use rusqlite::OptionalExtension;
use rusqlite::TransactionBehavior;
use rusqlite::params;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;
use tracing::info;
use tracing::warn;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Default busy timeout (ms).
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
/// Maximum length of a single path component.
const MAX_PATH_COMPONENT_LENGTH: usize = 255;
/// Maximum total path length.
const MAX_TOTAL_PATH_LENGTH: usize = 4096;

// ============================================================================
// SECTION: Config
// ============================================================================

/// `SQLite` journal mode configuration.
///
/// # Invariants
/// - Values map 1:1 to `SQLite` `journal_mode` pragma settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SqliteJournalMode {
    /// WAL journal mode (recommended).
    #[default]
    Wal,
    /// Delete journal mode (legacy).
    Delete,
}

impl SqliteJournalMode {
    /// Returns the `SQLite` pragma value.
    #[must_use]
    pub const fn pragma_value(self) -> &'static str {
        match self {
            Self::Wal => "wal",
            Self::Delete => "delete",
        }
    }
}

/// `SQLite` sync mode configuration.
///
/// # Invariants
/// - Values map 1:1 to `SQLite` `synchronous` pragma settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SqliteSyncMode {
    /// Full synchronous mode (safest).
    #[default]
    Full,
    /// Normal synchronous mode (balanced).
    Normal,
}

impl SqliteSyncMode {
    /// Returns the `SQLite` pragma value.
    #[must_use]
    pub const fn pragma_value(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Normal => "normal",
        }
    }
}

/// Configuration for the `SQLite` FSM storage.
///
/// # Invariants
/// - `path` must resolve to a file path (not a directory).
/// - `busy_timeout_ms` is interpreted as milliseconds.
/// - `tables` must pass [`TableNames::validate`].
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SqliteStorageConfig {
    /// Path to the `SQLite` database file.
    pub path: PathBuf,
    /// Busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// `SQLite` journal mode.
    #[serde(default)]
    pub journal_mode: SqliteJournalMode,
    /// `SQLite` sync mode.
    #[serde(default)]
    pub sync_mode: SqliteSyncMode,
    /// Names of the state, data, and bucket tables.
    #[serde(default)]
    pub tables: TableNames,
}

impl SqliteStorageConfig {
    /// Creates a config for `path` with default pragmas and table names.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            journal_mode: SqliteJournalMode::default(),
            sync_mode: SqliteSyncMode::default(),
            tables: TableNames::default(),
        }
    }
}

/// Returns the default busy timeout for `SQLite` connections.
const fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// `SQLite` storage errors.
///
/// # Invariants
/// - Error messages avoid embedding stored data or bucket payloads.
#[derive(Debug, Error, Clone)]
pub enum SqliteStorageError {
    /// Filesystem error while preparing the database location.
    #[error("sqlite storage io error: {0}")]
    Io(String),
    /// Database file could not be opened.
    #[error("sqlite storage open error: {0}")]
    Open(String),
    /// `SQLite` engine error.
    #[error("sqlite storage db error: {0}")]
    Db(String),
    /// Invalid storage configuration.
    #[error("sqlite storage invalid config: {0}")]
    Invalid(String),
    /// Storage was closed.
    #[error("sqlite storage closed")]
    Closed,
}

impl From<SqliteStorageError> for StorageError {
    fn from(error: SqliteStorageError) -> Self {
        match error {
            SqliteStorageError::Io(message) | SqliteStorageError::Open(message) => {
                Self::Connection(message)
            }
            SqliteStorageError::Db(message) => Self::Database(message),
            SqliteStorageError::Invalid(message) => Self::Config(message),
            SqliteStorageError::Closed => Self::Connection("sqlite storage closed".to_string()),
        }
    }
}

/// Maps a `rusqlite` error into a storage db error.
fn db_err(err: rusqlite::Error) -> SqliteStorageError {
    SqliteStorageError::Db(err.to_string())
}

// ============================================================================
// SECTION: SQL
// ============================================================================

/// Mapping record kinds persisted as JSON text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MapKind {
    /// Data mapping.
    Data,
    /// Bucket mapping.
    Bucket,
}

/// Statements for one keyed record table.
#[derive(Debug, Clone)]
struct RecordSql {
    /// Selects the value column for a key.
    select: String,
    /// Inserts or replaces the value for a key.
    upsert: String,
    /// Deletes the row for a key.
    delete: String,
    /// Deletes every row.
    clear: String,
}

impl RecordSql {
    /// Renders statements for `table` with value column `column`.
    fn new(table: &str, column: &str) -> Self {
        Self {
            select: format!(
                "SELECT {column} FROM \"{table}\" WHERE chat_id = ?1 AND user_id = ?2"
            ),
            upsert: format!(
                "INSERT INTO \"{table}\" (chat_id, user_id, {column}) VALUES (?1, ?2, ?3) ON \
                 CONFLICT (chat_id, user_id) DO UPDATE SET {column} = excluded.{column}"
            ),
            delete: format!("DELETE FROM \"{table}\" WHERE chat_id = ?1 AND user_id = ?2"),
            clear: format!("DELETE FROM \"{table}\""),
        }
    }
}

/// Pre-rendered SQL for a validated set of table names.
#[derive(Debug, Clone)]
struct SqliteStatements {
    /// Schema creation batch.
    create: String,
    /// Key listing query over the state table.
    list_states: String,
    /// State table statements.
    state: RecordSql,
    /// Data table statements.
    data: RecordSql,
    /// Bucket table statements.
    bucket: RecordSql,
}

impl SqliteStatements {
    /// Renders every statement for `tables`.
    fn new(tables: &TableNames) -> Self {
        let create = format!(
            "CREATE TABLE IF NOT EXISTS \"{state}\" (
                chat_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                state TEXT NOT NULL,
                PRIMARY KEY (chat_id, user_id)
            );
            CREATE TABLE IF NOT EXISTS \"{data}\" (
                chat_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                data TEXT NOT NULL,
                PRIMARY KEY (chat_id, user_id)
            );
            CREATE TABLE IF NOT EXISTS \"{bucket}\" (
                chat_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                bucket TEXT NOT NULL,
                PRIMARY KEY (chat_id, user_id)
            );",
            state = tables.state,
            data = tables.data,
            bucket = tables.bucket,
        );
        Self {
            create,
            list_states: format!(
                "SELECT chat_id, user_id FROM \"{}\" ORDER BY chat_id, user_id",
                tables.state
            ),
            state: RecordSql::new(&tables.state, "state"),
            data: RecordSql::new(&tables.data, "data"),
            bucket: RecordSql::new(&tables.bucket, "bucket"),
        }
    }

    /// Returns the statements for a mapping kind.
    const fn map(&self, kind: MapKind) -> &RecordSql {
        match kind {
            MapKind::Data => &self.data,
            MapKind::Bucket => &self.bucket,
        }
    }
}

// ============================================================================
// SECTION: Store
// ============================================================================

/// `SQLite`-backed FSM storage.
///
/// Table names must not be shared with unrelated tables in the same
/// database file; collisions are not detected.
///
/// # Invariants
/// - Connection access is serialized through a mutex.
/// - After [`FsmStorage::close`] the connection slot is empty and every
///   operation fails with [`StorageError::Connection`].
pub struct SqliteFsmStorage {
    /// Storage configuration.
    config: SqliteStorageConfig,
    /// SQL rendered for the configured table names.
    statements: SqliteStatements,
    /// Open connection; `None` once closed.
    connection: Mutex<Option<Connection>>,
}

impl SqliteFsmStorage {
    /// Opens an `SQLite`-backed FSM storage and ensures its tables exist.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteStorageError`] when the configuration is invalid or the
    /// database cannot be opened or initialized.
    pub fn new(config: SqliteStorageConfig) -> Result<Self, SqliteStorageError> {
        validate_store_path(&config.path)?;
        config.tables.validate().map_err(|err| SqliteStorageError::Invalid(err.to_string()))?;
        ensure_parent_dir(&config.path)?;
        let statements = SqliteStatements::new(&config.tables);
        let connection = open_connection(&config)?;
        connection.execute_batch(&statements.create).map_err(db_err)?;
        debug!(
            state = %config.tables.state,
            data = %config.tables.data,
            bucket = %config.tables.bucket,
            "sqlite fsm tables ensured"
        );
        info!(path = %config.path.display(), "sqlite fsm storage opened");
        Ok(Self {
            config,
            statements,
            connection: Mutex::new(Some(connection)),
        })
    }

    /// Returns the database file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Returns the configured table names.
    #[must_use]
    pub const fn tables(&self) -> &TableNames {
        &self.config.tables
    }

    /// Runs `op` against the open connection.
    fn with_connection<T>(
        &self,
        op: impl FnOnce(&mut Connection) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let mut guard = self
            .connection
            .lock()
            .map_err(|_| SqliteStorageError::Io("sqlite mutex poisoned".to_string()))?;
        let Some(connection) = guard.as_mut() else {
            warn!(path = %self.config.path.display(), "sqlite fsm storage used after close");
            return Err(SqliteStorageError::Closed.into());
        };
        op(connection)
    }

    /// Reads a mapping record for `key`.
    fn read_map(&self, kind: MapKind, key: StorageKey) -> Result<DataMap, StorageError> {
        let sql = &self.statements.map(kind).select;
        self.with_connection(|connection| {
            let payload = select_text(connection, sql, key)?;
            payload.map_or_else(|| Ok(DataMap::new()), |payload| parse_data_map(&payload))
        })
    }

    /// Replaces a mapping record for `key`; an empty mapping deletes it.
    fn write_map(&self, kind: MapKind, key: StorageKey, value: &DataMap) -> Result<(), StorageError> {
        let sql = self.statements.map(kind);
        if value.is_empty() {
            return self.with_connection(|connection| {
                connection
                    .execute(&sql.delete, params![key.chat.get(), key.user.get()])
                    .map_err(db_err)?;
                Ok(())
            });
        }
        let payload = encode_map(value)?;
        self.with_connection(|connection| {
            connection
                .execute(&sql.upsert, params![key.chat.get(), key.user.get(), payload])
                .map_err(db_err)?;
            Ok(())
        })
    }

    /// Shallow-merges `patch` into a mapping record inside one write transaction.
    fn merge_map(&self, kind: MapKind, key: StorageKey, patch: &DataMap) -> Result<(), StorageError> {
        let sql = self.statements.map(kind);
        self.with_connection(|connection| {
            if patch.is_empty() {
                return Ok(());
            }
            let tx = connection
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(db_err)?;
            let mut current = match select_text(&tx, &sql.select, key)? {
                Some(payload) => parse_data_map(&payload)?,
                None => DataMap::new(),
            };
            merge_data(&mut current, patch);
            let payload = encode_map(&current)?;
            tx.execute(&sql.upsert, params![key.chat.get(), key.user.get(), payload])
                .map_err(db_err)?;
            tx.commit().map_err(db_err)?;
            Ok(())
        })
    }
}

impl FsmStorage for SqliteFsmStorage {
    fn get_state(&self, key: StorageKey) -> Result<Option<StateName>, StorageError> {
        let sql = &self.statements.state.select;
        self.with_connection(|connection| Ok(select_text(connection, sql, key)?.map(StateName::new)))
    }

    fn set_state(&self, key: StorageKey, state: Option<&StateName>) -> Result<(), StorageError> {
        let sql = &self.statements.state;
        self.with_connection(|connection| {
            let result = match state {
                Some(state) => connection.execute(
                    &sql.upsert,
                    params![key.chat.get(), key.user.get(), state.as_str()],
                ),
                None => connection.execute(&sql.delete, params![key.chat.get(), key.user.get()]),
            };
            result.map_err(db_err)?;
            Ok(())
        })
    }

    fn get_data(&self, key: StorageKey) -> Result<DataMap, StorageError> {
        self.read_map(MapKind::Data, key)
    }

    fn set_data(&self, key: StorageKey, data: &DataMap) -> Result<(), StorageError> {
        self.write_map(MapKind::Data, key, data)
    }

    fn update_data(&self, key: StorageKey, patch: &DataMap) -> Result<(), StorageError> {
        self.merge_map(MapKind::Data, key, patch)
    }

    fn has_bucket(&self) -> bool {
        true
    }

    fn get_bucket(&self, key: StorageKey) -> Result<DataMap, StorageError> {
        self.read_map(MapKind::Bucket, key)
    }

    fn set_bucket(&self, key: StorageKey, bucket: &DataMap) -> Result<(), StorageError> {
        self.write_map(MapKind::Bucket, key, bucket)
    }

    fn update_bucket(&self, key: StorageKey, patch: &DataMap) -> Result<(), StorageError> {
        self.merge_map(MapKind::Bucket, key, patch)
    }

    fn list_states(&self) -> Result<Vec<StorageKey>, StorageError> {
        let sql = &self.statements.list_states;
        self.with_connection(|connection| {
            let mut stmt = connection.prepare(sql).map_err(db_err)?;
            let rows = stmt
                .query_map(params![], |row| {
                    Ok(StorageKey::from_raw(row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
                })
                .map_err(db_err)?;
            let mut keys = Vec::new();
            for row in rows {
                keys.push(row.map_err(db_err)?);
            }
            Ok(keys)
        })
    }

    fn reset_all(&self, full: bool) -> Result<(), StorageError> {
        let statements = &self.statements;
        self.with_connection(|connection| {
            let tx = connection.transaction().map_err(db_err)?;
            tx.execute(&statements.state.clear, params![]).map_err(db_err)?;
            if full {
                tx.execute(&statements.data.clear, params![]).map_err(db_err)?;
                tx.execute(&statements.bucket.clear, params![]).map_err(db_err)?;
            }
            tx.commit().map_err(db_err)?;
            Ok(())
        })?;
        info!(full, "sqlite fsm storage reset");
        Ok(())
    }

    fn readiness(&self) -> Result<(), StorageError> {
        self.with_connection(|connection| {
            connection.query_row("SELECT 1", params![], |row| row.get::<_, i64>(0)).map_err(db_err)?;
            Ok(())
        })
    }

    fn close(&self) -> Result<(), StorageError> {
        let connection = {
            let mut guard = self
                .connection
                .lock()
                .map_err(|_| SqliteStorageError::Io("sqlite mutex poisoned".to_string()))?;
            guard.take()
        };
        let Some(connection) = connection else {
            return Ok(());
        };
        if self.config.journal_mode == SqliteJournalMode::Wal
            && let Err(err) = connection.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")
        {
            warn!(error = %err, "sqlite wal checkpoint failed during close");
        }
        connection.close().map_err(|(_, err)| db_err(err))?;
        debug!(path = %self.config.path.display(), "sqlite fsm storage closed");
        Ok(())
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Runs a single-column text lookup for `key`.
fn select_text(
    connection: &Connection,
    sql: &str,
    key: StorageKey,
) -> Result<Option<String>, SqliteStorageError> {
    connection
        .query_row(sql, params![key.chat.get(), key.user.get()], |row| row.get::<_, String>(0))
        .optional()
        .map_err(db_err)
}

/// Encodes a mapping as JSON text.
fn encode_map(value: &DataMap) -> Result<String, StorageError> {
    serde_json::to_string(value).map_err(|err| StorageError::Invalid(err.to_string()))
}

/// Ensures the parent directory for the store exists.
fn ensure_parent_dir(path: &Path) -> Result<(), SqliteStorageError> {
    let Some(parent) = path.parent() else {
        return Err(SqliteStorageError::Io("store path missing parent directory".to_string()));
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }
    std::fs::create_dir_all(parent).map_err(|err| SqliteStorageError::Io(err.to_string()))
}

/// Validates store paths for safety limits.
fn validate_store_path(path: &Path) -> Result<(), SqliteStorageError> {
    if path.as_os_str().is_empty() {
        return Err(SqliteStorageError::Invalid("store path must not be empty".to_string()));
    }
    let path_string = path.display().to_string();
    if path_string.len() > MAX_TOTAL_PATH_LENGTH {
        return Err(SqliteStorageError::Invalid("store path exceeds length limit".to_string()));
    }
    for component in path.components() {
        let name = component.as_os_str().to_string_lossy();
        if name.len() > MAX_PATH_COMPONENT_LENGTH {
            return Err(SqliteStorageError::Invalid(
                "store path contains an overlong component".to_string(),
            ));
        }
    }
    if path.is_dir() {
        return Err(SqliteStorageError::Invalid(
            "store path must be a file, not a directory".to_string(),
        ));
    }
    Ok(())
}

/// Opens an `SQLite` connection and applies pragmas.
fn open_connection(config: &SqliteStorageConfig) -> Result<Connection, SqliteStorageError> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
    let connection = Connection::open_with_flags(&config.path, flags)
        .map_err(|err| SqliteStorageError::Open(err.to_string()))?;
    apply_pragmas(&connection, config)?;
    Ok(connection)
}

/// Applies `SQLite` pragmas from the configuration.
fn apply_pragmas(
    connection: &Connection,
    config: &SqliteStorageConfig,
) -> Result<(), SqliteStorageError> {
    connection
        .execute_batch(&format!("PRAGMA journal_mode = {};", config.journal_mode.pragma_value()))
        .map_err(db_err)?;
    connection
        .execute_batch(&format!("PRAGMA synchronous = {};", config.sync_mode.pragma_value()))
        .map_err(db_err)?;
    connection.busy_timeout(Duration::from_millis(config.busy_timeout_ms)).map_err(db_err)?;
    Ok(())
}
