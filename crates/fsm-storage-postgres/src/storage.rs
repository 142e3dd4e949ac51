// crates/fsm-storage-postgres/src/storage.rs
// ============================================================================
// Module: Postgres FSM Storage
// Description: FsmStorage backed by a pooled PostgreSQL connection.
// Purpose: Provide durable FSM storage shared by many bot workers.
// Dependencies: fsm-storage-core, postgres, r2d2, r2d2_postgres, serde, thiserror, tracing
// ============================================================================

//! ## Overview
//! [`PostgresFsmStorage`] keeps state as `TEXT` and data/bucket mappings as
//! `JSONB`, each in its own table keyed by `(chat_id, user_id)`. Tables are
//! created on connect with `CREATE TABLE IF NOT EXISTS`.
//!
//! Merges are a single `INSERT .. ON CONFLICT DO UPDATE` using the `JSONB`
//! `||` operator, so concurrent updates to one key never lose a write and no
//! client-side transaction is held open. Mapping values cross the wire as
//! JSON text and are cast server-side.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use fsm_storage_core::DataMap;
use fsm_storage_core::FsmStorage;
use fsm_storage_core::SharedFsmStorage;
use fsm_storage_core::StateName;
use fsm_storage_core::StorageError;
use fsm_storage_core::StorageKey;
use fsm_storage_core::TableNames;
use fsm_storage_core::parse_data_map;
use postgres::NoTls;
use r2d2::Pool;
use r2d2::PooledConnection;
use r2d2_postgres::PostgresConnectionManager;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;
use tracing::info;
use tracing::warn;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Default Postgres host.
const DEFAULT_HOST: &str = "localhost";
/// Default Postgres port.
const DEFAULT_PORT: u16 = 5432;
/// Application name reported to the server.
const APPLICATION_NAME: &str = "fsm-storage";

/// Pool of blocking Postgres clients.
type PgPool = Pool<PostgresConnectionManager<NoTls>>;
/// Connection checked out of [`PgPool`].
type PgConnection = PooledConnection<PostgresConnectionManager<NoTls>>;

// ============================================================================
// SECTION: Config
// ============================================================================

/// Postgres storage configuration.
///
/// `username`, `password`, and `database` are required. The remaining
/// fields default to a local server and conservative pool limits. An empty
/// password is accepted for servers using trust authentication, but the key
/// must be present.
#[derive(Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PostgresStorageConfig {
    /// Role used to connect.
    pub username: String,
    /// Password for `username`.
    #[serde(default)]
    pub password: Option<String>,
    /// Environment variable holding the password.
    ///
    /// Resolved into `password` by the config loader; the adapter itself
    /// never reads the environment.
    #[serde(default)]
    pub password_env: Option<String>,
    /// Server host name or address.
    #[serde(default = "default_host")]
    pub host: String,
    /// Server port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Database name.
    pub database: String,
    /// Maximum pool size.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Connect timeout in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Statement timeout in milliseconds.
    #[serde(default = "default_statement_timeout_ms")]
    pub statement_timeout_ms: u64,
    /// Names of the state, data, and bucket tables.
    #[serde(default)]
    pub tables: TableNames,
}

/// Returns the default Postgres host.
fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

/// Returns the default Postgres port.
const fn default_port() -> u16 {
    DEFAULT_PORT
}

/// Returns the default pool size.
const fn default_max_connections() -> u32 {
    16
}

/// Returns the default connect timeout in milliseconds.
const fn default_connect_timeout_ms() -> u64 {
    5_000
}

/// Returns the default statement timeout in milliseconds.
const fn default_statement_timeout_ms() -> u64 {
    30_000
}

impl PostgresStorageConfig {
    /// Creates a config for a local server with default pool limits.
    #[must_use]
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        database: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            password: Some(password.into()),
            password_env: None,
            host: default_host(),
            port: DEFAULT_PORT,
            database: database.into(),
            max_connections: default_max_connections(),
            connect_timeout_ms: default_connect_timeout_ms(),
            statement_timeout_ms: default_statement_timeout_ms(),
            tables: TableNames::default(),
        }
    }

    /// Validates the configuration without contacting the server.
    ///
    /// # Errors
    ///
    /// Returns [`PostgresStorageError::Config`] when a required field is
    /// missing or empty, or a limit is zero.
    pub fn validate(&self) -> Result<(), PostgresStorageError> {
        if self.username.trim().is_empty() {
            return Err(PostgresStorageError::Config("username is required".to_string()));
        }
        if self.database.trim().is_empty() {
            return Err(PostgresStorageError::Config("database is required".to_string()));
        }
        if self.password.is_none() {
            return Err(PostgresStorageError::Config(
                "password is required (set password or password_env)".to_string(),
            ));
        }
        if self.host.trim().is_empty() {
            return Err(PostgresStorageError::Config("host must not be empty".to_string()));
        }
        if self.port == 0 {
            return Err(PostgresStorageError::Config("port must be non-zero".to_string()));
        }
        if self.max_connections == 0 {
            return Err(PostgresStorageError::Config(
                "max_connections must be greater than zero".to_string(),
            ));
        }
        if self.connect_timeout_ms == 0 {
            return Err(PostgresStorageError::Config(
                "connect_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.statement_timeout_ms == 0 {
            return Err(PostgresStorageError::Config(
                "statement_timeout_ms must be greater than zero".to_string(),
            ));
        }
        self.tables.validate().map_err(|err| match err {
            StorageError::Config(message) => PostgresStorageError::Config(message),
            other => PostgresStorageError::Config(other.to_string()),
        })
    }

    /// Builds the driver connection config.
    fn pg_config(&self) -> postgres::Config {
        let mut pg_config = postgres::Config::new();
        pg_config.user(&self.username);
        if let Some(password) = &self.password {
            pg_config.password(password);
        }
        pg_config
            .host(&self.host)
            .port(self.port)
            .dbname(&self.database)
            .application_name(APPLICATION_NAME)
            .connect_timeout(Duration::from_millis(self.connect_timeout_ms));
        let options = format!("-c statement_timeout={}", self.statement_timeout_ms);
        pg_config.options(&options);
        pg_config
    }
}

impl fmt::Debug for PostgresStorageConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresStorageConfig")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("password_env", &self.password_env)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("max_connections", &self.max_connections)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("statement_timeout_ms", &self.statement_timeout_ms)
            .field("tables", &self.tables)
            .finish()
    }
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Postgres storage errors.
#[derive(Debug, Error)]
pub enum PostgresStorageError {
    /// Invalid configuration.
    #[error("postgres storage config error: {0}")]
    Config(String),
    /// Server unreachable or pool exhausted.
    #[error("postgres storage connection error: {0}")]
    Connection(String),
    /// Postgres error.
    #[error("postgres storage error: {0}")]
    Postgres(String),
}

impl From<PostgresStorageError> for StorageError {
    fn from(error: PostgresStorageError) -> Self {
        match error {
            PostgresStorageError::Config(message) => Self::Config(message),
            PostgresStorageError::Connection(message) => Self::Connection(message),
            PostgresStorageError::Postgres(message) => Self::Database(message),
        }
    }
}

/// Maps a driver error into a storage error.
///
/// Errors raised because the socket dropped count as connectivity failures.
fn pg_err(err: &postgres::Error) -> StorageError {
    if err.is_closed() {
        StorageError::Connection(err.to_string())
    } else {
        StorageError::Database(err.to_string())
    }
}

// ============================================================================
// SECTION: SQL
// ============================================================================

/// Statements for one keyed record table.
#[derive(Debug, Clone)]
struct RecordSql {
    /// Selects the value for a key.
    select: String,
    /// Inserts or replaces the value for a key.
    upsert: String,
    /// Deletes the row for a key.
    delete: String,
    /// Deletes every row.
    clear: String,
}

impl RecordSql {
    /// Renders statements for the text state table.
    fn text(table: &str, column: &str) -> Self {
        Self {
            select: format!(
                "SELECT {column} FROM \"{table}\" WHERE chat_id = $1 AND user_id = $2"
            ),
            upsert: format!(
                "INSERT INTO \"{table}\" (chat_id, user_id, {column}) VALUES ($1, $2, $3) ON \
                 CONFLICT (chat_id, user_id) DO UPDATE SET {column} = EXCLUDED.{column}"
            ),
            delete: format!("DELETE FROM \"{table}\" WHERE chat_id = $1 AND user_id = $2"),
            clear: format!("DELETE FROM \"{table}\""),
        }
    }

    /// Renders statements for a `JSONB` mapping table; values travel as text.
    fn json(table: &str, column: &str) -> Self {
        Self {
            select: format!(
                "SELECT {column}::TEXT FROM \"{table}\" WHERE chat_id = $1 AND user_id = $2"
            ),
            upsert: format!(
                "INSERT INTO \"{table}\" (chat_id, user_id, {column}) VALUES ($1, $2, \
                 $3::TEXT::JSONB) ON CONFLICT (chat_id, user_id) DO UPDATE SET {column} = \
                 EXCLUDED.{column}"
            ),
            delete: format!("DELETE FROM \"{table}\" WHERE chat_id = $1 AND user_id = $2"),
            clear: format!("DELETE FROM \"{table}\""),
        }
    }
}

/// Pre-rendered SQL for a validated set of table names.
#[derive(Debug, Clone)]
struct PostgresStatements {
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
    /// Server-side shallow merge into the data table.
    merge_data: String,
    /// Server-side shallow merge into the bucket table.
    merge_bucket: String,
}

impl PostgresStatements {
    /// Renders every statement for `tables`.
    fn new(tables: &TableNames) -> Self {
        let create = format!(
            "CREATE TABLE IF NOT EXISTS \"{state}\" (chat_id BIGINT NOT NULL, user_id BIGINT NOT \
             NULL, state TEXT NOT NULL, PRIMARY KEY (chat_id, user_id));CREATE TABLE IF NOT \
             EXISTS \"{data}\" (chat_id BIGINT NOT NULL, user_id BIGINT NOT NULL, data JSONB NOT \
             NULL, PRIMARY KEY (chat_id, user_id));CREATE TABLE IF NOT EXISTS \"{bucket}\" \
             (chat_id BIGINT NOT NULL, user_id BIGINT NOT NULL, bucket JSONB NOT NULL, PRIMARY \
             KEY (chat_id, user_id));",
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
            state: RecordSql::text(&tables.state, "state"),
            data: RecordSql::json(&tables.data, "data"),
            bucket: RecordSql::json(&tables.bucket, "bucket"),
            merge_data: merge_sql(&tables.data, "data"),
            merge_bucket: merge_sql(&tables.bucket, "bucket"),
        }
    }
}

/// Renders an upsert that merges top-level keys with the `JSONB` `||` operator.
fn merge_sql(table: &str, column: &str) -> String {
    format!(
        "INSERT INTO \"{table}\" (chat_id, user_id, {column}) VALUES ($1, $2, $3::TEXT::JSONB) \
         ON CONFLICT (chat_id, user_id) DO UPDATE SET {column} = \"{table}\".{column} || \
         EXCLUDED.{column}"
    )
}

/// Mapping record kinds persisted as `JSONB`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MapKind {
    /// Data mapping.
    Data,
    /// Bucket mapping.
    Bucket,
}

// ============================================================================
// SECTION: Store
// ============================================================================

/// Postgres-backed FSM storage.
///
/// The configured table names are assumed to belong to this storage alone.
/// Pointing it at tables created for another purpose is undefined behaviour.
///
/// Postgres `TEXT` and `JSONB` cannot hold NUL characters, so state names,
/// mapping keys, and string values containing `\0` are rejected with
/// [`StorageError::Invalid`] before reaching the server.
///
/// # Invariants
/// - After [`FsmStorage::close`] the pool slot is empty and every operation
///   fails with [`StorageError::Connection`].
pub struct PostgresFsmStorage {
    /// Connection pool; `None` once closed.
    pool: Mutex<Option<PgPool>>,
    /// SQL rendered for the configured table names.
    statements: PostgresStatements,
    /// Configured table names.
    tables: TableNames,
}

impl Drop for PostgresFsmStorage {
    fn drop(&mut self) {
        let slot = self.pool.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(pool) = slot.take() {
            let _ = std::thread::spawn(move || drop(pool));
        }
    }
}

impl PostgresFsmStorage {
    /// Connects to Postgres and ensures the FSM tables exist.
    ///
    /// # Errors
    ///
    /// Returns [`PostgresStorageError::Config`] for invalid parameters before
    /// any network access, [`PostgresStorageError::Connection`] when the pool
    /// cannot be established, and [`PostgresStorageError::Postgres`] when
    /// table creation fails.
    pub fn new(config: &PostgresStorageConfig) -> Result<Self, PostgresStorageError> {
        config.validate()?;
        let manager = PostgresConnectionManager::new(config.pg_config(), NoTls);
        let pool = Pool::builder()
            .max_size(config.max_connections)
            .connection_timeout(Duration::from_millis(config.connect_timeout_ms))
            .build(manager)
            .map_err(|err| PostgresStorageError::Connection(err.to_string()))?;
        let statements = PostgresStatements::new(&config.tables);
        let store = Self {
            pool: Mutex::new(Some(pool)),
            statements,
            tables: config.tables.clone(),
        };
        store.migrate()?;
        info!(
            host = %config.host,
            port = config.port,
            database = %config.database,
            "postgres fsm storage opened"
        );
        Ok(store)
    }

    /// Returns the configured table names.
    #[must_use]
    pub const fn tables(&self) -> &TableNames {
        &self.tables
    }

    /// Ensures the FSM tables exist.
    fn migrate(&self) -> Result<(), PostgresStorageError> {
        let mut conn = self.connection().map_err(|err| match err {
            StorageError::Connection(message) => PostgresStorageError::Connection(message),
            other => PostgresStorageError::Postgres(other.to_string()),
        })?;
        conn.batch_execute(&self.statements.create)
            .map_err(|err| PostgresStorageError::Postgres(err.to_string()))?;
        debug!(
            state = %self.tables.state,
            data = %self.tables.data,
            bucket = %self.tables.bucket,
            "postgres fsm tables ensured"
        );
        Ok(())
    }

    /// Returns a handle to the pool, failing once the storage is closed.
    fn pool(&self) -> Result<PgPool, StorageError> {
        let pool = self.pool.lock().map_err(|_| poisoned())?.clone();
        pool.ok_or_else(|| {
            warn!("postgres fsm storage used after close");
            StorageError::Connection("postgres storage closed".to_string())
        })
    }

    /// Checks a connection out of the pool.
    fn connection(&self) -> Result<PgConnection, StorageError> {
        self.pool()?.get().map_err(|err| StorageError::Connection(err.to_string()))
    }

    /// Returns the record statements for a mapping kind.
    const fn map_sql(&self, kind: MapKind) -> &RecordSql {
        match kind {
            MapKind::Data => &self.statements.data,
            MapKind::Bucket => &self.statements.bucket,
        }
    }

    /// Reads a mapping record for `key`.
    fn read_map(&self, kind: MapKind, key: StorageKey) -> Result<DataMap, StorageError> {
        let mut conn = self.connection()?;
        let row = conn
            .query_opt(self.map_sql(kind).select.as_str(), &[&key.chat.get(), &key.user.get()])
            .map_err(|err| pg_err(&err))?;
        let Some(row) = row else {
            return Ok(DataMap::new());
        };
        let payload: String = row.try_get(0).map_err(|err| pg_err(&err))?;
        parse_data_map(&payload)
    }

    /// Replaces a mapping record for `key`; an empty mapping deletes it.
    fn write_map(&self, kind: MapKind, key: StorageKey, value: &DataMap) -> Result<(), StorageError> {
        let sql = self.map_sql(kind);
        let mut conn = self.connection()?;
        if value.is_empty() {
            conn.execute(sql.delete.as_str(), &[&key.chat.get(), &key.user.get()])
                .map_err(|err| pg_err(&err))?;
            return Ok(());
        }
        let payload = encode_map(value)?;
        conn.execute(sql.upsert.as_str(), &[&key.chat.get(), &key.user.get(), &payload])
            .map_err(|err| pg_err(&err))?;
        Ok(())
    }

    /// Merges `patch` into a mapping record with a single upsert statement.
    fn merge_map(&self, kind: MapKind, key: StorageKey, patch: &DataMap) -> Result<(), StorageError> {
        let pool = self.pool()?;
        if patch.is_empty() {
            return Ok(());
        }
        let sql = match kind {
            MapKind::Data => &self.statements.merge_data,
            MapKind::Bucket => &self.statements.merge_bucket,
        };
        let payload = encode_map(patch)?;
        let mut conn = pool.get().map_err(|err| StorageError::Connection(err.to_string()))?;
        conn.execute(sql.as_str(), &[&key.chat.get(), &key.user.get(), &payload])
            .map_err(|err| pg_err(&err))?;
        Ok(())
    }
}

impl FsmStorage for PostgresFsmStorage {
    fn get_state(&self, key: StorageKey) -> Result<Option<StateName>, StorageError> {
        let mut conn = self.connection()?;
        let row = conn
            .query_opt(self.statements.state.select.as_str(), &[&key.chat.get(), &key.user.get()])
            .map_err(|err| pg_err(&err))?;
        let Some(row) = row else {
            return Ok(None);
        };
        let state: String = row.try_get(0).map_err(|err| pg_err(&err))?;
        Ok(Some(StateName::new(state)))
    }

    fn set_state(&self, key: StorageKey, state: Option<&StateName>) -> Result<(), StorageError> {
        let sql = &self.statements.state;
        let mut conn = self.connection()?;
        if let Some(state) = state
            && state.as_str().contains('\0')
        {
            return Err(StorageError::Invalid("state name contains a NUL character".to_string()));
        }
        let result = match state {
            Some(state) => conn.execute(
                sql.upsert.as_str(),
                &[&key.chat.get(), &key.user.get(), &state.as_str()],
            ),
            None => conn.execute(sql.delete.as_str(), &[&key.chat.get(), &key.user.get()]),
        };
        result.map_err(|err| pg_err(&err))?;
        Ok(())
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
        let mut conn = self.connection()?;
        let rows = conn
            .query(self.statements.list_states.as_str(), &[])
            .map_err(|err| pg_err(&err))?;
        let mut keys = Vec::with_capacity(rows.len());
        for row in rows {
            let chat: i64 = row.try_get(0).map_err(|err| pg_err(&err))?;
            let user: i64 = row.try_get(1).map_err(|err| pg_err(&err))?;
            keys.push(StorageKey::from_raw(chat, user));
        }
        Ok(keys)
    }

    fn reset_all(&self, full: bool) -> Result<(), StorageError> {
        let mut conn = self.connection()?;
        let mut tx = conn.transaction().map_err(|err| pg_err(&err))?;
        tx.execute(self.statements.state.clear.as_str(), &[]).map_err(|err| pg_err(&err))?;
        if full {
            tx.execute(self.statements.data.clear.as_str(), &[]).map_err(|err| pg_err(&err))?;
            tx.execute(self.statements.bucket.clear.as_str(), &[]).map_err(|err| pg_err(&err))?;
        }
        tx.commit().map_err(|err| pg_err(&err))?;
        info!(full, "postgres fsm storage reset");
        Ok(())
    }

    fn readiness(&self) -> Result<(), StorageError> {
        let mut conn = self.connection()?;
        conn.batch_execute("SELECT 1").map_err(|err| pg_err(&err))
    }

    fn close(&self) -> Result<(), StorageError> {
        let pool = self.pool.lock().map_err(|_| poisoned())?.take();
        let Some(pool) = pool else {
            return Ok(());
        };
        std::thread::spawn(move || drop(pool))
            .join()
            .map_err(|_| StorageError::Connection("postgres pool release panicked".to_string()))?;
        debug!("postgres fsm storage closed");
        Ok(())
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Encodes a mapping as JSON text for a `JSONB` cast.
fn encode_map(value: &DataMap) -> Result<String, StorageError> {
    if map_has_nul(value) {
        return Err(StorageError::Invalid(
            "mapping contains a NUL character, which JSONB cannot store".to_string(),
        ));
    }
    serde_json::to_string(value).map_err(|err| StorageError::Invalid(err.to_string()))
}

/// Reports whether any key or string value in `map` contains `\0`.
fn map_has_nul(map: &DataMap) -> bool {
    map.iter().any(|(key, value)| key.contains('\0') || value_has_nul(value))
}

/// Reports whether a JSON value contains a string with `\0`.
fn value_has_nul(value: &Value) -> bool {
    match value {
        Value::String(text) => text.contains('\0'),
        Value::Array(items) => items.iter().any(value_has_nul),
        Value::Object(map) => map_has_nul(map),
        Value::Null | Value::Bool(_) | Value::Number(_) => false,
    }
}

/// Error reported when the pool mutex was poisoned by a panicking thread.
fn poisoned() -> StorageError {
    StorageError::Connection("postgres pool mutex poisoned".to_string())
}

/// Builds a shared FSM storage wrapper for Postgres.
///
/// # Errors
///
/// Returns [`PostgresStorageError`] when initialization fails.
pub fn shared_postgres_storage(
    config: &PostgresStorageConfig,
) -> Result<SharedFsmStorage, PostgresStorageError> {
    Ok(SharedFsmStorage::from_storage(PostgresFsmStorage::new(config)?))
}

#[cfg(test)]
mod tests;
