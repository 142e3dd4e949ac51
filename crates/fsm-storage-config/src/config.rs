// crates/fsm-storage-config/src/config.rs
// ============================================================================
// Module: FSM Storage Configuration
// Description: TOML configuration loading and backend selection.
// Purpose: Provide strict, fail-closed config parsing with hard limits.
// Dependencies: fsm-storage-core, fsm-storage-postgres, fsm-storage-sqlite, serde, toml
// ============================================================================

//! ## Overview
//! Configuration is loaded from a TOML file with strict size and path limits
//! and names exactly one storage backend:
//!
//! ```toml
//! [storage]
//! backend = "sqlite"
//!
//! [storage.sqlite]
//! path = "fsm.db"
//! ```
//!
//! The Postgres password may be taken from an environment variable through
//! `password_env`, which is resolved once at load time. Missing or invalid
//! configuration fails closed.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

use fsm_storage_core::SharedFsmStorage;
use fsm_storage_core::StorageError;
use fsm_storage_postgres::PostgresStorageConfig;
use fsm_storage_postgres::shared_postgres_storage;
use fsm_storage_sqlite::SqliteFsmStorage;
use fsm_storage_sqlite::SqliteStorageConfig;
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Default configuration filename when no path is specified.
const DEFAULT_CONFIG_NAME: &str = "fsm-storage.toml";
/// Environment variable used to override the config path.
pub const CONFIG_ENV_VAR: &str = "FSM_STORAGE_CONFIG";
/// Maximum configuration file size in bytes.
const MAX_CONFIG_FILE_SIZE: usize = 1024 * 1024;
/// Maximum length of a single path component.
const MAX_PATH_COMPONENT_LENGTH: usize = 255;
/// Maximum total path length.
const MAX_TOTAL_PATH_LENGTH: usize = 4096;
/// Maximum length of an environment variable name in `password_env`.
const MAX_ENV_NAME_LENGTH: usize = 255;

// ============================================================================
// SECTION: Config
// ============================================================================

/// Top-level FSM storage configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FsmStorageConfig {
    /// Storage backend selection.
    pub storage: StorageSection,
}

/// Supported storage backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// Embedded `SQLite` file.
    Sqlite,
    /// `PostgreSQL` server.
    Postgres,
}

impl StorageBackend {
    /// Returns the configuration spelling of the backend.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Postgres => "postgres",
        }
    }
}

impl fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `[storage]` section.
///
/// # Invariants
/// - After validation the section for `backend` is present.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageSection {
    /// Selected backend.
    pub backend: StorageBackend,
    /// `SQLite` settings, required when `backend = "sqlite"`.
    #[serde(default)]
    pub sqlite: Option<SqliteStorageConfig>,
    /// Postgres settings, required when `backend = "postgres"`.
    #[serde(default)]
    pub postgres: Option<PostgresStorageConfig>,
}

impl FsmStorageConfig {
    /// Loads configuration from disk using the default resolution rules.
    ///
    /// The path is `path` when given, else `FSM_STORAGE_CONFIG`, else
    /// `fsm-storage.toml` in the working directory.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when loading or validation fails.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let resolved = resolve_path(path)?;
        validate_path(&resolved)?;
        let bytes = fs::read(&resolved).map_err(|err| ConfigError::Io(err.to_string()))?;
        if bytes.len() > MAX_CONFIG_FILE_SIZE {
            return Err(ConfigError::Invalid("config file exceeds size limit".to_string()));
        }
        let content = std::str::from_utf8(&bytes)
            .map_err(|_| ConfigError::Invalid("config file must be utf-8".to_string()))?;
        Self::from_toml(content, |name| env::var(name).ok())
    }

    /// Parses and validates configuration from TOML text.
    ///
    /// `lookup` resolves `password_env` names to values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when parsing, secret resolution, or
    /// validation fails.
    pub fn from_toml(
        content: &str,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut config: Self =
            toml::from_str(content).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.resolve_secrets(lookup)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration for internal consistency.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when configuration is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.storage.backend {
            StorageBackend::Sqlite => {
                let Some(sqlite) = &self.storage.sqlite else {
                    return Err(ConfigError::Invalid(
                        "storage.sqlite is required when backend = \"sqlite\"".to_string(),
                    ));
                };
                validate_path_string("storage.sqlite.path", &sqlite.path.to_string_lossy())?;
                sqlite.tables.validate().map_err(invalid_storage)?;
            }
            StorageBackend::Postgres => {
                let Some(postgres) = &self.storage.postgres else {
                    return Err(ConfigError::Invalid(
                        "storage.postgres is required when backend = \"postgres\"".to_string(),
                    ));
                };
                postgres
                    .validate()
                    .map_err(|err| ConfigError::Invalid(err.to_string()))?;
            }
        }
        Ok(())
    }

    /// Opens the configured backend as a shared storage handle.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the selected section is
    /// missing and [`ConfigError::Storage`] when the adapter fails to open.
    pub fn open(&self) -> Result<SharedFsmStorage, ConfigError> {
        self.validate()?;
        let backend = self.storage.backend;
        info!(backend = %backend, "opening fsm storage");
        let storage = match backend {
            StorageBackend::Sqlite => {
                let sqlite = self.storage.sqlite.clone().ok_or_else(|| {
                    ConfigError::Invalid("storage.sqlite is missing".to_string())
                })?;
                let store = SqliteFsmStorage::new(sqlite).map_err(StorageError::from)?;
                SharedFsmStorage::from_storage(store)
            }
            StorageBackend::Postgres => {
                let postgres = self.storage.postgres.as_ref().ok_or_else(|| {
                    ConfigError::Invalid("storage.postgres is missing".to_string())
                })?;
                shared_postgres_storage(postgres).map_err(StorageError::from)?
            }
        };
        Ok(storage)
    }

    /// Replaces the Postgres password with the value named by `password_env`.
    fn resolve_secrets(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let Some(postgres) = self.storage.postgres.as_mut() else {
            return Ok(());
        };
        let Some(name) = postgres.password_env.as_deref() else {
            return Ok(());
        };
        let name = name.trim();
        if name.is_empty() || name.len() > MAX_ENV_NAME_LENGTH {
            return Err(ConfigError::Invalid(
                "storage.postgres.password_env must be a non-empty variable name".to_string(),
            ));
        }
        if postgres.password.is_some() {
            return Err(ConfigError::Invalid(
                "storage.postgres sets both password and password_env".to_string(),
            ));
        }
        let Some(password) = lookup(name) else {
            return Err(ConfigError::Invalid(format!(
                "storage.postgres.password_env names unset variable {name}"
            )));
        };
        postgres.password = Some(password);
        Ok(())
    }
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O failure while reading configuration.
    #[error("config io error: {0}")]
    Io(String),
    /// TOML parsing error.
    #[error("config parse error: {0}")]
    Parse(String),
    /// Invalid configuration data.
    #[error("invalid config: {0}")]
    Invalid(String),
    /// Configured backend failed to open.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Maps a storage validation error into an invalid-config error.
fn invalid_storage(error: StorageError) -> ConfigError {
    match error {
        StorageError::Config(message) => ConfigError::Invalid(message),
        other => ConfigError::Storage(other),
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Resolves the config path from the caller or environment defaults.
fn resolve_path(path: Option<&Path>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = path {
        return Ok(path.to_path_buf());
    }
    if let Ok(env_path) = env::var(CONFIG_ENV_VAR) {
        if env_path.len() > MAX_TOTAL_PATH_LENGTH {
            return Err(ConfigError::Invalid("config path exceeds max length".to_string()));
        }
        return Ok(PathBuf::from(env_path));
    }
    Ok(PathBuf::from(DEFAULT_CONFIG_NAME))
}

/// Validates the resolved path against length limits.
fn validate_path(path: &Path) -> Result<(), ConfigError> {
    let text = path.to_string_lossy();
    if text.len() > MAX_TOTAL_PATH_LENGTH {
        return Err(ConfigError::Invalid("config path exceeds max length".to_string()));
    }
    for component in path.components() {
        if component.as_os_str().len() > MAX_PATH_COMPONENT_LENGTH {
            return Err(ConfigError::Invalid("config path component too long".to_string()));
        }
    }
    Ok(())
}

/// Validates a configured path string against length constraints.
fn validate_path_string(field: &str, value: &str) -> Result<(), ConfigError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::Invalid(format!("{field} must be non-empty")));
    }
    if trimmed.len() > MAX_TOTAL_PATH_LENGTH {
        return Err(ConfigError::Invalid(format!("{field} exceeds max length")));
    }
    for component in Path::new(trimmed).components() {
        if component.as_os_str().len() > MAX_PATH_COMPONENT_LENGTH {
            return Err(ConfigError::Invalid(format!("{field} path component too long")));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::panic, reason = "Unit tests panic on unexpected shapes.")]

    use super::ConfigError;
    use super::FsmStorageConfig;
    use super::validate_path_string;

    const POSTGRES_TOML: &str = r#"
[storage]
backend = "postgres"

[storage.postgres]
username = "bot"
database = "fsm"
password_env = "FSM_PG_PASSWORD"
"#;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn password_env_is_resolved_through_lookup() {
        let config = FsmStorageConfig::from_toml(POSTGRES_TOML, |name| {
            (name == "FSM_PG_PASSWORD").then(|| "s3cret".to_string())
        });
        let Ok(config) = config else {
            panic!("config should load");
        };
        let Some(postgres) = config.storage.postgres else {
            panic!("postgres section missing");
        };
        assert_eq!(postgres.password.as_deref(), Some("s3cret"));
    }

    #[test]
    fn unset_password_env_is_rejected() {
        let result = FsmStorageConfig::from_toml(POSTGRES_TOML, no_env);
        assert!(matches!(result, Err(ConfigError::Invalid(message)) if message.contains("unset")));
    }

    #[test]
    fn password_and_password_env_conflict() {
        let content =
            POSTGRES_TOML.replace("database = \"fsm\"", "database = \"fsm\"\npassword = \"x\"");
        let result = FsmStorageConfig::from_toml(&content, |_| Some("y".to_string()));
        assert!(matches!(result, Err(ConfigError::Invalid(message)) if message.contains("both")));
    }

    #[test]
    fn missing_password_is_rejected() {
        let content = POSTGRES_TOML.replace("password_env = \"FSM_PG_PASSWORD\"\n", "");
        let Err(ConfigError::Invalid(message)) = FsmStorageConfig::from_toml(&content, no_env) else {
            panic!("missing password should be invalid");
        };
        assert!(message.contains("password is required"));
    }

    #[test]
    fn validate_path_string_rejects_empty_and_long_components() {
        assert!(validate_path_string("storage.sqlite.path", "  ").is_err());
        let long = format!("./{}", "a".repeat(256));
        let Err(err) = validate_path_string("storage.sqlite.path", &long) else {
            panic!("long component should fail");
        };
        assert!(err.to_string().contains("component too long"));
        assert!(validate_path_string("storage.sqlite.path", "data/fsm.db").is_ok());
    }
}
