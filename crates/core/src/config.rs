//! Toolkit configuration
//!
//! Configuration is read from a YAML file (`tidemark.yaml` by default),
//! overridden by environment variables and validated before use. A missing
//! file is not an error: every section has a default.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{ConfigError, ConfigResult};

/// Default location of the configuration file
pub const DEFAULT_CONFIG_PATH: &str = "tidemark.yaml";

/// Environment variable that turns lock retries off for a run
pub const DISABLE_LOCK_RETRIES_ENV: &str = "DISABLE_LOCK_RETRIES";

/// Environment variable overriding the SQL migrations directory
pub const MIGRATIONS_DIR_ENV: &str = "TIDEMARK_MIGRATIONS_DIR";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TidemarkConfig {
    pub database: DatabaseConfig,
    pub migrations: MigrationsConfig,
    pub lock_retries: LockRetriesConfig,
    pub batching: BatchingConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Explicit connection URL; takes precedence over `url_env`
    pub url: Option<String>,
    /// Name of the environment variable holding the connection URL
    pub url_env: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            url_env: "DATABASE_URL".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationsConfig {
    /// Directory holding `<version>_<name>.sql` files
    pub dir: PathBuf,
    /// Ledger table name
    pub table: String,
    /// Take a session advisory lock while migrating (PostgreSQL only)
    pub advisory_lock: bool,
    /// Schemas this database serves. Restricted migrations targeting any
    /// other schema are recorded without running. Empty means all.
    pub allowed_schemas: Vec<String>,
}

impl Default for MigrationsConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("db/migrate"),
            table: "schema_migrations".to_string(),
            advisory_lock: true,
            allowed_schemas: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockRetriesConfig {
    pub enabled: bool,
    /// Fail instead of making a last attempt without `lock_timeout`
    pub raise_on_exhaustion: bool,
    /// Custom schedule; empty selects the built-in one
    pub timing: Vec<TimingStep>,
}

impl Default for LockRetriesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            raise_on_exhaustion: false,
            timing: Vec::new(),
        }
    }
}

/// One lock-retry attempt: how long to wait for the lock, and how long to
/// sleep after a lock timeout before the next attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingStep {
    pub lock_timeout_ms: u64,
    pub sleep_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingConfig {
    /// Upper bound for automatically sized update batches
    pub max_batch_size: usize,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            _ => Err(ConfigError::InvalidValue {
                field: "logging.format".to_string(),
                value: s.to_string(),
                expected: "pretty, compact, or json".to_string(),
            }),
        }
    }
}

impl TidemarkConfig {
    /// Load the configuration file, apply environment overrides and validate.
    ///
    /// A missing file yields the defaults.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Self::from_yaml_str(&content)?
        } else {
            tracing::debug!(path = %path.display(), "configuration file not found, using defaults");
            Self::default()
        };

        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(content: &str) -> ConfigResult<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Apply environment variable overrides on top of file values
    pub fn apply_env(&mut self) -> ConfigResult<()> {
        if let Some(value) = get_env_optional(DISABLE_LOCK_RETRIES_ENV) {
            if parse_bool(DISABLE_LOCK_RETRIES_ENV, &value)? {
                self.lock_retries.enabled = false;
            }
        }

        if let Some(dir) = get_env_optional(MIGRATIONS_DIR_ENV) {
            self.migrations.dir = PathBuf::from(dir);
        }

        if let Some(level) = get_env_optional("LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Some(format) = get_env_optional("LOG_FORMAT") {
            self.logging.format = LogFormat::from_str(&format)?;
        }

        Ok(())
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if !is_valid_identifier(&self.migrations.table) {
            return Err(ConfigError::validation(
                "migrations.table",
                format!("'{}' is not a valid table name", self.migrations.table),
            ));
        }

        if self.database.url.is_none() && self.database.url_env.trim().is_empty() {
            return Err(ConfigError::validation(
                "database.url_env",
                "either database.url or database.url_env must be set",
            ));
        }

        if self.batching.max_batch_size == 0 {
            return Err(ConfigError::validation(
                "batching.max_batch_size",
                "must be greater than zero",
            ));
        }

        if self
            .lock_retries
            .timing
            .iter()
            .any(|step| step.lock_timeout_ms == 0)
        {
            return Err(ConfigError::validation(
                "lock_retries.timing",
                "lock_timeout_ms must be greater than zero for every step",
            ));
        }

        Ok(())
    }

    /// Resolve the database URL from the file or the configured variable
    pub fn database_url(&self) -> ConfigResult<String> {
        if let Some(url) = &self.database.url {
            return Ok(url.clone());
        }
        get_env_required(&self.database.url_env)
    }
}

/// Accepts `name` or `schema.name` made of ASCII letters, digits and
/// underscores, not starting with a digit.
pub fn is_valid_identifier(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() > 2 {
        return false;
    }

    parts.iter().all(|part| {
        let mut chars = part.chars();
        match chars.next() {
            Some(first) if first.is_ascii_alphabetic() || first == '_' => {
                chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
            }
            _ => false,
        }
    })
}

fn parse_bool(field: &str, value: &str) -> ConfigResult<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "t" | "y" => Ok(true),
        "0" | "false" | "no" | "off" | "f" | "n" | "" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            field: field.to_string(),
            value: value.to_string(),
            expected: "a boolean".to_string(),
        }),
    }
}

fn get_env_required(key: &str) -> ConfigResult<String> {
    env::var(key).map_err(|_| ConfigError::MissingEnvVar {
        var: key.to_string(),
    })
}

fn get_env_optional(key: &str) -> Option<String> {
    env::var(key).ok()
}
