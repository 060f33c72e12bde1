//! `modelbox.json`: which database to use and how strictly the store checks writes.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use modelbox_meta_core::{MetaError, MetaResult};

pub const CONFIG_FILE_NAME: &str = "modelbox.json";
pub const DEFAULT_SQLITE_NAME: &str = "modelbox.sqlite";

/// Widest text accepted for key-like columns (names, namespaces, parent ids, checksums).
pub const MAX_KEY_CHARS: usize = 255;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum DatabaseConfig {
    Sqlite { path: Option<String> },
    Postgres { url: String },
    Mysql { url: String },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoolConfig {
    pub max_connections: Option<u32>,
    pub min_connections: Option<u32>,
    pub connect_timeout_ms: Option<u64>,
    pub acquire_timeout_ms: Option<u64>,
    pub idle_timeout_ms: Option<u64>,
}

/// Per-request size caps. Unset fields fall back to [`StoreLimits::default`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LimitsConfig {
    pub max_value_bytes: Option<usize>,
    pub max_payload_bytes: Option<usize>,
    pub max_files_per_write: Option<usize>,
    pub max_metadata_keys: Option<usize>,
}

impl LimitsConfig {
    pub fn with_defaults() -> Self {
        let defaults = StoreLimits::default();
        Self {
            max_value_bytes: Some(defaults.max_value_bytes),
            max_payload_bytes: Some(defaults.max_payload_bytes),
            max_files_per_write: Some(defaults.max_files_per_write),
            max_metadata_keys: Some(defaults.max_metadata_keys),
        }
    }

    pub fn resolve(&self) -> StoreLimits {
        let defaults = StoreLimits::default();
        StoreLimits {
            max_value_bytes: self.max_value_bytes.unwrap_or(defaults.max_value_bytes),
            max_payload_bytes: self.max_payload_bytes.unwrap_or(defaults.max_payload_bytes),
            max_files_per_write: self
                .max_files_per_write
                .unwrap_or(defaults.max_files_per_write),
            max_metadata_keys: self.max_metadata_keys.unwrap_or(defaults.max_metadata_keys),
        }
    }
}

/// Limits the store enforces, after defaults are applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StoreLimits {
    /// Encoded size of one metadata value.
    pub max_value_bytes: usize,
    /// Encoded size of one change-feed payload.
    pub max_payload_bytes: usize,
    pub max_files_per_write: usize,
    pub max_metadata_keys: usize,
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self {
            max_value_bytes: 65_536,
            max_payload_bytes: 1_048_576,
            max_files_per_write: 1_000,
            max_metadata_keys: 1_000,
        }
    }
}

/// How a write that references an unknown parent is treated.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ValidationMode {
    Off,
    #[default]
    Warn,
    Error,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetaConfig {
    pub database: DatabaseConfig,
    pub pool: Option<PoolConfig>,
    pub limits: Option<LimitsConfig>,
    pub validation_mode: Option<ValidationMode>,
    pub failpoints: Option<Vec<String>>,
}

impl MetaConfig {
    pub fn default_sqlite(path: impl Into<String>) -> Self {
        Self {
            database: DatabaseConfig::Sqlite {
                path: Some(path.into()),
            },
            pool: None,
            limits: Some(LimitsConfig::with_defaults()),
            validation_mode: Some(ValidationMode::Warn),
            failpoints: None,
        }
    }

    pub fn with_validation_mode(mut self, mode: ValidationMode) -> Self {
        self.validation_mode = Some(mode);
        self
    }

    /// Reads `modelbox.json` from `base_dir`, writing a SQLite default there first if absent.
    pub fn load_or_init(base_dir: &Path) -> MetaResult<Self> {
        fs::create_dir_all(base_dir)
            .map_err(|err| MetaError::unavailable(format!("create config dir: {err}")))?;
        let config_path = base_dir.join(CONFIG_FILE_NAME);
        if config_path.exists() {
            let raw = fs::read_to_string(&config_path)
                .map_err(|err| MetaError::unavailable(format!("read config: {err}")))?;
            let config: MetaConfig = serde_json::from_str(&raw)
                .map_err(|err| MetaError::invalid(format!("{CONFIG_FILE_NAME}: {err}")))?;
            config.validate()?;
            return Ok(config);
        }
        let default = MetaConfig::default_sqlite(DEFAULT_SQLITE_NAME);
        let payload = serde_json::to_string_pretty(&default)
            .map_err(|err| MetaError::invalid(format!("serialize config: {err}")))?;
        fs::write(&config_path, payload)
            .map_err(|err| MetaError::unavailable(format!("write config: {err}")))?;
        log::info!("wrote default config to {}", config_path.display());
        Ok(default)
    }

    pub fn default_sqlite_path(base_dir: &Path) -> PathBuf {
        base_dir.join(DEFAULT_SQLITE_NAME)
    }

    /// Rejects settings the store could only fail on later.
    pub fn validate(&self) -> MetaResult<()> {
        match &self.database {
            DatabaseConfig::Sqlite { path: Some(path) } if path.trim().is_empty() => {
                return Err(MetaError::invalid("sqlite path is empty"));
            }
            DatabaseConfig::Postgres { url } if !url.starts_with("postgres") => {
                return Err(MetaError::invalid(format!("'{url}' is not a postgres url")));
            }
            DatabaseConfig::Mysql { url } if !url.starts_with("mysql://") => {
                return Err(MetaError::invalid(format!("'{url}' is not a mysql url")));
            }
            _ => {}
        }
        let limits = self.store_limits();
        for (name, value) in [
            ("max_value_bytes", limits.max_value_bytes),
            ("max_payload_bytes", limits.max_payload_bytes),
            ("max_files_per_write", limits.max_files_per_write),
            ("max_metadata_keys", limits.max_metadata_keys),
        ] {
            if value == 0 {
                return Err(MetaError::invalid(format!("limits.{name} must be positive")));
            }
        }
        let bounds = self
            .pool
            .as_ref()
            .map(|pool| (pool.min_connections, pool.max_connections));
        if let Some((Some(min), Some(max))) = bounds {
            if min > max {
                return Err(MetaError::invalid(format!(
                    "pool.min_connections {min} exceeds max_connections {max}"
                )));
            }
        }
        Ok(())
    }

    pub fn store_limits(&self) -> StoreLimits {
        self.limits
            .as_ref()
            .map(LimitsConfig::resolve)
            .unwrap_or_default()
    }

    pub fn validation_mode(&self) -> ValidationMode {
        self.validation_mode.unwrap_or_default()
    }

    pub fn sqlite_path(&self, base_dir: &Path) -> MetaResult<PathBuf> {
        match &self.database {
            DatabaseConfig::Sqlite { path } => {
                let candidate = path
                    .as_deref()
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_SQLITE_NAME));
                if candidate.is_absolute() {
                    Ok(candidate)
                } else {
                    Ok(base_dir.join(candidate))
                }
            }
            _ => Err(MetaError::invalid("config is not sqlite backend")),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        match self.database {
            DatabaseConfig::Sqlite { .. } => "sqlite",
            DatabaseConfig::Postgres { .. } => "postgres",
            DatabaseConfig::Mysql { .. } => "mysql",
        }
    }

    pub fn connection_url(&self, base_dir: &Path) -> MetaResult<String> {
        match &self.database {
            DatabaseConfig::Sqlite { .. } => {
                let path = self.sqlite_path(base_dir)?;
                Ok(format!("sqlite://{}?mode=rwc", path.display()))
            }
            DatabaseConfig::Postgres { url } | DatabaseConfig::Mysql { url } => Ok(url.clone()),
        }
    }
}
