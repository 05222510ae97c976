//! Tenancy configuration
//!
//! Read once at startup: a TOML or JSON file (chosen by extension), then
//! `BIZHUB_*` environment variables on top, then validation. A `.env` file
//! in the working directory is loaded first when present.
//!
//! ```toml
//! [database]
//! server = "sql.internal"
//! port = 1433
//! name_pattern = "TenantDB_{code}"
//!
//! [backup]
//! root = "/var/backups/tenants"
//!
//! [resolver]
//! sliding_expiration_minutes = 30
//! ```
//!
//! The encryption key is never part of this file; see
//! [`crate::AesGcmSecretProvider::from_env`].

use crate::cache::ResolverCache;
use crate::clock::Clock;
use crate::code::TenantCode;
use crate::context::DEFAULT_TENANT_HEADER;
use crate::database::database_name;
use crate::database_info::{
    COMMAND_TIMEOUT_RANGE, COMPATIBILITY_LEVELS, CONNECT_TIMEOUT_RANGE, RecoveryModel,
    is_valid_database_name, is_valid_server,
};
use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "BIZHUB_";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(String),

    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid environment variable {key}: {message}")]
    Env { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Database server defaults applied to every tenant database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub server: String,
    pub port: u16,
    pub connect_timeout_secs: u32,
    pub command_timeout_secs: u32,
    /// Directory for data files; engine default when unset
    pub data_path: Option<PathBuf>,
    /// Directory for log files; engine default when unset
    pub log_path: Option<PathBuf>,
    pub collation: String,
    pub recovery_model: RecoveryModel,
    pub compatibility_level: u16,
    pub encrypt: bool,
    pub trust_server_certificate: bool,
    pub application_name: String,
    /// Physical name pattern; `{code}` and `{id}` are substituted
    pub name_pattern: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            server: "localhost".to_string(),
            port: 1433,
            connect_timeout_secs: 30,
            command_timeout_secs: 30,
            data_path: None,
            log_path: None,
            collation: "SQL_Latin1_General_CP1_CI_AS".to_string(),
            recovery_model: RecoveryModel::Simple,
            compatibility_level: 150,
            encrypt: true,
            trust_server_certificate: false,
            application_name: "bizhub".to_string(),
            name_pattern: "TenantDB_{code}".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Backups are written to `{root}/{tenant code}/`
    pub root: PathBuf,
    pub compression: bool,
    pub checksum: bool,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("backups"),
            compression: true,
            checksum: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub sliding_expiration_minutes: i64,
    pub cache_capacity: usize,
    pub tenant_header: String,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            sliding_expiration_minutes: ResolverCache::DEFAULT_EXPIRATION_MINUTES,
            cache_capacity: ResolverCache::DEFAULT_CAPACITY,
            tenant_header: DEFAULT_TENANT_HEADER.to_string(),
        }
    }
}

impl ResolverConfig {
    /// Cache configured from this section.
    pub fn build_cache(&self, clock: Arc<dyn Clock>) -> ResolverCache {
        ResolverCache::new(clock)
            .with_sliding_expiration(TimeDelta::minutes(self.sliding_expiration_minutes))
            .with_capacity(self.cache_capacity)
    }
}

/// Tenancy configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TenancyConfig {
    pub database: DatabaseConfig,
    pub backup: BackupConfig,
    pub resolver: ResolverConfig,
}

impl TenancyConfig {
    /// Load `path`, apply `.env` and process environment overrides, validate.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Load(format!("{}: {e}", path.display())))?;

        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .ok_or_else(|| ConfigError::Load("No file extension found".to_string()))?;
        let mut config = match ext.to_ascii_lowercase().as_str() {
            "toml" => Self::from_toml(&content)?,
            "json" => Self::from_json(&content)?,
            other => return Err(ConfigError::Load(format!("Unsupported format: {other}"))),
        };

        config.apply_process_env()?;
        config.validate()?;
        debug!(path = %path.display(), "Tenancy configuration loaded");
        Ok(config)
    }

    /// Defaults plus environment overrides, for deployments without a file.
    pub fn from_env() -> ConfigResult<Self> {
        let mut config = Self::default();
        config.apply_process_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> ConfigResult<Self> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(format!("TOML parse error: {e}")))
    }

    pub fn from_json(content: &str) -> ConfigResult<Self> {
        serde_json::from_str(content)
            .map_err(|e| ConfigError::Parse(format!("JSON parse error: {e}")))
    }

    fn apply_process_env(&mut self) -> ConfigResult<()> {
        // A missing .env file is normal.
        let _ = dotenvy::dotenv();
        self.apply_overrides(std::env::vars())
    }

    /// Apply `BIZHUB_*` overrides from `vars`. Unknown keys are ignored.
    pub fn apply_overrides<I, K, V>(&mut self, vars: I) -> ConfigResult<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let Some(name) = key.as_ref().strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let value = value.as_ref();
            let db = &mut self.database;
            match name {
                "DATABASE_SERVER" => db.server = value.to_string(),
                "DATABASE_PORT" => db.port = parse_var(name, value)?,
                "DATABASE_CONNECT_TIMEOUT_SECS" => db.connect_timeout_secs = parse_var(name, value)?,
                "DATABASE_COMMAND_TIMEOUT_SECS" => db.command_timeout_secs = parse_var(name, value)?,
                "DATABASE_DATA_PATH" => db.data_path = Some(PathBuf::from(value)),
                "DATABASE_LOG_PATH" => db.log_path = Some(PathBuf::from(value)),
                "DATABASE_COLLATION" => db.collation = value.to_string(),
                "DATABASE_RECOVERY_MODEL" => db.recovery_model = parse_var(name, value)?,
                "DATABASE_COMPATIBILITY_LEVEL" => db.compatibility_level = parse_var(name, value)?,
                "DATABASE_ENCRYPT" => db.encrypt = parse_var(name, value)?,
                "DATABASE_TRUST_SERVER_CERTIFICATE" => {
                    db.trust_server_certificate = parse_var(name, value)?
                }
                "DATABASE_APPLICATION_NAME" => db.application_name = value.to_string(),
                "DATABASE_NAME_PATTERN" => db.name_pattern = value.to_string(),
                "BACKUP_ROOT" => self.backup.root = PathBuf::from(value),
                "BACKUP_COMPRESSION" => self.backup.compression = parse_var(name, value)?,
                "BACKUP_CHECKSUM" => self.backup.checksum = parse_var(name, value)?,
                "RESOLVER_SLIDING_EXPIRATION_MINUTES" => {
                    self.resolver.sliding_expiration_minutes = parse_var(name, value)?
                }
                "RESOLVER_CACHE_CAPACITY" => self.resolver.cache_capacity = parse_var(name, value)?,
                "RESOLVER_TENANT_HEADER" => self.resolver.tenant_header = value.to_string(),
                _ => continue,
            }
            debug!(key = name, "Configuration overridden from environment");
        }
        Ok(())
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let db = &self.database;
        if !is_valid_server(&db.server) {
            return Err(invalid(format!("database.server '{}' is not a valid host", db.server)));
        }
        if db.port == 0 {
            return Err(invalid("database.port must be between 1 and 65535"));
        }
        if !CONNECT_TIMEOUT_RANGE.contains(&db.connect_timeout_secs) {
            return Err(invalid(format!(
                "database.connect_timeout_secs must be within {CONNECT_TIMEOUT_RANGE:?}"
            )));
        }
        if !COMMAND_TIMEOUT_RANGE.contains(&db.command_timeout_secs) {
            return Err(invalid(format!(
                "database.command_timeout_secs must be within {COMMAND_TIMEOUT_RANGE:?}"
            )));
        }
        if !COMPATIBILITY_LEVELS.contains(&db.compatibility_level) {
            return Err(invalid(format!(
                "database.compatibility_level {} is not supported",
                db.compatibility_level
            )));
        }
        if db.collation.trim().is_empty() {
            return Err(invalid("database.collation is required"));
        }
        if !db.name_pattern.contains("{code}") {
            return Err(invalid("database.name_pattern must contain {code}"));
        }
        let sample = TenantCode::parse("SAMPLE1234").map_err(|e| invalid(e.to_string()))?;
        let longest = database_name(&db.name_pattern, &sample, i64::MAX);
        if !is_valid_database_name(&longest) {
            return Err(invalid(format!(
                "database.name_pattern '{}' does not yield valid database names",
                db.name_pattern
            )));
        }
        if self.backup.root.as_os_str().is_empty() {
            return Err(invalid("backup.root is required"));
        }
        if self.resolver.sliding_expiration_minutes <= 0 {
            return Err(invalid("resolver.sliding_expiration_minutes must be positive"));
        }
        if self.resolver.cache_capacity == 0 {
            return Err(invalid("resolver.cache_capacity must be positive"));
        }
        if self.resolver.tenant_header.trim().is_empty() {
            return Err(invalid("resolver.tenant_header is required"));
        }
        Ok(())
    }
}

fn parse_var<T>(key: &str, value: &str) -> ConfigResult<T>
where
    T: FromStr,
    T::Err: Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Env {
        key: format!("{ENV_PREFIX}{key}"),
        message: e.to_string(),
    })
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Validation(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = TenancyConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.database.port, 1433);
        assert_eq!(config.database.name_pattern, "TenantDB_{code}");
        assert_eq!(config.resolver.tenant_header, "X-Tenant-Id");
        assert_eq!(config.resolver.sliding_expiration_minutes, 30);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = TenancyConfig::from_toml(
            r#"
            [database]
            server = "sql.internal"
            recovery_model = "full"

            [backup]
            root = "/srv/backups"
            "#,
        )
        .unwrap();

        assert_eq!(config.database.server, "sql.internal");
        assert_eq!(config.database.recovery_model, RecoveryModel::Full);
        assert_eq!(config.database.port, 1433);
        assert_eq!(config.backup.root, PathBuf::from("/srv/backups"));
        assert!(config.backup.compression);
    }

    #[test]
    fn test_json() {
        let config =
            TenancyConfig::from_json(r#"{"resolver": {"cache_capacity": 50}}"#).unwrap();
        assert_eq!(config.resolver.cache_capacity, 50);
        assert!(TenancyConfig::from_json("{not json").is_err());
    }

    #[test]
    fn test_overrides() {
        let mut config = TenancyConfig::default();
        config
            .apply_overrides([
                ("BIZHUB_DATABASE_SERVER", "10.0.0.5"),
                ("BIZHUB_DATABASE_PORT", "14330"),
                ("BIZHUB_DATABASE_TRUST_SERVER_CERTIFICATE", "true"),
                ("BIZHUB_RESOLVER_TENANT_HEADER", "X-Org"),
                ("OTHER_DATABASE_PORT", "1"),
            ])
            .unwrap();

        assert_eq!(config.database.server, "10.0.0.5");
        assert_eq!(config.database.port, 14330);
        assert!(config.database.trust_server_certificate);
        assert_eq!(config.resolver.tenant_header, "X-Org");
    }

    #[test]
    fn test_bad_override_names_key() {
        let mut config = TenancyConfig::default();
        let err = config
            .apply_overrides([("BIZHUB_DATABASE_PORT", "abc")])
            .unwrap_err();
        assert!(err.to_string().contains("BIZHUB_DATABASE_PORT"));
    }

    #[test]
    fn test_validation() {
        let mut config = TenancyConfig::default();
        config.database.name_pattern = "TenantDB".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));

        let mut config = TenancyConfig::default();
        config.database.name_pattern = "1Tenant_{code}".to_string();
        assert!(config.validate().is_err());

        let mut config = TenancyConfig::default();
        config.database.compatibility_level = 155;
        assert!(config.validate().is_err());

        let mut config = TenancyConfig::default();
        config.resolver.sliding_expiration_minutes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tenancy.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[database]\nserver = \"db.local\"").unwrap();

        let config = TenancyConfig::load(&path).unwrap();
        assert_eq!(config.database.server, "db.local");

        let yaml = dir.path().join("tenancy.yaml");
        std::fs::write(&yaml, "database: {}").unwrap();
        assert!(matches!(TenancyConfig::load(&yaml), Err(ConfigError::Load(_))));
    }
}
