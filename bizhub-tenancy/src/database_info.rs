//! Physical database descriptor
//!
//! [`DatabaseInfo`] describes where a tenant's database lives and how to
//! reach it. It is immutable; maintenance stamps and credential rotation
//! produce a new value. Equality covers only the identity fields (name,
//! server, port, user, auth mode, application name): passwords rotate
//! independently of identity.

use crate::error::{TenantError, TenantResult};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use std::net::IpAddr;

static DATABASE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_@$#]{0,127}$").unwrap());

static INSTANCE_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_$]{1,16}$").unwrap());

/// Supported compatibility levels.
pub const COMPATIBILITY_LEVELS: [u16; 7] = [100, 110, 120, 130, 140, 150, 160];

/// Connection timeout bounds in seconds.
pub const CONNECT_TIMEOUT_RANGE: std::ops::RangeInclusive<u32> = 1..=300;

/// Command timeout bounds in seconds.
pub const COMMAND_TIMEOUT_RANGE: std::ops::RangeInclusive<u32> = 1..=3600;

/// Database recovery model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryModel {
    #[default]
    Simple,
    Full,
    BulkLogged,
}

impl RecoveryModel {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Simple => "SIMPLE",
            Self::Full => "FULL",
            Self::BulkLogged => "BULK_LOGGED",
        }
    }
}

impl std::str::FromStr for RecoveryModel {
    type Err = TenantError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SIMPLE" => Ok(Self::Simple),
            "FULL" => Ok(Self::Full),
            "BULK_LOGGED" | "BULKLOGGED" => Ok(Self::BulkLogged),
            other => Err(TenantError::Validation(format!(
                "unknown recovery model '{other}'"
            ))),
        }
    }
}

/// Maintenance history of a tenant database.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseMaintenance {
    pub last_migration_date: Option<DateTime<Utc>>,
    pub last_backup_date: Option<DateTime<Utc>>,
    pub last_restore_date: Option<DateTime<Utc>>,
    pub last_health_check_date: Option<DateTime<Utc>>,
    pub last_optimization_date: Option<DateTime<Utc>>,
    pub schema_version: Option<String>,
}

/// Physical connection descriptor of a tenant database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseInfo {
    database_name: String,
    server: String,
    port: u16,
    username: String,
    encrypted_password: Option<String>,
    encrypted_connection_string: Option<String>,
    integrated_security: bool,
    encrypt: bool,
    trust_server_certificate: bool,
    application_name: String,
    connect_timeout_secs: u32,
    command_timeout_secs: u32,
    collation: String,
    recovery_model: RecoveryModel,
    compatibility_level: u16,
    created_at: DateTime<Utc>,
    maintenance: DatabaseMaintenance,
}

impl DatabaseInfo {
    /// Start building a descriptor for `database_name` on `server`.
    pub fn builder(database_name: impl Into<String>, server: impl Into<String>) -> DatabaseInfoBuilder {
        DatabaseInfoBuilder::new(database_name.into(), server.into())
    }

    pub fn database_name(&self) -> &str {
        &self.database_name
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn encrypted_password(&self) -> Option<&str> {
        self.encrypted_password.as_deref()
    }

    pub fn encrypted_connection_string(&self) -> Option<&str> {
        self.encrypted_connection_string.as_deref()
    }

    pub fn uses_integrated_security(&self) -> bool {
        self.integrated_security
    }

    pub fn encrypt(&self) -> bool {
        self.encrypt
    }

    pub fn trust_server_certificate(&self) -> bool {
        self.trust_server_certificate
    }

    pub fn application_name(&self) -> &str {
        &self.application_name
    }

    pub fn connect_timeout_secs(&self) -> u32 {
        self.connect_timeout_secs
    }

    pub fn command_timeout_secs(&self) -> u32 {
        self.command_timeout_secs
    }

    pub fn collation(&self) -> &str {
        &self.collation
    }

    pub fn recovery_model(&self) -> RecoveryModel {
        self.recovery_model
    }

    pub fn compatibility_level(&self) -> u16 {
        self.compatibility_level
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn maintenance(&self) -> &DatabaseMaintenance {
        &self.maintenance
    }

    /// Copy with rotated credentials.
    pub fn with_credentials(
        &self,
        encrypted_password: impl Into<String>,
        encrypted_connection_string: impl Into<String>,
    ) -> DatabaseInfo {
        Self {
            encrypted_password: Some(encrypted_password.into()),
            encrypted_connection_string: Some(encrypted_connection_string.into()),
            ..self.clone()
        }
    }

    #[must_use]
    pub fn with_migration(&self, at: DateTime<Utc>, schema_version: Option<String>) -> DatabaseInfo {
        let mut next = self.clone();
        next.maintenance.last_migration_date = Some(at);
        if schema_version.is_some() {
            next.maintenance.schema_version = schema_version;
        }
        next
    }

    #[must_use]
    pub fn with_backup(&self, at: DateTime<Utc>) -> DatabaseInfo {
        let mut next = self.clone();
        next.maintenance.last_backup_date = Some(at);
        next
    }

    #[must_use]
    pub fn with_restore(&self, at: DateTime<Utc>) -> DatabaseInfo {
        let mut next = self.clone();
        next.maintenance.last_restore_date = Some(at);
        next
    }

    #[must_use]
    pub fn with_health_check(&self, at: DateTime<Utc>) -> DatabaseInfo {
        let mut next = self.clone();
        next.maintenance.last_health_check_date = Some(at);
        next
    }

    #[must_use]
    pub fn with_optimization(&self, at: DateTime<Utc>) -> DatabaseInfo {
        let mut next = self.clone();
        next.maintenance.last_optimization_date = Some(at);
        next
    }
}

impl PartialEq for DatabaseInfo {
    fn eq(&self, other: &Self) -> bool {
        self.database_name == other.database_name
            && self.server.eq_ignore_ascii_case(&other.server)
            && self.port == other.port
            && self.username == other.username
            && self.integrated_security == other.integrated_security
            && self.application_name == other.application_name
    }
}

impl Eq for DatabaseInfo {}

impl Hash for DatabaseInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.database_name.hash(state);
        self.server.to_ascii_lowercase().hash(state);
        self.port.hash(state);
        self.username.hash(state);
        self.integrated_security.hash(state);
        self.application_name.hash(state);
    }
}

/// Builder for [`DatabaseInfo`]; `build` validates every field.
#[derive(Debug, Clone)]
pub struct DatabaseInfoBuilder {
    info: DatabaseInfo,
}

impl DatabaseInfoBuilder {
    fn new(database_name: String, server: String) -> Self {
        Self {
            info: DatabaseInfo {
                database_name,
                server,
                port: 1433,
                username: String::new(),
                encrypted_password: None,
                encrypted_connection_string: None,
                integrated_security: false,
                encrypt: true,
                trust_server_certificate: false,
                application_name: "bizhub".to_string(),
                connect_timeout_secs: 30,
                command_timeout_secs: 30,
                collation: "SQL_Latin1_General_CP1_CI_AS".to_string(),
                recovery_model: RecoveryModel::Simple,
                compatibility_level: 150,
                created_at: Utc::now(),
                maintenance: DatabaseMaintenance::default(),
            },
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.info.port = port;
        self
    }

    pub fn credentials(
        mut self,
        username: impl Into<String>,
        encrypted_password: impl Into<String>,
        encrypted_connection_string: impl Into<String>,
    ) -> Self {
        self.info.username = username.into();
        self.info.encrypted_password = Some(encrypted_password.into());
        self.info.encrypted_connection_string = Some(encrypted_connection_string.into());
        self
    }

    /// Integrated (OS) authentication; no stored secret is required.
    pub fn integrated_security(mut self, enabled: bool) -> Self {
        self.info.integrated_security = enabled;
        self
    }

    pub fn encrypt(mut self, encrypt: bool) -> Self {
        self.info.encrypt = encrypt;
        self
    }

    pub fn trust_server_certificate(mut self, trust: bool) -> Self {
        self.info.trust_server_certificate = trust;
        self
    }

    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.info.application_name = name.into();
        self
    }

    pub fn timeouts(mut self, connect_secs: u32, command_secs: u32) -> Self {
        self.info.connect_timeout_secs = connect_secs;
        self.info.command_timeout_secs = command_secs;
        self
    }

    pub fn collation(mut self, collation: impl Into<String>) -> Self {
        self.info.collation = collation.into();
        self
    }

    pub fn recovery_model(mut self, model: RecoveryModel) -> Self {
        self.info.recovery_model = model;
        self
    }

    pub fn compatibility_level(mut self, level: u16) -> Self {
        self.info.compatibility_level = level;
        self
    }

    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.info.created_at = at;
        self
    }

    pub fn maintenance(mut self, maintenance: DatabaseMaintenance) -> Self {
        self.info.maintenance = maintenance;
        self
    }

    pub fn build(self) -> TenantResult<DatabaseInfo> {
        let info = self.info;

        if !is_valid_database_name(&info.database_name) {
            return Err(invalid(format!(
                "database name '{}' is not a valid identifier",
                info.database_name
            )));
        }
        if !is_valid_server(&info.server) {
            return Err(invalid(format!("server '{}' is not a valid host", info.server)));
        }
        if info.port == 0 {
            return Err(invalid("port must be between 1 and 65535"));
        }
        if !CONNECT_TIMEOUT_RANGE.contains(&info.connect_timeout_secs) {
            return Err(invalid(format!(
                "connect timeout {}s is outside {:?}",
                info.connect_timeout_secs, CONNECT_TIMEOUT_RANGE
            )));
        }
        if !COMMAND_TIMEOUT_RANGE.contains(&info.command_timeout_secs) {
            return Err(invalid(format!(
                "command timeout {}s is outside {:?}",
                info.command_timeout_secs, COMMAND_TIMEOUT_RANGE
            )));
        }
        if !COMPATIBILITY_LEVELS.contains(&info.compatibility_level) {
            return Err(invalid(format!(
                "unsupported compatibility level {}",
                info.compatibility_level
            )));
        }
        if info.collation.trim().is_empty() {
            return Err(invalid("collation is required"));
        }
        if !info.integrated_security {
            if info.username.trim().is_empty() {
                return Err(invalid("username is required without integrated security"));
            }
            let has_secret = |s: &Option<String>| s.as_deref().is_some_and(|v| !v.is_empty());
            if !has_secret(&info.encrypted_password) {
                return Err(invalid("password is required without integrated security"));
            }
            if !has_secret(&info.encrypted_connection_string) {
                return Err(invalid(
                    "connection string is required without integrated security",
                ));
            }
        }

        Ok(info)
    }
}

fn invalid(message: impl Into<String>) -> TenantError {
    TenantError::Validation(message.into())
}

/// SQL identifier rules for database names.
pub fn is_valid_database_name(name: &str) -> bool {
    DATABASE_NAME.is_match(name)
}

/// IP address, hostname, or `hostname\instance`.
pub fn is_valid_server(server: &str) -> bool {
    let (host, instance) = match server.split_once('\\') {
        Some((host, instance)) => (host, Some(instance)),
        None => (server, None),
    };
    if let Some(instance) = instance {
        if !INSTANCE_NAME.is_match(instance) {
            return false;
        }
    }
    host.parse::<IpAddr>().is_ok() || is_valid_hostname(host)
}

fn is_valid_hostname(host: &str) -> bool {
    if host.is_empty() || host.len() > 253 {
        return false;
    }
    host.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}
