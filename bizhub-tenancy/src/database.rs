//! Database Per Tenant
//!
//! The relational engine is an external collaborator. Implement
//! [`DatabaseEngine`] (server-level administration) and
//! [`TenantConnection`] (work inside one tenant database) for your engine
//! of choice; the orchestration in [`crate::provisioning`] only talks to
//! these traits.
//!
//! # Usage
//!
//! ```rust,ignore
//! let engine: Arc<dyn DatabaseEngine> = Arc::new(MyEngine::new(admin_pool));
//! let service = TenantDatabaseService::new(store, engine, secrets, resolver, config);
//! ```

use crate::code::TenantCode;
use crate::connection_string::ConnectionString;
use crate::database_info::RecoveryModel;
use crate::error::TenantResult;
use crate::tenant::TenantId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Parameters of a `CREATE DATABASE`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateDatabaseSpec {
    pub name: String,
    pub collation: String,
    pub recovery_model: RecoveryModel,
    pub compatibility_level: u16,
    /// Directory for data files (engine default when absent)
    pub data_path: Option<PathBuf>,
    /// Directory for log files (engine default when absent)
    pub log_path: Option<PathBuf>,
}

/// Parameters of a full backup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRequest {
    pub database: String,
    pub path: PathBuf,
    /// Human-readable backup set name
    pub label: String,
    pub compression: bool,
    pub checksum: bool,
}

/// Initial data written into a freshly provisioned tenant database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedPlan {
    pub tenant_id: TenantId,
    pub tenant_code: String,
    pub tenant_name: String,
    pub locale: String,
    pub currency: String,
    pub timezone: String,
}

/// Server-level administration
#[async_trait]
pub trait DatabaseEngine: Send + Sync {
    async fn database_exists(&self, name: &str) -> TenantResult<bool>;

    async fn create_database(&self, spec: &CreateDatabaseSpec) -> TenantResult<()>;

    async fn drop_database(&self, name: &str) -> TenantResult<()>;

    /// Create a login whose access is limited to `database`.
    async fn create_login(&self, login: &str, password: &str, database: &str) -> TenantResult<()>;

    async fn drop_login(&self, login: &str) -> TenantResult<()>;

    /// Force-close every other connection to `database`.
    async fn set_single_user(&self, database: &str) -> TenantResult<()>;

    async fn set_multi_user(&self, database: &str) -> TenantResult<()>;

    async fn backup_database(&self, request: &BackupRequest) -> TenantResult<()>;

    /// Restore with replace from `path`.
    async fn restore_database(&self, database: &str, path: &Path) -> TenantResult<()>;

    async fn connect(&self, connection_string: &ConnectionString) -> TenantResult<Box<dyn TenantConnection>>;
}

/// Open connection to one tenant database
#[async_trait]
pub trait TenantConnection: Send {
    /// Migration identifiers not yet applied, in order.
    async fn pending_migrations(&mut self) -> TenantResult<Vec<String>>;

    async fn apply_migrations(&mut self, migrations: &[String]) -> TenantResult<()>;

    async fn seed(&mut self, plan: &SeedPlan) -> TenantResult<()>;

    async fn is_online(&mut self) -> TenantResult<bool>;

    async fn base_table_count(&mut self) -> TenantResult<u64>;

    /// Write `probe` inside a transaction, read it back, roll back.
    /// Returns whether the value read matched.
    async fn round_trip(&mut self, probe: &str) -> TenantResult<bool>;
}

/// Physical database name for a tenant.
///
/// `pattern` may use `{code}` and `{id}`, e.g. `TenantDB_{code}` or
/// `TenantDB_{code}_{id}`.
pub fn database_name(pattern: &str, code: &TenantCode, id: TenantId) -> String {
    pattern
        .replace("{code}", code.as_str())
        .replace("{id}", &id.to_string())
}

/// Dedicated login for a tenant database.
pub fn login_name(database: &str) -> String {
    format!("{database}_user")
}
