//! Multi-Tenancy for bizhub
//!
//! Database-per-tenant support for the bizhub business platform: tenant
//! resolution with caching, request-scoped tenant context, and the full
//! provisioning and lifecycle of tenant databases.
//!
//! # Features
//!
//! - 🔍 **Tenant Resolution** - By id, code, domain, user email or header token
//! - 💾 **Resolver Cache** - Multi-key entries with sliding expiration
//! - 🏢 **Tenant Context** - Request-scoped tenant, user and connection string
//! - 🗄️ **Database Per Tenant** - Create, migrate, seed, back up, restore, delete
//! - ↩️ **Compensation** - Partial provisioning is undone and reported
//! - 🔐 **Secrets** - AES-256-GCM encrypted connection strings and passwords
//! - 🔁 **Resilience** - Retry with backoff and a circuit breaker around the engine
//! - 📝 **Tenant Management** - Registration, lifecycle and quotas
//!
//! # Quick Start
//!
//! ## 1. Implement the collaborators
//!
//! ```rust,ignore
//! use bizhub_tenancy::*;
//!
//! struct SqlMasterStore {
//!     pool: MyPool,
//! }
//!
//! #[async_trait]
//! impl TenantStore for SqlMasterStore {
//!     async fn get_by_id(&self, id: TenantId) -> TenantResult<Option<Tenant>> {
//!         self.pool.query_tenant("SELECT ... WHERE Id = @p1", id).await
//!     }
//!
//!     // ... implement other methods
//! }
//! ```
//!
//! ## 2. Resolve tenants per request
//!
//! ```rust,ignore
//! let config = TenancyConfig::load("bizhub.toml")?;
//! let resolver = Arc::new(TenantResolver::new(
//!     store.clone(),
//!     users.clone(),
//!     config.resolver.build_cache(Arc::new(SystemClock)),
//! ));
//!
//! let mut context = TenantContext::new(resolver.clone(), users, secrets.clone())
//!     .with_tenant_header(&config.resolver.tenant_header);
//! if context.initialize(&request).await && context.validate_tenant_access() {
//!     let connection = context.connection_string();
//! }
//! ```
//!
//! ## 3. Provision a tenant
//!
//! ```rust,ignore
//! let databases = Arc::new(TenantDatabaseService::new(store, engine, secrets, resolver, config));
//! let service = TenantService::new(master, users, subscriptions, databases, resolver);
//!
//! let tenant = service.register_tenant(NewTenant::new("ACME", "Acme Corp")).await?;
//! service.provision_tenant(tenant.id(), "ACME", &CancellationToken::new()).await?;
//! ```

pub mod cache;
pub mod clock;
pub mod code;
pub mod config;
pub mod connection_string;
pub mod context;
pub mod crypto;
pub mod database;
pub mod database_info;
pub mod error;
pub mod management;
pub mod memory;
pub mod provisioning;
pub mod request;
pub mod resilience;
pub mod resolver;
pub mod settings;
pub mod store;
pub mod tenant;

pub use cache::{CacheKey, CachePriority, CacheStats, ResolverCache};
pub use clock::{Clock, ManualClock, SystemClock, strictly_after};
pub use code::TenantCode;
pub use config::{
    BackupConfig, ConfigError, ConfigResult, DatabaseConfig, ResolverConfig, TenancyConfig,
};
pub use connection_string::ConnectionString;
pub use context::{BindingState, DEFAULT_TENANT_HEADER, TenantContext};
pub use crypto::{AesGcmSecretProvider, SecretProvider, generate_password};
pub use database::{BackupRequest, CreateDatabaseSpec, DatabaseEngine, SeedPlan, TenantConnection};
pub use database_info::{DatabaseInfo, DatabaseInfoBuilder, DatabaseMaintenance, RecoveryModel};
pub use error::{CompensationOutcome, ErrorKind, ProvisioningStep, TenantError, TenantResult};
pub use management::{TenantService, TenantUsage};
pub use memory::{EngineOperation, InMemoryDatabaseEngine, InMemoryMasterStore};
pub use provisioning::{DeletionReport, TenantDatabaseService};
pub use request::{Principal, RequestInfo};
pub use resilience::{
    BackoffStrategy, CircuitBreakerConfig, CircuitState, ExecutorStats, ResilientExecutor,
    RetryPolicy,
};
pub use resolver::{TenantResolver, normalize_domain};
pub use settings::{
    SecurityPolicy, SettingValue, TenantSettings, TenantSettingsBuilder, Theme, UiPreferences,
};
pub use store::{MasterTransaction, SubscriptionStore, TenantStore, TenantUserStore};
pub use tenant::{
    AuditStamp, ModuleSubscription, NewTenant, SubscriptionStatus, Tenant, TenantId, TenantQuotas,
    TenantStatus, TenantUser,
};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::TenancyConfig;
    pub use crate::context::TenantContext;
    pub use crate::error::{ErrorKind, TenantError, TenantResult};
    pub use crate::management::TenantService;
    pub use crate::provisioning::TenantDatabaseService;
    pub use crate::request::RequestInfo;
    pub use crate::resolver::TenantResolver;
    pub use crate::store::{SubscriptionStore, TenantStore, TenantUserStore};
    pub use crate::tenant::{NewTenant, Tenant, TenantId, TenantStatus};
    pub use tokio_util::sync::CancellationToken;
}
