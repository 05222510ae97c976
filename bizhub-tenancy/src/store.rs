//! Master catalog collaborators
//!
//! Implement these traits with your persistence layer of choice. Writes go
//! through a [`MasterTransaction`]: changes are staged and become visible
//! only on [`MasterTransaction::commit`]. Dropping a transaction without
//! committing discards it.

use crate::code::TenantCode;
use crate::error::TenantResult;
use crate::tenant::{ModuleSubscription, Tenant, TenantId, TenantUser};
use async_trait::async_trait;

/// Tenant lookups against the master catalog
#[async_trait]
pub trait TenantStore: Send + Sync {
    async fn get_by_id(&self, id: TenantId) -> TenantResult<Option<Tenant>>;

    async fn get_by_code(&self, code: &TenantCode) -> TenantResult<Option<Tenant>>;

    /// All tenants in [`crate::TenantStatus::Active`].
    async fn get_active_tenants(&self) -> TenantResult<Vec<Tenant>>;

    /// Open a unit of work on the master catalog.
    async fn begin(&self) -> TenantResult<Box<dyn MasterTransaction>>;
}

/// Unit of work on the master catalog
#[async_trait]
pub trait MasterTransaction: Send {
    /// Read a tenant, seeing this transaction's staged writes.
    async fn get_tenant(&mut self, id: TenantId) -> TenantResult<Option<Tenant>>;

    async fn get_tenant_by_code(&mut self, code: &TenantCode) -> TenantResult<Option<Tenant>>;

    async fn next_tenant_id(&mut self) -> TenantResult<TenantId>;

    async fn insert_tenant(&mut self, tenant: &Tenant) -> TenantResult<()>;

    async fn update_tenant(&mut self, tenant: &Tenant) -> TenantResult<()>;

    async fn active_subscriptions(&mut self, tenant_id: TenantId) -> TenantResult<Vec<ModuleSubscription>>;

    async fn update_subscription(&mut self, subscription: &ModuleSubscription) -> TenantResult<()>;

    async fn commit(self: Box<Self>) -> TenantResult<()>;

    async fn rollback(self: Box<Self>) -> TenantResult<()>;
}

/// Tenant membership lookups
#[async_trait]
pub trait TenantUserStore: Send + Sync {
    async fn get_by_email(&self, email: &str, tenant_id: TenantId) -> TenantResult<Option<TenantUser>>;

    async fn get_by_tenant(&self, tenant_id: TenantId) -> TenantResult<Vec<TenantUser>>;
}

/// Module subscription lookups
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn get_subscriptions(&self, tenant_id: TenantId) -> TenantResult<Vec<ModuleSubscription>>;

    async fn get_active_subscriptions(&self, tenant_id: TenantId) -> TenantResult<Vec<ModuleSubscription>> {
        Ok(self
            .get_subscriptions(tenant_id)
            .await?
            .into_iter()
            .filter(ModuleSubscription::is_active)
            .collect())
    }
}
