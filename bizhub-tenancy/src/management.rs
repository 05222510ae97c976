//! Tenant Management
//!
//! Registration, lifecycle transitions, settings, quotas and end-to-end
//! provisioning of tenants.
//!
//! Every change goes through a master-catalog transaction and evicts the
//! tenant from the resolver cache, so the next request sees the new state.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use bizhub_tenancy::*;
//!
//! let service = TenantService::new(store, users, subscriptions, databases, resolver);
//!
//! let tenant = service.register_tenant(NewTenant::new("ACME", "Acme Corp")).await?;
//! let connection = service.provision_tenant(tenant.id(), "ACME", &cancel).await?;
//!
//! service.suspend(tenant.id(), "Payment overdue").await?;
//! service.activate(tenant.id()).await?;
//! ```

use crate::clock::{Clock, SystemClock};
use crate::code::TenantCode;
use crate::error::{TenantError, TenantResult};
use crate::provisioning::TenantDatabaseService;
use crate::resolver::TenantResolver;
use crate::settings::TenantSettings;
use crate::store::{MasterTransaction, SubscriptionStore, TenantStore, TenantUserStore};
use crate::tenant::{AuditStamp, NewTenant, SYSTEM_ACTOR, Tenant, TenantId, TenantQuotas};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Current resource usage of a tenant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantUsage {
    pub active_users: u32,
    pub active_modules: u32,
}

impl TenantUsage {
    /// Quotas already reached.
    pub fn exceeds_limits(&self, quotas: &TenantQuotas) -> Vec<String> {
        let mut violations = Vec::new();
        if self.active_users >= quotas.max_users {
            violations.push(format!(
                "users: {} of {}",
                self.active_users, quotas.max_users
            ));
        }
        if self.active_modules >= quotas.max_modules {
            violations.push(format!(
                "modules: {} of {}",
                self.active_modules, quotas.max_modules
            ));
        }
        violations
    }
}

/// Tenant lifecycle service
pub struct TenantService {
    store: Arc<dyn TenantStore>,
    users: Arc<dyn TenantUserStore>,
    subscriptions: Arc<dyn SubscriptionStore>,
    databases: Arc<TenantDatabaseService>,
    resolver: Arc<TenantResolver>,
    clock: Arc<dyn Clock>,
    actor: String,
}

impl TenantService {
    pub fn new(
        store: Arc<dyn TenantStore>,
        users: Arc<dyn TenantUserStore>,
        subscriptions: Arc<dyn SubscriptionStore>,
        databases: Arc<TenantDatabaseService>,
        resolver: Arc<TenantResolver>,
    ) -> Self {
        Self {
            store,
            users,
            subscriptions,
            databases,
            resolver,
            clock: Arc::new(SystemClock),
            actor: SYSTEM_ACTOR.to_string(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Name recorded as `updated_by` on changes made through this service.
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    pub fn databases(&self) -> &TenantDatabaseService {
        &self.databases
    }

    fn stamp(&self) -> AuditStamp {
        AuditStamp::new(&self.actor, self.clock.now())
    }

    /// Register a new tenant in `Pending`.
    pub async fn register_tenant(&self, request: NewTenant) -> TenantResult<Tenant> {
        let code = TenantCode::parse(&request.code)?;
        let mut tx = self.store.begin().await?;

        match self.stage_registration(tx.as_mut(), &code, request).await {
            Ok(tenant) => {
                tx.commit().await?;
                info!(tenant_id = tenant.id(), tenant_code = %code, "Tenant registered");
                Ok(tenant)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(tenant_code = %code, error = %rollback, "Rollback failed");
                }
                warn!(tenant_code = %code, error = %e, "Tenant registration refused");
                Err(e)
            }
        }
    }

    async fn stage_registration(
        &self,
        tx: &mut dyn MasterTransaction,
        code: &TenantCode,
        request: NewTenant,
    ) -> TenantResult<Tenant> {
        if tx.get_tenant_by_code(code).await?.is_some() {
            return Err(TenantError::PreconditionFailed(format!(
                "tenant code {code} is already in use"
            )));
        }

        let stamp = self.stamp();
        let id = tx.next_tenant_id().await?;
        let mut tenant = Tenant::new(id, request.name, code.clone(), &stamp)?;
        if let Some(email) = request.contact_email {
            tenant.set_contact_email(Some(email), &stamp)?;
        }
        if let Some(quotas) = request.quotas {
            tenant.change_quotas(quotas, &stamp)?;
        }
        if let Some(settings) = request.settings {
            tenant.apply_settings(settings, &stamp)?;
        }

        tx.insert_tenant(&tenant).await?;
        Ok(tenant)
    }

    pub async fn get(&self, tenant_id: TenantId) -> TenantResult<Option<Tenant>> {
        self.store.get_by_id(tenant_id).await
    }

    async fn mutate<F>(&self, tenant_id: TenantId, action: &str, change: F) -> TenantResult<Tenant>
    where
        F: FnOnce(&mut Tenant, &AuditStamp) -> TenantResult<()>,
    {
        let mut tx = self.store.begin().await?;
        let staged = async {
            let mut tenant = tx
                .get_tenant(tenant_id)
                .await?
                .ok_or_else(|| TenantError::NotFound(tenant_id.to_string()))?;
            change(&mut tenant, &self.stamp())?;
            tx.update_tenant(&tenant).await?;
            Ok::<_, TenantError>(tenant)
        }
        .await;

        match staged {
            Ok(tenant) => {
                tx.commit().await?;
                self.resolver.evict(tenant_id);
                info!(tenant_id, action, status = %tenant.status(), "Tenant updated");
                Ok(tenant)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(tenant_id, error = %rollback, "Rollback failed");
                }
                warn!(tenant_id, action, error = %e, "Tenant update refused");
                Err(e)
            }
        }
    }

    pub async fn activate(&self, tenant_id: TenantId) -> TenantResult<Tenant> {
        self.mutate(tenant_id, "activate", |tenant, stamp| tenant.activate(stamp))
            .await
    }

    pub async fn suspend(&self, tenant_id: TenantId, reason: &str) -> TenantResult<Tenant> {
        self.mutate(tenant_id, "suspend", |tenant, stamp| tenant.suspend(reason, stamp))
            .await
    }

    pub async fn deactivate(&self, tenant_id: TenantId, reason: &str) -> TenantResult<Tenant> {
        self.mutate(tenant_id, "deactivate", |tenant, stamp| {
            tenant.deactivate(reason, stamp)
        })
        .await
    }

    pub async fn terminate(&self, tenant_id: TenantId, reason: &str) -> TenantResult<Tenant> {
        self.mutate(tenant_id, "terminate", |tenant, stamp| {
            tenant.terminate(reason, stamp)
        })
        .await
    }

    pub async fn update_settings(
        &self,
        tenant_id: TenantId,
        settings: TenantSettings,
    ) -> TenantResult<Tenant> {
        self.mutate(tenant_id, "update settings", |tenant, stamp| {
            tenant.apply_settings(settings, stamp)
        })
        .await
    }

    pub async fn change_quotas(
        &self,
        tenant_id: TenantId,
        quotas: TenantQuotas,
    ) -> TenantResult<Tenant> {
        self.mutate(tenant_id, "change quotas", |tenant, stamp| {
            tenant.change_quotas(quotas, stamp)
        })
        .await
    }

    pub async fn usage(&self, tenant_id: TenantId) -> TenantResult<TenantUsage> {
        let active_users = self
            .users
            .get_by_tenant(tenant_id)
            .await?
            .iter()
            .filter(|u| u.is_active)
            .count();
        let active_modules = self
            .subscriptions
            .get_active_subscriptions(tenant_id)
            .await?
            .len();
        Ok(TenantUsage {
            active_users: u32::try_from(active_users).unwrap_or(u32::MAX),
            active_modules: u32::try_from(active_modules).unwrap_or(u32::MAX),
        })
    }

    async fn quotas(&self, tenant_id: TenantId) -> TenantResult<TenantQuotas> {
        self.store
            .get_by_id(tenant_id)
            .await?
            .map(|t| *t.quotas())
            .ok_or_else(|| TenantError::NotFound(tenant_id.to_string()))
    }

    /// Fails with `PreconditionFailed` when no more users may be added.
    pub async fn ensure_user_capacity(&self, tenant_id: TenantId) -> TenantResult<()> {
        let quotas = self.quotas(tenant_id).await?;
        let usage = self.usage(tenant_id).await?;
        if usage.active_users >= quotas.max_users {
            return Err(TenantError::PreconditionFailed(format!(
                "quota exceeded: tenant {tenant_id} has {} of {} users",
                usage.active_users, quotas.max_users
            )));
        }
        Ok(())
    }

    /// Fails with `PreconditionFailed` when no more modules may be subscribed.
    pub async fn ensure_module_capacity(&self, tenant_id: TenantId) -> TenantResult<()> {
        let quotas = self.quotas(tenant_id).await?;
        let usage = self.usage(tenant_id).await?;
        if usage.active_modules >= quotas.max_modules {
            return Err(TenantError::PreconditionFailed(format!(
                "quota exceeded: tenant {tenant_id} has {} of {} modules",
                usage.active_modules, quotas.max_modules
            )));
        }
        Ok(())
    }

    /// Create, migrate and seed the tenant's database. Returns the plain
    /// connection string.
    ///
    /// Stops at the first failing step. A database that was created but
    /// failed to migrate or seed stays in place; migrating and seeding
    /// again completes it.
    pub async fn provision_tenant(
        &self,
        tenant_id: TenantId,
        tenant_code: &str,
        cancel: &CancellationToken,
    ) -> TenantResult<String> {
        info!(tenant_id, tenant_code, "Provisioning tenant");
        let connection_string = self
            .databases
            .create_tenant_database(tenant_id, tenant_code, cancel)
            .await?;
        self.databases.migrate_tenant_database(tenant_id, cancel).await?;
        self.databases.seed_tenant_database(tenant_id, cancel).await?;
        info!(tenant_id, tenant_code, "Tenant provisioned");
        Ok(connection_string)
    }
}
