//! Operation-scoped tenant context
//!
//! A [`TenantContext`] is created at the start of a logical operation (one
//! request, one job) and dropped at its end. It binds one resolved tenant
//! and, when a caller is authenticated, that caller's membership in the
//! tenant.
//!
//! Binding failures are reported as `false`, never as errors: an
//! unresolvable identifier is an expected outcome. A failed bind leaves the
//! previous binding in place.

use crate::connection_string::ConnectionString;
use crate::crypto::SecretProvider;
use crate::request::{Principal, RequestInfo, TENANT_PARAM};
use crate::resolver::TenantResolver;
use crate::store::TenantUserStore;
use crate::tenant::{Tenant, TenantId, TenantUser};
use once_cell::sync::OnceCell;
use std::sync::Arc;
use tracing::{debug, warn};

/// Default header carrying a tenant identifier.
pub const DEFAULT_TENANT_HEADER: &str = "X-Tenant-Id";

/// Binding state of a [`TenantContext`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingState {
    Unbound,
    Bound,
    BoundWithUser,
}

/// Tenant and user bound to the current operation
pub struct TenantContext {
    resolver: Arc<TenantResolver>,
    users: Arc<dyn TenantUserStore>,
    secrets: Arc<dyn SecretProvider>,
    tenant_header: String,
    principal: Option<Principal>,
    tenant: Option<Arc<Tenant>>,
    user: Option<TenantUser>,
    connection_string: OnceCell<Option<String>>,
}

impl TenantContext {
    pub fn new(
        resolver: Arc<TenantResolver>,
        users: Arc<dyn TenantUserStore>,
        secrets: Arc<dyn SecretProvider>,
    ) -> Self {
        Self {
            resolver,
            users,
            secrets,
            tenant_header: DEFAULT_TENANT_HEADER.to_string(),
            principal: None,
            tenant: None,
            user: None,
            connection_string: OnceCell::new(),
        }
    }

    /// Header consulted first by [`TenantContext::initialize`].
    pub fn with_tenant_header(mut self, header: impl Into<String>) -> Self {
        self.tenant_header = header.into();
        self
    }

    /// Authenticated caller of this operation.
    pub fn with_principal(mut self, principal: Principal) -> Self {
        self.principal = Some(principal);
        self
    }

    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }

    pub fn tenant(&self) -> Option<&Tenant> {
        self.tenant.as_deref()
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        self.tenant.as_ref().map(|t| t.id())
    }

    pub fn user(&self) -> Option<&TenantUser> {
        self.user.as_ref()
    }

    pub fn state(&self) -> BindingState {
        match (&self.tenant, &self.user) {
            (None, _) => BindingState::Unbound,
            (Some(_), None) => BindingState::Bound,
            (Some(_), Some(_)) => BindingState::BoundWithUser,
        }
    }

    /// Bind the tenant named by `identifier` (any form accepted by
    /// [`TenantResolver::resolve`]).
    pub async fn set_tenant(&mut self, identifier: &str) -> bool {
        let resolved = self.resolver.resolve(identifier).await;
        self.bind(resolved, identifier).await
    }

    pub async fn set_tenant_by_id(&mut self, id: TenantId) -> bool {
        let resolved = self.resolver.resolve_by_id(id).await;
        self.bind(resolved, &id.to_string()).await
    }

    pub async fn set_tenant_by_code(&mut self, code: &str) -> bool {
        let resolved = self.resolver.resolve_by_code(code).await;
        self.bind(resolved, code).await
    }

    pub async fn set_tenant_by_domain(&mut self, domain: &str) -> bool {
        let resolved = self.resolver.resolve_by_domain(domain).await;
        self.bind(resolved, domain).await
    }

    async fn bind(
        &mut self,
        resolved: crate::error::TenantResult<Option<Arc<Tenant>>>,
        identifier: &str,
    ) -> bool {
        let tenant = match resolved {
            Ok(Some(tenant)) => tenant,
            Ok(None) => {
                debug!(identifier, "No active tenant for identifier");
                return false;
            }
            Err(e) => {
                warn!(identifier, error = %e, "Tenant resolution failed");
                return false;
            }
        };

        debug!(tenant_id = tenant.id(), tenant_code = %tenant.code(), "Tenant bound");
        self.user = self.load_user(&tenant).await;
        self.tenant = Some(tenant);
        self.connection_string = OnceCell::new();
        true
    }

    async fn load_user(&self, tenant: &Tenant) -> Option<TenantUser> {
        let principal = self.principal.as_ref()?;
        match self.users.get_by_email(principal.email(), tenant.id()).await {
            Ok(user) => user,
            Err(e) => {
                warn!(tenant_id = tenant.id(), error = %e, "Failed to load tenant user");
                None
            }
        }
    }

    /// Authorisation gate for tenant-scoped work.
    ///
    /// True only when a tenant is bound, a caller is authenticated, the
    /// caller's membership was found, belongs to the bound tenant and is
    /// active.
    pub fn validate_tenant_access(&self) -> bool {
        let (Some(tenant), Some(_), Some(user)) = (&self.tenant, &self.principal, &self.user) else {
            return false;
        };
        user.tenant_id == tenant.id() && user.is_active
    }

    /// Decrypted connection string of the bound tenant's database.
    ///
    /// Decrypted once per binding. `None` when nothing is bound, the tenant
    /// has no database, or decryption fails; the last case is logged.
    pub fn connection_string(&self) -> Option<&str> {
        self.connection_string
            .get_or_init(|| {
                let tenant = self.tenant.as_ref()?;
                let encrypted = tenant.database_info()?.encrypted_connection_string()?;
                match self.secrets.decrypt(encrypted) {
                    Ok(plain) => Some(plain),
                    Err(e) => {
                        warn!(tenant_id = tenant.id(), error = %e, "Connection string unavailable");
                        None
                    }
                }
            })
            .as_deref()
    }

    /// Parsed form of [`TenantContext::connection_string`].
    pub fn database_connection(&self) -> Option<ConnectionString> {
        let raw = self.connection_string()?;
        match ConnectionString::parse(raw) {
            Ok(cs) => Some(cs),
            Err(e) => {
                warn!(tenant_id = ?self.tenant_id(), error = %e, "Stored connection string is malformed");
                None
            }
        }
    }

    /// Bind the tenant named by an inbound request.
    ///
    /// Candidates, in order: the tenant header, the request host (subdomain
    /// or custom domain), the `tenant` route value, the `tenant` query
    /// parameter, the caller's tenant claim, and finally the caller's email
    /// when there is no claim. The first candidate that resolves wins.
    pub async fn initialize(&mut self, request: &RequestInfo) -> bool {
        if let Some(principal) = request.principal() {
            self.principal = Some(principal.clone());
        }

        if let Some(value) = request.header(&self.tenant_header) {
            if self.set_tenant(value).await {
                return true;
            }
        }
        if let Some(host) = request.host() {
            if self.set_tenant_by_domain(host).await {
                return true;
            }
        }
        if let Some(value) = request.route_value(TENANT_PARAM) {
            if self.set_tenant(value).await {
                return true;
            }
        }
        if let Some(value) = request.query_param(TENANT_PARAM) {
            if self.set_tenant(value).await {
                return true;
            }
        }

        let Some(principal) = self.principal.clone() else {
            debug!("No tenant candidate resolved for request");
            return false;
        };
        match principal.tenant_claim() {
            Some(claim) => self.set_tenant(claim).await,
            None => {
                let resolved = self.resolver.resolve_by_user(principal.email()).await;
                self.bind(resolved, principal.email()).await
            }
        }
    }
}
