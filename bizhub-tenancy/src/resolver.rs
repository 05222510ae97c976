//! Tenant Resolution
//!
//! [`TenantResolver`] turns an opaque identifier (numeric id, code, domain,
//! user email or `type:value` header token) into an active [`Tenant`].
//!
//! Only tenants in [`TenantStatus::Active`] are cached or returned. Lookups
//! that find nothing return `Ok(None)`; only store failures are errors.
//!
//! Cached entries are not refreshed when a tenant changes in the store.
//! The lifecycle services call [`TenantResolver::evict`] after every change
//! they commit; changes made elsewhere become visible when the sliding
//! expiration runs out.

use crate::cache::{CacheKey, ResolverCache};
use crate::code::TenantCode;
use crate::error::TenantResult;
use crate::store::{TenantStore, TenantUserStore};
use crate::tenant::{Tenant, TenantId, TenantStatus};
use std::sync::Arc;
use tracing::{debug, warn};

/// Header token prefix selecting a tenant by code.
pub const HEADER_CODE_PREFIX: &str = "tenant";

/// Header token prefix selecting a tenant by id.
pub const HEADER_ID_PREFIX: &str = "id";

/// Identity-to-tenant lookup with caching
pub struct TenantResolver {
    store: Arc<dyn TenantStore>,
    users: Arc<dyn TenantUserStore>,
    cache: ResolverCache,
}

impl TenantResolver {
    pub fn new(store: Arc<dyn TenantStore>, users: Arc<dyn TenantUserStore>, cache: ResolverCache) -> Self {
        Self { store, users, cache }
    }

    pub fn cache(&self) -> &ResolverCache {
        &self.cache
    }

    fn remember(&self, tenant: Tenant, extra: Option<CacheKey>) -> Option<Arc<Tenant>> {
        if tenant.status() != TenantStatus::Active {
            debug!(
                tenant_id = tenant.id(),
                status = %tenant.status(),
                "Resolved tenant is not active"
            );
            return None;
        }

        let tenant = Arc::new(tenant);
        let mut keys = vec![CacheKey::id(tenant.id()), CacheKey::code(tenant.code())];
        keys.extend(extra);
        self.cache.insert(&keys, Arc::clone(&tenant));
        Some(tenant)
    }

    fn cached(&self, key: &CacheKey) -> Option<Arc<Tenant>> {
        let hit = self.cache.get(key);
        debug!(key = %key, hit = hit.is_some(), "Tenant cache lookup");
        hit
    }

    /// Resolve by numeric id. Cached under `id_{id}` and the tenant's code.
    pub async fn resolve_by_id(&self, id: TenantId) -> TenantResult<Option<Arc<Tenant>>> {
        let key = CacheKey::id(id);
        if let Some(tenant) = self.cached(&key) {
            return Ok(Some(tenant));
        }

        Ok(self
            .store
            .get_by_id(id)
            .await?
            .and_then(|tenant| self.remember(tenant, None)))
    }

    /// Resolve by tenant code, case-insensitively. Malformed codes resolve
    /// to nothing.
    pub async fn resolve_by_code(&self, code: &str) -> TenantResult<Option<Arc<Tenant>>> {
        let Ok(code) = TenantCode::parse(code) else {
            return Ok(None);
        };

        let key = CacheKey::code(&code);
        if let Some(tenant) = self.cached(&key) {
            return Ok(Some(tenant));
        }

        Ok(self
            .store
            .get_by_code(&code)
            .await?
            .and_then(|tenant| self.remember(tenant, None)))
    }

    /// Resolve by host name.
    ///
    /// With three or more labels the first label is tried as a tenant code
    /// (`acme.bizhub.io`). When that does not resolve, or the host has fewer
    /// labels, every active tenant's `system.customDomain` setting is compared
    /// with the normalised host. That fallback is a linear scan over all
    /// active tenants.
    pub async fn resolve_by_domain(&self, domain: &str) -> TenantResult<Option<Arc<Tenant>>> {
        let Some(host) = normalize_domain(domain) else {
            return Ok(None);
        };

        let labels: Vec<&str> = host.split('.').collect();
        if labels.len() >= 3 {
            if let Some(tenant) = self.resolve_by_code(labels[0]).await? {
                return Ok(Some(tenant));
            }
        }

        let key = CacheKey::domain(&host);
        if let Some(tenant) = self.cached(&key) {
            return Ok(Some(tenant));
        }

        let found = self
            .store
            .get_active_tenants()
            .await?
            .into_iter()
            .find(|t| {
                t.settings()
                    .and_then(|s| s.custom_domain())
                    .is_some_and(|d| d.eq_ignore_ascii_case(&host))
            });

        Ok(found.and_then(|tenant| self.remember(tenant, Some(key))))
    }

    /// Resolve by the email of an active tenant user.
    ///
    /// Loads the users of every active tenant until one matches, so the cost
    /// grows with tenants times users per tenant. Callers resolving by user
    /// on a hot path should keep their own email-to-tenant index.
    pub async fn resolve_by_user(&self, email: &str) -> TenantResult<Option<Arc<Tenant>>> {
        let email = email.trim();
        if !email.contains('@') {
            return Ok(None);
        }

        let key = CacheKey::user(email);
        if let Some(tenant) = self.cached(&key) {
            return Ok(Some(tenant));
        }

        for tenant in self.store.get_active_tenants().await? {
            let users = self.users.get_by_tenant(tenant.id()).await?;
            if users.iter().any(|u| u.is_active && u.email_matches(email)) {
                return Ok(self.remember(tenant, Some(key)));
            }
        }
        Ok(None)
    }

    /// Resolve a `tenant:{code}` or `id:{id}` token. Other prefixes resolve
    /// to nothing.
    pub async fn resolve_by_header(&self, token: &str) -> TenantResult<Option<Arc<Tenant>>> {
        let Some((kind, value)) = token.trim().split_once(':') else {
            return Ok(None);
        };
        let value = value.trim();

        if kind.eq_ignore_ascii_case(HEADER_CODE_PREFIX) {
            self.resolve_by_code(value).await
        } else if kind.eq_ignore_ascii_case(HEADER_ID_PREFIX) {
            match value.parse::<TenantId>() {
                Ok(id) => self.resolve_by_id(id).await,
                Err(_) => Ok(None),
            }
        } else {
            debug!(prefix = kind, "Unrecognised tenant header token");
            Ok(None)
        }
    }

    /// Try, in order: numeric id, code, domain (if the identifier contains
    /// `.`), user (if it contains `@`), header token (if it contains `:`).
    /// The first strategy that finds an active tenant wins.
    pub async fn resolve(&self, identifier: &str) -> TenantResult<Option<Arc<Tenant>>> {
        let identifier = identifier.trim();
        if identifier.is_empty() {
            return Ok(None);
        }

        if let Ok(id) = identifier.parse::<TenantId>() {
            if let Some(tenant) = self.resolve_by_id(id).await? {
                return Ok(Some(tenant));
            }
        }
        if let Some(tenant) = self.resolve_by_code(identifier).await? {
            return Ok(Some(tenant));
        }
        if identifier.contains('.') {
            if let Some(tenant) = self.resolve_by_domain(identifier).await? {
                return Ok(Some(tenant));
            }
        }
        if identifier.contains('@') {
            if let Some(tenant) = self.resolve_by_user(identifier).await? {
                return Ok(Some(tenant));
            }
        }
        if identifier.contains(':') {
            if let Some(tenant) = self.resolve_by_header(identifier).await? {
                return Ok(Some(tenant));
            }
        }

        debug!(identifier, "Tenant not resolved");
        Ok(None)
    }

    /// Drop every cached key of tenant `id`.
    pub fn evict(&self, id: TenantId) {
        let removed = self.cache.evict_tenant(id);
        if removed > 0 {
            debug!(tenant_id = id, removed, "Evicted tenant from resolver cache");
        }
    }

    /// [`TenantResolver::resolve`], logging and swallowing store failures.
    pub async fn try_resolve(&self, identifier: &str) -> Option<Arc<Tenant>> {
        match self.resolve(identifier).await {
            Ok(tenant) => tenant,
            Err(e) => {
                warn!(identifier, error = %e, "Tenant resolution failed");
                None
            }
        }
    }
}

/// Lower-case host with scheme, `www.`, port and path removed.
pub fn normalize_domain(raw: &str) -> Option<String> {
    let mut host = raw.trim().to_ascii_lowercase();
    for scheme in ["https://", "http://"] {
        if let Some(rest) = host.strip_prefix(scheme) {
            host = rest.to_string();
        }
    }
    if let Some(end) = host.find(['/', '?', '#']) {
        host.truncate(end);
    }
    if let Some((name, port)) = host.rsplit_once(':') {
        if port.chars().all(|c| c.is_ascii_digit()) {
            host = name.to_string();
        }
    }
    if let Some(rest) = host.strip_prefix("www.") {
        host = rest.to_string();
    }
    let host = host.trim_end_matches('.').to_string();

    if host.is_empty() || host.split('.').any(str::is_empty) {
        return None;
    }
    Some(host)
}
