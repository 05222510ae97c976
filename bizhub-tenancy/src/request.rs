//! Request bootstrap data
//!
//! [`RequestInfo`] carries the parts of an inbound request that can name a
//! tenant. It is transport-neutral: an HTTP adapter fills it from its own
//! request type and hands it to [`crate::TenantContext::initialize`].

use std::collections::HashMap;

/// Claim carrying the tenant identifier.
pub const TENANT_CLAIM: &str = "tenant_id";

/// Route value and query parameter naming the tenant.
pub const TENANT_PARAM: &str = "tenant";

/// Authenticated caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    email: String,
    claims: HashMap<String, String>,
}

impl Principal {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into().trim().to_ascii_lowercase(),
            claims: HashMap::new(),
        }
    }

    pub fn with_claim(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.claims.insert(name.into(), value.into());
        self
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn claim(&self, name: &str) -> Option<&str> {
        self.claims.get(name).map(String::as_str)
    }

    pub fn tenant_claim(&self) -> Option<&str> {
        self.claim(TENANT_CLAIM).filter(|v| !v.trim().is_empty())
    }
}

/// Inbound request, reduced to what tenant bootstrap needs
#[derive(Debug, Clone, Default)]
pub struct RequestInfo {
    headers: HashMap<String, String>,
    host: Option<String>,
    route_values: HashMap<String, String>,
    query: HashMap<String, String>,
    principal: Option<Principal>,
}

impl RequestInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Header names are case-insensitive.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_route_value(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.route_values.insert(name.into(), value.into());
        self
    }

    pub fn with_query_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    /// Parse `a=b&c=d`. Values are taken verbatim.
    pub fn with_query_string(mut self, raw: &str) -> Self {
        for pair in raw.trim_start_matches('?').split('&') {
            if let Some((k, v)) = pair.split_once('=') {
                if !k.is_empty() {
                    self.query.insert(k.to_string(), v.to_string());
                }
            }
        }
        self
    }

    pub fn with_principal(mut self, principal: Principal) -> Self {
        self.principal = Some(principal);
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    /// Explicit host, or the `Host` header.
    pub fn host(&self) -> Option<&str> {
        self.host.as_deref().or_else(|| self.header("host"))
    }

    pub fn route_value(&self, name: &str) -> Option<&str> {
        self.route_values
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headers_case_insensitive() {
        let request = RequestInfo::new().with_header("X-Tenant-Id", "tenant:ACME");
        assert_eq!(request.header("x-tenant-id"), Some("tenant:ACME"));
        assert_eq!(request.header("X-TENANT-ID"), Some("tenant:ACME"));
    }

    #[test]
    fn test_host_falls_back_to_header() {
        let request = RequestInfo::new().with_header("Host", "acme.bizhub.io");
        assert_eq!(request.host(), Some("acme.bizhub.io"));

        let request = request.with_host("globex.bizhub.io");
        assert_eq!(request.host(), Some("globex.bizhub.io"));
    }

    #[test]
    fn test_query_string() {
        let request = RequestInfo::new().with_query_string("?tenant=acme&page=2&bad");
        assert_eq!(request.query_param("tenant"), Some("acme"));
        assert_eq!(request.query_param("page"), Some("2"));
        assert_eq!(request.query_param("bad"), None);
    }

    #[test]
    fn test_blank_values_ignored() {
        let request = RequestInfo::new()
            .with_header("X-Tenant-Id", "  ")
            .with_route_value("tenant", "");
        assert!(request.header("x-tenant-id").is_none());
        assert!(request.route_value("tenant").is_none());
    }

    #[test]
    fn test_principal_claims() {
        let principal = Principal::new("Jane@Acme.com").with_claim(TENANT_CLAIM, "7");
        assert_eq!(principal.email(), "jane@acme.com");
        assert_eq!(principal.tenant_claim(), Some("7"));
        assert!(Principal::new("x@y.z").tenant_claim().is_none());
    }
}
