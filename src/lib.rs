// bizhub - multi-tenant core of a modular business platform
//
// Re-exports the member crates and owns process-level logging setup.

pub mod logging;

pub use bizhub_domain as domain;
pub use bizhub_tenancy as tenancy;

pub use bizhub_domain::{DateRange, DomainError, Money, Quantity};
pub use bizhub_tenancy::{
    TenancyConfig, Tenant, TenantContext, TenantDatabaseService, TenantError, TenantResolver,
    TenantResult, TenantService,
};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::logging::{LogConfig, LogFormat, LogLevel, LogOutput};
    pub use bizhub_domain::prelude::*;
    pub use bizhub_tenancy::prelude::*;
}
