//! Tenant aggregate
//!
//! A [`Tenant`] changes only through named transitions. Each transition
//! takes an [`AuditStamp`] and records who changed the tenant and when.

use crate::code::TenantCode;
use crate::database_info::DatabaseInfo;
use crate::error::{TenantError, TenantResult};
use crate::settings::TenantSettings;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Numeric tenant identifier
pub type TenantId = i64;

/// Actor name used for changes made by background processes.
pub const SYSTEM_ACTOR: &str = "system";

/// Tenant status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    /// Registered, database not provisioned yet
    #[default]
    Pending,
    /// Operational
    Active,
    /// Deactivated, database removed or never usable
    Inactive,
    /// Temporarily blocked (billing, failed health check)
    Suspended,
    /// Permanently closed
    Terminated,
}

impl fmt::Display for TenantStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Active => write!(f, "active"),
            Self::Inactive => write!(f, "inactive"),
            Self::Suspended => write!(f, "suspended"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// Who changed a tenant, and when.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditStamp {
    pub actor: String,
    pub at: DateTime<Utc>,
}

impl AuditStamp {
    pub fn new(actor: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            actor: actor.into(),
            at,
        }
    }

    pub fn system(at: DateTime<Utc>) -> Self {
        Self::new(SYSTEM_ACTOR, at)
    }
}

/// Resource quotas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantQuotas {
    /// Maximum number of active users
    pub max_users: u32,
    /// Maximum storage in bytes
    pub max_storage_bytes: u64,
    /// Maximum number of active module subscriptions
    pub max_modules: u32,
}

impl Default for TenantQuotas {
    fn default() -> Self {
        Self {
            max_users: 5,
            max_storage_bytes: 1024 * 1024 * 1024, // 1GB
            max_modules: 3,
        }
    }
}

impl TenantQuotas {
    pub fn validate(&self) -> TenantResult<()> {
        if self.max_users == 0 || self.max_modules == 0 || self.max_storage_bytes == 0 {
            return Err(TenantError::Validation(
                "quotas must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// One customer organisation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tenant {
    id: TenantId,
    name: String,
    code: TenantCode,
    status: TenantStatus,
    database_info: Option<DatabaseInfo>,
    settings: Option<TenantSettings>,
    quotas: TenantQuotas,
    contact_email: Option<String>,
    created_at: DateTime<Utc>,
    created_by: String,
    updated_at: DateTime<Utc>,
    updated_by: String,
    deactivated_at: Option<DateTime<Utc>>,
    deactivation_reason: Option<String>,
}

impl Tenant {
    /// Register a new tenant in [`TenantStatus::Pending`].
    ///
    /// ```
    /// use bizhub_tenancy::{AuditStamp, Tenant, TenantCode, TenantStatus};
    /// use chrono::Utc;
    ///
    /// let code = TenantCode::parse("ACME").unwrap();
    /// let tenant = Tenant::new(7, "Acme Corp", code, &AuditStamp::system(Utc::now())).unwrap();
    /// assert_eq!(tenant.status(), TenantStatus::Pending);
    /// assert!(tenant.database_info().is_none());
    /// ```
    pub fn new(
        id: TenantId,
        name: impl Into<String>,
        code: TenantCode,
        stamp: &AuditStamp,
    ) -> TenantResult<Self> {
        let name = name.into().trim().to_string();
        if name.is_empty() || name.len() > 200 {
            return Err(TenantError::Validation(
                "tenant name must be 1-200 characters".to_string(),
            ));
        }

        Ok(Self {
            id,
            name,
            code,
            status: TenantStatus::Pending,
            database_info: None,
            settings: None,
            quotas: TenantQuotas::default(),
            contact_email: None,
            created_at: stamp.at,
            created_by: stamp.actor.clone(),
            updated_at: stamp.at,
            updated_by: stamp.actor.clone(),
            deactivated_at: None,
            deactivation_reason: None,
        })
    }

    pub fn id(&self) -> TenantId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn code(&self) -> &TenantCode {
        &self.code
    }

    pub fn status(&self) -> TenantStatus {
        self.status
    }

    pub fn is_active(&self) -> bool {
        self.status == TenantStatus::Active
    }

    pub fn database_info(&self) -> Option<&DatabaseInfo> {
        self.database_info.as_ref()
    }

    pub fn settings(&self) -> Option<&TenantSettings> {
        self.settings.as_ref()
    }

    pub fn quotas(&self) -> &TenantQuotas {
        &self.quotas
    }

    pub fn contact_email(&self) -> Option<&str> {
        self.contact_email.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn created_by(&self) -> &str {
        &self.created_by
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn updated_by(&self) -> &str {
        &self.updated_by
    }

    pub fn deactivated_at(&self) -> Option<DateTime<Utc>> {
        self.deactivated_at
    }

    pub fn deactivation_reason(&self) -> Option<&str> {
        self.deactivation_reason.as_deref()
    }

    fn touch(&mut self, stamp: &AuditStamp) {
        self.updated_at = stamp.at;
        self.updated_by = stamp.actor.clone();
    }

    fn ensure_not_terminated(&self, action: &str) -> TenantResult<()> {
        if self.status == TenantStatus::Terminated {
            return Err(TenantError::PreconditionFailed(format!(
                "cannot {action} terminated tenant {}",
                self.code
            )));
        }
        Ok(())
    }

    pub fn set_contact_email(&mut self, email: Option<String>, stamp: &AuditStamp) -> TenantResult<()> {
        if let Some(email) = &email {
            if !email.contains('@') {
                return Err(TenantError::Validation(format!("invalid email '{email}'")));
            }
        }
        self.contact_email = email.map(|e| e.trim().to_ascii_lowercase());
        self.touch(stamp);
        Ok(())
    }

    /// Move to [`TenantStatus::Active`]. Requires a provisioned database.
    pub fn activate(&mut self, stamp: &AuditStamp) -> TenantResult<()> {
        self.ensure_not_terminated("activate")?;
        if self.status == TenantStatus::Active {
            return Ok(());
        }
        if self.database_info.is_none() {
            return Err(TenantError::PreconditionFailed(format!(
                "tenant {} has no database",
                self.code
            )));
        }
        self.status = TenantStatus::Active;
        self.deactivated_at = None;
        self.deactivation_reason = None;
        self.touch(stamp);
        Ok(())
    }

    /// Temporarily block an active tenant.
    pub fn suspend(&mut self, reason: impl Into<String>, stamp: &AuditStamp) -> TenantResult<()> {
        match self.status {
            TenantStatus::Suspended => Ok(()),
            TenantStatus::Active => {
                self.status = TenantStatus::Suspended;
                self.deactivated_at = Some(stamp.at);
                self.deactivation_reason = Some(reason.into());
                self.touch(stamp);
                Ok(())
            }
            other => Err(TenantError::PreconditionFailed(format!(
                "cannot suspend {other} tenant {}",
                self.code
            ))),
        }
    }

    pub fn deactivate(&mut self, reason: impl Into<String>, stamp: &AuditStamp) -> TenantResult<()> {
        self.ensure_not_terminated("deactivate")?;
        self.status = TenantStatus::Inactive;
        self.deactivated_at = Some(stamp.at);
        self.deactivation_reason = Some(reason.into());
        self.touch(stamp);
        Ok(())
    }

    pub fn terminate(&mut self, reason: impl Into<String>, stamp: &AuditStamp) -> TenantResult<()> {
        self.ensure_not_terminated("terminate")?;
        self.status = TenantStatus::Terminated;
        self.deactivated_at = Some(stamp.at);
        self.deactivation_reason = Some(reason.into());
        self.touch(stamp);
        Ok(())
    }

    pub fn attach_database(&mut self, info: DatabaseInfo, stamp: &AuditStamp) -> TenantResult<()> {
        self.ensure_not_terminated("attach a database to")?;
        self.database_info = Some(info);
        self.touch(stamp);
        Ok(())
    }

    pub fn clear_database(&mut self, stamp: &AuditStamp) {
        self.database_info = None;
        self.touch(stamp);
    }

    /// Replace maintenance metadata of the attached database.
    ///
    /// `info` must describe the same database (identity equality).
    pub fn record_maintenance(&mut self, info: DatabaseInfo, stamp: &AuditStamp) -> TenantResult<()> {
        match &self.database_info {
            Some(current) if *current == info => {
                self.database_info = Some(info);
                self.touch(stamp);
                Ok(())
            }
            Some(current) => Err(TenantError::PreconditionFailed(format!(
                "database '{}' is not attached to tenant {} (found '{}')",
                info.database_name(),
                self.code,
                current.database_name()
            ))),
            None => Err(TenantError::PreconditionFailed(format!(
                "tenant {} has no database",
                self.code
            ))),
        }
    }

    pub fn apply_settings(&mut self, settings: TenantSettings, stamp: &AuditStamp) -> TenantResult<()> {
        self.ensure_not_terminated("configure")?;
        self.settings = Some(settings);
        self.touch(stamp);
        Ok(())
    }

    pub fn change_quotas(&mut self, quotas: TenantQuotas, stamp: &AuditStamp) -> TenantResult<()> {
        self.ensure_not_terminated("change quotas of")?;
        quotas.validate()?;
        self.quotas = quotas;
        self.touch(stamp);
        Ok(())
    }
}

/// Member of a tenant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantUser {
    pub id: i64,
    pub tenant_id: TenantId,
    /// Stored lower-cased
    pub email: String,
    pub display_name: String,
    pub is_active: bool,
}

impl TenantUser {
    pub fn new(
        id: i64,
        tenant_id: TenantId,
        email: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            id,
            tenant_id,
            email: email.into().trim().to_ascii_lowercase(),
            display_name: display_name.into(),
            is_active: true,
        }
    }

    pub fn with_active(mut self, active: bool) -> Self {
        self.is_active = active;
        self
    }

    pub fn email_matches(&self, email: &str) -> bool {
        self.email.eq_ignore_ascii_case(email.trim())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Cancelled,
    Expired,
}

/// A tenant's subscription to a business module (CRM, inventory, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleSubscription {
    pub id: i64,
    pub tenant_id: TenantId,
    pub module_code: String,
    pub status: SubscriptionStatus,
    pub started_at: DateTime<Utc>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<String>,
}

impl ModuleSubscription {
    pub fn new(
        id: i64,
        tenant_id: TenantId,
        module_code: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            tenant_id,
            module_code: module_code.into(),
            status: SubscriptionStatus::Active,
            started_at,
            cancelled_at: None,
            cancellation_reason: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == SubscriptionStatus::Active
    }

    /// Cancel an active subscription. Returns false if it was not active.
    pub fn cancel(&mut self, reason: impl Into<String>, at: DateTime<Utc>) -> bool {
        if !self.is_active() {
            return false;
        }
        self.status = SubscriptionStatus::Cancelled;
        self.cancelled_at = Some(at);
        self.cancellation_reason = Some(reason.into());
        true
    }
}

/// Request to register a new tenant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTenant {
    pub code: String,
    pub name: String,
    pub contact_email: Option<String>,
    pub quotas: Option<TenantQuotas>,
    pub settings: Option<TenantSettings>,
}

impl NewTenant {
    pub fn new(code: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            name: name.into(),
            contact_email: None,
            quotas: None,
            settings: None,
        }
    }

    pub fn with_contact_email(mut self, email: impl Into<String>) -> Self {
        self.contact_email = Some(email.into());
        self
    }

    pub fn with_quotas(mut self, quotas: TenantQuotas) -> Self {
        self.quotas = Some(quotas);
        self
    }

    pub fn with_settings(mut self, settings: TenantSettings) -> Self {
        self.settings = Some(settings);
        self
    }
}
