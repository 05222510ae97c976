//! Tenancy error taxonomy
//!
//! Callers (and the resilience wrapper) branch on [`ErrorKind`] instead of
//! matching message strings. Failures that happen after a side effect was
//! performed are wrapped in [`TenantError::ProvisioningFailed`], which keeps
//! the original error as its source and records what compensation ran.

use crate::tenant::TenantId;
use serde::Serialize;
use std::fmt;

/// Coarse classification of a [`TenantError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Tenant, database or backup file does not exist
    NotFound,
    /// Operation refused before any side effect (code mismatch, quota, ...)
    PreconditionFailed,
    /// Malformed input (bad code, bad server name, ...)
    Validation,
    /// Engine, store or filesystem failure
    Infrastructure,
    /// Caller cancelled the operation
    Cancelled,
    /// Circuit breaker is open
    ServiceUnavailable,
}

/// Step category of a multi-step lifecycle operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisioningStep {
    CreateDatabase,
    CreateLogin,
    BuildConnectionString,
    AttachDatabase,
    Commit,
    Migrate,
    Seed,
    CancelSubscriptions,
    CloseConnections,
    DropDatabase,
    DropLogin,
}

impl fmt::Display for ProvisioningStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CreateDatabase => "create-database",
            Self::CreateLogin => "create-login",
            Self::BuildConnectionString => "build-connection-string",
            Self::AttachDatabase => "attach-database",
            Self::Commit => "commit",
            Self::Migrate => "migrate",
            Self::Seed => "seed",
            Self::CancelSubscriptions => "cancel-subscriptions",
            Self::CloseConnections => "close-connections",
            Self::DropDatabase => "drop-database",
            Self::DropLogin => "drop-login",
        };
        f.write_str(name)
    }
}

/// Result of a best-effort compensating action.
///
/// Compensations never escalate their own failures; the outcome is recorded
/// so that operators and tests can see what was left behind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum CompensationOutcome {
    /// Nothing had to be undone
    NotRequired,
    /// The compensating action completed
    Succeeded,
    /// The compensating action failed; processing continued
    FailedButContinuing(String),
}

impl CompensationOutcome {
    pub fn is_clean(&self) -> bool {
        !matches!(self, Self::FailedButContinuing(_))
    }

    /// Combine two outcomes, keeping the worst one.
    #[must_use]
    pub fn and(self, other: CompensationOutcome) -> CompensationOutcome {
        match (self, other) {
            (Self::FailedButContinuing(a), Self::FailedButContinuing(b)) => {
                Self::FailedButContinuing(format!("{a}; {b}"))
            }
            (failed @ Self::FailedButContinuing(_), _) | (_, failed @ Self::FailedButContinuing(_)) => {
                failed
            }
            (Self::Succeeded, _) | (_, Self::Succeeded) => Self::Succeeded,
            _ => Self::NotRequired,
        }
    }
}

impl fmt::Display for CompensationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotRequired => write!(f, "no compensation required"),
            Self::Succeeded => write!(f, "compensation succeeded"),
            Self::FailedButContinuing(reason) => write!(f, "compensation failed: {reason}"),
        }
    }
}

/// Tenancy errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum TenantError {
    #[error("Tenant not found: {0}")]
    NotFound(String),

    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Invalid value: {0}")]
    Validation(String),

    #[error("Infrastructure failure: {message}")]
    Infrastructure { message: String, transient: bool },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Tenant {tenant_id} failed at step {step} ({compensation}): {source}")]
    ProvisioningFailed {
        tenant_id: TenantId,
        step: ProvisioningStep,
        compensation: CompensationOutcome,
        #[source]
        source: Box<TenantError>,
    },
}

impl TenantError {
    /// Permanent infrastructure failure.
    pub fn infrastructure(message: impl Into<String>) -> Self {
        Self::Infrastructure {
            message: message.into(),
            transient: false,
        }
    }

    /// Infrastructure failure worth retrying (timeout, deadlock, ...).
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Infrastructure {
            message: message.into(),
            transient: true,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::PreconditionFailed(_) => ErrorKind::PreconditionFailed,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Infrastructure { .. } => ErrorKind::Infrastructure,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::ServiceUnavailable(_) => ErrorKind::ServiceUnavailable,
            Self::ProvisioningFailed { source, .. } => source.kind(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self.root(), Self::Infrastructure { transient: true, .. })
    }

    /// The original error, unwrapping provisioning context.
    pub fn root(&self) -> &TenantError {
        match self {
            Self::ProvisioningFailed { source, .. } => source.root(),
            other => other,
        }
    }

    /// True when a side effect happened before the failure.
    pub fn is_partial(&self) -> bool {
        matches!(self, Self::ProvisioningFailed { .. })
    }
}

pub type TenantResult<T> = std::result::Result<T, TenantError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_sees_through_provisioning_context() {
        let err = TenantError::ProvisioningFailed {
            tenant_id: 7,
            step: ProvisioningStep::CreateLogin,
            compensation: CompensationOutcome::Succeeded,
            source: Box::new(TenantError::transient("login timeout")),
        };

        assert_eq!(err.kind(), ErrorKind::Infrastructure);
        assert!(err.is_transient());
        assert!(err.is_partial());
        assert!(matches!(err.root(), TenantError::Infrastructure { .. }));
        assert!(err.to_string().contains("create-login"));
    }

    #[test]
    fn test_precondition_is_not_partial() {
        let err = TenantError::PreconditionFailed("code mismatch".to_string());
        assert!(!err.is_partial());
        assert!(!err.is_transient());
        assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
    }

    #[test]
    fn test_compensation_and_keeps_worst() {
        let a = CompensationOutcome::Succeeded;
        let b = CompensationOutcome::FailedButContinuing("drop login".to_string());
        assert_eq!(a.clone().and(b.clone()), b);
        assert_eq!(
            CompensationOutcome::NotRequired.and(a.clone()),
            CompensationOutcome::Succeeded
        );
        assert!(!b.is_clean());
    }
}
