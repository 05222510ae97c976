//! Tenant codes

use crate::error::{TenantError, TenantResult};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

static CODE_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Z][A-Z0-9]{2,9}$").unwrap());

/// Natural external identifier of a tenant.
///
/// Upper-case alphanumeric, 3 to 10 characters, starting with a letter.
/// Input is trimmed and upper-cased before validation.
///
/// ```
/// use bizhub_tenancy::TenantCode;
///
/// let code = TenantCode::parse(" acme ").unwrap();
/// assert_eq!(code.as_str(), "ACME");
/// assert!(TenantCode::parse("1ACME").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantCode(String);

impl TenantCode {
    pub fn parse(raw: &str) -> TenantResult<Self> {
        let normalized = raw.trim().to_ascii_uppercase();
        if !CODE_PATTERN.is_match(&normalized) {
            return Err(TenantError::Validation(format!(
                "tenant code '{}' must be 3-10 upper-case letters or digits starting with a letter",
                raw.trim()
            )));
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Lower-cased form used as a cache key.
    pub fn cache_form(&self) -> String {
        self.0.to_ascii_lowercase()
    }
}

impl fmt::Display for TenantCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TenantCode {
    type Err = TenantError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for TenantCode {
    type Error = TenantError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TenantCode> for String {
    fn from(code: TenantCode) -> Self {
        code.0
    }
}

impl AsRef<str> for TenantCode {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalizes_case() {
        assert_eq!(TenantCode::parse("acme").unwrap().as_str(), "ACME");
        assert_eq!(TenantCode::parse("Acme42").unwrap().to_string(), "ACME42");
    }

    #[test]
    fn test_length_bounds() {
        assert!(TenantCode::parse("AB").is_err());
        assert!(TenantCode::parse("ABC").is_ok());
        assert!(TenantCode::parse("ABCDEFGHIJ").is_ok());
        assert!(TenantCode::parse("ABCDEFGHIJK").is_err());
    }

    #[test]
    fn test_must_start_with_letter() {
        assert!(TenantCode::parse("9ACME").is_err());
        assert!(TenantCode::parse("A9CME").is_ok());
    }

    #[test]
    fn test_rejects_symbols() {
        assert!(TenantCode::parse("AC-ME").is_err());
        assert!(TenantCode::parse("AC ME").is_err());
        assert!(TenantCode::parse("ACMÉ").is_err());
    }

    #[test]
    fn test_serde_validates() {
        let code: TenantCode = serde_json::from_str("\"globex\"").unwrap();
        assert_eq!(code.as_str(), "GLOBEX");
        assert!(serde_json::from_str::<TenantCode>("\"x\"").is_err());
    }

    #[test]
    fn test_cache_form() {
        assert_eq!(TenantCode::parse("ACME").unwrap().cache_form(), "acme");
    }
}
