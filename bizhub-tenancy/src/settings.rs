//! Per-tenant configuration snapshot
//!
//! [`TenantSettings`] is immutable. Updates go through
//! [`TenantSettings::to_builder`] or [`TenantSettings::with_module_setting`],
//! both of which validate and return a new instance.
//!
//! Module settings are a typed map keyed `"{module}.{key}"` whose values are
//! a narrow [`SettingValue`] variant instead of untyped objects.

use crate::error::{TenantError, TenantResult};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

static LOCALE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z]{2,3}(-[A-Z]{2})?$").unwrap());

static TIMEZONE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(UTC|[A-Z][A-Za-z_]+(/[A-Za-z0-9_+\-]+){1,2})$").unwrap());

static MODULE_CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_]{0,31}$").unwrap());

static SETTING_KEY: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]{0,63}$").unwrap());

static HEX_COLOR: Lazy<Regex> = Lazy::new(|| Regex::new(r"^#[0-9A-Fa-f]{6}$").unwrap());

/// Module owning cross-cutting settings such as the custom domain.
pub const SYSTEM_MODULE: &str = "system";

/// Key of the custom-domain setting under [`SYSTEM_MODULE`].
pub const CUSTOM_DOMAIN_KEY: &str = "customDomain";

/// Value of a module setting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum SettingValue {
    Text(String),
    Number(f64),
    Flag(bool),
    /// Opaque payload for settings without a dedicated variant
    Json(serde_json::Value),
}

impl SettingValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_flag(&self) -> Option<bool> {
        match self {
            Self::Flag(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<&str> for SettingValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for SettingValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<bool> for SettingValue {
    fn from(value: bool) -> Self {
        Self::Flag(value)
    }
}

impl From<f64> for SettingValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<serde_json::Value> for SettingValue {
    fn from(value: serde_json::Value) -> Self {
        Self::Json(value)
    }
}

/// Security thresholds applied to the tenant's users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityPolicy {
    /// Minimum password length (8..=128)
    pub password_min_length: u8,
    /// Failed logins before lockout (1..=100)
    pub max_failed_logins: u32,
    /// Idle session timeout in minutes (5..=1440)
    pub session_timeout_minutes: u32,
    pub require_two_factor: bool,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            password_min_length: 8,
            max_failed_logins: 5,
            session_timeout_minutes: 30,
            require_two_factor: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Theme {
    #[default]
    Light,
    Dark,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UiPreferences {
    pub theme: Theme,
    /// Rows per page in list views (10..=200)
    pub items_per_page: u32,
    /// `#RRGGBB`
    pub primary_color: Option<String>,
}

impl Default for UiPreferences {
    fn default() -> Self {
        Self {
            theme: Theme::Light,
            items_per_page: 25,
            primary_color: None,
        }
    }
}

/// Tenant configuration snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantSettings {
    timezone: String,
    locale: String,
    currency: String,
    date_format: String,
    security: SecurityPolicy,
    ui: UiPreferences,
    module_settings: BTreeMap<String, SettingValue>,
}

impl Default for TenantSettings {
    fn default() -> Self {
        Self {
            timezone: "UTC".to_string(),
            locale: "en-US".to_string(),
            currency: "USD".to_string(),
            date_format: "yyyy-MM-dd".to_string(),
            security: SecurityPolicy::default(),
            ui: UiPreferences::default(),
            module_settings: BTreeMap::new(),
        }
    }
}

impl TenantSettings {
    pub fn builder() -> TenantSettingsBuilder {
        TenantSettingsBuilder {
            settings: Self::default(),
        }
    }

    /// Builder seeded with this snapshot.
    pub fn to_builder(&self) -> TenantSettingsBuilder {
        TenantSettingsBuilder {
            settings: self.clone(),
        }
    }

    pub fn timezone(&self) -> &str {
        &self.timezone
    }

    pub fn locale(&self) -> &str {
        &self.locale
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    pub fn date_format(&self) -> &str {
        &self.date_format
    }

    pub fn security(&self) -> &SecurityPolicy {
        &self.security
    }

    pub fn ui(&self) -> &UiPreferences {
        &self.ui
    }

    pub fn module_setting(&self, module: &str, key: &str) -> Option<&SettingValue> {
        self.module_settings.get(&setting_key(module, key))
    }

    /// All settings of one module as `(key, value)` pairs.
    pub fn module_settings(&self, module: &str) -> impl Iterator<Item = (&str, &SettingValue)> {
        let prefix = format!("{module}.");
        self.module_settings.iter().filter_map(move |(k, v)| {
            k.strip_prefix(prefix.as_str()).map(|key| (key, v))
        })
    }

    /// Custom domain the tenant is reachable on, if configured.
    pub fn custom_domain(&self) -> Option<&str> {
        self.module_setting(SYSTEM_MODULE, CUSTOM_DOMAIN_KEY)
            .and_then(SettingValue::as_text)
    }

    /// Copy with one module setting added or replaced.
    pub fn with_module_setting(
        &self,
        module: &str,
        key: &str,
        value: impl Into<SettingValue>,
    ) -> TenantResult<TenantSettings> {
        self.to_builder().module_setting(module, key, value).build()
    }

    /// Copy without the given module setting.
    #[must_use]
    pub fn without_module_setting(&self, module: &str, key: &str) -> TenantSettings {
        let mut next = self.clone();
        next.module_settings.remove(&setting_key(module, key));
        next
    }
}

fn setting_key(module: &str, key: &str) -> String {
    format!("{module}.{key}")
}

/// Validating factory for [`TenantSettings`].
#[derive(Debug, Clone)]
pub struct TenantSettingsBuilder {
    settings: TenantSettings,
}

impl TenantSettingsBuilder {
    pub fn timezone(mut self, timezone: impl Into<String>) -> Self {
        self.settings.timezone = timezone.into();
        self
    }

    pub fn locale(mut self, locale: impl Into<String>) -> Self {
        self.settings.locale = locale.into();
        self
    }

    pub fn currency(mut self, currency: impl Into<String>) -> Self {
        self.settings.currency = currency.into().trim().to_ascii_uppercase();
        self
    }

    pub fn date_format(mut self, format: impl Into<String>) -> Self {
        self.settings.date_format = format.into();
        self
    }

    pub fn security(mut self, security: SecurityPolicy) -> Self {
        self.settings.security = security;
        self
    }

    pub fn ui(mut self, ui: UiPreferences) -> Self {
        self.settings.ui = ui;
        self
    }

    pub fn custom_domain(self, domain: impl Into<String>) -> Self {
        let domain = domain.into().trim().to_ascii_lowercase();
        self.module_setting(SYSTEM_MODULE, CUSTOM_DOMAIN_KEY, domain)
    }

    /// Stage a module setting. Module and key are validated in `build`.
    pub fn module_setting(mut self, module: &str, key: &str, value: impl Into<SettingValue>) -> Self {
        self.settings
            .module_settings
            .insert(setting_key(module, key), value.into());
        self
    }

    pub fn build(self) -> TenantResult<TenantSettings> {
        let s = self.settings;

        if !TIMEZONE.is_match(&s.timezone) {
            return Err(invalid(format!("unknown timezone '{}'", s.timezone)));
        }
        if !LOCALE.is_match(&s.locale) {
            return Err(invalid(format!("invalid locale '{}'", s.locale)));
        }
        if s.currency.len() != 3 || !s.currency.chars().all(|c| c.is_ascii_uppercase()) {
            return Err(invalid(format!("invalid currency '{}'", s.currency)));
        }
        if s.date_format.trim().is_empty() {
            return Err(invalid("date format is required"));
        }

        let sec = &s.security;
        if !(8..=128).contains(&sec.password_min_length) {
            return Err(invalid("password minimum length must be between 8 and 128"));
        }
        if !(1..=100).contains(&sec.max_failed_logins) {
            return Err(invalid("max failed logins must be between 1 and 100"));
        }
        if !(5..=1440).contains(&sec.session_timeout_minutes) {
            return Err(invalid("session timeout must be between 5 and 1440 minutes"));
        }

        if !(10..=200).contains(&s.ui.items_per_page) {
            return Err(invalid("items per page must be between 10 and 200"));
        }
        if let Some(color) = &s.ui.primary_color {
            if !HEX_COLOR.is_match(color) {
                return Err(invalid(format!("invalid color '{color}'")));
            }
        }

        for (full_key, value) in &s.module_settings {
            let (module, key) = full_key
                .split_once('.')
                .ok_or_else(|| invalid(format!("setting key '{full_key}' has no module")))?;
            if !MODULE_CODE.is_match(module) {
                return Err(invalid(format!("invalid module code '{module}'")));
            }
            if !SETTING_KEY.is_match(key) {
                return Err(invalid(format!("invalid setting key '{key}'")));
            }
            if let SettingValue::Number(n) = value {
                if !n.is_finite() {
                    return Err(invalid(format!("setting '{full_key}' is not a finite number")));
                }
            }
        }

        Ok(s)
    }
}

fn invalid(message: impl Into<String>) -> TenantError {
    TenantError::Validation(message.into())
}

impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => f.write_str(s),
            Self::Number(n) => write!(f, "{n}"),
            Self::Flag(b) => write!(f, "{b}"),
            Self::Json(v) => write!(f, "{v}"),
        }
    }
}
