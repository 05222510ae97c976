//! Connection string builder and parser
//!
//! `key=value` pairs separated by `;`. Keys are case-insensitive and the
//! usual aliases (`Data Source`/`Server`, `Initial Catalog`/`Database`,
//! `UID`/`User Id`, `PWD`/`Password`) address the same entry. Values are not
//! quoted, so generated secrets never contain `;` or `=`.

use crate::error::{TenantError, TenantResult};
use std::fmt;

const SERVER: &str = "Server";
const DATABASE: &str = "Database";
const USER_ID: &str = "User Id";
const PASSWORD: &str = "Password";
const TRUST_SERVER_CERTIFICATE: &str = "TrustServerCertificate";

fn canonical(key: &str) -> String {
    let lower = key.trim().to_ascii_lowercase();
    match lower.as_str() {
        "data source" | "address" | "addr" | "server" => "server".to_string(),
        "initial catalog" | "database" => "database".to_string(),
        "uid" | "user" | "user id" => "user id".to_string(),
        "pwd" | "password" => "password".to_string(),
        "trust server certificate" | "trustservercertificate" => {
            "trustservercertificate".to_string()
        }
        _ => lower,
    }
}

/// Ordered set of connection properties.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionString {
    pairs: Vec<(String, String)>,
}

impl ConnectionString {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `key=value;key=value`. Empty segments are ignored.
    pub fn parse(raw: &str) -> TenantResult<Self> {
        let mut parsed = Self::new();
        for segment in raw.split(';') {
            let segment = segment.trim();
            if segment.is_empty() {
                continue;
            }
            let (key, value) = segment.split_once('=').ok_or_else(|| {
                TenantError::Validation(format!("malformed connection string segment '{segment}'"))
            })?;
            if key.trim().is_empty() {
                return Err(TenantError::Validation(
                    "connection string segment has an empty key".to_string(),
                ));
            }
            parsed.insert(key.trim(), value.trim());
        }
        Ok(parsed)
    }

    fn insert(&mut self, key: &str, value: &str) {
        let wanted = canonical(key);
        match self.pairs.iter_mut().find(|(k, _)| canonical(k) == wanted) {
            Some(entry) => entry.1 = value.to_string(),
            None => self.pairs.push((key.to_string(), value.to_string())),
        }
    }

    /// Set a property, replacing any alias already present.
    #[must_use]
    pub fn set(mut self, key: &str, value: impl fmt::Display) -> Self {
        self.insert(key, &value.to_string());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        let wanted = canonical(key);
        self.pairs
            .iter()
            .find(|(k, _)| canonical(k) == wanted)
            .map(|(_, v)| v.as_str())
    }

    #[must_use]
    pub fn with_server(self, server: &str, port: u16) -> Self {
        self.set(SERVER, format!("{server},{port}"))
    }

    #[must_use]
    pub fn with_database(self, database: &str) -> Self {
        self.set(DATABASE, database)
    }

    #[must_use]
    pub fn with_credentials(self, user: &str, password: &str) -> Self {
        self.set(USER_ID, user).set(PASSWORD, password)
    }

    #[must_use]
    pub fn with_trust_server_certificate(self, trust: bool) -> Self {
        self.set(TRUST_SERVER_CERTIFICATE, if trust { "True" } else { "False" })
    }

    pub fn server(&self) -> Option<&str> {
        self.get(SERVER)
    }

    pub fn database(&self) -> Option<&str> {
        self.get(DATABASE)
    }

    pub fn user_id(&self) -> Option<&str> {
        self.get(USER_ID)
    }

    pub fn trust_server_certificate(&self) -> bool {
        self.get(TRUST_SERVER_CERTIFICATE)
            .is_some_and(|v| v.eq_ignore_ascii_case("true") || v.eq_ignore_ascii_case("yes"))
    }

    /// Rendering with the password masked, for logs.
    pub fn redacted(&self) -> String {
        self.pairs
            .iter()
            .map(|(k, v)| {
                if canonical(k) == "password" {
                    format!("{k}=******")
                } else {
                    format!("{k}={v}")
                }
            })
            .collect::<Vec<_>>()
            .join(";")
    }
}

impl fmt::Display for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered = self
            .pairs
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(";");
        f.write_str(&rendered)
    }
}
