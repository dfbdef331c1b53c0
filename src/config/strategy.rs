//! Strategy configuration: named string fields owned by one auth strategy

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

/// Well-known field names
pub mod fields {
    pub const SITE_URL: &str = "siteUrl";
    pub const USERNAME: &str = "username";
    pub const PASSWORD: &str = "password";
    pub const DOMAIN: &str = "domain";
    pub const WORKSTATION: &str = "workstation";
    pub const CLIENT_ID: &str = "clientId";
    pub const CLIENT_SECRET: &str = "clientSecret";
    pub const REALM: &str = "realm";
    pub const TOKEN_URL: &str = "tokenUrl";
    pub const CERT_PATH: &str = "certPath";
    pub const KEY_PATH: &str = "keyPath";

    /// Fields whose values are redacted from debug output
    pub(crate) const SECRETS: &[&str] = &[PASSWORD, CLIENT_SECRET];
}

/// Credential configuration for one strategy
///
/// Fields are plain strings keyed by name. No field is mandatory at
/// construction or load time; each strategy checks what it needs when it
/// authenticates.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyConfig {
    strategy: String,
    #[serde(default)]
    fields: BTreeMap<String, String>,
}

impl StrategyConfig {
    pub fn new(strategy: impl Into<String>) -> Self {
        Self {
            strategy: strategy.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style setter
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(name, value);
        self
    }

    pub fn strategy(&self) -> &str {
        &self.strategy
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Get a field the named strategy cannot work without
    pub fn require(&self, strategy: &'static str, name: &'static str) -> Result<&str> {
        self.get(name).ok_or(Error::MissingField {
            strategy,
            field: name,
        })
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(name.into(), value.into());
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.fields.remove(name)
    }

    /// Site URL without a trailing slash
    pub fn site_url(&self) -> &str {
        self.get(fields::SITE_URL)
            .map(|u| u.trim_end_matches('/'))
            .unwrap_or("")
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }
}

impl fmt::Debug for StrategyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redacted: BTreeMap<&str, &str> = self
            .fields
            .iter()
            .map(|(k, v)| {
                let shown = if fields::SECRETS.contains(&k.as_str()) { "***" } else { v.as_str() };
                (k.as_str(), shown)
            })
            .collect();

        f.debug_struct("StrategyConfig")
            .field("strategy", &self.strategy)
            .field("fields", &redacted)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_site_url_trims_trailing_slash() {
        let config = StrategyConfig::new("ntlm").with(fields::SITE_URL, "https://contoso.local/sites/dev/");
        assert_eq!(config.site_url(), "https://contoso.local/sites/dev");
    }

    #[test]
    fn test_empty_value_is_missing() {
        let config = StrategyConfig::new("ntlm").with(fields::USERNAME, "");
        assert_eq!(config.get(fields::USERNAME), None);

        let err = config.require("ntlm", fields::USERNAME).unwrap_err();
        assert_eq!(
            err,
            Error::MissingField { strategy: "ntlm", field: fields::USERNAME }
        );
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = StrategyConfig::new("app-only")
            .with(fields::CLIENT_ID, "abc")
            .with(fields::CLIENT_SECRET, "s3cr3t")
            .with(fields::PASSWORD, "hunter2");

        let shown = format!("{:?}", config);
        assert!(shown.contains("abc"));
        assert!(!shown.contains("s3cr3t"));
        assert!(!shown.contains("hunter2"));
    }

    #[test]
    fn test_set_and_remove() {
        let mut config = StrategyConfig::new("forms");
        config.set(fields::USERNAME, "alice");
        assert_eq!(config.get(fields::USERNAME), Some("alice"));
        assert_eq!(config.remove(fields::USERNAME).as_deref(), Some("alice"));
        assert_eq!(config.field_names().count(), 0);
    }
}
