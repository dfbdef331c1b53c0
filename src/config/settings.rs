//! Client settings (TOML)

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::errors::{Error, Result};

/// Client-wide settings shared by every strategy and cache of one client
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Timeout applied to each decorated request
    #[serde(deserialize_with = "duration")]
    pub request_timeout: Duration,
    /// Upper bound for one complete handshake or token exchange
    #[serde(deserialize_with = "duration")]
    pub handshake_timeout: Duration,
    /// Request digests are refreshed this long before they expire
    #[serde(deserialize_with = "duration")]
    pub digest_safety_margin: Duration,
    /// TCP connect timeout
    #[serde(deserialize_with = "duration")]
    pub connect_timeout: Duration,
    pub user_agent: String,
    /// Create missing parent directories when writing a config file
    pub create_dirs: bool,
    /// Refuse to fall back to the strategy default key
    pub require_master_key: bool,
    /// Verify server certificates
    pub verify_tls: bool,
    /// Extra CA bundle (PEM) trusted in addition to the system roots
    pub ca_bundle: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(60),
            handshake_timeout: Duration::from_secs(30),
            digest_safety_margin: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            user_agent: concat!("collabauth/", env!("CARGO_PKG_VERSION")).to_string(),
            create_dirs: true,
            require_master_key: false,
            verify_tls: true,
            ca_bundle: None,
        }
    }
}

impl Settings {
    /// Parse settings from TOML; missing keys take their defaults
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Settings(format!("invalid settings TOML: {}", e)))
    }

    /// Load settings from a TOML file, or defaults if the file does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Settings(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }
}

/// Accept humantime strings ("30s", "2m 10s") or plain seconds
fn duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
        Raw::Text(text) => humantime::parse_duration(&text).map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.digest_safety_margin, Duration::from_secs(30));
        assert!(settings.create_dirs);
        assert!(!settings.require_master_key);
        assert!(settings.user_agent.starts_with("collabauth/"));
    }

    #[test]
    fn test_parse_partial_toml() {
        let settings = Settings::from_toml_str(
            r#"
            handshake_timeout = "5s"
            digest_safety_margin = 45
            require_master_key = true
            "#,
        )
        .unwrap();

        assert_eq!(settings.handshake_timeout, Duration::from_secs(5));
        assert_eq!(settings.digest_safety_margin, Duration::from_secs(45));
        assert!(settings.require_master_key);
        assert_eq!(settings.request_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_humantime_compound() {
        let settings = Settings::from_toml_str(r#"request_timeout = "1m 30s""#).unwrap();
        assert_eq!(settings.request_timeout, Duration::from_secs(90));
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = Settings::from_toml_str("retries = 3").unwrap_err();
        assert!(matches!(err, Error::Settings(_)));
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(settings.connect_timeout, Duration::from_secs(10));
    }
}
