//! App-only (client credentials) authentication against the ACS token service

use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::{HeaderValue, AUTHORIZATION, WWW_AUTHENTICATE};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

use super::{site_endpoint, within_deadline, AuthSession, AuthStrategy, Decoration, StrategyCore};
use crate::client::transport::Affinity;
use crate::config::{fields, Settings, StrategyConfig};
use crate::errors::{Error, Result};

pub(crate) const ID: &str = "app-only";

const DISCOVERY_PATH: &str = "_vti_bin/client.svc";
const SHAREPOINT_PRINCIPAL: &str = "00000003-0000-0ff1-ce00-000000000000";

static REALM_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)realm\s*=\s*"([^"]*)""#).expect("Invalid realm regex"));

/// `expires_in` arrives as a number or as a numeric string
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Seconds {
    Number(u64),
    Text(String),
}

impl Seconds {
    fn get(&self) -> Option<u64> {
        match self {
            Seconds::Number(n) => Some(*n),
            Seconds::Text(s) => s.trim().parse().ok(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<Seconds>,
}

#[derive(Debug, Deserialize)]
struct TokenError {
    error: String,
}

fn realm_from_challenge(challenge: &str) -> Option<String> {
    REALM_RE
        .captures(challenge)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .filter(|r| !r.is_empty())
}

/// What one token exchange needs, detached from the strategy
struct Exchange {
    http: reqwest::Client,
    site: Url,
    client_id: String,
    client_secret: String,
    realm: Option<String>,
    token_url: Option<String>,
}

impl Exchange {
    async fn discover_realm(&self) -> Result<String> {
        let probe = site_endpoint(&self.site, DISCOVERY_PATH)?;
        let response = self
            .http
            .get(probe.clone())
            .header(AUTHORIZATION, HeaderValue::from_static("Bearer "))
            .send()
            .await
            .map_err(|e| Error::unavailable(ID, probe.as_str(), &e))?;

        let status = response.status();
        let realm = response
            .headers()
            .get_all(WWW_AUTHENTICATE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find_map(realm_from_challenge);
        let _ = response.bytes().await;

        match realm {
            Some(realm) => {
                debug!(strategy = ID, endpoint = %probe, realm = %realm, "Realm discovered");
                Ok(realm)
            }
            None if status.is_server_error() => Err(Error::AuthUnavailable {
                strategy: ID,
                endpoint: probe.to_string(),
                reason: format!("realm discovery returned HTTP {}", status.as_u16()),
            }),
            None => Err(Error::AuthFailed {
                strategy: ID,
                endpoint: probe.to_string(),
                status: Some(status.as_u16()),
                reason: "no realm in WWW-Authenticate challenge".to_string(),
            }),
        }
    }

    async fn run(self) -> Result<AuthSession> {
        let realm = match &self.realm {
            Some(realm) => realm.clone(),
            None => self.discover_realm().await?,
        };
        let host = self
            .site
            .host_str()
            .ok_or_else(|| Error::Settings(format!("{}: site URL has no host", ID)))?;

        let token_url = match &self.token_url {
            Some(url) => url.clone(),
            None => format!("https://accounts.accesscontrol.windows.net/{}/tokens/OAuth/2", realm),
        };
        let form = [
            ("grant_type", "client_credentials".to_string()),
            ("client_id", format!("{}@{}", self.client_id, realm)),
            ("client_secret", self.client_secret.clone()),
            ("resource", format!("{}/{}@{}", SHAREPOINT_PRINCIPAL, host, realm)),
        ];

        let response = self
            .http
            .post(&token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| Error::unavailable(ID, token_url.as_str(), &e))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::unavailable(ID, token_url.as_str(), &e))?;

        if status.is_server_error() {
            return Err(Error::AuthUnavailable {
                strategy: ID,
                endpoint: token_url,
                reason: format!("token service returned HTTP {}", status.as_u16()),
            });
        }
        if status != StatusCode::OK {
            let reason = serde_json::from_slice::<TokenError>(&body)
                .map(|e| format!("token request rejected: {}", e.error))
                .unwrap_or_else(|_| "token request rejected".to_string());
            return Err(Error::AuthFailed {
                strategy: ID,
                endpoint: token_url,
                status: Some(status.as_u16()),
                reason,
            });
        }

        let token: TokenResponse = serde_json::from_slice(&body).map_err(|e| Error::AuthFailed {
            strategy: ID,
            endpoint: token_url.clone(),
            status: Some(status.as_u16()),
            reason: format!("malformed token response: {}", e),
        })?;
        let lifetime = token
            .expires_in
            .as_ref()
            .and_then(Seconds::get)
            .map(Duration::from_secs);

        info!(strategy = ID, endpoint = %token_url, realm = %realm, expires_in = ?lifetime, "Access token issued");
        Ok(AuthSession::new(Decoration::bearer(&token.access_token)?, lifetime))
    }
}

#[derive(Debug)]
pub struct AppOnlyStrategy {
    core: StrategyCore,
}

impl AppOnlyStrategy {
    pub fn new(config: StrategyConfig, settings: &Settings) -> Result<Self> {
        Ok(Self {
            core: StrategyCore::new(config, settings, Affinity::Pooled)?,
        })
    }

    fn exchange(&self) -> Result<Exchange> {
        let config = self.core.config();
        Ok(Exchange {
            http: self.core.http().clone(),
            site: self.core.site(ID)?,
            client_id: config.require(ID, fields::CLIENT_ID)?.to_string(),
            client_secret: config.require(ID, fields::CLIENT_SECRET)?.to_string(),
            realm: config.get(fields::REALM).map(str::to_string),
            token_url: config.get(fields::TOKEN_URL).map(str::to_string),
        })
    }
}

impl AuthStrategy for AppOnlyStrategy {
    fn strategy(&self) -> &'static str {
        ID
    }

    /// Bearer tokens are cached, but nothing is bound to a connection or cookie jar
    fn is_session_based(&self) -> bool {
        false
    }

    async fn get_auth(&self, _target: &Url) -> Result<Decoration> {
        let exchange = self.exchange()?;
        let deadline = self.core.settings().handshake_timeout;
        let label = exchange.site.to_string();

        let session = self
            .core
            .session()
            .get_or_establish(move || async move {
                within_deadline(ID, &label, deadline, exchange.run()).await
            })
            .await?;

        Ok(session.decoration.clone())
    }

    fn core(&self) -> &StrategyCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StrategyCore {
        &mut self.core
    }
}
