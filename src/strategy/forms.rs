//! Forms-based authentication through the `authentication.asmx` SOAP service

use std::time::Duration;

use cookie::Cookie;
use once_cell::sync::Lazy;
use quick_xml::escape::escape;
use regex::Regex;
use reqwest::header::{CONTENT_TYPE, SET_COOKIE};
use tracing::{debug, info};
use url::Url;

use super::{site_endpoint, within_deadline, AuthSession, AuthStrategy, Decoration, StrategyCore};
use crate::client::transport::Affinity;
use crate::config::{fields, Settings, StrategyConfig};
use crate::errors::{Error, Result};

pub(crate) const ID: &str = "forms";

const LOGIN_PATH: &str = "_vti_bin/authentication.asmx";
const SOAP_ACTION: &str = "http://schemas.microsoft.com/sharepoint/soap/Login";

static ERROR_CODE: Lazy<Regex> = Lazy::new(|| tag_regex("ErrorCode"));
static COOKIE_NAME: Lazy<Regex> = Lazy::new(|| tag_regex("CookieName"));
static TIMEOUT_SECONDS: Lazy<Regex> = Lazy::new(|| tag_regex("TimeoutSeconds"));

fn tag_regex(tag: &str) -> Regex {
    // Tags may carry a namespace prefix
    Regex::new(&format!(r"<(?:\w+:)?{tag}>([^<]*)</(?:\w+:)?{tag}>")).expect("Invalid SOAP tag regex")
}

fn login_envelope(username: &str, password: &str) -> String {
    format!(
        concat!(
            r#"<?xml version="1.0" encoding="utf-8"?>"#,
            r#"<soap:Envelope xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" "#,
            r#"xmlns:xsd="http://www.w3.org/2001/XMLSchema" "#,
            r#"xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">"#,
            r#"<soap:Body><Login xmlns="http://schemas.microsoft.com/sharepoint/soap/">"#,
            "<username>{}</username><password>{}</password>",
            "</Login></soap:Body></soap:Envelope>"
        ),
        escape(username),
        escape(password)
    )
}

/// Parsed `LoginResult`
#[derive(Debug, Clone, PartialEq, Eq)]
struct LoginResult {
    error_code: String,
    cookie_name: Option<String>,
    timeout: Option<Duration>,
}

fn capture(re: &Regex, body: &str) -> Option<String> {
    re.captures(body)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_login_result(body: &str) -> Option<LoginResult> {
    let error_code = capture(&ERROR_CODE, body)?;
    Some(LoginResult {
        error_code,
        cookie_name: capture(&COOKIE_NAME, body),
        timeout: capture(&TIMEOUT_SECONDS, body)
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|&secs| secs > 0)
            .map(Duration::from_secs),
    })
}

/// Build a `Cookie` request header from the login response's `Set-Cookie`s
///
/// Returns `None` when the expected session cookie was not set.
fn session_cookie<'a>(set_cookies: impl Iterator<Item = &'a str>, name: Option<&str>) -> Option<String> {
    let cookies: Vec<Cookie<'static>> = set_cookies
        .filter_map(|raw| Cookie::parse(raw.to_string()).ok())
        .filter(|c| !c.value().is_empty())
        .collect();

    if let Some(name) = name {
        if !cookies.iter().any(|c| c.name() == name) {
            return None;
        }
    }
    if cookies.is_empty() {
        return None;
    }

    Some(
        cookies
            .iter()
            .map(|c| format!("{}={}", c.name(), c.value()))
            .collect::<Vec<_>>()
            .join("; "),
    )
}

#[derive(Debug)]
pub struct FormsStrategy {
    core: StrategyCore,
}

impl FormsStrategy {
    pub fn new(config: StrategyConfig, settings: &Settings) -> Result<Self> {
        Ok(Self {
            core: StrategyCore::new(config, settings, Affinity::Pooled)?,
        })
    }
}

async fn login(http: reqwest::Client, endpoint: Url, envelope: String) -> Result<AuthSession> {
    let response = http
        .post(endpoint.clone())
        .header(CONTENT_TYPE, "text/xml; charset=utf-8")
        .header("SOAPAction", SOAP_ACTION)
        .body(envelope)
        .send()
        .await
        .map_err(|e| Error::unavailable(ID, endpoint.as_str(), &e))?;

    let status = response.status();
    let set_cookies: Vec<String> = response
        .headers()
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(str::to_string)
        .collect();
    let body = response
        .text()
        .await
        .map_err(|e| Error::unavailable(ID, endpoint.as_str(), &e))?;

    let failed = |reason: String| Error::AuthFailed {
        strategy: ID,
        endpoint: endpoint.to_string(),
        status: Some(status.as_u16()),
        reason,
    };

    if status.is_server_error() {
        return Err(Error::AuthUnavailable {
            strategy: ID,
            endpoint: endpoint.to_string(),
            reason: format!("login service returned HTTP {}", status.as_u16()),
        });
    }
    if !status.is_success() {
        return Err(failed("login request rejected".to_string()));
    }

    let result = parse_login_result(&body).ok_or_else(|| failed("malformed LoginResult".to_string()))?;
    debug!(
        strategy = ID,
        error_code = %result.error_code,
        cookie_name = result.cookie_name.as_deref().unwrap_or(""),
        "Login result"
    );
    if result.error_code != "NoError" {
        return Err(failed(format!("login returned {}", result.error_code)));
    }

    let cookie = session_cookie(set_cookies.iter().map(String::as_str), result.cookie_name.as_deref())
        .ok_or_else(|| failed("login succeeded but no session cookie was set".to_string()))?;

    info!(
        strategy = ID,
        endpoint = %endpoint,
        timeout = ?result.timeout,
        "Session established"
    );
    Ok(AuthSession::new(Decoration::cookie(&cookie)?, result.timeout))
}

impl AuthStrategy for FormsStrategy {
    fn strategy(&self) -> &'static str {
        ID
    }

    fn is_session_based(&self) -> bool {
        true
    }

    async fn get_auth(&self, _target: &Url) -> Result<Decoration> {
        let site = self.core.site(ID)?;
        let config = self.core.config();
        let envelope = login_envelope(
            config.require(ID, fields::USERNAME)?,
            config.require(ID, fields::PASSWORD)?,
        );
        let endpoint = site_endpoint(&site, LOGIN_PATH)?;
        let http = self.core.http().clone();
        let deadline = self.core.settings().handshake_timeout;

        let session = self
            .core
            .session()
            .get_or_establish(move || async move {
                let label = endpoint.to_string();
                within_deadline(ID, &label, deadline, login(http, endpoint, envelope)).await
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_escapes_credentials() {
        let envelope = login_envelope("a<b", "p&ss\"");
        assert!(envelope.contains("<username>a&lt;b</username>"));
        assert!(envelope.contains("<password>p&amp;ss&quot;</password>"));
    }

    #[test]
    fn test_parse_login_result() {
        let body = r#"<?xml version="1.0"?><soap:Envelope><soap:Body><LoginResponse>
            <LoginResult><CookieName>FedAuth</CookieName><ErrorCode>NoError</ErrorCode>
            <TimeoutSeconds>1800</TimeoutSeconds></LoginResult></LoginResponse></soap:Body></soap:Envelope>"#;
        let result = parse_login_result(body).unwrap();
        assert_eq!(result.error_code, "NoError");
        assert_eq!(result.cookie_name.as_deref(), Some("FedAuth"));
        assert_eq!(result.timeout, Some(Duration::from_secs(1800)));
    }

    #[test]
    fn test_parse_password_mismatch() {
        let body = "<LoginResult><ErrorCode>PasswordNotMatch</ErrorCode><TimeoutSeconds>0</TimeoutSeconds></LoginResult>";
        let result = parse_login_result(body).unwrap();
        assert_eq!(result.error_code, "PasswordNotMatch");
        assert_eq!(result.cookie_name, None);
        assert_eq!(result.timeout, None);
    }

    #[test]
    fn test_parse_garbage() {
        assert_eq!(parse_login_result("<html>oops</html>"), None);
    }

    #[test]
    fn test_session_cookie_requires_named_cookie() {
        let headers = ["FedAuth=abc123; path=/; HttpOnly", "other=1; path=/"];
        assert_eq!(
            session_cookie(headers.iter().copied(), Some("FedAuth")).as_deref(),
            Some("FedAuth=abc123; other=1")
        );
        assert_eq!(session_cookie(headers.iter().copied(), Some("rtFa")), None);
        assert_eq!(session_cookie(std::iter::empty(), None), None);
    }

    #[tokio::test]
    async fn test_missing_username() {
        let config = StrategyConfig::new(ID).with(fields::SITE_URL, "http://127.0.0.1:9/sites/dev");
        let strategy = FormsStrategy::new(config, &Settings::default()).unwrap();
        let target = Url::parse("http://127.0.0.1:9/sites/dev").unwrap();
        let err = strategy.get_auth(&target).await.unwrap_err();
        assert_eq!(err, Error::MissingField { strategy: ID, field: fields::USERNAME });
    }
}
