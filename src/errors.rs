//! Error types for collabauth

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for collabauth
///
/// The enum is `Clone` so a single coalesced refresh or handshake can hand the
/// same failure to every waiter. Transport failures are therefore carried as
/// rendered messages rather than the source error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("config not found: {}", path.display())]
    ConfigNotFound { path: PathBuf },

    #[error("config corrupt ({}): {reason}", path.display())]
    ConfigCorrupt { path: PathBuf, reason: String },

    #[error("path unwritable ({}): {reason}", path.display())]
    PathUnwritable { path: PathBuf, reason: String },

    #[error("master key required for {strategy} config but none was set")]
    MasterKeyMissing { strategy: String },

    #[error("{strategy}: missing required config field '{field}'")]
    MissingField { strategy: &'static str, field: &'static str },

    #[error("unknown auth strategy '{0}'")]
    UnknownStrategy(String),

    #[error("{strategy}: authentication failed for {endpoint}: {reason}{}", status_suffix(.status))]
    AuthFailed {
        strategy: &'static str,
        endpoint: String,
        status: Option<u16>,
        reason: String,
    },

    #[error("{strategy}: session expired for {endpoint}")]
    AuthExpired { strategy: &'static str, endpoint: String },

    #[error("{strategy}: authentication unavailable for {endpoint}: {reason}")]
    AuthUnavailable {
        strategy: &'static str,
        endpoint: String,
        reason: String,
    },

    #[error("request digest unavailable for {endpoint}: {reason}")]
    DigestUnavailable { endpoint: String, reason: String },

    #[error("handshake sequence violation: {0}")]
    HandshakeSequence(String),

    #[error("invalid authentication challenge: {0}")]
    InvalidChallenge(String),

    #[error("invalid header value: {0}")]
    InvalidHeader(String),

    #[error("transport error for {endpoint}: {reason}")]
    Transport { endpoint: String, reason: String },

    #[error("request cancelled")]
    Cancelled,

    #[error("settings error: {0}")]
    Settings(String),
}

fn status_suffix(status: &Option<u16>) -> String {
    match status {
        Some(code) => format!(" (HTTP {})", code),
        None => String::new(),
    }
}

impl Error {
    /// Whether the caller may retry the operation (after a backoff or re-handshake)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::AuthExpired { .. }
                | Error::AuthUnavailable { .. }
                | Error::DigestUnavailable { .. }
                | Error::Transport { .. }
        )
    }

    /// HTTP status attached to the error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::AuthFailed { status, .. } => *status,
            _ => None,
        }
    }

    pub(crate) fn transport(endpoint: impl Into<String>, err: &reqwest::Error) -> Self {
        Error::Transport {
            endpoint: endpoint.into(),
            reason: render_reqwest_error(err),
        }
    }

    pub(crate) fn unavailable(
        strategy: &'static str,
        endpoint: impl Into<String>,
        err: &reqwest::Error,
    ) -> Self {
        Error::AuthUnavailable {
            strategy,
            endpoint: endpoint.into(),
            reason: render_reqwest_error(err),
        }
    }
}

/// Render a reqwest error with its failure class
fn render_reqwest_error(err: &reqwest::Error) -> String {
    if err.is_timeout() {
        format!("timed out: {}", err)
    } else if err.is_connect() {
        format!("connection failed: {}", err)
    } else {
        err.to_string()
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let expired = Error::AuthExpired { strategy: "ntlm", endpoint: "http://x".into() };
        assert!(expired.is_retryable());

        let failed = Error::AuthFailed {
            strategy: "ntlm",
            endpoint: "http://x".into(),
            status: Some(401),
            reason: "bad credentials".into(),
        };
        assert!(!failed.is_retryable());
        assert_eq!(failed.status(), Some(401));
    }

    #[test]
    fn test_auth_failed_display_includes_status() {
        let err = Error::AuthFailed {
            strategy: "forms",
            endpoint: "https://site".into(),
            status: Some(401),
            reason: "rejected".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("forms"));
        assert!(msg.contains("HTTP 401"));
    }
}
