//! Request digest (`X-RequestDigest`) cache
//!
//! Mutating calls need a form digest obtained from `/_api/contextinfo`. One
//! digest is cached per site and refreshed shortly before it expires.
//! Concurrent refreshes for the same site share a single contextinfo call.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::errors::{Error, Result};
use crate::sync::SingleFlight;

pub const DIGEST_HEADER: &str = "X-RequestDigest";

/// Path of the contextinfo endpoint relative to a site
pub const CONTEXT_INFO_PATH: &str = "_api/contextinfo";

/// A cached form digest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestEntry {
    pub token: String,
    pub issued_at: Instant,
    pub expires_at: Instant,
}

impl DigestEntry {
    pub fn new(token: impl Into<String>, lifetime: Duration) -> Self {
        let issued_at = Instant::now();
        Self {
            token: token.into(),
            issued_at,
            expires_at: issued_at + lifetime,
        }
    }

    /// Usable for at least `margin` more
    pub fn is_fresh(&self, margin: Duration) -> bool {
        Instant::now() + margin < self.expires_at
    }
}

/// Canonical cache key for a site: lowercased scheme and host, no query,
/// fragment or trailing slash
pub fn normalize_endpoint(endpoint: &str) -> String {
    match Url::parse(endpoint) {
        Ok(mut url) => {
            url.set_query(None);
            url.set_fragment(None);
            url.as_str().trim_end_matches('/').to_string()
        }
        Err(_) => endpoint.trim_end_matches('/').to_string(),
    }
}

/// Per-site digest cache with coalesced refresh
#[derive(Debug)]
pub struct DigestCache {
    entries: Arc<DashMap<String, Arc<DigestEntry>>>,
    flights: SingleFlight<String, Arc<DigestEntry>>,
    safety_margin: Duration,
}

impl DigestCache {
    pub fn new(safety_margin: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            flights: SingleFlight::new(),
            safety_margin,
        }
    }

    pub fn safety_margin(&self) -> Duration {
        self.safety_margin
    }

    /// Cached entry for `endpoint` if it is still fresh
    pub fn peek(&self, endpoint: &str) -> Option<Arc<DigestEntry>> {
        let key = normalize_endpoint(endpoint);
        self.entries
            .get(&key)
            .map(|e| e.value().clone())
            .filter(|e| e.is_fresh(self.safety_margin))
    }

    /// Fresh digest for `endpoint`, running `refresh` if the cached one is
    /// missing or about to expire
    ///
    /// Only one refresh runs per endpoint at a time; concurrent callers
    /// receive the same entry or the same error.
    pub async fn get<F, Fut>(&self, endpoint: &str, refresh: F) -> Result<Arc<DigestEntry>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<DigestEntry>> + Send + 'static,
    {
        let key = normalize_endpoint(endpoint);
        if let Some(entry) = self.peek(&key) {
            debug!(endpoint = %key, "Digest cache hit");
            return Ok(entry);
        }

        let entries = self.entries.clone();
        let label = key.clone();
        self.flights
            .run(key, move || {
                let pending = refresh();
                async move {
                    debug!(endpoint = %label, "Digest cache miss, refreshing");
                    let entry = Arc::new(pending.await.map_err(|e| unavailable(&label, e))?);
                    entries.insert(label, entry.clone());
                    Ok(entry)
                }
            })
            .await
    }

    /// Forget the digest for one endpoint
    pub fn invalidate(&self, endpoint: &str) {
        let key = normalize_endpoint(endpoint);
        if self.entries.remove(&key).is_some() {
            debug!(endpoint = %key, "Digest invalidated");
        }
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Refreshes started so far
    pub fn refreshes(&self) -> u64 {
        self.flights.started()
    }
}

/// Credential and caller errors pass through; everything else becomes
/// `DigestUnavailable`
fn unavailable(endpoint: &str, err: Error) -> Error {
    match err {
        Error::DigestUnavailable { .. }
        | Error::AuthFailed { .. }
        | Error::AuthExpired { .. }
        | Error::MissingField { .. }
        | Error::Cancelled => err,
        other => Error::DigestUnavailable {
            endpoint: endpoint.to_string(),
            reason: other.to_string(),
        },
    }
}

fn number(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Extract `(FormDigestValue, FormDigestTimeoutSeconds)` from a contextinfo
/// response in verbose or plain JSON shape
pub fn parse_context_info(body: &[u8]) -> std::result::Result<(String, Duration), String> {
    let json: Value = serde_json::from_slice(body).map_err(|e| format!("invalid contextinfo JSON: {}", e))?;

    let info = [
        json.pointer("/d/GetContextWebInformation"),
        json.get("d"),
        Some(&json),
    ]
    .into_iter()
    .flatten()
    .find(|v| v.get("FormDigestValue").is_some())
    .ok_or_else(|| "contextinfo response has no FormDigestValue".to_string())?;

    let token = info
        .get("FormDigestValue")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| "FormDigestValue is empty".to_string())?;
    let timeout = info
        .get("FormDigestTimeoutSeconds")
        .and_then(number)
        .ok_or_else(|| "contextinfo response has no FormDigestTimeoutSeconds".to_string())?;

    Ok((token.to_string(), Duration::from_secs(timeout)))
}
