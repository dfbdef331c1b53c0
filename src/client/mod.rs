//! Authenticated HTTP client
//!
//! [`Client`] wraps one strategy and decorates every outbound request with
//! its authorization. Mutating requests also get a request digest. A `401`
//! triggers one re-authentication and one retry; a `403` that reports a
//! stale digest triggers one digest refresh and one retry.
//!
//! Each request remembers the session generation it was decorated with, so
//! concurrent callers that hit the same lapsed session drop it once and share
//! the one re-authentication.
//!
//! Connection-bound strategies (NTLM, Negotiate) send through a lane: one
//! request at a time, body read before the lane is released, so the pinned
//! connection that carries the handshake also carries the request.

pub mod transport;

pub use transport::{build_http, load_identity, Affinity};

use bytes::Bytes;
use reqwest::header::{HeaderValue, ACCEPT, CONTENT_LENGTH};
use reqwest::{IntoUrl, Method, Request, RequestBuilder, Response, StatusCode};
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::config::{Settings, StrategyConfig};
use crate::digest::{self, DigestCache, DigestEntry, DIGEST_HEADER};
use crate::errors::{Error, Result};
use crate::store::MasterKey;
use crate::strategy::{AuthStrategy, Decoration, Strategy};

/// Markers of SharePoint's "security validation" rejection
const STALE_DIGEST_MARKERS: &[&str] = &["-2130575251", "security validation"];

/// Path segments that end the site part of a URL
const SITE_BOUNDARIES: &[&str] = &["/_api/", "/_vti_bin/"];

/// Verbs that change server state and must carry a request digest
pub fn is_mutating(method: &Method) -> bool {
    matches!(method.as_str(), "POST" | "PUT" | "PATCH" | "MERGE" | "DELETE")
}

fn is_stale_digest(body: &[u8]) -> bool {
    let text = String::from_utf8_lossy(body).to_lowercase();
    STALE_DIGEST_MARKERS.iter().any(|m| text.contains(m))
}

/// HTTP client bound to one authentication strategy
pub struct Client<S: AuthStrategy = Strategy> {
    strategy: S,
    digests: DigestCache,
    settings: Settings,
    lane: Option<Mutex<()>>,
}

impl<S: AuthStrategy + std::fmt::Debug> std::fmt::Debug for Client<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("strategy", &self.strategy)
            .field("digests", &self.digests)
            .finish()
    }
}

impl Client<Strategy> {
    /// Client for the strategy named in `config`
    pub fn from_config(config: StrategyConfig, settings: &Settings) -> Result<Self> {
        Ok(Self::new(Strategy::from_config(config, settings)?, settings))
    }

    /// Client for an encrypted config file
    pub fn load(path: &std::path::Path, master_key: Option<MasterKey>, settings: &Settings) -> Result<Self> {
        Ok(Self::new(Strategy::load(path, master_key, settings)?, settings))
    }
}

impl<S: AuthStrategy> Client<S> {
    pub fn new(strategy: S, settings: &Settings) -> Self {
        let lane = strategy.is_connection_bound().then(|| Mutex::new(()));
        Self {
            strategy,
            digests: DigestCache::new(settings.digest_safety_margin),
            settings: settings.clone(),
            lane,
        }
    }

    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    pub fn digests(&self) -> &DigestCache {
        &self.digests
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Set a strategy config field; session and digests are dropped
    pub fn set_field(&mut self, name: &str, value: &str) {
        self.strategy.set_field(name, value);
        self.digests.clear();
    }

    pub fn set_master_key(&mut self, key: impl Into<MasterKey>) {
        self.strategy.set_master_key(key);
        self.digests.clear();
    }

    /// Request builder on the strategy's transport
    pub fn request(&self, method: Method, url: impl IntoUrl) -> RequestBuilder {
        self.strategy.http().request(method, url)
    }

    /// Exclusive use of the transport for connection-bound strategies
    async fn lane(&self) -> Option<MutexGuard<'_, ()>> {
        match &self.lane {
            Some(lane) => Some(lane.lock().await),
            None => None,
        }
    }

    /// Attach the strategy's current decoration, authenticating if needed
    ///
    /// Headers the caller already set are left alone.
    pub async fn decorate(&self, request: &mut Request) -> Result<()> {
        let _lane = self.lane().await;
        self.apply_auth(request).await
    }

    async fn apply_auth(&self, request: &mut Request) -> Result<()> {
        let decoration = self.strategy.get_auth(request.url()).await?;
        decoration.apply(request.headers_mut());
        Ok(())
    }

    /// Drop the session a rejected request was decorated with
    ///
    /// Only the first caller per generation actually drops it; the rest join
    /// the re-authentication it triggers.
    fn drop_session(&self, generation: u64, site: &str) {
        if self.strategy.invalidate_if(generation) {
            if self.strategy.is_session_based() {
                self.digests.invalidate(site);
            }
        } else {
            debug!(strategy = self.strategy.strategy(), generation, "Session already replaced");
        }
    }

    /// Site whose digest covers `url`
    fn digest_site(&self, url: &Url) -> String {
        let raw = url.as_str();
        let lower = raw.to_ascii_lowercase();
        SITE_BOUNDARIES
            .iter()
            .filter_map(|b| lower.find(b))
            .min()
            .map(|at| raw[..at].to_string())
            .unwrap_or_else(|| self.strategy.site_url().to_string())
    }

    /// Current request digest for a site, refreshing it if needed
    pub async fn digest(&self, endpoint: &str) -> Result<String> {
        let _lane = self.lane().await;
        self.digest_unlocked(endpoint).await
    }

    async fn digest_unlocked(&self, endpoint: &str) -> Result<String> {
        let generation = self.strategy.generation();
        match self.fetch_digest(endpoint).await {
            Err(Error::AuthExpired { .. }) => {
                warn!(strategy = self.strategy.strategy(), endpoint, "Contextinfo rejected, re-authenticating");
                self.strategy.invalidate_if(generation);
                match self.fetch_digest(endpoint).await {
                    Err(Error::AuthExpired { endpoint, .. }) => Err(Error::AuthFailed {
                        strategy: self.strategy.strategy(),
                        endpoint,
                        status: Some(401),
                        reason: "contextinfo rejected after re-authentication".to_string(),
                    }),
                    other => other,
                }
            }
            other => other,
        }
    }

    async fn fetch_digest(&self, endpoint: &str) -> Result<String> {
        if let Some(entry) = self.digests.peek(endpoint) {
            return Ok(entry.token.clone());
        }

        let site = Url::parse(endpoint).map_err(|e| Error::DigestUnavailable {
            endpoint: endpoint.to_string(),
            reason: format!("invalid site URL: {}", e),
        })?;
        let contextinfo = crate::strategy::site_endpoint(&site, digest::CONTEXT_INFO_PATH)?;
        let decoration = self.strategy.get_auth(&contextinfo).await?;
        let http = self.strategy.http();
        let strategy = self.strategy.strategy();
        let timeout = self.settings.request_timeout;

        let entry = self
            .digests
            .get(endpoint, move || {
                request_context_info(http, contextinfo, decoration, strategy, timeout)
            })
            .await?;
        Ok(entry.token.clone())
    }

    /// Send a request with authorization, digest and retry handling
    pub async fn execute(&self, request: Request) -> Result<Response> {
        let endpoint = request.url().to_string();
        let site = self.digest_site(request.url());
        let wants_digest = is_mutating(request.method()) && !request.headers().contains_key(DIGEST_HEADER);
        let retry = request.try_clone();

        let (response, generation) = self.send_once(request, wants_digest.then_some(site.as_str())).await?;

        match response.status() {
            StatusCode::UNAUTHORIZED => {
                let _ = response.bytes().await;
                self.drop_session(generation, &site);

                let Some(retry) = retry else {
                    warn!(strategy = self.strategy.strategy(), endpoint = %endpoint, "401 on a non-replayable request");
                    return Err(Error::AuthExpired {
                        strategy: self.strategy.strategy(),
                        endpoint,
                    });
                };

                warn!(strategy = self.strategy.strategy(), endpoint = %endpoint, "401, re-authenticating and retrying once");
                let (response, generation) = self.send_once(retry, wants_digest.then_some(site.as_str())).await?;
                if response.status() == StatusCode::UNAUTHORIZED {
                    let _ = response.bytes().await;
                    self.strategy.invalidate_if(generation);
                    return Err(Error::AuthFailed {
                        strategy: self.strategy.strategy(),
                        endpoint,
                        status: Some(401),
                        reason: "request rejected after re-authentication".to_string(),
                    });
                }
                Ok(response)
            }
            StatusCode::FORBIDDEN if wants_digest => {
                let (response, body) = buffer(response, &endpoint).await?;
                match retry {
                    Some(retry) if is_stale_digest(&body) => {
                        warn!(endpoint = %endpoint, site = %site, "Stale request digest, refreshing and retrying once");
                        self.digests.invalidate(&site);
                        let (response, _) = self.send_once(retry, Some(site.as_str())).await?;
                        Ok(response)
                    }
                    _ => Ok(response),
                }
            }
            _ => Ok(response),
        }
    }

    /// [`execute`](Self::execute) that gives up when `cancel` fires
    ///
    /// Handshakes and digest refreshes shared with other callers keep running.
    pub async fn execute_with_cancel(&self, request: Request, cancel: &CancellationToken) -> Result<Response> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = self.execute(request) => result,
        }
    }

    /// One decorated send; returns the session generation it was decorated with
    async fn send_once(&self, mut request: Request, digest_site: Option<&str>) -> Result<(Response, u64)> {
        let _lane = self.lane().await;

        // The digest leg may itself re-authenticate, so decorate after it
        if let Some(site) = digest_site {
            let token = self.digest_unlocked(site).await?;
            let value = HeaderValue::from_str(&token).map_err(|e| Error::InvalidHeader(e.to_string()))?;
            request.headers_mut().insert(DIGEST_HEADER, value);
        }
        let generation = self.strategy.generation();
        self.apply_auth(&mut request).await?;
        if request.timeout().is_none() {
            *request.timeout_mut() = Some(self.settings.request_timeout);
        }

        let endpoint = request.url().to_string();
        debug!(
            strategy = self.strategy.strategy(),
            method = %request.method(),
            endpoint = %endpoint,
            "Sending request"
        );

        let response = self.strategy.http().execute(request).await.map_err(|e| {
            if self.strategy.is_session_based() {
                self.strategy.invalidate_if(generation);
            }
            Error::transport(endpoint.as_str(), &e)
        })?;

        // Release the connection only once the body is off the wire
        let response = match self.lane {
            Some(_) => buffer(response, &endpoint).await?.0,
            None => response,
        };
        Ok((response, generation))
    }
}

/// Read a response body and rebuild an equivalent response around it
async fn buffer(response: Response, endpoint: &str) -> Result<(Response, Bytes)> {
    let status = response.status();
    let version = response.version();
    let headers = response.headers().clone();
    let body = response.bytes().await.map_err(|e| Error::transport(endpoint, &e))?;

    let mut rebuilt = http::Response::new(body.clone());
    *rebuilt.status_mut() = status;
    *rebuilt.version_mut() = version;
    *rebuilt.headers_mut() = headers;
    Ok((Response::from(rebuilt), body))
}

async fn request_context_info(
    http: reqwest::Client,
    url: Url,
    decoration: Decoration,
    strategy: &'static str,
    timeout: std::time::Duration,
) -> Result<DigestEntry> {
    let mut request = http
        .post(url.clone())
        .header(ACCEPT, "application/json;odata=verbose")
        .header(CONTENT_LENGTH, "0")
        .timeout(timeout)
        .build()
        .map_err(|e| Error::transport(url.as_str(), &e))?;
    decoration.apply(request.headers_mut());

    let response = http.execute(request).await.map_err(|e| Error::transport(url.as_str(), &e))?;
    let status = response.status();
    let body = response.bytes().await.map_err(|e| Error::transport(url.as_str(), &e))?;

    if status == StatusCode::UNAUTHORIZED {
        return Err(Error::AuthExpired {
            strategy,
            endpoint: url.to_string(),
        });
    }
    if !status.is_success() {
        return Err(Error::DigestUnavailable {
            endpoint: url.to_string(),
            reason: format!("contextinfo returned HTTP {}", status.as_u16()),
        });
    }

    let (token, lifetime) = digest::parse_context_info(&body).map_err(|reason| Error::DigestUnavailable {
        endpoint: url.to_string(),
        reason,
    })?;
    debug!(endpoint = %url, lifetime = ?lifetime, "Request digest issued");
    Ok(DigestEntry::new(token, lifetime))
}
