//! Authentication strategies
//!
//! Each credential mechanism implements [`AuthStrategy`]. [`Strategy`] is the
//! sum type over all of them; a client picks one variant at construction and
//! dispatches statically from then on.
//!
//! | id            | type                  | session | decoration          |
//! |---------------|-----------------------|---------|---------------------|
//! | `ntlm`        | [`NtlmStrategy`]      | yes     | none (connection)   |
//! | `windows`     | [`NtlmStrategy`]      | yes     | none (connection)   |
//! | `forms`       | [`FormsStrategy`]     | yes     | `Cookie`            |
//! | `app-only`    | [`AppOnlyStrategy`]   | no      | `Authorization`     |
//! | `client-cert` | [`ClientCertStrategy`]| no      | none (TLS identity) |

mod app_only;
mod client_cert;
mod forms;
mod ntlm;
pub mod session;

pub use app_only::AppOnlyStrategy;
pub use client_cert::ClientCertStrategy;
pub use forms::FormsStrategy;
pub use ntlm::NtlmStrategy;
pub use session::{AuthSession, SessionCache};

use std::future::Future;
use std::path::Path;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, COOKIE};
use tracing::debug;
use url::Url;

use crate::client::transport::{self, Affinity};
use crate::config::{Settings, StrategyConfig};
use crate::errors::{Error, Result};
use crate::store::{CredentialStore, MasterKey};

/// Headers a strategy wants attached to the next request
///
/// An empty decoration is a valid result: the strategy needs nothing on the
/// request itself (connection-bound or TLS-level auth).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Decoration {
    pub authorization: Option<HeaderValue>,
    pub cookie: Option<HeaderValue>,
}

impl Decoration {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn bearer(token: &str) -> Result<Self> {
        let mut value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| Error::InvalidHeader(e.to_string()))?;
        value.set_sensitive(true);
        Ok(Self {
            authorization: Some(value),
            cookie: None,
        })
    }

    pub fn cookie(cookie: &str) -> Result<Self> {
        let mut value =
            HeaderValue::from_str(cookie).map_err(|e| Error::InvalidHeader(e.to_string()))?;
        value.set_sensitive(true);
        Ok(Self {
            authorization: None,
            cookie: Some(value),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.authorization.is_none() && self.cookie.is_none()
    }

    /// Attach to `headers`, keeping any `Authorization`/`Cookie` the caller set
    pub fn apply(&self, headers: &mut HeaderMap) {
        if let Some(value) = &self.authorization {
            if !headers.contains_key(AUTHORIZATION) {
                headers.insert(AUTHORIZATION, value.clone());
            }
        }
        if let Some(value) = &self.cookie {
            if !headers.contains_key(COOKIE) {
                headers.insert(COOKIE, value.clone());
            }
        }
    }
}

/// State every strategy carries: its config, key, live session and transport
#[derive(Debug)]
pub struct StrategyCore {
    config: StrategyConfig,
    store: CredentialStore,
    session: SessionCache,
    settings: Settings,
    http: reqwest::Client,
    affinity: Affinity,
}

impl StrategyCore {
    pub(crate) fn new(config: StrategyConfig, settings: &Settings, affinity: Affinity) -> Result<Self> {
        Ok(Self {
            config,
            store: CredentialStore::from_settings(settings),
            session: SessionCache::new(),
            settings: settings.clone(),
            http: transport::build_http(settings, affinity, None)?,
            affinity,
        })
    }

    pub fn config(&self) -> &StrategyConfig {
        &self.config
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn session(&self) -> &SessionCache {
        &self.session
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn affinity(&self) -> Affinity {
        self.affinity
    }

    pub(crate) fn site(&self, strategy: &'static str) -> Result<Url> {
        let raw = self.config.require(strategy, crate::config::fields::SITE_URL)?;
        Url::parse(raw.trim_end_matches('/')).map_err(|e| Error::Settings(format!(
            "{}: invalid site URL '{}': {}",
            strategy, raw, e
        )))
    }
}

/// `{site}/{relative}` keeping the site's path
pub(crate) fn site_endpoint(site: &Url, relative: &str) -> Result<Url> {
    let path = format!("{}/{}", site.path().trim_end_matches('/'), relative);
    site.join(&path)
        .map_err(|e| Error::Settings(format!("invalid endpoint '{}': {}", path, e)))
}

/// Bound one handshake or token exchange by the configured deadline
pub(crate) async fn within_deadline<T>(
    strategy: &'static str,
    endpoint: &str,
    deadline: std::time::Duration,
    attempt: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(deadline, attempt).await {
        Ok(result) => result,
        Err(_) => Err(Error::AuthUnavailable {
            strategy,
            endpoint: endpoint.to_string(),
            reason: format!("no answer within {}", humantime::format_duration(deadline)),
        }),
    }
}

/// Contract shared by every authentication mechanism
pub trait AuthStrategy: Send + Sync {
    /// Stable identifier (`ntlm`, `forms`, `app-only`, ...)
    fn strategy(&self) -> &'static str;

    /// Whether a live session backs the decoration (cookies, negotiated connections)
    fn is_session_based(&self) -> bool;

    /// Decoration for the next request to `target`, authenticating first if needed
    fn get_auth(&self, target: &Url) -> impl Future<Output = Result<Decoration>> + Send;

    fn core(&self) -> &StrategyCore;

    fn core_mut(&mut self) -> &mut StrategyCore;

    /// Client all of this strategy's requests must go through
    fn http(&self) -> reqwest::Client {
        self.core().http().clone()
    }

    /// Configured site URL without a trailing slash; no I/O
    fn site_url(&self) -> &str {
        self.core().config().site_url()
    }

    fn config(&self) -> &StrategyConfig {
        self.core().config()
    }

    /// Whether authorization lives on the connection itself (NTLM, Negotiate)
    ///
    /// Requests of such strategies must not overlap on the transport.
    fn is_connection_bound(&self) -> bool {
        self.core().affinity() == Affinity::Pinned
    }

    /// Current session generation, see [`SessionCache::generation`]
    fn generation(&self) -> u64 {
        self.core().session().generation()
    }

    /// Drop the live session so the next `get_auth` re-authenticates
    fn invalidate(&self) {
        debug!(strategy = self.strategy(), "Session invalidated");
        self.core().session().invalidate();
    }

    /// Drop the session a request was decorated with, unless it is already gone
    fn invalidate_if(&self, generation: u64) -> bool {
        let dropped = self.core().session().invalidate_if(generation);
        if dropped {
            debug!(strategy = self.strategy(), generation, "Session invalidated");
        }
        dropped
    }

    /// Handshakes / token exchanges actually performed
    fn handshakes(&self) -> u64 {
        self.core().session().handshakes()
    }

    /// Set one config field; the live session is dropped
    fn set_field(&mut self, name: &str, value: &str) {
        let core = self.core_mut();
        core.config.set(name, value);
        core.session.invalidate();
    }

    /// Set the master key for this strategy's config file
    ///
    /// Setting a different key than the current one drops the live session.
    fn set_master_key(&mut self, key: impl Into<MasterKey>) {
        let key = key.into();
        let core = self.core_mut();
        if core.store.master_key() != Some(&key) {
            core.session.invalidate();
        }
        core.store.set_master_key(key);
    }

    /// Replace the config with the one stored at `path`
    fn read_config(&mut self, path: &Path) -> Result<()> {
        let strategy = self.strategy();
        let core = self.core_mut();
        let config = core.store.read_config(path)?;
        if config.strategy() != strategy {
            return Err(Error::ConfigCorrupt {
                path: path.to_path_buf(),
                reason: format!("config is for strategy '{}', not '{}'", config.strategy(), strategy),
            });
        }
        core.config = config;
        core.session.invalidate();
        Ok(())
    }

    fn write_config(&self, path: &Path) -> Result<()> {
        let core = self.core();
        core.store.write_config(path, &core.config)
    }
}

/// All strategies, dispatched by match
#[derive(Debug)]
pub enum Strategy {
    Ntlm(NtlmStrategy),
    Windows(NtlmStrategy),
    Forms(FormsStrategy),
    AppOnly(AppOnlyStrategy),
    ClientCert(ClientCertStrategy),
}

impl Strategy {
    /// Pick the variant named by `config.strategy()`
    pub fn from_config(config: StrategyConfig, settings: &Settings) -> Result<Self> {
        match config.strategy() {
            ntlm::NTLM => Ok(Strategy::Ntlm(NtlmStrategy::new(config, settings)?)),
            ntlm::WINDOWS => Ok(Strategy::Windows(NtlmStrategy::windows(config, settings)?)),
            forms::ID => Ok(Strategy::Forms(FormsStrategy::new(config, settings)?)),
            app_only::ID => Ok(Strategy::AppOnly(AppOnlyStrategy::new(config, settings)?)),
            client_cert::ID => Ok(Strategy::ClientCert(ClientCertStrategy::new(config, settings)?)),
            other => Err(Error::UnknownStrategy(other.to_string())),
        }
    }

    /// Load an encrypted config file and build the matching strategy
    pub fn load(path: &Path, master_key: Option<MasterKey>, settings: &Settings) -> Result<Self> {
        let mut store = CredentialStore::from_settings(settings);
        if let Some(key) = &master_key {
            store.set_master_key(key.clone());
        }
        let config = store.read_config(path)?;
        let mut strategy = Self::from_config(config, settings)?;
        if let Some(key) = master_key {
            strategy.set_master_key(key);
        }
        Ok(strategy)
    }
}

macro_rules! dispatch {
    ($self:expr, $s:ident => $body:expr) => {
        match $self {
            Strategy::Ntlm($s) => $body,
            Strategy::Windows($s) => $body,
            Strategy::Forms($s) => $body,
            Strategy::AppOnly($s) => $body,
            Strategy::ClientCert($s) => $body,
        }
    };
}

impl AuthStrategy for Strategy {
    fn strategy(&self) -> &'static str {
        dispatch!(self, s => s.strategy())
    }

    fn is_session_based(&self) -> bool {
        dispatch!(self, s => s.is_session_based())
    }

    async fn get_auth(&self, target: &Url) -> Result<Decoration> {
        dispatch!(self, s => s.get_auth(target).await)
    }

    fn core(&self) -> &StrategyCore {
        dispatch!(self, s => s.core())
    }

    fn core_mut(&mut self) -> &mut StrategyCore {
        dispatch!(self, s => s.core_mut())
    }

    fn http(&self) -> reqwest::Client {
        dispatch!(self, s => s.http())
    }

    fn invalidate(&self) {
        dispatch!(self, s => s.invalidate())
    }

    fn invalidate_if(&self, generation: u64) -> bool {
        dispatch!(self, s => s.invalidate_if(generation))
    }
}
