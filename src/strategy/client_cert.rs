//! Mutual-TLS authentication with a PEM client certificate

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{info, warn};
use url::Url;

use super::{AuthStrategy, Decoration, StrategyCore};
use crate::client::transport::{self, Affinity};
use crate::config::{fields, Settings, StrategyConfig};
use crate::errors::Result;

pub(crate) const ID: &str = "client-cert";

#[derive(Debug)]
struct Loaded {
    cert_path: PathBuf,
    key_path: Option<PathBuf>,
    http: reqwest::Client,
}

/// The identity is loaded on first use and reloaded when the configured paths change
#[derive(Debug)]
pub struct ClientCertStrategy {
    core: StrategyCore,
    loaded: Mutex<Option<Loaded>>,
}

impl ClientCertStrategy {
    pub fn new(config: StrategyConfig, settings: &Settings) -> Result<Self> {
        Ok(Self {
            core: StrategyCore::new(config, settings, Affinity::Pooled)?,
            loaded: Mutex::new(None),
        })
    }

    fn paths(&self) -> Result<(PathBuf, Option<PathBuf>)> {
        let config = self.core.config();
        let cert = PathBuf::from(config.require(ID, fields::CERT_PATH)?);
        let key = config.get(fields::KEY_PATH).map(PathBuf::from);
        Ok((cert, key))
    }

    /// Client carrying the configured identity, building it if needed
    fn identity_client(&self) -> Result<reqwest::Client> {
        let (cert_path, key_path) = self.paths()?;
        let mut guard = self.loaded.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(loaded) = guard.as_ref() {
            if loaded.cert_path == cert_path && loaded.key_path == key_path {
                return Ok(loaded.http.clone());
            }
        }

        let identity = transport::load_identity(&cert_path, key_path.as_deref())?;
        let http = transport::build_http(self.core.settings(), Affinity::Pooled, Some(identity))?;
        info!(strategy = ID, cert = %cert_path.display(), "Client identity loaded");

        *guard = Some(Loaded {
            cert_path,
            key_path,
            http: http.clone(),
        });
        Ok(http)
    }

    fn drop_identity(&self) {
        let mut guard = self.loaded.lock().unwrap_or_else(|e| e.into_inner());
        *guard = None;
    }

    pub fn cert_path(&self) -> Option<&Path> {
        self.core.config().get(fields::CERT_PATH).map(Path::new)
    }
}

impl AuthStrategy for ClientCertStrategy {
    fn strategy(&self) -> &'static str {
        ID
    }

    fn is_session_based(&self) -> bool {
        false
    }

    async fn get_auth(&self, _target: &Url) -> Result<Decoration> {
        self.identity_client()?;
        Ok(Decoration::none())
    }

    fn core(&self) -> &StrategyCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StrategyCore {
        &mut self.core
    }

    /// Identity-bearing client; falls back to the plain one when the identity
    /// cannot be loaded, in which case `get_auth` reports the error
    fn http(&self) -> reqwest::Client {
        match self.identity_client() {
            Ok(http) => http,
            Err(e) => {
                warn!(strategy = ID, error = %e, "Client identity unavailable, using a client without certificate");
                self.core.http().clone()
            }
        }
    }

    fn invalidate(&self) {
        self.drop_identity();
        self.core.session().invalidate();
    }

    fn invalidate_if(&self, generation: u64) -> bool {
        let dropped = self.core.session().invalidate_if(generation);
        if dropped {
            self.drop_identity();
        }
        dropped
    }
}
