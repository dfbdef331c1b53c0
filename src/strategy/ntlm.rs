//! NTLM and Windows (Negotiate) authentication
//!
//! Both run the same NTLMv2 exchange; they differ only in the scheme token
//! used in `WWW-Authenticate`/`Authorization`. The authenticated state lives
//! on the pinned connection, so the decoration is always empty.

use tracing::info;
use url::Url;

use super::{within_deadline, AuthSession, AuthStrategy, Decoration, StrategyCore};
use crate::client::transport::Affinity;
use crate::config::{fields, Settings, StrategyConfig};
use crate::errors::Result;
use crate::handshake::{self, NtlmCredentials, NtlmHandshake, Scheme};

pub(crate) const NTLM: &str = "ntlm";
pub(crate) const WINDOWS: &str = "windows";

#[derive(Debug)]
pub struct NtlmStrategy {
    id: &'static str,
    scheme: Scheme,
    core: StrategyCore,
}

impl NtlmStrategy {
    pub fn new(config: StrategyConfig, settings: &Settings) -> Result<Self> {
        Ok(Self {
            id: NTLM,
            scheme: Scheme::Ntlm,
            core: StrategyCore::new(config, settings, Affinity::Pinned)?,
        })
    }

    /// Integrated Windows auth over the `Negotiate` scheme
    pub fn windows(config: StrategyConfig, settings: &Settings) -> Result<Self> {
        Ok(Self {
            id: WINDOWS,
            scheme: Scheme::Negotiate,
            core: StrategyCore::new(config, settings, Affinity::Pinned)?,
        })
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    fn credentials(&self) -> Result<NtlmCredentials> {
        let config = self.core.config();
        let username = config.require(self.id, fields::USERNAME)?;
        let password = config.require(self.id, fields::PASSWORD)?;
        let domain = config.get(fields::DOMAIN);
        Ok(NtlmCredentials::new(username, password, domain).workstation(config.get(fields::WORKSTATION)))
    }
}

impl AuthStrategy for NtlmStrategy {
    fn strategy(&self) -> &'static str {
        self.id
    }

    fn is_session_based(&self) -> bool {
        true
    }

    async fn get_auth(&self, _target: &Url) -> Result<Decoration> {
        let site = self.core.site(self.id)?;
        let credentials = self.credentials()?;
        let http = self.core.http().clone();
        let deadline = self.core.settings().handshake_timeout;
        let (id, scheme) = (self.id, self.scheme);

        let session = self
            .core
            .session()
            .get_or_establish(move || async move {
                let handshake = NtlmHandshake::new(credentials, scheme);
                let done = within_deadline(id, site.as_str(), deadline, async {
                    handshake::perform(&http, &site, handshake, id).await
                })
                .await?;
                info!(
                    strategy = id,
                    endpoint = %site,
                    rounds = done.rounds,
                    anonymous = done.anonymous,
                    "Session established"
                );
                Ok(AuthSession::new(Decoration::none(), None))
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
    use crate::errors::Error;

    #[tokio::test]
    async fn test_missing_password() {
        let config = StrategyConfig::new(NTLM)
            .with(fields::SITE_URL, "http://127.0.0.1:9/sites/dev")
            .with(fields::USERNAME, "alice");
        let strategy = NtlmStrategy::new(config, &Settings::default()).unwrap();
        let target = Url::parse("http://127.0.0.1:9/sites/dev/_api/web").unwrap();

        let err = strategy.get_auth(&target).await.unwrap_err();
        assert_eq!(err, Error::MissingField { strategy: NTLM, field: fields::PASSWORD });
        assert_eq!(strategy.handshakes(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_server_is_unavailable() {
        let config = StrategyConfig::new(WINDOWS)
            .with(fields::SITE_URL, "http://127.0.0.1:9/sites/dev")
            .with(fields::USERNAME, "alice")
            .with(fields::PASSWORD, "secret");
        let strategy = NtlmStrategy::windows(config, &Settings::default()).unwrap();
        assert_eq!(strategy.scheme(), Scheme::Negotiate);

        let target = Url::parse("http://127.0.0.1:9/sites/dev").unwrap();
        let err = strategy.get_auth(&target).await.unwrap_err();
        assert!(matches!(err, Error::AuthUnavailable { strategy: WINDOWS, .. }));
        assert!(err.is_retryable());
    }
}
