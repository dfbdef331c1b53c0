//! Multi-round-trip authentication handshakes
//!
//! [`NtlmHandshake`] is an explicit state machine over the NTLM exchange:
//!
//! ```text
//! Init ──401 + scheme──▶ Negotiate ──401 + Type 2──▶ Challenge ──Type 3──▶ Authenticate ──2xx──▶ Done
//!   │                        │                                                  │
//!   └──2xx──▶ Done           └──401 w/o token──▶ Failed                         └──401──▶ Failed
//! ```
//!
//! Each state names what the client has sent last. Feeding a response the
//! current state does not expect is a [`Error::HandshakeSequence`].
//! [`perform`] drives the machine over a pinned `reqwest::Client`.

pub mod ntlm;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::StatusCode;
use tracing::debug;
use url::Url;

use crate::errors::{Error, Result};

pub use ntlm::{NtlmCredentials, Scheme, Type2Message};

/// Named handshake states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Unauthenticated probe sent
    Init,
    /// Type 1 sent
    Negotiate,
    /// Type 2 received, Type 3 not yet built
    Challenge,
    /// Type 3 sent
    Authenticate,
    Done,
    Failed,
}

/// What the driver should do after a response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Resend the probe with this `Authorization` header
    Send(HeaderValue),
    /// Connection is authenticated
    Established,
    /// Server refused the credentials or the scheme
    Rejected { status: u16, reason: String },
    /// Response outside the protocol (5xx, redirects, ...)
    Unexpected { status: u16 },
}

#[derive(Debug)]
pub struct NtlmHandshake {
    state: HandshakeState,
    round: u8,
    scheme: Scheme,
    credentials: NtlmCredentials,
    challenge: Option<Type2Message>,
}

impl NtlmHandshake {
    pub fn new(credentials: NtlmCredentials, scheme: Scheme) -> Self {
        Self {
            state: HandshakeState::Init,
            round: 0,
            scheme,
            credentials,
            challenge: None,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Responses consumed so far
    pub fn round(&self) -> u8 {
        self.round
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    fn violation(&self, what: &str) -> Error {
        Error::HandshakeSequence(format!("{} in state {:?}", what, self.state))
    }

    fn fail(&mut self, status: StatusCode, reason: &str) -> Step {
        self.state = HandshakeState::Failed;
        Step::Rejected {
            status: status.as_u16(),
            reason: reason.to_string(),
        }
    }

    /// Advance on a server response
    pub fn on_response(&mut self, status: StatusCode, headers: &HeaderMap) -> Result<Step> {
        if matches!(
            self.state,
            HandshakeState::Done | HandshakeState::Failed | HandshakeState::Challenge
        ) {
            return Err(self.violation("response received"));
        }
        self.round += 1;

        if status.is_success() {
            self.state = HandshakeState::Done;
            return Ok(Step::Established);
        }
        if status != StatusCode::UNAUTHORIZED {
            self.state = HandshakeState::Failed;
            return Ok(Step::Unexpected { status: status.as_u16() });
        }

        match self.state {
            HandshakeState::Init => {
                if !self.scheme.is_advertised(headers) {
                    return Ok(self.fail(status, "server does not offer this auth scheme"));
                }
                let header = self.scheme.header(&self.credentials.negotiate_message())?;
                self.state = HandshakeState::Negotiate;
                Ok(Step::Send(header))
            }
            HandshakeState::Negotiate => match ntlm::extract_type2_from_header(headers, self.scheme) {
                Ok(type2) => {
                    self.on_challenge(type2)?;
                    self.respond_to_challenge().map(Step::Send)
                }
                Err(Error::InvalidChallenge(reason)) => Ok(self.fail(status, &reason)),
                Err(e) => Err(e),
            },
            HandshakeState::Authenticate => Ok(self.fail(status, "credentials rejected")),
            HandshakeState::Challenge | HandshakeState::Done | HandshakeState::Failed => {
                Err(self.violation("response received"))
            }
        }
    }

    /// Record the server's Type 2 challenge
    pub fn on_challenge(&mut self, type2: Type2Message) -> Result<()> {
        if self.state != HandshakeState::Negotiate {
            return Err(self.violation("challenge received"));
        }
        debug!(
            target_name = type2.target_name.as_deref().unwrap_or(""),
            flags = format_args!("{:#010x}", type2.flags),
            "NTLM challenge received"
        );
        self.challenge = Some(type2);
        self.state = HandshakeState::Challenge;
        Ok(())
    }

    /// Build the Type 3 header for the recorded challenge
    pub fn respond_to_challenge(&mut self) -> Result<HeaderValue> {
        if self.state != HandshakeState::Challenge {
            return Err(self.violation("authenticate requested"));
        }
        let type2 = self
            .challenge
            .take()
            .ok_or_else(|| self.violation("authenticate requested without challenge"))?;
        let type3 = self.credentials.authenticate_message(&type2)?;
        let header = self.scheme.header(&type3)?;
        self.state = HandshakeState::Authenticate;
        Ok(header)
    }
}

/// Result of a completed handshake
#[derive(Debug, Clone)]
pub struct Handshaken {
    pub rounds: u8,
    /// True when the server granted access without challenging
    pub anonymous: bool,
}

/// Drive an NTLM handshake against `probe` over `http`
///
/// Every response body is drained so the connection goes back to the pool
/// and the next round reuses it.
pub async fn perform(
    http: &reqwest::Client,
    probe: &Url,
    mut handshake: NtlmHandshake,
    strategy: &'static str,
) -> Result<Handshaken> {
    let mut authorization: Option<HeaderValue> = None;

    loop {
        let mut request = http.get(probe.clone());
        if let Some(value) = authorization.take() {
            request = request.header(AUTHORIZATION, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::unavailable(strategy, probe.as_str(), &e))?;
        let status = response.status();
        let headers = response.headers().clone();
        let _ = response.bytes().await;

        debug!(
            strategy,
            endpoint = %probe,
            round = handshake.round() + 1,
            state = ?handshake.state(),
            status = status.as_u16(),
            "Handshake round"
        );

        let anonymous = handshake.state() == HandshakeState::Init;
        match handshake.on_response(status, &headers)? {
            Step::Send(value) => authorization = Some(value),
            Step::Established => {
                return Ok(Handshaken {
                    rounds: handshake.round(),
                    anonymous,
                })
            }
            Step::Rejected { status, reason } => {
                return Err(Error::AuthFailed {
                    strategy,
                    endpoint: probe.to_string(),
                    status: Some(status),
                    reason,
                })
            }
            Step::Unexpected { status } => {
                return Err(Error::AuthUnavailable {
                    strategy,
                    endpoint: probe.to_string(),
                    reason: format!("unexpected HTTP {} during handshake", status),
                })
            }
        }
    }
}
