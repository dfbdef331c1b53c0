//! collabauth library interface
//!
//! Authentication for SharePoint-style collaboration servers: pluggable
//! credential strategies, encrypted credential storage, request digest
//! caching and a client that decorates and retries requests.
//!
//! # Module Organization
//!
//! - [`client`] - [`Client`], the authenticating request decorator
//! - [`strategy`] - [`AuthStrategy`] and its variants (NTLM, Windows, Forms, App-Only, Client-Cert)
//! - [`handshake`] - NTLM message codec and handshake state machine
//! - [`digest`] - Request digest cache
//! - [`store`] - Encrypted config files ([`CredentialStore`])
//! - [`config`] - [`Settings`] and [`StrategyConfig`]
//! - [`sync`] - Single-flight request coalescing
//! - [`errors`] - Error types ([`Error`], [`Result`])
//!
//! ```no_run
//! # async fn run() -> collabauth::Result<()> {
//! use collabauth::{fields, Client, Settings, StrategyConfig};
//!
//! let config = StrategyConfig::new("ntlm")
//!     .with(fields::SITE_URL, "http://intranet/sites/dev")
//!     .with(fields::USERNAME, "CONTOSO\\alice")
//!     .with(fields::PASSWORD, "secret");
//! let client = Client::from_config(config, &Settings::default())?;
//!
//! let request = client
//!     .request(reqwest::Method::POST, "http://intranet/sites/dev/_api/web/lists")
//!     .build()
//!     .map_err(|e| collabauth::Error::Settings(e.to_string()))?;
//! let response = client.execute(request).await?;
//! println!("{}", response.status());
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod digest;
pub mod errors;
pub mod handshake;
pub mod store;
pub mod strategy;
pub mod sync;

pub use client::Client;
pub use config::{fields, Settings, StrategyConfig};
pub use digest::{DigestCache, DigestEntry};
pub use errors::{Error, Result};
pub use store::{CredentialStore, MasterKey};
pub use strategy::{AuthStrategy, Decoration, Strategy};
