//! Encrypted persistence of strategy configuration
//!
//! A config file is a small JSON envelope around a sealed payload:
//!
//! ```json
//! { "version": 1, "strategy": "ntlm", "kdf": "hkdf-sha256",
//!   "cipher": "chacha20poly1305", "salt": "...", "nonce": "...", "ciphertext": "..." }
//! ```
//!
//! The payload is the JSON form of [`StrategyConfig`]. Writes go through a
//! temp file in the target directory followed by a rename, so a crash never
//! leaves a half-written config behind.

mod crypto;
mod master_key;

pub use master_key::MasterKey;

use std::borrow::Cow;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::Path;

use base64::Engine;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::config::{Settings, StrategyConfig};
use crate::errors::{Error, Result};

const ENVELOPE_VERSION: u32 = 1;
const KDF_NAME: &str = "hkdf-sha256";
const CIPHER_NAME: &str = "chacha20poly1305";

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    version: u32,
    strategy: String,
    kdf: String,
    cipher: String,
    salt: String,
    nonce: String,
    ciphertext: String,
}

/// Reads and writes encrypted [`StrategyConfig`] files
#[derive(Debug, Clone)]
pub struct CredentialStore {
    master_key: Option<MasterKey>,
    create_dirs: bool,
    require_master_key: bool,
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            master_key: None,
            create_dirs: settings.create_dirs,
            require_master_key: settings.require_master_key,
        }
    }

    /// Set the master key used for subsequent reads and writes
    ///
    /// Configs that were already loaded are not re-encrypted.
    pub fn set_master_key(&mut self, key: impl Into<MasterKey>) {
        self.master_key = Some(key.into());
    }

    pub fn master_key(&self) -> Option<&MasterKey> {
        self.master_key.as_ref()
    }

    pub fn create_dirs(mut self, enabled: bool) -> Self {
        self.create_dirs = enabled;
        self
    }

    pub fn require_master_key(mut self, required: bool) -> Self {
        self.require_master_key = required;
        self
    }

    fn key_for(&self, strategy: &str) -> Result<Cow<'_, MasterKey>> {
        match &self.master_key {
            Some(key) => Ok(Cow::Borrowed(key)),
            None if self.require_master_key => Err(Error::MasterKeyMissing {
                strategy: strategy.to_string(),
            }),
            None => {
                warn!(strategy, "No master key set, using machine default key");
                Ok(Cow::Owned(MasterKey::machine_default(strategy)))
            }
        }
    }

    /// Load and decrypt a config file
    pub fn read_config(&self, path: &Path) -> Result<StrategyConfig> {
        let raw = fs::read(path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => Error::ConfigNotFound { path: path.to_path_buf() },
            _ => corrupt(path, format!("unreadable: {}", e)),
        })?;

        let envelope: Envelope = serde_json::from_slice(&raw)
            .map_err(|e| corrupt(path, format!("invalid envelope: {}", e)))?;

        if envelope.version != ENVELOPE_VERSION {
            return Err(corrupt(path, format!("unsupported version {}", envelope.version)));
        }
        if envelope.kdf != KDF_NAME || envelope.cipher != CIPHER_NAME {
            return Err(corrupt(
                path,
                format!("unsupported scheme {}/{}", envelope.kdf, envelope.cipher),
            ));
        }

        let b64 = base64::engine::general_purpose::STANDARD;
        let decode = |field: &str, value: &str| {
            b64.decode(value)
                .map_err(|e| corrupt(path, format!("bad base64 in {}: {}", field, e)))
        };
        let salt = decode("salt", &envelope.salt)?;
        let nonce = decode("nonce", &envelope.nonce)?;
        let ciphertext = decode("ciphertext", &envelope.ciphertext)?;

        let key = self.key_for(&envelope.strategy)?;
        let plaintext = crypto::open(&key, &envelope.strategy, &salt, &nonce, &ciphertext)
            .map_err(|_| corrupt(path, "decryption failed (wrong key or tampered file)"))?;

        let config: StrategyConfig = serde_json::from_slice(&plaintext)
            .map_err(|e| corrupt(path, format!("invalid payload: {}", e)))?;

        if config.strategy() != envelope.strategy {
            return Err(corrupt(path, "payload strategy does not match envelope"));
        }

        debug!(path = %path.display(), strategy = config.strategy(), "Config loaded");
        Ok(config)
    }

    /// Encrypt and atomically write a config file
    pub fn write_config(&self, path: &Path, config: &StrategyConfig) -> Result<()> {
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };

        if !parent.exists() {
            if !self.create_dirs {
                return Err(unwritable(path, "parent directory does not exist"));
            }
            fs::create_dir_all(parent)
                .map_err(|e| unwritable(path, format!("cannot create directory: {}", e)))?;
        }

        let key = self.key_for(config.strategy())?;
        let payload = serde_json::to_vec(config)
            .map_err(|e| unwritable(path, format!("serialization failed: {}", e)))?;
        let sealed = crypto::seal(&key, config.strategy(), &payload)
            .map_err(|_| unwritable(path, "encryption failed"))?;

        let b64 = base64::engine::general_purpose::STANDARD;
        let envelope = Envelope {
            version: ENVELOPE_VERSION,
            strategy: config.strategy().to_string(),
            kdf: KDF_NAME.to_string(),
            cipher: CIPHER_NAME.to_string(),
            salt: b64.encode(sealed.salt),
            nonce: b64.encode(sealed.nonce),
            ciphertext: b64.encode(&sealed.ciphertext),
        };
        let content = serde_json::to_string_pretty(&envelope)
            .map_err(|e| unwritable(path, format!("serialization failed: {}", e)))?;

        let mut temp = NamedTempFile::new_in(parent)
            .map_err(|e| unwritable(path, format!("cannot create temp file: {}", e)))?;

        // Restrict permissions before any secret bytes land on disk
        restrict_permissions(temp.as_file(), path)?;

        temp.write_all(content.as_bytes())
            .and_then(|_| temp.as_file().sync_all())
            .map_err(|e| unwritable(path, format!("write failed: {}", e)))?;

        temp.persist(path)
            .map_err(|e| unwritable(path, format!("rename failed: {}", e.error)))?;

        debug!(path = %path.display(), strategy = config.strategy(), "Config written");
        Ok(())
    }
}

#[cfg(unix)]
fn restrict_permissions(file: &fs::File, path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(0o600))
        .map_err(|e| unwritable(path, format!("cannot restrict permissions: {}", e)))
}

#[cfg(not(unix))]
fn restrict_permissions(_file: &fs::File, _path: &Path) -> Result<()> {
    Ok(())
}

fn corrupt(path: &Path, reason: impl Into<String>) -> Error {
    Error::ConfigCorrupt {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

fn unwritable(path: &Path, reason: impl Into<String>) -> Error {
    Error::PathUnwritable {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}
