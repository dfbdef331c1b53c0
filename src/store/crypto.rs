//! HKDF-SHA256 + ChaCha20-Poly1305 sealing for config files.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;

use super::MasterKey;

/// Nonce size for ChaCha20-Poly1305 (12 bytes / 96 bits).
pub const NONCE_SIZE: usize = 12;

/// Per-file HKDF salt size.
pub const SALT_SIZE: usize = 16;

const KEY_SIZE: usize = 32;
const HKDF_INFO_PREFIX: &[u8] = b"collabauth-config-v1:";

/// Output of [`seal`]: everything needed to open the payload again.
pub struct Sealed {
    pub salt: [u8; SALT_SIZE],
    pub nonce: [u8; NONCE_SIZE],
    pub ciphertext: Vec<u8>,
}

/// AEAD failure: wrong key, wrong strategy, or tampering when opening.
#[derive(Debug)]
pub struct CipherError;

fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::rng().fill_bytes(&mut bytes);
    bytes
}

/// Derive the symmetric key; the strategy name is bound into the HKDF info.
fn derive_key(master: &MasterKey, salt: &[u8], strategy: &str) -> [u8; KEY_SIZE] {
    let hkdf = Hkdf::<Sha256>::new(Some(salt), master.as_bytes());
    let mut info = Vec::with_capacity(HKDF_INFO_PREFIX.len() + strategy.len());
    info.extend_from_slice(HKDF_INFO_PREFIX);
    info.extend_from_slice(strategy.as_bytes());

    let mut okm = [0u8; KEY_SIZE];
    // 32 bytes is far below the HKDF-SHA256 output limit
    let _ = hkdf.expand(&info, &mut okm);
    okm
}

pub fn seal(master: &MasterKey, strategy: &str, plaintext: &[u8]) -> Result<Sealed, CipherError> {
    let salt = random_bytes::<SALT_SIZE>();
    let nonce = random_bytes::<NONCE_SIZE>();
    let key = derive_key(master, &salt, strategy);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CipherError)?;

    Ok(Sealed { salt, nonce, ciphertext })
}

pub fn open(
    master: &MasterKey,
    strategy: &str,
    salt: &[u8],
    nonce: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CipherError> {
    if nonce.len() != NONCE_SIZE || salt.len() != SALT_SIZE {
        return Err(CipherError);
    }

    let key = derive_key(master, salt, strategy);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CipherError)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open() {
        let key = MasterKey::from("k");
        let sealed = seal(&key, "ntlm", b"{\"a\":1}").unwrap();
        assert_ne!(sealed.ciphertext, b"{\"a\":1}");

        let opened = open(&key, "ntlm", &sealed.salt, &sealed.nonce, &sealed.ciphertext).unwrap();
        assert_eq!(opened, b"{\"a\":1}");
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = seal(&MasterKey::from("one"), "ntlm", b"secret").unwrap();
        assert!(open(&MasterKey::from("two"), "ntlm", &sealed.salt, &sealed.nonce, &sealed.ciphertext).is_err());
    }

    #[test]
    fn test_strategy_is_bound() {
        let key = MasterKey::from("k");
        let sealed = seal(&key, "ntlm", b"secret").unwrap();
        assert!(open(&key, "forms", &sealed.salt, &sealed.nonce, &sealed.ciphertext).is_err());
    }

    #[test]
    fn test_fresh_nonce_per_seal() {
        let key = MasterKey::from("k");
        let a = seal(&key, "ntlm", b"same").unwrap();
        let b = seal(&key, "ntlm", b"same").unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_bad_nonce_length() {
        let key = MasterKey::from("k");
        let sealed = seal(&key, "ntlm", b"x").unwrap();
        assert!(open(&key, "ntlm", &sealed.salt, &[0u8; 4], &sealed.ciphertext).is_err());
    }
}
