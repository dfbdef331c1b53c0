//! NTLM message codec (NTLMv2)
//!
//! The NTLM flow:
//! 1. Client sends Type 1 (Negotiate) message
//! 2. Server responds with Type 2 (Challenge) message containing a nonce
//! 3. Client sends Type 3 (Authenticate) message with the NTLMv2 response
//!
//! Messages travel base64-encoded in `Authorization` / `WWW-Authenticate`
//! under either the `NTLM` or the `Negotiate` scheme.

use base64::Engine;
use hmac::{Hmac, Mac};
use md4::{Digest as Md4Digest, Md4};
use md5_digest::Md5;
use reqwest::header::{HeaderMap, HeaderValue, WWW_AUTHENTICATE};

use crate::errors::{Error, Result};

// NTLM Flag constants
pub const NTLM_NEGOTIATE_UNICODE: u32 = 0x00000001;
pub const NTLM_NEGOTIATE_OEM: u32 = 0x00000002;
pub const NTLM_REQUEST_TARGET: u32 = 0x00000004;
pub const NTLM_NEGOTIATE_NTLM: u32 = 0x00000200;
pub const NTLM_NEGOTIATE_OEM_DOMAIN_SUPPLIED: u32 = 0x00001000;
pub const NTLM_NEGOTIATE_OEM_WORKSTATION_SUPPLIED: u32 = 0x00002000;
pub const NTLM_NEGOTIATE_ALWAYS_SIGN: u32 = 0x00008000;
pub const NTLM_NEGOTIATE_EXTENDED_SESSIONSECURITY: u32 = 0x00080000;
pub const NTLM_NEGOTIATE_TARGET_INFO: u32 = 0x00800000;
pub const NTLM_NEGOTIATE_128: u32 = 0x20000000;
pub const NTLM_NEGOTIATE_56: u32 = 0x80000000;

const SIGNATURE: &[u8; 8] = b"NTLMSSP\0";
const TYPE1_HEADER_LEN: u32 = 32;
const TYPE3_HEADER_LEN: u32 = 64;

// AV_PAIR ids used from the Type 2 target info
const MSV_AV_EOL: u16 = 0x0000;
const MSV_AV_TIMESTAMP: u16 = 0x0007;

type HmacMd5 = Hmac<Md5>;

/// HTTP auth scheme carrying the NTLM tokens
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Ntlm,
    /// SPNEGO wrapper; NTLM inner tokens are sent raw, which IIS accepts
    Negotiate,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Ntlm => "NTLM",
            Scheme::Negotiate => "Negotiate",
        }
    }

    /// Whether a `WWW-Authenticate` challenge advertises this scheme
    pub fn is_advertised(&self, headers: &HeaderMap) -> bool {
        headers
            .get_all(WWW_AUTHENTICATE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .any(|v| {
                let name = v.split_whitespace().next().unwrap_or("");
                name.eq_ignore_ascii_case(self.as_str())
            })
    }

    /// Build an `Authorization` header value for a raw NTLM message
    pub fn header(&self, message: &[u8]) -> Result<HeaderValue> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(message);
        HeaderValue::from_str(&format!("{} {}", self.as_str(), encoded))
            .map_err(|e| Error::InvalidHeader(e.to_string()))
    }
}

/// NTLM credentials
#[derive(Clone)]
pub struct NtlmCredentials {
    username: String,
    password: String,
    domain: Option<String>,
    workstation: Option<String>,
}

impl std::fmt::Debug for NtlmCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NtlmCredentials")
            .field("username", &self.username)
            .field("domain", &self.domain)
            .field("workstation", &self.workstation)
            .finish_non_exhaustive()
    }
}

impl NtlmCredentials {
    /// Username can be in formats: "user", "DOMAIN\\user", or "user@domain".
    /// An explicit `domain` takes precedence over one embedded in the username.
    pub fn new(username: &str, password: impl Into<String>, domain: Option<&str>) -> Self {
        let (user, embedded) = Self::parse_username(username);
        Self {
            username: user,
            password: password.into(),
            domain: domain.map(str::to_string).or(embedded),
            workstation: None,
        }
    }

    pub fn workstation(mut self, name: Option<&str>) -> Self {
        self.workstation = name.map(str::to_string);
        self
    }

    fn parse_username(username: &str) -> (String, Option<String>) {
        // DOMAIN\user format
        if let Some((domain, user)) = username.split_once('\\') {
            return (user.to_string(), Some(domain.to_string()));
        }
        // user@domain format
        if let Some((user, domain)) = username.split_once('@') {
            return (user.to_string(), Some(domain.to_string()));
        }
        (username.to_string(), None)
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    /// NTLM Type 1 (Negotiate) message
    pub fn negotiate_message(&self) -> Vec<u8> {
        let domain = self.domain.as_deref().unwrap_or("").to_uppercase().into_bytes();
        let workstation = self.workstation.as_deref().unwrap_or("").to_uppercase().into_bytes();

        let mut flags: u32 = NTLM_NEGOTIATE_UNICODE
            | NTLM_NEGOTIATE_OEM
            | NTLM_REQUEST_TARGET
            | NTLM_NEGOTIATE_NTLM
            | NTLM_NEGOTIATE_ALWAYS_SIGN
            | NTLM_NEGOTIATE_EXTENDED_SESSIONSECURITY
            | NTLM_NEGOTIATE_TARGET_INFO
            | NTLM_NEGOTIATE_128
            | NTLM_NEGOTIATE_56;
        if !domain.is_empty() {
            flags |= NTLM_NEGOTIATE_OEM_DOMAIN_SUPPLIED;
        }
        if !workstation.is_empty() {
            flags |= NTLM_NEGOTIATE_OEM_WORKSTATION_SUPPLIED;
        }

        let domain_offset = TYPE1_HEADER_LEN;
        let workstation_offset = domain_offset + domain.len() as u32;

        let mut msg = Vec::with_capacity(TYPE1_HEADER_LEN as usize + domain.len() + workstation.len());
        msg.extend_from_slice(SIGNATURE);
        msg.extend_from_slice(&1u32.to_le_bytes());
        msg.extend_from_slice(&flags.to_le_bytes());
        push_security_buffer(&mut msg, domain.len(), domain_offset);
        push_security_buffer(&mut msg, workstation.len(), workstation_offset);
        msg.extend_from_slice(&domain);
        msg.extend_from_slice(&workstation);
        msg
    }

    /// NTLM Type 3 (Authenticate) message with a fresh client challenge
    pub fn authenticate_message(&self, type2: &Type2Message) -> Result<Vec<u8>> {
        use rand::RngCore;

        let mut client_challenge = [0u8; 8];
        rand::rng().fill_bytes(&mut client_challenge);
        let timestamp = type2.timestamp().unwrap_or_else(filetime_now);

        self.authenticate_message_with(type2, &client_challenge, timestamp)
    }

    /// NTLM Type 3 (Authenticate) message for a given client challenge and timestamp
    pub fn authenticate_message_with(
        &self,
        type2: &Type2Message,
        client_challenge: &[u8; 8],
        timestamp: [u8; 8],
    ) -> Result<Vec<u8>> {
        let domain = self.domain.as_deref().unwrap_or("");
        let workstation = self.workstation.as_deref().unwrap_or("");

        let ntowf = ntowf_v2(&self.password, &self.username, domain)?;
        let nt_response = ntlmv2_response(
            &ntowf,
            &type2.server_challenge,
            client_challenge,
            timestamp,
            type2.target_info.as_deref(),
        )?;
        let lm_response = lmv2_response(&ntowf, &type2.server_challenge, client_challenge)?;

        let domain_bytes = to_utf16le(domain);
        let username_bytes = to_utf16le(&self.username);
        let workstation_bytes = to_utf16le(workstation);

        let lm_offset = TYPE3_HEADER_LEN;
        let nt_offset = lm_offset + lm_response.len() as u32;
        let domain_offset = nt_offset + nt_response.len() as u32;
        let username_offset = domain_offset + domain_bytes.len() as u32;
        let workstation_offset = username_offset + username_bytes.len() as u32;
        let session_key_offset = workstation_offset + workstation_bytes.len() as u32;

        let mut msg = Vec::with_capacity(session_key_offset as usize);
        msg.extend_from_slice(SIGNATURE);
        msg.extend_from_slice(&3u32.to_le_bytes());
        push_security_buffer(&mut msg, lm_response.len(), lm_offset);
        push_security_buffer(&mut msg, nt_response.len(), nt_offset);
        push_security_buffer(&mut msg, domain_bytes.len(), domain_offset);
        push_security_buffer(&mut msg, username_bytes.len(), username_offset);
        push_security_buffer(&mut msg, workstation_bytes.len(), workstation_offset);
        // Encrypted random session key (empty, no key exchange)
        push_security_buffer(&mut msg, 0, session_key_offset);
        msg.extend_from_slice(&(type2.flags & !NTLM_NEGOTIATE_OEM).to_le_bytes());

        msg.extend_from_slice(&lm_response);
        msg.extend_from_slice(&nt_response);
        msg.extend_from_slice(&domain_bytes);
        msg.extend_from_slice(&username_bytes);
        msg.extend_from_slice(&workstation_bytes);

        Ok(msg)
    }
}

fn push_security_buffer(msg: &mut Vec<u8>, len: usize, offset: u32) {
    msg.extend_from_slice(&(len as u16).to_le_bytes()); // length
    msg.extend_from_slice(&(len as u16).to_le_bytes()); // max_length
    msg.extend_from_slice(&offset.to_le_bytes());
}

/// NT hash = MD4(UTF16LE(password))
pub fn nt_hash(password: &str) -> [u8; 16] {
    let mut md4 = Md4::new();
    md4.update(to_utf16le(password));
    let mut hash = [0u8; 16];
    hash.copy_from_slice(&md4.finalize());
    hash
}

fn hmac_md5(key: &[u8], parts: &[&[u8]]) -> Result<[u8; 16]> {
    let mut mac = HmacMd5::new_from_slice(key)
        .map_err(|e| Error::InvalidChallenge(format!("HMAC error: {}", e)))?;
    for part in parts {
        mac.update(part);
    }
    let mut out = [0u8; 16];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// NTOWFv2 = HMAC-MD5(NT hash, UTF16LE(UPPERCASE(user) + domain))
pub fn ntowf_v2(password: &str, username: &str, domain: &str) -> Result<[u8; 16]> {
    let user_domain = format!("{}{}", username.to_uppercase(), domain);
    hmac_md5(&nt_hash(password), &[&to_utf16le(&user_domain)])
}

/// NTLMv2 blob: version, reserved, timestamp, client challenge, target info
pub fn ntlmv2_blob(client_challenge: &[u8; 8], timestamp: [u8; 8], target_info: Option<&[u8]>) -> Vec<u8> {
    let mut blob = Vec::with_capacity(32 + target_info.map(<[u8]>::len).unwrap_or(0));
    blob.extend_from_slice(&[0x01, 0x01]); // Blob version
    blob.extend_from_slice(&[0x00, 0x00]); // Reserved
    blob.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]); // Reserved
    blob.extend_from_slice(&timestamp);
    blob.extend_from_slice(client_challenge);
    blob.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]); // Reserved
    if let Some(info) = target_info {
        blob.extend_from_slice(info);
    }
    blob.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]); // Terminator
    blob
}

/// NT response = HMAC-MD5(NTOWFv2, server_challenge + blob) + blob
pub fn ntlmv2_response(
    ntowf: &[u8; 16],
    server_challenge: &[u8; 8],
    client_challenge: &[u8; 8],
    timestamp: [u8; 8],
    target_info: Option<&[u8]>,
) -> Result<Vec<u8>> {
    let blob = ntlmv2_blob(client_challenge, timestamp, target_info);
    let nt_proof = hmac_md5(ntowf, &[server_challenge, &blob])?;

    let mut response = Vec::with_capacity(16 + blob.len());
    response.extend_from_slice(&nt_proof);
    response.extend_from_slice(&blob);
    Ok(response)
}

/// LMv2 response = HMAC-MD5(NTOWFv2, server_challenge + client_challenge) + client_challenge
pub fn lmv2_response(
    ntowf: &[u8; 16],
    server_challenge: &[u8; 8],
    client_challenge: &[u8; 8],
) -> Result<Vec<u8>> {
    let proof = hmac_md5(ntowf, &[server_challenge, client_challenge])?;
    let mut response = Vec::with_capacity(24);
    response.extend_from_slice(&proof);
    response.extend_from_slice(client_challenge);
    Ok(response)
}

fn to_utf16le(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(|c| c.to_le_bytes()).collect()
}

/// Current time as Windows FILETIME (100ns intervals since 1601)
fn filetime_now() -> [u8; 8] {
    use std::time::{SystemTime, UNIX_EPOCH};

    const EPOCH_DIFF: u64 = 116444736000000000;

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();

    let filetime = now.as_secs() * 10_000_000 + now.subsec_nanos() as u64 / 100 + EPOCH_DIFF;
    filetime.to_le_bytes()
}

/// Parsed Type 2 (Challenge) message from server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Type2Message {
    /// Server challenge nonce (8 bytes)
    pub server_challenge: [u8; 8],
    /// Negotiate flags from server
    pub flags: u32,
    /// Target name (domain/server name)
    pub target_name: Option<String>,
    /// Target info blob (AV_PAIRs for NTLMv2)
    pub target_info: Option<Vec<u8>>,
}

impl Type2Message {
    /// Server timestamp from the MsvAvTimestamp AV pair, if present
    pub fn timestamp(&self) -> Option<[u8; 8]> {
        let info = self.target_info.as_deref()?;
        let mut pos = 0;
        while pos + 4 <= info.len() {
            let id = u16::from_le_bytes([info[pos], info[pos + 1]]);
            let len = u16::from_le_bytes([info[pos + 2], info[pos + 3]]) as usize;
            let value = info.get(pos + 4..pos + 4 + len)?;
            match id {
                MSV_AV_EOL => return None,
                MSV_AV_TIMESTAMP if len == 8 => {
                    let mut ts = [0u8; 8];
                    ts.copy_from_slice(value);
                    return Some(ts);
                }
                _ => pos += 4 + len,
            }
        }
        None
    }
}

fn security_buffer(data: &[u8], at: usize) -> Option<&[u8]> {
    let header = data.get(at..at + 8)?;
    let len = u16::from_le_bytes([header[0], header[1]]) as usize;
    let offset = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
    if len == 0 {
        return None;
    }
    data.get(offset..offset.checked_add(len)?)
}

/// Parse a Type 2 (Challenge) message from the server
pub fn parse_type2_message(data: &[u8]) -> Result<Type2Message> {
    if data.len() < 32 {
        return Err(Error::InvalidChallenge("Type 2 message too short".to_string()));
    }

    if &data[0..8] != SIGNATURE {
        return Err(Error::InvalidChallenge("Invalid NTLM signature".to_string()));
    }

    let msg_type = u32::from_le_bytes([data[8], data[9], data[10], data[11]]);
    if msg_type != 2 {
        return Err(Error::InvalidChallenge(format!(
            "Expected Type 2 message, got Type {}",
            msg_type
        )));
    }

    let flags = u32::from_le_bytes([data[20], data[21], data[22], data[23]]);

    let mut server_challenge = [0u8; 8];
    server_challenge.copy_from_slice(&data[24..32]);

    let target_name = security_buffer(data, 12).map(|bytes| {
        let units: Vec<u16> = bytes
            .chunks(2)
            .map(|c| u16::from_le_bytes([c[0], c.get(1).copied().unwrap_or(0)]))
            .collect();
        String::from_utf16_lossy(&units)
    });

    let target_info = if flags & NTLM_NEGOTIATE_TARGET_INFO != 0 {
        security_buffer(data, 40).map(<[u8]>::to_vec)
    } else {
        None
    };

    Ok(Type2Message {
        server_challenge,
        flags,
        target_name,
        target_info,
    })
}

/// Extract the Type 2 message from a `WWW-Authenticate` challenge
pub fn extract_type2_from_header(headers: &HeaderMap, scheme: Scheme) -> Result<Type2Message> {
    let prefix = format!("{} ", scheme.as_str());
    let token = headers
        .get_all(WWW_AUTHENTICATE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find_map(|v| {
            let head = v.get(..prefix.len())?;
            head.eq_ignore_ascii_case(&prefix).then(|| v[prefix.len()..].trim())
        })
        .filter(|t| !t.is_empty())
        .ok_or_else(|| {
            Error::InvalidChallenge(format!("no {} token in WWW-Authenticate", scheme.as_str()))
        })?;

    let decoded = base64::engine::general_purpose::STANDARD
        .decode(token)
        .map_err(|e| Error::InvalidChallenge(format!("Base64 decode error: {}", e)))?;

    parse_type2_message(&decoded)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    // MS-NLMP 4.2.4 NTLMv2 test vectors
    pub(crate) const USER: &str = "User";
    pub(crate) const DOMAIN: &str = "Domain";
    pub(crate) const PASSWORD: &str = "Password";
    pub(crate) const SERVER_CHALLENGE: [u8; 8] = [0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef];
    pub(crate) const CLIENT_CHALLENGE: [u8; 8] = [0xaa; 8];
    pub(crate) const TARGET_INFO: [u8; 36] = [
        0x02, 0x00, 0x0c, 0x00, 0x44, 0x00, 0x6f, 0x00, 0x6d, 0x00, 0x61, 0x00, 0x69, 0x00, 0x6e,
        0x00, 0x01, 0x00, 0x0c, 0x00, 0x53, 0x00, 0x65, 0x00, 0x72, 0x00, 0x76, 0x00, 0x65, 0x00,
        0x72, 0x00, 0x00, 0x00, 0x00, 0x00,
    ];

    /// Build a Type 2 message carrying the test vector challenge and target info
    pub(crate) fn type2_bytes() -> Vec<u8> {
        let target_name = to_utf16le("Domain");
        let name_offset = 48u32;
        let info_offset = name_offset + target_name.len() as u32;
        let flags = NTLM_NEGOTIATE_UNICODE | NTLM_NEGOTIATE_NTLM | NTLM_NEGOTIATE_TARGET_INFO;

        let mut msg = Vec::new();
        msg.extend_from_slice(SIGNATURE);
        msg.extend_from_slice(&2u32.to_le_bytes());
        push_security_buffer(&mut msg, target_name.len(), name_offset);
        msg.extend_from_slice(&flags.to_le_bytes());
        msg.extend_from_slice(&SERVER_CHALLENGE);
        msg.extend_from_slice(&[0u8; 8]); // Reserved
        push_security_buffer(&mut msg, TARGET_INFO.len(), info_offset);
        msg.extend_from_slice(&target_name);
        msg.extend_from_slice(&TARGET_INFO);
        msg
    }

    fn read_field(msg: &[u8], at: usize) -> &[u8] {
        security_buffer(msg, at).unwrap_or(&[])
    }

    #[test]
    fn test_parse_domain_backslash() {
        let creds = NtlmCredentials::new("DOMAIN\\user", "pass", None);
        assert_eq!(creds.username(), "user");
        assert_eq!(creds.domain(), Some("DOMAIN"));
    }

    #[test]
    fn test_parse_domain_at() {
        let creds = NtlmCredentials::new("user@domain.com", "pass", None);
        assert_eq!(creds.username(), "user");
        assert_eq!(creds.domain(), Some("domain.com"));
    }

    #[test]
    fn test_explicit_domain_wins() {
        let creds = NtlmCredentials::new("OTHER\\user", "pass", Some("CONTOSO"));
        assert_eq!(creds.username(), "user");
        assert_eq!(creds.domain(), Some("CONTOSO"));
    }

    #[test]
    fn test_debug_hides_password() {
        let creds = NtlmCredentials::new("user", "hunter2", None);
        assert!(!format!("{:?}", creds).contains("hunter2"));
    }

    #[test]
    fn test_nt_hash_vector() {
        assert_eq!(hex::encode(nt_hash(PASSWORD)), "a4f49c406510bdcab6824ee7c30fd852");
    }

    #[test]
    fn test_ntowf_v2_vector() {
        let ntowf = ntowf_v2(PASSWORD, USER, DOMAIN).unwrap();
        assert_eq!(hex::encode(ntowf), "0c868a403bfd7a93a3001ef22ef02e3f");
    }

    #[test]
    fn test_lmv2_vector() {
        let ntowf = ntowf_v2(PASSWORD, USER, DOMAIN).unwrap();
        let lm = lmv2_response(&ntowf, &SERVER_CHALLENGE, &CLIENT_CHALLENGE).unwrap();
        assert_eq!(
            hex::encode(lm),
            "86c35097ac9cec102554764a57cccc19aaaaaaaaaaaaaaaa"
        );
    }

    #[test]
    fn test_nt_proof_vector() {
        let ntowf = ntowf_v2(PASSWORD, USER, DOMAIN).unwrap();
        let response = ntlmv2_response(
            &ntowf,
            &SERVER_CHALLENGE,
            &CLIENT_CHALLENGE,
            [0u8; 8],
            Some(&TARGET_INFO),
        )
        .unwrap();
        assert_eq!(hex::encode(&response[..16]), "68cd0ab851e51c96aabc927bebef6a1c");
    }

    #[test]
    fn test_type1_message() {
        let creds = NtlmCredentials::new("CONTOSO\\user", "pass", None).workstation(Some("ws1"));
        let msg = creds.negotiate_message();

        assert_eq!(&msg[0..8], SIGNATURE);
        assert_eq!(u32::from_le_bytes([msg[8], msg[9], msg[10], msg[11]]), 1);

        let flags = u32::from_le_bytes([msg[12], msg[13], msg[14], msg[15]]);
        assert_ne!(flags & NTLM_NEGOTIATE_OEM_DOMAIN_SUPPLIED, 0);
        assert_ne!(flags & NTLM_NEGOTIATE_OEM_WORKSTATION_SUPPLIED, 0);
        assert_eq!(read_field(&msg, 16), b"CONTOSO");
        assert_eq!(read_field(&msg, 24), b"WS1");
    }

    #[test]
    fn test_type1_without_names() {
        let msg = NtlmCredentials::new("user", "pass", None).negotiate_message();
        assert_eq!(msg.len(), 32);
        let flags = u32::from_le_bytes([msg[12], msg[13], msg[14], msg[15]]);
        assert_eq!(flags & NTLM_NEGOTIATE_OEM_DOMAIN_SUPPLIED, 0);
    }

    #[test]
    fn test_parse_type2_message() {
        let parsed = parse_type2_message(&type2_bytes()).unwrap();
        assert_eq!(parsed.server_challenge, SERVER_CHALLENGE);
        assert_eq!(parsed.target_name.as_deref(), Some("Domain"));
        assert_eq!(parsed.target_info.as_deref(), Some(&TARGET_INFO[..]));
        assert_eq!(parsed.timestamp(), None);
    }

    #[test]
    fn test_parse_type2_rejects_garbage() {
        assert!(parse_type2_message(b"short").is_err());

        let mut wrong_type = type2_bytes();
        wrong_type[8] = 3;
        assert!(parse_type2_message(&wrong_type).is_err());

        let mut bad_offset = type2_bytes();
        bad_offset[44] = 0xff;
        let parsed = parse_type2_message(&bad_offset).unwrap();
        assert_eq!(parsed.target_info, None);
    }

    #[test]
    fn test_timestamp_av_pair() {
        let mut info = vec![0x07, 0x00, 0x08, 0x00];
        info.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        info.extend_from_slice(&[0, 0, 0, 0]);
        let type2 = Type2Message {
            server_challenge: SERVER_CHALLENGE,
            flags: NTLM_NEGOTIATE_TARGET_INFO,
            target_name: None,
            target_info: Some(info),
        };
        assert_eq!(type2.timestamp(), Some([1, 2, 3, 4, 5, 6, 7, 8]));
    }

    #[test]
    fn test_type3_fields() {
        let creds = NtlmCredentials::new(USER, PASSWORD, Some(DOMAIN)).workstation(Some("COMPUTER"));
        let type2 = parse_type2_message(&type2_bytes()).unwrap();
        let msg = creds
            .authenticate_message_with(&type2, &CLIENT_CHALLENGE, [0u8; 8])
            .unwrap();

        assert_eq!(&msg[0..8], SIGNATURE);
        assert_eq!(u32::from_le_bytes([msg[8], msg[9], msg[10], msg[11]]), 3);
        assert_eq!(
            hex::encode(read_field(&msg, 12)),
            "86c35097ac9cec102554764a57cccc19aaaaaaaaaaaaaaaa"
        );
        assert_eq!(hex::encode(&read_field(&msg, 20)[..16]), "68cd0ab851e51c96aabc927bebef6a1c");
        assert_eq!(read_field(&msg, 28), to_utf16le(DOMAIN).as_slice());
        assert_eq!(read_field(&msg, 36), to_utf16le(USER).as_slice());
        assert_eq!(read_field(&msg, 44), to_utf16le("COMPUTER").as_slice());
    }

    #[test]
    fn test_scheme_header_and_extract() {
        let value = Scheme::Negotiate.header(b"abc").unwrap();
        assert!(value.to_str().unwrap().starts_with("Negotiate "));

        let mut headers = HeaderMap::new();
        headers.append(WWW_AUTHENTICATE, HeaderValue::from_static("Negotiate"));
        let encoded = base64::engine::general_purpose::STANDARD.encode(type2_bytes());
        headers.append(
            WWW_AUTHENTICATE,
            HeaderValue::from_str(&format!("NTLM {}", encoded)).unwrap(),
        );

        assert!(Scheme::Ntlm.is_advertised(&headers));
        assert!(Scheme::Negotiate.is_advertised(&headers));
        assert!(extract_type2_from_header(&headers, Scheme::Negotiate).is_err());
        let parsed = extract_type2_from_header(&headers, Scheme::Ntlm).unwrap();
        assert_eq!(parsed.server_challenge, SERVER_CHALLENGE);
    }
}
