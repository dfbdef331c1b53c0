//! Common test utilities for collabauth integration tests
//!
//! This module provides shared test infrastructure including:
//! - Tracing setup for test output
//! - Mock NTLM, contextinfo, forms and token endpoints using wiremock
//! - Hand-built NTLM challenge messages

#![allow(dead_code)]

use std::time::Duration;

use base64::Engine;
use collabauth::{fields, Client, Settings, StrategyConfig};
use tracing_subscriber::EnvFilter;
use wiremock::matchers::{header_regex, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const SITE_PATH: &str = "/sites/dev";
pub const USERNAME: &str = "CONTOSO\\alice";
pub const PASSWORD: &str = "Pa55w0rd!";

pub const SERVER_CHALLENGE: [u8; 8] = [0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef];
pub const SERVER_TIMESTAMP: [u8; 8] = [0x00, 0x90, 0xd3, 0x36, 0xb7, 0x34, 0xd3, 0x01];

const NEGOTIATE_UNICODE: u32 = 0x0000_0001;
const NEGOTIATE_NTLM: u32 = 0x0000_0200;
const NEGOTIATE_TARGET_INFO: u32 = 0x0080_0000;

/// Install a test-writer subscriber once; `RUST_LOG` controls verbosity
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn site(server: &MockServer) -> String {
    format!("{}{}", server.uri(), SITE_PATH)
}

/// Settings with short timeouts so a broken test fails fast
pub fn settings() -> Settings {
    Settings {
        request_timeout: Duration::from_secs(5),
        handshake_timeout: Duration::from_secs(5),
        ..Settings::default()
    }
}

pub fn ntlm_config(server: &MockServer) -> StrategyConfig {
    StrategyConfig::new("ntlm")
        .with(fields::SITE_URL, site(server))
        .with(fields::USERNAME, USERNAME)
        .with(fields::PASSWORD, PASSWORD)
}

pub fn ntlm_client(server: &MockServer) -> Client {
    Client::from_config(ntlm_config(server), &settings()).expect("ntlm client")
}

fn utf16le(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

fn av_pair(id: u16, value: &[u8]) -> Vec<u8> {
    let mut pair = Vec::with_capacity(4 + value.len());
    pair.extend_from_slice(&id.to_le_bytes());
    pair.extend_from_slice(&(value.len() as u16).to_le_bytes());
    pair.extend_from_slice(value);
    pair
}

/// Target info: NetBIOS domain, NetBIOS computer, timestamp, EOL
pub fn target_info() -> Vec<u8> {
    let mut info = Vec::new();
    info.extend(av_pair(2, &utf16le("CONTOSO")));
    info.extend(av_pair(1, &utf16le("SP01")));
    info.extend(av_pair(7, &SERVER_TIMESTAMP));
    info.extend(av_pair(0, &[]));
    info
}

/// A Type 2 challenge message as a server would send it
pub fn type2_message() -> Vec<u8> {
    let target_name = utf16le("CONTOSO");
    let info = target_info();
    let name_offset = 48u32;
    let info_offset = name_offset + target_name.len() as u32;
    let flags = NEGOTIATE_UNICODE | NEGOTIATE_NTLM | NEGOTIATE_TARGET_INFO;

    let mut msg = Vec::new();
    msg.extend_from_slice(b"NTLMSSP\0");
    msg.extend_from_slice(&2u32.to_le_bytes());
    msg.extend_from_slice(&(target_name.len() as u16).to_le_bytes());
    msg.extend_from_slice(&(target_name.len() as u16).to_le_bytes());
    msg.extend_from_slice(&name_offset.to_le_bytes());
    msg.extend_from_slice(&flags.to_le_bytes());
    msg.extend_from_slice(&SERVER_CHALLENGE);
    msg.extend_from_slice(&[0u8; 8]);
    msg.extend_from_slice(&(info.len() as u16).to_le_bytes());
    msg.extend_from_slice(&(info.len() as u16).to_le_bytes());
    msg.extend_from_slice(&info_offset.to_le_bytes());
    msg.extend_from_slice(&target_name);
    msg.extend_from_slice(&info);
    msg
}

/// Read a security buffer (length at `at`, offset at `at + 4`) out of an NTLM message
pub fn security_buffer(msg: &[u8], at: usize) -> Vec<u8> {
    let len = u16::from_le_bytes([msg[at], msg[at + 1]]) as usize;
    let offset = u32::from_le_bytes([msg[at + 4], msg[at + 5], msg[at + 6], msg[at + 7]]) as usize;
    msg[offset..offset + len].to_vec()
}

pub fn decode_utf16le(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes.chunks(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect();
    String::from_utf16_lossy(&units)
}

/// Decode the NTLM message carried by an `Authorization: <scheme> <token>` value
pub fn decode_authorization(value: &str) -> Vec<u8> {
    let token = value.split_once(' ').map(|(_, t)| t).unwrap_or(value);
    base64::engine::general_purpose::STANDARD
        .decode(token.trim())
        .expect("base64 NTLM token")
}

/// Mount the three NTLM handshake legs on `probe_path` for `scheme`
///
/// Returns nothing; expectations are set on the Type 1 and Type 3 legs so the
/// server verifies the number of handshakes when it is dropped.
pub async fn mount_ntlm_handshake(server: &MockServer, probe_path: &str, scheme: &str, handshakes: u64) {
    let type2 = base64::engine::general_purpose::STANDARD.encode(type2_message());

    Mock::given(method("GET"))
        .and(path(probe_path))
        .and(header_regex("Authorization", &format!("^{} TlRMTVNTUAAD", scheme)))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .with_priority(1)
        .expect(handshakes)
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path(probe_path))
        .and(header_regex("Authorization", &format!("^{} TlRMTVNTUAAB", scheme)))
        .respond_with(
            ResponseTemplate::new(401).insert_header("WWW-Authenticate", format!("{} {}", scheme, type2).as_str()),
        )
        .with_priority(2)
        .expect(handshakes)
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path(probe_path))
        .respond_with(ResponseTemplate::new(401).insert_header("WWW-Authenticate", scheme))
        .with_priority(3)
        .mount(server)
        .await;
}

/// Verbose-shape contextinfo body
pub fn context_info_body(digest: &str, timeout_secs: u64) -> serde_json::Value {
    serde_json::json!({
        "d": {
            "GetContextWebInformation": {
                "__metadata": { "type": "SP.ContextWebInformation" },
                "FormDigestTimeoutSeconds": timeout_secs,
                "FormDigestValue": digest,
                "LibraryVersion": "16.0.0.0",
                "WebFullUrl": "https://contoso.local/sites/dev"
            }
        }
    })
}

/// SharePoint's stale digest rejection
pub fn stale_digest_body() -> serde_json::Value {
    serde_json::json!({
        "error": {
            "code": "-2130575251, Microsoft.SharePoint.SPException",
            "message": {
                "lang": "en-US",
                "value": "The security validation for this page is invalid and might be corrupted. Please use your web browser's Back button to try your operation again."
            }
        }
    })
}
