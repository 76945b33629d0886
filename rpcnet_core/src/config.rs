//! Configuration system (§6).
//!
//! Loads runtime configuration from JSON strings/files (file IO left to the
//! caller), the same way the original engine config did — only the schema
//! has changed.

use serde::{Deserialize, Serialize};

use crate::session::PskCipher;

/// PSK session-layer tuning (§4.2, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PskConfig {
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_retransmit_ms")]
    pub retransmit_ms: u64,
    #[serde(default = "default_max_record_size")]
    pub max_record_size: usize,
    #[serde(default)]
    pub cipher: ConfiguredCipher,
}

/// Serde-friendly mirror of [`PskCipher`] (the session type itself derives
/// no serde impls — keys must never round-trip through config).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfiguredCipher {
    #[default]
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl From<ConfiguredCipher> for PskCipher {
    fn from(c: ConfiguredCipher) -> Self {
        match c {
            ConfiguredCipher::Aes256Gcm => PskCipher::Aes256Gcm,
            ConfiguredCipher::ChaCha20Poly1305 => PskCipher::ChaCha20Poly1305,
        }
    }
}

fn default_handshake_timeout_ms() -> u64 {
    5_000
}

fn default_retransmit_ms() -> u64 {
    1_000
}

fn default_max_record_size() -> usize {
    1200
}

impl Default for PskConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: default_handshake_timeout_ms(),
            retransmit_ms: default_retransmit_ms(),
            max_record_size: default_max_record_size(),
            cipher: ConfiguredCipher::default(),
        }
    }
}

/// Default authorization outcome when no rule matches a method (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultPolicy {
    /// Unmatched methods are reachable by anyone, including anonymous callers.
    AllowAnonymous,
    /// Unmatched methods are reachable only by callers who authenticated
    /// (any non-anonymous role); anonymous callers are denied.
    RequireAuthentication,
}

impl Default for DefaultPolicy {
    fn default() -> Self {
        DefaultPolicy::AllowAnonymous
    }
}

/// Root configuration shared by client and server runtimes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    /// Server listen address, e.g. `127.0.0.1:40000`.
    #[serde(default = "default_server_addr")]
    pub server_addr: String,

    #[serde(default = "default_true")]
    pub enable_authorization: bool,
    #[serde(default)]
    pub default_policy: DefaultPolicy,
    #[serde(default)]
    pub enforce_client_accessible: bool,

    #[serde(default)]
    pub psk: PskConfig,

    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_default_ms: u64,
    #[serde(default = "default_deadline_scan_interval_ms")]
    pub deadline_scan_interval_ms: u64,

    #[serde(default = "default_max_sessions_per_user")]
    pub max_concurrent_sessions_per_user: u32,
    #[serde(default = "default_session_idle_timeout_ms")]
    pub session_idle_timeout_ms: u64,
    #[serde(default = "default_session_absolute_timeout_ms")]
    pub session_absolute_timeout_ms: u64,
}

fn default_server_addr() -> String {
    "127.0.0.1:40000".to_string()
}

fn default_true() -> bool {
    true
}

fn default_heartbeat_interval_ms() -> u64 {
    5_000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_deadline_scan_interval_ms() -> u64 {
    100
}

fn default_max_sessions_per_user() -> u32 {
    5
}

fn default_session_idle_timeout_ms() -> u64 {
    60_000
}

fn default_session_absolute_timeout_ms() -> u64 {
    3_600_000
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            server_addr: default_server_addr(),
            enable_authorization: default_true(),
            default_policy: DefaultPolicy::default(),
            enforce_client_accessible: false,
            psk: PskConfig::default(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            request_timeout_default_ms: default_request_timeout_ms(),
            deadline_scan_interval_ms: default_deadline_scan_interval_ms(),
            max_concurrent_sessions_per_user: default_max_sessions_per_user(),
            session_idle_timeout_ms: default_session_idle_timeout_ms(),
            session_absolute_timeout_ms: default_session_absolute_timeout_ms(),
        }
    }
}

impl RpcConfig {
    /// Parses config from JSON, filling in defaults for any omitted field.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let cfg = RpcConfig::default();
        assert!(cfg.enable_authorization);
        assert_eq!(cfg.default_policy, DefaultPolicy::AllowAnonymous);
        assert!(!cfg.enforce_client_accessible);
        assert_eq!(cfg.psk.handshake_timeout_ms, 5_000);
        assert_eq!(cfg.psk.retransmit_ms, 1_000);
        assert_eq!(cfg.psk.max_record_size, 1200);
        assert_eq!(cfg.heartbeat_interval_ms, 5_000);
        assert_eq!(cfg.request_timeout_default_ms, 30_000);
        assert_eq!(cfg.max_concurrent_sessions_per_user, 5);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg = RpcConfig::from_json_str(r#"{"server_addr": "0.0.0.0:9000"}"#).unwrap();
        assert_eq!(cfg.server_addr, "0.0.0.0:9000");
        assert_eq!(cfg.heartbeat_interval_ms, default_heartbeat_interval_ms());
    }
}
