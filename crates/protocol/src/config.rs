use serde::{Deserialize, Serialize};

/// Top-level configuration for one [`Connection`](crate), covering the
/// NAT-traversal, security, and reliability knobs named in §4/§6/§7.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeamTransportConfig {
    #[serde(default)]
    pub ice: IceConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub reliability: ReliabilityConfig,
}

/// STUN/relay settings used by the endpoint gatherer and P2P connectivity
/// check (§4.2/§4.3). Named `ice` to match the teacher's config shape even
/// though this core runs its own narrow STUN subset rather than a full ICE
/// agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceConfig {
    /// STUN server URLs used for server-reflexive candidate discovery.
    #[serde(default = "default_stun_urls")]
    pub stun_urls: Vec<String>,
    /// Relay (TURN-like) address, used only as a last-resort candidate per
    /// §4.2 — no allocation lifecycle, just one `Relay` candidate pointing
    /// at this address.
    pub relay_addr: Option<String>,
    pub relay_username: Option<String>,
    pub relay_credential: Option<String>,
}

/// DTLS/session security settings (§4.4, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Username for the connectivity-check HMAC per session (§4.3).
    #[serde(default)]
    pub session_username: String,
    /// Password for the connectivity-check HMAC and DTLS PSK hint.
    #[serde(default)]
    pub session_password: String,
    /// SHA-256 digest of the peer's expected DTLS certificate, pinned
    /// out-of-band via signaling. 32 bytes, hex-encoded on the wire.
    pub pinned_cert_digest: Option<String>,
    /// Enable TLS for the TCP fallback path (§4.7). Defaults off inside
    /// this core per spec.
    #[serde(default)]
    pub tcp_fallback_tls: bool,
}

/// Pacing, MTU, and ARQ window settings (§4.6/§4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReliabilityConfig {
    /// Maximum UDP payload size budgeted for one RTP packet, including
    /// headers and extensions.
    #[serde(default = "default_mtu")]
    pub mtu: usize,
    /// Reliable channel send/receive window size, in messages.
    #[serde(default = "default_reliable_window")]
    pub reliable_window: u32,
    /// Reliable channel retransmit/ack tick interval, in milliseconds.
    #[serde(default = "default_reliable_tick_ms")]
    pub reliable_tick_ms: u64,
    /// Pacer budget refill interval, in milliseconds.
    #[serde(default = "default_pacer_tick_ms")]
    pub pacer_tick_ms: u64,
    /// Connectivity-check retransmit interval, in milliseconds.
    #[serde(default = "default_check_retransmit_ms")]
    pub check_retransmit_ms: u64,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_urls: default_stun_urls(),
            relay_addr: None,
            relay_username: None,
            relay_credential: None,
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            session_username: String::new(),
            session_password: String::new(),
            pinned_cert_digest: None,
            tcp_fallback_tls: false,
        }
    }
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            mtu: default_mtu(),
            reliable_window: default_reliable_window(),
            reliable_tick_ms: default_reliable_tick_ms(),
            pacer_tick_ms: default_pacer_tick_ms(),
            check_retransmit_ms: default_check_retransmit_ms(),
        }
    }
}

impl BeamTransportConfig {
    /// Validate the configuration, returning a list of issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal, connection should not be
    /// established) or "WARNING:" (advisory, connection can proceed but the
    /// config is likely wrong).
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        for url in &self.ice.stun_urls {
            if !url.starts_with("stun:") && !url.starts_with("stuns:") {
                issues.push(format!(
                    "ERROR: STUN URL '{}' must start with 'stun:' or 'stuns:'. \
                     Example: stun:stun.l.google.com:19302",
                    url
                ));
            }
        }

        if self.ice.relay_addr.is_some()
            && (self.ice.relay_username.is_none() || self.ice.relay_credential.is_none())
        {
            issues.push(
                "WARNING: relay_addr is set but relay_username/relay_credential are not. \
                 The relay candidate will be emitted unauthenticated."
                    .to_string(),
            );
        }

        if self.security.session_password.is_empty() {
            issues.push(
                "ERROR: security.session_password must not be empty — it keys the \
                 connectivity-check MESSAGE-INTEGRITY HMAC."
                    .to_string(),
            );
        }

        if let Some(digest) = &self.security.pinned_cert_digest {
            match hex_decode_len(digest) {
                Some(32) => {}
                Some(n) => issues.push(format!(
                    "ERROR: security.pinned_cert_digest must decode to 32 bytes (SHA-256), \
                     got {}.",
                    n
                )),
                None => issues.push(
                    "ERROR: security.pinned_cert_digest is not valid hex.".to_string(),
                ),
            }
        }

        if self.reliability.mtu < 256 {
            issues.push(format!(
                "ERROR: reliability.mtu must be at least 256, got {}.",
                self.reliability.mtu
            ));
        }

        if self.reliability.reliable_window == 0 {
            issues.push("ERROR: reliability.reliable_window must be >= 1.".to_string());
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

fn hex_decode_len(s: &str) -> Option<usize> {
    if s.len() % 2 != 0 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    Some(s.len() / 2)
}

fn default_stun_urls() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun1.l.google.com:19302".to_string(),
    ]
}
fn default_mtu() -> usize {
    1400
}
fn default_reliable_window() -> u32 {
    128
}
fn default_reliable_tick_ms() -> u64 {
    10
}
fn default_pacer_tick_ms() -> u64 {
    5
}
fn default_check_retransmit_ms() -> u64 {
    50
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_from_empty_string() {
        let config: BeamTransportConfig =
            toml::from_str("").expect("empty string should deserialize to default config");

        assert_eq!(
            config.ice.stun_urls,
            vec![
                "stun:stun.l.google.com:19302",
                "stun:stun1.l.google.com:19302",
            ]
        );
        assert!(config.ice.relay_addr.is_none());
        assert!(config.security.session_username.is_empty());
        assert!(!config.security.tcp_fallback_tls);
        assert_eq!(config.reliability.mtu, 1400);
        assert_eq!(config.reliability.reliable_window, 128);
        assert_eq!(config.reliability.reliable_tick_ms, 10);
        assert_eq!(config.reliability.pacer_tick_ms, 5);
        assert_eq!(config.reliability.check_retransmit_ms, 50);
    }

    #[test]
    fn partial_config_only_reliability_section() {
        let toml_str = r#"
[reliability]
mtu = 1200
reliable_window = 64
"#;
        let config: BeamTransportConfig =
            toml::from_str(toml_str).expect("partial config should deserialize");

        assert_eq!(config.reliability.mtu, 1200);
        assert_eq!(config.reliability.reliable_window, 64);
        assert_eq!(config.reliability.reliable_tick_ms, 10);
        assert_eq!(config.ice.stun_urls.len(), 2);
    }

    #[test]
    fn validate_rejects_empty_session_password() {
        let config = BeamTransportConfig {
            ice: IceConfig::default(),
            security: SecurityConfig::default(),
            reliability: ReliabilityConfig::default(),
        };
        let err = config.validate().unwrap_err();
        assert!(err.iter().any(|e| e.contains("session_password")));
    }

    #[test]
    fn validate_rejects_bad_stun_scheme() {
        let mut config = BeamTransportConfig {
            ice: IceConfig::default(),
            security: SecurityConfig {
                session_password: "secret".to_string(),
                ..SecurityConfig::default()
            },
            reliability: ReliabilityConfig::default(),
        };
        config.ice.stun_urls = vec!["http://example.com".to_string()];
        let err = config.validate().unwrap_err();
        assert!(err.iter().any(|e| e.contains("STUN URL")));
    }

    #[test]
    fn validate_rejects_malformed_digest() {
        let config = BeamTransportConfig {
            ice: IceConfig::default(),
            security: SecurityConfig {
                session_password: "secret".to_string(),
                pinned_cert_digest: Some("not-hex".to_string()),
                ..SecurityConfig::default()
            },
            reliability: ReliabilityConfig::default(),
        };
        let err = config.validate().unwrap_err();
        assert!(err.iter().any(|e| e.contains("pinned_cert_digest")));
    }

    #[test]
    fn validate_accepts_well_formed_config() {
        let config = BeamTransportConfig {
            ice: IceConfig::default(),
            security: SecurityConfig {
                session_password: "secret".to_string(),
                pinned_cert_digest: Some("ab".repeat(32)),
                ..SecurityConfig::default()
            },
            reliability: ReliabilityConfig::default(),
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn relay_without_credentials_is_a_warning_not_an_error() {
        let mut config = BeamTransportConfig {
            ice: IceConfig::default(),
            security: SecurityConfig {
                session_password: "secret".to_string(),
                ..SecurityConfig::default()
            },
            reliability: ReliabilityConfig::default(),
        };
        config.ice.relay_addr = Some("203.0.113.9:3478".to_string());
        let err = config.validate().unwrap_err();
        assert!(err.iter().all(|e| e.starts_with("WARNING:")));
    }
}
