// Session configuration: INI-style sections, validation, persistence.
// Numan Thabit 2025

use std::{
    fmt::Write as _,
    fs, io,
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::Deserialize;
use thiserror::Error;

use crate::handshake::PSK_LEN;
use crate::mux::fragment::FragmentConfig;
use crate::mux::rate::RateLimiterConfig;
use crate::mux::reorder::ReorderConfig;
use crate::mux::retransmit::RetransmitConfig;
use crate::mux::rotate::RotationConfig;

/// Smallest MTU the session accepts.
pub const MIN_MTU: usize = 576;

/// Largest MTU the session accepts.
pub const MAX_MTU: usize = 65_535;

/// Error returned while loading, validating, or saving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Reading or writing the configuration file failed.
    #[error("failed to access config '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// The file contents did not parse.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    /// The configuration violated a constraint.
    #[error("invalid config: {0}")]
    Validation(String),
}

/// `[network]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub local_host: String,
    pub local_port: u16,
    /// Empty means "no peer": wait for an inbound handshake.
    pub peer_host: String,
    pub peer_port: u16,
    pub mtu: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            local_host: "0.0.0.0".to_string(),
            local_port: 0,
            peer_host: String::new(),
            peer_port: 0,
            mtu: 1400,
        }
    }
}

/// `[security]` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Hex-encoded PSK, optional `0x` prefix. Truncated or zero-padded to
    /// 32 bytes.
    pub psk: String,
}

/// `[handshake]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HandshakeSection {
    pub timestamp_tolerance_sec: u64,
    pub require_psk: bool,
    pub max_handshake_attempts: u32,
}

impl Default for HandshakeSection {
    fn default() -> Self {
        Self {
            timestamp_tolerance_sec: 60,
            require_psk: false,
            max_handshake_attempts: 3,
        }
    }
}

/// Full session configuration, immutable once the session starts.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub network: NetworkConfig,
    pub security: SecurityConfig,
    pub rate_limiter: RateLimiterConfig,
    /// Rotation budgets; the file section is `[session]`.
    #[serde(rename = "session")]
    pub rotation: RotationConfig,
    pub reorder: ReorderConfig,
    pub fragment: FragmentConfig,
    pub retransmission: RetransmitConfig,
    pub handshake: HandshakeSection,
}

impl Config {
    /// Loads a configuration file from the provided path.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let contents = fs::read_to_string(path_ref).map_err(|source| ConfigError::Io {
            path: path_ref.to_path_buf(),
            source,
        })?;
        contents.parse()
    }

    /// Decodes the PSK hex into the fixed 32-byte key.
    ///
    /// Shorter input zero-pads, longer input truncates, an odd trailing
    /// nibble is ignored. Undecodable input is a validation error.
    pub fn psk_bytes(&self) -> Result<[u8; PSK_LEN], ConfigError> {
        let hex = self
            .security
            .psk
            .strip_prefix("0x")
            .or_else(|| self.security.psk.strip_prefix("0X"))
            .unwrap_or(&self.security.psk);
        if !hex.is_ascii() {
            return Err(ConfigError::Validation("psk is not valid hex".to_string()));
        }

        let mut psk = [0u8; PSK_LEN];
        let pairs = (hex.len() / 2).min(PSK_LEN);
        for (i, byte) in psk.iter_mut().enumerate().take(pairs) {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).map_err(|_| {
                ConfigError::Validation(format!("psk is not valid hex at byte {i}"))
            })?;
        }
        Ok(psk)
    }

    pub fn has_peer(&self) -> bool {
        !self.network.peer_host.is_empty()
    }

    /// Enforces the documented ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.mtu < MIN_MTU || self.network.mtu > MAX_MTU {
            return Err(ConfigError::Validation(format!(
                "mtu {} outside {MIN_MTU}..={MAX_MTU}",
                self.network.mtu
            )));
        }
        if self.rate_limiter.packets_per_second == 0 || self.rate_limiter.bytes_per_second == 0 {
            return Err(ConfigError::Validation(
                "rate limits must be non-zero".to_string(),
            ));
        }
        if self.retransmission.min_rto_ms > self.retransmission.max_rto_ms {
            return Err(ConfigError::Validation(
                "min_rto_ms exceeds max_rto_ms".to_string(),
            ));
        }
        let alpha = self.retransmission.rtt_alpha;
        let beta = self.retransmission.rtt_beta;
        if !(0.0..=1.0).contains(&alpha) || !(0.0..=1.0).contains(&beta) {
            return Err(ConfigError::Validation(
                "rtt_alpha and rtt_beta must lie in [0, 1]".to_string(),
            ));
        }
        if self.fragment.max_fragments_per_message == 0 {
            return Err(ConfigError::Validation(
                "max_fragments_per_message must be non-zero".to_string(),
            ));
        }
        self.psk_bytes().map(|_| ())
    }

    /// Writes the configuration back out as INI sections.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path_ref = path.as_ref();
        fs::write(path_ref, self.render()).map_err(|source| ConfigError::Io {
            path: path_ref.to_path_buf(),
            source,
        })
    }

    fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "[network]");
        let _ = writeln!(out, "local_host = \"{}\"", self.network.local_host);
        let _ = writeln!(out, "local_port = {}", self.network.local_port);
        let _ = writeln!(out, "peer_host = \"{}\"", self.network.peer_host);
        let _ = writeln!(out, "peer_port = {}", self.network.peer_port);
        let _ = writeln!(out, "mtu = {}", self.network.mtu);
        let _ = writeln!(out);
        let _ = writeln!(out, "[security]");
        let _ = writeln!(out, "psk = \"{}\"", self.security.psk);
        let _ = writeln!(out);
        let _ = writeln!(out, "[rate_limiter]");
        let _ = writeln!(
            out,
            "packets_per_second = {}",
            self.rate_limiter.packets_per_second
        );
        let _ = writeln!(
            out,
            "bytes_per_second = {}",
            self.rate_limiter.bytes_per_second
        );
        let _ = writeln!(out, "burst_packets = {}", self.rate_limiter.burst_packets);
        let _ = writeln!(out, "burst_bytes = {}", self.rate_limiter.burst_bytes);
        let _ = writeln!(out);
        let _ = writeln!(out, "[session]");
        let _ = writeln!(
            out,
            "packets_per_session = {}",
            self.rotation.packets_per_session
        );
        let _ = writeln!(out, "bytes_per_session = {}", self.rotation.bytes_per_session);
        let _ = writeln!(
            out,
            "seconds_per_session = {}",
            self.rotation.seconds_per_session
        );
        let _ = writeln!(out);
        let _ = writeln!(out, "[reorder]");
        let _ = writeln!(
            out,
            "max_buffered_packets = {}",
            self.reorder.max_buffered_packets
        );
        let _ = writeln!(out, "max_buffered_bytes = {}", self.reorder.max_buffered_bytes);
        let _ = writeln!(out, "max_delay_ms = {}", self.reorder.max_delay_ms);
        let _ = writeln!(out);
        let _ = writeln!(out, "[fragment]");
        let _ = writeln!(
            out,
            "max_pending_messages = {}",
            self.fragment.max_pending_messages
        );
        let _ = writeln!(
            out,
            "max_fragments_per_message = {}",
            self.fragment.max_fragments_per_message
        );
        let _ = writeln!(out, "max_message_size = {}", self.fragment.max_message_size);
        let _ = writeln!(
            out,
            "fragment_timeout_ms = {}",
            self.fragment.fragment_timeout_ms
        );
        let _ = writeln!(out);
        let _ = writeln!(out, "[retransmission]");
        let _ = writeln!(out, "initial_rto_ms = {}", self.retransmission.initial_rto_ms);
        let _ = writeln!(out, "min_rto_ms = {}", self.retransmission.min_rto_ms);
        let _ = writeln!(out, "max_rto_ms = {}", self.retransmission.max_rto_ms);
        let _ = writeln!(out, "max_retries = {}", self.retransmission.max_retries);
        let _ = writeln!(
            out,
            "max_unacked_packets = {}",
            self.retransmission.max_unacked_packets
        );
        let _ = writeln!(
            out,
            "max_unacked_bytes = {}",
            self.retransmission.max_unacked_bytes
        );
        let _ = writeln!(out, "rtt_alpha = {}", self.retransmission.rtt_alpha);
        let _ = writeln!(out, "rtt_beta = {}", self.retransmission.rtt_beta);
        let _ = writeln!(out);
        let _ = writeln!(out, "[handshake]");
        let _ = writeln!(
            out,
            "timestamp_tolerance_sec = {}",
            self.handshake.timestamp_tolerance_sec
        );
        let _ = writeln!(out, "require_psk = {}", self.handshake.require_psk);
        let _ = writeln!(
            out,
            "max_handshake_attempts = {}",
            self.handshake.max_handshake_attempts
        );
        out
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Config::default().validate().expect("defaults are valid");
    }

    #[test]
    fn parses_ini_sections() {
        let input = r#"
[network]
local_host = "127.0.0.1"
local_port = 4000
peer_host = "10.0.0.2"
peer_port = 4001
mtu = 1200

[security]
psk = "0xabadcafe"

[rate_limiter]
packets_per_second = 500

[retransmission]
initial_rto_ms = 150
"#;
        let config: Config = input.parse().expect("parse");
        assert_eq!(config.network.local_port, 4000);
        assert_eq!(config.network.mtu, 1200);
        assert!(config.has_peer());
        assert_eq!(config.rate_limiter.packets_per_second, 500);
        assert_eq!(config.retransmission.initial_rto_ms, 150);
        // Unset keys keep their defaults.
        assert_eq!(config.retransmission.max_retries, 5);
        assert_eq!(config.rotation.seconds_per_session, 3600);
    }

    #[test]
    fn psk_hex_decodes_with_padding() {
        let mut config = Config::default();
        config.security.psk = "0xABadCafe".to_string();
        let psk = config.psk_bytes().unwrap();
        assert_eq!(&psk[..4], &[0xAB, 0xAD, 0xCA, 0xFE]);
        assert!(psk[4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn psk_truncated_to_32_bytes() {
        let mut config = Config::default();
        config.security.psk = "11".repeat(40);
        let psk = config.psk_bytes().unwrap();
        assert_eq!(psk, [0x11u8; PSK_LEN]);
    }

    #[test]
    fn bad_psk_hex_rejected() {
        let mut config = Config::default();
        config.security.psk = "zz".to_string();
        assert!(config.psk_bytes().is_err());
    }

    #[test]
    fn mtu_bounds_enforced() {
        let mut config = Config::default();
        config.network.mtu = 100;
        assert!(config.validate().is_err());
        config.network.mtu = 70_000;
        assert!(config.validate().is_err());
        config.network.mtu = MIN_MTU;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn save_round_trips() {
        let mut config = Config::default();
        config.network.local_host = "127.0.0.1".to_string();
        config.network.local_port = 7777;
        config.security.psk = "0xdeadbeef".to_string();
        config.retransmission.max_retries = 7;

        let rendered = config.render();
        let reparsed: Config = rendered.parse().expect("round trip");
        assert_eq!(reparsed.network.local_port, 7777);
        assert_eq!(reparsed.retransmission.max_retries, 7);
        assert_eq!(reparsed.psk_bytes().unwrap(), config.psk_bytes().unwrap());
    }
}
