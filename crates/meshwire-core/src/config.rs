//! Configuration system for meshwire.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $MESHWIRE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/meshwire/config.toml
//!   3. ~/.config/meshwire/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::identity::{IdentityError, Node};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshwireConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub peers: PeersConfig,
    pub timeouts: TimeoutConfig,
    pub endpoint: EndpointConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Saved network blob: secret key plus known peers. Created on shutdown.
    pub network_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind the TCP listener and the discovery socket to.
    pub listen_address: String,
    /// Port for both TCP sessions and UDP discovery. 0 = OS-assigned.
    pub listen_port: u16,
    /// Advertised address. Empty = learn it from discovery.
    pub public_ip: String,
    /// Port mapping through the gateway. Not supported; logged when set.
    pub upnp: bool,
    /// Number of peers the host tries to keep connected.
    pub ideal_peers: u32,
    /// Inbound sessions are accepted up to ideal_peers × peer_stretch.
    pub peer_stretch: u32,
    /// Only talk to required peers. Disables discovery.
    pub hermit: bool,
    pub discovery: bool,
    /// Client name announced in Hello.
    pub client_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PeersConfig {
    /// enode:// URLs of peers that are always dialed.
    pub required: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Handshake plus Hello exchange.
    pub handshake_ms: u64,
    pub ping_interval_secs: u64,
    pub ping_timeout_secs: u64,
    pub discovery_request_ms: u64,
    pub discovery_retries: u8,
    pub discovery_refresh_ms: u64,
    /// How long shutdown waits for sessions to close.
    pub shutdown_grace_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Distinct sources that must agree before an observed endpoint is used.
    pub min_votes: usize,
    /// Endpoint statements older than this are discarded.
    pub max_age_secs: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            network_path: data_dir().join("network.json"),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0".to_string(),
            listen_port: 30303,
            public_ip: String::new(),
            upnp: false,
            ideal_peers: 11,
            peer_stretch: 7,
            hermit: false,
            discovery: true,
            client_id: format!("meshwire/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            handshake_ms: 5_000,
            ping_interval_secs: 30,
            ping_timeout_secs: 10,
            discovery_request_ms: 500,
            discovery_retries: 2,
            discovery_refresh_ms: 7_200,
            shutdown_grace_ms: 2_000,
        }
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            min_votes: 3,
            max_age_secs: 600,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

pub fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("meshwire")
}

pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("meshwire")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid required peer {0}: {1}")]
    InvalidPeer(String, IdentityError),
    #[error("invalid address {0}")]
    InvalidAddress(String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl MeshwireConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            MeshwireConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("MESHWIRE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&MeshwireConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text)
                .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Parse `peers.required` into nodes.
    pub fn required_nodes(&self) -> Result<Vec<Node>, ConfigError> {
        self.peers
            .required
            .iter()
            .map(|url| {
                url.parse::<Node>()
                    .map_err(|e| ConfigError::InvalidPeer(url.clone(), e))
            })
            .collect()
    }

    /// Apply MESHWIRE_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("MESHWIRE_IDENTITY__NETWORK_PATH") {
            self.identity.network_path = PathBuf::from(v);
        }
        if let Some(v) = var("MESHWIRE_NETWORK__LISTEN_ADDRESS") {
            self.network.listen_address = v;
        }
        if let Some(p) = var("MESHWIRE_NETWORK__LISTEN_PORT").and_then(|v| v.parse().ok()) {
            self.network.listen_port = p;
        }
        if let Some(v) = var("MESHWIRE_NETWORK__PUBLIC_IP") {
            self.network.public_ip = v;
        }
        if let Some(n) = var("MESHWIRE_NETWORK__IDEAL_PEERS").and_then(|v| v.parse().ok()) {
            self.network.ideal_peers = n;
        }
        if let Some(v) = var("MESHWIRE_NETWORK__HERMIT") {
            self.network.hermit = parse_bool(&v);
        }
        if let Some(v) = var("MESHWIRE_NETWORK__DISCOVERY") {
            self.network.discovery = parse_bool(&v);
        }
        if let Some(v) = var("MESHWIRE_PEERS__REQUIRED") {
            self.peers.required = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(n) = var("MESHWIRE_ENDPOINT__MIN_VOTES").and_then(|v| v.parse().ok()) {
            self.endpoint.min_votes = n;
        }
    }
}

fn parse_bool(v: &str) -> bool {
    v == "true" || v == "1"
}
