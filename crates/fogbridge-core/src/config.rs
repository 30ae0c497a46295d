//! Configuration system for fogbridge.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $FOGBRIDGE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/fogbridge/config.toml
//!   3. ~/.config/fogbridge/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FogbridgeConfig {
    pub coap: CoapConfig,
    pub platform: PlatformConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoapConfig {
    /// UDP address the gateway listens on.
    pub listen_addr: String,
    /// Port devices serve their `/key` resource on. 0 = the port the device
    /// last sent from.
    pub device_port: u16,
    /// URI path keys are pushed to on the device.
    pub key_path: String,
    /// Reply 4.00 / 5.02 to failed confirmable `/req` instead of staying silent.
    pub explicit_errors: bool,
    /// Initial retransmission timeout for outbound confirmable requests.
    pub ack_timeout_ms: u64,
    /// Retransmissions before an outbound request gives up.
    pub max_retransmit: u32,
    /// Receive buffer size in bytes.
    pub recv_buffer: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    /// host:port of the fog platform endpoint.
    pub address: String,
    /// Address announced to the fog at platform registration. Empty = `address`.
    pub advertise_address: String,
    pub connect_timeout_ms: u64,
    /// Upper bound on a single register/request call.
    pub request_timeout_ms: u64,
    /// Upper bound on delivering one pushed key to a device.
    pub key_push_timeout_ms: u64,
    /// PEM bundle of CAs trusted to sign the platform's certificate.
    /// Setting it turns on TLS for the platform channel.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_path: Option<PathBuf>,
    /// PEM certificate the gateway presents to the platform.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert_path: Option<PathBuf>,
    /// PEM private key matching `cert_path`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_path: Option<PathBuf>,
    /// Name checked against the platform's certificate. Empty = host part of `address`.
    pub server_name: String,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for CoapConfig {
    fn default() -> Self {
        Self {
            listen_addr: "[::]:5683".to_string(),
            device_port: 0,
            key_path: crate::wire::PATH_KEY.to_string(),
            explicit_errors: false,
            ack_timeout_ms: 2000,
            max_retransmit: 4,
            recv_buffer: 1152,
        }
    }
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:2001".to_string(),
            advertise_address: String::new(),
            connect_timeout_ms: 5000,
            request_timeout_ms: 10_000,
            key_push_timeout_ms: 30_000,
            ca_path: None,
            cert_path: None,
            key_path: None,
            server_name: String::new(),
        }
    }
}

impl CoapConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

impl PlatformConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn key_push_timeout(&self) -> Duration {
        Duration::from_millis(self.key_push_timeout_ms)
    }

    /// The address to announce at platform registration.
    pub fn advertised(&self) -> &str {
        if self.advertise_address.is_empty() {
            &self.address
        } else {
            &self.advertise_address
        }
    }

    /// The name the platform's certificate must carry.
    pub fn tls_server_name(&self) -> &str {
        if !self.server_name.is_empty() {
            return &self.server_name;
        }
        let host = self
            .address
            .rsplit_once(':')
            .map_or(self.address.as_str(), |(host, _)| host);
        host.trim_start_matches('[').trim_end_matches(']')
    }

    /// Whether any TLS material is configured for the platform channel.
    pub fn tls_enabled(&self) -> bool {
        self.ca_path.is_some() || self.cert_path.is_some() || self.key_path.is_some()
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("fogbridge")
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
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl FogbridgeConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            FogbridgeConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse a specific config file without applying env overrides.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("FOGBRIDGE_CONFIG")
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
            let text = toml::to_string_pretty(&FogbridgeConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply FOGBRIDGE_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("FOGBRIDGE_COAP__LISTEN_ADDR") {
            self.coap.listen_addr = v;
        }
        if let Some(v) = lookup("FOGBRIDGE_COAP__EXPLICIT_ERRORS") {
            self.coap.explicit_errors = v == "true" || v == "1";
        }
        if let Some(v) = lookup("FOGBRIDGE_PLATFORM__ADDRESS") {
            self.platform.address = v;
        }
        if let Some(v) = lookup("FOGBRIDGE_PLATFORM__ADVERTISE_ADDRESS") {
            self.platform.advertise_address = v;
        }
        if let Some(v) = lookup("FOGBRIDGE_PLATFORM__CA_PATH") {
            self.platform.ca_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("FOGBRIDGE_PLATFORM__CERT_PATH") {
            self.platform.cert_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("FOGBRIDGE_PLATFORM__KEY_PATH") {
            self.platform.key_path = Some(PathBuf::from(v));
        }
    }
}
