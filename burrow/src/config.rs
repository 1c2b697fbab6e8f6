//! Typed TOML configuration.
//!
//! Every field has a default so an empty file (or no file at all) yields a
//! runnable direct-proxy setup. Validation failures name the section and key
//! they come from.

use std::collections::HashMap;
use std::path::Path;

use burrow_proto::event::{CompressMethod, EncryptMethod};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value {value:?} for [{section}] {key}")]
    InvalidValue {
        section: &'static str,
        key: &'static str,
        value: String,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub listen: ListenConfig,
    pub wire: WireConfig,
    pub proxy: ProxyConfig,
    pub relay: RelayConfig,
    pub direct: DirectConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ListenConfig {
    pub address: String,
}

impl Default for ListenConfig {
    fn default() -> Self {
        ListenConfig { address: "127.0.0.1:48100".to_string() }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct WireConfig {
    /// Session token copied into every frame's tag header.
    pub token: String,
    /// User token appended to the session token, when configured.
    pub user: Option<String>,
    pub compress: String,
    pub encrypt: String,
    /// Framed units above this size are split into segments.
    pub max_package_size: usize,
}

impl Default for WireConfig {
    fn default() -> Self {
        WireConfig {
            token: String::new(),
            user: None,
            compress: "block".to_string(),
            encrypt: "shift".to_string(),
            max_package_size: 512 * 1024,
        }
    }
}

impl WireConfig {
    pub fn compress_method(&self) -> Result<CompressMethod, ConfigError> {
        match self.compress.as_str() {
            "none" => Ok(CompressMethod::None),
            "block" => Ok(CompressMethod::Block),
            other => Err(ConfigError::InvalidValue {
                section: "wire",
                key: "compress",
                value: other.to_string(),
            }),
        }
    }

    pub fn encrypt_method(&self) -> Result<EncryptMethod, ConfigError> {
        match self.encrypt.as_str() {
            "none" => Ok(EncryptMethod::None),
            "shift" => Ok(EncryptMethod::Shift),
            other => Err(ConfigError::InvalidValue {
                section: "wire",
                key: "encrypt",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProxyConfig {
    /// Name of the backend manager handling every session.
    pub manager: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig { manager: "direct".to_string() }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct RelayConfig {
    /// Relay worker base URLs; push/pull paths are appended.
    pub workers: Vec<String>,
    pub user: String,
    pub timeout_secs: u64,
    /// Per-request attempt budget, including the first try.
    pub attempts: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            workers: Vec::new(),
            user: "anonymous".to_string(),
            timeout_secs: 25,
            attempts: 2,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DirectConfig {
    /// Logical host to real `host:port` mapping applied before connecting.
    pub hosts: HashMap<String, String>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text)?;
        config.wire.compress_method()?;
        config.wire.encrypt_method()?;
        if config.wire.max_package_size == 0 {
            return Err(ConfigError::InvalidValue {
                section: "wire",
                key: "max-package-size",
                value: "0".to_string(),
            });
        }
        if config.relay.attempts == 0 {
            return Err(ConfigError::InvalidValue {
                section: "relay",
                key: "attempts",
                value: "0".to_string(),
            });
        }
        Ok(config)
    }
}
