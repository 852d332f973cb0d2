//! Relay configuration: TOML file + CLI overrides.

use crate::policy::OriginPolicy;
use crate::relay::RelayOptions;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use u2f_relay_core::{RelayError, RelayResult, SessionOptions};

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub relay: RelaySection,
    #[serde(default)]
    pub device: DeviceSection,
    #[serde(default)]
    pub bridge: BridgeSection,
}

/// `[relay]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct RelaySection {
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            allowed_origins: default_allowed_origins(),
            queue_depth: default_queue_depth(),
        }
    }
}

/// `[device]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceSection {
    #[serde(default = "default_true")]
    pub debug: bool,
    #[serde(default = "default_scramble_key")]
    pub scramble_key: String,
    #[serde(default = "default_exchange_timeout_ms")]
    pub exchange_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub supported: bool,
    #[serde(default = "default_virtual_devices")]
    pub virtual_devices: Vec<String>,
}

impl Default for DeviceSection {
    fn default() -> Self {
        Self {
            debug: true,
            scramble_key: default_scramble_key(),
            exchange_timeout_ms: default_exchange_timeout_ms(),
            supported: true,
            virtual_devices: default_virtual_devices(),
        }
    }
}

/// `[bridge]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for BridgeSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

fn default_allowed_origins() -> Vec<String> {
    vec!["*".to_string()]
}
fn default_queue_depth() -> usize {
    32
}
fn default_scramble_key() -> String {
    "ONT".to_string()
}
fn default_exchange_timeout_ms() -> u64 {
    5000
}
fn default_virtual_devices() -> Vec<String> {
    vec!["virtual:0".to_string()]
}
fn default_bind() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    4433
}
fn default_true() -> bool {
    true
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub bind: Option<String>,
    pub port: Option<u16>,
    /// Replaces the file's list when non-empty.
    pub allowed_origins: Vec<String>,
    /// Replaces the file's list when non-empty.
    pub virtual_devices: Vec<String>,
}

/// Resolved relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub allowed_origins: Vec<String>,
    pub queue_depth: usize,
    pub debug: bool,
    pub scramble_key: String,
    pub exchange_timeout: Duration,
    pub supported: bool,
    pub virtual_devices: Vec<String>,
    pub bind: String,
    pub port: u16,
}

impl RelayConfig {
    /// Load config from a TOML file, then apply CLI overrides. A missing file
    /// yields the defaults.
    pub fn load(config_path: Option<&Path>, overrides: ConfigOverrides) -> RelayResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| RelayError::Config(format!("config parse error: {e}")))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Ok(Self::resolve(file_config, overrides))
    }

    fn resolve(file: ConfigFile, overrides: ConfigOverrides) -> Self {
        let allowed_origins = if overrides.allowed_origins.is_empty() {
            file.relay.allowed_origins
        } else {
            overrides.allowed_origins
        };
        let virtual_devices = if overrides.virtual_devices.is_empty() {
            file.device.virtual_devices
        } else {
            overrides.virtual_devices
        };

        Self {
            allowed_origins,
            queue_depth: file.relay.queue_depth,
            debug: file.device.debug,
            scramble_key: file.device.scramble_key,
            exchange_timeout: Duration::from_millis(file.device.exchange_timeout_ms),
            supported: file.device.supported,
            virtual_devices,
            bind: overrides.bind.unwrap_or(file.bridge.bind),
            port: overrides.port.unwrap_or(file.bridge.port),
        }
    }

    /// Options for each relay instance.
    pub fn relay_options(&self) -> RelayOptions {
        RelayOptions {
            policy: OriginPolicy {
                allowed_origins: self.allowed_origins.clone(),
            },
            queue_depth: self.queue_depth,
            session_defaults: SessionOptions {
                debug: self.debug,
                scramble_key: self.scramble_key.clone(),
                exchange_timeout: self.exchange_timeout,
            },
        }
    }

    /// Socket address string for the WebSocket bridge.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
