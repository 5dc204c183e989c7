//! Configuration file support for sfpd
//!
//! Loads and validates sfpd configuration from TOML files.
//! Default location: /etc/ufi/sfpd.conf

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use ufi_i2c_common::{DEFAULT_LOCK_PATH, LockPolicy};

use crate::board::TopologyConfig;
use crate::error::{SfpdError, SfpdResult};

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/ufi/sfpd.conf";

/// Bus configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Bus id (`/dev/i2c-<id>`)
    #[serde(default = "default_bus_id")]
    pub id: u8,

    /// Directory holding the i2c-dev character devices
    #[serde(default = "default_device_dir")]
    pub device_dir: PathBuf,

    /// Address devices even when a kernel driver has claimed them
    #[serde(default = "default_force")]
    pub force: bool,
}

/// Bus lock configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockConfig {
    /// Lock file shared by every process on the bus
    #[serde(default = "default_lock_path")]
    pub path: PathBuf,

    /// Retries after the first failed attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Pause between attempts in milliseconds
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
}

/// Interrupt line configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterruptConfig {
    /// Kernel file exposing the transceiver interrupt line
    #[serde(default = "default_interrupt_path")]
    pub path: PathBuf,

    /// Written after every wake to re-enable the line
    #[serde(default = "default_rearm_token")]
    pub rearm_token: String,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by RUST_LOG
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Complete sfpd configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SfpdConfig {
    #[serde(default)]
    pub bus: BusConfig,

    #[serde(default)]
    pub lock: LockConfig,

    #[serde(default)]
    pub interrupt: InterruptConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub topology: TopologyConfig,
}

// Default functions
fn default_bus_id() -> u8 {
    0
}

fn default_device_dir() -> PathBuf {
    PathBuf::from("/dev")
}

fn default_force() -> bool {
    false
}

fn default_lock_path() -> PathBuf {
    PathBuf::from(DEFAULT_LOCK_PATH)
}

fn default_max_retries() -> u32 {
    10
}

fn default_retry_interval_ms() -> u64 {
    1000
}

fn default_interrupt_path() -> PathBuf {
    PathBuf::from("/proc/GPIO15")
}

fn default_rearm_token() -> String {
    "1\n".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

// Default implementations
impl Default for BusConfig {
    fn default() -> Self {
        Self {
            id: default_bus_id(),
            device_dir: default_device_dir(),
            force: default_force(),
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            path: default_lock_path(),
            max_retries: default_max_retries(),
            retry_interval_ms: default_retry_interval_ms(),
        }
    }
}

impl Default for InterruptConfig {
    fn default() -> Self {
        Self {
            path: default_interrupt_path(),
            rearm_token: default_rearm_token(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl SfpdConfig {
    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> SfpdResult<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => {
                let config = toml::from_str(&content).map_err(|e| {
                    SfpdError::config(format!(
                        "Failed to parse config file {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                eprintln!(
                    "sfpd: Config file {} not found, using defaults",
                    path.display()
                );
                Ok(Self::default())
            }
            Err(e) => Err(SfpdError::Io(e)),
        }
    }

    /// Load from default location or defaults
    pub fn load() -> SfpdResult<Self> {
        Self::load_or_default(DEFAULT_CONFIG_PATH)
    }

    /// Serialize to TOML
    pub fn to_toml(&self) -> SfpdResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| SfpdError::config(format!("Failed to serialize config: {}", e)))
    }

    /// Save configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> SfpdResult<()> {
        fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    /// Lock retry policy
    pub fn lock_policy(&self) -> LockPolicy {
        LockPolicy {
            max_retries: self.lock.max_retries,
            retry_interval: Duration::from_millis(self.lock.retry_interval_ms),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> SfpdResult<()> {
        if self.lock.path.as_os_str().is_empty() {
            return Err(SfpdError::config("lock path must not be empty"));
        }

        if self.lock.retry_interval_ms == 0 {
            return Err(SfpdError::config("retry_interval_ms must be > 0"));
        }

        if self.interrupt.rearm_token.is_empty() {
            return Err(SfpdError::config("rearm_token must not be empty"));
        }

        let mut indexes: Vec<u8> = self.topology.sfp_ports.iter().map(|p| p.index).collect();
        indexes.sort_unstable();
        if indexes.windows(2).any(|w| w[0] == w[1]) {
            return Err(SfpdError::config("SFP port indexes must be unique"));
        }

        let mut indexes: Vec<u8> = self.topology.qsfp_ports.iter().map(|p| p.index).collect();
        indexes.sort_unstable();
        if indexes.windows(2).any(|w| w[0] == w[1]) {
            return Err(SfpdError::config("QSFP port indexes must be unique"));
        }

        Ok(())
    }
}
