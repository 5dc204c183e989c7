//! Error types for sfpd

use std::path::PathBuf;

use thiserror::Error;
use ufi_i2c_common::I2cError;

/// Errors that can occur in sfpd
#[derive(Debug, Error)]
pub enum SfpdError {
    /// Shared bus failure (absent device, lock timeout, mux, transport)
    #[error(transparent)]
    I2c(#[from] I2cError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Port name or index not on this board
    #[error("Invalid port: {0}")]
    InvalidPort(String),

    /// The transceiver needed for the request is not plugged in
    #[error("Module not present: {0}")]
    ModuleNotPresent(String),

    /// Request outside what the hardware exposes (page, lane, EEPROM range)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Interrupt line could not be opened, re-armed or waited on
    #[error("Interrupt line {path}: {source}")]
    Interrupt {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SfpdError {
    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Creates an invalid port error.
    pub fn invalid_port(message: impl Into<String>) -> Self {
        Self::InvalidPort(message.into())
    }

    /// Returns true if the underlying cause is an absent device.
    pub fn is_device_absent(&self) -> bool {
        matches!(self, SfpdError::I2c(e) if e.is_device_absent())
    }
}

/// Result type alias for sfpd operations
pub type SfpdResult<T> = std::result::Result<T, SfpdError>;
