//! Error types for shared I2C bus operations.
//!
//! A NACK from the addressed device is reported separately from every other
//! bus fault. Unplugged transceivers NACK all the time, so callers match on
//! [`I2cError::DeviceAbsent`] instead of treating it as a failure.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::transport::DeviceAddress;

/// Result type alias for I2C operations.
pub type I2cResult<T> = Result<T, I2cError>;

/// Errors that can occur while arbitrating or using the shared bus.
#[derive(Debug, Error)]
pub enum I2cError {
    /// The addressed device did not acknowledge.
    #[error("Device {address} did not acknowledge")]
    DeviceAbsent {
        /// The device that was addressed.
        address: DeviceAddress,
    },

    /// The cross-process bus lock could not be acquired within the retry budget.
    #[error("Cannot acquire I2C lock {path} after {attempts} attempts")]
    LockTimeout {
        /// The lock file path.
        path: PathBuf,
        /// Number of acquisition attempts made.
        attempts: u32,
    },

    /// A channel select (or deselect) write to a mux failed.
    #[error("Failed to write channel {value:#04x} to mux {mux}: {source}")]
    MuxSelect {
        /// The mux whose control register was written.
        mux: DeviceAddress,
        /// The channel value being written (0x00 for deselect).
        value: u8,
        /// The underlying bus error.
        #[source]
        source: Box<I2cError>,
    },

    /// Any other bus I/O failure.
    #[error("I2C transport error ({context}): {source}")]
    TransportIo {
        /// What was being attempted.
        context: String,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// The lock file could not be opened, created or locked.
    #[error("Lock file {path} unavailable: {source}")]
    LockFile {
        /// The lock file path.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// A mux or device definition is inconsistent.
    #[error("Invalid bus topology: {0}")]
    InvalidTopology(String),
}

impl I2cError {
    /// Creates a transport error.
    pub fn transport(context: impl Into<String>, source: io::Error) -> Self {
        Self::TransportIo {
            context: context.into(),
            source,
        }
    }

    /// Creates a mux select error wrapping the failed write.
    pub fn mux_select(mux: DeviceAddress, value: u8, source: I2cError) -> Self {
        Self::MuxSelect {
            mux,
            value,
            source: Box::new(source),
        }
    }

    /// Creates an invalid topology error.
    pub fn invalid_topology(message: impl Into<String>) -> Self {
        Self::InvalidTopology(message.into())
    }

    /// Returns true if the addressed device itself NACKed.
    ///
    /// A NACK from a mux on the way to the device is not an absent device;
    /// it is reported as [`I2cError::MuxSelect`].
    pub fn is_device_absent(&self) -> bool {
        matches!(self, I2cError::DeviceAbsent { .. })
    }
}
