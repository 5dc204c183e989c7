//! Shared I2C bus arbitration for UFI switch platforms
//!
//! Many independent processes reach the same physical bus, and devices
//! behind different mux channels reuse the same addresses. This crate makes
//! each logical transaction safe: a cross-process advisory lock
//! ([`LockBroker`]), a fresh transport per transaction ([`BusProvider`]), and
//! a mux chain that is selected for exactly the span of the transaction
//! ([`MuxTree::with_device`]). [`SharedBus`] composes the three.

pub mod bus;
pub mod error;
pub mod health;
pub mod lock;
pub mod mux;
pub mod sim;
#[cfg(target_os = "linux")]
pub mod smbus;
pub mod transport;

pub use bus::SharedBus;
pub use error::{I2cError, I2cResult};
pub use health::{BusHealth, HealthProbe, check_bus_health};
pub use lock::{
    BusLock, DEFAULT_LOCK_PATH, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_INTERVAL, LockBroker, LockMode,
    LockPolicy,
};
pub use mux::{
    Attachment, Device, DeviceHandle, MUX_CONTROL_REG, MUX_DESELECT, MuxId, MuxNode, MuxTree,
    MuxTreeBuilder, SelectStep,
};
pub use sim::{BusOp, SimBus, SimFault, SimTransport};
#[cfg(target_os = "linux")]
pub use smbus::{DEFAULT_DEVICE_DIR, SmbusDevice, SmbusProvider};
pub use transport::{BusProvider, DeviceAddress, MAX_7BIT_ADDRESS, RegisterTransport};
