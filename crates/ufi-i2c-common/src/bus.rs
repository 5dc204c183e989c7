//! The shared bus: lock + transport + mux selection for one transaction.

use tracing::trace;

use crate::error::{I2cError, I2cResult};
use crate::lock::{LockBroker, LockMode};
use crate::mux::{Device, DeviceHandle, MuxTree, settle};
use crate::transport::BusProvider;

/// Arbitrated access to every device on one physical bus.
///
/// Each [`SharedBus::transaction`] takes the cross-process lock, opens a
/// fresh transport, selects the device's mux chain, runs the closure, then
/// deselects, closes the transport and releases the lock, in that order.
#[derive(Debug)]
pub struct SharedBus<P: BusProvider> {
    provider: P,
    tree: MuxTree,
    lock: LockBroker,
}

impl<P: BusProvider> SharedBus<P> {
    /// Creates a shared bus over `tree`'s bus id.
    pub fn new(provider: P, tree: MuxTree, lock: LockBroker) -> Self {
        Self {
            provider,
            tree,
            lock,
        }
    }

    /// The mux topology.
    pub fn tree(&self) -> &MuxTree {
        &self.tree
    }

    /// The lock broker.
    pub fn lock(&self) -> &LockBroker {
        &self.lock
    }

    /// Lock mode actually used for `device` when `requested` is asked for.
    ///
    /// Reaching a device through a mux depends on the channel staying
    /// selected across several bus calls, so those paths are always
    /// exclusive.
    pub fn effective_mode(&self, device: &Device, requested: LockMode) -> LockMode {
        if device.upstream.is_some() {
            LockMode::Exclusive
        } else {
            requested
        }
    }

    /// Runs `f` against `device` as one arbitrated transaction.
    pub fn transaction<R, E, F>(&self, device: &Device, mode: LockMode, f: F) -> Result<R, E>
    where
        E: From<I2cError>,
        F: FnOnce(&mut DeviceHandle<'_, P::Transport>) -> Result<R, E>,
    {
        let mode = self.effective_mode(device, mode);
        trace!(device = %device.address, ?mode, "Starting bus transaction");
        let _lock = self.lock.acquire(mode)?;
        let mut transport = self.provider.open(self.tree.bus())?;

        let outcome = self.tree.with_device_scoped(&mut transport, device, f);
        drop(transport);
        let (result, cleanup) = outcome?;
        settle(device, result, cleanup)
    }

    /// Reads one register under a shared lock (upgraded if muxed).
    pub fn read_byte(&self, device: &Device, reg: u8) -> I2cResult<u8> {
        self.transaction(device, LockMode::Shared, |d| d.read_byte(reg))
    }

    /// Writes one register under an exclusive lock.
    pub fn write_byte(&self, device: &Device, reg: u8, value: u8) -> I2cResult<()> {
        self.transaction(device, LockMode::Exclusive, |d| d.write_byte(reg, value))
    }

    /// Reads one register word.
    pub fn read_word(&self, device: &Device, reg: u8) -> I2cResult<u16> {
        self.transaction(device, LockMode::Shared, |d| d.read_word(reg))
    }

    /// Writes one register word.
    pub fn write_word(&self, device: &Device, reg: u8, value: u16) -> I2cResult<()> {
        self.transaction(device, LockMode::Exclusive, |d| d.write_word(reg, value))
    }

    /// Read-modify-write of `mask` bits, as one exclusive transaction.
    pub fn modify_byte(&self, device: &Device, reg: u8, mask: u8, bits: u8) -> I2cResult<u8> {
        self.transaction(device, LockMode::Exclusive, |d| d.modify_byte(reg, mask, bits))
    }

    /// Returns whether `device` acknowledges a receive-byte.
    ///
    /// Absence is `Ok(false)`; lock, mux and other bus faults are errors.
    pub fn probe(&self, device: &Device) -> I2cResult<bool> {
        match self.transaction(device, LockMode::Shared, |d| d.receive_byte()) {
            Ok(_) => Ok(true),
            Err(e) if e.is_device_absent() => Ok(false),
            Err(e) => Err(e),
        }
    }
}
