//! Register-level bus transport.
//!
//! A [`RegisterTransport`] performs one SMBus transaction per call against a
//! 7-bit address on a single physical bus. A [`BusProvider`] opens a fresh
//! transport for a bus; the transport is closed when dropped, so each logical
//! transaction gets its own handle.

use std::fmt;

use crate::error::{I2cError, I2cResult};

/// Highest valid 7-bit device address.
pub const MAX_7BIT_ADDRESS: u8 = 0x7f;

/// A physical chip on a bus: (bus id, 7-bit address).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceAddress {
    /// Bus id (`/dev/i2c-<bus>`).
    pub bus: u8,
    /// 7-bit device address.
    pub addr: u8,
}

impl DeviceAddress {
    /// Creates a device address, rejecting anything wider than 7 bits.
    pub fn new(bus: u8, addr: u8) -> I2cResult<Self> {
        if addr > MAX_7BIT_ADDRESS {
            return Err(I2cError::invalid_topology(format!(
                "address {:#04x} on bus {} is not a 7-bit address",
                addr, bus
            )));
        }
        Ok(Self { bus, addr })
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:#04x}", self.bus, self.addr)
    }
}

/// Single-transaction register access on one bus.
///
/// Every method is one atomic bus transaction. A NACK from `addr` is returned
/// as [`I2cError::DeviceAbsent`]; all other failures as
/// [`I2cError::TransportIo`].
pub trait RegisterTransport {
    /// Bus id this transport talks to.
    fn bus(&self) -> u8;

    /// SMBus "read byte data".
    fn read_byte(&mut self, addr: u8, reg: u8) -> I2cResult<u8>;

    /// SMBus "write byte data".
    fn write_byte(&mut self, addr: u8, reg: u8, value: u8) -> I2cResult<()>;

    /// SMBus "read word data".
    fn read_word(&mut self, addr: u8, reg: u8) -> I2cResult<u16>;

    /// SMBus "write word data".
    fn write_word(&mut self, addr: u8, reg: u8, value: u16) -> I2cResult<()>;

    /// SMBus "receive byte": reads at the device's internal pointer.
    fn receive_byte(&mut self, addr: u8) -> I2cResult<u8>;

    /// SMBus "send byte": writes a single byte with no register.
    fn send_byte(&mut self, addr: u8, value: u8) -> I2cResult<()>;
}

/// Opens transports for a bus id.
pub trait BusProvider {
    /// The transport type produced.
    type Transport: RegisterTransport;

    /// Opens a transport on `bus`. The handle is closed when dropped.
    fn open(&self, bus: u8) -> I2cResult<Self::Transport>;
}

impl<P: BusProvider + ?Sized> BusProvider for std::sync::Arc<P> {
    type Transport = P::Transport;

    fn open(&self, bus: u8) -> I2cResult<Self::Transport> {
        (**self).open(bus)
    }
}
