//! I2C multiplexer tree.
//!
//! PCA954x-style muxes gate which downstream segment is connected to the bus.
//! Devices behind different channels reuse the same addresses (every SFP
//! EEPROM answers at 0x50), so a transaction is only valid while exactly the
//! right chain of channels is selected.
//!
//! [`MuxTree::with_device`] selects the chain root first, runs the
//! transaction, and deselects innermost first on every exit path, including
//! unwinding out of the transaction closure.

use tracing::{trace, warn};

use crate::error::{I2cError, I2cResult};
use crate::transport::{DeviceAddress, RegisterTransport};

/// Control register written to select a channel.
pub const MUX_CONTROL_REG: u8 = 0x00;

/// Control value that disconnects every channel.
pub const MUX_DESELECT: u8 = 0x00;

/// Index of a mux inside its [`MuxTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MuxId(usize);

/// Where a mux or device hangs: a mux and the channel value that reaches it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attachment {
    /// Upstream mux.
    pub mux: MuxId,
    /// Value written to the upstream mux's control register.
    pub select: u8,
}

/// One multiplexer chip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxNode {
    /// Human-readable name, e.g. `9548_sfp1`.
    pub name: String,
    /// Bus address of the mux.
    pub address: DeviceAddress,
    /// Number of downstream channels.
    pub channels: u8,
    /// Upstream attachment, `None` for a mux on the root segment.
    pub upstream: Option<Attachment>,
}

/// A device resolved against a [`MuxTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Device {
    /// Bus address of the device.
    pub address: DeviceAddress,
    /// Upstream attachment, `None` for a device on the root segment.
    pub upstream: Option<Attachment>,
}

/// One channel-select write on the path to a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectStep {
    /// The mux being written.
    pub mux: DeviceAddress,
    /// Channel value to write.
    pub select: u8,
}

/// Builds a [`MuxTree`] for one bus.
#[derive(Debug)]
pub struct MuxTreeBuilder {
    bus: u8,
    nodes: Vec<MuxNode>,
}

impl MuxTreeBuilder {
    /// Starts an empty tree for `bus`.
    pub fn new(bus: u8) -> Self {
        Self {
            bus,
            nodes: Vec::new(),
        }
    }

    /// Adds a mux at `addr`, optionally behind `upstream`.
    pub fn add_mux(
        &mut self,
        name: impl Into<String>,
        addr: u8,
        channels: u8,
        upstream: Option<Attachment>,
    ) -> I2cResult<MuxId> {
        let name = name.into();
        if channels == 0 || channels > 8 {
            return Err(I2cError::invalid_topology(format!(
                "mux {} has {} channels, expected 1..=8",
                name, channels
            )));
        }
        if self.nodes.iter().any(|n| n.name == name) {
            return Err(I2cError::invalid_topology(format!(
                "duplicate mux name {}",
                name
            )));
        }
        if let Some(att) = upstream {
            validate_attachment(&self.nodes, att)?;
        }
        let address = DeviceAddress::new(self.bus, addr)?;
        self.nodes.push(MuxNode {
            name,
            address,
            channels,
            upstream,
        });
        Ok(MuxId(self.nodes.len() - 1))
    }

    /// Looks up a mux added so far.
    pub fn find(&self, name: &str) -> Option<MuxId> {
        self.nodes.iter().position(|n| n.name == name).map(MuxId)
    }

    /// Finishes the tree.
    pub fn build(self) -> MuxTree {
        MuxTree {
            bus: self.bus,
            nodes: self.nodes,
        }
    }
}

fn validate_attachment(nodes: &[MuxNode], att: Attachment) -> I2cResult<()> {
    let node = nodes.get(att.mux.0).ok_or_else(|| {
        I2cError::invalid_topology(format!("unknown mux id {}", att.mux.0))
    })?;
    let valid = att.select.count_ones() == 1 && att.select.trailing_zeros() < u32::from(node.channels);
    if !valid {
        return Err(I2cError::invalid_topology(format!(
            "channel value {:#04x} is not a single channel of {} ({} channels)",
            att.select, node.name, node.channels
        )));
    }
    Ok(())
}

/// Static cascade of muxes on one bus. Built once, never mutated.
#[derive(Debug, Clone)]
pub struct MuxTree {
    bus: u8,
    nodes: Vec<MuxNode>,
}

impl MuxTree {
    /// Bus id of the root segment.
    pub fn bus(&self) -> u8 {
        self.bus
    }

    /// Looks up a mux by name.
    pub fn find(&self, name: &str) -> Option<MuxId> {
        self.nodes.iter().position(|n| n.name == name).map(MuxId)
    }

    /// Returns the node for `id`.
    pub fn node(&self, id: MuxId) -> Option<&MuxNode> {
        self.nodes.get(id.0)
    }

    /// Iterates over all muxes.
    pub fn muxes(&self) -> impl Iterator<Item = (MuxId, &MuxNode)> {
        self.nodes.iter().enumerate().map(|(i, n)| (MuxId(i), n))
    }

    /// Resolves a device at `addr`, optionally behind `upstream`.
    pub fn device(&self, addr: u8, upstream: Option<Attachment>) -> I2cResult<Device> {
        if let Some(att) = upstream {
            validate_attachment(&self.nodes, att)?;
        }
        Ok(Device {
            address: DeviceAddress::new(self.bus, addr)?,
            upstream,
        })
    }

    /// Channel-select writes needed to reach `device`, root first.
    ///
    /// Fails when `device` refers to a mux that is not part of this tree.
    pub fn path(&self, device: &Device) -> I2cResult<Vec<SelectStep>> {
        let mut steps = Vec::new();
        let mut next = device.upstream;
        while let Some(att) = next {
            let node = self.nodes.get(att.mux.0).ok_or_else(|| {
                I2cError::invalid_topology(format!(
                    "device {} is attached to mux #{} which is not in this tree",
                    device.address, att.mux.0
                ))
            })?;
            steps.push(SelectStep {
                mux: node.address,
                select: att.select,
            });
            next = node.upstream;
        }
        steps.reverse();
        Ok(steps)
    }

    /// Number of muxes between the root and `device`.
    pub fn depth(&self, device: &Device) -> I2cResult<usize> {
        Ok(self.path(device)?.len())
    }

    /// Runs `f` with `device` reachable on `transport` and returns its
    /// output together with the outcome of the deselect.
    ///
    /// Selects every level root first, then deselects the levels that were
    /// selected innermost first, whether `f` returns or panics. A failed
    /// select skips `f` and is the returned error.
    pub fn with_device_scoped<T, R, F>(
        &self,
        transport: &mut T,
        device: &Device,
        f: F,
    ) -> I2cResult<(R, I2cResult<()>)>
    where
        T: RegisterTransport,
        F: FnOnce(&mut DeviceHandle<'_, T>) -> R,
    {
        let steps = self.path(device)?;
        let mut selection = Selection {
            transport,
            steps: &steps,
            selected: 0,
            released: false,
        };

        if let Err(e) = selection.select_all() {
            if let Err(cleanup) = selection.release() {
                warn!(device = %device.address, error = %cleanup, "Mux cleanup failed after select error");
            }
            return Err(e);
        }

        let output = {
            let mut handle = DeviceHandle {
                transport: &mut *selection.transport,
                address: device.address,
            };
            f(&mut handle)
        };
        Ok((output, selection.release()))
    }

    /// Runs `f` with `device` reachable on `transport`.
    ///
    /// See [`MuxTree::with_device_scoped`] for the select order. When both
    /// `f` and the cleanup fail, the error from `f` is returned and the
    /// cleanup error is logged.
    pub fn with_device<T, R, F>(&self, transport: &mut T, device: &Device, f: F) -> I2cResult<R>
    where
        T: RegisterTransport,
        F: FnOnce(&mut DeviceHandle<'_, T>) -> I2cResult<R>,
    {
        let (result, cleanup) = self.with_device_scoped(transport, device, f)?;
        settle(device, result, cleanup)
    }
}

/// Combines a transaction result with its deselect outcome. The
/// transaction's own error wins over a cleanup error.
pub(crate) fn settle<R, E: From<I2cError>>(
    device: &Device,
    result: Result<R, E>,
    cleanup: I2cResult<()>,
) -> Result<R, E> {
    match (result, cleanup) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(cleanup)) => Err(E::from(cleanup)),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(cleanup)) => {
            warn!(device = %device.address, error = %cleanup, "Mux cleanup failed after transaction error");
            Err(e)
        }
    }
}

/// The selected part of a mux path. Deselects on drop unless released.
struct Selection<'a, T: RegisterTransport> {
    transport: &'a mut T,
    steps: &'a [SelectStep],
    selected: usize,
    released: bool,
}

impl<T: RegisterTransport> Selection<'_, T> {
    fn select_all(&mut self) -> I2cResult<()> {
        for step in self.steps {
            trace!(mux = %step.mux, select = step.select, "Selecting mux channel");
            self.transport
                .write_byte(step.mux.addr, MUX_CONTROL_REG, step.select)
                .map_err(|e| I2cError::mux_select(step.mux, step.select, e))?;
            self.selected += 1;
        }
        Ok(())
    }

    /// Deselects every selected level, innermost first. Every level is
    /// attempted; the first failure is returned.
    fn deselect(&mut self) -> I2cResult<()> {
        let mut first_err = None;
        for step in self.steps[..self.selected].iter().rev() {
            trace!(mux = %step.mux, "Deselecting mux");
            if let Err(e) = self
                .transport
                .write_byte(step.mux.addr, MUX_CONTROL_REG, MUX_DESELECT)
            {
                warn!(mux = %step.mux, error = %e, "Failed to deselect mux");
                first_err.get_or_insert(I2cError::mux_select(step.mux, MUX_DESELECT, e));
            }
        }
        self.selected = 0;
        first_err.map_or(Ok(()), Err)
    }

    fn release(mut self) -> I2cResult<()> {
        self.released = true;
        self.deselect()
    }
}

impl<T: RegisterTransport> Drop for Selection<'_, T> {
    fn drop(&mut self) {
        if !self.released {
            let _ = self.deselect();
        }
    }
}

/// A transport scoped to one device for the duration of a mux selection.
pub struct DeviceHandle<'a, T: RegisterTransport> {
    transport: &'a mut T,
    address: DeviceAddress,
}

impl<T: RegisterTransport> DeviceHandle<'_, T> {
    /// Address of the device this handle talks to.
    pub fn address(&self) -> DeviceAddress {
        self.address
    }

    /// Reads a register byte.
    pub fn read_byte(&mut self, reg: u8) -> I2cResult<u8> {
        self.transport.read_byte(self.address.addr, reg)
    }

    /// Writes a register byte.
    pub fn write_byte(&mut self, reg: u8, value: u8) -> I2cResult<()> {
        self.transport.write_byte(self.address.addr, reg, value)
    }

    /// Reads a register word.
    pub fn read_word(&mut self, reg: u8) -> I2cResult<u16> {
        self.transport.read_word(self.address.addr, reg)
    }

    /// Writes a register word.
    pub fn write_word(&mut self, reg: u8, value: u16) -> I2cResult<()> {
        self.transport.write_word(self.address.addr, reg, value)
    }

    /// Reads a byte at the device's internal pointer.
    pub fn receive_byte(&mut self) -> I2cResult<u8> {
        self.transport.receive_byte(self.address.addr)
    }

    /// Sends a single byte, e.g. to set an EEPROM's internal pointer.
    pub fn send_byte(&mut self, value: u8) -> I2cResult<()> {
        self.transport.send_byte(self.address.addr, value)
    }

    /// Read-modify-write of the bits in `mask`. Returns the new value.
    pub fn modify_byte(&mut self, reg: u8, mask: u8, bits: u8) -> I2cResult<u8> {
        let current = self.read_byte(reg)?;
        let updated = (current & !mask) | (bits & mask);
        if updated != current {
            self.write_byte(reg, updated)?;
        }
        Ok(updated)
    }
}
