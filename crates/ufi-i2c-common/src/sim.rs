//! In-memory simulated bus.
//!
//! Stands in for `/dev/i2c-N` in tests and dry runs. Models PCA954x muxes
//! (a node behind a mux is only reachable while that mux's channel is
//! selected), register/EEPROM devices with an internal read pointer and an
//! optional page register at byte 127, latching status bits that clear on
//! read, and injected faults.
//!
//! Nodes are identified by `(address, upstream)`, where `upstream` is
//! `Some((mux_address, channel_value))` or `None` for the root segment. Mux
//! addresses must be unique on a simulated bus.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::{I2cError, I2cResult};
use crate::transport::{BusProvider, DeviceAddress, RegisterTransport};

/// `(mux address, channel value)` a simulated node hangs off.
pub type SimUpstream = Option<(u8, u8)>;

const QSFP_PAGE_SELECT: u8 = 127;
const MAX_DEPTH: usize = 8;

/// A completed bus transaction, as recorded by [`SimBus::ops`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusOp {
    ReadByte { addr: u8, reg: u8 },
    WriteByte { addr: u8, reg: u8, value: u8 },
    ReadWord { addr: u8, reg: u8 },
    WriteWord { addr: u8, reg: u8, value: u16 },
    ReceiveByte { addr: u8 },
    SendByte { addr: u8, value: u8 },
}

impl BusOp {
    /// Target address of the transaction.
    pub fn addr(&self) -> u8 {
        match *self {
            BusOp::ReadByte { addr, .. }
            | BusOp::WriteByte { addr, .. }
            | BusOp::ReadWord { addr, .. }
            | BusOp::WriteWord { addr, .. }
            | BusOp::ReceiveByte { addr }
            | BusOp::SendByte { addr, .. } => addr,
        }
    }
}

/// Fault injected on every transaction to an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimFault {
    /// The address NACKs.
    Nack,
    /// The controller reports a bus error.
    BusError,
}

impl SimFault {
    fn error(self, address: DeviceAddress) -> I2cError {
        match self {
            SimFault::Nack => I2cError::DeviceAbsent { address },
            SimFault::BusError => I2cError::transport(
                format!("transfer to {}", address),
                io::Error::other("injected bus error"),
            ),
        }
    }
}

#[derive(Debug)]
struct SimDevice {
    memory: Vec<u8>,
    latched: [u8; 256],
    pointer: u8,
    page: u8,
}

impl SimDevice {
    fn new() -> Self {
        Self {
            memory: vec![0; 256],
            latched: [0; 256],
            pointer: 0,
            page: 0,
        }
    }

    fn paged(&self) -> bool {
        self.memory.len() > 256
    }

    fn index(&self, offset: u8) -> usize {
        if offset < 128 {
            usize::from(offset)
        } else {
            128 + usize::from(self.page) * 128 + usize::from(offset - 128)
        }
    }

    fn peek(&self, offset: u8) -> u8 {
        self.memory.get(self.index(offset)).copied().unwrap_or(0xff)
    }

    fn read(&mut self, offset: u8) -> u8 {
        let value = self.peek(offset) | self.latched[usize::from(offset)];
        self.latched[usize::from(offset)] = 0;
        value
    }

    fn write(&mut self, offset: u8, value: u8) {
        if offset == QSFP_PAGE_SELECT && self.paged() {
            self.page = value;
            return;
        }
        let index = self.index(offset);
        if let Some(slot) = self.memory.get_mut(index) {
            *slot = value;
        }
    }
}

#[derive(Debug)]
enum NodeKind {
    Mux { selected: u8 },
    Device(SimDevice),
}

#[derive(Debug)]
struct SimNode {
    addr: u8,
    upstream: SimUpstream,
    kind: NodeKind,
}

#[derive(Debug, Default)]
struct SimState {
    nodes: Vec<SimNode>,
    faults: Vec<(u8, SimFault)>,
    /// One-shot faults: (address, accesses left before it fires, fault).
    trips: Vec<(u8, usize, SimFault)>,
    ops: Vec<BusOp>,
}

impl SimState {
    fn mux_selected(&self, addr: u8) -> Option<(u8, SimUpstream)> {
        self.nodes.iter().find_map(|n| match n.kind {
            NodeKind::Mux { selected } if n.addr == addr => Some((selected, n.upstream)),
            _ => None,
        })
    }

    fn visible(&self, mut upstream: SimUpstream) -> bool {
        for _ in 0..MAX_DEPTH {
            let Some((mux, select)) = upstream else {
                return true;
            };
            match self.mux_selected(mux) {
                Some((selected, parent)) if selected & select != 0 => upstream = parent,
                _ => return false,
            }
        }
        false
    }

    fn position(&self, addr: u8, upstream: SimUpstream) -> Option<usize> {
        self.nodes
            .iter()
            .position(|n| n.addr == addr && n.upstream == upstream)
    }

    fn device_mut(&mut self, addr: u8, upstream: SimUpstream) -> &mut SimDevice {
        let index = match self.position(addr, upstream) {
            Some(i) => i,
            None => {
                self.nodes.push(SimNode {
                    addr,
                    upstream,
                    kind: NodeKind::Device(SimDevice::new()),
                });
                self.nodes.len() - 1
            }
        };
        if !matches!(self.nodes[index].kind, NodeKind::Device(_)) {
            self.nodes[index].kind = NodeKind::Device(SimDevice::new());
        }
        match &mut self.nodes[index].kind {
            NodeKind::Device(dev) => dev,
            NodeKind::Mux { .. } => unreachable!("node was just made a device"),
        }
    }

    /// Resolves the single visible node answering at `addr`.
    fn target(&mut self, bus: u8, addr: u8) -> I2cResult<&mut NodeKind> {
        let address = DeviceAddress { bus, addr };
        if let Some(pos) = self.trips.iter().position(|(a, _, _)| *a == addr) {
            if self.trips[pos].1 == 0 {
                let (_, _, fault) = self.trips.remove(pos);
                return Err(fault.error(address));
            }
            self.trips[pos].1 -= 1;
        }
        if let Some(&(_, fault)) = self.faults.iter().find(|(a, _)| *a == addr) {
            return Err(fault.error(address));
        }
        let matches: Vec<usize> = (0..self.nodes.len())
            .filter(|&i| self.nodes[i].addr == addr && self.visible(self.nodes[i].upstream))
            .collect();
        match matches.as_slice() {
            [] => Err(I2cError::DeviceAbsent { address }),
            [i] => Ok(&mut self.nodes[*i].kind),
            _ => Err(I2cError::transport(
                format!("transfer to {}", address),
                io::Error::other("address collision: more than one device responded"),
            )),
        }
    }
}

/// A simulated bus shared by every transport opened from it.
#[derive(Debug, Clone)]
pub struct SimBus {
    bus: u8,
    state: Arc<Mutex<SimState>>,
    open: Arc<AtomicUsize>,
}

impl SimBus {
    /// Creates an empty simulated bus with id `bus`.
    pub fn new(bus: u8) -> Self {
        Self {
            bus,
            state: Arc::new(Mutex::new(SimState::default())),
            open: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Adds a mux at `addr`.
    pub fn add_mux(&self, addr: u8, upstream: SimUpstream) {
        let mut state = self.state.lock();
        if state.position(addr, upstream).is_none() {
            state.nodes.push(SimNode {
                addr,
                upstream,
                kind: NodeKind::Mux { selected: 0 },
            });
        }
    }

    /// Adds a 256-byte register/EEPROM device at `addr`.
    pub fn add_device(&self, addr: u8, upstream: SimUpstream) {
        self.state.lock().device_mut(addr, upstream);
    }

    /// Removes the node at `addr`, e.g. to unplug a module.
    pub fn remove_device(&self, addr: u8, upstream: SimUpstream) {
        let mut state = self.state.lock();
        if let Some(i) = state.position(addr, upstream) {
            state.nodes.remove(i);
        }
    }

    /// Sets a register, creating the device if needed.
    pub fn set_register(&self, addr: u8, upstream: SimUpstream, reg: u8, value: u8) {
        let mut state = self.state.lock();
        let dev = state.device_mut(addr, upstream);
        let index = dev.index(reg);
        if let Some(slot) = dev.memory.get_mut(index) {
            *slot = value;
        }
    }

    /// Reads a register without side effects.
    pub fn register(&self, addr: u8, upstream: SimUpstream, reg: u8) -> Option<u8> {
        let state = self.state.lock();
        let i = state.position(addr, upstream)?;
        match &state.nodes[i].kind {
            NodeKind::Device(dev) => Some(dev.peek(reg)),
            NodeKind::Mux { selected } => Some(*selected),
        }
    }

    /// Latches `bits` into `reg`; they read back as set once, then clear.
    pub fn latch(&self, addr: u8, upstream: SimUpstream, reg: u8, bits: u8) {
        let mut state = self.state.lock();
        state.device_mut(addr, upstream).latched[usize::from(reg)] |= bits;
    }

    /// Pending latched bits of `reg`.
    pub fn latched(&self, addr: u8, upstream: SimUpstream, reg: u8) -> u8 {
        let state = self.state.lock();
        match state.position(addr, upstream).map(|i| &state.nodes[i].kind) {
            Some(NodeKind::Device(dev)) => dev.latched[usize::from(reg)],
            _ => 0,
        }
    }

    /// Replaces a device's memory. More than 256 bytes makes it paged: byte
    /// 127 then selects which 128-byte upper page appears at 128..=255.
    pub fn set_memory(&self, addr: u8, upstream: SimUpstream, bytes: &[u8]) {
        let mut state = self.state.lock();
        let dev = state.device_mut(addr, upstream);
        let mut memory = bytes.to_vec();
        if memory.len() < 256 {
            memory.resize(256, 0);
        }
        dev.memory = memory;
        dev.page = 0;
    }

    /// Injects (or clears, with `None`) a fault on every access to `addr`.
    pub fn set_fault(&self, addr: u8, fault: Option<SimFault>) {
        let mut state = self.state.lock();
        state.faults.retain(|(a, _)| *a != addr);
        if let Some(fault) = fault {
            state.faults.push((addr, fault));
        }
    }

    /// Lets `accesses` more accesses to `addr` through, then fails the next
    /// one with `fault`. Later accesses succeed again.
    pub fn fail_after(&self, addr: u8, accesses: usize, fault: SimFault) {
        let mut state = self.state.lock();
        state.trips.retain(|(a, _, _)| *a != addr);
        state.trips.push((addr, accesses, fault));
    }

    /// Completed transactions since the last [`SimBus::clear_ops`].
    pub fn ops(&self) -> Vec<BusOp> {
        self.state.lock().ops.clone()
    }

    /// Forgets recorded transactions.
    pub fn clear_ops(&self) {
        self.state.lock().ops.clear();
    }

    /// Current channel value of the mux at `addr`.
    pub fn mux_channel(&self, addr: u8) -> Option<u8> {
        self.state.lock().mux_selected(addr).map(|(selected, _)| selected)
    }

    /// True when no mux has a channel selected.
    pub fn all_deselected(&self) -> bool {
        self.state
            .lock()
            .nodes
            .iter()
            .all(|n| !matches!(n.kind, NodeKind::Mux { selected } if selected != 0))
    }

    /// Number of transports currently open.
    pub fn open_transports(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }
}

impl BusProvider for SimBus {
    type Transport = SimTransport;

    fn open(&self, bus: u8) -> I2cResult<SimTransport> {
        if bus != self.bus {
            return Err(I2cError::transport(
                format!("open /dev/i2c-{}", bus),
                io::Error::from(io::ErrorKind::NotFound),
            ));
        }
        self.open.fetch_add(1, Ordering::SeqCst);
        Ok(SimTransport {
            bus,
            state: Arc::clone(&self.state),
            open: Arc::clone(&self.open),
        })
    }
}

/// A transport opened from a [`SimBus`].
#[derive(Debug)]
pub struct SimTransport {
    bus: u8,
    state: Arc<Mutex<SimState>>,
    open: Arc<AtomicUsize>,
}

impl SimTransport {
    fn run<R>(
        &mut self,
        addr: u8,
        op: BusOp,
        f: impl FnOnce(&mut NodeKind) -> io::Result<R>,
    ) -> I2cResult<R> {
        let mut state = self.state.lock();
        let bus = self.bus;
        let node = state.target(bus, addr)?;
        let value = f(node).map_err(|e| {
            I2cError::transport(format!("transfer to {}", DeviceAddress { bus, addr }), e)
        })?;
        state.ops.push(op);
        Ok(value)
    }
}

fn unsupported() -> io::Error {
    io::Error::from(io::ErrorKind::Unsupported)
}

impl RegisterTransport for SimTransport {
    fn bus(&self) -> u8 {
        self.bus
    }

    fn read_byte(&mut self, addr: u8, reg: u8) -> I2cResult<u8> {
        self.run(addr, BusOp::ReadByte { addr, reg }, |node| match node {
            NodeKind::Mux { selected } => Ok(*selected),
            NodeKind::Device(dev) => Ok(dev.read(reg)),
        })
    }

    fn write_byte(&mut self, addr: u8, reg: u8, value: u8) -> I2cResult<()> {
        self.run(addr, BusOp::WriteByte { addr, reg, value }, |node| {
            match node {
                NodeKind::Mux { selected } => *selected = value,
                NodeKind::Device(dev) => dev.write(reg, value),
            }
            Ok(())
        })
    }

    fn read_word(&mut self, addr: u8, reg: u8) -> I2cResult<u16> {
        self.run(addr, BusOp::ReadWord { addr, reg }, |node| match node {
            NodeKind::Mux { .. } => Err(unsupported()),
            NodeKind::Device(dev) => {
                let lo = dev.read(reg);
                let hi = dev.read(reg.wrapping_add(1));
                Ok(u16::from_le_bytes([lo, hi]))
            }
        })
    }

    fn write_word(&mut self, addr: u8, reg: u8, value: u16) -> I2cResult<()> {
        self.run(addr, BusOp::WriteWord { addr, reg, value }, |node| match node {
            NodeKind::Mux { .. } => Err(unsupported()),
            NodeKind::Device(dev) => {
                let [lo, hi] = value.to_le_bytes();
                dev.write(reg, lo);
                dev.write(reg.wrapping_add(1), hi);
                Ok(())
            }
        })
    }

    fn receive_byte(&mut self, addr: u8) -> I2cResult<u8> {
        self.run(addr, BusOp::ReceiveByte { addr }, |node| match node {
            NodeKind::Mux { selected } => Ok(*selected),
            NodeKind::Device(dev) => {
                let value = dev.read(dev.pointer);
                dev.pointer = dev.pointer.wrapping_add(1);
                Ok(value)
            }
        })
    }

    fn send_byte(&mut self, addr: u8, value: u8) -> I2cResult<()> {
        self.run(addr, BusOp::SendByte { addr, value }, |node| {
            match node {
                NodeKind::Mux { selected } => *selected = value,
                NodeKind::Device(dev) => dev.pointer = value,
            }
            Ok(())
        })
    }
}

impl Drop for SimTransport {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}
