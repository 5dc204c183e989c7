//! Transceiver pin access through the board's GPIO expanders.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::thread;
use std::time::Duration;

use tracing::{debug, info};
use ufi_i2c_common::{BusProvider, Device, I2cResult, LockMode, SharedBus};

use crate::board::{Board, Pin};
use crate::error::{SfpdError, SfpdResult};
use crate::port::{PortId, PortType};

/// SFF-8436 reset pulse width.
pub const QSFP_RESET_HOLD: Duration = Duration::from_secs(2);

/// Latched SFP status pins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SfpAlarms {
    pub rx_loss: bool,
    pub tx_fault: bool,
}

/// Alarm pins of a set of ports, as read by one pass over the status
/// registers.
#[derive(Debug, Default)]
pub struct AlarmSnapshot {
    alarms: BTreeMap<PortId, SfpAlarms>,
    failed: BTreeSet<PortId>,
    errors: Vec<SfpdError>,
}

impl AlarmSnapshot {
    pub fn insert(&mut self, port: PortId, alarms: SfpAlarms) {
        self.alarms.insert(port, alarms);
    }

    /// Marks `port` unreadable for this pass.
    pub fn mark_failed(&mut self, port: PortId) {
        self.failed.insert(port);
    }

    /// Records a failed register read. Logged and counted once, however
    /// many ports share the register.
    pub fn push_error(&mut self, error: SfpdError) {
        self.errors.push(error);
    }

    /// Alarms of `port`; `None` for ports without status pins and for
    /// failed ports.
    pub fn get(&self, port: PortId) -> Option<SfpAlarms> {
        self.alarms.get(&port).copied()
    }

    pub fn is_failed(&self, port: PortId) -> bool {
        self.failed.contains(&port)
    }

    pub fn errors(&self) -> &[SfpdError] {
        &self.errors
    }
}

/// Hardware reads the hot-plug monitor depends on.
pub trait PortObserver {
    /// Every monitored port, in reconciliation order.
    fn ports(&self) -> Vec<PortId>;

    /// Reads the presence pin of `port`.
    fn presence(&self, port: PortId) -> SfpdResult<bool>;

    /// Reads the latched status pins of every port in `ports`.
    ///
    /// A status register latches the pins of several ports and clears all
    /// of them on read, so each register is read exactly once and every
    /// port's bit is decoded from that byte.
    fn alarm_snapshot(&self, ports: &[PortId]) -> AlarmSnapshot;
}

/// SFP receiver rate select (RS0).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SfpRate {
    /// Reduced bandwidth, 1G.
    Low,
    /// Full bandwidth, 10G.
    High,
}

impl fmt::Display for SfpRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SfpRate::Low => "1G",
            SfpRate::High => "10G",
        })
    }
}

/// Pin-level control of every transceiver cage on the board.
#[derive(Debug)]
pub struct PortController<P: BusProvider> {
    bus: SharedBus<P>,
    board: Board,
}

impl<P: BusProvider> PortController<P> {
    pub fn new(bus: SharedBus<P>, board: Board) -> Self {
        Self { bus, board }
    }

    pub fn bus(&self) -> &SharedBus<P> {
        &self.bus
    }

    pub fn board(&self) -> &Board {
        &self.board
    }

    fn read_pin(&self, pin: &Pin) -> I2cResult<bool> {
        let raw = self.bus.read_byte(&pin.device, pin.register)?;
        Ok(pin.decode(raw))
    }

    fn write_pin(&self, pin: &Pin, asserted: bool) -> I2cResult<()> {
        self.bus
            .modify_byte(&pin.device, pin.register, pin.mask, pin.encode(asserted))?;
        Ok(())
    }

    pub fn sfp_presence(&self, index: u8) -> SfpdResult<bool> {
        Ok(self.read_pin(&self.board.sfp(index)?.presence)?)
    }

    /// Reads the rx-loss pin. This clears the latches of every port on the
    /// same register; the monitor uses [`PortObserver::alarm_snapshot`].
    pub fn sfp_rx_loss(&self, index: u8) -> SfpdResult<bool> {
        Ok(self.read_pin(&self.board.sfp(index)?.rx_loss)?)
    }

    /// Reads the tx-fault pin, with the same latch caveat as
    /// [`PortController::sfp_rx_loss`].
    pub fn sfp_tx_fault(&self, index: u8) -> SfpdResult<bool> {
        Ok(self.read_pin(&self.board.sfp(index)?.tx_fault)?)
    }

    fn rate_pin(&self, index: u8) -> SfpdResult<Pin> {
        self.board.sfp(index)?.rate_select.ok_or_else(|| {
            SfpdError::InvalidRequest(format!("{} has no rate select pin", PortId::sfp(index)))
        })
    }

    pub fn sfp_rate(&self, index: u8) -> SfpdResult<SfpRate> {
        let pin = self.rate_pin(index)?;
        Ok(if self.read_pin(&pin)? { SfpRate::High } else { SfpRate::Low })
    }

    pub fn set_sfp_rate(&self, index: u8, rate: SfpRate) -> SfpdResult<()> {
        let pin = self.rate_pin(index)?;
        self.write_pin(&pin, rate == SfpRate::High)?;
        debug!(port = %PortId::sfp(index), %rate, "Set SFP rate select");
        Ok(())
    }

    pub fn sfp_tx_disable(&self, index: u8) -> SfpdResult<bool> {
        Ok(self.read_pin(&self.board.sfp(index)?.tx_disable)?)
    }

    /// Drives the tx-disable pin (read-modify-write of the expander output
    /// register, under an exclusive lock).
    pub fn set_sfp_tx_disable(&self, index: u8, disabled: bool) -> SfpdResult<()> {
        let port = self.board.sfp(index)?;
        self.write_pin(&port.tx_disable, disabled)?;
        debug!(port = %PortId::sfp(index), disabled, "Set SFP tx-disable");
        Ok(())
    }

    pub fn qsfp_presence(&self, index: u8) -> SfpdResult<bool> {
        Ok(self.read_pin(&self.board.qsfp(index)?.presence)?)
    }

    pub fn qsfp_lp_mode(&self, index: u8) -> SfpdResult<bool> {
        Ok(self.read_pin(&self.board.qsfp(index)?.lp_mode)?)
    }

    pub fn set_qsfp_lp_mode(&self, index: u8, enabled: bool) -> SfpdResult<()> {
        let port = self.board.qsfp(index)?;
        self.write_pin(&port.lp_mode, enabled)?;
        debug!(port = %PortId::qsfp(index), enabled, "Set QSFP low-power mode");
        Ok(())
    }

    /// Pulses the module reset line for `hold`.
    ///
    /// The lock is released while the line is held, so other processes can
    /// use the bus during the pulse.
    pub fn reset_qsfp(&self, index: u8, hold: Duration) -> SfpdResult<()> {
        let port = self.board.qsfp(index)?;
        self.write_pin(&port.reset, true)?;
        thread::sleep(hold);
        self.write_pin(&port.reset, false)?;
        info!(port = %PortId::qsfp(index), "Reset QSFP module");
        Ok(())
    }

    /// Enables or disables a transmitter by interface name.
    ///
    /// `xe<N>` drives the SFP tx-disable pin. `ce<N>` sets the QSFP
    /// Tx_Disable bits of all lanes, `ce<N>p<L>` of lane `L` only.
    pub fn set_port_enabled(&self, name: &str, enabled: bool) -> SfpdResult<()> {
        if let Some((port, lane)) = name.split_once('p') {
            let port: PortId = port.parse()?;
            let lane = lane
                .parse::<u8>()
                .map_err(|_| SfpdError::invalid_port(format!("bad lane in {}", name)))?;
            return match port.port_type {
                PortType::Qsfp => self.set_qsfp_tx_disable(port.index, !enabled, Some(lane)),
                PortType::Sfp => Err(SfpdError::invalid_port(format!("{} has no lanes", name))),
            };
        }
        let port: PortId = name.parse()?;
        match port.port_type {
            PortType::Sfp => self.set_sfp_tx_disable(port.index, !enabled),
            PortType::Qsfp => self.set_qsfp_tx_disable(port.index, !enabled, None),
        }
    }
}

impl<P: BusProvider> PortObserver for PortController<P> {
    fn ports(&self) -> Vec<PortId> {
        self.board.ports()
    }

    fn presence(&self, port: PortId) -> SfpdResult<bool> {
        match port.port_type {
            PortType::Sfp => self.sfp_presence(port.index),
            PortType::Qsfp => self.qsfp_presence(port.index),
        }
    }

    fn alarm_snapshot(&self, ports: &[PortId]) -> AlarmSnapshot {
        let mut snapshot = AlarmSnapshot::default();
        let mut sfp = Vec::new();
        for &port in ports.iter().filter(|p| p.port_type == PortType::Sfp) {
            match self.board.sfp(port.index) {
                Ok(s) => sfp.push((port, s.rx_loss, s.tx_fault)),
                Err(e) => {
                    snapshot.mark_failed(port);
                    snapshot.push_error(e);
                }
            }
        }

        // (expander, register, value read)
        let mut registers: Vec<(Device, u8, Option<u8>)> = Vec::new();
        for (_, rx_loss, tx_fault) in &sfp {
            for pin in [rx_loss, tx_fault] {
                if !registers.iter().any(|(d, r, _)| *d == pin.device && *r == pin.register) {
                    registers.push((pin.device, pin.register, None));
                }
            }
        }
        for (device, register, value) in &mut registers {
            let reg = *register;
            match self
                .bus
                .transaction(device, LockMode::Exclusive, |d| d.read_byte(reg))
            {
                Ok(raw) => *value = Some(raw),
                Err(e) => snapshot.push_error(e.into()),
            }
        }

        let raw = |pin: &Pin| {
            registers
                .iter()
                .find(|(d, r, _)| *d == pin.device && *r == pin.register)
                .and_then(|(_, _, value)| *value)
        };
        for (port, rx_loss, tx_fault) in sfp {
            match (raw(&rx_loss), raw(&tx_fault)) {
                (Some(rx), Some(tx)) => snapshot.insert(
                    port,
                    SfpAlarms {
                        rx_loss: rx_loss.decode(rx),
                        tx_fault: tx_fault.decode(tx),
                    },
                ),
                _ => snapshot.mark_failed(port),
            }
        }
        snapshot
    }
}
