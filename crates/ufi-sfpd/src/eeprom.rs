//! Transceiver EEPROM access.
//!
//! SFP modules expose two 256-byte pages at 0x50 (A0h, serial ID) and 0x51
//! (A2h, diagnostics). QSFP modules expose one address; the lower 128 bytes
//! are fixed and byte 127 selects which 128-byte upper page is mapped at
//! 128..=255.
//!
//! Reads set the EEPROM's internal pointer with a send-byte and then walk
//! it with receive-byte, all inside one exclusive bus transaction.

use tracing::{error, warn};
use ufi_i2c_common::{BusHealth, BusProvider, Device, I2cError, LockMode, check_bus_health};

use crate::error::{SfpdError, SfpdResult};
use crate::port::{PortId, PortType};
use crate::transceiver::PortController;

/// Size of one SFP page and of QSFP page 0 (lower + upper 00h).
pub const EEPROM_PAGE_SIZE: usize = 256;
/// Size of a QSFP upper page.
pub const QSFP_UPPER_PAGE_SIZE: usize = 128;
/// Highest QSFP upper page read.
pub const QSFP_MAX_PAGE: u8 = 3;

/// SFF-8472 diagnostic monitoring type byte.
const SFP_DMT_BYTE: usize = 92;
const SFP_DMT_IMPLEMENTED: u8 = 0x40;
const SFP_DMT_ADDR_CHANGE: u8 = 0x04;

/// SFF-8636 page select byte.
const QSFP_PAGE_SELECT: u8 = 127;
/// SFF-8636 Tx_Disable control byte, one bit per lane.
const QSFP_TX_DISABLE: u8 = 86;
const QSFP_LANES: u8 = 4;

/// SFP EEPROM page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SfpPage {
    A0,
    A2,
}

impl SfpPage {
    /// Page id as reported to consumers (0xa0 / 0xa2).
    pub fn id(&self) -> u8 {
        match self {
            SfpPage::A0 => 0xa0,
            SfpPage::A2 => 0xa2,
        }
    }
}

impl<P: BusProvider> PortController<P> {
    fn sfp_page_device(&self, index: u8, page: SfpPage) -> SfpdResult<Device> {
        let port = self.board().sfp(index)?;
        Ok(match page {
            SfpPage::A0 => port.eeprom_a0,
            SfpPage::A2 => port.eeprom_a2,
        })
    }

    /// Sequential read of `len` bytes starting at `offset`.
    fn read_sequential(&self, device: &Device, offset: u8, len: usize) -> Result<Vec<u8>, I2cError> {
        self.bus().transaction(device, LockMode::Exclusive, |d| {
            d.send_byte(offset)?;
            (0..len).map(|_| d.receive_byte()).collect()
        })
    }

    /// Logs whether a failed transceiver read looks like a bus-wide fault.
    fn diagnose(&self, port: PortId, err: &I2cError) {
        if err.is_device_absent() || matches!(err, I2cError::LockTimeout { .. }) {
            return;
        }
        match check_bus_health(self.bus(), self.board().health_probes()) {
            Ok(BusHealth::Healthy) => warn!(
                port = %port,
                error = %err,
                "EEPROM read failed but other bus devices answer; transceiver may be faulty"
            ),
            Ok(BusHealth::Degraded(failed)) => error!(
                port = %port,
                error = %err,
                ?failed,
                "EEPROM read failed and the bus health check failed"
            ),
            Err(e) => warn!(port = %port, error = %e, "Bus health check could not run"),
        }
    }

    /// Reads one SFP page. An absent module is [`I2cError::DeviceAbsent`].
    pub fn read_sfp_page(&self, index: u8, page: SfpPage) -> SfpdResult<Vec<u8>> {
        let device = self.sfp_page_device(index, page)?;
        self.read_sequential(&device, 0, EEPROM_PAGE_SIZE).map_err(|e| {
            self.diagnose(PortId::sfp(index), &e);
            SfpdError::from(e)
        })
    }

    /// Reads one SFP page, substituting 0xFF bytes for an absent module.
    pub fn dump_sfp_page(&self, index: u8, page: SfpPage) -> SfpdResult<Vec<u8>> {
        match self.read_sfp_page(index, page) {
            Err(e) if e.is_device_absent() => Ok(vec![0xff; EEPROM_PAGE_SIZE]),
            other => other,
        }
    }

    /// Reads QSFP page 0 (256 bytes) or upper page 1..=3 (128 bytes).
    pub fn read_qsfp_page(&self, index: u8, page: u8) -> SfpdResult<Vec<u8>> {
        if page > QSFP_MAX_PAGE {
            return Err(SfpdError::InvalidRequest(format!(
                "QSFP page {} is not supported",
                page
            )));
        }
        let device = self.board().qsfp(index)?.eeprom;
        let result: Result<Vec<u8>, I2cError> =
            self.bus().transaction(&device, LockMode::Exclusive, |d| {
                if page == 0 {
                    // another reader may have left an upper page mapped
                    d.write_byte(QSFP_PAGE_SELECT, 0)?;
                    d.send_byte(0)?;
                    return (0..EEPROM_PAGE_SIZE).map(|_| d.receive_byte()).collect();
                }
                d.write_byte(QSFP_PAGE_SELECT, page)?;
                let data = d.send_byte(0x80).and_then(|()| {
                    (0..QSFP_UPPER_PAGE_SIZE)
                        .map(|_| d.receive_byte())
                        .collect::<Result<Vec<u8>, I2cError>>()
                });
                // page 0 is restored whether or not the read completed
                let restore = d.write_byte(QSFP_PAGE_SELECT, 0);
                match (data, restore) {
                    (Ok(data), Ok(())) => Ok(data),
                    (Err(e), Ok(())) | (Ok(_), Err(e)) => Err(e),
                    (Err(e), Err(restore)) => {
                        warn!(port = %PortId::qsfp(index), error = %restore, "Failed to restore QSFP page 0");
                        Err(e)
                    }
                }
            });
        result.map_err(|e| {
            self.diagnose(PortId::qsfp(index), &e);
            SfpdError::from(e)
        })
    }

    /// Reads a QSFP page, substituting 0xFF bytes for an absent module.
    pub fn dump_qsfp_page(&self, index: u8, page: u8) -> SfpdResult<Vec<u8>> {
        match self.read_qsfp_page(index, page) {
            Err(e) if e.is_device_absent() => {
                let size = if page == 0 { EEPROM_PAGE_SIZE } else { QSFP_UPPER_PAGE_SIZE };
                Ok(vec![0xff; size])
            }
            other => other,
        }
    }

    /// Pages available on an SFP module: A0 always, A2 when diagnostics are
    /// implemented without the address-change sequence.
    pub fn sfp_pages(&self, index: u8) -> SfpdResult<Vec<u8>> {
        let a0 = self.read_sfp_page(index, SfpPage::A0).map_err(|e| {
            if e.is_device_absent() {
                SfpdError::ModuleNotPresent(format!("{} page A0", PortId::sfp(index)))
            } else {
                e
            }
        })?;
        let dmt = a0[SFP_DMT_BYTE] & (SFP_DMT_IMPLEMENTED | SFP_DMT_ADDR_CHANGE);
        if dmt == SFP_DMT_IMPLEMENTED {
            Ok(vec![SfpPage::A0.id(), SfpPage::A2.id()])
        } else {
            Ok(vec![SfpPage::A0.id()])
        }
    }

    /// Pages available on a QSFP module.
    pub fn qsfp_pages(&self, index: u8) -> SfpdResult<Vec<u8>> {
        self.board().qsfp(index)?;
        Ok((0..=QSFP_MAX_PAGE).collect())
    }

    /// Size of a port's linear EEPROM space.
    pub fn eeprom_size(port_type: PortType) -> usize {
        match port_type {
            PortType::Sfp => 2 * EEPROM_PAGE_SIZE,
            PortType::Qsfp => EEPROM_PAGE_SIZE + usize::from(QSFP_MAX_PAGE) * QSFP_UPPER_PAGE_SIZE,
        }
    }

    /// Reads `len` bytes at `offset` of the port's linear EEPROM space.
    ///
    /// SFP: A0 at 0..256, A2 at 256..512. QSFP: page 0 at 0..256, upper
    /// page N at 256 + 128 * (N - 1). Only the pages overlapping the range
    /// are read. An absent module is [`SfpdError::ModuleNotPresent`].
    pub fn read_range(&self, port: PortId, offset: usize, len: usize) -> SfpdResult<Vec<u8>> {
        let size = Self::eeprom_size(port.port_type);
        let end = offset
            .checked_add(len)
            .filter(|&end| end <= size)
            .ok_or_else(|| {
                SfpdError::InvalidRequest(format!(
                    "{} EEPROM range {}+{} exceeds {} bytes",
                    port, offset, len, size
                ))
            })?;
        if len == 0 {
            return Ok(Vec::new());
        }

        let not_present = |what: String| {
            move |e: SfpdError| {
                if e.is_device_absent() {
                    SfpdError::ModuleNotPresent(what)
                } else {
                    e
                }
            }
        };

        // (linear start, page data) for every page overlapping the range
        let mut pieces: Vec<(usize, Vec<u8>)> = Vec::new();
        match port.port_type {
            PortType::Sfp => {
                for (start, page) in [(0, SfpPage::A0), (EEPROM_PAGE_SIZE, SfpPage::A2)] {
                    if start < end && offset < start + EEPROM_PAGE_SIZE {
                        let data = self
                            .read_sfp_page(port.index, page)
                            .map_err(not_present(format!("{} page {:?}", port, page)))?;
                        pieces.push((start, data));
                    }
                }
            }
            PortType::Qsfp => {
                if offset < EEPROM_PAGE_SIZE {
                    let data = self
                        .read_qsfp_page(port.index, 0)
                        .map_err(not_present(format!("{} page 0", port)))?;
                    pieces.push((0, data));
                }
                for page in 1..=QSFP_MAX_PAGE {
                    let start = EEPROM_PAGE_SIZE + usize::from(page - 1) * QSFP_UPPER_PAGE_SIZE;
                    if start < end && offset < start + QSFP_UPPER_PAGE_SIZE {
                        let data = self
                            .read_qsfp_page(port.index, page)
                            .map_err(not_present(format!("{} page {}", port, page)))?;
                        pieces.push((start, data));
                    }
                }
            }
        }

        let first = pieces.first().map_or(0, |(start, _)| *start);
        let linear: Vec<u8> = pieces.into_iter().flat_map(|(_, data)| data).collect();
        Ok(linear[offset - first..end - first].to_vec())
    }

    /// Sets the QSFP Tx_Disable bits, for one lane or all four.
    pub fn set_qsfp_tx_disable(&self, index: u8, disabled: bool, lane: Option<u8>) -> SfpdResult<()> {
        let mask = match lane {
            None => (1 << QSFP_LANES) - 1,
            Some(l) if l < QSFP_LANES => 1 << l,
            Some(l) => {
                return Err(SfpdError::InvalidRequest(format!("QSFP lane {} out of range", l)));
            }
        };
        let device = self.board().qsfp(index)?.eeprom;
        let bits = if disabled { mask } else { 0 };
        self.bus()
            .modify_byte(&device, QSFP_TX_DISABLE, mask, bits)
            .map_err(|e| {
                if e.is_device_absent() {
                    SfpdError::ModuleNotPresent(PortId::qsfp(index).to_string())
                } else {
                    SfpdError::from(e)
                }
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::{Board, TopologyConfig};
    use pretty_assertions::assert_eq;
    use ufi_i2c_common::{BusOp, LockBroker, SharedBus, SimBus, SimFault};

    struct Fixture {
        _dir: tempfile::TempDir,
        sim: SimBus,
        ctl: PortController<SimBus>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let sim = SimBus::new(0);
        sim.add_mux(0x76, None);
        sim.add_mux(0x71, Some((0x76, 0x08)));
        sim.add_mux(0x70, Some((0x76, 0x08)));
        sim.add_device(0x57, None);
        sim.add_device(0x4f, None);
        let board = Board::from_config(0, &TopologyConfig::default()).unwrap();
        let bus = SharedBus::new(
            sim.clone(),
            board.tree().clone(),
            LockBroker::new(dir.path().join("i2c.lock")),
        );
        Fixture {
            _dir: dir,
            sim,
            ctl: PortController::new(bus, board),
        }
    }

    fn pattern(seed: u8, len: usize) -> Vec<u8> {
        (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
    }

    #[test]
    fn test_dump_absent_sfp_is_all_ff() {
        let f = fixture();
        // SFP port 2 sits behind channel 0x04 of the first SFP mux
        let dump = f.ctl.dump_sfp_page(2, SfpPage::A0).unwrap();
        assert_eq!(dump, vec![0xff; 256]);
        assert!(f.sim.all_deselected());
    }

    #[test]
    fn test_read_absent_sfp_is_device_absent() {
        let f = fixture();
        assert!(f.ctl.read_sfp_page(2, SfpPage::A0).unwrap_err().is_device_absent());
    }

    #[test]
    fn test_read_sfp_page() {
        let f = fixture();
        f.sim.set_memory(0x50, Some((0x71, 0x04)), &pattern(0, 256));
        f.sim.set_memory(0x51, Some((0x71, 0x04)), &pattern(0x80, 256));

        assert_eq!(f.ctl.read_sfp_page(2, SfpPage::A0).unwrap(), pattern(0, 256));
        assert_eq!(f.ctl.read_sfp_page(2, SfpPage::A2).unwrap(), pattern(0x80, 256));
    }

    #[test]
    fn test_sfp_pages_follow_dmt_byte() {
        let f = fixture();
        let mut a0 = vec![0u8; 256];
        a0[92] = 0x68;
        f.sim.set_memory(0x50, Some((0x71, 0x01)), &a0);
        assert_eq!(f.ctl.sfp_pages(0).unwrap(), vec![0xa0, 0xa2]);

        a0[92] = 0x44;
        f.sim.set_memory(0x50, Some((0x71, 0x01)), &a0);
        assert_eq!(f.ctl.sfp_pages(0).unwrap(), vec![0xa0]);

        assert!(matches!(f.ctl.sfp_pages(1), Err(SfpdError::ModuleNotPresent(_))));
    }

    #[test]
    fn test_sfp_read_range_spans_pages() {
        let f = fixture();
        f.sim.set_memory(0x50, Some((0x71, 0x01)), &pattern(0, 256));
        f.sim.set_memory(0x51, Some((0x71, 0x01)), &pattern(0x10, 256));

        let data = f.ctl.read_range(PortId::sfp(0), 250, 10).unwrap();
        assert_eq!(data, vec![250, 251, 252, 253, 254, 255, 0x10, 0x11, 0x12, 0x13]);
    }

    #[test]
    fn test_sfp_read_range_reads_only_needed_page() {
        let f = fixture();
        f.sim.set_memory(0x51, Some((0x71, 0x01)), &pattern(0x10, 256));

        // A0 is absent; a range inside A2 must not touch it
        let data = f.ctl.read_range(PortId::sfp(0), 256, 4).unwrap();
        assert_eq!(data, vec![0x10, 0x11, 0x12, 0x13]);
        assert!(matches!(
            f.ctl.read_range(PortId::sfp(0), 0, 4),
            Err(SfpdError::ModuleNotPresent(_))
        ));
    }

    #[test]
    fn test_read_range_rejects_overrun() {
        let f = fixture();
        assert!(matches!(
            f.ctl.read_range(PortId::sfp(0), 500, 20),
            Err(SfpdError::InvalidRequest(_))
        ));
        assert!(f.ctl.read_range(PortId::qsfp(0), 0, 0).unwrap().is_empty());
    }

    #[test]
    fn test_qsfp_upper_pages() {
        let f = fixture();
        let mut memory = pattern(0, 256);
        memory.extend(vec![0x11; 128]);
        memory.extend(vec![0x22; 128]);
        memory.extend(vec![0x33; 128]);
        f.sim.set_memory(0x50, Some((0x70, 0x08)), &memory);

        assert_eq!(f.ctl.read_qsfp_page(0, 0).unwrap(), pattern(0, 256));
        assert_eq!(f.ctl.read_qsfp_page(0, 2).unwrap(), vec![0x22; 128]);
        assert!(matches!(f.ctl.read_qsfp_page(0, 4), Err(SfpdError::InvalidRequest(_))));

        let data = f.ctl.read_range(PortId::qsfp(0), 380, 8).unwrap();
        assert_eq!(data, vec![0x11, 0x11, 0x11, 0x11, 0x22, 0x22, 0x22, 0x22]);
        assert_eq!(f.ctl.qsfp_pages(0).unwrap(), vec![0, 1, 2, 3]);
    }

    fn page_selects(sim: &SimBus) -> Vec<u8> {
        sim.ops()
            .into_iter()
            .filter_map(|op| match op {
                BusOp::WriteByte { addr: 0x50, reg: 127, value } => Some(value),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_qsfp_page0_read_resets_page_select() {
        let f = fixture();
        let mut memory = pattern(0, 256);
        memory.extend(vec![0x11; 128]);
        memory.extend(vec![0x22; 128]);
        f.sim.set_memory(0x50, Some((0x70, 0x08)), &memory);

        // another bus user maps page 2 and stops without restoring
        let device = f.ctl.board().qsfp(0).unwrap().eeprom;
        let left: Result<(), I2cError> = f.ctl.bus().transaction(&device, LockMode::Exclusive, |d| {
            d.write_byte(127, 2)?;
            Err(I2cError::invalid_topology("interrupted"))
        });
        assert!(left.is_err());

        let page0 = f.ctl.read_qsfp_page(0, 0).unwrap();
        assert_eq!(&page0[128..132], &[128, 129, 130, 131]);
        assert_eq!(page0, pattern(0, 256));
    }

    #[test]
    fn test_failed_upper_page_read_restores_page0() {
        let f = fixture();
        let mut memory = pattern(0, 256);
        memory.extend(vec![0x11; 128]);
        memory.extend(vec![0x22; 128]);
        f.sim.set_memory(0x50, Some((0x70, 0x08)), &memory);

        // page select and pointer write succeed, the 40th byte fails
        f.sim.fail_after(0x50, 41, SimFault::BusError);
        f.sim.clear_ops();
        let err = f.ctl.read_qsfp_page(0, 2).unwrap_err();
        assert!(matches!(err, SfpdError::I2c(I2cError::TransportIo { .. })));
        assert_eq!(page_selects(&f.sim), vec![2, 0]);
        assert!(f.sim.all_deselected());

        // the module is back on page 0 for readers that trust it
        let upper: Vec<u8> = f
            .ctl
            .bus()
            .transaction(&f.ctl.board().qsfp(0).unwrap().eeprom, LockMode::Exclusive, |d| {
                d.send_byte(0x80)?;
                (0..4).map(|_| d.receive_byte()).collect::<Result<Vec<u8>, I2cError>>()
            })
            .unwrap();
        assert_eq!(upper, vec![128, 129, 130, 131]);
        assert_eq!(f.ctl.read_qsfp_page(0, 2).unwrap(), vec![0x22; 128]);
    }

    #[test]
    fn test_dump_absent_qsfp_upper_page() {
        let f = fixture();
        assert_eq!(f.ctl.dump_qsfp_page(1, 3).unwrap(), vec![0xff; 128]);
    }

    #[test]
    fn test_bus_fault_is_not_masked_by_dump() {
        let f = fixture();
        f.sim.add_device(0x50, Some((0x71, 0x01)));
        f.sim.set_fault(0x50, Some(SimFault::BusError));
        let err = f.ctl.dump_sfp_page(0, SfpPage::A0).unwrap_err();
        assert!(matches!(err, SfpdError::I2c(I2cError::TransportIo { .. })));
        assert!(f.sim.all_deselected());
    }

    #[test]
    fn test_qsfp_tx_disable_lane() {
        let f = fixture();
        f.sim.add_device(0x50, Some((0x70, 0x04)));

        f.ctl.set_qsfp_tx_disable(1, true, Some(2)).unwrap();
        assert_eq!(f.sim.register(0x50, Some((0x70, 0x04)), 86), Some(0x04));
        f.ctl.set_qsfp_tx_disable(1, true, None).unwrap();
        assert_eq!(f.sim.register(0x50, Some((0x70, 0x04)), 86), Some(0x0f));
        f.ctl.set_qsfp_tx_disable(1, false, Some(0)).unwrap();
        assert_eq!(f.sim.register(0x50, Some((0x70, 0x04)), 86), Some(0x0e));

        assert!(matches!(
            f.ctl.set_qsfp_tx_disable(0, true, None),
            Err(SfpdError::ModuleNotPresent(_))
        ));
    }
}
