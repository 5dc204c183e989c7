//! Board topology: muxes, transceiver pins, EEPROM routing, health probes.
//!
//! The topology is configuration data. [`TopologyConfig::default`] is the
//! UFI switch board: a PCA9546 root mux at 0x76 with the SFP PCA9548 muxes
//! (0x71..=0x74) and the QSFP PCA9546 (0x70) behind channel 0x08, and
//! PCA9535 expanders for the transceiver pins behind channels 0x01, 0x02
//! and 0x04. Port-to-pin routing is a literal table; nothing here derives a
//! pin from a port number.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use ufi_i2c_common::{Attachment, Device, HealthProbe, MuxTree, MuxTreeBuilder};

use crate::error::{SfpdError, SfpdResult};
use crate::port::PortId;

/// SFP serial ID EEPROM (page A0h).
pub const SFP_EEPROM_A0: u8 = 0x50;
/// SFP diagnostics EEPROM (page A2h).
pub const SFP_EEPROM_A2: u8 = 0x51;
/// QSFP management interface.
pub const QSFP_EEPROM: u8 = 0x50;

const ROOT_MUX: &str = "9546_root";
const QSFP_MUX: &str = "9546_qsfp";
const SFP_MUXES: [&str; 4] = ["9548_sfp1", "9548_sfp2", "9548_sfp3", "9548_sfp4"];

/// A mux in the topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MuxConfig {
    pub name: String,
    pub address: u8,
    pub channels: u8,
    /// Upstream mux name; absent for a mux on the root segment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Channel value selecting this mux on `parent`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<u8>,
}

/// One GPIO expander pin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinConfig {
    /// Mux the expander hangs off.
    pub mux: String,
    /// Channel value on `mux`.
    pub channel: u8,
    /// Expander address.
    pub address: u8,
    /// Register holding the pin (input port for status pins, output port
    /// for control pins).
    pub register: u8,
    /// Bit within `register`, 0..=7.
    pub bit: u8,
    /// Pin reads 0 when asserted.
    #[serde(default)]
    pub active_low: bool,
}

/// Mux channel in front of a transceiver's EEPROM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EepromRoute {
    pub mux: String,
    pub channel: u8,
}

/// One SFP cage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SfpPortConfig {
    pub index: u8,
    pub eeprom: EepromRoute,
    pub presence: PinConfig,
    pub rx_loss: PinConfig,
    pub tx_fault: PinConfig,
    pub tx_disable: PinConfig,
    /// Output pin selecting full (asserted) or reduced receive bandwidth.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_select: Option<PinConfig>,
}

/// One QSFP cage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QsfpPortConfig {
    pub index: u8,
    pub eeprom: EepromRoute,
    pub presence: PinConfig,
    pub lp_mode: PinConfig,
    pub reset: PinConfig,
}

/// `[topology]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyConfig {
    #[serde(default = "default_muxes")]
    pub muxes: Vec<MuxConfig>,

    #[serde(default = "default_sfp_ports")]
    pub sfp_ports: Vec<SfpPortConfig>,

    #[serde(default = "default_qsfp_ports")]
    pub qsfp_ports: Vec<QsfpPortConfig>,

    #[serde(default = "default_health_probes")]
    pub health_probes: Vec<HealthProbe>,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            muxes: default_muxes(),
            sfp_ports: default_sfp_ports(),
            qsfp_ports: default_qsfp_ports(),
            health_probes: default_health_probes(),
        }
    }
}

fn mux(name: &str, address: u8, channels: u8, parent: Option<(&str, u8)>) -> MuxConfig {
    MuxConfig {
        name: name.to_string(),
        address,
        channels,
        parent: parent.map(|(p, _)| p.to_string()),
        channel: parent.map(|(_, c)| c),
    }
}

fn default_muxes() -> Vec<MuxConfig> {
    vec![
        mux(ROOT_MUX, 0x76, 4, None),
        mux(SFP_MUXES[0], 0x71, 8, Some((ROOT_MUX, 0x08))),
        mux(SFP_MUXES[1], 0x72, 8, Some((ROOT_MUX, 0x08))),
        mux(SFP_MUXES[2], 0x73, 8, Some((ROOT_MUX, 0x08))),
        mux(SFP_MUXES[3], 0x74, 8, Some((ROOT_MUX, 0x08))),
        mux(QSFP_MUX, 0x70, 4, Some((ROOT_MUX, 0x08))),
    ]
}

/// Root channel of the TX_DIS expanders and the QSFP control expander.
const CH_CONTROL: u8 = 0x01;
/// Root channel of the TX_FLT and RATE_SEL expanders.
const CH_FAULT: u8 = 0x02;
/// Root channel of the ABS and RX_LOS expanders.
const CH_STATUS: u8 = 0x04;

/// (expander address, register, bit)
type PinAt = (u8, u8, u8);

struct SfpRow {
    port: u8,
    mux: &'static str,
    channel: u8,
    presence: PinAt,
    rx_loss: PinAt,
    tx_fault: PinAt,
    tx_disable: PinAt,
    rate_select: PinAt,
}

#[rustfmt::skip]
const SFP_TABLE: [SfpRow; 28] = [
    SfpRow { port: 0, mux: SFP_MUXES[0], channel: 0x01, presence: (0x20, 0, 7), rx_loss: (0x21, 0, 7), tx_fault: (0x26, 0, 7), tx_disable: (0x22, 2, 7), rate_select: (0x25, 2, 7) },
    SfpRow { port: 1, mux: SFP_MUXES[0], channel: 0x02, presence: (0x20, 0, 6), rx_loss: (0x21, 0, 6), tx_fault: (0x26, 0, 6), tx_disable: (0x22, 2, 6), rate_select: (0x25, 2, 6) },
    SfpRow { port: 2, mux: SFP_MUXES[0], channel: 0x04, presence: (0x20, 0, 5), rx_loss: (0x21, 0, 5), tx_fault: (0x26, 0, 5), tx_disable: (0x22, 2, 5), rate_select: (0x25, 2, 5) },
    SfpRow { port: 3, mux: SFP_MUXES[0], channel: 0x08, presence: (0x20, 0, 4), rx_loss: (0x21, 0, 4), tx_fault: (0x26, 0, 4), tx_disable: (0x22, 2, 4), rate_select: (0x25, 2, 4) },
    SfpRow { port: 4, mux: SFP_MUXES[0], channel: 0x10, presence: (0x20, 0, 3), rx_loss: (0x21, 0, 3), tx_fault: (0x26, 0, 3), tx_disable: (0x22, 2, 3), rate_select: (0x25, 2, 3) },
    SfpRow { port: 5, mux: SFP_MUXES[0], channel: 0x20, presence: (0x20, 0, 2), rx_loss: (0x21, 0, 2), tx_fault: (0x26, 0, 2), tx_disable: (0x22, 2, 2), rate_select: (0x25, 2, 2) },
    SfpRow { port: 6, mux: SFP_MUXES[0], channel: 0x40, presence: (0x20, 0, 1), rx_loss: (0x21, 0, 1), tx_fault: (0x26, 0, 1), tx_disable: (0x22, 2, 1), rate_select: (0x25, 2, 1) },
    SfpRow { port: 7, mux: SFP_MUXES[0], channel: 0x80, presence: (0x20, 0, 0), rx_loss: (0x21, 0, 0), tx_fault: (0x26, 0, 0), tx_disable: (0x22, 2, 0), rate_select: (0x25, 2, 0) },
    SfpRow { port: 8, mux: SFP_MUXES[1], channel: 0x01, presence: (0x20, 1, 7), rx_loss: (0x21, 1, 7), tx_fault: (0x26, 1, 7), tx_disable: (0x22, 3, 7), rate_select: (0x25, 3, 7) },
    SfpRow { port: 9, mux: SFP_MUXES[1], channel: 0x02, presence: (0x20, 1, 6), rx_loss: (0x21, 1, 6), tx_fault: (0x26, 1, 6), tx_disable: (0x22, 3, 6), rate_select: (0x25, 3, 6) },
    SfpRow { port: 10, mux: SFP_MUXES[1], channel: 0x04, presence: (0x20, 1, 5), rx_loss: (0x21, 1, 5), tx_fault: (0x26, 1, 5), tx_disable: (0x22, 3, 5), rate_select: (0x25, 3, 5) },
    SfpRow { port: 11, mux: SFP_MUXES[1], channel: 0x08, presence: (0x20, 1, 4), rx_loss: (0x21, 1, 4), tx_fault: (0x26, 1, 4), tx_disable: (0x22, 3, 4), rate_select: (0x25, 3, 4) },
    SfpRow { port: 12, mux: SFP_MUXES[1], channel: 0x10, presence: (0x20, 1, 3), rx_loss: (0x21, 1, 3), tx_fault: (0x26, 1, 3), tx_disable: (0x22, 3, 3), rate_select: (0x25, 3, 3) },
    SfpRow { port: 13, mux: SFP_MUXES[1], channel: 0x20, presence: (0x20, 1, 2), rx_loss: (0x21, 1, 2), tx_fault: (0x26, 1, 2), tx_disable: (0x22, 3, 2), rate_select: (0x25, 3, 2) },
    SfpRow { port: 14, mux: SFP_MUXES[1], channel: 0x40, presence: (0x20, 1, 1), rx_loss: (0x21, 1, 1), tx_fault: (0x26, 1, 1), tx_disable: (0x22, 3, 1), rate_select: (0x25, 3, 1) },
    SfpRow { port: 15, mux: SFP_MUXES[1], channel: 0x80, presence: (0x20, 1, 0), rx_loss: (0x21, 1, 0), tx_fault: (0x26, 1, 0), tx_disable: (0x22, 3, 0), rate_select: (0x25, 3, 0) },
    // Port 16 is bank 0 bit 7 of its expanders, like 17..=23. A `port > 16`
    // range check falls through to bank 1 bit 7, which is port 24's pin.
    SfpRow { port: 16, mux: SFP_MUXES[2], channel: 0x01, presence: (0x22, 0, 7), rx_loss: (0x24, 0, 7), tx_fault: (0x27, 0, 7), tx_disable: (0x24, 2, 7), rate_select: (0x23, 2, 7) },
    SfpRow { port: 17, mux: SFP_MUXES[2], channel: 0x02, presence: (0x22, 0, 6), rx_loss: (0x24, 0, 6), tx_fault: (0x27, 0, 6), tx_disable: (0x24, 2, 6), rate_select: (0x23, 2, 6) },
    SfpRow { port: 18, mux: SFP_MUXES[2], channel: 0x04, presence: (0x22, 0, 5), rx_loss: (0x24, 0, 5), tx_fault: (0x27, 0, 5), tx_disable: (0x24, 2, 5), rate_select: (0x23, 2, 5) },
    SfpRow { port: 19, mux: SFP_MUXES[2], channel: 0x08, presence: (0x22, 0, 4), rx_loss: (0x24, 0, 4), tx_fault: (0x27, 0, 4), tx_disable: (0x24, 2, 4), rate_select: (0x23, 2, 4) },
    SfpRow { port: 20, mux: SFP_MUXES[2], channel: 0x10, presence: (0x22, 0, 3), rx_loss: (0x24, 0, 3), tx_fault: (0x27, 0, 3), tx_disable: (0x24, 2, 3), rate_select: (0x23, 2, 3) },
    SfpRow { port: 21, mux: SFP_MUXES[2], channel: 0x20, presence: (0x22, 0, 2), rx_loss: (0x24, 0, 2), tx_fault: (0x27, 0, 2), tx_disable: (0x24, 2, 2), rate_select: (0x23, 2, 2) },
    SfpRow { port: 22, mux: SFP_MUXES[2], channel: 0x40, presence: (0x22, 0, 1), rx_loss: (0x24, 0, 1), tx_fault: (0x27, 0, 1), tx_disable: (0x24, 2, 1), rate_select: (0x23, 2, 1) },
    SfpRow { port: 23, mux: SFP_MUXES[2], channel: 0x80, presence: (0x22, 0, 0), rx_loss: (0x24, 0, 0), tx_fault: (0x27, 0, 0), tx_disable: (0x24, 2, 0), rate_select: (0x23, 2, 0) },
    SfpRow { port: 24, mux: SFP_MUXES[3], channel: 0x01, presence: (0x22, 1, 7), rx_loss: (0x24, 1, 7), tx_fault: (0x27, 1, 7), tx_disable: (0x24, 3, 7), rate_select: (0x23, 3, 7) },
    SfpRow { port: 25, mux: SFP_MUXES[3], channel: 0x02, presence: (0x22, 1, 6), rx_loss: (0x24, 1, 6), tx_fault: (0x27, 1, 6), tx_disable: (0x24, 3, 6), rate_select: (0x23, 3, 6) },
    SfpRow { port: 26, mux: SFP_MUXES[3], channel: 0x04, presence: (0x22, 1, 5), rx_loss: (0x24, 1, 5), tx_fault: (0x27, 1, 5), tx_disable: (0x24, 3, 5), rate_select: (0x23, 3, 5) },
    SfpRow { port: 27, mux: SFP_MUXES[3], channel: 0x08, presence: (0x22, 1, 4), rx_loss: (0x24, 1, 4), tx_fault: (0x27, 1, 4), tx_disable: (0x24, 3, 4), rate_select: (0x23, 3, 4) },
];

struct QsfpRow {
    port: u8,
    channel: u8,
    presence: PinAt,
    lp_mode: PinAt,
    reset: PinAt,
}

#[rustfmt::skip]
const QSFP_TABLE: [QsfpRow; 2] = [
    QsfpRow { port: 0, channel: 0x08, presence: (0x21, 0, 5), lp_mode: (0x21, 3, 1), reset: (0x21, 3, 5) },
    QsfpRow { port: 1, channel: 0x04, presence: (0x21, 0, 4), lp_mode: (0x21, 3, 0), reset: (0x21, 3, 4) },
];

fn pin(channel: u8, (address, register, bit): PinAt, active_low: bool) -> PinConfig {
    PinConfig {
        mux: ROOT_MUX.to_string(),
        channel,
        address,
        register,
        bit,
        active_low,
    }
}

fn default_sfp_ports() -> Vec<SfpPortConfig> {
    SFP_TABLE
        .iter()
        .map(|row| SfpPortConfig {
            index: row.port,
            eeprom: EepromRoute {
                mux: row.mux.to_string(),
                channel: row.channel,
            },
            presence: pin(CH_STATUS, row.presence, true),
            rx_loss: pin(CH_STATUS, row.rx_loss, false),
            tx_fault: pin(CH_FAULT, row.tx_fault, false),
            tx_disable: pin(CH_CONTROL, row.tx_disable, false),
            rate_select: Some(pin(CH_FAULT, row.rate_select, false)),
        })
        .collect()
}

fn default_qsfp_ports() -> Vec<QsfpPortConfig> {
    QSFP_TABLE
        .iter()
        .map(|row| QsfpPortConfig {
            index: row.port,
            eeprom: EepromRoute {
                mux: QSFP_MUX.to_string(),
                channel: row.channel,
            },
            presence: pin(CH_CONTROL, row.presence, true),
            lp_mode: pin(CH_CONTROL, row.lp_mode, false),
            reset: pin(CH_CONTROL, row.reset, true),
        })
        .collect()
}

fn default_health_probes() -> Vec<HealthProbe> {
    vec![
        HealthProbe {
            name: "cpu_eeprom".to_string(),
            address: 0x57,
        },
        HealthProbe {
            name: "cpu_tmp75".to_string(),
            address: 0x4f,
        },
    ]
}

/// A resolved expander pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pin {
    pub device: Device,
    pub register: u8,
    pub mask: u8,
    pub active_low: bool,
}

impl Pin {
    /// Whether the pin is asserted in register value `raw`.
    pub fn decode(&self, raw: u8) -> bool {
        (raw & self.mask != 0) != self.active_low
    }

    /// Register bits (under `mask`) that put the pin in state `asserted`.
    pub fn encode(&self, asserted: bool) -> u8 {
        if asserted != self.active_low { self.mask } else { 0 }
    }
}

/// A resolved SFP cage.
#[derive(Debug, Clone, Copy)]
pub struct SfpPort {
    pub index: u8,
    pub eeprom_a0: Device,
    pub eeprom_a2: Device,
    pub presence: Pin,
    pub rx_loss: Pin,
    pub tx_fault: Pin,
    pub tx_disable: Pin,
    pub rate_select: Option<Pin>,
}

/// A resolved QSFP cage.
#[derive(Debug, Clone, Copy)]
pub struct QsfpPort {
    pub index: u8,
    pub eeprom: Device,
    pub presence: Pin,
    pub lp_mode: Pin,
    pub reset: Pin,
}

/// The board resolved against its mux tree. Built once at startup.
#[derive(Debug, Clone)]
pub struct Board {
    tree: MuxTree,
    sfp: BTreeMap<u8, SfpPort>,
    qsfp: BTreeMap<u8, QsfpPort>,
    probes: Vec<HealthProbe>,
}

impl Board {
    /// Resolves `topology` on bus `bus`.
    pub fn from_config(bus: u8, topology: &TopologyConfig) -> SfpdResult<Self> {
        let mut builder = MuxTreeBuilder::new(bus);
        for m in &topology.muxes {
            let upstream = match (&m.parent, m.channel) {
                (None, None) => None,
                (Some(parent), Some(channel)) => {
                    // muxes are added in file order, so a parent must come first
                    let mux = builder.find(parent).ok_or_else(|| {
                        SfpdError::config(format!(
                            "mux {} refers to parent {} which is not defined before it",
                            m.name, parent
                        ))
                    })?;
                    Some(Attachment { mux, select: channel })
                }
                _ => {
                    return Err(SfpdError::config(format!(
                        "mux {} needs both parent and channel, or neither",
                        m.name
                    )));
                }
            };
            builder.add_mux(m.name.clone(), m.address, m.channels, upstream)?;
        }
        let tree = builder.build();

        let mut sfp = BTreeMap::new();
        for p in &topology.sfp_ports {
            let route = attachment(&tree, &p.eeprom.mux, p.eeprom.channel)?;
            let port = SfpPort {
                index: p.index,
                eeprom_a0: tree.device(SFP_EEPROM_A0, Some(route))?,
                eeprom_a2: tree.device(SFP_EEPROM_A2, Some(route))?,
                presence: resolve_pin(&tree, &p.presence)?,
                rx_loss: resolve_pin(&tree, &p.rx_loss)?,
                tx_fault: resolve_pin(&tree, &p.tx_fault)?,
                tx_disable: resolve_pin(&tree, &p.tx_disable)?,
                rate_select: p
                    .rate_select
                    .as_ref()
                    .map(|pin| resolve_pin(&tree, pin))
                    .transpose()?,
            };
            if sfp.insert(p.index, port).is_some() {
                return Err(SfpdError::config(format!("duplicate SFP port {}", p.index)));
            }
        }

        let mut qsfp = BTreeMap::new();
        for p in &topology.qsfp_ports {
            let route = attachment(&tree, &p.eeprom.mux, p.eeprom.channel)?;
            let port = QsfpPort {
                index: p.index,
                eeprom: tree.device(QSFP_EEPROM, Some(route))?,
                presence: resolve_pin(&tree, &p.presence)?,
                lp_mode: resolve_pin(&tree, &p.lp_mode)?,
                reset: resolve_pin(&tree, &p.reset)?,
            };
            if qsfp.insert(p.index, port).is_some() {
                return Err(SfpdError::config(format!("duplicate QSFP port {}", p.index)));
            }
        }

        Ok(Self {
            tree,
            sfp,
            qsfp,
            probes: topology.health_probes.clone(),
        })
    }

    pub fn tree(&self) -> &MuxTree {
        &self.tree
    }

    pub fn sfp(&self, index: u8) -> SfpdResult<&SfpPort> {
        self.sfp
            .get(&index)
            .ok_or_else(|| SfpdError::invalid_port(format!("no SFP port {}", index)))
    }

    pub fn qsfp(&self, index: u8) -> SfpdResult<&QsfpPort> {
        self.qsfp
            .get(&index)
            .ok_or_else(|| SfpdError::invalid_port(format!("no QSFP port {}", index)))
    }

    /// Every port, SFP first, each in index order.
    pub fn ports(&self) -> Vec<PortId> {
        self.sfp
            .keys()
            .map(|&i| PortId::sfp(i))
            .chain(self.qsfp.keys().map(|&i| PortId::qsfp(i)))
            .collect()
    }

    pub fn health_probes(&self) -> &[HealthProbe] {
        &self.probes
    }
}

fn attachment(tree: &MuxTree, mux: &str, channel: u8) -> SfpdResult<Attachment> {
    let id = tree
        .find(mux)
        .ok_or_else(|| SfpdError::config(format!("unknown mux {}", mux)))?;
    Ok(Attachment { mux: id, select: channel })
}

fn resolve_pin(tree: &MuxTree, config: &PinConfig) -> SfpdResult<Pin> {
    if config.bit > 7 {
        return Err(SfpdError::config(format!(
            "pin bit {} on expander {:#04x} is out of range",
            config.bit, config.address
        )));
    }
    let route = attachment(tree, &config.mux, config.channel)?;
    Ok(Pin {
        device: tree.device(config.address, Some(route))?,
        register: config.register,
        mask: 1 << config.bit,
        active_low: config.active_low,
    })
}
