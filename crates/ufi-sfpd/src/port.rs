//! Port identity and the last-observed state of every port.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SfpdError;

/// Transceiver cage type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PortType {
    Sfp,
    Qsfp,
}

impl PortType {
    /// Type string handed to the supervisor.
    pub fn as_str(&self) -> &'static str {
        match self {
            PortType::Sfp => "SFP",
            PortType::Qsfp => "QSFP",
        }
    }

    /// Interface name prefix: `xe` for SFP, `ce` for QSFP.
    pub fn prefix(&self) -> &'static str {
        match self {
            PortType::Sfp => "xe",
            PortType::Qsfp => "ce",
        }
    }
}

impl fmt::Display for PortType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A port: (type, index).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortId {
    pub port_type: PortType,
    pub index: u8,
}

impl PortId {
    pub fn sfp(index: u8) -> Self {
        Self {
            port_type: PortType::Sfp,
            index,
        }
    }

    pub fn qsfp(index: u8) -> Self {
        Self {
            port_type: PortType::Qsfp,
            index,
        }
    }

    /// Interface name, e.g. `xe3` or `ce1`.
    pub fn name(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.port_type.prefix(), self.index)
    }
}

impl FromStr for PortId {
    type Err = SfpdError;

    /// Parses `xe<N>` or `ce<N>`. A breakout suffix (`ce0p2`) is not a port.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (port_type, digits) = if let Some(rest) = s.strip_prefix("xe") {
            (PortType::Sfp, rest)
        } else if let Some(rest) = s.strip_prefix("ce") {
            (PortType::Qsfp, rest)
        } else {
            return Err(SfpdError::invalid_port(format!("unknown port name {}", s)));
        };
        let index = digits
            .parse::<u8>()
            .map_err(|_| SfpdError::invalid_port(format!("bad port number in {}", s)))?;
        Ok(Self { port_type, index })
    }
}

/// Last-observed state of one port.
///
/// `rx_loss` and `tx_fault` are `None` for QSFP ports and until the first
/// successful read after boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PortState {
    pub present: bool,
    pub rx_loss: Option<bool>,
    pub tx_fault: Option<bool>,
}

impl PortState {
    pub fn absent() -> Self {
        Self::default()
    }
}

/// In-memory view of every configured port.
///
/// Owned by the event loop; nothing here touches hardware.
#[derive(Debug, Clone, Default)]
pub struct PortRegistry {
    ports: BTreeMap<PortId, PortState>,
}

impl PortRegistry {
    /// Creates a registry with every port absent.
    pub fn new(ports: impl IntoIterator<Item = PortId>) -> Self {
        Self {
            ports: ports
                .into_iter()
                .map(|p| (p, PortState::absent()))
                .collect(),
        }
    }

    /// Current view, ordered SFP before QSFP, then by index.
    pub fn snapshot(&self) -> BTreeMap<PortId, PortState> {
        self.ports.clone()
    }

    pub fn get(&self, port: PortId) -> Option<PortState> {
        self.ports.get(&port).copied()
    }

    /// Configured ports in registry order.
    pub fn ports(&self) -> impl Iterator<Item = PortId> + '_ {
        self.ports.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    /// Stores `state` as the baseline without reporting a change.
    pub fn seed(&mut self, port: PortId, state: PortState) {
        self.ports.insert(port, state);
    }

    /// Overwrites the stored state and returns whether presence changed.
    pub fn reconcile(&mut self, port: PortId, state: PortState) -> bool {
        match self.ports.insert(port, state) {
            Some(previous) => previous.present != state.present,
            None => state.present,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_names() {
        assert_eq!(PortId::sfp(3).name(), "xe3");
        assert_eq!(PortId::qsfp(1).to_string(), "ce1");
        assert_eq!(PortType::Qsfp.as_str(), "QSFP");
        for port in [PortId::sfp(27), PortId::qsfp(0)] {
            assert_eq!(port.name(), port.to_string());
        }
    }

    #[test]
    fn test_parse_port_name() {
        assert_eq!("xe27".parse::<PortId>().unwrap(), PortId::sfp(27));
        assert_eq!("ce0".parse::<PortId>().unwrap(), PortId::qsfp(0));
        assert!("ge1".parse::<PortId>().is_err());
        assert!("ce0p1".parse::<PortId>().is_err());
    }

    #[test]
    fn test_new_registry_is_all_absent() {
        let registry = PortRegistry::new([PortId::sfp(0), PortId::qsfp(0)]);
        assert_eq!(registry.len(), 2);
        assert!(registry.snapshot().values().all(|s| !s.present));
    }

    #[test]
    fn test_reconcile_reports_presence_edges_only() {
        let mut registry = PortRegistry::new([PortId::sfp(3)]);
        let present = PortState {
            present: true,
            ..PortState::default()
        };

        assert!(registry.reconcile(PortId::sfp(3), present));
        assert!(!registry.reconcile(PortId::sfp(3), present));
        assert!(!registry.reconcile(PortId::sfp(3), present));
        assert_eq!(registry.get(PortId::sfp(3)), Some(present));
    }

    #[test]
    fn test_reconcile_ignores_alarm_only_changes() {
        let mut registry = PortRegistry::new([PortId::sfp(0)]);
        let alarmed = PortState {
            present: false,
            rx_loss: Some(true),
            tx_fault: Some(true),
        };

        assert!(!registry.reconcile(PortId::sfp(0), alarmed));
        assert_eq!(registry.get(PortId::sfp(0)), Some(alarmed));
    }

    #[test]
    fn test_seed_is_silent_baseline() {
        let mut registry = PortRegistry::new([PortId::qsfp(1)]);
        let present = PortState {
            present: true,
            ..PortState::default()
        };
        registry.seed(PortId::qsfp(1), present);
        assert!(!registry.reconcile(PortId::qsfp(1), present));
    }

    #[test]
    fn test_snapshot_orders_sfp_first() {
        let registry = PortRegistry::new([PortId::qsfp(0), PortId::sfp(1), PortId::sfp(0)]);
        let order: Vec<PortId> = registry.ports().collect();
        assert_eq!(order, vec![PortId::sfp(0), PortId::sfp(1), PortId::qsfp(0)]);
    }
}
