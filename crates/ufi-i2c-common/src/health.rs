//! Bus health check.
//!
//! A few devices on the board never go away (CPU board EEPROM, temperature
//! sensor). If they stop answering the bus itself is wedged, which is a very
//! different problem from one transceiver returning garbage.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::bus::SharedBus;
use crate::error::{I2cError, I2cResult};
use crate::mux::Device;
use crate::transport::BusProvider;

/// A device expected to always acknowledge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthProbe {
    /// Name used in logs.
    pub name: String,
    /// Address on the root segment.
    pub address: u8,
}

/// Outcome of a health check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusHealth {
    /// Every probe acknowledged.
    Healthy,
    /// These probes did not answer or failed.
    Degraded(Vec<String>),
}

impl BusHealth {
    /// True if every probe answered.
    pub fn is_healthy(&self) -> bool {
        matches!(self, BusHealth::Healthy)
    }
}

/// Probes every device in `probes` on the root segment of `bus`.
///
/// Lock timeouts propagate; anything else a probe hits counts against it.
pub fn check_bus_health<P: BusProvider>(
    bus: &SharedBus<P>,
    probes: &[HealthProbe],
) -> I2cResult<BusHealth> {
    let mut failed = Vec::new();
    for probe in probes {
        let device: Device = bus.tree().device(probe.address, None)?;
        match bus.probe(&device) {
            Ok(true) => debug!(probe = %probe.name, address = %device.address, "Health probe answered"),
            Ok(false) => {
                warn!(probe = %probe.name, address = %device.address, "Health probe absent");
                failed.push(probe.name.clone());
            }
            Err(e @ I2cError::LockTimeout { .. }) => return Err(e),
            Err(e) => {
                warn!(probe = %probe.name, address = %device.address, error = %e, "Health probe failed");
                failed.push(probe.name.clone());
            }
        }
    }
    if failed.is_empty() {
        Ok(BusHealth::Healthy)
    } else {
        Ok(BusHealth::Degraded(failed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LockBroker;
    use crate::mux::MuxTreeBuilder;
    use crate::sim::{SimBus, SimFault};

    fn probes() -> Vec<HealthProbe> {
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

    fn shared(sim: &SimBus, dir: &tempfile::TempDir) -> SharedBus<SimBus> {
        SharedBus::new(
            sim.clone(),
            MuxTreeBuilder::new(0).build(),
            LockBroker::new(dir.path().join("i2c.lock")),
        )
    }

    #[test]
    fn test_healthy_bus() {
        let dir = tempfile::tempdir().unwrap();
        let sim = SimBus::new(0);
        sim.add_device(0x57, None);
        sim.add_device(0x4f, None);

        let health = check_bus_health(&shared(&sim, &dir), &probes()).unwrap();
        assert!(health.is_healthy());
    }

    #[test]
    fn test_degraded_bus_names_failed_probes() {
        let dir = tempfile::tempdir().unwrap();
        let sim = SimBus::new(0);
        sim.add_device(0x57, None);
        sim.set_fault(0x57, Some(SimFault::BusError));

        let health = check_bus_health(&shared(&sim, &dir), &probes()).unwrap();
        assert_eq!(
            health,
            BusHealth::Degraded(vec!["cpu_eeprom".to_string(), "cpu_tmp75".to_string()])
        );
    }
}
