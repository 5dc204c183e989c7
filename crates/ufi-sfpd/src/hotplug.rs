//! Hot-plug monitor: the single-threaded loop that turns interrupt wakes
//! into presence-change events.
//!
//! On start every port is read once and the registry seeded silently. After
//! that each interrupt wake re-arms the line and runs one full
//! reconciliation pass over all ports, SFP before QSFP and in index order.
//! A port whose read fails is skipped for that pass; the others are still
//! reconciled.

use std::convert::Infallible;

use tracing::{debug, info, warn};

use crate::error::SfpdResult;
use crate::interrupt::{Wake, WakeSource};
use crate::port::{PortId, PortRegistry, PortState};
use crate::supervisor::Supervisor;
use crate::transceiver::PortObserver;

/// Counters kept by the monitor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorStats {
    /// Returns from the wait, including signal interruptions.
    pub wakes: u64,
    pub interrupts: u64,
    pub file_events: u64,
    /// Reconciliation passes, boot excluded.
    pub passes: u64,
    pub events_emitted: u64,
    /// Failed presence or alarm reads.
    pub read_failures: u64,
}

pub struct HotplugMonitor<O: PortObserver, S: Supervisor> {
    observer: O,
    supervisor: S,
    registry: PortRegistry,
    stats: MonitorStats,
}

impl<O: PortObserver, S: Supervisor> HotplugMonitor<O, S> {
    /// Creates a monitor with every observed port absent.
    pub fn new(observer: O, supervisor: S) -> Self {
        let registry = PortRegistry::new(observer.ports());
        Self {
            observer,
            supervisor,
            registry,
            stats: MonitorStats::default(),
        }
    }

    pub fn observer(&self) -> &O {
        &self.observer
    }

    pub fn supervisor(&self) -> &S {
        &self.supervisor
    }

    pub fn registry(&self) -> &PortRegistry {
        &self.registry
    }

    pub fn stats(&self) -> MonitorStats {
        self.stats
    }

    /// Reads every port once, in registry order.
    ///
    /// The alarm registers are read first, each once for the whole pass, so
    /// their latches clear even for ports whose presence read then fails.
    /// Ports whose presence could not be read are left out; a port whose
    /// alarm register failed keeps its previous alarm values.
    fn read_all(&mut self) -> Vec<(PortId, PortState)> {
        let ports: Vec<PortId> = self.registry.ports().collect();
        let alarms = self.observer.alarm_snapshot(&ports);
        for e in alarms.errors() {
            self.stats.read_failures += 1;
            warn!(error = %e, "Failed to read alarm register");
        }

        let mut states = Vec::with_capacity(ports.len());
        for port in ports {
            let present = match self.observer.presence(port) {
                Ok(present) => present,
                Err(e) => {
                    self.stats.read_failures += 1;
                    warn!(port = %port, error = %e, "Failed to read presence, skipping port");
                    continue;
                }
            };
            let (rx_loss, tx_fault) = if alarms.is_failed(port) {
                let previous = self.registry.get(port).unwrap_or_default();
                (previous.rx_loss, previous.tx_fault)
            } else {
                match alarms.get(port) {
                    Some(a) => (Some(a.rx_loss), Some(a.tx_fault)),
                    None => (None, None),
                }
            };
            states.push((
                port,
                PortState {
                    present,
                    rx_loss,
                    tx_fault,
                },
            ));
        }
        states
    }

    /// Seeds the registry from hardware without emitting events.
    ///
    /// Alarm values read here are stale latches from before start and are
    /// not stored.
    pub fn boot(&mut self) {
        for (port, state) in self.read_all() {
            self.registry.seed(
                port,
                PortState {
                    present: state.present,
                    ..PortState::default()
                },
            );
        }
        let present = self
            .registry
            .snapshot()
            .values()
            .filter(|s| s.present)
            .count();
        info!(ports = self.registry.len(), present, "Boot reconciliation complete");
    }

    /// Reads every port and reports presence edges. Returns the number of
    /// events emitted.
    pub fn reconcile_all(&mut self) -> usize {
        self.stats.passes += 1;
        let mut emitted = 0;
        for (port, state) in self.read_all() {
            if self.registry.reconcile(port, state) {
                info!(port = %port, present = state.present, "Presence changed");
                self.supervisor.on_presence_change(
                    &port.name(),
                    port.port_type,
                    port.index,
                    state.present,
                );
                emitted += 1;
            }
        }
        self.stats.events_emitted += emitted as u64;
        debug!(pass = self.stats.passes, emitted, "Reconciliation pass complete");
        emitted
    }

    /// Services the wakes returned by one wait.
    pub fn handle_wakes<W: WakeSource>(&mut self, source: &mut W, wakes: &[Wake]) -> SfpdResult<()> {
        for wake in wakes {
            match *wake {
                Wake::Interrupt => {
                    self.stats.interrupts += 1;
                    source.rearm()?;
                    self.reconcile_all();
                }
                Wake::File { fd, events } => {
                    self.stats.file_events += 1;
                    self.supervisor.on_file_event(fd, events);
                }
            }
        }
        Ok(())
    }

    /// Waits once and services what woke the loop.
    pub fn step<W: WakeSource>(&mut self, source: &mut W) -> SfpdResult<()> {
        let wakes = source.wait()?;
        self.stats.wakes += 1;
        if wakes.is_empty() {
            debug!("Wait interrupted by signal");
        }
        self.handle_wakes(source, &wakes)
    }

    /// Boots, arms the interrupt line and services wakes until the wait or
    /// the re-arm fails.
    pub fn run<W: WakeSource>(&mut self, source: &mut W) -> SfpdResult<Infallible> {
        self.boot();
        source.rearm()?;
        info!("Hot-plug monitor running");
        loop {
            self.step(source)?;
        }
    }
}
