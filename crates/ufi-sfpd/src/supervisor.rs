//! The supervisor boundary: where the monitor reports what it observed.

use std::os::fd::RawFd;

use nix::poll::PollFlags;
use tracing::info;

use crate::port::PortType;

/// Receiver of hot-plug events.
///
/// Callbacks run on the monitor's thread between two waits; a slow
/// supervisor delays the next reconciliation pass.
#[cfg_attr(test, mockall::automock)]
pub trait Supervisor {
    /// A port's presence changed. `name` is the interface name (`xe3`).
    fn on_presence_change(&mut self, name: &str, port_type: PortType, index: u8, present: bool);

    /// A registered descriptor other than the interrupt line woke the loop.
    fn on_file_event(&mut self, fd: RawFd, events: PollFlags);
}

/// Supervisor that only logs.
#[derive(Debug, Default)]
pub struct LogSupervisor;

impl Supervisor for LogSupervisor {
    fn on_presence_change(&mut self, name: &str, port_type: PortType, index: u8, present: bool) {
        info!(port = name, %port_type, index, present, "Transceiver presence changed");
    }

    fn on_file_event(&mut self, fd: RawFd, events: PollFlags) {
        info!(fd, ?events, "File event");
    }
}
