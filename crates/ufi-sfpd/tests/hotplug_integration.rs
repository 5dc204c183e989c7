//! Hot-plug monitor against the default board topology on a simulated bus.

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::io;
    use std::os::fd::RawFd;

    use nix::poll::PollFlags;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;
    use ufi_i2c_common::{BusOp, LockBroker, SharedBus, SimBus, SimFault};
    use ufi_sfpd::{
        Board, HotplugMonitor, PortController, PortId, PortType, SfpPage, SfpdError, SfpdResult,
        Supervisor, TopologyConfig, Wake, WakeSource,
    };

    const ROOT: u8 = 0x76;
    const CONTROL: Option<(u8, u8)> = Some((ROOT, 0x01));
    const FAULT: Option<(u8, u8)> = Some((ROOT, 0x02));
    const STATUS: Option<(u8, u8)> = Some((ROOT, 0x04));

    #[derive(Debug, Default)]
    struct Recorder {
        presence: Vec<(String, PortType, u8, bool)>,
        files: Vec<(RawFd, PollFlags)>,
    }

    impl Supervisor for Recorder {
        fn on_presence_change(&mut self, name: &str, port_type: PortType, index: u8, present: bool) {
            self.presence.push((name.to_string(), port_type, index, present));
        }

        fn on_file_event(&mut self, fd: RawFd, events: PollFlags) {
            self.files.push((fd, events));
        }
    }

    struct Script {
        wakes: VecDeque<Vec<Wake>>,
        rearms: u32,
    }

    impl Script {
        fn new(wakes: Vec<Vec<Wake>>) -> Self {
            Self {
                wakes: wakes.into(),
                rearms: 0,
            }
        }
    }

    impl WakeSource for Script {
        fn wait(&mut self) -> SfpdResult<Vec<Wake>> {
            self.wakes
                .pop_front()
                .ok_or_else(|| SfpdError::Io(io::Error::other("no more wakes")))
        }

        fn rearm(&mut self) -> SfpdResult<()> {
            self.rearms += 1;
            Ok(())
        }
    }

    struct Harness {
        dir: TempDir,
        sim: SimBus,
        monitor: HotplugMonitor<PortController<SimBus>, Recorder>,
    }

    /// Default board with every cage empty.
    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let sim = SimBus::new(0);
        sim.add_mux(ROOT, None);
        for mux in [0x71, 0x72, 0x73, 0x74, 0x70] {
            sim.add_mux(mux, Some((ROOT, 0x08)));
        }
        sim.add_device(0x57, None);
        sim.add_device(0x4f, None);
        for addr in [0x20, 0x21, 0x22, 0x24] {
            sim.add_device(addr, STATUS);
        }
        for addr in [0x26, 0x27, 0x25, 0x23] {
            sim.add_device(addr, FAULT);
        }
        for addr in [0x21, 0x22, 0x24] {
            sim.add_device(addr, CONTROL);
        }
        // presence inputs are active-low
        for reg in [0, 1] {
            sim.set_register(0x20, STATUS, reg, 0xff);
            sim.set_register(0x22, STATUS, reg, 0xff);
        }
        sim.set_register(0x21, CONTROL, 0, 0xff);

        let board = Board::from_config(0, &TopologyConfig::default()).unwrap();
        let bus = SharedBus::new(
            sim.clone(),
            board.tree().clone(),
            LockBroker::new(dir.path().join("i2c.lock")),
        );
        let monitor = HotplugMonitor::new(PortController::new(bus, board), Recorder::default());
        Harness { dir, sim, monitor }
    }

    fn interrupt() -> Vec<Vec<Wake>> {
        vec![vec![Wake::Interrupt]]
    }

    #[test]
    fn test_boot_absorbs_present_modules() {
        let mut h = harness();
        h.sim.set_register(0x20, STATUS, 0, 0x7f); // xe0
        h.sim.set_register(0x21, CONTROL, 0, 0xdf); // ce0

        h.monitor.boot();

        assert!(h.monitor.supervisor().presence.is_empty());
        assert!(h.monitor.registry().get(PortId::sfp(0)).unwrap().present);
        assert!(h.monitor.registry().get(PortId::qsfp(0)).unwrap().present);
        assert_eq!(h.monitor.registry().len(), 30);
        assert!(h.sim.all_deselected());
    }

    #[test]
    fn test_sfp3_insertion_emits_exactly_one_event() {
        let mut h = harness();
        h.monitor.boot();
        assert!(!h.monitor.registry().get(PortId::sfp(3)).unwrap().present);

        h.sim.set_register(0x20, STATUS, 0, 0xef);
        let mut script = Script::new(interrupt());
        h.monitor.step(&mut script).unwrap();

        assert_eq!(
            h.monitor.supervisor().presence,
            vec![("xe3".to_string(), PortType::Sfp, 3, true)]
        );
        assert!(h.monitor.registry().get(PortId::sfp(3)).unwrap().present);
        assert_eq!(script.rearms, 1);
        assert!(h.sim.all_deselected());
    }

    #[test]
    fn test_removal_after_insertion() {
        let mut h = harness();
        h.monitor.boot();

        h.sim.set_register(0x21, CONTROL, 0, 0xef); // ce1 in
        let mut script = Script::new(vec![vec![Wake::Interrupt], vec![Wake::Interrupt]]);
        h.monitor.step(&mut script).unwrap();
        h.sim.set_register(0x21, CONTROL, 0, 0xff); // ce1 out
        h.monitor.step(&mut script).unwrap();

        assert_eq!(
            h.monitor.supervisor().presence,
            vec![
                ("ce1".to_string(), PortType::Qsfp, 1, true),
                ("ce1".to_string(), PortType::Qsfp, 1, false),
            ]
        );
        assert_eq!(h.monitor.stats().events_emitted, 2);
    }

    #[test]
    fn test_every_pass_clears_alarm_latches() {
        let mut h = harness();
        h.monitor.boot();

        h.sim.latch(0x21, STATUS, 0, 0x90); // xe0 and xe3 rx-loss
        h.sim.latch(0x27, FAULT, 1, 0x80); // xe24 tx-fault
        let mut script = Script::new(interrupt());
        h.monitor.step(&mut script).unwrap();

        assert_eq!(h.sim.latched(0x21, STATUS, 0), 0);
        assert_eq!(h.sim.latched(0x27, FAULT, 1), 0);
        let xe0 = h.monitor.registry().get(PortId::sfp(0)).unwrap();
        assert_eq!(xe0.rx_loss, Some(true));
        let xe3 = h.monitor.registry().get(PortId::sfp(3)).unwrap();
        assert_eq!(xe3.rx_loss, Some(true));
        assert_eq!(xe3.tx_fault, Some(false));
        assert_eq!(h.monitor.registry().get(PortId::sfp(1)).unwrap().rx_loss, Some(false));
        let xe24 = h.monitor.registry().get(PortId::sfp(24)).unwrap();
        assert_eq!(xe24.tx_fault, Some(true));
        // alarm changes alone are not presence events
        assert!(h.monitor.supervisor().presence.is_empty());
    }

    #[test]
    fn test_alarm_register_is_read_once_per_pass() {
        let mut h = harness();
        h.monitor.boot();
        h.sim.clear_ops();

        let mut script = Script::new(interrupt());
        h.monitor.step(&mut script).unwrap();

        let rx_loss_reads = h
            .sim
            .ops()
            .into_iter()
            .filter(|op| matches!(op, BusOp::ReadByte { addr: 0x21, reg: 0 }))
            .count();
        // 0x21 register 0 is also the QSFP presence register behind CONTROL
        assert_eq!(rx_loss_reads, 3);
    }

    #[test]
    fn test_changes_in_one_wake_are_emitted_sfp_first_in_index_order() {
        let mut h = harness();
        h.monitor.boot();

        h.sim.set_register(0x21, CONTROL, 0, 0xdf); // ce0
        h.sim.set_register(0x20, STATUS, 0, 0xbb); // xe1 and xe5
        let mut script = Script::new(interrupt());
        h.monitor.step(&mut script).unwrap();

        assert_eq!(
            h.monitor.supervisor().presence,
            vec![
                ("xe1".to_string(), PortType::Sfp, 1, true),
                ("xe5".to_string(), PortType::Sfp, 5, true),
                ("ce0".to_string(), PortType::Qsfp, 0, true),
            ]
        );
        assert_eq!(h.monitor.stats().passes, 1);
    }

    #[test]
    fn test_faulty_expander_does_not_stop_pass() {
        let mut h = harness();
        h.monitor.boot();

        h.sim.set_fault(0x20, Some(SimFault::BusError));
        h.sim.set_register(0x22, STATUS, 0, 0xf7); // xe20
        let mut script = Script::new(interrupt());
        h.monitor.step(&mut script).unwrap();

        assert_eq!(
            h.monitor.supervisor().presence,
            vec![("xe20".to_string(), PortType::Sfp, 20, true)]
        );
        // presence of xe0..xe15 sits on the faulty expander
        assert_eq!(h.monitor.stats().read_failures, 16);
        assert!(h.sim.all_deselected());
    }

    #[test]
    fn test_absent_module_dump_is_all_ff() {
        let h = harness();
        let controller = h.monitor.observer();

        // xe2: EEPROM 0x50 behind channel 0x04 of the first SFP mux
        let dump = controller.dump_sfp_page(2, SfpPage::A0).unwrap();
        assert_eq!(dump, vec![0xff; 256]);
        assert!(h.sim.all_deselected());
        assert_eq!(h.sim.open_transports(), 0);
    }

    #[test]
    fn test_present_module_eeprom() {
        let h = harness();
        let mut a0 = vec![0u8; 256];
        a0[0] = 0x03; // SFP identifier
        a0[92] = 0x68;
        h.sim.set_memory(0x50, Some((0x72, 0x01)), &a0);
        h.sim.set_memory(0x51, Some((0x72, 0x01)), &[0x5a; 256]);

        let controller = h.monitor.observer();
        assert_eq!(controller.sfp_pages(8).unwrap(), vec![0xa0, 0xa2]);
        assert_eq!(controller.read_range(PortId::sfp(8), 0, 1).unwrap(), vec![0x03]);
        assert_eq!(controller.read_range(PortId::sfp(8), 300, 2).unwrap(), vec![0x5a, 0x5a]);
        assert!(matches!(
            controller.read_range(PortId::sfp(9), 0, 1),
            Err(SfpdError::ModuleNotPresent(_))
        ));
    }

    #[test]
    fn test_file_events_are_forwarded() {
        let mut h = harness();
        h.monitor.boot();
        h.sim.set_register(0x20, STATUS, 0, 0xef);

        let mut script = Script::new(vec![vec![Wake::File {
            fd: 42,
            events: PollFlags::POLLIN,
        }]]);
        h.monitor.step(&mut script).unwrap();

        assert_eq!(h.monitor.supervisor().files, vec![(42, PollFlags::POLLIN)]);
        assert!(h.monitor.supervisor().presence.is_empty());
        assert_eq!(script.rearms, 0);
    }

    #[test]
    fn test_run_stops_on_wait_failure() {
        let mut h = harness();
        let mut script = Script::new(interrupt());

        let err = h.monitor.run(&mut script).unwrap_err();
        assert!(matches!(err, SfpdError::Io(_)));
        assert_eq!(script.rearms, 2);
        assert_eq!(h.monitor.stats().passes, 1);
        assert!(h.dir.path().join("i2c.lock").exists());
    }
}
