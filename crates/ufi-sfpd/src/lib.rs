//! Transceiver hot-plug monitor for UFI switch platforms
//!
//! Watches the SFP and QSFP cages of the board. Presence, rx-loss and
//! tx-fault pins sit on GPIO expanders on the shared I2C bus; a kernel
//! interrupt line fires when any of them changes. [`HotplugMonitor`] waits on
//! that line, re-reads every port through [`ufi_i2c_common::SharedBus`] and
//! reports presence edges to a [`Supervisor`].

pub mod board;
pub mod config_file;
pub mod eeprom;
pub mod error;
pub mod hotplug;
pub mod interrupt;
pub mod port;
pub mod supervisor;
pub mod transceiver;

pub use board::{
    Board, EepromRoute, MuxConfig, Pin, PinConfig, QSFP_EEPROM, QsfpPort, QsfpPortConfig,
    SFP_EEPROM_A0, SFP_EEPROM_A2, SfpPort, SfpPortConfig, TopologyConfig,
};
pub use config_file::{
    BusConfig, DEFAULT_CONFIG_PATH, InterruptConfig, LockConfig, LoggingConfig, SfpdConfig,
};
pub use eeprom::{EEPROM_PAGE_SIZE, QSFP_MAX_PAGE, QSFP_UPPER_PAGE_SIZE, SfpPage};
pub use error::{SfpdError, SfpdResult};
pub use hotplug::{HotplugMonitor, MonitorStats};
pub use interrupt::{InterruptLine, PollWaitSet, Wake, WakeSource};
pub use port::{PortId, PortRegistry, PortState, PortType};
pub use supervisor::{LogSupervisor, Supervisor};
pub use transceiver::{
    AlarmSnapshot, PortController, PortObserver, QSFP_RESET_HOLD, SfpAlarms, SfpRate,
};
