//! Linux `i2c-dev` SMBus transport.
//!
//! Talks to `/dev/i2c-<bus>` with the `I2C_SLAVE` and `I2C_SMBUS` ioctls.
//! The adapter reports an unacknowledged address as `ENXIO` (or `EREMOTEIO`
//! on some controllers); both become [`I2cError::DeviceAbsent`].

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr;

use nix::errno::Errno;
use tracing::trace;

use crate::error::{I2cError, I2cResult};
use crate::transport::{BusProvider, DeviceAddress, RegisterTransport};

/// Default directory holding the `i2c-N` character devices.
pub const DEFAULT_DEVICE_DIR: &str = "/dev";

const I2C_SLAVE: u32 = 0x0703;
const I2C_SLAVE_FORCE: u32 = 0x0706;
const I2C_SMBUS: u32 = 0x0720;

const I2C_SMBUS_WRITE: u8 = 0;
const I2C_SMBUS_READ: u8 = 1;

const I2C_SMBUS_BYTE: u32 = 1;
const I2C_SMBUS_BYTE_DATA: u32 = 2;
const I2C_SMBUS_WORD_DATA: u32 = 3;

const I2C_SMBUS_BLOCK_MAX: usize = 32;

/// `union i2c_smbus_data`
#[repr(C, align(2))]
struct SmbusData {
    block: [u8; I2C_SMBUS_BLOCK_MAX + 2],
}

impl SmbusData {
    fn new() -> Self {
        Self {
            block: [0; I2C_SMBUS_BLOCK_MAX + 2],
        }
    }

    fn from_byte(value: u8) -> Self {
        let mut data = Self::new();
        data.block[0] = value;
        data
    }

    fn from_word(value: u16) -> Self {
        let mut data = Self::new();
        data.block[..2].copy_from_slice(&value.to_ne_bytes());
        data
    }

    fn byte(&self) -> u8 {
        self.block[0]
    }

    fn word(&self) -> u16 {
        u16::from_ne_bytes([self.block[0], self.block[1]])
    }
}

/// `struct i2c_smbus_ioctl_data`
#[repr(C)]
struct SmbusIoctlData {
    read_write: u8,
    command: u8,
    size: u32,
    data: *mut SmbusData,
}

mod ioctl {
    use super::{I2C_SLAVE, I2C_SLAVE_FORCE, I2C_SMBUS, SmbusIoctlData};

    nix::ioctl_write_int_bad!(set_slave, I2C_SLAVE);
    nix::ioctl_write_int_bad!(set_slave_force, I2C_SLAVE_FORCE);
    nix::ioctl_write_ptr_bad!(smbus, I2C_SMBUS, SmbusIoctlData);
}

/// An open `/dev/i2c-<bus>` handle. Closed on drop.
#[derive(Debug)]
pub struct SmbusDevice {
    file: File,
    bus: u8,
    force: bool,
    current: Option<u8>,
}

impl SmbusDevice {
    /// Opens the character device at `path` for bus `bus`.
    pub fn open(path: &Path, bus: u8, force: bool) -> I2cResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| I2cError::transport(format!("open {}", path.display()), e))?;
        trace!(path = %path.display(), "Opened SMBus device");
        Ok(Self {
            file,
            bus,
            force,
            current: None,
        })
    }

    fn address(&self, addr: u8) -> DeviceAddress {
        DeviceAddress {
            bus: self.bus,
            addr,
        }
    }

    fn set_address(&mut self, addr: u8) -> I2cResult<()> {
        if self.current == Some(addr) {
            return Ok(());
        }
        let fd = self.file.as_raw_fd();
        // SAFETY: fd is an open i2c-dev descriptor owned by self.file; the
        // ioctl takes the address by value.
        let res = unsafe {
            if self.force {
                ioctl::set_slave_force(fd, libc::c_int::from(addr))
            } else {
                ioctl::set_slave(fd, libc::c_int::from(addr))
            }
        };
        res.map_err(|e| {
            I2cError::transport(
                format!("set target address {}", self.address(addr)),
                io::Error::from(e),
            )
        })?;
        self.current = Some(addr);
        Ok(())
    }

    fn access(
        &mut self,
        addr: u8,
        read_write: u8,
        command: u8,
        size: u32,
        data: Option<&mut SmbusData>,
    ) -> I2cResult<()> {
        self.set_address(addr)?;
        let args = SmbusIoctlData {
            read_write,
            command,
            size,
            data: data.map_or(ptr::null_mut(), |d| d as *mut SmbusData),
        };
        // SAFETY: args and the buffer it points to outlive the call; the
        // kernel writes at most I2C_SMBUS_BLOCK_MAX + 2 bytes into it.
        match unsafe { ioctl::smbus(self.file.as_raw_fd(), &args) } {
            Ok(_) => Ok(()),
            Err(Errno::ENXIO) | Err(Errno::EREMOTEIO) => Err(I2cError::DeviceAbsent {
                address: self.address(addr),
            }),
            Err(e) => Err(I2cError::transport(
                format!("smbus transfer to {} reg {:#04x}", self.address(addr), command),
                io::Error::from(e),
            )),
        }
    }
}

impl RegisterTransport for SmbusDevice {
    fn bus(&self) -> u8 {
        self.bus
    }

    fn read_byte(&mut self, addr: u8, reg: u8) -> I2cResult<u8> {
        let mut data = SmbusData::new();
        self.access(addr, I2C_SMBUS_READ, reg, I2C_SMBUS_BYTE_DATA, Some(&mut data))?;
        Ok(data.byte())
    }

    fn write_byte(&mut self, addr: u8, reg: u8, value: u8) -> I2cResult<()> {
        let mut data = SmbusData::from_byte(value);
        self.access(addr, I2C_SMBUS_WRITE, reg, I2C_SMBUS_BYTE_DATA, Some(&mut data))
    }

    fn read_word(&mut self, addr: u8, reg: u8) -> I2cResult<u16> {
        let mut data = SmbusData::new();
        self.access(addr, I2C_SMBUS_READ, reg, I2C_SMBUS_WORD_DATA, Some(&mut data))?;
        Ok(data.word())
    }

    fn write_word(&mut self, addr: u8, reg: u8, value: u16) -> I2cResult<()> {
        let mut data = SmbusData::from_word(value);
        self.access(addr, I2C_SMBUS_WRITE, reg, I2C_SMBUS_WORD_DATA, Some(&mut data))
    }

    fn receive_byte(&mut self, addr: u8) -> I2cResult<u8> {
        let mut data = SmbusData::new();
        self.access(addr, I2C_SMBUS_READ, 0, I2C_SMBUS_BYTE, Some(&mut data))?;
        Ok(data.byte())
    }

    fn send_byte(&mut self, addr: u8, value: u8) -> I2cResult<()> {
        self.access(addr, I2C_SMBUS_WRITE, value, I2C_SMBUS_BYTE, None)
    }
}

/// Opens `/dev/i2c-<bus>` handles.
#[derive(Debug, Clone)]
pub struct SmbusProvider {
    device_dir: PathBuf,
    force: bool,
}

impl SmbusProvider {
    /// Creates a provider rooted at `device_dir`.
    pub fn new(device_dir: impl Into<PathBuf>) -> Self {
        Self {
            device_dir: device_dir.into(),
            force: false,
        }
    }

    /// Use `I2C_SLAVE_FORCE`, for addresses already claimed by a kernel driver.
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Path of the character device for `bus`.
    pub fn device_path(&self, bus: u8) -> PathBuf {
        self.device_dir.join(format!("i2c-{}", bus))
    }
}

impl Default for SmbusProvider {
    fn default() -> Self {
        Self::new(DEFAULT_DEVICE_DIR)
    }
}

impl BusProvider for SmbusProvider {
    type Transport = SmbusDevice;

    fn open(&self, bus: u8) -> I2cResult<SmbusDevice> {
        SmbusDevice::open(&self.device_path(bus), bus, self.force)
    }
}
