//! I²C back-end for the Linux `/dev/i2c-*` character-device interface.

use std::fs::OpenOptions;
use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;

use log::{debug, error};
use nix::ioctl_write_int_bad;

use crate::error::{Error, Result};

use super::{parse_kernel_spec, I2cBus};

const I2C_SLAVE: libc::c_ulong = 0x0703;

ioctl_write_int_bad!(i2c_set_slave, I2C_SLAVE);

/// An I²C adapter bound to a single slave address on a kernel bus device.
///
/// The slave address is fixed with the `I2C_SLAVE` ioctl when the adapter
/// is opened; afterwards plain `read(2)`/`write(2)` on the device node
/// translate into bus transactions addressed at that slave. The device
/// node is closed when the adapter is dropped.
pub struct KernelI2c {
    file: std::fs::File,
}

impl KernelI2c {
    /// Opens a bus device and binds the slave address, both taken from a
    /// `"<device>:<addr>"` spec such as `/dev/i2c-1:0x48`.
    pub fn open(config: &str) -> Result<Self> {
        let (device, addr) = parse_kernel_spec(config)?;
        debug!("i2c device: {}, slave address: {:#04x}", device, addr);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(device)
            .map_err(|e| {
                error!("Could not open I2C device {} ({})", device, e);
                Error::BusOpenFailed
            })?;

        unsafe { i2c_set_slave(file.as_raw_fd(), libc::c_int::from(addr)) }.map_err(|e| {
            error!("Could not set I2C address {:#04x} ({})", addr, e);
            Error::BusOpenFailed
        })?;

        Ok(KernelI2c { file })
    }
}

impl I2cBus for KernelI2c {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }
}
