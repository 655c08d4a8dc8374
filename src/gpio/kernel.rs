//! GPIO back-end for the `/dev/gpiochip*` line-handle interface.

use std::fs::File;
use std::mem;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};

use log::{debug, error};
use nix::ioctl_readwrite;

use crate::error::{Error, Result};
use crate::utils::parse_num;

use super::{parse_line_token, GpioPin};

const GPIOHANDLES_MAX: usize = 64;
const CONSUMER_LABEL: &[u8] = b"libifdse";

bitflags! {
    /// Line-handle request flags understood by the GPIO character device.
    struct HandleRequestFlags: u32 {
        const INPUT = 1 << 0;
        const OUTPUT = 1 << 1;
        const ACTIVE_LOW = 1 << 2;
        const OPEN_DRAIN = 1 << 3;
        const OPEN_SOURCE = 1 << 4;
    }
}

/// Mirror of `struct gpiohandle_request` from the GPIO uapi.
#[repr(C)]
struct GpioHandleRequest {
    lineoffsets: [u32; GPIOHANDLES_MAX],
    flags: u32,
    default_values: [u8; GPIOHANDLES_MAX],
    consumer_label: [u8; 32],
    lines: u32,
    fd: libc::c_int,
}

/// Mirror of `struct gpiohandle_data` from the GPIO uapi.
#[repr(C)]
struct GpioHandleData {
    values: [u8; GPIOHANDLES_MAX],
}

ioctl_readwrite!(gpio_get_linehandle, 0xB4, 0x03, GpioHandleRequest);
ioctl_readwrite!(gpio_set_line_values, 0xB4, 0x09, GpioHandleData);

/// An output line claimed through a GPIO character device.
///
/// The chip device is only needed while requesting the handle; the line
/// itself is owned through the handle fd, which the kernel keeps valid
/// until it is closed on drop.
pub struct KernelGpio {
    line_fd: OwnedFd,
}

impl KernelGpio {
    /// Claims an output line from a `"<chip>:[n]<line>"` spec such as
    /// `0:n16`, with the initial (logical) value low.
    pub fn open(config: &str) -> Result<Self> {
        let (chip, line, active_low) = parse_kernel_spec(config)?;
        debug!(
            "gpiochip: {}, line: {}, active_low: {}",
            chip, line, active_low
        );

        let chrdev_name = format!("/dev/gpiochip{}", chip);
        let chip_file = File::open(&chrdev_name).map_err(|e| {
            error!("Could not open GPIO chip file {} ({})", chrdev_name, e);
            Error::BusOpenFailed
        })?;

        let mut flags = HandleRequestFlags::OUTPUT;
        if active_low {
            flags |= HandleRequestFlags::ACTIVE_LOW;
        }

        let mut req: GpioHandleRequest = unsafe { mem::zeroed() };
        req.lineoffsets[0] = line;
        req.flags = flags.bits();
        req.consumer_label[..CONSUMER_LABEL.len()].copy_from_slice(CONSUMER_LABEL);
        req.lines = 1;
        req.default_values[0] = 0;

        unsafe { gpio_get_linehandle(chip_file.as_raw_fd(), &mut req) }.map_err(|e| {
            error!("Could not get GPIO line {} ({})", line, e);
            Error::BusOpenFailed
        })?;

        if req.fd < 0 {
            error!("GPIO chip {} returned an invalid line handle", chrdev_name);
            return Err(Error::BusOpenFailed);
        }

        Ok(KernelGpio {
            line_fd: unsafe { OwnedFd::from_raw_fd(req.fd) },
        })
    }

    fn set_value(&mut self, value: u8) -> Result<()> {
        let mut data: GpioHandleData = unsafe { mem::zeroed() };
        data.values[0] = value;

        unsafe { gpio_set_line_values(self.line_fd.as_raw_fd(), &mut data) }.map_err(|e| {
            error!("Could not set GPIO value ({})", e);
            Error::Io(e.into())
        })?;

        Ok(())
    }
}

impl GpioPin for KernelGpio {
    fn enable(&mut self) -> Result<()> {
        self.set_value(1)
    }

    fn disable(&mut self) -> Result<()> {
        self.set_value(0)
    }
}

/// Splits a `"<chip>:[n]<line>"` kernel line spec into its parts.
fn parse_kernel_spec(config: &str) -> Result<(u32, u32, bool)> {
    let pos = match config.find(':') {
        Some(pos) => pos,
        None => {
            error!("No GPIO line defined in '{}'", config);
            return Err(Error::NotConfigured);
        }
    };

    let chip = match parse_num(&config[..pos]) {
        Some(chip) => chip,
        None => {
            error!("Invalid GPIO chip in '{}'", config);
            return Err(Error::NotConfigured);
        }
    };

    let (active_low, rest) = parse_line_token(&config[pos + 1..]);
    let line = match parse_num(rest) {
        Some(line) => line,
        None => {
            error!("Invalid GPIO line in '{}'", config);
            return Err(Error::NotConfigured);
        }
    };

    Ok((chip, line, active_low))
}
