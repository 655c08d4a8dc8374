//! Access to the GPIO line controlling a Secure Element's reset or power
//! input.
//!
//! # Description
//!
//! A session needs exactly one output line with two meaningful states:
//! "SE enabled" and "SE disabled". The [`GpioPin`] trait captures that
//! pair; the electrical polarity is handled inside the back-ends, so a
//! session never needs to know whether the line is active-low.
//!
//! Two back-ends exist, selected by the leading tag of a `gpio:`
//! configuration string:
//!
//! - `kernel:<chip>:[n]<line>` requests a line handle from a
//!   `/dev/gpiochip*` character device ([`kernel::KernelGpio`]),
//! - `sysfs:[n]<num>` drives the legacy `/sys/class/gpio` pseudo files
//!   ([`sysfs::SysfsGpio`]).
//!
//! The optional `n` marks the line as active-low. Both back-ends claim
//! the line as an output with the disabled level as its initial value.

use log::error;

use crate::error::{Error, Result};

pub mod kernel;
pub mod sysfs;

pub use kernel::KernelGpio;
pub use sysfs::SysfsGpio;

/// A single output line with enable/disable semantics.
///
/// `enable` drives the logical "on" level and `disable` the logical
/// "off" level; active-low mapping happens below this interface. The
/// line is released when the adapter is dropped.
pub trait GpioPin {
    /// Drives the line to its logical "on" level.
    fn enable(&mut self) -> Result<()>;

    /// Drives the line to its logical "off" level.
    fn disable(&mut self) -> Result<()>;
}

/// Available GPIO back-ends, selected by the leading provider tag of a
/// `gpio:` configuration string.
pub enum GpioDev {
    /// The `/dev/gpiochip*` line-handle interface.
    Kernel(KernelGpio),
    /// The `/sys/class/gpio` pseudo-file interface.
    Sysfs(SysfsGpio),
}

impl GpioDev {
    /// Opens a GPIO adapter described by `config`, e.g. `kernel:0:n16`
    /// or `sysfs:16`.
    pub fn open(config: &str) -> Result<Self> {
        let (provider, args) = match config.find(':') {
            Some(pos) => (&config[..pos], &config[pos + 1..]),
            None => (config, ""),
        };

        match provider {
            "kernel" => Ok(GpioDev::Kernel(KernelGpio::open(args)?)),
            "sysfs" => Ok(GpioDev::Sysfs(SysfsGpio::open(args)?)),
            _ => {
                error!("Unknown GPIO provider: '{}'", config);
                Err(Error::NotConfigured)
            }
        }
    }
}

impl GpioPin for GpioDev {
    fn enable(&mut self) -> Result<()> {
        match self {
            GpioDev::Kernel(dev) => dev.enable(),
            GpioDev::Sysfs(dev) => dev.enable(),
        }
    }

    fn disable(&mut self) -> Result<()> {
        match self {
            GpioDev::Kernel(dev) => dev.disable(),
            GpioDev::Sysfs(dev) => dev.disable(),
        }
    }
}

/// Splits the optional active-low marker off a line number.
fn parse_line_token(token: &str) -> (bool, &str) {
    match token.strip_prefix('n') {
        Some(rest) => (true, rest),
        None => (false, token),
    }
}
