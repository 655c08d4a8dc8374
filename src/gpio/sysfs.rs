//! GPIO back-end for the legacy `/sys/class/gpio` pseudo files.

use std::fs::{File, OpenOptions};
use std::io::Write;

use log::{debug, error, info};

use crate::error::{Error, Result};
use crate::utils::parse_num;

use super::{parse_line_token, GpioPin};

/// An output line driven through the sysfs GPIO interface.
///
/// Opening exports the GPIO, configures its polarity and direction, and
/// keeps the `value` file open for the adapter's lifetime. Polarity is
/// delegated to the kernel through the `active_low` attribute, so the
/// values written here are always logical levels.
pub struct SysfsGpio {
    value_file: File,
}

impl SysfsGpio {
    /// Exports and claims a GPIO from a `"[n]<num>"` spec such as `n16`.
    pub fn open(config: &str) -> Result<Self> {
        let (num, active_low) = parse_sysfs_spec(config)?;
        debug!("sysfs gpio: {}, active_low: {}", num, active_low);

        export(num)?;
        write_attribute(num, "active_low", if active_low { "1" } else { "0" })?;
        write_attribute(num, "direction", "out")?;

        let value_path = format!("/sys/class/gpio/gpio{}/value", num);
        let value_file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&value_path)
            .map_err(|e| {
                error!("Could not open value file {} ({})", value_path, e);
                Error::BusOpenFailed
            })?;

        Ok(SysfsGpio { value_file })
    }

    fn set_value(&mut self, value: &str) -> Result<()> {
        self.value_file.write_all(value.as_bytes()).map_err(|e| {
            error!("Could not write to value file ({})", e);
            Error::Io(e)
        })
    }
}

impl GpioPin for SysfsGpio {
    fn enable(&mut self) -> Result<()> {
        self.set_value("1")
    }

    fn disable(&mut self) -> Result<()> {
        self.set_value("0")
    }
}

/// Makes the GPIO visible in sysfs. An already exported line is fine.
fn export(num: u32) -> Result<()> {
    let mut export_file = OpenOptions::new()
        .write(true)
        .open("/sys/class/gpio/export")
        .map_err(|e| {
            error!("Could not open export file ({})", e);
            Error::BusOpenFailed
        })?;

    match export_file.write_all(num.to_string().as_bytes()) {
        Ok(()) => Ok(()),
        Err(ref e) if e.raw_os_error() == Some(libc::EBUSY) => {
            info!("GPIO {} was already exported", num);
            Ok(())
        }
        Err(e) => {
            error!("Could not write to export file ({})", e);
            Err(Error::BusOpenFailed)
        }
    }
}

/// Writes one value into a per-GPIO sysfs attribute file.
fn write_attribute(num: u32, attribute: &str, value: &str) -> Result<()> {
    let path = format!("/sys/class/gpio/gpio{}/{}", num, attribute);

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&path)
        .map_err(|e| {
            error!("Could not open {} ({})", path, e);
            Error::BusOpenFailed
        })?;

    file.write_all(value.as_bytes()).map_err(|e| {
        error!("Could not write to {} ({})", path, e);
        Error::BusOpenFailed
    })
}

/// Splits a `"[n]<num>"` sysfs line spec into its parts.
fn parse_sysfs_spec(config: &str) -> Result<(u32, bool)> {
    let (active_low, rest) = parse_line_token(config);

    match parse_num(rest) {
        Some(num) => Ok((num, active_low)),
        None => {
            error!("Invalid GPIO '{}'", config);
            Err(Error::NotConfigured)
        }
    }
}
