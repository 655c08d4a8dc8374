//! Secure Element sessions and their registry.
//!
//! # Description
//!
//! Each attached chip is driven through a [`Session`], the common surface
//! the IFD layer calls into: power control, warm reset, ATR retrieval and
//! APDU exchange. Two drivers implement it:
//!
//! - [`se05x::Se05x`] speaks the block-oriented T=1 protocol of the NXP
//!   SE05x family over I²C,
//! - [`kerkey::Kerkey`] speaks the length-prefixed command protocol of
//!   Kerkey-style SEs.
//!
//! Sessions are created from a device string of the form
//! `se:<driver>@i2c:<spec>[@gpio:<spec>]` and tracked per host-assigned
//! LUN in [`registry`].

use log::{debug, error};

use crate::error::{Error, Result};
use crate::gpio::GpioDev;
use crate::i2c::I2cDev;

pub mod kerkey;
pub mod registry;
pub mod se05x;

#[cfg(test)]
pub(crate) mod testutil;

pub use kerkey::Kerkey;
pub use se05x::Se05x;

/// Operations every Secure Element session offers to the IFD layer.
///
/// Callers serialize access per session; none of these operations may be
/// reentered while another one is in flight.
pub trait Session {
    /// Copies the session's ATR into `buf` and returns its length.
    fn get_atr(&self, buf: &mut [u8]) -> Result<usize>;

    /// Powers the chip up (electrically, or through a protocol reset if
    /// no control line is wired up).
    fn power_up(&mut self) -> Result<()>;

    /// Powers the chip down. Without a control line this is a no-op.
    fn power_down(&mut self) -> Result<()>;

    /// Resets the chip without dropping power and refreshes the cached
    /// ATR.
    fn warm_reset(&mut self) -> Result<()>;

    /// Exchanges one APDU: sends `tx`, places the response into `rx` and
    /// returns the response length.
    fn xfer(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<usize>;
}

/// The SE drivers a device string may select.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DriverKind {
    Kerkey,
    Se05x,
}

/// A device string split into driver tag and sub-device specs.
#[derive(Debug, PartialEq, Eq)]
struct ParsedConfig<'a> {
    driver: DriverKind,
    i2c: Option<&'a str>,
    gpio: Option<&'a str>,
}

/// Splits a `"se:<driver>@<subdev>{@<subdev>}"` device string.
///
/// Sub-devices are `i2c:<spec>` and `gpio:<spec>` tokens; a later token
/// of the same kind replaces an earlier one.
fn parse_config(config: &str) -> Result<ParsedConfig> {
    let rest = match config.strip_prefix("se:") {
        Some(rest) => rest,
        None => {
            error!("Invalid config: '{}'", config);
            return Err(Error::NotConfigured);
        }
    };

    let mut tokens = rest.split('@');
    let driver = match tokens.next() {
        Some("kerkey") => DriverKind::Kerkey,
        Some("se05x") => DriverKind::Se05x,
        _ => {
            error!("Unknown SE provider in '{}'", config);
            return Err(Error::NotConfigured);
        }
    };

    let mut parsed = ParsedConfig {
        driver,
        i2c: None,
        gpio: None,
    };

    for token in tokens {
        if let Some(spec) = token.strip_prefix("i2c:") {
            parsed.i2c = Some(spec);
        } else if let Some(spec) = token.strip_prefix("gpio:") {
            parsed.gpio = Some(spec);
        } else {
            error!("Invalid token in config string: '{}'", token);
            return Err(Error::NotConfigured);
        }
    }

    Ok(parsed)
}

/// Opens the session described by `config`.
///
/// All acquired bus handles travel with the returned session and are
/// released when it is dropped, including when the open sequence fails
/// half-way through.
pub fn open_session(config: &str) -> Result<Box<dyn Session + Send>> {
    debug!("Trying to create device with config: '{}'", config);

    let parsed = parse_config(config)?;

    let i2c_spec = match parsed.i2c {
        Some(spec) => spec,
        None => {
            error!("Missing I2C device!");
            return Err(Error::NotConfigured);
        }
    };

    let i2c = I2cDev::open(i2c_spec)?;
    let gpio = match parsed.gpio {
        Some(spec) => Some(GpioDev::open(spec)?),
        None => None,
    };

    match parsed.driver {
        DriverKind::Kerkey => Ok(Box::new(Kerkey::open(i2c, gpio)?)),
        DriverKind::Se05x => Ok(Box::new(Se05x::open(i2c, gpio)?)),
    }
}
