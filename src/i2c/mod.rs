//! Access to the I²C adapter backing a Secure Element session.
//!
//! # Description
//!
//! Secure Elements act as plain I²C slaves, so all the driver needs from
//! the bus layer is "read n bytes" and "write n bytes" against a bound
//! slave address. The [`I2cBus`] trait captures exactly that; the only
//! back-end, [`kernel::KernelI2c`], implements it on top of the Linux
//! `/dev/i2c-*` character devices.
//!
//! # Retry behavior
//!
//! SE firmware commonly signals "busy, ask again" by not acknowledging its
//! slave address. Which error code that NACK turns into by the time it
//! reaches userspace depends on the bus controller driver: the I²C core
//! asks for `ENXIO`, but `ETIMEDOUT` and `EREMOTEIO` are seen in the wild
//! as well. [`read_with_retry`] and [`write_with_retry`] collapse all
//! three into one retryable class and poll the slave with a guard delay
//! until the attempt budget runs out.

use std::io;
use std::thread;
use std::time::Duration;

use log::error;

use crate::error::{Error, Result};
use crate::utils::parse_num;

pub mod kernel;

pub use kernel::KernelI2c;

/// Byte-level access to an I²C slave.
///
/// Both operations transfer as many bytes as the slave provides in a
/// single bus transaction and return the transferred count; errors carry
/// the raw OS error so that callers can classify NACKs.
pub trait I2cBus {
    /// Reads into `buf`, returning the number of bytes transferred.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes `buf`, returning the number of bytes transferred.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;
}

/// Available I²C back-ends, selected by the leading provider tag of an
/// `i2c:` configuration string.
pub enum I2cDev {
    /// The Linux `/dev/i2c-*` character-device interface.
    Kernel(KernelI2c),
}

impl I2cDev {
    /// Opens an I²C adapter described by `config`, e.g.
    /// `kernel:/dev/i2c-1:0x48`.
    pub fn open(config: &str) -> Result<Self> {
        let (provider, args) = match config.find(':') {
            Some(pos) => (&config[..pos], &config[pos + 1..]),
            None => (config, ""),
        };

        match provider {
            "kernel" => Ok(I2cDev::Kernel(KernelI2c::open(args)?)),
            _ => {
                error!("Unknown I2C provider: '{}'", config);
                Err(Error::NotConfigured)
            }
        }
    }
}

impl I2cBus for I2cDev {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            I2cDev::Kernel(dev) => dev.read(buf),
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            I2cDev::Kernel(dev) => dev.write(buf),
        }
    }
}

/// Whether an I/O error is one of the error codes bus drivers report for
/// an unacknowledged slave address.
fn is_nack(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::ENXIO) | Some(libc::ETIMEDOUT) | Some(libc::EREMOTEIO)
    )
}

/// Reads exactly `buf.len()` bytes, retrying NACKed transfers.
///
/// Each NACK is followed by a `guard_time` sleep before the next attempt.
/// Short transfers and non-NACK errors fail immediately; an exhausted
/// attempt budget fails with [`Error::Timeout`].
pub fn read_with_retry<B: I2cBus + ?Sized>(
    dev: &mut B,
    buf: &mut [u8],
    max_attempts: usize,
    guard_time: Duration,
) -> Result<()> {
    for _ in 0..max_attempts {
        match dev.read(buf) {
            Ok(n) if n == buf.len() => return Ok(()),
            Ok(n) => {
                error!("Read only {} of {} bytes", n, buf.len());
                return Err(Error::ShortTransfer);
            }
            Err(ref e) if is_nack(e) => thread::sleep(guard_time),
            Err(e) => {
                error!("Reading from I2C device failed: {}", e);
                return Err(Error::Io(e));
            }
        }
    }

    error!("Read timed out");
    Err(Error::Timeout)
}

/// Writes exactly `buf.len()` bytes, retrying NACKed transfers.
///
/// Same contract as [`read_with_retry`].
pub fn write_with_retry<B: I2cBus + ?Sized>(
    dev: &mut B,
    buf: &[u8],
    max_attempts: usize,
    guard_time: Duration,
) -> Result<()> {
    for _ in 0..max_attempts {
        match dev.write(buf) {
            Ok(n) if n == buf.len() => return Ok(()),
            Ok(n) => {
                error!("Wrote only {} of {} bytes", n, buf.len());
                return Err(Error::ShortTransfer);
            }
            Err(ref e) if is_nack(e) => thread::sleep(guard_time),
            Err(e) => {
                error!("Writing to I2C device failed: {}", e);
                return Err(Error::Io(e));
            }
        }
    }

    error!("Write timed out");
    Err(Error::Timeout)
}

/// Splits a `"<device>:<addr>"` kernel adapter spec into its parts.
fn parse_kernel_spec(config: &str) -> Result<(&str, u16)> {
    let pos = match config.rfind(':') {
        Some(pos) => pos,
        None => {
            error!("No I2C slave address defined in '{}'", config);
            return Err(Error::NotConfigured);
        }
    };

    let device = &config[..pos];
    let addr = match parse_num(&config[pos + 1..]) {
        Some(addr) if addr <= 0x7F => addr as u16,
        _ => {
            error!("Invalid I2C address in '{}'", config);
            return Err(Error::NotConfigured);
        }
    };

    Ok((device, addr))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scripted bus that fails a fixed number of times before succeeding.
    struct FlakyBus {
        failures: usize,
        kind: i32,
        attempts: usize,
    }

    impl I2cBus for FlakyBus {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.attempts += 1;
            if self.failures > 0 {
                self.failures -= 1;
                return Err(io::Error::from_raw_os_error(self.kind));
            }
            Ok(buf.len())
        }

        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.attempts += 1;
            if self.failures > 0 {
                self.failures -= 1;
                return Err(io::Error::from_raw_os_error(self.kind));
            }
            Ok(buf.len())
        }
    }

    /// Bus that always transfers fewer bytes than requested.
    struct ShortBus;

    impl I2cBus for ShortBus {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            Ok(buf.len() / 2)
        }

        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len() / 2)
        }
    }

    #[test]
    fn write_recovers_from_nacks() {
        let mut bus = FlakyBus {
            failures: 4,
            kind: libc::ENXIO,
            attempts: 0,
        };

        let started = std::time::Instant::now();
        write_with_retry(&mut bus, &[0u8; 8], 10, Duration::from_millis(1)).unwrap();

        assert_eq!(bus.attempts, 5);
        // Four NACKs, each followed by the guard delay.
        assert!(started.elapsed() >= Duration::from_millis(4));
    }

    #[test]
    fn all_nack_kinds_are_retried() {
        for kind in [libc::ENXIO, libc::ETIMEDOUT, libc::EREMOTEIO].iter() {
            let mut bus = FlakyBus {
                failures: 2,
                kind: *kind,
                attempts: 0,
            };
            let mut buf = [0u8; 4];
            read_with_retry(&mut bus, &mut buf, 5, Duration::from_micros(10)).unwrap();
            assert_eq!(bus.attempts, 3);
        }
    }

    #[test]
    fn exhausted_budget_times_out() {
        let mut bus = FlakyBus {
            failures: usize::MAX,
            kind: libc::ENXIO,
            attempts: 0,
        };

        let err = write_with_retry(&mut bus, &[0u8; 1], 3, Duration::from_micros(10));
        assert!(matches!(err, Err(Error::Timeout)));
        assert_eq!(bus.attempts, 3);
    }

    #[test]
    fn other_errors_fail_immediately() {
        let mut bus = FlakyBus {
            failures: usize::MAX,
            kind: libc::EIO,
            attempts: 0,
        };

        let mut buf = [0u8; 4];
        let err = read_with_retry(&mut bus, &mut buf, 10, Duration::from_micros(10));
        assert!(matches!(err, Err(Error::Io(_))));
        assert_eq!(bus.attempts, 1);
    }

    #[test]
    fn short_transfer_fails_immediately() {
        let mut buf = [0u8; 4];
        let err = read_with_retry(&mut ShortBus, &mut buf, 10, Duration::from_micros(10));
        assert!(matches!(err, Err(Error::ShortTransfer)));
    }

    #[test]
    fn kernel_spec_parsing() {
        assert_eq!(
            parse_kernel_spec("/dev/i2c-1:0x48").unwrap(),
            ("/dev/i2c-1", 0x48)
        );
        assert_eq!(
            parse_kernel_spec("/dev/i2c-0:32").unwrap(),
            ("/dev/i2c-0", 32)
        );
        assert!(parse_kernel_spec("/dev/i2c-1").is_err());
        assert!(parse_kernel_spec("/dev/i2c-1:0x1FF").is_err());
        assert!(parse_kernel_spec("/dev/i2c-1:banana").is_err());
    }
}
