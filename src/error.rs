//! Error kinds shared by all layers of the driver.

use std::fmt;
use std::io;

/// A specialized result type for Secure Element operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that may occur while opening or driving a Secure Element.
#[derive(Debug)]
pub enum Error {
    /// The configuration string is missing, malformed, or names an
    /// unknown driver or bus provider.
    NotConfigured,
    /// A byte I/O handle (bus device, GPIO line) could not be opened.
    BusOpenFailed,
    /// The retry budget was exhausted, or a retransmitted block failed
    /// a second time.
    Timeout,
    /// The bus transferred fewer bytes than requested without reporting
    /// an error.
    ShortTransfer,
    /// A malformed or unexpected frame was received: CRC mismatch, bad
    /// node address, unexpected PCB, oversized length field, or a raw
    /// ATR that cannot be parsed.
    ProtocolError,
    /// The caller-provided buffer cannot hold the response.
    BufferTooSmall,
    /// The requested operation is not offered by this driver.
    NotSupported,
    /// An unclassified I/O error reported by the operating system.
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::NotConfigured => write!(f, "invalid or missing configuration"),
            Error::BusOpenFailed => write!(f, "could not open bus device"),
            Error::Timeout => write!(f, "device did not respond in time"),
            Error::ShortTransfer => write!(f, "short transfer on bus"),
            Error::ProtocolError => write!(f, "protocol violation"),
            Error::BufferTooSmall => write!(f, "buffer too small for response"),
            Error::NotSupported => write!(f, "operation not supported"),
            Error::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}
