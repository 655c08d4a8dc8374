//! Scripted doubles for protocol and registry tests.

use std::collections::VecDeque;
use std::io;

use crate::error::{Error, Result};
use crate::i2c::I2cBus;

use super::Session;

/// A fake bus that replays a scripted byte stream for reads and records
/// every write.
///
/// Reads consume the stream in order, mirroring how a slave hands out
/// consecutive bytes of a frame regardless of how the host slices its
/// read transactions. A read past the end of the script panics, since it
/// means the driver under test asked for data the scenario never
/// provided.
pub struct MockBus {
    stream: VecDeque<u8>,
    /// Every buffer written by the driver, in order.
    pub writes: Vec<Vec<u8>>,
}

impl MockBus {
    pub fn new() -> Self {
        MockBus {
            stream: VecDeque::new(),
            writes: Vec::new(),
        }
    }

    /// Appends bytes to the read script.
    pub fn push_read(&mut self, bytes: &[u8]) {
        self.stream.extend(bytes.iter().copied());
    }
}

impl I2cBus for MockBus {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        for byte in buf.iter_mut() {
            *byte = self.stream.pop_front().expect("read past scripted data");
        }
        Ok(buf.len())
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writes.push(buf.to_vec());
        Ok(buf.len())
    }
}

/// A well-behaved session double: power operations succeed, the ATR is
/// whatever it was built with, and every APDU is answered with a bare
/// status word of 90 00.
pub struct FakeSession {
    atr: Vec<u8>,
}

impl FakeSession {
    pub fn new(atr: Vec<u8>) -> Self {
        FakeSession { atr }
    }
}

impl Session for FakeSession {
    fn get_atr(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < self.atr.len() {
            return Err(Error::BufferTooSmall);
        }

        buf[..self.atr.len()].copy_from_slice(&self.atr);
        Ok(self.atr.len())
    }

    fn power_up(&mut self) -> Result<()> {
        Ok(())
    }

    fn power_down(&mut self) -> Result<()> {
        Ok(())
    }

    fn warm_reset(&mut self) -> Result<()> {
        Ok(())
    }

    fn xfer(&mut self, _tx: &[u8], rx: &mut [u8]) -> Result<usize> {
        if rx.len() < 2 {
            return Err(Error::BufferTooSmall);
        }

        rx[..2].copy_from_slice(&[0x90, 0x00]);
        Ok(2)
    }
}
