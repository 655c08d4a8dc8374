//! Session driver for Kerkey-style Secure Elements.
//!
//! # Description
//!
//! The Kerkey frames everything with a two-byte response header instead
//! of a block protocol: the host writes a command or APDU chunk in one
//! I²C write, then polls for a header whose top bit flags chaining and
//! whose second byte carries the length of the payload that follows.
//! A header of `chain=0, len=0` is a waiting-time extension; a header of
//! `chain=1, len=0` during a chained transmit tells the host to send the
//! next chunk.
//!
//! Two maintenance commands exist next to APDU traffic: `0x76` triggers
//! a warm reset and returns the ATR, `0x75` reports the device timeout
//! in milliseconds. That timeout doubles as the polling budget for all
//! later exchanges, since the device NACKs its address while busy.

use std::thread;
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use log::{debug, error};

use crate::error::{Error, Result};
use crate::gpio::GpioPin;
use crate::i2c::{self, I2cBus};

use super::Session;

const CMD_TIMEOUT: u8 = 0x75;
const CMD_ATR: u8 = 0x76;

/// Largest chunk the device accepts in a single write.
const FRAME_LENGTH_MAX: usize = 254;

/// Guard delay between polls of a busy device.
const GUARD_TIME: Duration = Duration::from_micros(1000);

/// Settling time around power transitions and warm resets.
const SETTLE_TIME: Duration = Duration::from_millis(200);

/// Pause granted for a waiting-time extension.
const WTX_TIME: Duration = Duration::from_millis(1);

/// Polling budget used until the device has advertised its own timeout.
const INITIAL_TIMEOUT_MS: usize = 10_000;

/// A session to a Kerkey-style SE.
pub struct Kerkey<B, G> {
    i2c: B,
    gpio: Option<G>,

    /// ATR captured by the last warm reset.
    atr: Vec<u8>,
    /// Device-advertised timeout, used as the retry budget in units of
    /// the guard delay.
    timeout_ms: usize,
}

impl<B: I2cBus, G: GpioPin> Kerkey<B, G> {
    /// Opens a session: power-cycles the chip, captures its ATR and
    /// negotiates the polling timeout.
    pub fn open(i2c: B, gpio: Option<G>) -> Result<Self> {
        let mut dev = Kerkey {
            i2c,
            gpio,
            atr: Vec::new(),
            timeout_ms: INITIAL_TIMEOUT_MS,
        };

        dev.gpio_disable().map_err(|e| {
            error!("Could not power down Kerkey!");
            e
        })?;
        thread::sleep(SETTLE_TIME);

        dev.gpio_enable().map_err(|e| {
            error!("Could not power up Kerkey!");
            e
        })?;
        thread::sleep(SETTLE_TIME);

        dev.warm_reset_dev().map_err(|e| {
            error!("Could not reset Kerkey!");
            e
        })?;

        dev.get_timeout().map_err(|e| {
            error!("Could not get timeout!");
            e
        })?;

        Ok(dev)
    }

    fn gpio_enable(&mut self) -> Result<()> {
        match self.gpio.as_mut() {
            Some(gpio) => gpio.enable(),
            None => Ok(()),
        }
    }

    fn gpio_disable(&mut self) -> Result<()> {
        match self.gpio.as_mut() {
            Some(gpio) => gpio.disable(),
            None => Ok(()),
        }
    }

    fn read_i2c(&mut self, buf: &mut [u8]) -> Result<()> {
        i2c::read_with_retry(&mut self.i2c, buf, self.timeout_ms, GUARD_TIME)
    }

    fn write_i2c(&mut self, buf: &[u8]) -> Result<()> {
        i2c::write_with_retry(&mut self.i2c, buf, self.timeout_ms, GUARD_TIME)
    }

    /// Reads one response header and splits it into the chain flag and
    /// the payload length.
    fn read_header(&mut self) -> Result<(bool, usize)> {
        let mut res = [0u8; 2];
        self.read_i2c(&mut res)?;

        let chain = res[0] & 0x80 != 0;
        // The chain bit lives in res[0]; the length is the low byte only.
        let len = usize::from((u16::from(res[0]) << 8 | u16::from(res[1])) & 0x00FF);

        Ok((chain, len))
    }

    /// Asks the device for its timeout and stores it as the new polling
    /// budget.
    fn get_timeout(&mut self) -> Result<()> {
        self.write_i2c(&[CMD_TIMEOUT])?;

        let (chain, len) = loop {
            let (chain, len) = self.read_header()?;
            if !chain && len == 0 {
                debug!("Received WTX");
                thread::sleep(WTX_TIME);
                continue;
            }
            break (chain, len);
        };

        if chain || len != 2 {
            error!("Could not get timeout");
            return Err(Error::ProtocolError);
        }

        let mut res = [0u8; 2];
        self.read_i2c(&mut res)?;
        self.timeout_ms = usize::from(BigEndian::read_u16(&res));

        debug!("Set card timeout to: {}", self.timeout_ms);

        Ok(())
    }

    /// Triggers a warm reset and caches the returned ATR.
    fn warm_reset_dev(&mut self) -> Result<()> {
        self.write_i2c(&[CMD_ATR])?;

        let (chain, len) = self.read_header()?;
        if chain || len == 0 {
            error!("Could not trigger warm reset!");
            return Err(Error::ProtocolError);
        }

        let mut atr = vec![0u8; len];
        self.read_i2c(&mut atr)?;
        self.atr = atr;

        // The reset behind CMD_ATR takes a while to complete.
        thread::sleep(SETTLE_TIME);

        Ok(())
    }
}

impl<B: I2cBus, G: GpioPin> Session for Kerkey<B, G> {
    fn get_atr(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < self.atr.len() {
            error!("Buffer size too small!");
            return Err(Error::BufferTooSmall);
        }

        buf[..self.atr.len()].copy_from_slice(&self.atr);
        Ok(self.atr.len())
    }

    fn power_up(&mut self) -> Result<()> {
        let ret = self.gpio_enable();
        thread::sleep(SETTLE_TIME);
        ret
    }

    fn power_down(&mut self) -> Result<()> {
        self.gpio_disable()
    }

    fn warm_reset(&mut self) -> Result<()> {
        self.warm_reset_dev()
    }

    fn xfer(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<usize> {
        let mut tx_off = 0;
        let mut tx_left = tx.len();
        let mut rx_off = 0;

        'send: loop {
            debug!("tx_left: {}", tx_left);

            let len = tx_left.min(FRAME_LENGTH_MAX);
            self.write_i2c(&tx[tx_off..tx_off + len])?;
            tx_off += len;
            tx_left -= len;

            loop {
                let (chain, len) = self.read_header()?;

                if !chain && len == 0 {
                    debug!("Received WTX");
                    thread::sleep(WTX_TIME);
                    continue;
                }

                if chain && len == 0 {
                    // Continuation token: the card wants the next chunk.
                    if tx_left != 0 {
                        continue 'send;
                    }
                    error!("Communication error!");
                    return Err(Error::ProtocolError);
                }

                if rx_off + len > rx.len() {
                    error!("Receive buffer too small!");
                    return Err(Error::BufferTooSmall);
                }

                self.read_i2c(&mut rx[rx_off..rx_off + len])?;
                rx_off += len;

                if !chain {
                    return Ok(rx_off);
                }
            }
        }
    }
}
