//! PC/SC IFD handler for I²C-attached Secure Element chips.
//!
//! # Description
//!
//! Embedded Secure Elements (SEs) are commonly wired to a host over a plain
//! I²C bus, with an optional GPIO controlling their reset or power line.
//! This crate exposes such chips as smart-card readers: it implements the
//! IFD handler entry points that a PC/SC resource manager dlopens, and maps
//! them onto per-chip driver sessions.
//!
//! Two device families are supported:
//!
//! - the NXP SE05x family, spoken to through a T=1 block protocol carried
//!   over I²C ([`se::se05x`]),
//! - Kerkey-style SEs, which use a simple length-prefixed command protocol
//!   ([`se::kerkey`]).
//!
//! The byte-level plumbing lives in [`i2c`] and [`gpio`], each offering a
//! small adapter trait with one back-end per supported kernel interface.
//! Sessions are looked up by the host-assigned LUN through the registry in
//! [`se`], and the C ABI surface is defined in [`ifd`].
//!
//! # Configuration
//!
//! A reader is described by a single device string of the form
//! `se:<driver>@i2c:<spec>[@gpio:<spec>]`, for example:
//!
//! ```text
//! se:se05x@i2c:kernel:/dev/i2c-1:0x48@gpio:kernel:0:n16
//! se:kerkey@i2c:kernel:/dev/i2c-0:0x20
//! ```
//!
//! Numbers accept decimal or `0x`-prefixed hexadecimal notation. An `n`
//! ahead of a GPIO line number marks the line as active-low.

#[macro_use]
extern crate bitflags;

#[macro_use]
extern crate enum_primitive;

#[macro_use]
extern crate static_assertions;

pub mod error;
pub mod gpio;
pub mod i2c;
pub mod ifd;
pub mod se;

mod utils;

pub use error::{Error, Result};
