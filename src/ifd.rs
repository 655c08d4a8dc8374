//! IFD handler entry points, as dlopened by the PC/SC daemon.
//!
//! # Description
//!
//! The PC/SC resource manager drives readers through a fixed set of
//! C symbols (IFD handler version 3). Every call carries a logical unit
//! number the daemon assigned when it created the channel; the functions
//! here translate those calls into [`crate::se::Session`] operations via
//! the LUN registry.
//!
//! The driver reports itself as not thread safe, so the daemon serializes
//! calls per reader. Secure Elements are soldered down: presence checks
//! always succeed and channel IDs (as opposed to device strings) are not
//! supported.

#![allow(non_snake_case)]

use std::ffi::CStr;
use std::os::raw::{c_char, c_long, c_ulong};
use std::slice;

use log::{debug, error};

use crate::se::registry;

/// pcsclite's `DWORD`.
pub type Dword = c_ulong;
/// pcsclite's `RESPONSECODE`.
pub type ResponseCode = c_long;

pub const IFD_SUCCESS: ResponseCode = 0;
pub const IFD_ERROR_TAG: ResponseCode = 600;
pub const IFD_ERROR_POWER_ACTION: ResponseCode = 608;
pub const IFD_COMMUNICATION_ERROR: ResponseCode = 612;
pub const IFD_NOT_SUPPORTED: ResponseCode = 614;
pub const IFD_NO_SUCH_DEVICE: ResponseCode = 617;

const SCARD_E_UNSUPPORTED_FEATURE: ResponseCode = 0x8010_0022_u32 as ResponseCode;

pub const IFD_POWER_UP: Dword = 500;
pub const IFD_POWER_DOWN: Dword = 501;
pub const IFD_RESET: Dword = 502;

pub const TAG_IFD_ATR: Dword = 0x0303;
pub const TAG_IFD_SLOT_THREAD_SAFE: Dword = 0x0FAC;
pub const TAG_IFD_THREAD_SAFE: Dword = 0x0FAD;
pub const TAG_IFD_SLOTS_NUMBER: Dword = 0x0FAE;
pub const TAG_IFD_SIMULTANEOUS_ACCESS: Dword = 0x0FAF;

/// Protocol control information passed along with a transmission.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ScardIoHeader {
    pub protocol: Dword,
    pub length: Dword,
}

#[no_mangle]
pub extern "C" fn IFDHCreateChannelByName(Lun: Dword, DeviceName: *const c_char) -> ResponseCode {
    let lun = Lun as u64;

    if registry::exists(lun) {
        error!("Lun {:#x} already open!", lun);
        return IFD_NO_SUCH_DEVICE;
    }

    if DeviceName.is_null() {
        error!("No device name given!");
        return IFD_NO_SUCH_DEVICE;
    }

    let config = match unsafe { CStr::from_ptr(DeviceName) }.to_str() {
        Ok(config) => config,
        Err(_) => {
            error!("Device name is not valid UTF-8!");
            return IFD_NO_SUCH_DEVICE;
        }
    };

    match registry::open(lun, config) {
        Ok(()) => IFD_SUCCESS,
        Err(e) => {
            error!("Could not create SE: {}", e);
            IFD_NO_SUCH_DEVICE
        }
    }
}

#[no_mangle]
pub extern "C" fn IFDHCreateChannel(Lun: Dword, Channel: Dword) -> ResponseCode {
    let _ = (Lun, Channel);

    // No support for channel IDs.
    IFD_NO_SUCH_DEVICE
}

#[no_mangle]
pub extern "C" fn IFDHCloseChannel(Lun: Dword) -> ResponseCode {
    let lun = Lun as u64;

    if registry::close(lun) {
        IFD_SUCCESS
    } else {
        error!("Lun {:#x} not open!", lun);
        IFD_NO_SUCH_DEVICE
    }
}

#[no_mangle]
pub extern "C" fn IFDHGetCapabilities(
    Lun: Dword,
    Tag: Dword,
    Length: *mut Dword,
    Value: *mut u8,
) -> ResponseCode {
    let lun = Lun as u64;

    if !registry::exists(lun) {
        error!("Lun {:#x} not open!", lun);
        return IFD_NO_SUCH_DEVICE;
    }

    if Length.is_null() || Value.is_null() {
        return IFD_COMMUNICATION_ERROR;
    }

    match Tag {
        TAG_IFD_ATR => {
            let buf = unsafe { slice::from_raw_parts_mut(Value, *Length as usize) };

            match registry::with_session(lun, |dev| dev.get_atr(buf)) {
                Some(Ok(len)) => {
                    unsafe { *Length = len as Dword };
                    IFD_SUCCESS
                }
                Some(Err(e)) => {
                    error!("Could not get ATR: {}", e);
                    IFD_COMMUNICATION_ERROR
                }
                None => IFD_NO_SUCH_DEVICE,
            }
        }
        TAG_IFD_SIMULTANEOUS_ACCESS => {
            unsafe {
                *Value = registry::MAX_SE_DEVICES as u8;
                *Length = 1;
            }
            IFD_SUCCESS
        }
        TAG_IFD_THREAD_SAFE => {
            unsafe {
                *Value = 0;
                *Length = 1;
            }
            IFD_SUCCESS
        }
        TAG_IFD_SLOTS_NUMBER => {
            unsafe {
                *Value = 1;
                *Length = 1;
            }
            IFD_SUCCESS
        }
        TAG_IFD_SLOT_THREAD_SAFE => {
            unsafe {
                *Value = 0;
                *Length = 1;
            }
            IFD_SUCCESS
        }
        _ => IFD_ERROR_TAG,
    }
}

#[no_mangle]
pub extern "C" fn IFDHSetCapabilities(
    Lun: Dword,
    Tag: Dword,
    Length: Dword,
    Value: *mut u8,
) -> ResponseCode {
    let _ = (Lun, Tag, Length, Value);

    IFD_ERROR_TAG
}

#[no_mangle]
pub extern "C" fn IFDHSetProtocolParameters(
    Lun: Dword,
    Protocol: Dword,
    Flags: u8,
    PTS1: u8,
    PTS2: u8,
    PTS3: u8,
) -> ResponseCode {
    let _ = (Lun, Protocol, Flags, PTS1, PTS2, PTS3);

    IFD_NOT_SUPPORTED
}

#[no_mangle]
pub extern "C" fn IFDHPowerICC(
    Lun: Dword,
    Action: Dword,
    Atr: *mut u8,
    AtrLength: *mut Dword,
) -> ResponseCode {
    let lun = Lun as u64;

    if Atr.is_null() || AtrLength.is_null() {
        return IFD_COMMUNICATION_ERROR;
    }

    let atr_buf = unsafe { slice::from_raw_parts_mut(Atr, *AtrLength as usize) };

    let outcome = registry::with_session(lun, |dev| match Action {
        IFD_POWER_UP => {
            if dev.power_up().is_err() {
                return IFD_ERROR_POWER_ACTION;
            }
            match dev.get_atr(atr_buf) {
                Ok(len) => {
                    unsafe { *AtrLength = len as Dword };
                    IFD_SUCCESS
                }
                Err(_) => IFD_COMMUNICATION_ERROR,
            }
        }
        IFD_POWER_DOWN => {
            if dev.power_down().is_err() {
                return IFD_ERROR_POWER_ACTION;
            }
            for byte in atr_buf.iter_mut() {
                *byte = 0;
            }
            unsafe { *AtrLength = 0 };
            IFD_SUCCESS
        }
        IFD_RESET => {
            if dev.warm_reset().is_err() {
                return IFD_ERROR_POWER_ACTION;
            }
            match dev.get_atr(atr_buf) {
                Ok(len) => {
                    unsafe { *AtrLength = len as Dword };
                    IFD_SUCCESS
                }
                Err(_) => IFD_COMMUNICATION_ERROR,
            }
        }
        _ => IFD_NOT_SUPPORTED,
    });

    match outcome {
        Some(code) => code,
        None => {
            error!("Lun {:#x} not open!", lun);
            IFD_NO_SUCH_DEVICE
        }
    }
}

#[no_mangle]
pub extern "C" fn IFDHTransmitToICC(
    Lun: Dword,
    SendPci: ScardIoHeader,
    TxBuffer: *const u8,
    TxLength: Dword,
    RxBuffer: *mut u8,
    RxLength: *mut Dword,
    RecvPci: *mut ScardIoHeader,
) -> ResponseCode {
    let lun = Lun as u64;

    if !registry::exists(lun) {
        error!("Lun {:#x} not open!", lun);
        return IFD_NO_SUCH_DEVICE;
    }

    if TxBuffer.is_null() || RxBuffer.is_null() || RxLength.is_null() {
        return IFD_COMMUNICATION_ERROR;
    }

    if !RecvPci.is_null() {
        unsafe { *RecvPci = SendPci };
    }

    let tx = unsafe { slice::from_raw_parts(TxBuffer, TxLength as usize) };
    let rx = unsafe { slice::from_raw_parts_mut(RxBuffer, *RxLength as usize) };

    match registry::with_session(lun, |dev| dev.xfer(tx, rx)) {
        Some(Ok(len)) => {
            unsafe { *RxLength = len as Dword };
            IFD_SUCCESS
        }
        Some(Err(e)) => {
            error!("APDU exchange failed: {}", e);
            IFD_COMMUNICATION_ERROR
        }
        None => IFD_NO_SUCH_DEVICE,
    }
}

#[no_mangle]
pub extern "C" fn IFDHICCPresence(Lun: Dword) -> ResponseCode {
    let lun = Lun as u64;

    if !registry::exists(lun) {
        error!("Lun {:#x} not open!", lun);
        return IFD_NO_SUCH_DEVICE;
    }

    debug!("SE on lun {:#x} is always present", lun);

    // A SE cannot be removed.
    IFD_SUCCESS
}

#[no_mangle]
pub extern "C" fn IFDHControl(
    Lun: Dword,
    dwControlCode: Dword,
    TxBuffer: *mut u8,
    TxLength: Dword,
    RxBuffer: *mut u8,
    RxLength: Dword,
    pdwBytesReturned: *mut Dword,
) -> ResponseCode {
    let _ = (Lun, dwControlCode, TxBuffer, TxLength, RxBuffer, RxLength);

    if !pdwBytesReturned.is_null() {
        unsafe { *pdwBytesReturned = 0 };
    }

    SCARD_E_UNSUPPORTED_FEATURE
}
