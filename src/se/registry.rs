//! Process-wide table mapping host-assigned LUNs to open sessions.
//!
//! The IFD ABI carries no driver handle, so the table is a `static`. It
//! is guarded by a mutex: even though per-session I/O is strictly
//! serialized by the host, channel creation and teardown for distinct
//! LUNs may race.

use std::sync::Mutex;

use log::error;

use crate::error::{Error, Result};

use super::Session;

/// Maximum number of simultaneously open sessions.
pub const MAX_SE_DEVICES: usize = 16;

struct Slot {
    in_use: bool,
    lun: u64,
    session: Option<Box<dyn Session + Send>>,
}

struct Table {
    slots: [Slot; MAX_SE_DEVICES],
}

impl Table {
    const fn new() -> Self {
        const FREE: Slot = Slot {
            in_use: false,
            lun: 0,
            session: None,
        };

        Table {
            slots: [FREE; MAX_SE_DEVICES],
        }
    }

    fn lookup(&mut self, lun: u64) -> Option<&mut Slot> {
        self.slots.iter_mut().find(|s| s.in_use && s.lun == lun)
    }
}

static TABLE: Mutex<Table> = Mutex::new(Table::new());

/// Serializes tests touching the process-wide table.
#[cfg(test)]
pub(crate) static TEST_LOCK: Mutex<()> = Mutex::new(());

fn table() -> std::sync::MutexGuard<'static, Table> {
    // A poisoned table means another IFD call panicked; the slots
    // themselves are still consistent.
    TABLE.lock().unwrap_or_else(|e| e.into_inner())
}

/// Whether a session exists for `lun`.
pub fn exists(lun: u64) -> bool {
    table().lookup(lun).is_some()
}

/// Opens the session described by `config` and files it under `lun`.
pub fn open(lun: u64, config: &str) -> Result<()> {
    let session = super::open_session(config)?;
    insert(lun, session)
}

/// Files an open session under `lun` in the first free slot.
pub(crate) fn insert(lun: u64, session: Box<dyn Session + Send>) -> Result<()> {
    let mut table = table();

    match table.slots.iter_mut().find(|s| !s.in_use) {
        Some(slot) => {
            slot.in_use = true;
            slot.lun = lun;
            slot.session = Some(session);
            Ok(())
        }
        None => {
            error!("All {} reader slots are in use", MAX_SE_DEVICES);
            Err(Error::BusOpenFailed)
        }
    }
}

/// Runs `f` against the session registered for `lun`.
///
/// Returns `None` when no such session exists. The table stays locked
/// for the duration of `f`, which also serializes sessions against
/// concurrent teardown.
pub fn with_session<T>(lun: u64, f: impl FnOnce(&mut dyn Session) -> T) -> Option<T> {
    let mut table = table();
    let slot = table.lookup(lun)?;

    // In-use slots always hold a session.
    let session = slot.session.as_mut()?;
    Some(f(session.as_mut()))
}

/// Tears down the session registered for `lun` and frees its slot.
///
/// Returns whether a session was actually open. Closing an unknown or
/// already-closed LUN changes nothing.
pub fn close(lun: u64) -> bool {
    let mut table = table();

    match table.lookup(lun) {
        Some(slot) => {
            // Dropping the session closes its bus handles.
            slot.session = None;
            slot.in_use = false;
            slot.lun = 0;
            true
        }
        None => false,
    }
}
