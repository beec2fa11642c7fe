//! Flow identifiers
//!
//! Sender contexts register their flow id in a process-wide set for as long
//! as they are alive, so two active senders never share one.

use crate::error::{Result, RistError};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::OnceLock;

fn active() -> &'static Mutex<HashSet<u32>> {
    static ACTIVE: OnceLock<Mutex<HashSet<u32>>> = OnceLock::new();
    ACTIVE.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Random flow id; even and non-zero
pub fn flow_id_create() -> u32 {
    loop {
        let id = rand::random::<u32>() & !1;
        if id != 0 {
            return id;
        }
    }
}

/// Claim `id`, or a fresh random id when `id` is 0
pub(crate) fn register(id: u32) -> Result<u32> {
    let mut set = active().lock();
    if id != 0 {
        if !set.insert(id) {
            return Err(RistError::FlowIdInUse(id));
        }
        return Ok(id);
    }
    loop {
        let candidate = flow_id_create();
        if set.insert(candidate) {
            return Ok(candidate);
        }
    }
}

/// Move a registration from `old` to `new`
pub(crate) fn replace(old: u32, new: u32) -> Result<()> {
    if old == new {
        return Ok(());
    }
    let mut set = active().lock();
    if new == 0 || !set.insert(new) {
        return Err(RistError::FlowIdInUse(new));
    }
    set.remove(&old);
    Ok(())
}

pub(crate) fn release(id: u32) {
    active().lock().remove(&id);
}
