//! Software breakpoint metadata, shared between the control thread and callers.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// A software breakpoint armed in the tracee.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct Breakpoint {
    /// Address of the replaced instruction byte.
    pub address: u64,

    /// Byte that was at `address` before the trap opcode was written.
    pub original: u8,

    /// Remove the breakpoint after its first hit, rather than re-arming it.
    pub once: bool,
}

/// Address-keyed table of armed breakpoints.
///
/// Only the control thread mutates the table, and only after the tracee memory has been
/// updated to match. Any thread may query it; the lock is never held across a ptrace call.
#[derive(Debug, Default)]
pub struct BreakpointTable {
    entries: Mutex<HashMap<u64, Breakpoint>>,
}

impl BreakpointTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Breakpoint>> {
        // Entries are plain data, so a poisoned map is still consistent.
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn insert(&self, breakpoint: Breakpoint) -> Option<Breakpoint> {
        self.lock().insert(breakpoint.address, breakpoint)
    }

    pub(crate) fn remove(&self, address: u64) -> Option<Breakpoint> {
        self.lock().remove(&address)
    }

    pub fn find(&self, address: u64) -> Option<Breakpoint> {
        self.lock().get(&address).copied()
    }

    /// Copy of the armed breakpoints, sorted by address.
    pub fn snapshot(&self) -> Vec<Breakpoint> {
        let mut breakpoints: Vec<_> = self.lock().values().copied().collect();
        breakpoints.sort_by_key(|bp| bp.address);
        breakpoints
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
