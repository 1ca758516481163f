//! The nmethod entry barrier.
//!
//! Every nmethod carries a guard word that its entry compares against the
//! code cache's current "disarmed" value. Bumping that value arms every
//! nmethod at once; the first thread to enter an armed nmethod runs the
//! barrier, which records that the nmethod is on a stack in this marking
//! cycle and disarms it again. Making an nmethod not entrant sets a sticky
//! bit in the guard so the barrier refuses entry from then on.

use crate::code_cache::CodeCache;
use crate::nmethod::NMethod;
use std::sync::atomic::{AtomicU32, Ordering};

const NOT_ENTRANT: u32 = 1 << 31;
const VALUE_MASK: u32 = !NOT_ENTRANT;

/// Per-nmethod guard word.
#[derive(Debug)]
pub struct EntryBarrier {
    guard: AtomicU32,
}

impl Default for EntryBarrier {
    fn default() -> EntryBarrier {
        EntryBarrier::new()
    }
}

impl EntryBarrier {
    /// A barrier that is armed against every disarmed value.
    pub fn new() -> EntryBarrier {
        // The code cache never hands out zero as its disarmed value.
        EntryBarrier {
            guard: AtomicU32::new(0),
        }
    }

    /// The guard value, without the not-entrant bit.
    pub fn guard_value(&self) -> u32 {
        self.guard.load(Ordering::Acquire) & VALUE_MASK
    }

    /// Whether entry is refused for good.
    pub fn is_not_entrant(&self) -> bool {
        self.guard.load(Ordering::Acquire) & NOT_ENTRANT != 0
    }

    /// Whether entering runs the barrier slow path.
    pub fn is_armed(&self, disarmed_value: u32) -> bool {
        self.guard_value() != disarmed_value
    }

    fn set_guard_value(&self, value: u32) {
        debug_assert_eq!(value & NOT_ENTRANT, 0);
        let mut old = self.guard.load(Ordering::Relaxed);
        loop {
            let new = (old & NOT_ENTRANT) | value;
            match self
                .guard
                .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(found) => old = found,
            }
        }
    }

    pub(crate) fn disarm(&self, disarmed_value: u32) {
        self.set_guard_value(disarmed_value);
    }

    pub(crate) fn make_not_entrant(&self) {
        self.guard.fetch_or(NOT_ENTRANT, Ordering::AcqRel);
    }
}

impl NMethod {
    /// The entry barrier.
    pub fn entry_barrier(&self) -> &EntryBarrier {
        &self.entry_barrier
    }

    /// Runs what a thread entering this nmethod runs. Returns whether the
    /// thread may enter; otherwise it must re-resolve the call.
    pub fn run_entry_barrier(&self, cc: &CodeCache) -> bool {
        if self.entry_barrier.is_not_entrant() {
            return false;
        }
        if !cc.tunables().entry_barriers {
            return true;
        }
        let disarmed = cc.disarmed_guard_value();
        if !self.entry_barrier.is_armed(disarmed) {
            return true;
        }
        if self.is_unloading(cc) {
            log::trace!(target: "gc::nmethod", "{self}: entry refused, unloading");
            return false;
        }
        self.mark_as_maybe_on_stack(cc);
        self.entry_barrier.disarm(disarmed);
        true
    }

    /// Disarms the barrier against the current disarmed value.
    pub fn disarm_entry_barrier(&self, cc: &CodeCache) {
        if cc.tunables().entry_barriers {
            self.entry_barrier.disarm(cc.disarmed_guard_value());
        }
    }

    /// Whether the next entry runs the barrier slow path.
    pub fn is_entry_barrier_armed(&self, cc: &CodeCache) -> bool {
        cc.tunables().entry_barriers && self.entry_barrier.is_armed(cc.disarmed_guard_value())
    }
}
