//! Deciding which nmethods die in an unloading cycle, and retiring them.
//!
//! Whether an nmethod is unloading is computed at most once per cycle and
//! memoized in a byte that packs the cycle with the answer:
//!
//! ```plain
//! 00000CCU   CC: unloading cycle (1..=3)   U: is unloading
//! ```
//!
//! The first query of a cycle asks the code cache's [`IsUnloadingBehaviour`]
//! and publishes the answer with one compare-and-swap; every thread then
//! agrees on it even when the cold heuristic could have gone either way.
//!
//! Unloading nmethods are unlinked during the cycle and handed to the
//! [`ClassUnloadingContext`], which frees them once nothing can reach them.

use crate::code_cache::CodeCache;
use crate::frame::{NON_OOP_WORD, Oop, OopClosure};
use crate::nmethod::NMethod;
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const IS_UNLOADING_MASK: u8 = 1;
const UNLOADING_CYCLE_SHIFT: u8 = 1;
const UNLOADING_CYCLE_MASK: u8 = 0b110;

fn state_is_unloading(state: u8) -> bool {
    state & IS_UNLOADING_MASK != 0
}

fn state_unloading_cycle(state: u8) -> u8 {
    (state & UNLOADING_CYCLE_MASK) >> UNLOADING_CYCLE_SHIFT
}

fn make_state(is_unloading: bool, cycle: u8) -> u8 {
    debug_assert!(cycle <= 3, "unloading cycle {cycle} does not fit");
    (cycle << UNLOADING_CYCLE_SHIFT) | u8::from(is_unloading)
}

/// The policy deciding whether an nmethod dies in the current cycle.
pub trait IsUnloadingBehaviour: Send + Sync {
    /// Whether any object the nmethod refers to is dead.
    fn has_dead_oop(&self, cc: &CodeCache, nm: &NMethod) -> bool;

    /// Whether the nmethod is unused enough to drop even though everything
    /// it refers to is alive. Defaults to [`NMethod::is_cold`].
    fn is_cold(&self, cc: &CodeCache, nm: &NMethod) -> bool {
        nm.is_cold(cc)
    }

    /// Whether the nmethod should be unloaded.
    fn is_unloading(&self, cc: &CodeCache, nm: &NMethod) -> bool {
        self.has_dead_oop(cc, nm) || self.is_cold(cc, nm)
    }
}

type IsAlive = dyn Fn(Oop) -> bool + Send + Sync;

/// Finds dead oops with a collector-provided liveness predicate.
pub struct ClosureIsUnloadingBehaviour {
    is_alive: Box<IsAlive>,
}

impl ClosureIsUnloadingBehaviour {
    /// Uses `is_alive` to test every non-null oop of an nmethod.
    pub fn new(is_alive: impl Fn(Oop) -> bool + Send + Sync + 'static) -> Self {
        ClosureIsUnloadingBehaviour {
            is_alive: Box::new(is_alive),
        }
    }

    /// A behaviour under which every object is alive; only the cold
    /// heuristic unloads anything.
    pub fn always_alive() -> Self {
        ClosureIsUnloadingBehaviour::new(|_| true)
    }
}

impl fmt::Debug for ClosureIsUnloadingBehaviour {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClosureIsUnloadingBehaviour")
            .finish_non_exhaustive()
    }
}

struct FindDeadOop<'a> {
    is_alive: &'a IsAlive,
    cc: &'a CodeCache,
    found: bool,
}

impl FindDeadOop<'_> {
    fn check(&mut self, value: Oop) {
        if value != 0 && value != NON_OOP_WORD && !(self.is_alive)(value) {
            self.found = true;
        }
    }
}

impl OopClosure for FindDeadOop<'_> {
    fn do_oop(&mut self, p: &AtomicUsize) {
        self.check(p.load(Ordering::Relaxed));
    }

    fn do_narrow_oop(&mut self, p: &AtomicU32) {
        let value = self.cc.compressed_oops().decode(p.load(Ordering::Relaxed));
        self.check(value);
    }
}

impl IsUnloadingBehaviour for ClosureIsUnloadingBehaviour {
    fn has_dead_oop(&self, cc: &CodeCache, nm: &NMethod) -> bool {
        let mut closure = FindDeadOop {
            is_alive: &*self.is_alive,
            cc,
            found: false,
        };
        nm.oops_do(&mut closure, true);
        closure.found
    }
}

/// Nmethods unlinked in the current cycle, waiting to be freed.
#[derive(Debug, Default)]
pub struct ClassUnloadingContext {
    unlinked: Mutex<Vec<Arc<NMethod>>>,
}

impl ClassUnloadingContext {
    /// An empty context.
    pub fn new() -> ClassUnloadingContext {
        ClassUnloadingContext::default()
    }

    pub(crate) fn register_unlinked_nmethod(&self, nm: Arc<NMethod>) {
        self.unlinked
            .lock()
            .expect("unlinked nmethods lock got poisoned")
            .push(nm);
    }

    /// Number of nmethods waiting to be freed.
    pub fn unlinked_count(&self) -> usize {
        self.unlinked
            .lock()
            .expect("unlinked nmethods lock got poisoned")
            .len()
    }

    /// Removes every waiting nmethod from the code cache and frees it.
    ///
    /// # Panics
    ///
    /// Panics if anything outside the code cache still holds one of them.
    pub fn purge_nmethods(&self, cc: &CodeCache) -> usize {
        let unlinked = mem::take(
            &mut *self
                .unlinked
                .lock()
                .expect("unlinked nmethods lock got poisoned"),
        );
        let count = unlinked.len();
        for nm in unlinked {
            cc.unregister(&nm);
            match Arc::try_unwrap(nm) {
                Ok(nm) => nm.purge(cc),
                Err(nm) => panic!(
                    "{nm}: still referenced {} times at purge",
                    Arc::strong_count(&nm) - 1
                ),
            }
        }
        count
    }
}

impl NMethod {
    /// Whether this nmethod dies in the current unloading cycle.
    pub fn is_unloading(&self, cc: &CodeCache) -> bool {
        let state = self.is_unloading_state.load(Ordering::Acquire);
        if state_is_unloading(state) {
            return true;
        }
        let current_cycle = cc.unloading_cycle();
        if state_unloading_cycle(state) == current_cycle {
            return false;
        }

        let is_unloading = cc.unloading_behaviour().is_unloading(cc, self);
        let new_state = make_state(is_unloading, current_cycle);

        // The cold heuristic may answer differently on different threads;
        // the first published answer wins.
        match self.is_unloading_state.compare_exchange(
            state,
            new_state,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                if is_unloading {
                    log::debug!(target: "gc::nmethod", "{self} is unloading");
                }
                is_unloading
            }
            Err(found) => state_is_unloading(found),
        }
    }

    /// Forgets any unloading decision; the nmethod counts as live for the
    /// current cycle.
    pub fn clear_unloading_state(&self, cc: &CodeCache) {
        let state = make_state(false, cc.unloading_cycle());
        self.is_unloading_state.store(state, Ordering::Release);
    }

    /// Whether the nmethod is unused enough to drop although everything it
    /// refers to is alive.
    pub fn is_cold(&self, cc: &CodeCache) -> bool {
        let tunables = cc.tunables();
        if !tunables.method_flushing
            || cc.metaspace().is_native(self.method())
            || self.is_not_installed()
        {
            return false;
        }
        if !self.is_maybe_on_stack(cc) && self.is_not_entrant() {
            return true;
        }
        // Without entry barriers the epochs say nothing about stack
        // presence.
        if !tunables.entry_barriers || !tunables.use_code_cache_flushing {
            return false;
        }
        cc.previous_completed_gc_marking_cycle()
            > self.gc_epoch() + 2 * cc.cold_gc_count()
    }

    /// Runs the end of an unloading cycle for this nmethod: unlinks it if
    /// it is unloading, otherwise cleans its caches and disarms it.
    pub fn do_unloading(self: &Arc<Self>, cc: &CodeCache, unloading_occurred: bool) {
        if self.is_unloading(cc) {
            self.unlink(cc);
        } else {
            self.unload_nmethod_caches(cc, unloading_occurred);
            self.disarm_entry_barrier(cc);
        }
    }

    /// Whether [`NMethod::unlink`] ran.
    pub fn is_unlinked(&self) -> bool {
        self.unlinked.load(Ordering::Acquire)
    }

    /// Detaches an unloading nmethod from everything that could reach it
    /// and hands it to the code cache's unloading context. Only the first
    /// call does anything.
    pub fn unlink(self: &Arc<Self>, cc: &CodeCache) {
        if self.unlinked.swap(true, Ordering::AcqRel) {
            return;
        }
        self.flush_dependencies(cc);
        self.unlink_from_method(cc);
        if self.is_osr_method() {
            self.invalidate_osr_method(cc);
        }
        self.invalidate_nmethod_mirror(cc);
        log::debug!(target: "codecache", "unlinked {self}");
        cc.unloading_context()
            .register_unlinked_nmethod(Arc::clone(self));
    }

    /// Frees the nmethod and returns its space to the code cache.
    pub(crate) fn purge(self, cc: &CodeCache) {
        cc.release_capacity(self.total_size());
        log::debug!(
            target: "codecache",
            "flushing {}{self}: {} bytes, {} bytes free",
            if self.is_osr_method() { "osr " } else { "" },
            self.total_size(),
            cc.unallocated_capacity()
        );
        // Dropping frees the exception cache chain and every table.
        drop(self);
    }
}
