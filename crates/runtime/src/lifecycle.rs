//! The nmethod state machine.
//!
//! States only ever move forward: an nmethod is created not installed,
//! becomes in use once it is linked into its method, and is made not
//! entrant when it is superseded or deoptimized. Not entrant is final.

use crate::code_cache::CodeCache;
use crate::metaspace::NMethodId;
use crate::nmethod::{CompilerKind, NMethod};
use crate::safepoint::NoSafepointVerifier;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// Lifecycle state of an nmethod, in transition order.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum NMethodState {
    /// Created but not yet reachable from its method.
    NotInstalled = 0,
    /// Reachable and callable.
    InUse = 1,
    /// No new activations may enter; existing ones may still run.
    NotEntrant = 2,
}

impl NMethodState {
    fn from_u8(raw: u8) -> NMethodState {
        match raw {
            0 => NMethodState::NotInstalled,
            1 => NMethodState::InUse,
            2 => NMethodState::NotEntrant,
            _ => unreachable!("invalid nmethod state {raw}"),
        }
    }
}

/// An object outside the code cache that refers to an nmethod, such as
/// the installed-code handle a compiler keeps.
///
/// Invalidation breaks the link: a not-entrant nmethod loses its entry
/// point but stays reachable so its activations can still be found; an
/// unloading one is forgotten entirely.
#[derive(Debug, Default)]
pub struct NMethodMirror {
    // NMethodId + 1, zero when unbound.
    nmethod: AtomicU32,
    entry_point: AtomicUsize,
}

impl NMethodMirror {
    /// An unbound mirror.
    pub fn new() -> NMethodMirror {
        NMethodMirror::default()
    }

    /// The nmethod this mirror refers to.
    pub fn nmethod(&self) -> Option<NMethodId> {
        self.nmethod
            .load(Ordering::Acquire)
            .checked_sub(1)
            .map(NMethodId::from_u32)
    }

    /// The entry point callers of the mirror use; zero once invalidated.
    pub fn entry_point(&self) -> usize {
        self.entry_point.load(Ordering::Acquire)
    }

    pub(crate) fn bind(&self, nm: &NMethod) {
        self.entry_point
            .store(nm.verified_entry_point(), Ordering::Release);
        self.nmethod.store(nm.id().as_u32() + 1, Ordering::Release);
    }
}

impl NMethod {
    /// Current state.
    pub fn state(&self) -> NMethodState {
        NMethodState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether the nmethod was never installed.
    pub fn is_not_installed(&self) -> bool {
        self.state() == NMethodState::NotInstalled
    }

    /// Whether the nmethod is installed and entrant.
    pub fn is_in_use(&self) -> bool {
        self.state() == NMethodState::InUse
    }

    /// Whether the nmethod was made not entrant.
    pub fn is_not_entrant(&self) -> bool {
        self.state() == NMethodState::NotEntrant
    }

    /// Moves to `new_state` unless the nmethod is already there or past
    /// it. Returns whether the state changed.
    pub fn try_transition(&self, new_state: NMethodState) -> bool {
        let old = self.state.fetch_max(new_state as u8, Ordering::AcqRel);
        old < new_state as u8
    }

    /// Marks a freshly installed nmethod usable.
    pub fn make_in_use(&self) -> bool {
        self.try_transition(NMethodState::InUse)
    }

    /// Stops new activations of this nmethod.
    ///
    /// Returns `false` if another thread already did, or if the nmethod is
    /// unloading (its entry barrier already refuses entry). The winning
    /// thread patches the entry, counts the decompile, logs the transition
    /// and unlinks the nmethod from its method.
    pub fn make_not_entrant(&self, cc: &CodeCache) -> bool {
        let _nsv = NoSafepointVerifier::new();

        if self.is_unloading(cc) {
            return false;
        }
        if self.is_not_entrant() {
            return false;
        }

        {
            let _guard = cc.lock_nmethod_state();
            if self.is_not_entrant() {
                return false;
            }

            if self.is_osr_method() {
                self.invalidate_osr_method(cc);
            } else {
                self.entry_barrier.make_not_entrant();
            }

            if cc.tunables().update_recompile_counts {
                self.inc_decompile_count(cc);
            }

            if !cc.tunables().entry_barriers {
                // Without barriers nothing records stack presence, so
                // assume the worst.
                self.mark_as_maybe_on_stack(cc);
            }

            let success = self.try_transition(NMethodState::NotEntrant);
            assert!(success, "{self}: lost the not-entrant transition under the lock");

            self.log_state_change(cc);
            self.unlink_from_method(cc);
        }

        self.invalidate_nmethod_mirror(cc);

        debug_assert!(
            !self.is_osr_method()
                || !cc
                    .metaspace()
                    .osr_nmethods(cc.metaspace().method_holder(self.method()))
                    .contains(&self.id()),
            "{self}: still registered as an OSR method"
        );
        true
    }

    fn log_state_change(&self, cc: &CodeCache) {
        if cc.tunables().log_compilation {
            log::info!(target: "codecache", "{self}: made not entrant");
        } else {
            log::debug!(target: "codecache", "{self}: made not entrant");
        }
    }

    fn inc_decompile_count(&self, cc: &CodeCache) {
        if matches!(self.compiler(), CompilerKind::C2 | CompilerKind::Jvmci) {
            cc.metaspace().inc_decompile_count(self.method());
        }
    }

    /// Clears the method's compiled entry if it is still this nmethod.
    pub(crate) fn unlink_from_method(&self, cc: &CodeCache) {
        if cc.metaspace().unlink_code(self.method(), self.id()) {
            log::trace!(target: "codecache", "{self}: unlinked from its method");
        }
    }

    /// Removes an OSR nmethod from its class's OSR list.
    pub(crate) fn invalidate_osr_method(&self, cc: &CodeCache) {
        debug_assert!(self.is_osr_method());
        let holder = cc.metaspace().method_holder(self.method());
        if cc.metaspace().remove_osr_nmethod(holder, self.id()) {
            log::trace!(target: "codecache", "{self}: removed from the OSR list of {holder}");
        }
    }

    /// Updates the external mirror, if any, to the current state.
    pub(crate) fn invalidate_nmethod_mirror(&self, cc: &CodeCache) {
        let Some(mirror) = &self.mirror else {
            return;
        };
        if mirror.nmethod() != Some(self.id()) {
            return;
        }
        if self.is_unloading(cc) {
            mirror.entry_point.store(0, Ordering::Release);
            mirror.nmethod.store(0, Ordering::Release);
        } else if self.is_not_entrant() {
            mirror.entry_point.store(0, Ordering::Release);
        }
    }

    /// Records that the nmethod may be on a stack during the current
    /// marking cycle.
    pub fn mark_as_maybe_on_stack(&self, cc: &CodeCache) {
        self.gc_epoch.store(cc.gc_epoch(), Ordering::Release);
    }

    /// Whether the nmethod was seen on a stack since the last completed
    /// marking cycle.
    pub fn is_maybe_on_stack(&self, cc: &CodeCache) -> bool {
        self.gc_epoch.load(Ordering::Acquire) >= cc.previous_completed_gc_marking_cycle()
    }

    /// The marking epoch in which the nmethod was last seen on a stack.
    pub fn gc_epoch(&self) -> u64 {
        self.gc_epoch.load(Ordering::Acquire)
    }
}
