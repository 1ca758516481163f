//! Claiming nmethods during root marking.
//!
//! While the world is stopped, several collector workers may reach the same
//! nmethod, some needing only its weak roots and some its strong roots.
//! Each nmethod must be processed once, and a strong visit must never be
//! lost to a weak one running at the same time. The protocol runs over one
//! link word per nmethod:
//!
//! ```plain
//! unclaimed (0)
//!   |-- weak claim -------> self | WEAK_REQUEST
//!   |                         |-- finished ------> next | WEAK_DONE
//!   |                         |                       `-- strong --> next | STRONG_DONE
//!   |                         `-- strong arrives -> self | STRONG_REQUEST
//!   |                                                 `-- finished -> next | STRONG_DONE
//!   `-- strong claim -----> self | STRONG_DONE -> next | STRONG_DONE
//! ```
//!
//! `next` threads every claimed nmethod onto a list rooted in the code
//! cache; the last element links to itself. Being on the list holds a
//! strong reference, released by [`CodeCache::oops_do_marking_epilogue`].

use crate::code_cache::CodeCache;
use crate::nmethod::NMethod;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::Ordering;

const WEAK_REQUEST: usize = 0;
const WEAK_DONE: usize = 1;
const STRONG_REQUEST: usize = 2;
const STRONG_DONE: usize = 3;
const TAG_MASK: usize = 0b11;

fn mark_link(nm: *const NMethod, tag: usize) -> usize {
    debug_assert_eq!(nm as usize & TAG_MASK, 0);
    nm as usize | tag
}

fn extract_nmethod(link: usize) -> *const NMethod {
    (link & !TAG_MASK) as *const NMethod
}

fn extract_state(link: usize) -> usize {
    link & TAG_MASK
}

/// Where an nmethod is in the claiming protocol.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OopsDoMarkState {
    /// Claimed for weak processing, which has not finished.
    WeakRequest,
    /// Weakly processed.
    WeakDone,
    /// Being weakly processed; strong processing must follow.
    StrongRequest,
    /// Strongly processed, or claimed for it.
    StrongDone,
}

/// The work a collector worker does on a claimed nmethod.
pub trait OopsDoProcessor {
    /// Processes the roots every visit needs.
    fn do_regular_processing(&mut self, nm: &NMethod);

    /// Processes what only a strong visit needs, after
    /// [`OopsDoProcessor::do_regular_processing`] already ran.
    fn do_remaining_strong_processing(&mut self, nm: &NMethod);
}

impl NMethod {
    fn self_ptr(&self) -> *const NMethod {
        self
    }

    fn log_oops_do_change(&self, change: &str) {
        log::trace!(target: "gc::nmethod", "{self}: oops_do, {change}");
    }

    /// Current claim state, `None` when unclaimed in this marking.
    pub fn oops_do_mark_state(&self) -> Option<OopsDoMarkState> {
        let link = self.oops_do_mark_link.load(Ordering::Acquire);
        if link == 0 {
            return None;
        }
        Some(match extract_state(link) {
            WEAK_REQUEST => OopsDoMarkState::WeakRequest,
            WEAK_DONE => OopsDoMarkState::WeakDone,
            STRONG_REQUEST => OopsDoMarkState::StrongRequest,
            _ => OopsDoMarkState::StrongDone,
        })
    }

    /// Claims the nmethod for a visit with no strong part. Returns whether
    /// this caller won the claim.
    pub fn oops_do_try_claim(self: &Arc<Self>, cc: &CodeCache) -> bool {
        if !self.oops_do_try_claim_weak_request() {
            return false;
        }
        let old_head = self.oops_do_try_add_to_list_as_weak_done(cc);
        assert!(
            old_head.is_none(),
            "{self}: plain claim raced with a strong request"
        );
        true
    }

    /// Processes the weak roots unless another worker claimed the nmethod.
    /// If a strong visit arrives meanwhile, finishes the strong part too.
    pub fn oops_do_process_weak(self: &Arc<Self>, cc: &CodeCache, p: &mut dyn OopsDoProcessor) {
        if !self.oops_do_try_claim_weak_request() {
            self.log_oops_do_change("mark weak request fail");
            return;
        }

        p.do_regular_processing(self);

        let Some(old_head) = self.oops_do_try_add_to_list_as_weak_done(cc) else {
            return;
        };
        // A strong visit asked for the rest while we were busy.
        debug_assert_eq!(
            extract_state(self.oops_do_mark_link.load(Ordering::Acquire)),
            STRONG_REQUEST
        );
        self.log_oops_do_change("mark weak request -> mark strong done");
        self.oops_do_set_strong_done(old_head);
        p.do_remaining_strong_processing(self);
    }

    /// Makes sure the strong roots get processed exactly once, either here
    /// or by the worker currently doing the weak part.
    pub fn oops_do_process_strong(self: &Arc<Self>, cc: &CodeCache, p: &mut dyn OopsDoProcessor) {
        let mut next = match self.oops_do_try_claim_strong_done() {
            Ok(()) => {
                p.do_regular_processing(self);
                self.oops_do_add_to_list_as_strong_done(cc);
                return;
            }
            Err(next) => next,
        };

        if extract_state(next) == WEAK_REQUEST {
            match self.oops_do_try_add_strong_request(next) {
                // The weak worker finishes for us.
                Ok(()) => return,
                Err(found) => next = found,
            }
        }
        if matches!(extract_state(next), STRONG_REQUEST | STRONG_DONE) {
            return;
        }
        if self.oops_do_try_claim_weak_done_as_strong_done(next) {
            p.do_remaining_strong_processing(self);
        }
    }

    fn oops_do_try_claim_weak_request(&self) -> bool {
        let claimed = self.oops_do_mark_link.load(Ordering::Acquire) == 0
            && self
                .oops_do_mark_link
                .compare_exchange(
                    0,
                    mark_link(self.self_ptr(), WEAK_REQUEST),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok();
        if claimed {
            self.log_oops_do_change("mark weak request");
        }
        claimed
    }

    fn oops_do_try_claim_strong_done(&self) -> Result<(), usize> {
        self.oops_do_mark_link
            .compare_exchange(
                0,
                mark_link(self.self_ptr(), STRONG_DONE),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| self.log_oops_do_change("mark strong done"))
    }

    fn oops_do_try_add_strong_request(&self, next: usize) -> Result<(), usize> {
        debug_assert_eq!(next, mark_link(self.self_ptr(), WEAK_REQUEST));
        self.oops_do_mark_link
            .compare_exchange(
                next,
                mark_link(self.self_ptr(), STRONG_REQUEST),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| self.log_oops_do_change("mark strong request"))
    }

    fn oops_do_try_claim_weak_done_as_strong_done(&self, next: usize) -> bool {
        debug_assert_eq!(extract_state(next), WEAK_DONE);
        let claimed = self
            .oops_do_mark_link
            .compare_exchange(
                next,
                mark_link(extract_nmethod(next), STRONG_DONE),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if claimed {
            self.log_oops_do_change("mark weak done -> mark strong done");
        }
        claimed
    }

    fn oops_do_set_strong_done(&self, old_head: *const NMethod) {
        self.oops_do_mark_link
            .store(mark_link(old_head, STRONG_DONE), Ordering::Release);
    }

    /// Pushes this nmethod on the marked list and returns the element it
    /// should link to.
    fn oops_do_push_on_list(self: &Arc<Self>, cc: &CodeCache) -> *const NMethod {
        let raw = Arc::into_raw(Arc::clone(self)).cast_mut();
        let old_head = cc.oops_do_mark_nmethods().swap(raw, Ordering::AcqRel);
        if old_head.is_null() {
            raw
        } else {
            old_head
        }
    }

    /// Returns `Some(old_head)` if a strong request came in meanwhile; the
    /// caller then owes the strong part.
    fn oops_do_try_add_to_list_as_weak_done(
        self: &Arc<Self>,
        cc: &CodeCache,
    ) -> Option<*const NMethod> {
        debug_assert!(matches!(
            extract_state(self.oops_do_mark_link.load(Ordering::Acquire)),
            WEAK_REQUEST | STRONG_REQUEST
        ));
        let old_head = self.oops_do_push_on_list(cc);
        match self.oops_do_mark_link.compare_exchange(
            mark_link(self.self_ptr(), WEAK_REQUEST),
            mark_link(old_head, WEAK_DONE),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                self.log_oops_do_change("mark weak done");
                None
            }
            Err(_) => {
                self.log_oops_do_change("mark weak done fail");
                Some(old_head)
            }
        }
    }

    fn oops_do_add_to_list_as_strong_done(self: &Arc<Self>, cc: &CodeCache) {
        debug_assert_eq!(
            self.oops_do_mark_link.load(Ordering::Acquire),
            mark_link(self.self_ptr(), STRONG_DONE)
        );
        let old_head = self.oops_do_push_on_list(cc);
        self.oops_do_set_strong_done(old_head);
    }
}

impl CodeCache {
    /// Starts a root-marking pass.
    pub fn oops_do_marking_prologue(&self) {
        log::trace!(target: "gc::nmethod", "oops_do_marking_prologue");
        debug_assert!(
            self.oops_do_mark_nmethods()
                .load(Ordering::Acquire)
                .is_null(),
            "previous marking pass was not closed"
        );
    }

    /// Ends a root-marking pass: unclaims every nmethod claimed in it and
    /// drops the list's references to them.
    ///
    /// # Safety
    ///
    /// No worker may still be running the claiming protocol; every claim
    /// made in this pass must have completed.
    pub unsafe fn oops_do_marking_epilogue(&self) {
        let mut next = self
            .oops_do_mark_nmethods()
            .swap(ptr::null_mut(), Ordering::AcqRel)
            .cast_const();
        let mut unmarked = 0usize;
        while !next.is_null() {
            let cur = next;
            // SAFETY: every list element was pushed with `Arc::into_raw`
            // exactly once and is popped here exactly once.
            let nm = unsafe { Arc::from_raw(cur) };
            let link = nm.oops_do_mark_link.swap(0, Ordering::AcqRel);
            debug_assert!(
                matches!(extract_state(link), WEAK_DONE | STRONG_DONE),
                "{nm}: claim still in progress at epilogue"
            );
            next = extract_nmethod(link);
            nm.log_oops_do_change("unmark");
            drop(nm);
            unmarked += 1;
            if cur == next {
                break;
            }
        }
        log::trace!(
            target: "gc::nmethod",
            "oops_do_marking_epilogue: {unmarked} nmethods unmarked"
        );
    }
}
