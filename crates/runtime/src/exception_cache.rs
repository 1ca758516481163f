//! Per-nmethod cache of exception handler lookups.
//!
//! Each node maps one exception class to up to a fixed number of
//! `(throw pc, handler pc)` pairs. Nodes are only ever prepended, under the
//! code cache's exception-cache lock; readers walk the chain without any
//! lock. A node's pairs are published through its `count` with release
//! ordering, so a reader never looks at a slot that is not filled in.
//!
//! Nodes whose class was unloaded are unlinked by the cleaning pass and
//! handed to the code cache's purge list. They are freed only by
//! [`CodeCache::purge_exception_caches`], after every thread that might
//! still be reading them has passed a global synchronization point.

use crate::code_cache::CodeCache;
use crate::metaspace::KlassId;
use crate::nmethod::NMethod;
use crate::safepoint::NoSafepointVerifier;
use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

/// One node of an nmethod's exception cache.
pub struct ExceptionCache {
    exception_type: KlassId,
    pcs: Box<[AtomicUsize]>,
    handlers: Box<[AtomicUsize]>,
    count: AtomicUsize,
    next: AtomicPtr<ExceptionCache>,
    pub(crate) purge_list_next: AtomicPtr<ExceptionCache>,
}

impl ExceptionCache {
    fn new(exception_type: KlassId, capacity: usize, pc: usize, handler: usize) -> ExceptionCache {
        assert!(pc != 0 && handler != 0, "exception cache entries must be non-null");
        assert!(capacity > 0, "exception cache nodes need room for an entry");
        let ec = ExceptionCache {
            exception_type,
            pcs: (0..capacity).map(|_| AtomicUsize::new(0)).collect(),
            handlers: (0..capacity).map(|_| AtomicUsize::new(0)).collect(),
            count: AtomicUsize::new(0),
            next: AtomicPtr::new(ptr::null_mut()),
            purge_list_next: AtomicPtr::new(ptr::null_mut()),
        };
        let added = ec.add_address_and_handler(pc, handler);
        debug_assert!(added);
        ec
    }

    /// The exception class this node caches handlers for.
    pub fn exception_type(&self) -> KlassId {
        self.exception_type
    }

    /// Number of published pairs.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Number of pairs the node can hold.
    pub fn capacity(&self) -> usize {
        self.pcs.len()
    }

    /// The handler cached for an `exception` thrown at `pc`.
    pub fn match_exception(&self, exception: KlassId, pc: usize) -> Option<usize> {
        if exception == self.exception_type {
            self.test_address(pc)
        } else {
            None
        }
    }

    fn match_exception_with_space(&self, exception: KlassId) -> bool {
        exception == self.exception_type && self.count() < self.capacity()
    }

    fn test_address(&self, pc: usize) -> Option<usize> {
        let limit = self.count();
        (0..limit)
            .find(|&i| self.pcs[i].load(Ordering::Relaxed) == pc)
            .map(|i| self.handlers[i].load(Ordering::Relaxed))
    }

    // Only called with the exception-cache lock held, or before the node
    // is published.
    fn add_address_and_handler(&self, pc: usize, handler: usize) -> bool {
        if self.test_address(pc) == Some(handler) {
            return true;
        }
        let index = self.count.load(Ordering::Relaxed);
        if index < self.capacity() {
            self.pcs[index].store(pc, Ordering::Relaxed);
            self.handlers[index].store(handler, Ordering::Relaxed);
            self.count.store(index + 1, Ordering::Release);
            return true;
        }
        false
    }

    /// The next older node.
    pub fn next(&self) -> Option<&ExceptionCache> {
        // Nodes stay allocated until the purge that follows a global
        // synchronization point, which outlives any reader.
        unsafe { self.next.load(Ordering::Acquire).as_ref() }
    }

    fn next_ptr(&self) -> *mut ExceptionCache {
        self.next.load(Ordering::Acquire)
    }

    fn set_next(&self, ec: *mut ExceptionCache) {
        self.next.store(ec, Ordering::Release);
    }

    /// The `(pc, handler)` pairs published so far.
    pub fn entries(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        (0..self.count()).map(|i| {
            (
                self.pcs[i].load(Ordering::Relaxed),
                self.handlers[i].load(Ordering::Relaxed),
            )
        })
    }
}

impl fmt::Debug for ExceptionCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExceptionCache")
            .field("exception_type", &self.exception_type)
            .field("entries", &self.entries().collect::<Vec<_>>())
            .finish()
    }
}

impl NMethod {
    fn exception_cache_acquire(&self) -> *mut ExceptionCache {
        self.exception_cache.load(Ordering::Acquire)
    }

    /// The newest exception-cache node.
    pub fn exception_cache(&self) -> Option<&ExceptionCache> {
        unsafe { self.exception_cache_acquire().as_ref() }
    }

    /// Number of exception-cache nodes.
    pub fn exception_cache_len(&self) -> usize {
        let mut n = 0;
        let mut ec = self.exception_cache();
        while let Some(node) = ec {
            n += 1;
            ec = node.next();
        }
        n
    }

    /// The cached handler for an `exception` thrown at `pc`.
    ///
    /// Takes no lock, so a pair added concurrently may be missed; the
    /// caller then resolves the handler the slow way.
    pub fn handler_for_exception_and_pc(&self, exception: KlassId, pc: usize) -> Option<usize> {
        let mut ec = self.exception_cache();
        while let Some(node) = ec {
            if let Some(handler) = node.match_exception(exception, pc) {
                return Some(handler);
            }
            ec = node.next();
        }
        None
    }

    fn exception_cache_entry_for_exception(&self, exception: KlassId) -> Option<&ExceptionCache> {
        let mut ec = self.exception_cache();
        while let Some(node) = ec {
            if node.match_exception_with_space(exception) {
                return Some(node);
            }
            ec = node.next();
        }
        None
    }

    /// Caches `handler` for an `exception` thrown at `pc`.
    ///
    /// Fills the newest node for the class that has room, or prepends a
    /// new node. Racing inserts of the same pair coalesce.
    pub fn add_handler_for_exception_and_pc(
        &self,
        cc: &CodeCache,
        exception: KlassId,
        pc: usize,
        handler: usize,
    ) {
        let _lock = cc.lock_exception_cache();
        let _nsv = NoSafepointVerifier::new();
        if let Some(target) = self.exception_cache_entry_for_exception(exception) {
            if target.add_address_and_handler(pc, handler) {
                return;
            }
        }
        let node = Box::new(ExceptionCache::new(
            exception,
            cc.tunables().exception_cache_size,
            pc,
            handler,
        ));
        log::debug!(
            target: "exceptions",
            "{self}: new exception cache node for {exception} at {pc:#x}"
        );
        self.add_exception_cache_entry(cc, Box::into_raw(node));
    }

    fn add_exception_cache_entry(&self, cc: &CodeCache, new_entry: *mut ExceptionCache) {
        loop {
            let ec = self.exception_cache_acquire();
            if let Some(head) = unsafe { ec.as_ref() } {
                if !cc.metaspace().is_loader_alive(head.exception_type()) {
                    // Never link a new node in front of a dead one; the
                    // cleaner may be unlinking it right now.
                    let next = head.next_ptr();
                    if self
                        .exception_cache
                        .compare_exchange(ec, next, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        cc.release_exception_cache(ec);
                    }
                    continue;
                }
            }
            unsafe { (*new_entry).set_next(ec) };
            if self
                .exception_cache
                .compare_exchange(ec, new_entry, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Unlinks the nodes whose exception class was unloaded.
    ///
    /// At most one thread cleans a given nmethod at a time. It may race
    /// with inserts, which only ever touch the head.
    pub fn clean_exception_cache(&self, cc: &CodeCache) {
        let mut prev: *mut ExceptionCache = ptr::null_mut();
        let mut curr = self.exception_cache_acquire();

        while let Some(node) = unsafe { curr.as_ref() } {
            let next = node.next_ptr();
            if !cc.metaspace().is_loader_alive(node.exception_type()) {
                if prev.is_null() {
                    if self
                        .exception_cache
                        .compare_exchange(curr, next, Ordering::AcqRel, Ordering::Acquire)
                        .is_err()
                    {
                        // Lost against an insert; start over from the head.
                        curr = self.exception_cache_acquire();
                        continue;
                    }
                } else {
                    unsafe { (*prev).set_next(next) };
                }
                log::trace!(
                    target: "exceptions",
                    "{self}: dropping exception cache node for {}",
                    node.exception_type()
                );
                cc.release_exception_cache(curr);
            } else {
                prev = curr;
            }
            curr = next;
        }
    }

    // Frees every node still linked. Only valid once no reader can reach
    // this nmethod.
    pub(crate) fn free_exception_cache(&mut self) {
        let mut ec = *self.exception_cache.get_mut();
        *self.exception_cache.get_mut() = ptr::null_mut();
        while !ec.is_null() {
            let node = unsafe { Box::from_raw(ec) };
            ec = node.next_ptr();
        }
    }
}
