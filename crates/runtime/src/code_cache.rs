//! The process-wide state every nmethod operation runs against.
//!
//! A [`CodeCache`] owns the registry of nmethods, keyed by the address
//! range of their code, together with the counters that give the
//! collector its notion of time (the unloading cycle and the marking
//! epoch), the locks that serialize patching, and the runtime stubs that
//! clean call sites point at. Nothing here is global; tests and embedders
//! create as many caches as they like.

use crate::config::Tunables;
use crate::exception_cache::ExceptionCache;
use crate::frame::CompressedOops;
use crate::inline_cache::CallKind;
use crate::metaspace::{Metaspace, NMethodId};
use crate::nmethod::{NMethod, NMethodParts};
use crate::unloading::{ClassUnloadingContext, ClosureIsUnloadingBehaviour, IsUnloadingBehaviour};
use anyhow::{Result, ensure};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use thiserror::Error;

const STUB_SIZE: usize = 16;
const GUARD_VALUE_MASK: u32 = 0x7fff_ffff;

/// Runtime stubs that compiled code calls into. Each stub occupies a
/// distinct address that no nmethod's code can contain.
pub struct Stubs {
    blob: Box<[u8]>,
}

#[derive(Copy, Clone)]
#[repr(usize)]
enum Stub {
    ResolveVirtualCall,
    ResolveOptVirtualCall,
    ResolveStaticCall,
    HandleWrongMethod,
    UncommonTrap,
    Count,
}

impl Stubs {
    fn new() -> Stubs {
        Stubs {
            blob: vec![0; Stub::Count as usize * STUB_SIZE].into_boxed_slice(),
        }
    }

    fn address(&self, stub: Stub) -> usize {
        self.blob.as_ptr() as usize + stub as usize * STUB_SIZE
    }

    /// Where a clean virtual call goes.
    pub fn resolve_virtual_call(&self) -> usize {
        self.address(Stub::ResolveVirtualCall)
    }

    /// Where a clean optimized virtual call goes.
    pub fn resolve_opt_virtual_call(&self) -> usize {
        self.address(Stub::ResolveOptVirtualCall)
    }

    /// Where a clean static call goes.
    pub fn resolve_static_call(&self) -> usize {
        self.address(Stub::ResolveStaticCall)
    }

    /// Where the verified entry of a not-entrant nmethod jumps.
    pub fn handle_wrong_method(&self) -> usize {
        self.address(Stub::HandleWrongMethod)
    }

    /// Where an implicit exception without a continuation deoptimizes.
    pub fn uncommon_trap(&self) -> usize {
        self.address(Stub::UncommonTrap)
    }

    /// The resolve stub of a call site of `kind`.
    pub fn resolve_stub(&self, kind: CallKind) -> usize {
        match kind {
            CallKind::Virtual => self.resolve_virtual_call(),
            CallKind::OptVirtual => self.resolve_opt_virtual_call(),
            CallKind::Static => self.resolve_static_call(),
        }
    }

    /// Whether `pc` is inside one of the stubs.
    pub fn contains(&self, pc: usize) -> bool {
        let start = self.blob.as_ptr() as usize;
        (start..start + self.blob.len()).contains(&pc)
    }
}

impl fmt::Debug for Stubs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stubs")
            .field("start", &format_args!("{:#x}", self.blob.as_ptr() as usize))
            .finish()
    }
}

/// Failure to add an nmethod to the code cache.
#[derive(Error, Debug)]
pub enum CodeCacheError {
    /// Not enough capacity left.
    #[error("code cache is full: {requested} bytes requested, {available} available")]
    Full {
        /// Size of the rejected nmethod.
        requested: usize,
        /// Capacity left when it was rejected.
        available: usize,
    },
    /// The compiler's output is inconsistent.
    #[error(transparent)]
    Malformed(#[from] anyhow::Error),
    /// The tunables the cache was asked to run with are out of range.
    #[error("invalid code cache tunables")]
    InvalidTunables(#[source] anyhow::Error),
}

/// Registered nmethods, keyed by the end address of their code.
#[derive(Default)]
struct Registry {
    ranges: BTreeMap<usize, Arc<NMethod>>,
}

impl Registry {
    fn register(&mut self, nm: Arc<NMethod>) {
        let prev = self.ranges.insert(nm.code_end(), nm);
        assert!(prev.is_none(), "two nmethods end at the same address");
    }

    fn unregister(&mut self, nm: &NMethod) -> bool {
        match self.ranges.get(&nm.code_end()) {
            Some(registered) if registered.id() == nm.id() => {
                self.ranges.remove(&nm.code_end());
                true
            }
            _ => false,
        }
    }

    fn find(&self, pc: usize) -> Option<&Arc<NMethod>> {
        let (_, nm) = self
            .ranges
            .range((Bound::Excluded(pc), Bound::Unbounded))
            .next()?;
        if nm.code_contains(pc) { Some(nm) } else { None }
    }
}

/// The code cache.
pub struct CodeCache {
    tunables: Tunables,
    metaspace: Arc<Metaspace>,
    stubs: Stubs,
    compressed_oops: CompressedOops,

    registry: RwLock<Registry>,
    next_id: AtomicU32,
    used: AtomicUsize,

    nmethod_state_lock: Mutex<()>,
    exception_cache_lock: Mutex<()>,
    inline_cache_lock: Mutex<()>,
    exception_cache_purge_list: AtomicPtr<ExceptionCache>,

    unloading_cycle: AtomicU8,
    gc_epoch: AtomicU64,
    disarmed_guard_value: AtomicU32,
    unloading_behaviour: RwLock<Arc<dyn IsUnloadingBehaviour>>,
    unloading_context: ClassUnloadingContext,
    oops_do_mark_nmethods: AtomicPtr<NMethod>,
}

impl CodeCache {
    /// Creates an empty code cache for the classes in `metaspace`.
    ///
    /// Fails if `tunables` do not pass [`Tunables::validate`].
    pub fn new(tunables: Tunables, metaspace: Arc<Metaspace>) -> Result<CodeCache, CodeCacheError> {
        tunables
            .validate()
            .map_err(CodeCacheError::InvalidTunables)?;
        let compressed_oops = if tunables.use_compressed_oops {
            CompressedOops::new(tunables.narrow_oop_base, tunables.narrow_oop_shift)
        } else {
            CompressedOops::new(0, 0)
        };
        log::debug!(
            target: "codecache",
            "new code cache: {} bytes, {} exception cache slots per node",
            tunables.code_cache_capacity,
            tunables.exception_cache_size
        );
        Ok(CodeCache {
            tunables,
            metaspace,
            stubs: Stubs::new(),
            compressed_oops,
            registry: RwLock::new(Registry::default()),
            next_id: AtomicU32::new(0),
            used: AtomicUsize::new(0),
            nmethod_state_lock: Mutex::new(()),
            exception_cache_lock: Mutex::new(()),
            inline_cache_lock: Mutex::new(()),
            exception_cache_purge_list: AtomicPtr::new(ptr::null_mut()),
            // Zero marks an nmethod created before any cycle ran.
            unloading_cycle: AtomicU8::new(1),
            gc_epoch: AtomicU64::new(2),
            // Fresh barriers hold zero and start out armed.
            disarmed_guard_value: AtomicU32::new(1),
            unloading_behaviour: RwLock::new(Arc::new(ClosureIsUnloadingBehaviour::always_alive())),
            unloading_context: ClassUnloadingContext::new(),
            oops_do_mark_nmethods: AtomicPtr::new(ptr::null_mut()),
        })
    }

    /// The tunables this cache was created with.
    pub fn tunables(&self) -> &Tunables {
        &self.tunables
    }

    /// The class model.
    pub fn metaspace(&self) -> &Metaspace {
        &self.metaspace
    }

    /// Runtime stub addresses.
    pub fn stubs(&self) -> &Stubs {
        &self.stubs
    }

    /// How narrow oops are decoded.
    pub fn compressed_oops(&self) -> &CompressedOops {
        &self.compressed_oops
    }

    // ----------------------------------------------------------------------
    // Registry

    /// Creates an nmethod from a compiler's output and registers it. The
    /// nmethod is not installed; see [`CodeCache::install`].
    ///
    /// # Errors
    ///
    /// Fails if the parts are inconsistent or the cache is full.
    pub fn new_nmethod(&self, parts: NMethodParts) -> Result<Arc<NMethod>, CodeCacheError> {
        let id = NMethodId::from_u32(self.next_id.fetch_add(1, Ordering::Relaxed));
        let nm = NMethod::new(self, id, parts)?;
        self.reserve_capacity(nm.total_size())?;
        let nm = Arc::new(nm);
        self.registry
            .write()
            .expect("code cache registry lock got poisoned")
            .register(Arc::clone(&nm));
        Ok(nm)
    }

    fn reserve_capacity(&self, size: usize) -> Result<(), CodeCacheError> {
        let capacity = self.tunables.code_cache_capacity;
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(size).filter(|total| *total <= capacity)
            })
            .map(|_| ())
            .map_err(|used| {
                log::warn!(
                    target: "codecache",
                    "code cache is full, {size} bytes requested"
                );
                CodeCacheError::Full {
                    requested: size,
                    available: capacity - used,
                }
            })
    }

    pub(crate) fn release_capacity(&self, size: usize) {
        let prev = self.used.fetch_sub(size, Ordering::AcqRel);
        debug_assert!(prev >= size, "released more than was reserved");
    }

    /// Bytes still available.
    pub fn unallocated_capacity(&self) -> usize {
        self.tunables.code_cache_capacity - self.used.load(Ordering::Acquire)
    }

    /// Links an nmethod into its method, or into its class's OSR list, and
    /// makes it usable.
    ///
    /// # Errors
    ///
    /// Fails if the nmethod was installed before or is not registered
    /// here.
    pub fn install(&self, nm: &Arc<NMethod>) -> Result<()> {
        ensure!(nm.is_not_installed(), "{nm} is already installed");
        ensure!(
            self.find_nmethod(nm.code_begin())
                .is_some_and(|found| Arc::ptr_eq(&found, nm)),
            "{nm} is not registered in this code cache"
        );
        nm.add_to_dependency_contexts(self);
        nm.make_in_use();
        if let Some(mirror) = &nm.mirror {
            mirror.bind(nm);
        }
        if nm.is_osr_method() {
            let holder = self.metaspace.method_holder(nm.method());
            self.metaspace.add_osr_nmethod(holder, nm.id());
        } else {
            self.metaspace.set_code(nm.method(), nm.id());
        }
        log::debug!(target: "codecache", "installed {nm}");
        Ok(())
    }

    pub(crate) fn unregister(&self, nm: &NMethod) {
        let removed = self
            .registry
            .write()
            .expect("code cache registry lock got poisoned")
            .unregister(nm);
        debug_assert!(removed, "{nm} was not registered");
    }

    /// The nmethod whose code contains `pc`.
    pub fn find_nmethod(&self, pc: usize) -> Option<Arc<NMethod>> {
        self.registry
            .read()
            .expect("code cache registry lock got poisoned")
            .find(pc)
            .cloned()
    }

    /// The registered nmethod with compile id `id`.
    pub fn nmethod(&self, id: NMethodId) -> Option<Arc<NMethod>> {
        self.registry
            .read()
            .expect("code cache registry lock got poisoned")
            .ranges
            .values()
            .find(|nm| nm.id() == id)
            .cloned()
    }

    /// Every registered nmethod, in address order.
    pub fn nmethods(&self) -> Vec<Arc<NMethod>> {
        self.registry
            .read()
            .expect("code cache registry lock got poisoned")
            .ranges
            .values()
            .cloned()
            .collect()
    }

    /// Number of registered nmethods.
    pub fn nmethod_count(&self) -> usize {
        self.registry
            .read()
            .expect("code cache registry lock got poisoned")
            .ranges
            .len()
    }

    // ----------------------------------------------------------------------
    // Locks

    /// Serializes state transitions.
    pub fn lock_nmethod_state(&self) -> MutexGuard<'_, ()> {
        self.nmethod_state_lock
            .lock()
            .expect("nmethod state lock got poisoned")
    }

    /// Serializes exception-cache inserts.
    pub fn lock_exception_cache(&self) -> MutexGuard<'_, ()> {
        self.exception_cache_lock
            .lock()
            .expect("exception cache lock got poisoned")
    }

    /// Serializes call-site patching. Prefer
    /// [`CompiledIcLocker`](crate::CompiledIcLocker).
    pub fn lock_inline_caches(&self) -> MutexGuard<'_, ()> {
        self.inline_cache_lock
            .lock()
            .expect("inline cache lock got poisoned")
    }

    // ----------------------------------------------------------------------
    // Exception cache purge list

    /// Queues an unlinked exception-cache node for freeing. Lock-free
    /// readers may still be looking at it, so it lives until
    /// [`CodeCache::purge_exception_caches`].
    ///
    /// `entry` must come from `Box::into_raw`, be unreachable from every
    /// nmethod and be released only once.
    pub(crate) fn release_exception_cache(&self, entry: *mut ExceptionCache) {
        debug_assert!(!entry.is_null());
        // SAFETY: per the contract above the node is valid and only this
        // thread links it.
        let node = unsafe { &*entry };
        let mut head = self.exception_cache_purge_list.load(Ordering::Acquire);
        loop {
            node.purge_list_next.store(head, Ordering::Relaxed);
            match self.exception_cache_purge_list.compare_exchange_weak(
                head,
                entry,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(found) => head = found,
            }
        }
    }

    /// Number of exception-cache nodes waiting to be freed.
    pub fn pending_exception_cache_purges(&self) -> usize {
        let mut count = 0;
        let mut cur = self.exception_cache_purge_list.load(Ordering::Acquire);
        // SAFETY: queued nodes are only freed by `purge_exception_caches`,
        // which requires exclusive access to the list.
        while let Some(node) = unsafe { cur.as_ref() } {
            count += 1;
            cur = node.purge_list_next.load(Ordering::Acquire);
        }
        count
    }

    /// Frees every queued exception-cache node. Returns how many.
    ///
    /// # Safety
    ///
    /// No thread may still be reading an exception cache it loaded before
    /// the nodes were unlinked, which holds after every thread passed a
    /// global synchronization point.
    pub unsafe fn purge_exception_caches(&self) -> usize {
        let mut cur = self
            .exception_cache_purge_list
            .swap(ptr::null_mut(), Ordering::AcqRel);
        let mut freed = 0;
        while !cur.is_null() {
            // SAFETY: queued nodes came from `Box::into_raw` and were
            // queued exactly once.
            let node = unsafe { Box::from_raw(cur) };
            cur = node.purge_list_next.load(Ordering::Acquire);
            freed += 1;
        }
        if freed > 0 {
            log::debug!(target: "exceptions", "freed {freed} exception cache nodes");
        }
        freed
    }

    // ----------------------------------------------------------------------
    // Unloading cycles and marking epochs

    /// The current unloading cycle, 1 to 3.
    pub fn unloading_cycle(&self) -> u8 {
        self.unloading_cycle.load(Ordering::Acquire)
    }

    /// Starts a new unloading cycle; every nmethod's unloading decision is
    /// recomputed on its next query.
    pub fn increment_unloading_cycle(&self) -> u8 {
        let next = |cycle: u8| match (cycle + 1) % 4 {
            0 => 1,
            n => n,
        };
        let prev = self
            .unloading_cycle
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| Some(next(c)))
            .unwrap_or_else(|c| c);
        let cycle = next(prev);
        log::debug!(target: "gc", "unloading cycle {cycle}");
        cycle
    }

    /// The marking epoch. Odd while a marking cycle is running.
    pub fn gc_epoch(&self) -> u64 {
        self.gc_epoch.load(Ordering::Acquire)
    }

    /// Whether a marking cycle is running.
    pub fn is_gc_marking_cycle_active(&self) -> bool {
        self.gc_epoch() % 2 == 1
    }

    /// Starts a marking cycle.
    pub fn on_gc_marking_cycle_start(&self) {
        debug_assert!(!self.is_gc_marking_cycle_active());
        let epoch = self.gc_epoch.fetch_add(1, Ordering::AcqRel) + 1;
        log::debug!(target: "gc", "marking cycle started, epoch {epoch}");
    }

    /// Ends the running marking cycle.
    pub fn on_gc_marking_cycle_finish(&self) {
        debug_assert!(self.is_gc_marking_cycle_active());
        let epoch = self.gc_epoch.fetch_add(1, Ordering::AcqRel) + 1;
        log::debug!(target: "gc", "marking cycle finished, epoch {epoch}");
    }

    /// The epoch at which the last completed marking cycle started.
    pub fn previous_completed_gc_marking_cycle(&self) -> u64 {
        let epoch = self.gc_epoch();
        if epoch % 2 == 1 { epoch - 2 } else { epoch - 1 }
    }

    /// Marking cycles, halved, that code may go unseen before it is cold.
    pub fn cold_gc_count(&self) -> u64 {
        self.tunables.cold_gc_count
    }

    // ----------------------------------------------------------------------
    // Entry barriers

    /// The guard value an nmethod's entry barrier must hold to be disarmed.
    pub fn disarmed_guard_value(&self) -> u32 {
        self.disarmed_guard_value.load(Ordering::Acquire)
    }

    /// Arms every nmethod's entry barrier at once.
    pub fn arm_all_nmethods(&self) {
        let next = |v: u32| match v.wrapping_add(1) & GUARD_VALUE_MASK {
            0 => 1,
            n => n,
        };
        let prev = self
            .disarmed_guard_value
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| Some(next(v)))
            .unwrap_or_else(|v| v);
        log::trace!(target: "gc::nmethod", "armed all nmethods, disarmed value {}", next(prev));
    }

    // ----------------------------------------------------------------------
    // Unloading

    /// The policy deciding which nmethods unload.
    pub fn unloading_behaviour(&self) -> Arc<dyn IsUnloadingBehaviour> {
        Arc::clone(
            &self
                .unloading_behaviour
                .read()
                .expect("unloading behaviour lock got poisoned"),
        )
    }

    /// Replaces the unloading policy. Decisions already taken in the
    /// current cycle stand.
    pub fn set_unloading_behaviour(&self, behaviour: Arc<dyn IsUnloadingBehaviour>) {
        *self
            .unloading_behaviour
            .write()
            .expect("unloading behaviour lock got poisoned") = behaviour;
    }

    /// Where unlinked nmethods wait to be freed.
    pub fn unloading_context(&self) -> &ClassUnloadingContext {
        &self.unloading_context
    }

    /// Runs [`NMethod::do_unloading`] on every registered nmethod. Returns
    /// how many were unlinked.
    pub fn do_unloading(&self, unloading_occurred: bool) -> usize {
        let before = self.unloading_context.unlinked_count();
        for nm in self.nmethods() {
            nm.do_unloading(self, unloading_occurred);
        }
        let unlinked = self.unloading_context.unlinked_count() - before;
        log::debug!(
            target: "codecache",
            "unloading cycle {}: {unlinked} nmethods unlinked",
            self.unloading_cycle()
        );
        unlinked
    }

    pub(crate) fn oops_do_mark_nmethods(&self) -> &AtomicPtr<NMethod> {
        &self.oops_do_mark_nmethods
    }
}

impl fmt::Debug for CodeCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeCache")
            .field("nmethods", &self.nmethod_count())
            .field("unallocated_capacity", &self.unallocated_capacity())
            .field("unloading_cycle", &self.unloading_cycle())
            .field("gc_epoch", &self.gc_epoch())
            .finish_non_exhaustive()
    }
}

impl Drop for CodeCache {
    fn drop(&mut self) {
        // SAFETY: exclusive access; no marking pass or reader can be live.
        unsafe {
            self.oops_do_marking_epilogue();
            self.purge_exception_caches();
        }
    }
}
