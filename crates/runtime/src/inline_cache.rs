//! Patchable call sites.
//!
//! Each Java call in compiled code owns a [`CompiledCallSite`]: the current
//! destination of the call, the class or method a virtual call caches for
//! its receiver check, and for static and optimized virtual calls the stub
//! that enters the interpreter. Sites start clean (pointing at the resolve
//! stub of their kind) and are rewritten under the code cache's inline
//! cache lock, which [`CompiledIcLocker`] holds.

use crate::code_cache::CodeCache;
use crate::metaspace::{Metadata, MetadataCell, MethodId};
use crate::nmethod::NMethod;
use crate::safepoint::NoSafepointVerifier;
use codemeta_environ::Relocation;
use std::sync::MutexGuard;
use std::sync::atomic::{AtomicUsize, Ordering};

/// How a call site dispatches.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CallKind {
    /// Through an inline cache that checks the receiver class.
    Virtual,
    /// A virtual call known to have a single target.
    OptVirtual,
    /// A statically bound call.
    Static,
}

/// The interpreter-entry trampoline of a static or optimized virtual call.
#[derive(Debug)]
pub(crate) struct StaticStub {
    // Immediate metadata slot holding the method passed to the interpreter.
    method_imm: u32,
    destination: AtomicUsize,
}

/// The patchable state of one call site.
#[derive(Debug)]
pub struct CompiledCallSite {
    kind: CallKind,
    offset: u32,
    destination: AtomicUsize,
    cached_metadata: MetadataCell,
    stub: Option<StaticStub>,
}

impl CompiledCallSite {
    pub(crate) fn new(kind: CallKind, offset: u32, resolve_stub: usize) -> CompiledCallSite {
        CompiledCallSite {
            kind,
            offset,
            destination: AtomicUsize::new(resolve_stub),
            cached_metadata: MetadataCell::new(None),
            stub: None,
        }
    }

    pub(crate) fn attach_static_stub(&mut self, method_imm: u32) {
        self.stub = Some(StaticStub {
            method_imm,
            destination: AtomicUsize::new(0),
        });
    }

    pub(crate) fn has_static_stub(&self) -> bool {
        self.stub.is_some()
    }

    /// Dispatch kind.
    pub fn kind(&self) -> CallKind {
        self.kind
    }

    /// Code offset of the call instruction.
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Current call target.
    pub fn destination(&self) -> usize {
        self.destination.load(Ordering::Acquire)
    }

    /// The class or method a virtual call checks its receiver against.
    pub fn cached_metadata(&self) -> Option<Metadata> {
        self.cached_metadata.load()
    }

    /// Where the static stub currently jumps, if the site has one.
    pub fn stub_destination(&self) -> Option<usize> {
        self.stub
            .as_ref()
            .map(|s| s.destination.load(Ordering::Acquire))
    }
}

/// Where a call site should go.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IcTarget {
    /// Straight into compiled code. A virtual call checks its receiver
    /// against `cached` first.
    Compiled {
        /// Entry point of the callee.
        entry: usize,
        /// Receiver check metadata.
        cached: Option<Metadata>,
    },
    /// Into the interpreter through the site's static stub.
    Interpreted {
        /// The callee, handed to the interpreter entry.
        method: MethodId,
        /// Compiled-to-interpreted adapter.
        c2i_entry: usize,
    },
}

/// Holds the inline cache lock; call sites may only be rewritten while one
/// is alive. No safepoint may be reached while it is held.
pub struct CompiledIcLocker<'a> {
    _guard: MutexGuard<'a, ()>,
    _nsv: NoSafepointVerifier,
}

impl<'a> CompiledIcLocker<'a> {
    /// Takes the inline cache lock of `cc`.
    pub fn new(cc: &'a CodeCache) -> CompiledIcLocker<'a> {
        CompiledIcLocker {
            _guard: cc.lock_inline_caches(),
            _nsv: NoSafepointVerifier::new(),
        }
    }
}

/// A call site together with the nmethod that contains it.
#[derive(Copy, Clone)]
pub struct CompiledIc<'a> {
    nm: &'a NMethod,
    site: &'a CompiledCallSite,
}

impl<'a> CompiledIc<'a> {
    /// The underlying call site.
    pub fn site(&self) -> &'a CompiledCallSite {
        self.site
    }

    /// Dispatch kind.
    pub fn kind(&self) -> CallKind {
        self.site.kind
    }

    /// Current call target.
    pub fn destination(&self) -> usize {
        self.site.destination()
    }

    /// Receiver check metadata of a virtual call.
    pub fn cached_metadata(&self) -> Option<Metadata> {
        self.site.cached_metadata()
    }

    /// Whether the site goes through its resolve stub.
    pub fn is_clean(&self, cc: &CodeCache) -> bool {
        self.destination() == cc.stubs().resolve_stub(self.site.kind)
    }

    /// Binds the site to a single target.
    ///
    /// # Panics
    ///
    /// Panics when an interpreted target is given for a site without a
    /// static stub.
    pub fn set_to_monomorphic(&self, _locker: &CompiledIcLocker<'_>, target: IcTarget) {
        match target {
            IcTarget::Compiled { entry, cached } => {
                self.site.cached_metadata.store(cached);
                self.site.destination.store(entry, Ordering::Release);
            }
            IcTarget::Interpreted { method, c2i_entry } => {
                let stub = self.site.stub.as_ref().unwrap_or_else(|| {
                    panic!(
                        "{}: call at {} has no stub to reach the interpreter",
                        self.nm, self.site.offset
                    )
                });
                self.nm
                    .immediate_metadata_cell(stub.method_imm)
                    .store(Some(Metadata::Method(method)));
                stub.destination.store(c2i_entry, Ordering::Release);
                self.site
                    .destination
                    .store(self.nm.code_begin() + self.nm.offsets().stub as usize, Ordering::Release);
            }
        }
        log::trace!(
            target: "inlinecache",
            "{}: call at {} bound to {target:?}",
            self.nm,
            self.site.offset
        );
    }

    /// Resets the site so the next call resolves its target again.
    pub fn set_to_clean(&self, _locker: &CompiledIcLocker<'_>, cc: &CodeCache) {
        self.set_to_clean_locked(cc);
    }

    fn set_to_clean_locked(&self, cc: &CodeCache) {
        self.site
            .destination
            .store(cc.stubs().resolve_stub(self.site.kind), Ordering::Release);
        self.site.cached_metadata.store(None);
        if let Some(stub) = &self.site.stub {
            stub.destination.store(0, Ordering::Release);
            self.nm.immediate_metadata_cell(stub.method_imm).store(None);
        }
        log::trace!(
            target: "inlinecache",
            "{}: call at {} set to clean",
            self.nm,
            self.site.offset
        );
    }

    /// Cleans a virtual call whose receiver check refers to unloaded
    /// metadata.
    pub fn clean_metadata(&self, _locker: &CompiledIcLocker<'_>, cc: &CodeCache) {
        self.clean_metadata_locked(cc);
    }

    fn clean_metadata_locked(&self, cc: &CodeCache) {
        if let Some(md) = self.cached_metadata() {
            if !cc.metaspace().is_metadata_alive(md) {
                self.set_to_clean_locked(cc);
            }
        }
    }

    /// Cleans the site when its target is an nmethod that should no longer
    /// be called directly.
    fn clean_if_nmethod_is_unloaded(&self, cc: &CodeCache, clean_all: bool) {
        let Some(target) = cc.find_nmethod(self.destination()) else {
            return;
        };
        if clean_all
            || !target.is_in_use()
            || target.is_unloading(cc)
            || cc.metaspace().code(target.method()) != Some(target.id())
        {
            self.set_to_clean_locked(cc);
        }
    }
}

impl NMethod {
    /// The call site with dense index `site`.
    pub fn call_site(&self, site: u32) -> CompiledIc<'_> {
        CompiledIc {
            nm: self,
            site: &self.call_sites()[site as usize],
        }
    }

    /// Number of call sites.
    pub fn call_site_count(&self) -> usize {
        self.call_sites().len()
    }

    /// Takes the inline cache lock and cleans call sites that refer to
    /// dead metadata or to code that should no longer be called.
    pub fn cleanup_inline_caches(&self, cc: &CodeCache, unloading_occurred: bool, clean_all: bool) {
        let _locker = CompiledIcLocker::new(cc);
        self.cleanup_inline_caches_impl(cc, unloading_occurred, clean_all);
    }

    fn cleanup_inline_caches_impl(&self, cc: &CodeCache, unloading_occurred: bool, clean_all: bool) {
        let mut in_static_stub = false;
        for r in self.relocations(self.oops_reloc_begin()) {
            match r {
                Relocation::VirtualCall { site, .. } => {
                    let ic = self.call_site(site);
                    if unloading_occurred {
                        ic.clean_metadata_locked(cc);
                    }
                    ic.clean_if_nmethod_is_unloaded(cc, clean_all);
                }
                Relocation::OptVirtualCall { site, .. } | Relocation::StaticCall { site, .. } => {
                    self.call_site(site)
                        .clean_if_nmethod_is_unloaded(cc, clean_all);
                }
                Relocation::StaticStub { .. } => in_static_stub = true,
                Relocation::Metadata { index, imm, .. } => {
                    // Only the method slot right after a static stub may
                    // hold metadata the metadata section does not.
                    if !in_static_stub {
                        continue;
                    }
                    in_static_stub = false;
                    if self.is_unloading(cc) {
                        continue;
                    }
                    self.clean_stub_method(cc, index, imm);
                }
                _ => {}
            }
        }
    }

    fn clean_stub_method(&self, cc: &CodeCache, index: u32, imm: u32) {
        let md = if index == 0 {
            self.immediate_metadata(imm)
        } else {
            self.metadata_at(index)
        };
        let Some(Metadata::Method(method)) = md else {
            return;
        };
        let holder = cc.metaspace().method_holder(method);
        if cc.metaspace().is_loader_alive(holder) {
            return;
        }
        if index != 0 {
            let cell = self.metadata_cell(index);
            cell.store(None);
            // Keep the instruction's copy in sync with the section.
            self.immediate_metadata_cell(imm).store(cell.load());
        } else {
            self.immediate_metadata_cell(imm).store(None);
        }
        log::debug!(
            target: "inlinecache",
            "{self}: cleared stub method {method} of unloaded {holder}"
        );
    }

    /// Resets every call site.
    pub fn clear_inline_caches(&self, cc: &CodeCache) {
        let locker = CompiledIcLocker::new(cc);
        for site in 0..self.call_site_count() {
            self.call_site(site as u32).set_to_clean(&locker, cc);
        }
    }

    /// Cleans the caches of a live nmethod after an unloading cycle: the
    /// exception cache if classes were unloaded, then the call sites.
    pub fn unload_nmethod_caches(&self, cc: &CodeCache, unloading_occurred: bool) {
        if unloading_occurred {
            self.clean_exception_cache(cc);
        }
        self.cleanup_inline_caches(cc, unloading_occurred, false);
    }
}
