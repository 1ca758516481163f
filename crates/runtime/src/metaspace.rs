//! The slice of class metadata compiled code depends on.
//!
//! Classes, methods and their loaders are plain table entries addressed by
//! entity indices. The only state that changes concurrently with compiled
//! code is held in atomics: loader liveness, a method's installed code, its
//! decompile count and the per-class OSR and dependency lists.

use cranelift_entity::{PrimaryMap, entity_impl};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

/// A class loader.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoaderId(u32);
entity_impl!(LoaderId, "loader");

/// A loaded class.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KlassId(u32);
entity_impl!(KlassId, "klass");

/// A method of a loaded class.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId(u32);
entity_impl!(MethodId, "method");

/// The compile id of an nmethod.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NMethodId(u32);
entity_impl!(NMethodId, "nmethod");

/// A class or method pointer embedded in compiled code.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum Metadata {
    /// A class.
    Klass(KlassId),
    /// A method.
    Method(MethodId),
}

impl Metadata {
    fn encode(md: Option<Metadata>) -> u64 {
        match md {
            None => 0,
            Some(Metadata::Klass(k)) => (u64::from(k.as_u32()) + 1) << 1,
            Some(Metadata::Method(m)) => ((u64::from(m.as_u32()) + 1) << 1) | 1,
        }
    }

    fn decode(bits: u64) -> Option<Metadata> {
        if bits == 0 {
            return None;
        }
        let index = u32::try_from((bits >> 1) - 1).ok()?;
        Some(if bits & 1 == 0 {
            Metadata::Klass(KlassId::from_u32(index))
        } else {
            Metadata::Method(MethodId::from_u32(index))
        })
    }
}

/// A nullable, atomically replaceable [`Metadata`] slot.
pub struct MetadataCell(AtomicU64);

impl MetadataCell {
    /// Creates a slot holding `md`.
    pub fn new(md: Option<Metadata>) -> MetadataCell {
        MetadataCell(AtomicU64::new(Metadata::encode(md)))
    }

    /// Current value.
    pub fn load(&self) -> Option<Metadata> {
        Metadata::decode(self.0.load(Ordering::Acquire))
    }

    /// Replaces the value.
    pub fn store(&self, md: Option<Metadata>) {
        self.0.store(Metadata::encode(md), Ordering::Release);
    }
}

impl fmt::Debug for MetadataCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MetadataCell").field(&self.load()).finish()
    }
}

struct LoaderInfo {
    alive: AtomicBool,
}

struct KlassInfo {
    name: String,
    loader: LoaderId,
    osr_nmethods: Mutex<Vec<NMethodId>>,
    dependents: Mutex<Vec<NMethodId>>,
}

struct MethodInfo {
    holder: KlassId,
    name: String,
    is_native: bool,
    // NMethodId + 1, zero when no code is installed.
    code: AtomicU32,
    has_method_data: bool,
    decompile_count: AtomicU32,
    is_old: AtomicBool,
}

/// Class metadata shared by the whole code cache.
#[derive(Default)]
pub struct Metaspace {
    loaders: RwLock<PrimaryMap<LoaderId, LoaderInfo>>,
    klasses: RwLock<PrimaryMap<KlassId, KlassInfo>>,
    methods: RwLock<PrimaryMap<MethodId, MethodInfo>>,
}

/// Properties of a method at definition time.
#[derive(Clone, Debug)]
pub struct MethodDef<'a> {
    /// Declaring class.
    pub holder: KlassId,
    /// Simple name.
    pub name: &'a str,
    /// Whether the method is implemented natively.
    pub is_native: bool,
    /// Whether profile data exists for the method.
    pub has_method_data: bool,
}

impl Metaspace {
    /// Creates an empty metaspace.
    pub fn new() -> Metaspace {
        Metaspace::default()
    }

    /// Defines a live class loader.
    pub fn define_loader(&self) -> LoaderId {
        self.loaders
            .write()
            .expect("metaspace lock got poisoned")
            .push(LoaderInfo {
                alive: AtomicBool::new(true),
            })
    }

    /// Defines a class.
    pub fn define_klass(&self, name: &str, loader: LoaderId) -> KlassId {
        self.klasses
            .write()
            .expect("metaspace lock got poisoned")
            .push(KlassInfo {
                name: name.to_string(),
                loader,
                osr_nmethods: Mutex::new(Vec::new()),
                dependents: Mutex::new(Vec::new()),
            })
    }

    /// Defines a method.
    pub fn define_method(&self, def: MethodDef<'_>) -> MethodId {
        self.methods
            .write()
            .expect("metaspace lock got poisoned")
            .push(MethodInfo {
                holder: def.holder,
                name: def.name.to_string(),
                is_native: def.is_native,
                code: AtomicU32::new(0),
                has_method_data: def.has_method_data,
                decompile_count: AtomicU32::new(0),
                is_old: AtomicBool::new(false),
            })
    }

    fn with_klass<R>(&self, klass: KlassId, f: impl FnOnce(&KlassInfo) -> R) -> R {
        let klasses = self.klasses.read().expect("metaspace lock got poisoned");
        f(&klasses[klass])
    }

    fn with_method<R>(&self, method: MethodId, f: impl FnOnce(&MethodInfo) -> R) -> R {
        let methods = self.methods.read().expect("metaspace lock got poisoned");
        f(&methods[method])
    }

    /// Name of `klass`.
    pub fn klass_name(&self, klass: KlassId) -> String {
        self.with_klass(klass, |k| k.name.clone())
    }

    /// Defining loader of `klass`.
    pub fn klass_loader(&self, klass: KlassId) -> LoaderId {
        self.with_klass(klass, |k| k.loader)
    }

    /// Whether the loader that defined `klass` is still alive.
    pub fn is_loader_alive(&self, klass: KlassId) -> bool {
        let loader = self.klass_loader(klass);
        self.loaders.read().expect("metaspace lock got poisoned")[loader]
            .alive
            .load(Ordering::Acquire)
    }

    /// Marks `loader` dead; every class it defined is unloaded.
    pub fn unload_loader(&self, loader: LoaderId) {
        log::debug!(target: "codecache", "unloading {loader}");
        self.loaders.read().expect("metaspace lock got poisoned")[loader]
            .alive
            .store(false, Ordering::Release);
    }

    /// Unloads `klass` by marking its loader dead.
    pub fn unload_klass(&self, klass: KlassId) {
        self.unload_loader(self.klass_loader(klass));
    }

    /// Whether `md` still belongs to a live loader.
    pub fn is_metadata_alive(&self, md: Metadata) -> bool {
        match md {
            Metadata::Klass(k) => self.is_loader_alive(k),
            Metadata::Method(m) => self.is_loader_alive(self.method_holder(m)),
        }
    }

    /// Declaring class of `method`.
    pub fn method_holder(&self, method: MethodId) -> KlassId {
        self.with_method(method, |m| m.holder)
    }

    /// Simple name of `method`.
    pub fn method_name(&self, method: MethodId) -> String {
        self.with_method(method, |m| m.name.clone())
    }

    /// `Holder::name` of `method`.
    pub fn method_external_name(&self, method: MethodId) -> String {
        let (holder, name) = self.with_method(method, |m| (m.holder, m.name.clone()));
        format!("{}::{name}", self.klass_name(holder))
    }

    /// Whether `method` is native.
    pub fn is_native(&self, method: MethodId) -> bool {
        self.with_method(method, |m| m.is_native)
    }

    /// The code installed as `method`'s compiled entry.
    pub fn code(&self, method: MethodId) -> Option<NMethodId> {
        let raw = self.with_method(method, |m| m.code.load(Ordering::Acquire));
        raw.checked_sub(1).map(NMethodId::from_u32)
    }

    /// Installs `nm` as `method`'s compiled entry.
    pub fn set_code(&self, method: MethodId, nm: NMethodId) {
        self.with_method(method, |m| m.code.store(nm.as_u32() + 1, Ordering::Release));
    }

    /// Clears `method`'s compiled entry if it is still `nm`. Returns
    /// whether it was.
    pub fn unlink_code(&self, method: MethodId, nm: NMethodId) -> bool {
        self.with_method(method, |m| {
            m.code
                .compare_exchange(nm.as_u32() + 1, 0, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        })
    }

    /// Whether profile data exists for `method`.
    pub fn has_method_data(&self, method: MethodId) -> bool {
        self.with_method(method, |m| m.has_method_data)
    }

    /// How often compiled code of `method` was invalidated.
    pub fn decompile_count(&self, method: MethodId) -> u32 {
        self.with_method(method, |m| m.decompile_count.load(Ordering::Relaxed))
    }

    /// Counts one invalidation of `method`'s code. Methods without profile
    /// data keep no count.
    pub fn inc_decompile_count(&self, method: MethodId) {
        self.with_method(method, |m| {
            if m.has_method_data {
                m.decompile_count.fetch_add(1, Ordering::Relaxed);
            }
        });
    }

    /// Whether `method` was replaced by a class redefinition.
    pub fn is_old(&self, method: MethodId) -> bool {
        self.with_method(method, |m| m.is_old.load(Ordering::Acquire))
    }

    /// Marks `method` as replaced by a class redefinition.
    pub fn mark_old(&self, method: MethodId) {
        self.with_method(method, |m| m.is_old.store(true, Ordering::Release));
    }

    /// Registers an on-stack-replacement nmethod with `klass`.
    pub fn add_osr_nmethod(&self, klass: KlassId, nm: NMethodId) {
        self.with_klass(klass, |k| {
            k.osr_nmethods
                .lock()
                .expect("osr list lock got poisoned")
                .push(nm)
        });
    }

    /// Removes an on-stack-replacement nmethod from `klass`. Returns
    /// whether it was registered.
    pub fn remove_osr_nmethod(&self, klass: KlassId, nm: NMethodId) -> bool {
        self.with_klass(klass, |k| {
            let mut list = k.osr_nmethods.lock().expect("osr list lock got poisoned");
            match list.iter().position(|n| *n == nm) {
                Some(i) => {
                    list.swap_remove(i);
                    true
                }
                None => false,
            }
        })
    }

    /// On-stack-replacement nmethods registered with `klass`.
    pub fn osr_nmethods(&self, klass: KlassId) -> Vec<NMethodId> {
        self.with_klass(klass, |k| {
            k.osr_nmethods
                .lock()
                .expect("osr list lock got poisoned")
                .clone()
        })
    }

    /// Records that `nm` depends on an assumption about `klass`.
    pub fn add_dependent_nmethod(&self, klass: KlassId, nm: NMethodId) {
        self.with_klass(klass, |k| {
            let mut deps = k.dependents.lock().expect("dependency lock got poisoned");
            if !deps.contains(&nm) {
                deps.push(nm);
            }
        });
    }

    /// Drops `nm` from `klass`'s dependency context. Returns whether it
    /// was present.
    pub fn remove_dependent_nmethod(&self, klass: KlassId, nm: NMethodId) -> bool {
        self.with_klass(klass, |k| {
            let mut deps = k.dependents.lock().expect("dependency lock got poisoned");
            match deps.iter().position(|n| *n == nm) {
                Some(i) => {
                    deps.remove(i);
                    true
                }
                None => false,
            }
        })
    }

    /// The nmethods depending on assumptions about `klass`.
    pub fn dependent_nmethods(&self, klass: KlassId) -> Vec<NMethodId> {
        self.with_klass(klass, |k| {
            k.dependents
                .lock()
                .expect("dependency lock got poisoned")
                .clone()
        })
    }
}
