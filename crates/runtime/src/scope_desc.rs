//! Lazily decoded logical frames.
//!
//! A [`ScopeDesc`] is a cheap view over an nmethod's scopes data. Only the
//! header is decoded up front; value lists are decoded on first access and
//! then kept. All scopes of one pc share the pc's object pool, so every
//! level of an inlining chain sees the same rematerialized objects.

use crate::metaspace::{KlassId, Metadata, MethodId};
use crate::nmethod::NMethod;
use codemeta_environ::{
    Location, MonitorValue, ObjectValue, PcDesc, SERIALIZED_NULL, ScopeHeader, ScopeValue,
    read_monitor_values, read_object_pool, read_scope_values,
};
use std::cell::OnceCell;
use std::fmt;
use std::rc::Rc;

/// The scalar-replaced objects of one pc, decoded once.
pub struct ObjectPool<'a> {
    data: &'a [u8],
    decode_offset: i32,
    objects: OnceCell<Vec<ObjectValue>>,
}

impl<'a> ObjectPool<'a> {
    fn new(data: &'a [u8], decode_offset: i32) -> ObjectPool<'a> {
        ObjectPool {
            data,
            decode_offset,
            objects: OnceCell::new(),
        }
    }

    /// The objects, decoded on first use.
    pub fn objects(&self) -> &[ObjectValue] {
        self.objects
            .get_or_init(|| read_object_pool(self.data, self.decode_offset))
    }

    /// The object with identity `id`.
    pub fn object(&self, id: u32) -> Option<&ObjectValue> {
        self.objects().iter().find(|o| o.id == id)
    }

    /// Whether the pool was decoded already.
    pub fn is_decoded(&self) -> bool {
        self.objects.get().is_some()
    }
}

/// Who holds a monitor.
#[derive(Clone, Debug, PartialEq)]
pub enum MonitorOwner {
    /// A value of the frame.
    Value(ScopeValue),
    /// A scalar-replaced object. Only its class is known; whoever
    /// rematerializes the frame must lock a stand-in of that class.
    ScalarReplaced {
        /// Identity in the object pool.
        object_id: u32,
        /// Class of the replaced object.
        klass: KlassId,
    },
}

/// A decoded monitor.
#[derive(Clone, Debug, PartialEq)]
pub struct MonitorInfo {
    /// The locked object.
    pub owner: MonitorOwner,
    /// Where the lock record lives.
    pub basic_lock: Location,
    /// Whether the compiler elided the locking.
    pub eliminated: bool,
}

impl MonitorInfo {
    /// Whether the owner was scalar replaced.
    pub fn owner_is_scalar_replaced(&self) -> bool {
        matches!(self.owner, MonitorOwner::ScalarReplaced { .. })
    }
}

/// One logical frame at a pc of an nmethod.
pub struct ScopeDesc<'a> {
    nm: &'a NMethod,
    decode_offset: i32,
    header: ScopeHeader,
    method: MethodId,
    reexecute: bool,
    rethrow_exception: bool,
    return_oop: bool,
    objects: Rc<ObjectPool<'a>>,
    locals: OnceCell<Vec<ScopeValue>>,
    expressions: OnceCell<Vec<ScopeValue>>,
    monitors: OnceCell<Vec<MonitorInfo>>,
}

impl<'a> ScopeDesc<'a> {
    /// The innermost scope at `pd`.
    pub fn new(nm: &'a NMethod, pd: &PcDesc) -> ScopeDesc<'a> {
        let objects = Rc::new(ObjectPool::new(nm.scopes_data(), pd.obj_decode_offset()));
        let mut scope = ScopeDesc::decode(nm, pd.scope_decode_offset(), objects);
        scope.reexecute = pd.should_reexecute();
        scope.rethrow_exception = pd.rethrow_exception();
        scope.return_oop = pd.return_oop();
        scope
    }

    fn decode(nm: &'a NMethod, decode_offset: i32, objects: Rc<ObjectPool<'a>>) -> ScopeDesc<'a> {
        assert!(
            decode_offset != SERIALIZED_NULL,
            "{nm}: pc descriptor has no scope"
        );
        let header = ScopeHeader::read(nm.scopes_data(), decode_offset);
        let method = match nm.metadata_at(header.method_index) {
            Some(Metadata::Method(m)) => m,
            other => panic!(
                "{nm}: scope at {decode_offset} names {other:?} instead of a method"
            ),
        };
        ScopeDesc {
            nm,
            decode_offset,
            header,
            method,
            reexecute: false,
            rethrow_exception: false,
            return_oop: false,
            objects,
            locals: OnceCell::new(),
            expressions: OnceCell::new(),
            monitors: OnceCell::new(),
        }
    }

    /// The calling scope this one was inlined into, or `None` for the
    /// outermost frame.
    ///
    /// Per-pc flags describe the innermost scope only; senders report them
    /// as unset.
    pub fn sender(&self) -> Option<ScopeDesc<'a>> {
        if self.is_top() {
            return None;
        }
        Some(ScopeDesc::decode(
            self.nm,
            self.header.sender_decode_offset,
            Rc::clone(&self.objects),
        ))
    }

    /// Whether this is the outermost frame.
    pub fn is_top(&self) -> bool {
        self.header.is_top()
    }

    /// The nmethod this scope belongs to.
    pub fn nmethod(&self) -> &'a NMethod {
        self.nm
    }

    /// The method executing in this frame.
    pub fn method(&self) -> MethodId {
        self.method
    }

    /// Current bytecode index.
    pub fn bci(&self) -> i32 {
        self.header.bci
    }

    /// Where this scope starts in the scopes data.
    pub fn decode_offset(&self) -> i32 {
        self.decode_offset
    }

    /// Where the sender's scope starts in the scopes data.
    pub fn sender_decode_offset(&self) -> i32 {
        self.header.sender_decode_offset
    }

    /// Whether deoptimization must re-execute the current bytecode.
    pub fn should_reexecute(&self) -> bool {
        self.reexecute
    }

    /// Whether an exception is being rethrown here.
    pub fn rethrow_exception(&self) -> bool {
        self.rethrow_exception
    }

    /// Whether the call here returns an object reference.
    pub fn return_oop(&self) -> bool {
        self.return_oop
    }

    /// Local variables.
    pub fn locals(&self) -> &[ScopeValue] {
        self.locals.get_or_init(|| {
            read_scope_values(self.nm.scopes_data(), self.header.locals_decode_offset)
        })
    }

    /// Expression stack, bottom first.
    pub fn expressions(&self) -> &[ScopeValue] {
        self.expressions.get_or_init(|| {
            read_scope_values(self.nm.scopes_data(), self.header.expressions_decode_offset)
        })
    }

    /// Held monitors, outermost first.
    pub fn monitors(&self) -> &[MonitorInfo] {
        self.monitors.get_or_init(|| {
            read_monitor_values(self.nm.scopes_data(), self.header.monitors_decode_offset)
                .into_iter()
                .map(|m| self.monitor_info(m))
                .collect()
        })
    }

    fn monitor_info(&self, m: MonitorValue) -> MonitorInfo {
        let owner = match m.owner {
            ScopeValue::Object(id) => {
                let object = self.objects.object(id).unwrap_or_else(|| {
                    panic!("{}: monitor owner {id} is not in the object pool", self.nm)
                });
                let klass = match self.nm.metadata_at(object.klass) {
                    Some(Metadata::Klass(k)) => k,
                    other => panic!(
                        "{}: scalar-replaced object {id} has class {other:?}",
                        self.nm
                    ),
                };
                MonitorOwner::ScalarReplaced {
                    object_id: id,
                    klass,
                }
            }
            value => MonitorOwner::Value(value),
        };
        MonitorInfo {
            owner,
            basic_lock: m.basic_lock,
            eliminated: m.eliminated,
        }
    }

    /// Scalar-replaced objects of this pc, shared by every scope of it.
    pub fn objects(&self) -> &[ObjectValue] {
        self.objects.objects()
    }

    /// The object pool shared by the scopes of this pc.
    pub fn object_pool(&self) -> &Rc<ObjectPool<'a>> {
        &self.objects
    }

    /// Whether both describe the same scope record.
    pub fn is_equal(&self, other: &ScopeDesc<'_>) -> bool {
        std::ptr::eq(self.nm, other.nm) && self.decode_offset == other.decode_offset
    }
}

impl fmt::Debug for ScopeDesc<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeDesc")
            .field("method", &self.method)
            .field("bci", &self.header.bci)
            .field("decode_offset", &self.decode_offset)
            .field("sender_decode_offset", &self.header.sender_decode_offset)
            .field("reexecute", &self.reexecute)
            .finish()
    }
}
