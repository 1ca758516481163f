//! Machine frames, saved-register maps and the closures collectors hand
//! to oop iteration.

use codemeta_environ::VMReg;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// An uncompressed object reference. Zero is null.
pub type Oop = usize;

/// A compressed object reference. Zero is null.
pub type NarrowOop = u32;

/// Word stored in an oop slot that holds no reference yet.
pub const NON_OOP_WORD: Oop = usize::MAX;

/// Visits object reference slots.
///
/// Slots are handed out as atomics because compiled code, the collector and
/// this crate may all look at them; a closure that relocates objects stores
/// the new address back into the slot.
pub trait OopClosure {
    /// Visits a full-width reference slot.
    fn do_oop(&mut self, p: &AtomicUsize);

    /// Visits a compressed reference slot.
    fn do_narrow_oop(&mut self, p: &AtomicU32);
}

/// Visits pointers derived from a base reference by arithmetic.
pub trait DerivedOopClosure {
    /// Visits `derived`, computed from the reference in `base`.
    fn do_derived_oop(&mut self, base: &AtomicUsize, derived: &AtomicUsize);
}

/// Decoding parameters of compressed references.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CompressedOops {
    base: usize,
    shift: u32,
}

impl CompressedOops {
    /// Creates parameters for a heap based at `base`.
    pub fn new(base: usize, shift: u32) -> CompressedOops {
        CompressedOops { base, shift }
    }

    /// The heap base.
    pub fn base(&self) -> usize {
        self.base
    }

    /// The decode shift.
    pub fn shift(&self) -> u32 {
        self.shift
    }

    /// Whether `value` is what a null compressed reference decodes to
    /// under a non-zero base.
    pub fn is_base(&self, value: Oop) -> bool {
        self.base != 0 && value == self.base
    }

    /// Decodes `narrow`; null stays null.
    pub fn decode(&self, narrow: NarrowOop) -> Oop {
        if narrow == 0 {
            0
        } else {
            self.base + ((narrow as usize) << self.shift)
        }
    }

    /// Encodes `oop`; null stays null. Returns `None` for a reference
    /// the compressed heap cannot address.
    pub fn encode(&self, oop: Oop) -> Option<NarrowOop> {
        if oop == 0 {
            return Some(0);
        }
        let offset = oop.checked_sub(self.base)?;
        u32::try_from(offset >> self.shift).ok()
    }
}

/// One machine frame of compiled code.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    sp: *mut u8,
    pc: usize,
}

impl Frame {
    /// Creates a frame whose stack slots start at `sp` and which is
    /// stopped at `pc`.
    pub fn new(sp: *mut u8, pc: usize) -> Frame {
        Frame { sp, pc }
    }

    /// Stack pointer.
    pub fn sp(&self) -> *mut u8 {
        self.sp
    }

    /// Current pc.
    pub fn pc(&self) -> usize {
        self.pc
    }

    /// Where the value of `reg` lives in this frame: a stack slot relative
    /// to `sp`, or the save location `reg_map` records for a register.
    pub fn oopmap_slot(&self, reg: VMReg, reg_map: &RegisterMap) -> Option<*mut u8> {
        if reg.is_stack() {
            Some(self.sp.wrapping_add(reg.stack_offset_in_bytes()))
        } else {
            reg_map.location(reg)
        }
    }
}

/// Where the registers of the frames above were saved.
#[derive(Clone, Debug, Default)]
pub struct RegisterMap {
    locations: SmallVec<[(VMReg, *mut u8); 8]>,
    skip_missing: bool,
}

impl RegisterMap {
    /// An empty map; missing locations are fatal.
    pub fn new() -> RegisterMap {
        RegisterMap::default()
    }

    /// An empty map that treats missing locations as absent values. Used
    /// when the map is known to be partial.
    pub fn skipping_missing() -> RegisterMap {
        RegisterMap {
            locations: SmallVec::new(),
            skip_missing: true,
        }
    }

    /// Whether missing locations are skipped instead of fatal.
    pub fn skip_missing(&self) -> bool {
        self.skip_missing
    }

    /// Records that the value of `reg` is saved at `loc`.
    pub fn set_location(&mut self, reg: VMReg, loc: *mut u8) {
        debug_assert!(reg.is_reg(), "{reg} is not a register");
        match self.locations.iter_mut().find(|(r, _)| *r == reg) {
            Some(entry) => entry.1 = loc,
            None => self.locations.push((reg, loc)),
        }
    }

    /// The save location of `reg`.
    pub fn location(&self, reg: VMReg) -> Option<*mut u8> {
        self.locations
            .iter()
            .find(|(r, _)| *r == reg)
            .map(|(_, loc)| *loc)
    }

    /// Number of recorded registers.
    pub fn len(&self) -> usize {
        self.locations.len()
    }

    /// Whether no register is recorded.
    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }

    /// Forgets every recorded register.
    pub fn clear(&mut self) {
        self.locations.clear();
    }
}

struct DerivedPointerEntry {
    location: *const AtomicUsize,
    base: *const AtomicUsize,
    offset: isize,
}

/// Remembers derived pointers as `(base slot, offset)` while a relocating
/// collection moves their bases, and rebuilds them afterwards.
#[derive(Default)]
pub struct DerivedPointerTable {
    entries: Vec<DerivedPointerEntry>,
}

impl DerivedPointerTable {
    /// An empty table.
    pub fn new() -> DerivedPointerTable {
        DerivedPointerTable::default()
    }

    /// Number of recorded pointers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Recomputes every recorded pointer from the current value of its
    /// base and empties the table.
    ///
    /// # Safety
    ///
    /// Every slot recorded since the last update must still be live.
    pub unsafe fn update_pointers(&mut self) {
        for entry in self.entries.drain(..) {
            let (base, location) = unsafe { (&*entry.base, &*entry.location) };
            let new_base = base.load(Ordering::Relaxed);
            let value = new_base.wrapping_add_signed(entry.offset);
            log::trace!(
                target: "gc::nmethod",
                "updating derived pointer at {:p}: base {new_base:#x} offset {}",
                entry.location,
                entry.offset
            );
            location.store(value, Ordering::Relaxed);
        }
    }
}

impl DerivedOopClosure for DerivedPointerTable {
    fn do_derived_oop(&mut self, base: &AtomicUsize, derived: &AtomicUsize) {
        let base_value = base.load(Ordering::Relaxed);
        let offset = derived.load(Ordering::Relaxed).wrapping_sub(base_value) as isize;
        self.entries.push(DerivedPointerEntry {
            location: derived,
            base,
            offset,
        });
    }
}
