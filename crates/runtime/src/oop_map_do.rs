//! Applying an oop map to a frame.

use crate::frame::{CompressedOops, DerivedOopClosure, Frame, OopClosure, RegisterMap};
use codemeta_environ::{ImmutableOopMap, OopMapKinds, OopMapValueKind, VMReg};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

fn resolve(fr: &Frame, reg: VMReg, reg_map: &RegisterMap) -> Option<*mut u8> {
    match fr.oopmap_slot(reg, reg_map) {
        Some(loc) => Some(loc),
        None if reg_map.skip_missing() => None,
        None => panic!(
            "location {reg} of frame at pc {:#x} is not in the register map",
            fr.pc()
        ),
    }
}

/// Visits every reference slot `map` describes in `fr`.
///
/// Derived pointers go first, while their bases still hold the values the
/// derivation was computed from; they are only visited when `derived` is
/// given. Null slots, and full-width slots holding the compressed heap base
/// (a decoded null), are skipped.
///
/// # Panics
///
/// Panics if a location cannot be resolved and `reg_map` does not skip
/// missing locations.
///
/// # Safety
///
/// `fr` must be a live frame stopped at the pc `map` was recorded for, and
/// every location `reg_map` records must be valid for reads and writes.
/// Full-width slots must be aligned for `usize`.
pub unsafe fn oops_do(
    map: &ImmutableOopMap<'_>,
    fr: &Frame,
    reg_map: &RegisterMap,
    oops: &mut dyn OopClosure,
    derived: Option<&mut dyn DerivedOopClosure>,
    compressed_oops: &CompressedOops,
) {
    if let Some(derived) = derived {
        if map.has_derived_oops() {
            for omv in map.iter_kinds(OopMapKinds::DERIVED_OOP) {
                let Some(loc) = resolve(fr, omv.reg(), reg_map) else {
                    continue;
                };
                let Some(base_loc) = omv.content_reg().and_then(|b| resolve(fr, b, reg_map))
                else {
                    continue;
                };
                let (base, loc) = unsafe {
                    (
                        &*base_loc.cast::<AtomicUsize>(),
                        &*loc.cast::<AtomicUsize>(),
                    )
                };
                let base_value = base.load(Ordering::Relaxed);
                if base_value == 0 || compressed_oops.is_base(base_value) {
                    continue;
                }
                derived.do_derived_oop(base, loc);
            }
        }
    }

    for omv in map.iter_kinds(OopMapKinds::OOP | OopMapKinds::NARROW_OOP) {
        let Some(loc) = resolve(fr, omv.reg(), reg_map) else {
            continue;
        };
        if omv.is_oop() {
            let slot = unsafe { &*loc.cast::<AtomicUsize>() };
            let value = slot.load(Ordering::Relaxed);
            if value == 0 || compressed_oops.is_base(value) {
                continue;
            }
            oops.do_oop(slot);
        } else {
            oops.do_narrow_oop(unsafe { &*loc.cast::<AtomicU32>() });
        }
    }
}

/// Visits every slot of entries with kind `kind`, nulls included.
///
/// Narrow entries go to [`OopClosure::do_narrow_oop`], all others to
/// [`OopClosure::do_oop`].
///
/// # Safety
///
/// As for [`oops_do`].
pub unsafe fn all_type_do(
    map: &ImmutableOopMap<'_>,
    fr: &Frame,
    reg_map: &RegisterMap,
    kind: OopMapValueKind,
    f: &mut dyn OopClosure,
) {
    for omv in map.iter_kinds(OopMapKinds::from(kind)) {
        let Some(loc) = resolve(fr, omv.reg(), reg_map) else {
            continue;
        };
        if omv.is_narrowoop() {
            f.do_narrow_oop(unsafe { &*loc.cast::<AtomicU32>() });
        } else {
            f.do_oop(unsafe { &*loc.cast::<AtomicUsize>() });
        }
    }
}

/// Records in `reg_map` where `fr` saved the callee-saved registers `map`
/// lists, so the caller's frame can find them.
///
/// Sorted maps list callee-saved entries first, so this stops at the first
/// other entry.
pub fn update_register_map(map: &ImmutableOopMap<'_>, fr: &Frame, reg_map: &mut RegisterMap) {
    for omv in map.iter() {
        if !omv.is_callee_saved() {
            break;
        }
        let Some(content) = omv.content_reg() else {
            continue;
        };
        if let Some(loc) = resolve(fr, omv.reg(), reg_map) {
            reg_map.set_location(content, loc);
        }
    }
}
