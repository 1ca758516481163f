use super::{TestVm, simple_parts};
use codemeta::environ::{ImmutableOopMapSetBuilder, OopMap, OopMapSet, VMReg};
use codemeta::runtime::{
    DerivedPointerTable, Frame, OopClosure, RegisterMap, Tunables, update_register_map,
};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// Moves every full-width reference by `delta` and records what it saw.
#[derive(Default)]
struct Relocate {
    delta: usize,
    seen: Vec<usize>,
    narrow: Vec<u32>,
}

impl OopClosure for Relocate {
    fn do_oop(&mut self, p: &AtomicUsize) {
        let old = p.load(Ordering::Relaxed);
        self.seen.push(old);
        p.store(old + self.delta, Ordering::Relaxed);
    }

    fn do_narrow_oop(&mut self, p: &AtomicU32) {
        self.narrow.push(p.load(Ordering::Relaxed));
    }
}

fn maps_at(pc_offset: u32, map: OopMap) -> Vec<u8> {
    let mut set = OopMapSet::new();
    set.add_gc_map(pc_offset, map);
    ImmutableOopMapSetBuilder::build(&set)
}

#[test]
fn derived_pointers_follow_a_moved_base() -> anyhow::Result<()> {
    let vm = TestVm::new();

    // Words of the fake frame: base, derived, null, spare.
    let mut map = OopMap::new(8, 0);
    map.set_oop(VMReg::stack_slot(0));
    map.set_derived_oop(VMReg::stack_slot(2), VMReg::stack_slot(0));
    map.set_oop(VMReg::stack_slot(4));
    map.set_oop(VMReg::reg(3));
    let mut parts = simple_parts(vm.method);
    parts.frame_size = 4;
    parts.oop_maps = maps_at(16, map);
    let nm = vm.install(parts)?;

    let mut stack = [0x8000usize, 0x8024, 0, 0];
    let mut reg3 = 0x5000usize;
    let mut reg_map = RegisterMap::new();
    reg_map.set_location(VMReg::reg(3), (&raw mut reg3).cast());
    let fr = Frame::new(stack.as_mut_ptr().cast(), nm.code_begin() + 16);

    let mut table = DerivedPointerTable::new();
    let mut relocate = Relocate {
        delta: 0x1_0000,
        ..Default::default()
    };
    unsafe {
        nm.frame_oops_do(&vm.cc, &fr, &reg_map, &mut relocate, Some(&mut table));
    }
    relocate.seen.sort();
    assert_eq!(relocate.seen, [0x5000, 0x8000]);
    assert_eq!(table.len(), 1);

    unsafe { table.update_pointers() };
    assert_eq!(stack, [0x1_8000, 0x1_8024, 0, 0]);
    assert_eq!(reg3, 0x1_5000);
    Ok(())
}

#[test]
fn compressed_references_and_the_heap_base() -> anyhow::Result<()> {
    let vm = TestVm::with_tunables(Tunables {
        narrow_oop_base: 0x4000_0000,
        ..Tunables::default()
    });

    let mut map = OopMap::new(4, 0);
    map.set_oop(VMReg::stack_slot(0));
    map.set_narrowoop(VMReg::stack_slot(2));
    let mut parts = simple_parts(vm.method);
    parts.oop_maps = maps_at(8, map);
    let nm = vm.install(parts)?;

    // A decoded null in a full-width slot is the heap base.
    let mut stack = [0x4000_0000usize, 0];
    unsafe { stack.as_mut_ptr().add(1).cast::<u32>().write(9) };
    let fr = Frame::new(stack.as_mut_ptr().cast(), nm.code_begin() + 8);

    let mut relocate = Relocate::default();
    unsafe {
        nm.frame_oops_do(&vm.cc, &fr, &RegisterMap::new(), &mut relocate, None);
    }
    assert!(relocate.seen.is_empty());
    assert_eq!(relocate.narrow, [9]);
    assert_eq!(vm.cc.compressed_oops().decode(9), 0x4000_0000 + (9 << 3));
    Ok(())
}

#[test]
fn partial_register_maps() -> anyhow::Result<()> {
    let vm = TestVm::new();

    let mut map = OopMap::new(4, 0);
    map.set_callee_saved(VMReg::stack_slot(0), VMReg::reg(12));
    map.set_oop(VMReg::reg(1));
    map.set_oop(VMReg::stack_slot(2));
    let mut parts = simple_parts(vm.method);
    parts.oop_maps = maps_at(24, map);
    let nm = vm.install(parts)?;

    let mut stack = [0xabcdusize, 0x7000];
    let fr = Frame::new(stack.as_mut_ptr().cast(), nm.code_begin() + 24);
    let map = nm.oop_map_for_pc(fr.pc()).expect("map at 24");
    assert!(nm.oop_map_for_pc(fr.pc() + 1).is_none());

    let mut caller_regs = RegisterMap::skipping_missing();
    update_register_map(&map, &fr, &mut caller_regs);
    let saved = caller_regs.location(VMReg::reg(12)).expect("r12 saved");
    assert_eq!(unsafe { *saved.cast::<usize>() }, 0xabcd);

    // Register 1 has no save location; the partial map skips it.
    let mut relocate = Relocate::default();
    unsafe {
        nm.frame_oops_do(&vm.cc, &fr, &caller_regs, &mut relocate, None);
    }
    assert_eq!(relocate.seen, [0x7000]);
    Ok(())
}

#[test]
#[should_panic(expected = "no oop map")]
fn frames_stop_at_safepoints_only() {
    let vm = TestVm::new();
    let nm = vm
        .install(simple_parts(vm.method))
        .expect("install nmethod");
    let mut stack = [0usize; 2];
    let fr = Frame::new(stack.as_mut_ptr().cast(), nm.code_begin() + 4);
    let mut relocate = Relocate::default();
    unsafe {
        nm.frame_oops_do(&vm.cc, &fr, &RegisterMap::new(), &mut relocate, None);
    }
}
