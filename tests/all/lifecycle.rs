use super::{TestVm, logged, simple_parts};
use codemeta::runtime::{CompilerKind, NMethodMirror, NMethodState, Tunables};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[test]
fn install_then_not_entrant_once() -> anyhow::Result<()> {
    let vm = TestVm::new();
    let nm = vm.new_nmethod(simple_parts(vm.method))?;
    assert_eq!(nm.state(), NMethodState::NotInstalled);
    assert_eq!(vm.cc.metaspace().code(vm.method), None);

    vm.cc.install(&nm)?;
    assert_eq!(nm.state(), NMethodState::InUse);
    assert_eq!(vm.cc.metaspace().code(vm.method), Some(nm.id()));

    assert!(nm.make_not_entrant(&vm.cc));
    assert_eq!(nm.state(), NMethodState::NotEntrant);
    assert_eq!(vm.cc.metaspace().code(vm.method), None);
    assert_eq!(vm.cc.metaspace().decompile_count(vm.method), 1);

    assert!(!nm.make_not_entrant(&vm.cc));
    assert_eq!(vm.cc.metaspace().decompile_count(vm.method), 1);

    // States never move backwards.
    assert!(!nm.make_in_use());
    assert!(!nm.try_transition(NMethodState::InUse));
    assert_eq!(nm.state(), NMethodState::NotEntrant);
    Ok(())
}

#[test]
fn client_compiles_do_not_count_decompiles() -> anyhow::Result<()> {
    let vm = TestVm::new();
    let mut parts = simple_parts(vm.method);
    parts.compiler = CompilerKind::C1;
    let nm = vm.install(parts)?;
    assert!(nm.make_not_entrant(&vm.cc));
    assert_eq!(vm.cc.metaspace().decompile_count(vm.method), 0);
    Ok(())
}

#[test]
fn exactly_one_thread_wins_the_transition() -> anyhow::Result<()> {
    let vm = TestVm::new();
    let nm = vm.install(simple_parts(vm.method))?;
    let winners = AtomicUsize::new(0);

    std::thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(|| {
                if nm.make_not_entrant(&vm.cc) {
                    winners.fetch_add(1, Ordering::Relaxed);
                }
                assert_eq!(nm.state(), NMethodState::NotEntrant);
            });
        }
    });

    assert_eq!(winners.load(Ordering::Relaxed), 1);
    assert_eq!(vm.cc.metaspace().decompile_count(vm.method), 1);
    Ok(())
}

#[test]
fn the_transition_is_logged_once() -> anyhow::Result<()> {
    let vm = TestVm::with_tunables(Tunables {
        log_compilation: true,
        ..Tunables::default()
    });
    let nm = vm.install(simple_parts(vm.define_method(vm.klass, "logged_once")))?;
    let needle = format!("{nm}: made not entrant");
    assert!(logged(&needle).is_empty());

    std::thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(|| nm.make_not_entrant(&vm.cc));
        }
    });
    assert!(!nm.make_not_entrant(&vm.cc));
    assert_eq!(logged(&needle), [needle.clone()]);
    Ok(())
}

#[test]
fn replaced_code_stays_linked_to_its_successor() -> anyhow::Result<()> {
    let vm = TestVm::new();
    let old = vm.install(simple_parts(vm.method))?;
    let new = vm.install(simple_parts(vm.method))?;
    assert_eq!(vm.cc.metaspace().code(vm.method), Some(new.id()));

    // Invalidating the superseded version leaves the method's code alone.
    assert!(old.make_not_entrant(&vm.cc));
    assert_eq!(vm.cc.metaspace().code(vm.method), Some(new.id()));
    Ok(())
}

#[test]
fn osr_compiles_live_in_their_class() -> anyhow::Result<()> {
    let vm = TestVm::new();
    let mut parts = simple_parts(vm.method);
    parts.entry_bci = 7;
    let osr = vm.install(parts)?;
    assert!(osr.is_osr_method());
    assert_eq!(osr.entry_bci(), 7);
    assert_eq!(vm.cc.metaspace().osr_nmethods(vm.klass), [osr.id()]);
    assert_eq!(vm.cc.metaspace().code(vm.method), None);

    assert!(osr.make_not_entrant(&vm.cc));
    assert!(vm.cc.metaspace().osr_nmethods(vm.klass).is_empty());
    Ok(())
}

#[test]
fn mirrors_lose_their_entry_point() -> anyhow::Result<()> {
    let vm = TestVm::new();
    let mirror = Arc::new(NMethodMirror::new());
    let mut parts = simple_parts(vm.method);
    parts.offsets.verified_entry = 8;
    parts.mirror = Some(Arc::clone(&mirror));

    let nm = vm.new_nmethod(parts)?;
    assert_eq!(mirror.nmethod(), None);
    vm.cc.install(&nm)?;
    assert_eq!(mirror.nmethod(), Some(nm.id()));
    assert_eq!(mirror.entry_point(), nm.code_begin() + 8);

    assert!(nm.make_not_entrant(&vm.cc));
    assert_eq!(mirror.entry_point(), 0);
    // The nmethod stays reachable for its running activations.
    assert_eq!(mirror.nmethod(), Some(nm.id()));
    Ok(())
}

#[test]
fn entry_barrier_follows_arming() -> anyhow::Result<()> {
    let vm = TestVm::new();
    let nm = vm.install(simple_parts(vm.method))?;

    assert!(nm.is_entry_barrier_armed(&vm.cc));
    vm.cc.on_gc_marking_cycle_start();
    assert!(nm.run_entry_barrier(&vm.cc));
    assert!(!nm.is_entry_barrier_armed(&vm.cc));
    assert_eq!(nm.gc_epoch(), vm.cc.gc_epoch());
    vm.cc.on_gc_marking_cycle_finish();

    vm.cc.arm_all_nmethods();
    assert!(nm.is_entry_barrier_armed(&vm.cc));
    assert!(nm.run_entry_barrier(&vm.cc));
    assert!(!nm.is_entry_barrier_armed(&vm.cc));

    assert!(nm.make_not_entrant(&vm.cc));
    assert!(nm.entry_barrier().is_not_entrant());
    assert!(!nm.run_entry_barrier(&vm.cc));
    Ok(())
}

#[test]
fn without_entry_barriers_everything_may_be_on_stack() -> anyhow::Result<()> {
    let vm = TestVm::with_tunables(Tunables {
        entry_barriers: false,
        ..Tunables::default()
    });
    let nm = vm.install(simple_parts(vm.method))?;
    assert!(!nm.is_entry_barrier_armed(&vm.cc));
    assert!(nm.run_entry_barrier(&vm.cc));

    for _ in 0..3 {
        vm.cc.on_gc_marking_cycle_start();
        vm.cc.on_gc_marking_cycle_finish();
    }
    assert!(!nm.is_maybe_on_stack(&vm.cc));
    assert!(nm.make_not_entrant(&vm.cc));
    assert!(nm.is_maybe_on_stack(&vm.cc));
    Ok(())
}
