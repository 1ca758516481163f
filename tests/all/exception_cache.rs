use super::{TestVm, simple_parts};
use codemeta::runtime::{CodeCache, CodeCacheError, Metaspace, Tunables};
use std::sync::Arc;

fn vm_with_cache_size(exception_cache_size: usize) -> TestVm {
    TestVm::with_tunables(Tunables {
        exception_cache_size,
        ..Tunables::default()
    })
}

#[test]
fn full_node_gets_a_new_predecessor() -> anyhow::Result<()> {
    let vm = vm_with_cache_size(3);
    let nm = vm.install(simple_parts(vm.method))?;
    let e = vm.define_unloadable_klass("E");
    let base = nm.code_begin();

    for pc in 1..=3 {
        nm.add_handler_for_exception_and_pc(&vm.cc, e, base + pc, base + 40 + pc);
    }
    assert_eq!(nm.exception_cache_len(), 1);
    let head = nm.exception_cache().expect("one node");
    assert_eq!(head.count(), 3);
    assert_eq!(head.capacity(), 3);

    nm.add_handler_for_exception_and_pc(&vm.cc, e, base + 4, base + 44);
    assert_eq!(nm.exception_cache_len(), 2);
    let head = nm.exception_cache().expect("new head");
    assert_eq!(head.entries().collect::<Vec<_>>(), [(base + 4, base + 44)]);
    assert_eq!(head.next().map(|n| n.count()), Some(3));

    for pc in 1..=4 {
        assert_eq!(
            nm.handler_for_exception_and_pc(e, base + pc),
            Some(base + 40 + pc)
        );
    }
    assert_eq!(nm.handler_for_exception_and_pc(e, base + 5), None);
    Ok(())
}

#[test]
fn pairs_are_keyed_by_class() -> anyhow::Result<()> {
    let vm = TestVm::new();
    let nm = vm.install(simple_parts(vm.method))?;
    let a = vm.define_unloadable_klass("A");
    let b = vm.define_unloadable_klass("B");
    let base = nm.code_begin();

    nm.add_handler_for_exception_and_pc(&vm.cc, a, base + 8, base + 32);
    nm.add_handler_for_exception_and_pc(&vm.cc, b, base + 8, base + 48);
    // Re-adding a known pair does not take a slot.
    nm.add_handler_for_exception_and_pc(&vm.cc, a, base + 8, base + 32);

    assert_eq!(nm.exception_cache_len(), 2);
    assert_eq!(nm.handler_for_exception_and_pc(a, base + 8), Some(base + 32));
    assert_eq!(nm.handler_for_exception_and_pc(b, base + 8), Some(base + 48));
    assert_eq!(nm.handler_for_exception_and_pc(vm.klass, base + 8), None);
    let counts: Vec<usize> = std::iter::successors(nm.exception_cache(), |n| n.next())
        .map(|n| n.count())
        .collect();
    assert_eq!(counts, [1, 1]);
    Ok(())
}

#[test]
fn readers_race_with_inserts() -> anyhow::Result<()> {
    let vm = vm_with_cache_size(2);
    let nm = vm.install(simple_parts(vm.method))?;
    let e = vm.define_unloadable_klass("E");
    let base = nm.code_begin();

    std::thread::scope(|s| {
        for t in 0..4usize {
            let nm = &nm;
            let cc = &vm.cc;
            s.spawn(move || {
                for i in 0..8usize {
                    let pc = base + 1 + t * 8 + i;
                    nm.add_handler_for_exception_and_pc(cc, e, pc, pc + 1000);
                    assert_eq!(nm.handler_for_exception_and_pc(e, pc), Some(pc + 1000));
                }
            });
        }
    });

    let total: usize = std::iter::successors(nm.exception_cache(), |n| n.next())
        .map(|n| n.count())
        .sum();
    assert_eq!(total, 32);
    for pc in base + 1..base + 33 {
        assert_eq!(nm.handler_for_exception_and_pc(e, pc), Some(pc + 1000));
    }
    Ok(())
}

#[test]
fn unloaded_classes_are_cleaned_and_purged() -> anyhow::Result<()> {
    let vm = TestVm::new();
    let nm = vm.install(simple_parts(vm.method))?;
    let live = vm.define_unloadable_klass("Live");
    let dead = vm.define_unloadable_klass("Dead");
    let base = nm.code_begin();

    nm.add_handler_for_exception_and_pc(&vm.cc, dead, base + 4, base + 20);
    nm.add_handler_for_exception_and_pc(&vm.cc, live, base + 4, base + 24);
    nm.add_handler_for_exception_and_pc(&vm.cc, dead, base + 6, base + 28);
    assert_eq!(nm.exception_cache_len(), 2);

    vm.cc
        .metaspace()
        .unload_loader(vm.cc.metaspace().klass_loader(dead));
    nm.clean_exception_cache(&vm.cc);

    assert_eq!(nm.exception_cache_len(), 1);
    assert_eq!(nm.handler_for_exception_and_pc(dead, base + 4), None);
    assert_eq!(nm.handler_for_exception_and_pc(live, base + 4), Some(base + 24));

    // The unlinked node waits for a global synchronization point.
    assert_eq!(vm.cc.pending_exception_cache_purges(), 1);
    assert_eq!(unsafe { vm.cc.purge_exception_caches() }, 1);
    assert_eq!(vm.cc.pending_exception_cache_purges(), 0);
    Ok(())
}

#[test]
fn inserts_unlink_a_dead_head() -> anyhow::Result<()> {
    let vm = TestVm::new();
    let nm = vm.install(simple_parts(vm.method))?;
    let dead = vm.define_unloadable_klass("Dead");
    let live = vm.define_unloadable_klass("Live");
    let base = nm.code_begin();

    nm.add_handler_for_exception_and_pc(&vm.cc, dead, base + 4, base + 20);
    vm.cc
        .metaspace()
        .unload_loader(vm.cc.metaspace().klass_loader(dead));

    nm.add_handler_for_exception_and_pc(&vm.cc, live, base + 4, base + 24);
    assert_eq!(nm.exception_cache_len(), 1);
    assert_eq!(
        nm.exception_cache().map(|n| n.exception_type()),
        Some(live)
    );
    assert_eq!(unsafe { vm.cc.purge_exception_caches() }, 1);
    Ok(())
}

#[test]
fn nodes_without_room_are_refused() {
    let tunables = Tunables {
        exception_cache_size: 0,
        ..Tunables::default()
    };
    let err = CodeCache::new(tunables, Arc::new(Metaspace::new()))
        .err()
        .expect("zero-sized nodes");
    assert!(matches!(err, CodeCacheError::InvalidTunables(_)));
}

#[test]
fn single_slot_nodes_keep_every_handler() -> anyhow::Result<()> {
    let vm = vm_with_cache_size(1);
    let nm = vm.install(simple_parts(vm.method))?;
    let e = vm.define_unloadable_klass("E");
    let base = nm.code_begin();

    nm.add_handler_for_exception_and_pc(&vm.cc, e, base + 1, base + 41);
    assert_eq!(nm.handler_for_exception_and_pc(e, base + 1), Some(base + 41));
    nm.add_handler_for_exception_and_pc(&vm.cc, e, base + 2, base + 42);
    assert_eq!(nm.exception_cache_len(), 2);
    assert_eq!(nm.handler_for_exception_and_pc(e, base + 1), Some(base + 41));
    assert_eq!(nm.handler_for_exception_and_pc(e, base + 2), Some(base + 42));
    Ok(())
}
