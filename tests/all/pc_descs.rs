use super::{TestVm, parts_with_pcs};
use codemeta::environ::{
    HandlerEntry, HandlerTableBuilder, ImplicitExceptionTableBuilder, Relocation,
    RelocationRecorder,
};
use codemeta::runtime::{AsyncStackWalkScope, CALL_INSTRUCTION_SIZE, Metadata};

#[test]
fn scenario_a() -> anyhow::Result<()> {
    let vm = TestVm::new();
    let nm = vm.install(parts_with_pcs(vm.method, 64, &[10, 20, 30]))?;
    let base = nm.code_begin();

    let pd = nm.find_pc_desc(base + 10, false).expect("exact hit");
    assert_eq!(pd.pc_offset(), 10);
    assert_eq!(pd.real_pc(base), base + 10);

    let pd = nm.find_pc_desc(base + 15, true).expect("approximate hit");
    assert_eq!(pd.pc_offset(), 20);

    assert!(nm.find_pc_desc(base + 100_000, true).is_none());
    assert!(nm.find_pc_desc(base + 15, false).is_none());
    // The upper sentinel is never an answer.
    assert!(nm.find_pc_desc(base + 31, true).is_none());
    Ok(())
}

#[test]
fn pcs_before_the_code_find_nothing() -> anyhow::Result<()> {
    let vm = TestVm::new();
    let nm = vm.install(parts_with_pcs(vm.method, 64, &[10]))?;
    assert!(nm.find_pc_desc(nm.code_begin() - 1, true).is_none());
    assert!(nm.pc_desc_near(nm.code_begin()).is_some());
    Ok(())
}

#[test]
fn lookups_fill_the_cache_outside_async_walks() -> anyhow::Result<()> {
    let vm = TestVm::new();
    let nm = vm.install(parts_with_pcs(vm.method, 64, &[10, 20, 30]))?;
    let base = nm.code_begin();

    {
        let _walk = AsyncStackWalkScope::enter();
        assert_eq!(nm.pc_desc_at(base + 20).map(|pd| pd.pc_offset()), Some(20));
    }
    assert_eq!(nm.pc_desc_container().cached_indices(), [0; 4]);

    assert_eq!(nm.pc_desc_at(base + 20).map(|pd| pd.pc_offset()), Some(20));
    assert_eq!(nm.pc_desc_container().cached_indices()[0], 2);
    Ok(())
}

#[test]
fn concurrent_lookups_agree() -> anyhow::Result<()> {
    let vm = TestVm::new();
    let offsets: Vec<i32> = (1..200).map(|i| i * 3).collect();
    let nm = vm.install(parts_with_pcs(vm.method, 1024, &offsets))?;
    let base = nm.code_begin();

    std::thread::scope(|s| {
        for t in 0..4 {
            let nm = &nm;
            let offsets = &offsets;
            s.spawn(move || {
                for round in 0..20 {
                    for (i, &off) in offsets.iter().enumerate() {
                        if (i + t + round) % 3 != 0 {
                            continue;
                        }
                        let exact = nm.find_pc_desc(base + off as usize, false);
                        assert_eq!(exact.map(|pd| pd.pc_offset()), Some(off));
                        let near = nm.find_pc_desc(base + off as usize - 1, true);
                        assert_eq!(near.map(|pd| pd.pc_offset()), Some(off));
                    }
                }
            });
        }
    });
    Ok(())
}

#[test]
fn calls_polls_and_attached_methods() -> anyhow::Result<()> {
    let vm = TestVm::new();
    let callee = vm.define_method(vm.klass, "callee");
    let mut parts = parts_with_pcs(vm.method, 64, &[15, 40]);
    parts.metadata.push(Metadata::Method(callee));

    let mut relocs = RelocationRecorder::default();
    relocs.push(Relocation::StaticCall {
        offset: 10,
        site: 0,
        method_index: 2,
    });
    relocs.push(Relocation::RuntimeCall { offset: 20 });
    relocs.push(Relocation::Poll { offset: 30 });
    relocs.push(Relocation::PollReturn { offset: 40 });
    parts.relocations = relocs.finish();

    let nm = vm.install(parts)?;
    let base = nm.code_begin();

    assert_eq!(nm.attached_method(base + 10), Some(callee));
    assert_eq!(nm.attached_method(base + 20), None);
    assert_eq!(
        nm.attached_method_before_pc(base + 10 + CALL_INSTRUCTION_SIZE as usize),
        Some(callee)
    );
    assert_eq!(nm.attached_method_before_pc(base + 12), None);

    assert!(nm.is_at_poll_or_poll_return(base + 30));
    assert!(!nm.is_at_poll_return(base + 30));
    assert!(nm.is_at_poll_return(base + 40));
    assert!(!nm.is_at_poll_or_poll_return(base + 31));

    assert_eq!(nm.call_site_count(), 1);
    Ok(())
}

#[test]
fn exception_tables() -> anyhow::Result<()> {
    let vm = TestVm::new();
    let mut parts = parts_with_pcs(vm.method, 64, &[20]);

    let mut nul_chk = ImplicitExceptionTableBuilder::default();
    nul_chk.append(8, 48);
    nul_chk.append(12, 12);
    parts.nul_chk_table = nul_chk.to_vec();

    let mut handlers = HandlerTableBuilder::default();
    handlers.add_handlers(
        20,
        &[
            HandlerEntry {
                bci: 7,
                scope_depth: 0,
                handler_offset: 50,
            },
            HandlerEntry {
                bci: 9,
                scope_depth: 1,
                handler_offset: 56,
            },
        ],
    );
    parts.handler_table = handlers.to_vec();

    let nm = vm.install(parts)?;
    let base = nm.code_begin();

    assert_eq!(
        nm.continuation_for_implicit_exception(&vm.cc, base + 8),
        Some(base + 48)
    );
    assert_eq!(
        nm.continuation_for_implicit_exception(&vm.cc, base + 12),
        Some(vm.cc.stubs().uncommon_trap())
    );
    assert_eq!(nm.continuation_for_implicit_exception(&vm.cc, base + 9), None);

    assert_eq!(nm.handler_for_bci(base + 20, 7, 0), Some(base + 50));
    assert_eq!(nm.handler_for_bci(base + 20, 9, 1), Some(base + 56));
    assert_eq!(nm.handler_for_bci(base + 20, 9, 0), None);
    assert_eq!(nm.handler_for_bci(base + 24, 7, 0), None);
    Ok(())
}
