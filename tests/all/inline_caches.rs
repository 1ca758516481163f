use super::{TestVm, simple_parts};
use codemeta::environ::{Relocation, RelocationRecorder};
use codemeta::runtime::{CallKind, CompiledIcLocker, IcTarget, Metadata, NMethodParts};

/// `Foo::bar` with one virtual call at offset 10.
fn virtual_caller(vm: &TestVm) -> NMethodParts {
    let mut parts = simple_parts(vm.method);
    let mut relocs = RelocationRecorder::default();
    relocs.push(Relocation::VirtualCall {
        offset: 10,
        site: 0,
        method_index: 0,
    });
    parts.relocations = relocs.finish();
    parts
}

#[test]
fn calls_into_not_entrant_code_are_cleaned() -> anyhow::Result<()> {
    let vm = TestVm::new();
    let callee_method = vm.define_method(vm.klass, "callee");
    let callee = vm.install(simple_parts(callee_method))?;
    let caller = vm.install(virtual_caller(&vm))?;

    let ic = caller.call_site(0);
    assert_eq!(ic.kind(), CallKind::Virtual);
    assert!(ic.is_clean(&vm.cc));
    assert_eq!(ic.destination(), vm.cc.stubs().resolve_virtual_call());
    {
        let locker = CompiledIcLocker::new(&vm.cc);
        ic.set_to_monomorphic(
            &locker,
            IcTarget::Compiled {
                entry: callee.verified_entry_point(),
                cached: Some(Metadata::Klass(vm.klass)),
            },
        );
    }
    assert!(!ic.is_clean(&vm.cc));

    caller.cleanup_inline_caches(&vm.cc, false, false);
    assert_eq!(ic.destination(), callee.verified_entry_point());

    assert!(callee.make_not_entrant(&vm.cc));
    caller.cleanup_inline_caches(&vm.cc, false, false);
    assert!(ic.is_clean(&vm.cc));
    assert_eq!(ic.cached_metadata(), None);
    Ok(())
}

#[test]
fn receiver_checks_against_unloaded_classes_are_cleaned() -> anyhow::Result<()> {
    let vm = TestVm::new();
    let callee_method = vm.define_method(vm.klass, "callee");
    let callee = vm.install(simple_parts(callee_method))?;
    let caller = vm.install(virtual_caller(&vm))?;
    let receiver = vm.define_unloadable_klass("Receiver");

    let ic = caller.call_site(0);
    {
        let locker = CompiledIcLocker::new(&vm.cc);
        ic.set_to_monomorphic(
            &locker,
            IcTarget::Compiled {
                entry: callee.entry_point(),
                cached: Some(Metadata::Klass(receiver)),
            },
        );
    }
    vm.cc.metaspace().unload_klass(receiver);

    // Receiver metadata is only looked at when classes were unloaded.
    caller.cleanup_inline_caches(&vm.cc, false, false);
    assert!(!ic.is_clean(&vm.cc));

    caller.cleanup_inline_caches(&vm.cc, true, false);
    assert!(ic.is_clean(&vm.cc));
    Ok(())
}

#[test]
fn static_calls_into_the_interpreter() -> anyhow::Result<()> {
    let vm = TestVm::new();
    let helper = vm.define_unloadable_klass("Helper");
    let target = vm.define_method(helper, "run");

    let mut parts = simple_parts(vm.method);
    parts.offsets.stub = 48;
    parts.metadata.push(Metadata::Method(target));
    parts.immediate_metadata = vec![None];
    let mut relocs = RelocationRecorder::default();
    relocs.push(Relocation::StaticCall {
        offset: 10,
        site: 0,
        method_index: 2,
    });
    relocs.push(Relocation::StaticStub {
        offset: 48,
        site: 0,
    });
    relocs.push(Relocation::Metadata {
        offset: 50,
        index: 0,
        imm: 0,
    });
    parts.relocations = relocs.finish();
    let nm = vm.install(parts)?;

    let ic = nm.call_site(0);
    assert_eq!(ic.kind(), CallKind::Static);
    assert_eq!(ic.site().stub_destination(), Some(0));
    {
        let locker = CompiledIcLocker::new(&vm.cc);
        ic.set_to_monomorphic(
            &locker,
            IcTarget::Interpreted {
                method: target,
                c2i_entry: 0x1234,
            },
        );
    }
    assert_eq!(ic.destination(), nm.stub_begin());
    assert_eq!(ic.site().stub_destination(), Some(0x1234));
    assert_eq!(nm.immediate_metadata(0), Some(Metadata::Method(target)));

    nm.cleanup_inline_caches(&vm.cc, false, false);
    assert_eq!(nm.immediate_metadata(0), Some(Metadata::Method(target)));

    // The stub's method goes away with its class; the call itself still
    // targets live code.
    vm.cc.metaspace().unload_klass(helper);
    nm.cleanup_inline_caches(&vm.cc, true, false);
    assert_eq!(nm.immediate_metadata(0), None);
    assert_eq!(ic.destination(), nm.stub_begin());

    nm.cleanup_inline_caches(&vm.cc, false, true);
    assert!(ic.is_clean(&vm.cc));
    assert_eq!(ic.site().stub_destination(), Some(0));
    Ok(())
}

#[test]
fn clearing_resets_every_site() -> anyhow::Result<()> {
    let vm = TestVm::new();
    let callee = vm.install(simple_parts(vm.define_method(vm.klass, "callee")))?;

    let mut parts = simple_parts(vm.method);
    let mut relocs = RelocationRecorder::default();
    relocs.push(Relocation::OptVirtualCall {
        offset: 4,
        site: 1,
        method_index: 0,
    });
    relocs.push(Relocation::VirtualCall {
        offset: 12,
        site: 0,
        method_index: 0,
    });
    parts.relocations = relocs.finish();
    let nm = vm.install(parts)?;
    assert_eq!(nm.call_site_count(), 2);
    assert_eq!(nm.call_site(1).kind(), CallKind::OptVirtual);

    {
        let locker = CompiledIcLocker::new(&vm.cc);
        for site in 0..2 {
            nm.call_site(site).set_to_monomorphic(
                &locker,
                IcTarget::Compiled {
                    entry: callee.verified_entry_point(),
                    cached: None,
                },
            );
        }
    }
    assert!(!nm.call_site(0).is_clean(&vm.cc));
    assert!(!nm.call_site(1).is_clean(&vm.cc));

    nm.clear_inline_caches(&vm.cc);
    assert_eq!(
        nm.call_site(0).destination(),
        vm.cc.stubs().resolve_virtual_call()
    );
    assert_eq!(
        nm.call_site(1).destination(),
        vm.cc.stubs().resolve_opt_virtual_call()
    );
    Ok(())
}

#[test]
#[should_panic(expected = "no stub to reach the interpreter")]
fn virtual_calls_have_no_interpreter_stub() {
    let vm = TestVm::new();
    let caller = vm.install(virtual_caller(&vm)).expect("install caller");
    let locker = CompiledIcLocker::new(&vm.cc);
    caller.call_site(0).set_to_monomorphic(
        &locker,
        IcTarget::Interpreted {
            method: vm.method,
            c2i_entry: 0x1000,
        },
    );
}
