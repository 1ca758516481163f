use super::{TestVm, parts_with_pcs, simple_parts};
use codemeta::environ::{Dependency, DependencyRecorder, Relocation, RelocationRecorder};
use codemeta::runtime::{CodeCacheError, Tunables};
use proptest::prelude::*;

#[test]
fn pcs_map_back_to_their_nmethod() -> anyhow::Result<()> {
    let vm = TestVm::new();
    let a = vm.install(simple_parts(vm.method))?;
    let b = vm.install(parts_with_pcs(vm.method, 128, &[4]))?;

    for nm in [&a, &b] {
        let found = vm.cc.find_nmethod(nm.code_begin()).expect("first byte");
        assert_eq!(found.id(), nm.id());
        let found = vm.cc.find_nmethod(nm.code_end() - 1).expect("last byte");
        assert_eq!(found.id(), nm.id());
        assert_eq!(vm.cc.nmethod(nm.id()).map(|n| n.id()), Some(nm.id()));
    }
    assert!(vm.cc.find_nmethod(vm.cc.stubs().uncommon_trap()).is_none());
    assert!(vm.cc.find_nmethod(0).is_none());

    assert_eq!(vm.cc.nmethod_count(), 2);
    let mut ids: Vec<_> = vm.cc.nmethods().iter().map(|n| n.id()).collect();
    ids.sort();
    assert_eq!(ids, [a.id(), b.id()]);
    assert!(format!("{b}").ends_with("Foo::bar"));
    Ok(())
}

#[test]
fn full_cache_rejects_new_code() {
    let vm = TestVm::with_tunables(Tunables {
        code_cache_capacity: 256,
        ..Tunables::default()
    });
    let err = vm
        .cc
        .new_nmethod(parts_with_pcs(vm.method, 512, &[]))
        .expect_err("cache holds only 256 bytes");
    match err {
        CodeCacheError::Full {
            requested,
            available,
        } => {
            assert!(requested > 512);
            assert_eq!(available, 256);
        }
        other => panic!("unexpected error {other}"),
    }
    assert_eq!(vm.cc.nmethod_count(), 0);
    assert_eq!(vm.cc.unallocated_capacity(), 256);
}

#[test]
fn malformed_parts_are_rejected() {
    let vm = TestVm::new();

    let mut parts = simple_parts(vm.method);
    parts.code.clear();
    let err = vm.cc.new_nmethod(parts).expect_err("no code");
    assert!(matches!(err, CodeCacheError::Malformed(_)));
    assert!(format!("{err:#}").contains("no instructions"), "{err:#}");

    let mut parts = simple_parts(vm.method);
    let mut deps = DependencyRecorder::default();
    deps.assert_dependency(Dependency::LeafType { context: 9 });
    parts.dependencies = deps.finish();
    let err = vm.cc.new_nmethod(parts).expect_err("missing metadata");
    assert!(format!("{err:#}").contains("names missing metadata"), "{err:#}");

    let mut parts = simple_parts(vm.method);
    let mut relocs = RelocationRecorder::default();
    relocs.push(Relocation::StaticCall {
        offset: 10,
        site: 0,
        method_index: 1,
    });
    relocs.push(Relocation::StaticStub {
        offset: 40,
        site: 0,
    });
    parts.relocations = relocs.finish();
    let err = vm.cc.new_nmethod(parts).expect_err("stub without a method slot");
    assert!(format!("{err:#}").contains("has no method slot"), "{err:#}");

    let mut parts = simple_parts(vm.method);
    let mut relocs = RelocationRecorder::default();
    relocs.push(Relocation::VirtualCall {
        offset: 10,
        site: 0x7fff_ffff,
        method_index: 0,
    });
    parts.relocations = relocs.finish();
    let err = vm.cc.new_nmethod(parts).expect_err("call site out of range");
    assert!(format!("{err:#}").contains("names call site"), "{err:#}");

    assert_eq!(vm.cc.nmethod_count(), 0);
}

#[test]
#[should_panic(expected = "Foo::bar: no oop at index 3")]
fn oop_indices_are_bounds_checked() {
    let vm = TestVm::new();
    let mut parts = simple_parts(vm.method);
    parts.oops = vec![0x1000, 0x2000];
    let nm = vm.install(parts).expect("install nmethod");
    assert_eq!(nm.oop_at(0), 0);
    assert_eq!(nm.oop_at(2), 0x2000);
    nm.oop_at(3);
}

#[test]
#[should_panic(expected = "Foo::bar: no immediate oop slot 0")]
fn immediate_slots_are_bounds_checked() {
    let vm = TestVm::new();
    let nm = vm.install(simple_parts(vm.method)).expect("install nmethod");
    nm.immediate_oop(0);
}

#[test]
fn install_only_once_and_only_here() -> anyhow::Result<()> {
    let vm = TestVm::new();
    let nm = vm.install(simple_parts(vm.method))?;
    assert!(vm.cc.install(&nm).is_err());

    let elsewhere = TestVm::new();
    let stranger = elsewhere.new_nmethod(simple_parts(elsewhere.method))?;
    let err = vm.cc.install(&stranger).expect_err("foreign nmethod");
    assert!(err.to_string().contains("not registered"), "{err}");
    Ok(())
}

#[test]
fn tunables_from_a_file() -> anyhow::Result<()> {
    let path = std::env::temp_dir().join(format!("codemeta-tunables-{}.toml", std::process::id()));
    std::fs::write(
        &path,
        "[code-cache]\ncode-cache-capacity = \"1Mi\"\ncold-gc-count = 2\n",
    )?;
    let tunables = Tunables::from_file(&path);
    std::fs::remove_file(&path)?;
    let tunables = tunables?;
    assert_eq!(tunables.code_cache_capacity, 1 << 20);
    assert_eq!(tunables.cold_gc_count, 2);

    let vm = TestVm::with_tunables(tunables);
    assert_eq!(vm.cc.cold_gc_count(), 2);
    assert_eq!(vm.cc.unallocated_capacity(), 1 << 20);

    let missing = std::env::temp_dir().join("codemeta-tunables-does-not-exist.toml");
    assert!(Tunables::from_file(&missing).is_err());
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn lookups_only_hit_registered_code(lens in prop::collection::vec(1usize..256, 1..8)) {
        let vm = TestVm::new();
        let nmethods: Vec<_> = lens
            .iter()
            .map(|len| vm.install(parts_with_pcs(vm.method, *len, &[])).expect("install"))
            .collect();
        for nm in &nmethods {
            for pc in [nm.code_begin(), nm.code_begin() + nm.code().len() / 2, nm.code_end() - 1] {
                let found = vm.cc.find_nmethod(pc).expect("pc inside code");
                prop_assert_eq!(found.id(), nm.id());
            }
            if let Some(found) = vm.cc.find_nmethod(nm.code_end()) {
                prop_assert_ne!(found.id(), nm.id());
            }
        }
    }
}
