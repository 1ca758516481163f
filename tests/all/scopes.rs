use super::TestVm;
use codemeta::environ::{
    DebugInfoRecorder, Location, LocationType, MonitorValue, ObjectValue, PcDescFlags,
    ScopeRecord, ScopeValue,
};
use codemeta::runtime::{Metadata, MonitorOwner, NMethodParts, ScopeDesc};
use std::rc::Rc;

/// An nmethod for `Foo::bar` with `Foo::inlined` inlined at bci 4, and a
/// scalar-replaced `Point` whose lock was elided in the inlinee.
fn inlined_parts(vm: &TestVm) -> NMethodParts {
    let inlined = vm.define_method(vm.klass, "inlined");
    let point = vm.cc.metaspace().define_klass("Point", vm.loader);

    let mut parts = NMethodParts::new(vm.method, vec![0x90; 128]);
    parts.metadata = vec![
        Metadata::Method(vm.method),
        Metadata::Method(inlined),
        Metadata::Klass(point),
    ];

    let point_value = ObjectValue {
        id: 1,
        klass: 3,
        is_auto_box: false,
        fields: vec![ScopeValue::ConstantInt(3), ScopeValue::ConstantInt(4)],
    };
    let outer_locals = [
        ScopeValue::Location(Location::on_stack(LocationType::Oop, 16)),
        ScopeValue::ConstantInt(42),
        ScopeValue::Object(1),
    ];
    let inner_locals = [ScopeValue::Object(1), ScopeValue::ConstantLong(-7)];
    let inner_expressions = [ScopeValue::Location(Location::in_register(
        LocationType::Normal,
        2,
    ))];
    let inner_monitors = [MonitorValue {
        owner: ScopeValue::Object(1),
        basic_lock: Location::on_stack(LocationType::Normal, 32),
        eliminated: true,
    }];

    let mut recorder = DebugInfoRecorder::new();
    recorder.add_pc(
        24,
        PcDescFlags::SHOULD_REEXECUTE | PcDescFlags::RETURN_OOP,
        &[point_value],
        &[
            ScopeRecord {
                method_index: 1,
                bci: 4,
                locals: &outer_locals,
                expressions: &[],
                monitors: &[],
            },
            ScopeRecord {
                method_index: 2,
                bci: 11,
                locals: &inner_locals,
                expressions: &inner_expressions,
                monitors: &inner_monitors,
            },
        ],
    );
    recorder.add_pc(
        40,
        PcDescFlags::empty(),
        &[],
        &[ScopeRecord {
            method_index: 1,
            bci: 9,
            locals: &outer_locals[..2],
            expressions: &[],
            monitors: &[],
        }],
    );
    let info = recorder.finish();
    parts.scopes_data = info.scopes_data;
    parts.pc_descs = info.pc_descs;
    parts
}

#[test]
fn inlined_chain() -> anyhow::Result<()> {
    let vm = TestVm::new();
    let nm = vm.install(inlined_parts(&vm))?;
    let base = nm.code_begin();

    let inner = nm.scope_desc_at(base + 24).expect("scope at 24");
    assert_eq!(vm.cc.metaspace().method_name(inner.method()), "inlined");
    assert_eq!(inner.bci(), 11);
    assert!(inner.should_reexecute());
    assert!(inner.return_oop());
    assert!(!inner.rethrow_exception());
    assert!(!inner.is_top());
    assert_eq!(inner.locals()[1], ScopeValue::ConstantLong(-7));
    assert_eq!(inner.expressions().len(), 1);

    let outer = inner.sender().expect("inlined scope has a sender");
    assert_eq!(outer.method(), vm.method);
    assert_eq!(outer.bci(), 4);
    assert!(outer.is_top());
    assert!(outer.sender().is_none());
    // Flags belong to the innermost scope.
    assert!(!outer.should_reexecute());
    assert_eq!(outer.locals().len(), 3);
    assert_eq!(outer.locals()[1], ScopeValue::ConstantInt(42));
    assert!(outer.expressions().is_empty());
    assert!(outer.monitors().is_empty());
    assert_eq!(outer.decode_offset(), inner.sender_decode_offset());
    Ok(())
}

#[test]
fn object_pool_is_shared_and_lazy() -> anyhow::Result<()> {
    let vm = TestVm::new();
    let nm = vm.install(inlined_parts(&vm))?;

    let inner = nm.scope_desc_at(nm.code_begin() + 24).expect("scope at 24");
    let outer = inner.sender().expect("sender");
    assert!(Rc::ptr_eq(inner.object_pool(), outer.object_pool()));
    assert!(!outer.object_pool().is_decoded());

    let point = outer.object_pool().object(1).expect("object 1").clone();
    assert!(inner.object_pool().is_decoded());
    assert_eq!(point.fields.len(), 2);
    assert_eq!(inner.objects().len(), 1);
    Ok(())
}

#[test]
fn scalar_replaced_monitor_owner() -> anyhow::Result<()> {
    let vm = TestVm::new();
    let nm = vm.install(inlined_parts(&vm))?;
    let inner = nm.scope_desc_at(nm.code_begin() + 24).expect("scope at 24");

    let monitors = inner.monitors();
    assert_eq!(monitors.len(), 1);
    let m = &monitors[0];
    assert!(m.eliminated);
    assert!(m.owner_is_scalar_replaced());
    match m.owner {
        MonitorOwner::ScalarReplaced { object_id, klass } => {
            assert_eq!(object_id, 1);
            assert_eq!(vm.cc.metaspace().klass_name(klass), "Point");
        }
        ref other => panic!("unexpected owner {other:?}"),
    }
    assert_eq!(m.basic_lock, Location::on_stack(LocationType::Normal, 32));
    Ok(())
}

#[test]
fn shared_records_and_near_lookup() -> anyhow::Result<()> {
    let vm = TestVm::new();
    let nm = vm.install(inlined_parts(&vm))?;
    let base = nm.code_begin();

    let at_40 = nm.scope_desc_at(base + 40).expect("scope at 40");
    assert_eq!(at_40.bci(), 9);
    assert!(at_40.is_top());
    assert_eq!(at_40.locals().len(), 2);

    let near = nm.scope_desc_near(base + 30).expect("scope near 30");
    assert!(near.is_equal(&at_40));
    assert!(nm.scope_desc_at(base + 30).is_none());

    let pd = *nm.pc_desc_at(base + 40).expect("pc 40");
    assert!(ScopeDesc::new(&nm, &pd).is_equal(&at_40));
    Ok(())
}
