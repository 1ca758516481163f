use super::{TestVm, simple_parts};
use codemeta::runtime::{CodeCache, NMethod, NMethodId, OopsDoMarkState, OopsDoProcessor};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
struct Record {
    regular: Vec<NMethodId>,
    strong: Vec<NMethodId>,
}

impl OopsDoProcessor for Record {
    fn do_regular_processing(&mut self, nm: &NMethod) {
        self.regular.push(nm.id());
    }

    fn do_remaining_strong_processing(&mut self, nm: &NMethod) {
        self.strong.push(nm.id());
    }
}

#[test]
fn weak_then_strong() -> anyhow::Result<()> {
    let vm = TestVm::new();
    let nm = vm.install(simple_parts(vm.method))?;
    let refs = Arc::strong_count(&nm);

    vm.cc.oops_do_marking_prologue();
    let mut p = Record::default();
    nm.oops_do_process_weak(&vm.cc, &mut p);
    assert_eq!(nm.oops_do_mark_state(), Some(OopsDoMarkState::WeakDone));
    nm.oops_do_process_weak(&vm.cc, &mut p);
    assert_eq!(p.regular, [nm.id()]);
    assert!(p.strong.is_empty());
    // The marked list keeps the nmethod alive.
    assert_eq!(Arc::strong_count(&nm), refs + 1);

    nm.oops_do_process_strong(&vm.cc, &mut p);
    nm.oops_do_process_strong(&vm.cc, &mut p);
    assert_eq!(nm.oops_do_mark_state(), Some(OopsDoMarkState::StrongDone));
    assert_eq!(p.regular, [nm.id()]);
    assert_eq!(p.strong, [nm.id()]);

    unsafe { vm.cc.oops_do_marking_epilogue() };
    assert_eq!(nm.oops_do_mark_state(), None);
    assert_eq!(Arc::strong_count(&nm), refs);
    Ok(())
}

#[test]
fn strong_claims_do_everything_at_once() -> anyhow::Result<()> {
    let vm = TestVm::new();
    let a = vm.install(simple_parts(vm.method))?;
    let b = vm.install(simple_parts(vm.define_method(vm.klass, "b")))?;

    vm.cc.oops_do_marking_prologue();
    let mut p = Record::default();
    a.oops_do_process_strong(&vm.cc, &mut p);
    a.oops_do_process_weak(&vm.cc, &mut p);
    assert!(!a.oops_do_try_claim(&vm.cc));
    assert_eq!(p.regular, [a.id()]);
    assert!(p.strong.is_empty());

    assert!(b.oops_do_try_claim(&vm.cc));
    assert!(!b.oops_do_try_claim(&vm.cc));
    assert_eq!(b.oops_do_mark_state(), Some(OopsDoMarkState::WeakDone));

    unsafe { vm.cc.oops_do_marking_epilogue() };
    assert_eq!(a.oops_do_mark_state(), None);
    assert_eq!(b.oops_do_mark_state(), None);

    // A new pass starts from scratch.
    vm.cc.oops_do_marking_prologue();
    assert!(a.oops_do_try_claim(&vm.cc));
    unsafe { vm.cc.oops_do_marking_epilogue() };
    Ok(())
}

/// Does the weak part, and while doing it has a second visitor ask for
/// the strong part.
struct Interrupted<'a> {
    cc: &'a CodeCache,
    nm: Arc<NMethod>,
    state_seen: Option<OopsDoMarkState>,
    other: Record,
    own: Record,
}

impl OopsDoProcessor for Interrupted<'_> {
    fn do_regular_processing(&mut self, nm: &NMethod) {
        self.own.do_regular_processing(nm);
        self.nm.oops_do_process_strong(self.cc, &mut self.other);
        self.state_seen = self.nm.oops_do_mark_state();
    }

    fn do_remaining_strong_processing(&mut self, nm: &NMethod) {
        self.own.do_remaining_strong_processing(nm);
    }
}

#[test]
fn strong_request_during_weak_processing() -> anyhow::Result<()> {
    let vm = TestVm::new();
    let nm = vm.install(simple_parts(vm.method))?;

    vm.cc.oops_do_marking_prologue();
    let mut p = Interrupted {
        cc: &vm.cc,
        nm: Arc::clone(&nm),
        state_seen: None,
        other: Record::default(),
        own: Record::default(),
    };
    nm.oops_do_process_weak(&vm.cc, &mut p);

    assert_eq!(p.state_seen, Some(OopsDoMarkState::StrongRequest));
    // The strong visitor left all the work to the weak one.
    assert!(p.other.regular.is_empty() && p.other.strong.is_empty());
    assert_eq!(p.own.regular, [nm.id()]);
    assert_eq!(p.own.strong, [nm.id()]);
    assert_eq!(nm.oops_do_mark_state(), Some(OopsDoMarkState::StrongDone));

    unsafe { vm.cc.oops_do_marking_epilogue() };
    assert_eq!(nm.oops_do_mark_state(), None);
    Ok(())
}

#[test]
fn parallel_workers_process_each_nmethod_once() -> anyhow::Result<()> {
    let vm = TestVm::new();
    let nmethods = (0..16)
        .map(|i| vm.install(simple_parts(vm.define_method(vm.klass, &format!("m{i}")))))
        .collect::<anyhow::Result<Vec<_>>>()?;

    vm.cc.oops_do_marking_prologue();
    let records: Vec<Record> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let nmethods = &nmethods;
                let cc = &vm.cc;
                s.spawn(move || {
                    let mut p = Record::default();
                    for (i, nm) in nmethods.iter().enumerate() {
                        if (i + worker) % 2 == 0 {
                            nm.oops_do_process_strong(cc, &mut p);
                        } else {
                            nm.oops_do_process_weak(cc, &mut p);
                        }
                    }
                    p
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("worker panicked"))
            .collect()
    });

    let mut regular = HashMap::<NMethodId, usize>::new();
    let mut strong = HashMap::<NMethodId, usize>::new();
    for r in &records {
        for id in &r.regular {
            *regular.entry(*id).or_default() += 1;
        }
        for id in &r.strong {
            *strong.entry(*id).or_default() += 1;
        }
    }
    for nm in &nmethods {
        assert_eq!(regular.get(&nm.id()), Some(&1), "{nm}");
        assert!(strong.get(&nm.id()).copied().unwrap_or(0) <= 1, "{nm}");
        // Every nmethod had a strong visitor.
        assert_eq!(nm.oops_do_mark_state(), Some(OopsDoMarkState::StrongDone));
    }

    unsafe { vm.cc.oops_do_marking_epilogue() };
    for nm in &nmethods {
        assert_eq!(nm.oops_do_mark_state(), None);
        // Test handle plus the registry.
        assert_eq!(Arc::strong_count(nm), 2);
    }
    Ok(())
}
