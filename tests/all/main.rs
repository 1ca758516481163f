mod code_cache;
mod exception_cache;
mod inline_caches;
mod lifecycle;
mod oop_maps;
mod oops_do_marking;
mod pc_descs;
mod scopes;

use codemeta::environ::{DebugInfoRecorder, PcDescFlags, ScopeRecord};
use codemeta::runtime::{
    CodeCache, KlassId, LoaderId, Metadata, MethodDef, MethodId, NMethod, NMethodParts, Tunables,
};
use std::sync::{Arc, Mutex, OnceLock};

/// Forwards to `env_logger` and keeps the messages of info-or-higher
/// records from the code cache so tests can count them.
struct CapturingLogger {
    inner: env_logger::Logger,
    records: Mutex<Vec<String>>,
}

impl log::Log for CapturingLogger {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        metadata.level() <= log::Level::Info || self.inner.enabled(metadata)
    }

    fn log(&self, record: &log::Record<'_>) {
        if record.target() == "codecache" && record.level() <= log::Level::Info {
            self.records
                .lock()
                .unwrap()
                .push(record.args().to_string());
        }
        if self.inner.matches(record) {
            self.inner.log(record);
        }
    }

    fn flush(&self) {
        self.inner.flush();
    }
}

static LOGGER: OnceLock<CapturingLogger> = OnceLock::new();

fn init_logging() -> &'static CapturingLogger {
    let logger = LOGGER.get_or_init(|| CapturingLogger {
        inner: env_logger::Builder::from_default_env().build(),
        records: Mutex::new(Vec::new()),
    });
    if log::set_logger(logger).is_ok() {
        log::set_max_level(logger.inner.filter().max(log::LevelFilter::Info));
    }
    logger
}

/// Code cache log messages seen so far that contain `needle`.
pub(crate) fn logged(needle: &str) -> Vec<String> {
    init_logging()
        .records
        .lock()
        .unwrap()
        .iter()
        .filter(|m| m.contains(needle))
        .cloned()
        .collect()
}

/// A code cache over a metaspace with one loader, one class and one
/// method, for tests that need an nmethod to exist.
pub(crate) struct TestVm {
    pub cc: Arc<CodeCache>,
    pub loader: LoaderId,
    pub klass: KlassId,
    pub method: MethodId,
}

impl TestVm {
    pub fn new() -> TestVm {
        TestVm::with_tunables(Tunables::default())
    }

    pub fn with_tunables(tunables: Tunables) -> TestVm {
        init_logging();
        let metaspace = Arc::new(codemeta::runtime::Metaspace::new());
        let loader = metaspace.define_loader();
        let klass = metaspace.define_klass("Foo", loader);
        let method = metaspace.define_method(MethodDef {
            holder: klass,
            name: "bar",
            is_native: false,
            has_method_data: true,
        });
        TestVm {
            cc: Arc::new(CodeCache::new(tunables, metaspace).expect("valid tunables")),
            loader,
            klass,
            method,
        }
    }

    /// Defines another method of `holder`.
    pub fn define_method(&self, holder: KlassId, name: &str) -> MethodId {
        self.cc.metaspace().define_method(MethodDef {
            holder,
            name,
            is_native: false,
            has_method_data: true,
        })
    }

    /// Defines a class in a loader of its own so it can be unloaded alone.
    pub fn define_unloadable_klass(&self, name: &str) -> KlassId {
        let loader = self.cc.metaspace().define_loader();
        self.cc.metaspace().define_klass(name, loader)
    }

    /// Creates and registers an nmethod.
    pub fn new_nmethod(&self, parts: NMethodParts) -> anyhow::Result<Arc<NMethod>> {
        Ok(self.cc.new_nmethod(parts)?)
    }

    /// Creates, registers and installs an nmethod.
    pub fn install(&self, parts: NMethodParts) -> anyhow::Result<Arc<NMethod>> {
        let nm = self.new_nmethod(parts)?;
        self.cc.install(&nm)?;
        Ok(nm)
    }
}

/// Parts for `method` with `code_len` bytes of code and one pc descriptor
/// per offset in `pcs`, each with a single scope at bci equal to the
/// offset. Metadata index 1 is `method`.
pub(crate) fn parts_with_pcs(method: MethodId, code_len: usize, pcs: &[i32]) -> NMethodParts {
    let mut parts = NMethodParts::new(method, vec![0x90; code_len]);
    parts.metadata = vec![Metadata::Method(method)];
    let mut recorder = DebugInfoRecorder::new();
    for &pc in pcs {
        recorder.add_pc(
            pc,
            PcDescFlags::empty(),
            &[],
            &[ScopeRecord {
                method_index: 1,
                bci: pc,
                locals: &[],
                expressions: &[],
                monitors: &[],
            }],
        );
    }
    let info = recorder.finish();
    parts.scopes_data = info.scopes_data;
    parts.pc_descs = info.pc_descs;
    parts
}

/// Parts for `method` with 64 bytes of code and no tables.
pub(crate) fn simple_parts(method: MethodId) -> NMethodParts {
    parts_with_pcs(method, 64, &[])
}
