//! The compiled method container.
//!
//! An [`NMethod`] owns a method's instructions and every table the compiler
//! produced for it. The tables that never change after creation share one
//! immutable allocation and are handed out as borrowed views. The data
//! that is patched later (oop and metadata sections, immediate operands,
//! call sites) lives in atomics so that readers never need a lock.

use crate::code_cache::{CodeCache, Stubs};
use crate::entry_barrier::EntryBarrier;
use crate::exception_cache::ExceptionCache;
use crate::frame::{DerivedOopClosure, Frame, NON_OOP_WORD, Oop, OopClosure, RegisterMap};
use crate::inline_cache::{CallKind, CompiledCallSite};
use crate::lifecycle::{NMethodMirror, NMethodState};
use crate::metaspace::{KlassId, Metadata, MetadataCell, MethodId, NMethodId};
use crate::oop_map_do;
use crate::pc_desc_cache::PcDescContainer;
use crate::scope_desc::ScopeDesc;
use anyhow::{Result, bail, ensure};
use codemeta_environ::{
    DepStream, Dependency, HandlerTable, INVOCATION_ENTRY_BCI, ImmutableOopMap,
    ImmutableOopMapSet, ImplicitExceptionTable, PcDesc, RelocIterator, Relocation,
    SERIALIZED_NULL, validate_pc_descs,
};
use std::fmt;
use std::ops::Range;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU8, AtomicU64, AtomicUsize, Ordering};

/// Size of the jump patched over the verified entry of a not-entrant
/// method.
pub const NATIVE_JUMP_SIZE: u32 = 5;

/// Size of a call instruction; a return address points just past one.
pub const CALL_INSTRUCTION_SIZE: u32 = 5;

// An empty `ImmutableOopMapSet`: zero pairs, zero maps.
const EMPTY_OOP_MAPS: [u8; 8] = [0; 8];

/// Which compiler produced an nmethod.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CompilerKind {
    /// The client compiler.
    C1,
    /// The server compiler.
    C2,
    /// A compiler attached through the JVMCI interface.
    Jvmci,
}

/// Offsets of the well-known entry points into the code.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CodeOffsets {
    /// Entry used by inline-cache calls; checks the receiver class.
    pub entry: u32,
    /// Entry used once the receiver is known.
    pub verified_entry: u32,
    /// First offset at which the frame is fully built, if the code ever
    /// builds one.
    pub frame_complete: Option<u32>,
    /// Start of the stub section.
    pub stub: u32,
}

/// Everything a compiler backend hands over to create an nmethod.
///
/// Oop and metadata sections are indexed 1-based by relocations, debug
/// information and dependencies; immediate slots are indexed 0-based by
/// the `imm` operand of oop and metadata relocations.
#[derive(Clone, Debug)]
pub struct NMethodParts {
    /// The compiled method.
    pub method: MethodId,
    /// [`INVOCATION_ENTRY_BCI`] for a normal compile, otherwise the loop
    /// header an on-stack-replacement compile enters at.
    pub entry_bci: i32,
    /// The producing compiler.
    pub compiler: CompilerKind,
    /// Instructions.
    pub code: Vec<u8>,
    /// Entry points.
    pub offsets: CodeOffsets,
    /// Frame size in words.
    pub frame_size: u32,
    /// The oop section.
    pub oops: Vec<Oop>,
    /// The metadata section.
    pub metadata: Vec<Metadata>,
    /// Encoded relocations.
    pub relocations: Vec<u8>,
    /// Oops embedded as instruction operands.
    pub immediate_oops: Vec<Oop>,
    /// Metadata embedded as instruction operands.
    pub immediate_metadata: Vec<Option<Metadata>>,
    /// Sentinel-bracketed pc descriptor table.
    pub pc_descs: Vec<PcDesc>,
    /// Encoded scopes.
    pub scopes_data: Vec<u8>,
    /// Encoded oop map set. Empty means no maps.
    pub oop_maps: Vec<u8>,
    /// Encoded dependencies.
    pub dependencies: Vec<u8>,
    /// Encoded exception handler table.
    pub handler_table: Vec<u8>,
    /// Encoded implicit-exception table.
    pub nul_chk_table: Vec<u8>,
    /// External object that refers to this code, if any.
    pub mirror: Option<Arc<NMethodMirror>>,
}

impl NMethodParts {
    /// Parts for a normal compile of `method` without any tables.
    pub fn new(method: MethodId, code: Vec<u8>) -> NMethodParts {
        NMethodParts {
            method,
            entry_bci: INVOCATION_ENTRY_BCI,
            compiler: CompilerKind::C2,
            code,
            offsets: CodeOffsets::default(),
            frame_size: 0,
            oops: Vec::new(),
            metadata: Vec::new(),
            relocations: Vec::new(),
            immediate_oops: Vec::new(),
            immediate_metadata: Vec::new(),
            pc_descs: vec![PcDesc::lower_sentinel(), PcDesc::upper_sentinel()],
            scopes_data: vec![0],
            oop_maps: Vec::new(),
            dependencies: Vec::new(),
            handler_table: Vec::new(),
            nul_chk_table: Vec::new(),
            mirror: None,
        }
    }

    /// Size the parts will take in the code cache.
    pub fn total_size(&self) -> usize {
        let word = std::mem::size_of::<usize>();
        self.code.len()
            + self.relocations.len()
            + self.scopes_data.len()
            + self.oop_maps.len()
            + self.dependencies.len()
            + self.handler_table.len()
            + self.nul_chk_table.len()
            + self.pc_descs.len() * std::mem::size_of::<PcDesc>()
            + word
                * (self.oops.len()
                    + self.metadata.len()
                    + self.immediate_oops.len()
                    + self.immediate_metadata.len())
    }
}

/// Tables written once at creation and only read afterwards, packed into
/// one allocation.
struct ImmutableData {
    blob: Box<[u8]>,
    dependencies: Range<usize>,
    scopes_data: Range<usize>,
    oop_maps: Range<usize>,
    handler_table: Range<usize>,
    nul_chk_table: Range<usize>,
    pc_descs: Box<[PcDesc]>,
}

impl ImmutableData {
    fn new(parts: &NMethodParts) -> ImmutableData {
        let oop_maps: &[u8] = if parts.oop_maps.is_empty() {
            &EMPTY_OOP_MAPS
        } else {
            &parts.oop_maps
        };
        let mut blob = Vec::with_capacity(
            parts.dependencies.len()
                + parts.scopes_data.len()
                + oop_maps.len()
                + parts.handler_table.len()
                + parts.nul_chk_table.len(),
        );
        let mut push = |bytes: &[u8]| {
            let start = blob.len();
            blob.extend_from_slice(bytes);
            start..blob.len()
        };
        let dependencies = push(&parts.dependencies);
        let scopes_data = push(&parts.scopes_data);
        let oop_maps = push(oop_maps);
        let handler_table = push(&parts.handler_table);
        let nul_chk_table = push(&parts.nul_chk_table);
        ImmutableData {
            blob: blob.into_boxed_slice(),
            dependencies,
            scopes_data,
            oop_maps,
            handler_table,
            nul_chk_table,
            pc_descs: parts.pc_descs.clone().into_boxed_slice(),
        }
    }

    fn section(&self, range: &Range<usize>) -> &[u8] {
        &self.blob[range.clone()]
    }
}

/// Data that may be patched after the nmethod is published.
struct MutableData {
    relocations: Box<[u8]>,
    oops: Box<[AtomicUsize]>,
    metadata: Box<[MetadataCell]>,
    immediate_oops: Box<[AtomicUsize]>,
    immediate_metadata: Box<[MetadataCell]>,
    call_sites: Box<[CompiledCallSite]>,
}

/// A compiled method.
pub struct NMethod {
    id: NMethodId,
    name: String,
    method: MethodId,
    entry_bci: i32,
    compiler: CompilerKind,
    code: Box<[u8]>,
    offsets: CodeOffsets,
    frame_size: u32,
    iterate_immediate_oops: bool,
    has_method_handle_invokes: bool,
    immutable: ImmutableData,
    mutable: MutableData,
    pc_desc_container: PcDescContainer,
    pub(crate) state: AtomicU8,
    pub(crate) is_unloading_state: AtomicU8,
    pub(crate) exception_cache: AtomicPtr<ExceptionCache>,
    pub(crate) entry_barrier: EntryBarrier,
    pub(crate) gc_epoch: AtomicU64,
    pub(crate) oops_do_mark_link: AtomicUsize,
    pub(crate) unlinked: AtomicBool,
    has_flushed_dependencies: AtomicBool,
    pub(crate) mirror: Option<Arc<NMethodMirror>>,
}

impl NMethod {
    pub(crate) fn new(cc: &CodeCache, id: NMethodId, parts: NMethodParts) -> Result<NMethod> {
        let metaspace = cc.metaspace();
        let name = format!(
            "nmethod #{} {}",
            id.as_u32(),
            metaspace.method_external_name(parts.method)
        );
        validate_parts(&parts).map_err(|e| e.context(format!("invalid {name}")))?;

        let immutable = ImmutableData::new(&parts);
        let call_sites = build_call_sites(&parts, cc.stubs())
            .map_err(|e| e.context(format!("invalid call sites in {name}")))?;
        let has_method_handle_invokes = parts
            .pc_descs
            .iter()
            .any(|pd| pd.is_method_handle_invoke());

        let atomics =
            |v: &[Oop]| -> Box<[AtomicUsize]> { v.iter().map(|o| AtomicUsize::new(*o)).collect() };
        let mutable = MutableData {
            relocations: parts.relocations.clone().into_boxed_slice(),
            oops: atomics(&parts.oops),
            metadata: parts
                .metadata
                .iter()
                .map(|m| MetadataCell::new(Some(*m)))
                .collect(),
            immediate_oops: atomics(&parts.immediate_oops),
            immediate_metadata: parts
                .immediate_metadata
                .iter()
                .map(|m| MetadataCell::new(*m))
                .collect(),
            call_sites,
        };

        let nm = NMethod {
            id,
            name,
            method: parts.method,
            entry_bci: parts.entry_bci,
            compiler: parts.compiler,
            code: parts.code.into_boxed_slice(),
            offsets: parts.offsets,
            frame_size: parts.frame_size,
            iterate_immediate_oops: cc.tunables().iterate_immediate_oops,
            has_method_handle_invokes,
            immutable,
            mutable,
            pc_desc_container: PcDescContainer::new(),
            state: AtomicU8::new(NMethodState::NotInstalled as u8),
            is_unloading_state: AtomicU8::new(0),
            exception_cache: AtomicPtr::new(ptr::null_mut()),
            entry_barrier: EntryBarrier::new(),
            gc_epoch: AtomicU64::new(cc.gc_epoch()),
            oops_do_mark_link: AtomicUsize::new(0),
            unlinked: AtomicBool::new(false),
            has_flushed_dependencies: AtomicBool::new(false),
            mirror: parts.mirror,
        };
        nm.clear_unloading_state(cc);
        log::debug!(
            target: "codecache",
            "created {nm}: {} bytes of code, {} pc descriptors, {} call sites",
            nm.code.len(),
            nm.pc_descs().len() - 2,
            nm.mutable.call_sites.len()
        );
        Ok(nm)
    }

    /// The compile id.
    pub fn id(&self) -> NMethodId {
        self.id
    }

    /// The compiled method.
    pub fn method(&self) -> MethodId {
        self.method
    }

    /// Entry bytecode index; see [`NMethodParts::entry_bci`].
    pub fn entry_bci(&self) -> i32 {
        self.entry_bci
    }

    /// Whether this is an on-stack-replacement compile.
    pub fn is_osr_method(&self) -> bool {
        self.entry_bci != INVOCATION_ENTRY_BCI
    }

    /// The producing compiler.
    pub fn compiler(&self) -> CompilerKind {
        self.compiler
    }

    /// First instruction address.
    pub fn code_begin(&self) -> usize {
        self.code.as_ptr() as usize
    }

    /// One past the last instruction address.
    pub fn code_end(&self) -> usize {
        self.code_begin() + self.code.len()
    }

    /// Whether `pc` lies in the instructions.
    pub fn code_contains(&self, pc: usize) -> bool {
        (self.code_begin()..self.code_end()).contains(&pc)
    }

    /// The instructions.
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Unverified entry point.
    pub fn entry_point(&self) -> usize {
        self.code_begin() + self.offsets.entry as usize
    }

    /// Verified entry point.
    pub fn verified_entry_point(&self) -> usize {
        self.code_begin() + self.offsets.verified_entry as usize
    }

    /// Start of the stub section.
    pub fn stub_begin(&self) -> usize {
        self.code_begin() + self.offsets.stub as usize
    }

    /// Entry offsets.
    pub fn offsets(&self) -> CodeOffsets {
        self.offsets
    }

    /// Bytes taken in the code cache.
    pub fn total_size(&self) -> usize {
        let word = std::mem::size_of::<usize>();
        self.code.len()
            + self.immutable.blob.len()
            + self.immutable.pc_descs.len() * std::mem::size_of::<PcDesc>()
            + self.mutable.relocations.len()
            + word
                * (self.mutable.oops.len()
                    + self.mutable.metadata.len()
                    + self.mutable.immediate_oops.len()
                    + self.mutable.immediate_metadata.len())
    }

    /// Frame size in words.
    pub fn frame_size(&self) -> u32 {
        self.frame_size
    }

    /// The pc descriptor table, sentinels included.
    pub fn pc_descs(&self) -> &[PcDesc] {
        &self.immutable.pc_descs
    }

    /// The encoded scopes.
    pub fn scopes_data(&self) -> &[u8] {
        self.immutable.section(&self.immutable.scopes_data)
    }

    /// The encoded dependencies.
    pub fn dependencies_data(&self) -> &[u8] {
        self.immutable.section(&self.immutable.dependencies)
    }

    /// The oop map set.
    pub fn oop_maps(&self) -> ImmutableOopMapSet<'_> {
        ImmutableOopMapSet::parse(self.immutable.section(&self.immutable.oop_maps))
            .unwrap_or_else(|e| panic!("{self}: oop maps no longer parse: {e}"))
    }

    /// The oop map recorded at `pc`.
    pub fn oop_map_for_pc(&self, pc: usize) -> Option<ImmutableOopMap<'_>> {
        let offset = u32::try_from(pc.checked_sub(self.code_begin())?).ok()?;
        self.oop_maps().find_map_at_offset(offset)
    }

    fn handler_table(&self) -> HandlerTable<'_> {
        HandlerTable::parse(self.immutable.section(&self.immutable.handler_table))
            .unwrap_or_else(|e| panic!("{self}: handler table no longer parses: {e}"))
    }

    fn nul_chk_table(&self) -> ImplicitExceptionTable<'_> {
        ImplicitExceptionTable::parse(self.immutable.section(&self.immutable.nul_chk_table))
            .unwrap_or_else(|e| panic!("{self}: implicit exception table no longer parses: {e}"))
    }

    /// Metadata at 1-based section `index`; `0` is null.
    pub fn metadata_at(&self, index: u32) -> Option<Metadata> {
        if index == 0 {
            return None;
        }
        self.metadata_cell(index).load()
    }

    pub(crate) fn metadata_cell(&self, index: u32) -> &MetadataCell {
        index
            .checked_sub(1)
            .and_then(|i| self.mutable.metadata.get(i as usize))
            .unwrap_or_else(|| panic!("{self}: no metadata at index {index}"))
    }

    pub(crate) fn immediate_metadata_cell(&self, imm: u32) -> &MetadataCell {
        self.mutable
            .immediate_metadata
            .get(imm as usize)
            .unwrap_or_else(|| panic!("{self}: no immediate metadata slot {imm}"))
    }

    /// Number of metadata section entries.
    pub fn metadata_count(&self) -> usize {
        self.mutable.metadata.len()
    }

    /// Oop at 1-based section `index`; `0` is null.
    pub fn oop_at(&self, index: u32) -> Oop {
        let Some(i) = index.checked_sub(1) else {
            return 0;
        };
        match self.mutable.oops.get(i as usize) {
            Some(oop) => oop.load(Ordering::Relaxed),
            None => panic!("{self}: no oop at index {index}"),
        }
    }

    /// Number of oop section entries.
    pub fn oop_count(&self) -> usize {
        self.mutable.oops.len()
    }

    /// The instruction's copy of the oop in immediate slot `imm`.
    pub fn immediate_oop(&self, imm: u32) -> Oop {
        match self.mutable.immediate_oops.get(imm as usize) {
            Some(oop) => oop.load(Ordering::Relaxed),
            None => panic!("{self}: no immediate oop slot {imm}"),
        }
    }

    /// The instruction's copy of the metadata in immediate slot `imm`.
    pub fn immediate_metadata(&self, imm: u32) -> Option<Metadata> {
        self.immediate_metadata_cell(imm).load()
    }

    /// The relocations at code offsets `>= begin`.
    pub fn relocations(&self, begin: u32) -> RelocIterator<'_> {
        RelocIterator::starting_at(&self.mutable.relocations, begin)
    }

    pub(crate) fn call_sites(&self) -> &[CompiledCallSite] {
        &self.mutable.call_sites
    }

    /// The decoded dependencies.
    pub fn dependencies(&self) -> DepStream<'_> {
        DepStream::new(self.dependencies_data())
    }

    /// Whether any pc of this method is a method handle invoke.
    pub fn has_method_handle_invokes(&self) -> bool {
        self.has_method_handle_invokes
    }

    fn pc_offset(&self, pc: usize) -> Option<i32> {
        i32::try_from(pc.checked_sub(self.code_begin())?).ok()
    }

    /// The pc descriptor for `pc`; see [`PcDescContainer::find_pc_desc`].
    pub fn find_pc_desc(&self, pc: usize, approximate: bool) -> Option<&PcDesc> {
        let offset = self.pc_offset(pc)?;
        self.pc_desc_container
            .find_pc_desc(self.pc_descs(), offset, approximate)
    }

    /// The pc descriptor recorded exactly at `pc`.
    pub fn pc_desc_at(&self, pc: usize) -> Option<&PcDesc> {
        self.find_pc_desc(pc, false)
    }

    /// The first pc descriptor at or after `pc`.
    pub fn pc_desc_near(&self, pc: usize) -> Option<&PcDesc> {
        self.find_pc_desc(pc, true)
    }

    /// The lookup cache in front of [`NMethod::find_pc_desc`].
    pub fn pc_desc_container(&self) -> &PcDescContainer {
        &self.pc_desc_container
    }

    /// The innermost scope at `pc`.
    pub fn scope_desc_at(&self, pc: usize) -> Option<ScopeDesc<'_>> {
        let pd = *self.pc_desc_at(pc)?;
        Some(ScopeDesc::new(self, &pd))
    }

    /// The innermost scope at the first pc descriptor at or after `pc`.
    pub fn scope_desc_near(&self, pc: usize) -> Option<ScopeDesc<'_>> {
        let pd = *self.pc_desc_near(pc)?;
        Some(ScopeDesc::new(self, &pd))
    }

    /// Whether the call returning to `return_pc` is a method handle
    /// invoke.
    pub fn is_method_handle_return(&self, return_pc: usize) -> bool {
        if !self.has_method_handle_invokes {
            return false;
        }
        self.pc_desc_at(return_pc)
            .is_some_and(|pd| pd.is_method_handle_invoke())
    }

    fn reloc_at(&self, pc: usize) -> impl Iterator<Item = Relocation> + '_ {
        let offset = pc
            .checked_sub(self.code_begin())
            .and_then(|o| u32::try_from(o).ok());
        offset
            .into_iter()
            .flat_map(move |o| self.relocations(o).take_while(move |r| r.offset() == o))
    }

    /// The method attached to the call instruction at `call_pc`.
    pub fn attached_method(&self, call_pc: usize) -> Option<MethodId> {
        assert!(self.code_contains(call_pc), "{call_pc:#x} is not part of {self}");
        self.reloc_at(call_pc)
            .filter(|r| r.kind().is_call())
            .find_map(|r| match self.metadata_at(r.method_index()?) {
                Some(Metadata::Method(m)) => Some(m),
                _ => None,
            })
    }

    /// The method attached to the call that returns to `pc`, if the
    /// instruction before `pc` is a call.
    pub fn attached_method_before_pc(&self, pc: usize) -> Option<MethodId> {
        let call_pc = pc.checked_sub(CALL_INSTRUCTION_SIZE as usize)?;
        if !self.code_contains(call_pc) || !self.reloc_at(call_pc).any(|r| r.kind().is_call()) {
            return None;
        }
        self.attached_method(call_pc)
    }

    /// Whether `pc` is a safepoint poll on method return.
    pub fn is_at_poll_return(&self, pc: usize) -> bool {
        self.reloc_at(pc)
            .any(|r| matches!(r, Relocation::PollReturn { .. }))
    }

    /// Whether `pc` is a safepoint poll.
    pub fn is_at_poll_or_poll_return(&self, pc: usize) -> bool {
        self.reloc_at(pc)
            .any(|r| matches!(r, Relocation::Poll { .. } | Relocation::PollReturn { .. }))
    }

    /// Where execution continues after an implicit exception at `pc`.
    ///
    /// `None` when no continuation is recorded; the fault is then a real
    /// crash. A continuation equal to the faulting offset asks for
    /// deoptimization through the uncommon-trap stub.
    pub fn continuation_for_implicit_exception(&self, cc: &CodeCache, pc: usize) -> Option<usize> {
        let exec_offset = u32::try_from(pc.checked_sub(self.code_begin())?).ok()?;
        let cont_offset = self.nul_chk_table().continuation_offset(exec_offset)?;
        if cont_offset == exec_offset {
            return Some(cc.stubs().uncommon_trap());
        }
        Some(self.code_begin() + cont_offset as usize)
    }

    /// The compiled handler for bytecode handler `handler_bci` at inlining
    /// `scope_depth`, reached by the call returning to `catch_pc`.
    pub fn handler_for_bci(&self, catch_pc: usize, handler_bci: u32, scope_depth: u32) -> Option<usize> {
        let catch_offset = u32::try_from(catch_pc.checked_sub(self.code_begin())?).ok()?;
        let handler = self
            .handler_table()
            .entry_for(catch_offset, handler_bci, scope_depth)?;
        Some(self.code_begin() + handler as usize)
    }

    /// Code offset where relocations relevant to oops start.
    ///
    /// A not-entrant method has a jump patched over its verified entry;
    /// whatever the bytes there referred to is no longer used.
    pub fn oops_reloc_begin(&self) -> u32 {
        let verified_entry = self.offsets.verified_entry;
        if let Some(frame_complete) = self.offsets.frame_complete {
            if frame_complete > verified_entry + NATIVE_JUMP_SIZE {
                return frame_complete;
            }
        }
        if self.is_in_use() {
            verified_entry
        } else {
            verified_entry + NATIVE_JUMP_SIZE
        }
    }

    /// Visits every oop slot of this nmethod: immediate operands (when the
    /// platform embeds oops in instructions) and the oop section.
    ///
    /// Unless `allow_dead`, the nmethod must not be known to be unloading.
    pub fn oops_do(&self, f: &mut dyn OopClosure, allow_dead: bool) {
        debug_assert!(
            allow_dead || self.is_unloading_state.load(Ordering::Relaxed) & 1 == 0,
            "{self}: oops_do on an unloading nmethod"
        );
        if self.iterate_immediate_oops {
            for r in self.relocations(self.oops_reloc_begin()) {
                if let Relocation::Oop { index: 0, imm, .. } = r {
                    let slot = &self.mutable.immediate_oops[imm as usize];
                    if slot.load(Ordering::Relaxed) != 0 {
                        f.do_oop(slot);
                    }
                }
            }
        }
        for slot in self.mutable.oops.iter() {
            if slot.load(Ordering::Relaxed) == NON_OOP_WORD {
                continue;
            }
            f.do_oop(slot);
        }
    }

    /// Visits every class and method this nmethod refers to.
    pub fn metadata_do(&self, f: &mut dyn FnMut(Metadata)) {
        let own = Metadata::Method(self.method);
        for r in self.relocations(self.oops_reloc_begin()) {
            match r {
                Relocation::Metadata { index: 0, imm, .. } => {
                    if let Some(md) = self.immediate_metadata(imm) {
                        if md != own {
                            f(md);
                        }
                    }
                }
                Relocation::VirtualCall { site, .. } => {
                    if let Some(md) = self.mutable.call_sites[site as usize].cached_metadata() {
                        f(md);
                    }
                }
                _ => {}
            }
        }
        for cell in self.mutable.metadata.iter() {
            if let Some(md) = cell.load() {
                f(md);
            }
        }
        f(own);
    }

    /// Applies the oop map at `fr`'s pc to `fr`.
    ///
    /// # Panics
    ///
    /// Panics if no oop map is recorded at the pc; the frame can only be
    /// stopped at a safepoint.
    ///
    /// # Safety
    ///
    /// `fr` must be a live frame of this nmethod; see
    /// [`oop_map_do::oops_do`].
    pub unsafe fn frame_oops_do(
        &self,
        cc: &CodeCache,
        fr: &Frame,
        reg_map: &RegisterMap,
        oops: &mut dyn OopClosure,
        derived: Option<&mut dyn DerivedOopClosure>,
    ) {
        let map = self
            .oop_map_for_pc(fr.pc())
            .unwrap_or_else(|| panic!("{self}: no oop map at pc {:#x}", fr.pc()));
        unsafe { oop_map_do::oops_do(&map, fr, reg_map, oops, derived, cc.compressed_oops()) }
    }

    /// The class a dependency's context index names.
    fn dependency_context(&self, dep: &Dependency) -> Option<KlassId> {
        match self.metadata_at(dep.context_type()?) {
            Some(Metadata::Klass(k)) => Some(k),
            _ => None,
        }
    }

    /// Registers this nmethod with the dependency context of every class
    /// its dependencies name.
    pub(crate) fn add_to_dependency_contexts(&self, cc: &CodeCache) {
        for dep in self.dependencies() {
            if let Some(klass) = self.dependency_context(&dep) {
                cc.metaspace().add_dependent_nmethod(klass, self.id);
            }
        }
    }

    /// Removes this nmethod from the dependency context of every class
    /// its dependencies name. Only the first call does anything.
    pub fn flush_dependencies(&self, cc: &CodeCache) {
        if self.has_flushed_dependencies.swap(true, Ordering::AcqRel) {
            return;
        }
        for dep in self.dependencies() {
            // Call site dependencies are tracked by the call site object.
            if matches!(dep, Dependency::CallSiteTargetValue { .. }) {
                continue;
            }
            if let Some(klass) = self.dependency_context(&dep) {
                cc.metaspace().remove_dependent_nmethod(klass, self.id);
            }
        }
    }

    /// Whether the dependencies were flushed.
    pub fn has_flushed_dependencies(&self) -> bool {
        self.has_flushed_dependencies.load(Ordering::Acquire)
    }

    /// Whether this nmethod assumes `method` is never redefined.
    pub fn is_dependent_on_method(&self, method: MethodId) -> bool {
        self.dependencies().any(|dep| match dep {
            Dependency::EvolMethod { method: index } => {
                self.metadata_at(index) == Some(Metadata::Method(method))
            }
            _ => false,
        })
    }

    /// Whether any dependency is recorded in `klass`'s context.
    pub fn check_dependency_on(&self, klass: KlassId) -> bool {
        self.dependencies()
            .any(|dep| self.dependency_context(&dep) == Some(klass))
    }

    /// Whether this nmethod refers to a method replaced by a class
    /// redefinition.
    pub fn has_evol_metadata(&self, cc: &CodeCache) -> bool {
        let mut found = false;
        self.metadata_do(&mut |md| {
            if let Metadata::Method(m) = md {
                if cc.metaspace().is_old(m) {
                    found = true;
                }
            }
        });
        if found {
            log::debug!(target: "codecache", "{self} refers to redefined methods");
        }
        found
    }
}

impl fmt::Display for NMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl fmt::Debug for NMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NMethod")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("compiler", &self.compiler)
            .field("entry_bci", &self.entry_bci)
            .field("state", &self.state())
            .field("code_begin", &format_args!("{:#x}", self.code_begin()))
            .field("code_size", &self.code.len())
            .finish_non_exhaustive()
    }
}

impl Drop for NMethod {
    fn drop(&mut self) {
        self.free_exception_cache();
    }
}

fn validate_parts(parts: &NMethodParts) -> Result<()> {
    let code_len = u32::try_from(parts.code.len())?;
    ensure!(code_len > 0, "no instructions");
    let o = &parts.offsets;
    ensure!(o.entry < code_len, "entry offset {} is out of range", o.entry);
    ensure!(
        o.verified_entry < code_len,
        "verified entry offset {} is out of range",
        o.verified_entry
    );
    ensure!(o.stub <= code_len, "stub offset {} is out of range", o.stub);
    if let Some(fc) = o.frame_complete {
        ensure!(fc <= code_len, "frame complete offset {fc} is out of range");
    }
    ensure!(
        parts.entry_bci >= INVOCATION_ENTRY_BCI,
        "invalid entry bci {}",
        parts.entry_bci
    );
    ensure!(
        !parts.scopes_data.is_empty(),
        "scopes data must reserve offset zero"
    );

    validate_pc_descs(&parts.pc_descs);
    let real = &parts.pc_descs[1..parts.pc_descs.len() - 1];
    if let Some(last) = real.last() {
        ensure!(
            (last.pc_offset() as u32) <= code_len,
            "pc descriptor at {} is past the code",
            last.pc_offset()
        );
    }
    let scopes_len = parts.scopes_data.len();
    for pd in real {
        for offset in [pd.scope_decode_offset(), pd.obj_decode_offset()] {
            ensure!(
                offset >= SERIALIZED_NULL && (offset as usize) < scopes_len,
                "pc descriptor at {} decodes from {offset}, outside the scopes data",
                pd.pc_offset()
            );
        }
    }

    let oops = parts.oops.len() as u32;
    let metadata = parts.metadata.len() as u32;
    let imm_oops = parts.immediate_oops.len() as u32;
    let imm_metadata = parts.immediate_metadata.len() as u32;
    let java_calls = RelocIterator::new(&parts.relocations)
        .filter(|r| r.method_index().is_some())
        .count();
    for r in RelocIterator::new(&parts.relocations) {
        ensure!(
            r.offset() <= code_len,
            "relocation {r:?} is past the code"
        );
        if let Some(site) = r.call_site() {
            ensure!(
                (site as usize) < java_calls,
                "relocation {r:?} names call site {site} of {java_calls}"
            );
        }
        match r {
            Relocation::Oop { index, imm, .. } => {
                ensure!(index <= oops, "relocation {r:?} names a missing oop");
                ensure!(imm < imm_oops, "relocation {r:?} names a missing immediate");
            }
            Relocation::Metadata { index, imm, .. } => {
                ensure!(index <= metadata, "relocation {r:?} names missing metadata");
                ensure!(imm < imm_metadata, "relocation {r:?} names a missing immediate");
            }
            _ => {}
        }
        if let Some(index) = r.method_index() {
            ensure!(index <= metadata, "relocation {r:?} names missing metadata");
        }
    }

    for dep in DepStream::new(&parts.dependencies) {
        for index in dep.metadata_indices() {
            ensure!(
                index >= 1 && index <= metadata,
                "dependency {dep:?} names missing metadata"
            );
        }
    }

    if !parts.oop_maps.is_empty() {
        ImmutableOopMapSet::parse(&parts.oop_maps)?;
    }
    HandlerTable::parse(&parts.handler_table)?;
    ImplicitExceptionTable::parse(&parts.nul_chk_table)?;
    Ok(())
}

/// Builds the patchable state of every call site, all starting clean.
///
/// Call sites are numbered densely by their relocations. A static stub
/// takes the first metadata relocation after it as the slot of the method
/// it passes to the interpreter.
fn build_call_sites(parts: &NMethodParts, stubs: &Stubs) -> Result<Box<[CompiledCallSite]>> {
    let mut sites: Vec<Option<(CallKind, u32)>> = Vec::new();
    let mut stub_slots: Vec<(u32, u32)> = Vec::new();
    let mut pending_stub = None;

    for r in RelocIterator::new(&parts.relocations) {
        let kind = match r {
            Relocation::VirtualCall { .. } => CallKind::Virtual,
            Relocation::OptVirtualCall { .. } => CallKind::OptVirtual,
            Relocation::StaticCall { .. } => CallKind::Static,
            Relocation::StaticStub { site, .. } => {
                if let Some(prev) = pending_stub.replace(site) {
                    bail!("static stub of call site {prev} has no method slot");
                }
                continue;
            }
            Relocation::Metadata { imm, .. } => {
                if let Some(site) = pending_stub.take() {
                    stub_slots.push((site, imm));
                }
                continue;
            }
            _ => continue,
        };
        let site = r.call_site().map_or(0, |s| s as usize);
        if sites.len() <= site {
            sites.resize(site + 1, None);
        }
        if sites[site].is_some() {
            bail!("call site {site} is relocated twice");
        }
        sites[site] = Some((kind, r.offset()));
    }
    if let Some(site) = pending_stub {
        bail!("static stub of call site {site} has no method slot");
    }

    let mut call_sites = Vec::with_capacity(sites.len());
    for (i, site) in sites.into_iter().enumerate() {
        let Some((kind, offset)) = site else {
            bail!("call site {i} has no call relocation");
        };
        call_sites.push(CompiledCallSite::new(kind, offset, stubs.resolve_stub(kind)));
    }
    for (site, imm) in stub_slots {
        let Some(call) = call_sites.get_mut(site as usize) else {
            bail!("static stub names missing call site {site}");
        };
        if call.kind() == CallKind::Virtual {
            bail!("virtual call site {site} cannot have a static stub");
        }
        if call.has_static_stub() {
            bail!("call site {site} has two static stubs");
        }
        call.attach_static_stub(imm);
    }
    Ok(call_sites.into_boxed_slice())
}
