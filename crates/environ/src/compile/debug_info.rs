use crate::{
    CompressedWriteStream, MonitorValue, ObjectValue, OopMap, OopMapSet, PcDesc, PcDescFlags,
    SERIALIZED_NULL, ScopeHeader, ScopeValue, write_monitor_values, write_object_pool,
    write_scope_values,
};
use std::collections::HashMap;

/// One logical frame at a pc, as described by the compiler.
#[derive(Clone, Copy, Debug)]
pub struct ScopeRecord<'a> {
    /// 1-based metadata index of the frame's method.
    pub method_index: u32,
    /// Bytecode index.
    pub bci: i32,
    /// Local variable values.
    pub locals: &'a [ScopeValue],
    /// Expression stack values.
    pub expressions: &'a [ScopeValue],
    /// Held locks.
    pub monitors: &'a [MonitorValue],
}

/// The finished debug information of one method.
#[derive(Debug)]
pub struct DebugInfo {
    /// The scopes-data stream. Offset zero is reserved.
    pub scopes_data: Vec<u8>,
    /// The sentinel-bracketed pc descriptor table.
    pub pc_descs: Vec<PcDesc>,
    /// The oop maps recorded at safepoints.
    pub oop_maps: OopMapSet,
}

/// Records pc descriptors, scope chains and oop maps while a method is
/// being emitted.
///
/// Identical value lists, object pools and scope records are written once
/// and shared by decode offset; inlined call chains and straight-line code
/// repeat them a lot.
#[derive(Debug)]
pub struct DebugInfoRecorder {
    stream: CompressedWriteStream,
    pcs: Vec<PcDesc>,
    oop_maps: OopMapSet,
    shared: HashMap<Vec<u8>, i32>,
}

impl Default for DebugInfoRecorder {
    fn default() -> DebugInfoRecorder {
        DebugInfoRecorder::new()
    }
}

impl DebugInfoRecorder {
    /// Creates an empty recorder.
    pub fn new() -> DebugInfoRecorder {
        let mut stream = CompressedWriteStream::with_capacity(256);
        // Offset zero means "nothing"; never hand it out.
        stream.write_byte(0);
        DebugInfoRecorder {
            stream,
            pcs: vec![PcDesc::lower_sentinel()],
            oop_maps: OopMapSet::new(),
            shared: HashMap::new(),
        }
    }

    fn serialize(&mut self, write: impl FnOnce(&mut CompressedWriteStream)) -> i32 {
        let mut tmp = CompressedWriteStream::new();
        write(&mut tmp);
        let bytes = tmp.into_bytes();
        if let Some(offset) = self.shared.get(&bytes) {
            return *offset;
        }
        let offset = i32::try_from(self.stream.position()).unwrap();
        self.stream.write_bytes(&bytes);
        self.shared.insert(bytes, offset);
        offset
    }

    fn serialize_values(&mut self, values: &[ScopeValue]) -> i32 {
        if values.is_empty() {
            return SERIALIZED_NULL;
        }
        self.serialize(|s| write_scope_values(s, values))
    }

    fn serialize_monitors(&mut self, monitors: &[MonitorValue]) -> i32 {
        if monitors.is_empty() {
            return SERIALIZED_NULL;
        }
        self.serialize(|s| write_monitor_values(s, monitors))
    }

    /// Records the oop map of the safepoint at `pc_offset`.
    pub fn add_oop_map(&mut self, pc_offset: u32, map: OopMap) {
        self.oop_maps.add_gc_map(pc_offset, map);
    }

    /// Records the logical frames at `pc_offset`, outermost first, and the
    /// scalar-replaced objects they refer to. Returns the new descriptor.
    pub fn add_pc(
        &mut self,
        pc_offset: i32,
        flags: PcDescFlags,
        objects: &[ObjectValue],
        scopes: &[ScopeRecord<'_>],
    ) -> PcDesc {
        let last = self.pcs[self.pcs.len() - 1].pc_offset();
        assert!(
            pc_offset > last && pc_offset < PcDesc::UPPER_OFFSET_LIMIT,
            "pc descriptor at {pc_offset} recorded after one at {last}"
        );
        assert!(!scopes.is_empty(), "pc {pc_offset} has no scopes");

        let obj_decode_offset = if objects.is_empty() {
            SERIALIZED_NULL
        } else {
            self.serialize(|s| write_object_pool(s, objects))
        };

        let mut sender_decode_offset = SERIALIZED_NULL;
        for scope in scopes {
            let header = ScopeHeader {
                sender_decode_offset,
                method_index: scope.method_index,
                bci: scope.bci,
                locals_decode_offset: self.serialize_values(scope.locals),
                expressions_decode_offset: self.serialize_values(scope.expressions),
                monitors_decode_offset: self.serialize_monitors(scope.monitors),
            };
            sender_decode_offset = self.serialize(|s| header.write_on(s));
        }

        let pd = PcDesc::new(pc_offset, sender_decode_offset, obj_decode_offset).with_flags(flags);
        self.pcs.push(pd);
        pd
    }

    /// Size of the scopes data written so far.
    pub fn data_size(&self) -> usize {
        self.stream.position()
    }

    /// Closes the pc descriptor table and returns everything recorded.
    pub fn finish(mut self) -> DebugInfo {
        self.pcs.push(PcDesc::upper_sentinel());
        log::trace!(
            "recorded {} pc descriptors, {} bytes of scopes data",
            self.pcs.len() - 2,
            self.stream.position()
        );
        DebugInfo {
            scopes_data: self.stream.into_bytes(),
            pc_descs: self.pcs,
            oop_maps: self.oop_maps,
        }
    }
}
