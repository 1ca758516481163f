use bitflags::bitflags;
use core::fmt;

bitflags! {
    /// Per-pc facts recorded alongside the debug information.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct PcDescFlags: u32 {
        /// Deoptimizing here must re-execute the bytecode at the bci.
        const SHOULD_REEXECUTE = 1 << 0;
        /// The call at this pc is a method-handle invocation.
        const IS_METHOD_HANDLE_INVOKE = 1 << 1;
        /// The call at this pc returns an object reference.
        const RETURN_OOP = 1 << 2;
        /// An exception is being rethrown at this pc.
        const RETHROW_EXCEPTION = 1 << 3;
    }
}

/// One row of a method's pc descriptor table.
///
/// Tables are sorted by `pc_offset`, contain each offset once, and are
/// bracketed by [`PcDesc::lower_sentinel`] and [`PcDesc::upper_sentinel`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PcDesc {
    pc_offset: i32,
    scope_decode_offset: i32,
    obj_decode_offset: i32,
    flags: PcDescFlags,
}

impl PcDesc {
    /// Offset of the leading sentinel; below every real pc offset.
    pub const LOWER_OFFSET_LIMIT: i32 = -1;

    /// Offset of the trailing sentinel; above every real pc offset.
    pub const UPPER_OFFSET_LIMIT: i32 = i32::MAX;

    /// Creates a descriptor.
    pub fn new(pc_offset: i32, scope_decode_offset: i32, obj_decode_offset: i32) -> PcDesc {
        PcDesc {
            pc_offset,
            scope_decode_offset,
            obj_decode_offset,
            flags: PcDescFlags::empty(),
        }
    }

    /// The sentinel that opens every table.
    pub fn lower_sentinel() -> PcDesc {
        PcDesc::new(Self::LOWER_OFFSET_LIMIT, crate::SERIALIZED_NULL, crate::SERIALIZED_NULL)
    }

    /// The sentinel that closes every table.
    pub fn upper_sentinel() -> PcDesc {
        PcDesc::new(Self::UPPER_OFFSET_LIMIT, crate::SERIALIZED_NULL, crate::SERIALIZED_NULL)
    }

    /// Returns this descriptor with `flags` set.
    pub fn with_flags(mut self, flags: PcDescFlags) -> PcDesc {
        self.flags = flags;
        self
    }

    /// Offset of the described instruction from the start of the code.
    pub fn pc_offset(&self) -> i32 {
        self.pc_offset
    }

    /// Decode offset of the innermost scope in the scopes data.
    pub fn scope_decode_offset(&self) -> i32 {
        self.scope_decode_offset
    }

    /// Decode offset of the object pool in the scopes data.
    pub fn obj_decode_offset(&self) -> i32 {
        self.obj_decode_offset
    }

    /// All flags.
    pub fn flags(&self) -> PcDescFlags {
        self.flags
    }

    /// See [`PcDescFlags::SHOULD_REEXECUTE`].
    pub fn should_reexecute(&self) -> bool {
        self.flags.contains(PcDescFlags::SHOULD_REEXECUTE)
    }

    /// See [`PcDescFlags::IS_METHOD_HANDLE_INVOKE`].
    pub fn is_method_handle_invoke(&self) -> bool {
        self.flags.contains(PcDescFlags::IS_METHOD_HANDLE_INVOKE)
    }

    /// See [`PcDescFlags::RETURN_OOP`].
    pub fn return_oop(&self) -> bool {
        self.flags.contains(PcDescFlags::RETURN_OOP)
    }

    /// See [`PcDescFlags::RETHROW_EXCEPTION`].
    pub fn rethrow_exception(&self) -> bool {
        self.flags.contains(PcDescFlags::RETHROW_EXCEPTION)
    }

    /// Whether this is one of the two table sentinels.
    pub fn is_sentinel(&self) -> bool {
        self.pc_offset == Self::LOWER_OFFSET_LIMIT || self.pc_offset == Self::UPPER_OFFSET_LIMIT
    }

    /// The absolute address of the described instruction.
    pub fn real_pc(&self, code_begin: usize) -> usize {
        debug_assert!(!self.is_sentinel());
        code_begin + self.pc_offset as usize
    }

    /// Whether `other` describes the same debug state at a different pc.
    pub fn is_same_info(&self, other: &PcDesc) -> bool {
        self.scope_decode_offset == other.scope_decode_offset
            && self.obj_decode_offset == other.obj_decode_offset
            && self.flags == other.flags
    }
}

impl fmt::Debug for PcDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PcDesc(pc={}, scope={}, obj={}, {:?})",
            self.pc_offset, self.scope_decode_offset, self.obj_decode_offset, self.flags
        )
    }
}

/// Checks the invariants every pc descriptor table must satisfy.
///
/// # Panics
///
/// Panics if the table is not sentinel-bracketed or not strictly ascending;
/// such a table no longer matches the code it describes.
pub fn validate_pc_descs(descs: &[PcDesc]) {
    assert!(
        descs.len() >= 2,
        "pc descriptor table needs both sentinels, found {} entries",
        descs.len()
    );
    assert_eq!(
        descs[0].pc_offset,
        PcDesc::LOWER_OFFSET_LIMIT,
        "pc descriptor table does not start with the lower sentinel"
    );
    assert_eq!(
        descs[descs.len() - 1].pc_offset,
        PcDesc::UPPER_OFFSET_LIMIT,
        "pc descriptor table does not end with the upper sentinel"
    );
    for pair in descs.windows(2) {
        assert!(
            pair[0].pc_offset < pair[1].pc_offset,
            "pc descriptor table not strictly ascending: {:?} before {:?}",
            pair[0],
            pair[1]
        );
    }
}
