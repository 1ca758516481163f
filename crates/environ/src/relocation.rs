//! Relocations: the places in the instruction stream that refer to
//! something outside it.
//!
//! Each record is written into a compressed stream as the delta of its code
//! offset from the previous record, a kind tag, and the kind's operands.
//! Records are sorted by code offset so that a scan can start at any offset.

use crate::{CompressedReadStream, CompressedWriteStream};

/// The kinds of [`Relocation`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RelocKind {
    /// See [`Relocation::Oop`].
    Oop,
    /// See [`Relocation::Metadata`].
    Metadata,
    /// See [`Relocation::VirtualCall`].
    VirtualCall,
    /// See [`Relocation::OptVirtualCall`].
    OptVirtualCall,
    /// See [`Relocation::StaticCall`].
    StaticCall,
    /// See [`Relocation::StaticStub`].
    StaticStub,
    /// See [`Relocation::RuntimeCall`].
    RuntimeCall,
    /// See [`Relocation::Poll`].
    Poll,
    /// See [`Relocation::PollReturn`].
    PollReturn,
}

impl RelocKind {
    fn tag(self) -> u8 {
        match self {
            RelocKind::Oop => 1,
            RelocKind::Metadata => 2,
            RelocKind::VirtualCall => 3,
            RelocKind::OptVirtualCall => 4,
            RelocKind::StaticCall => 5,
            RelocKind::StaticStub => 6,
            RelocKind::RuntimeCall => 7,
            RelocKind::Poll => 8,
            RelocKind::PollReturn => 9,
        }
    }

    /// Whether relocations of this kind are call sites.
    pub fn is_call(self) -> bool {
        matches!(
            self,
            RelocKind::VirtualCall
                | RelocKind::OptVirtualCall
                | RelocKind::StaticCall
                | RelocKind::RuntimeCall
        )
    }
}

/// One relocation record.
///
/// Oop and metadata records name a 1-based index into the method's oop or
/// metadata section (`0` when the value is only embedded in the
/// instruction) and the immediate-operand slot holding the instruction's
/// copy of the value. Call records name the call site, whose patchable
/// state lives in the method's compiled-IC data, and the 1-based metadata
/// index of the method attached to the call (`0` when none).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Relocation {
    /// An embedded object reference.
    Oop {
        /// Code offset.
        offset: u32,
        /// Section index, `0` if only in the instruction.
        index: u32,
        /// Immediate-operand slot.
        imm: u32,
    },
    /// An embedded class or method pointer.
    Metadata {
        /// Code offset.
        offset: u32,
        /// Section index, `0` if only in the instruction.
        index: u32,
        /// Immediate-operand slot.
        imm: u32,
    },
    /// A dispatched call through an inline cache.
    VirtualCall {
        /// Code offset.
        offset: u32,
        /// Call site index.
        site: u32,
        /// Attached method index, `0` if none.
        method_index: u32,
    },
    /// A virtual call the compiler proved monomorphic.
    OptVirtualCall {
        /// Code offset.
        offset: u32,
        /// Call site index.
        site: u32,
        /// Attached method index, `0` if none.
        method_index: u32,
    },
    /// A statically bound call.
    StaticCall {
        /// Code offset.
        offset: u32,
        /// Call site index.
        site: u32,
        /// Attached method index, `0` if none.
        method_index: u32,
    },
    /// The interpreter-entry trampoline of call site `site`. The next
    /// metadata relocation is the trampoline's method.
    StaticStub {
        /// Code offset.
        offset: u32,
        /// Call site index.
        site: u32,
    },
    /// A call into the runtime.
    RuntimeCall {
        /// Code offset.
        offset: u32,
    },
    /// A safepoint poll.
    Poll {
        /// Code offset.
        offset: u32,
    },
    /// A safepoint poll on method return.
    PollReturn {
        /// Code offset.
        offset: u32,
    },
}

impl Relocation {
    /// Offset of the relocated instruction from the start of the code.
    pub fn offset(&self) -> u32 {
        match *self {
            Relocation::Oop { offset, .. }
            | Relocation::Metadata { offset, .. }
            | Relocation::VirtualCall { offset, .. }
            | Relocation::OptVirtualCall { offset, .. }
            | Relocation::StaticCall { offset, .. }
            | Relocation::StaticStub { offset, .. }
            | Relocation::RuntimeCall { offset }
            | Relocation::Poll { offset }
            | Relocation::PollReturn { offset } => offset,
        }
    }

    /// The kind of this record.
    pub fn kind(&self) -> RelocKind {
        match self {
            Relocation::Oop { .. } => RelocKind::Oop,
            Relocation::Metadata { .. } => RelocKind::Metadata,
            Relocation::VirtualCall { .. } => RelocKind::VirtualCall,
            Relocation::OptVirtualCall { .. } => RelocKind::OptVirtualCall,
            Relocation::StaticCall { .. } => RelocKind::StaticCall,
            Relocation::StaticStub { .. } => RelocKind::StaticStub,
            Relocation::RuntimeCall { .. } => RelocKind::RuntimeCall,
            Relocation::Poll { .. } => RelocKind::Poll,
            Relocation::PollReturn { .. } => RelocKind::PollReturn,
        }
    }

    /// The call site of a call or stub record.
    pub fn call_site(&self) -> Option<u32> {
        match *self {
            Relocation::VirtualCall { site, .. }
            | Relocation::OptVirtualCall { site, .. }
            | Relocation::StaticCall { site, .. }
            | Relocation::StaticStub { site, .. } => Some(site),
            _ => None,
        }
    }

    /// The attached-method metadata index of a Java call record.
    pub fn method_index(&self) -> Option<u32> {
        match *self {
            Relocation::VirtualCall { method_index, .. }
            | Relocation::OptVirtualCall { method_index, .. }
            | Relocation::StaticCall { method_index, .. } => Some(method_index),
            _ => None,
        }
    }

    #[cfg_attr(not(feature = "compile"), allow(dead_code))]
    pub(crate) fn write_on(&self, stream: &mut CompressedWriteStream, delta: u32) {
        stream.write_int(delta);
        stream.write_byte(self.kind().tag());
        match *self {
            Relocation::Oop { index, imm, .. } | Relocation::Metadata { index, imm, .. } => {
                stream.write_int(index);
                stream.write_int(imm);
            }
            Relocation::VirtualCall {
                site, method_index, ..
            }
            | Relocation::OptVirtualCall {
                site, method_index, ..
            }
            | Relocation::StaticCall {
                site, method_index, ..
            } => {
                stream.write_int(site);
                stream.write_int(method_index);
            }
            Relocation::StaticStub { site, .. } => stream.write_int(site),
            Relocation::RuntimeCall { .. } | Relocation::Poll { .. } | Relocation::PollReturn { .. } => {}
        }
    }

    fn read_from(stream: &mut CompressedReadStream<'_>, offset: u32) -> Relocation {
        let tag = stream.read_byte();
        match tag {
            1 => Relocation::Oop {
                offset,
                index: stream.read_int(),
                imm: stream.read_int(),
            },
            2 => Relocation::Metadata {
                offset,
                index: stream.read_int(),
                imm: stream.read_int(),
            },
            3 => Relocation::VirtualCall {
                offset,
                site: stream.read_int(),
                method_index: stream.read_int(),
            },
            4 => Relocation::OptVirtualCall {
                offset,
                site: stream.read_int(),
                method_index: stream.read_int(),
            },
            5 => Relocation::StaticCall {
                offset,
                site: stream.read_int(),
                method_index: stream.read_int(),
            },
            6 => Relocation::StaticStub {
                offset,
                site: stream.read_int(),
            },
            7 => Relocation::RuntimeCall { offset },
            8 => Relocation::Poll { offset },
            9 => Relocation::PollReturn { offset },
            _ => panic!(
                "invalid relocation tag {tag} at stream position {}",
                stream.position() - 1
            ),
        }
    }
}

/// Decodes relocation records in code order.
#[derive(Clone, Debug)]
pub struct RelocIterator<'a> {
    stream: CompressedReadStream<'a>,
    offset: u32,
    begin: u32,
}

impl<'a> RelocIterator<'a> {
    /// Iterates all records.
    pub fn new(data: &'a [u8]) -> RelocIterator<'a> {
        RelocIterator::starting_at(data, 0)
    }

    /// Iterates the records at code offsets `>= begin`.
    pub fn starting_at(data: &'a [u8], begin: u32) -> RelocIterator<'a> {
        RelocIterator {
            stream: CompressedReadStream::new(data, 0),
            offset: 0,
            begin,
        }
    }
}

impl Iterator for RelocIterator<'_> {
    type Item = Relocation;

    fn next(&mut self) -> Option<Relocation> {
        while !self.stream.at_end() {
            self.offset += self.stream.read_int();
            let reloc = Relocation::read_from(&mut self.stream, self.offset);
            if reloc.offset() >= self.begin {
                return Some(reloc);
            }
        }
        None
    }
}
