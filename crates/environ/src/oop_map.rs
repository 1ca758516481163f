//! Oop maps: which registers and stack slots hold live references at a
//! safepoint.
//!
//! Every entry of a map is one [`OopMapValue`], encoded into a compressed
//! stream as the location shifted left by two with the kind in the low
//! bits, followed by the content register for callee-saved and derived
//! entries. Maps are built and canonically sorted by the compiler (see the
//! `compile` feature) and then frozen into an [`ImmutableOopMapSet`] that
//! the runtime reads in place.

use crate::{CompressedReadStream, CompressedWriteStream, VMReg};
use bitflags::bitflags;
use core::fmt;
use object::{Bytes, LittleEndian, U32Bytes};

const KIND_BITS: u32 = 2;
const KIND_MASK: u32 = (1 << KIND_BITS) - 1;

/// What a location recorded in an oop map holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OopMapValueKind {
    /// A full-width reference.
    Oop,
    /// A compressed 32-bit reference.
    NarrowOop,
    /// A callee-saved register spilled into this location; the content
    /// register is the register that was saved.
    CalleeSaved,
    /// A pointer derived from a base reference by arithmetic; the content
    /// register is the location of the base.
    DerivedOop,
    /// Placeholder for an entry that was never set. Never encoded.
    Unused,
}

impl OopMapValueKind {
    fn encoding(self) -> u32 {
        match self {
            OopMapValueKind::Oop => 0,
            OopMapValueKind::NarrowOop => 1,
            OopMapValueKind::CalleeSaved => 2,
            OopMapValueKind::DerivedOop => 3,
            OopMapValueKind::Unused => panic!("unused oop map values are never encoded"),
        }
    }

    fn from_encoding(bits: u32) -> OopMapValueKind {
        match bits & KIND_MASK {
            0 => OopMapValueKind::Oop,
            1 => OopMapValueKind::NarrowOop,
            2 => OopMapValueKind::CalleeSaved,
            _ => OopMapValueKind::DerivedOop,
        }
    }
}

bitflags! {
    /// A set of [`OopMapValueKind`]s, used to filter oop map streams.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct OopMapKinds: u8 {
        /// [`OopMapValueKind::Oop`]
        const OOP = 1 << 0;
        /// [`OopMapValueKind::NarrowOop`]
        const NARROW_OOP = 1 << 1;
        /// [`OopMapValueKind::CalleeSaved`]
        const CALLEE_SAVED = 1 << 2;
        /// [`OopMapValueKind::DerivedOop`]
        const DERIVED_OOP = 1 << 3;
    }
}

impl From<OopMapValueKind> for OopMapKinds {
    fn from(kind: OopMapValueKind) -> OopMapKinds {
        match kind {
            OopMapValueKind::Oop => OopMapKinds::OOP,
            OopMapValueKind::NarrowOop => OopMapKinds::NARROW_OOP,
            OopMapValueKind::CalleeSaved => OopMapKinds::CALLEE_SAVED,
            OopMapValueKind::DerivedOop => OopMapKinds::DERIVED_OOP,
            OopMapValueKind::Unused => OopMapKinds::empty(),
        }
    }
}

/// One entry of an oop map.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct OopMapValue {
    kind: OopMapValueKind,
    reg: VMReg,
    content_reg: Option<VMReg>,
}

impl Default for OopMapValue {
    fn default() -> OopMapValue {
        OopMapValue {
            kind: OopMapValueKind::Unused,
            reg: VMReg::BAD,
            content_reg: None,
        }
    }
}

impl OopMapValue {
    /// Creates an entry. Callee-saved and derived entries need a content
    /// register, the other kinds must not have one.
    pub fn new(kind: OopMapValueKind, reg: VMReg, content_reg: Option<VMReg>) -> OopMapValue {
        let needs_content = matches!(
            kind,
            OopMapValueKind::CalleeSaved | OopMapValueKind::DerivedOop
        );
        assert_eq!(
            needs_content,
            content_reg.is_some(),
            "{kind:?} entry for {reg} with content register {content_reg:?}"
        );
        OopMapValue {
            kind,
            reg,
            content_reg,
        }
    }

    /// The kind of this entry.
    pub fn kind(&self) -> OopMapValueKind {
        self.kind
    }

    /// The location this entry describes.
    pub fn reg(&self) -> VMReg {
        self.reg
    }

    /// The saved register (callee-saved) or base location (derived).
    pub fn content_reg(&self) -> Option<VMReg> {
        self.content_reg
    }

    /// Is this a full-width reference?
    pub fn is_oop(&self) -> bool {
        self.kind == OopMapValueKind::Oop
    }

    /// Is this a compressed reference?
    pub fn is_narrowoop(&self) -> bool {
        self.kind == OopMapValueKind::NarrowOop
    }

    /// Is this a spilled callee-saved register?
    pub fn is_callee_saved(&self) -> bool {
        self.kind == OopMapValueKind::CalleeSaved
    }

    /// Is this a derived pointer?
    pub fn is_derived_oop(&self) -> bool {
        self.kind == OopMapValueKind::DerivedOop
    }

    /// Appends this entry to `stream`.
    pub fn write_on(&self, stream: &mut CompressedWriteStream) {
        assert!(self.reg.is_valid(), "cannot encode an entry without a location");
        stream.write_int((self.reg.value() << KIND_BITS) | self.kind.encoding());
        if let Some(content) = self.content_reg {
            stream.write_int(content.value());
        }
    }

    /// Decodes one entry from `stream`.
    pub fn read_from(stream: &mut CompressedReadStream<'_>) -> OopMapValue {
        let bits = stream.read_int();
        let kind = OopMapValueKind::from_encoding(bits);
        let reg = VMReg::from_raw(bits >> KIND_BITS);
        let content_reg = match kind {
            OopMapValueKind::CalleeSaved | OopMapValueKind::DerivedOop => {
                Some(VMReg::from_raw(stream.read_int()))
            }
            _ => None,
        };
        OopMapValue {
            kind,
            reg,
            content_reg,
        }
    }
}

impl fmt::Debug for OopMapValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.content_reg {
            Some(content) => write!(f, "{}={:?}({})", self.reg, self.kind, content),
            None => write!(f, "{}={:?}", self.reg, self.kind),
        }
    }
}

/// Iterator over the encoded entries of one oop map, optionally restricted
/// to some kinds.
#[derive(Clone, Debug)]
pub struct OopMapStream<'a> {
    stream: CompressedReadStream<'a>,
    remaining: u32,
    filter: OopMapKinds,
}

impl<'a> OopMapStream<'a> {
    /// Iterates the `count` entries encoded in `data`.
    pub fn new(data: &'a [u8], count: u32) -> OopMapStream<'a> {
        OopMapStream::with_filter(data, count, OopMapKinds::all())
    }

    /// Iterates the entries of `data` whose kind is in `filter`.
    pub fn with_filter(data: &'a [u8], count: u32, filter: OopMapKinds) -> OopMapStream<'a> {
        OopMapStream {
            stream: CompressedReadStream::new(data, 0),
            remaining: count,
            filter,
        }
    }
}

impl Iterator for OopMapStream<'_> {
    type Item = OopMapValue;

    fn next(&mut self) -> Option<OopMapValue> {
        while self.remaining > 0 {
            self.remaining -= 1;
            let value = OopMapValue::read_from(&mut self.stream);
            if self.filter.contains(value.kind.into()) {
                return Some(value);
            }
        }
        None
    }
}

const HAS_DERIVED_OOPS: u32 = 1 << 0;

/// A frozen, sorted oop map borrowed out of an [`ImmutableOopMapSet`].
#[derive(Clone, Copy)]
pub struct ImmutableOopMap<'a> {
    count: u32,
    num_oops: u32,
    has_derived_oops: bool,
    data: &'a [u8],
}

impl<'a> ImmutableOopMap<'a> {
    /// Number of entries.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Number of oop and narrow-oop entries.
    pub fn num_oops(&self) -> u32 {
        self.num_oops
    }

    /// Whether any entry is a derived pointer.
    pub fn has_derived_oops(&self) -> bool {
        self.has_derived_oops
    }

    /// The encoded entries.
    pub fn encoded_bytes(&self) -> &'a [u8] {
        self.data
    }

    /// All entries in their canonical order.
    pub fn iter(&self) -> OopMapStream<'a> {
        OopMapStream::new(self.data, self.count)
    }

    /// The entries of the given kinds, in canonical order.
    pub fn iter_kinds(&self, kinds: OopMapKinds) -> OopMapStream<'a> {
        OopMapStream::with_filter(self.data, self.count, kinds)
    }

    /// Whether there is at least one entry of `kind`.
    pub fn has_any(&self, kind: OopMapValueKind) -> bool {
        self.iter_kinds(kind.into()).next().is_some()
    }
}

impl fmt::Debug for ImmutableOopMap<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

/// The frozen oop maps of one compiled method, keyed by pc offset.
///
/// # Format
///
/// ```plain
/// pair_count: u32
/// map_count: u32
/// pc_offsets: [u32; pair_count]   // strictly ascending
/// map_indices: [u32; pair_count]  // which map applies at each pc offset
/// counts: [u32; map_count]        // entries per map
/// num_oops: [u32; map_count]      // oop + narrow oop entries per map
/// flags: [u32; map_count]         // bit 0: has derived oops
/// ends: [u32; map_count]          // exclusive end of each map's bytes
/// data: [u8]                      // encoded entries of all maps
/// ```
///
/// Several pc offsets may share one map when their encodings are identical;
/// the builder deduplicates them.
#[derive(Clone, Debug)]
pub struct ImmutableOopMapSet<'a> {
    pc_offsets: &'a [U32Bytes<LittleEndian>],
    map_indices: &'a [U32Bytes<LittleEndian>],
    counts: &'a [U32Bytes<LittleEndian>],
    num_oops: &'a [U32Bytes<LittleEndian>],
    flags: &'a [U32Bytes<LittleEndian>],
    ends: &'a [U32Bytes<LittleEndian>],
    data: &'a [u8],
}

impl<'a> ImmutableOopMapSet<'a> {
    /// Parses a set from the bytes produced by the builder.
    pub fn parse(data: &'a [u8]) -> anyhow::Result<ImmutableOopMapSet<'a>> {
        let mut data = Bytes(data);
        let pair_count = data
            .read::<U32Bytes<LittleEndian>>()
            .map_err(|_| anyhow::anyhow!("Unable to read oop map pair count"))?;
        let pair_count = usize::try_from(pair_count.get(LittleEndian))?;
        let map_count = data
            .read::<U32Bytes<LittleEndian>>()
            .map_err(|_| anyhow::anyhow!("Unable to read oop map count"))?;
        let map_count = usize::try_from(map_count.get(LittleEndian))?;

        let (pc_offsets, data) =
            object::slice_from_bytes::<U32Bytes<LittleEndian>>(data.0, pair_count)
                .map_err(|_| anyhow::anyhow!("Unable to read oop map pc offsets"))?;
        let (map_indices, data) =
            object::slice_from_bytes::<U32Bytes<LittleEndian>>(data, pair_count)
                .map_err(|_| anyhow::anyhow!("Unable to read oop map indices"))?;
        let (counts, data) = object::slice_from_bytes::<U32Bytes<LittleEndian>>(data, map_count)
            .map_err(|_| anyhow::anyhow!("Unable to read oop map entry counts"))?;
        let (num_oops, data) = object::slice_from_bytes::<U32Bytes<LittleEndian>>(data, map_count)
            .map_err(|_| anyhow::anyhow!("Unable to read oop map oop counts"))?;
        let (flags, data) = object::slice_from_bytes::<U32Bytes<LittleEndian>>(data, map_count)
            .map_err(|_| anyhow::anyhow!("Unable to read oop map flags"))?;
        let (ends, data) = object::slice_from_bytes::<U32Bytes<LittleEndian>>(data, map_count)
            .map_err(|_| anyhow::anyhow!("Unable to read oop map ends"))?;

        if pc_offsets
            .windows(2)
            .any(|w| w[0].get(LittleEndian) >= w[1].get(LittleEndian))
        {
            anyhow::bail!("oop map pc offsets are not strictly ascending");
        }
        if map_indices
            .iter()
            .any(|i| i.get(LittleEndian) as usize >= map_count)
        {
            anyhow::bail!("oop map index out of range");
        }
        if ends
            .windows(2)
            .any(|w| w[0].get(LittleEndian) > w[1].get(LittleEndian))
        {
            anyhow::bail!("oop map data ranges are not ascending");
        }
        let data_len = ends.last().map_or(0, |e| e.get(LittleEndian) as usize);
        if data_len != data.len() {
            anyhow::bail!(
                "oop map data is {} bytes but the maps cover {data_len}",
                data.len()
            );
        }

        Ok(ImmutableOopMapSet {
            pc_offsets,
            map_indices,
            counts,
            num_oops,
            flags,
            ends,
            data,
        })
    }

    /// Number of `(pc_offset, map)` pairs.
    pub fn len(&self) -> usize {
        self.pc_offsets.len()
    }

    /// Whether there are no maps at all.
    pub fn is_empty(&self) -> bool {
        self.pc_offsets.is_empty()
    }

    /// Number of distinct maps after deduplication.
    pub fn distinct_maps(&self) -> usize {
        self.counts.len()
    }

    /// The `i`th pair.
    pub fn pair_at(&self, i: usize) -> (u32, ImmutableOopMap<'a>) {
        let pc_offset = self.pc_offsets[i].get(LittleEndian);
        let index = self.map_indices[i].get(LittleEndian) as usize;
        (pc_offset, self.map(index))
    }

    fn map(&self, index: usize) -> ImmutableOopMap<'a> {
        let end = self.ends[index].get(LittleEndian) as usize;
        let start = if index > 0 {
            self.ends[index - 1].get(LittleEndian) as usize
        } else {
            0
        };
        ImmutableOopMap {
            count: self.counts[index].get(LittleEndian),
            num_oops: self.num_oops[index].get(LittleEndian),
            has_derived_oops: self.flags[index].get(LittleEndian) & HAS_DERIVED_OOPS != 0,
            data: &self.data[start..end],
        }
    }

    /// The map recorded exactly at `pc_offset`, if any.
    pub fn find_map_at_offset(&self, pc_offset: u32) -> Option<ImmutableOopMap<'a>> {
        let i = self
            .pc_offsets
            .binary_search_by_key(&pc_offset, |pc| pc.get(LittleEndian))
            .ok()?;
        Some(self.pair_at(i).1)
    }

    /// Iterates every `(pc_offset, map)` pair in pc order.
    pub fn iter(&self) -> impl ExactSizeIterator<Item = (u32, ImmutableOopMap<'a>)> + '_ {
        (0..self.len()).map(move |i| self.pair_at(i))
    }

    #[cfg_attr(not(feature = "compile"), allow(dead_code))]
    pub(crate) fn encode(
        pairs: &[(u32, u32)],
        maps: &[(u32, u32, bool, Vec<u8>)],
    ) -> Vec<u8> {
        let word = |v: usize| U32Bytes::new(LittleEndian, u32::try_from(v).unwrap());
        let mut pc_offsets = Vec::with_capacity(pairs.len());
        let mut map_indices = Vec::with_capacity(pairs.len());
        for (pc, index) in pairs {
            pc_offsets.push(U32Bytes::new(LittleEndian, *pc));
            map_indices.push(U32Bytes::new(LittleEndian, *index));
        }
        let mut counts = Vec::with_capacity(maps.len());
        let mut num_oops = Vec::with_capacity(maps.len());
        let mut flags = Vec::with_capacity(maps.len());
        let mut ends = Vec::with_capacity(maps.len());
        let mut data = Vec::new();
        for (count, oops, has_derived, bytes) in maps {
            counts.push(U32Bytes::new(LittleEndian, *count));
            num_oops.push(U32Bytes::new(LittleEndian, *oops));
            flags.push(U32Bytes::new(
                LittleEndian,
                if *has_derived { HAS_DERIVED_OOPS } else { 0 },
            ));
            data.extend_from_slice(bytes);
            ends.push(word(data.len()));
        }

        let mut out = Vec::new();
        out.extend_from_slice(&u32::try_from(pairs.len()).unwrap().to_le_bytes());
        out.extend_from_slice(&u32::try_from(maps.len()).unwrap().to_le_bytes());
        out.extend_from_slice(object::bytes_of_slice(&pc_offsets));
        out.extend_from_slice(object::bytes_of_slice(&map_indices));
        out.extend_from_slice(object::bytes_of_slice(&counts));
        out.extend_from_slice(object::bytes_of_slice(&num_oops));
        out.extend_from_slice(object::bytes_of_slice(&flags));
        out.extend_from_slice(object::bytes_of_slice(&ends));
        out.extend_from_slice(&data);
        out
    }
}
