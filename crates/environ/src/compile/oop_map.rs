use crate::{
    CompressedWriteStream, ImmutableOopMapSet, OopMapStream, OopMapValue, OopMapValueKind, VMReg,
};
use cranelift_bitset::CompoundBitSet;
use std::collections::HashMap;

/// An oop map under construction.
///
/// Entries are appended in whatever order the register allocator produces
/// them. [`OopMap::sorted`] puts them into the canonical order that the
/// runtime relies on before the map is frozen.
#[derive(Clone, Debug)]
pub struct OopMap {
    offset: u32,
    frame_size: u32,
    arg_count: u32,
    stream: CompressedWriteStream,
    count: u32,
    num_oops: u32,
    has_derived_oops: bool,
    locs_used: CompoundBitSet,
}

impl OopMap {
    /// Creates an empty map for a frame of `frame_size` stack slots with
    /// `arg_count` incoming stack argument slots above it.
    pub fn new(frame_size: u32, arg_count: u32) -> OopMap {
        OopMap {
            offset: 0,
            frame_size,
            arg_count,
            stream: CompressedWriteStream::with_capacity(32),
            count: 0,
            num_oops: 0,
            has_derived_oops: false,
            locs_used: CompoundBitSet::new(),
        }
    }

    /// The pc offset this map is recorded at.
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Size of the frame in stack slots.
    pub fn frame_size(&self) -> u32 {
        self.frame_size
    }

    /// Number of entries.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Number of oop and narrow-oop entries.
    pub fn num_oops(&self) -> u32 {
        self.num_oops
    }

    /// Whether a derived-pointer entry was added.
    pub fn has_derived_oops(&self) -> bool {
        self.has_derived_oops
    }

    /// The encoded entries.
    pub fn encoded_bytes(&self) -> &[u8] {
        self.stream.as_bytes()
    }

    /// Iterates the entries in insertion order.
    pub fn iter(&self) -> OopMapStream<'_> {
        OopMapStream::new(self.stream.as_bytes(), self.count)
    }

    fn locs_length(&self) -> u32 {
        VMReg::FIRST_STACK_SLOT + self.frame_size + self.arg_count
    }

    fn set_xxx(&mut self, reg: VMReg, kind: OopMapValueKind, content_reg: Option<VMReg>) {
        assert!(
            reg.value() < self.locs_length(),
            "{reg} is outside a frame of {} slots",
            self.frame_size + self.arg_count
        );
        assert!(
            self.locs_used.insert(reg.value() as usize),
            "cannot insert {reg} twice into an oop map"
        );
        self.push(OopMapValue::new(kind, reg, content_reg));
    }

    fn push(&mut self, value: OopMapValue) {
        value.write_on(&mut self.stream);
        self.count += 1;
        match value.kind() {
            OopMapValueKind::Oop | OopMapValueKind::NarrowOop => self.num_oops += 1,
            OopMapValueKind::DerivedOop => self.has_derived_oops = true,
            _ => {}
        }
    }

    /// Records a full-width reference in `reg`.
    pub fn set_oop(&mut self, reg: VMReg) {
        self.set_xxx(reg, OopMapValueKind::Oop, None);
    }

    /// Records a compressed reference in `reg`.
    pub fn set_narrowoop(&mut self, reg: VMReg) {
        self.set_xxx(reg, OopMapValueKind::NarrowOop, None);
    }

    /// Records that `reg` holds the caller's value of machine register
    /// `caller_machine_register`.
    pub fn set_callee_saved(&mut self, reg: VMReg, caller_machine_register: VMReg) {
        self.set_xxx(reg, OopMapValueKind::CalleeSaved, Some(caller_machine_register));
    }

    /// Records that `reg` holds a pointer derived from the reference in
    /// `base`. A pointer derived from itself is just an oop.
    pub fn set_derived_oop(&mut self, reg: VMReg, base: VMReg) {
        if reg == base {
            self.set_oop(reg);
        } else {
            self.set_xxx(reg, OopMapValueKind::DerivedOop, Some(base));
        }
    }

    /// Whether both maps have the same entries in the same order.
    pub fn equals(&self, other: &OopMap) -> bool {
        self.count == other.count && self.stream.as_bytes() == other.stream.as_bytes()
    }

    /// Returns this map with its entries in canonical order.
    ///
    /// Callee-saved entries come first, so that updating a register map can
    /// stop at the first other entry. Oops follow by ascending location cost
    /// (registers, then stack slots by offset). Each derived pointer is
    /// placed after its base and after the other pointers derived from the
    /// same base with no greater cost, so a single forward pass sees every
    /// base before the pointers derived from it. A derived pointer whose
    /// base is not in the map (the base was scalar replaced) goes last.
    pub fn sorted(&self) -> OopMap {
        let values: Vec<OopMapValue> = self.iter().collect();
        let mut sorted = Vec::with_capacity(values.len());

        sorted.extend(values.iter().filter(|v| v.is_callee_saved()).copied());
        let oops_start = sorted.len();

        for v in values.iter().filter(|v| v.is_oop() || v.is_narrowoop()) {
            let pos = sorted[oops_start..]
                .iter()
                .position(|e| reg_cost(e.reg()) > reg_cost(v.reg()))
                .map_or(sorted.len(), |p| oops_start + p);
            sorted.insert(pos, *v);
        }

        for v in values.iter().filter(|v| v.is_derived_oop()) {
            let base = v.content_reg();
            let base_pos = sorted[oops_start..]
                .iter()
                .position(|e| !e.is_derived_oop() && Some(e.reg()) == base);
            match base_pos {
                Some(p) => {
                    let mut pos = oops_start + p + 1;
                    while pos < sorted.len()
                        && sorted[pos].is_derived_oop()
                        && sorted[pos].content_reg() == base
                        && reg_cost(sorted[pos].reg()) <= reg_cost(v.reg())
                    {
                        pos += 1;
                    }
                    sorted.insert(pos, *v);
                }
                None => sorted.push(*v),
            }
        }
        debug_assert_eq!(sorted.len(), values.len());

        let mut out = OopMap {
            offset: self.offset,
            frame_size: self.frame_size,
            arg_count: self.arg_count,
            stream: CompressedWriteStream::with_capacity(self.stream.position()),
            count: 0,
            num_oops: 0,
            has_derived_oops: false,
            locs_used: self.locs_used.clone(),
        };
        for v in sorted {
            out.push(v);
        }
        out
    }
}

fn reg_cost(reg: VMReg) -> u32 {
    if reg.is_reg() {
        0
    } else {
        reg.reg2stack() * VMReg::STACK_SLOT_SIZE
    }
}

/// The oop maps of one method, keyed by strictly ascending pc offset.
#[derive(Clone, Debug, Default)]
pub struct OopMapSet {
    maps: Vec<OopMap>,
}

impl OopMapSet {
    /// Creates an empty set.
    pub fn new() -> OopMapSet {
        OopMapSet::default()
    }

    /// Records `map` as the map at `pc_offset`.
    pub fn add_gc_map(&mut self, pc_offset: u32, mut map: OopMap) {
        if let Some(last) = self.maps.last() {
            assert!(
                last.offset < pc_offset,
                "oop map at {pc_offset} added after one at {}",
                last.offset
            );
        }
        map.offset = pc_offset;
        self.maps.push(map);
    }

    /// Number of maps.
    pub fn len(&self) -> usize {
        self.maps.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    /// Iterates the maps in pc order.
    pub fn iter(&self) -> impl Iterator<Item = &OopMap> {
        self.maps.iter()
    }

    /// The map at exactly `pc_offset`.
    pub fn find_map_at_offset(&self, pc_offset: u32) -> Option<&OopMap> {
        let i = self
            .maps
            .binary_search_by_key(&pc_offset, |m| m.offset)
            .ok()?;
        Some(&self.maps[i])
    }
}

/// Freezes an [`OopMapSet`] into the format read by
/// [`ImmutableOopMapSet::parse`].
pub struct ImmutableOopMapSetBuilder;

impl ImmutableOopMapSetBuilder {
    /// Sorts every map of `set` and encodes the set, sharing the encoding
    /// of identical maps.
    pub fn build(set: &OopMapSet) -> Vec<u8> {
        let mut pairs = Vec::with_capacity(set.len());
        let mut maps: Vec<(u32, u32, bool, Vec<u8>)> = Vec::new();
        let mut seen: HashMap<Vec<u8>, u32> = HashMap::new();

        for map in set.iter() {
            let map = map.sorted();
            let bytes = map.encoded_bytes().to_vec();
            let index = match seen.get(&bytes) {
                Some(index) => *index,
                None => {
                    let index = u32::try_from(maps.len()).unwrap();
                    seen.insert(bytes.clone(), index);
                    maps.push((map.count(), map.num_oops(), map.has_derived_oops(), bytes));
                    index
                }
            };
            pairs.push((map.offset(), index));
        }

        log::trace!(
            "froze {} oop maps into {} distinct encodings",
            pairs.len(),
            maps.len()
        );
        ImmutableOopMapSet::encode(&pairs, &maps)
    }
}
