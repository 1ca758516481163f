//! Debug information: the values that describe one logical frame.
//!
//! A scope record is written into the scopes-data stream as a
//! [`ScopeHeader`] followed, elsewhere in the same stream, by the lists of
//! locals, expressions and monitors it points to. Lists are addressed by
//! decode offset; [`SERIALIZED_NULL`](crate::SERIALIZED_NULL) stands for an
//! empty list and, as a sender offset, for "this is the outermost frame".
//!
//! Scalar-replaced objects are written once per pc into an object pool and
//! referenced from the value lists by id, so that every scope of an inlining
//! chain that mentions an object agrees on its identity.

use crate::{CompressedReadStream, CompressedWriteStream, INVOCATION_ENTRY_BCI, SERIALIZED_NULL};

const LOCATION_CODE: u8 = 0;
const CONSTANT_INT_CODE: u8 = 1;
const CONSTANT_OOP_CODE: u8 = 2;
const CONSTANT_LONG_CODE: u8 = 3;
const CONSTANT_DOUBLE_CODE: u8 = 4;
const OBJECT_CODE: u8 = 5;
const OBJECT_ID_CODE: u8 = 6;
const AUTO_BOX_OBJECT_CODE: u8 = 7;
const MARKER_CODE: u8 = 8;

/// What kind of value a [`Location`] holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LocationType {
    /// An int, float or other 32-bit primitive.
    Normal,
    /// A full-width reference.
    Oop,
    /// A compressed reference.
    NarrowOop,
    /// An int held in a 64-bit slot.
    IntInLong,
    /// A long.
    Lng,
    /// A float held in a double-width register.
    FloatInDbl,
    /// A double.
    Dbl,
    /// A return address.
    Addr,
    /// Dead.
    Invalid,
}

const LOCATION_TYPES: [LocationType; 9] = [
    LocationType::Normal,
    LocationType::Oop,
    LocationType::NarrowOop,
    LocationType::IntInLong,
    LocationType::Lng,
    LocationType::FloatInDbl,
    LocationType::Dbl,
    LocationType::Addr,
    LocationType::Invalid,
];

/// Whether a [`Location`] is a stack slot or a register.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LocationPlace {
    /// `offset` is a byte offset from the stack pointer.
    OnStack,
    /// `offset` is a register number.
    InRegister,
}

/// A register or stack location holding a value of some frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Location {
    kind: LocationType,
    place: LocationPlace,
    offset: u32,
}

const PLACE_MASK: u32 = 0x1;
const TYPE_SHIFT: u32 = 1;
const TYPE_MASK: u32 = 0xf;
const OFFSET_SHIFT: u32 = 5;

impl Location {
    /// A value stored `offset` bytes above the stack pointer.
    pub fn on_stack(kind: LocationType, offset: u32) -> Location {
        Location {
            kind,
            place: LocationPlace::OnStack,
            offset,
        }
    }

    /// A value held in register number `reg`.
    pub fn in_register(kind: LocationType, reg: u32) -> Location {
        Location {
            kind,
            place: LocationPlace::InRegister,
            offset: reg,
        }
    }

    /// The kind of value.
    pub fn kind(&self) -> LocationType {
        self.kind
    }

    /// Stack or register.
    pub fn place(&self) -> LocationPlace {
        self.place
    }

    /// Stack byte offset or register number.
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Does this location hold a reference the collector must see?
    pub fn holds_oop(&self) -> bool {
        matches!(self.kind, LocationType::Oop | LocationType::NarrowOop)
    }

    /// Appends this location to `stream`.
    pub fn write_on(&self, stream: &mut CompressedWriteStream) {
        let place = match self.place {
            LocationPlace::OnStack => 0,
            LocationPlace::InRegister => 1,
        };
        let kind = LOCATION_TYPES
            .iter()
            .position(|k| *k == self.kind)
            .unwrap_or(LOCATION_TYPES.len() - 1) as u32;
        stream.write_int((self.offset << OFFSET_SHIFT) | (kind << TYPE_SHIFT) | place);
    }

    /// Decodes a location from `stream`.
    pub fn read_from(stream: &mut CompressedReadStream<'_>) -> Location {
        let bits = stream.read_int();
        let place = if bits & PLACE_MASK == 0 {
            LocationPlace::OnStack
        } else {
            LocationPlace::InRegister
        };
        let kind = ((bits >> TYPE_SHIFT) & TYPE_MASK) as usize;
        let kind = match LOCATION_TYPES.get(kind) {
            Some(kind) => *kind,
            None => panic!("invalid location type {kind} at stream position {}", stream.position()),
        };
        Location {
            kind,
            place,
            offset: bits >> OFFSET_SHIFT,
        }
    }
}

/// One value of a frame: where to find it, or what constant it is.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ScopeValue {
    /// The value lives in a register or stack slot.
    Location(Location),
    /// An int constant.
    ConstantInt(i32),
    /// A reference constant, by 1-based index into the method's oop
    /// section; `0` is the null reference.
    ConstantOop(u32),
    /// A long constant.
    ConstantLong(i64),
    /// A double constant.
    ConstantDouble(f64),
    /// A scalar-replaced object, by id in the pc's object pool.
    Object(u32),
    /// Filler for the second half of a two-slot value.
    Marker,
}

impl ScopeValue {
    /// Appends this value to `stream`.
    pub fn write_on(&self, stream: &mut CompressedWriteStream) {
        match *self {
            ScopeValue::Location(loc) => {
                stream.write_byte(LOCATION_CODE);
                loc.write_on(stream);
            }
            ScopeValue::ConstantInt(v) => {
                stream.write_byte(CONSTANT_INT_CODE);
                stream.write_signed_int(v);
            }
            ScopeValue::ConstantOop(index) => {
                stream.write_byte(CONSTANT_OOP_CODE);
                stream.write_int(index);
            }
            ScopeValue::ConstantLong(v) => {
                stream.write_byte(CONSTANT_LONG_CODE);
                stream.write_long(v);
            }
            ScopeValue::ConstantDouble(v) => {
                stream.write_byte(CONSTANT_DOUBLE_CODE);
                stream.write_double(v);
            }
            ScopeValue::Object(id) => {
                stream.write_byte(OBJECT_ID_CODE);
                stream.write_int(id);
            }
            ScopeValue::Marker => stream.write_byte(MARKER_CODE),
        }
    }

    /// Decodes a value from `stream`.
    pub fn read_from(stream: &mut CompressedReadStream<'_>) -> ScopeValue {
        match stream.read_byte() {
            LOCATION_CODE => ScopeValue::Location(Location::read_from(stream)),
            CONSTANT_INT_CODE => ScopeValue::ConstantInt(stream.read_signed_int()),
            CONSTANT_OOP_CODE => ScopeValue::ConstantOop(stream.read_int()),
            CONSTANT_LONG_CODE => ScopeValue::ConstantLong(stream.read_long()),
            CONSTANT_DOUBLE_CODE => ScopeValue::ConstantDouble(stream.read_double()),
            OBJECT_ID_CODE => ScopeValue::Object(stream.read_int()),
            MARKER_CODE => ScopeValue::Marker,
            OBJECT_CODE | AUTO_BOX_OBJECT_CODE => panic!(
                "object definition outside of an object pool at stream position {}",
                stream.position() - 1
            ),
            tag => panic!(
                "invalid scope value tag {tag} at stream position {}",
                stream.position() - 1
            ),
        }
    }
}

/// A scalar-replaced object: its class and the values of its fields.
#[derive(Clone, Debug, PartialEq)]
pub struct ObjectValue {
    /// Identity within the object pool of one pc.
    pub id: u32,
    /// 1-based index of the object's class in the method's metadata section.
    pub klass: u32,
    /// Whether this is a cached box value (`Integer.valueOf` and friends).
    pub is_auto_box: bool,
    /// Field values in declaration order.
    pub fields: Vec<ScopeValue>,
}

impl ObjectValue {
    fn write_on(&self, stream: &mut CompressedWriteStream) {
        stream.write_byte(if self.is_auto_box {
            AUTO_BOX_OBJECT_CODE
        } else {
            OBJECT_CODE
        });
        stream.write_int(self.id);
        stream.write_int(self.klass);
        stream.write_int(u32::try_from(self.fields.len()).unwrap());
        for field in &self.fields {
            field.write_on(stream);
        }
    }

    fn read_from(stream: &mut CompressedReadStream<'_>) -> ObjectValue {
        let is_auto_box = match stream.read_byte() {
            OBJECT_CODE => false,
            AUTO_BOX_OBJECT_CODE => true,
            tag => panic!(
                "invalid object pool tag {tag} at stream position {}",
                stream.position() - 1
            ),
        };
        let id = stream.read_int();
        let klass = stream.read_int();
        let len = stream.read_int();
        let fields = (0..len).map(|_| ScopeValue::read_from(stream)).collect();
        ObjectValue {
            id,
            klass,
            is_auto_box,
            fields,
        }
    }
}

/// A lock held by a frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MonitorValue {
    /// The locked object. An [`ScopeValue::Object`] owner was scalar
    /// replaced; its lock was elided together with the allocation.
    pub owner: ScopeValue,
    /// Where the lock record lives.
    pub basic_lock: Location,
    /// Whether the compiler eliminated the locking.
    pub eliminated: bool,
}

impl MonitorValue {
    fn write_on(&self, stream: &mut CompressedWriteStream) {
        self.owner.write_on(stream);
        self.basic_lock.write_on(stream);
        stream.write_bool(self.eliminated);
    }

    fn read_from(stream: &mut CompressedReadStream<'_>) -> MonitorValue {
        let owner = ScopeValue::read_from(stream);
        let basic_lock = Location::read_from(stream);
        let eliminated = stream.read_bool();
        MonitorValue {
            owner,
            basic_lock,
            eliminated,
        }
    }
}

/// The eagerly decoded part of a scope record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ScopeHeader {
    /// Decode offset of the caller's scope, or `SERIALIZED_NULL` for the
    /// outermost frame.
    pub sender_decode_offset: i32,
    /// 1-based index of the method in the metadata section.
    pub method_index: u32,
    /// Bytecode index, possibly [`INVOCATION_ENTRY_BCI`].
    pub bci: i32,
    /// Decode offset of the locals list.
    pub locals_decode_offset: i32,
    /// Decode offset of the expression stack list.
    pub expressions_decode_offset: i32,
    /// Decode offset of the monitor list.
    pub monitors_decode_offset: i32,
}

impl ScopeHeader {
    /// Appends this header to `stream`.
    pub fn write_on(&self, stream: &mut CompressedWriteStream) {
        stream.write_int(self.sender_decode_offset as u32);
        stream.write_int(self.method_index);
        stream.write_int((self.bci - INVOCATION_ENTRY_BCI) as u32);
        stream.write_int(self.locals_decode_offset as u32);
        stream.write_int(self.expressions_decode_offset as u32);
        stream.write_int(self.monitors_decode_offset as u32);
    }

    /// Decodes the header at `decode_offset` in `data`.
    pub fn read(data: &[u8], decode_offset: i32) -> ScopeHeader {
        let mut stream = CompressedReadStream::new(data, checked_offset(data, decode_offset));
        ScopeHeader {
            sender_decode_offset: stream.read_int() as i32,
            method_index: stream.read_int(),
            bci: stream.read_int() as i32 + INVOCATION_ENTRY_BCI,
            locals_decode_offset: stream.read_int() as i32,
            expressions_decode_offset: stream.read_int() as i32,
            monitors_decode_offset: stream.read_int() as i32,
        }
    }

    /// Whether this scope is the outermost frame of its chain.
    pub fn is_top(&self) -> bool {
        self.sender_decode_offset == SERIALIZED_NULL
    }
}

fn checked_offset(data: &[u8], decode_offset: i32) -> usize {
    match usize::try_from(decode_offset) {
        Ok(offset) if offset != 0 && offset < data.len() => offset,
        _ => panic!(
            "invalid decode offset {decode_offset} into {} bytes of scopes data",
            data.len()
        ),
    }
}

/// Appends a counted list of values.
pub fn write_scope_values(stream: &mut CompressedWriteStream, values: &[ScopeValue]) {
    stream.write_int(u32::try_from(values.len()).unwrap());
    for value in values {
        value.write_on(stream);
    }
}

/// Appends a counted list of monitors.
pub fn write_monitor_values(stream: &mut CompressedWriteStream, monitors: &[MonitorValue]) {
    stream.write_int(u32::try_from(monitors.len()).unwrap());
    for monitor in monitors {
        monitor.write_on(stream);
    }
}

/// Appends a counted object pool.
pub fn write_object_pool(stream: &mut CompressedWriteStream, objects: &[ObjectValue]) {
    stream.write_int(u32::try_from(objects.len()).unwrap());
    for object in objects {
        object.write_on(stream);
    }
}

/// Decodes the value list at `decode_offset`.
pub fn read_scope_values(data: &[u8], decode_offset: i32) -> Vec<ScopeValue> {
    if decode_offset == SERIALIZED_NULL {
        return Vec::new();
    }
    let mut stream = CompressedReadStream::new(data, checked_offset(data, decode_offset));
    let len = stream.read_int();
    (0..len).map(|_| ScopeValue::read_from(&mut stream)).collect()
}

/// Decodes the monitor list at `decode_offset`.
pub fn read_monitor_values(data: &[u8], decode_offset: i32) -> Vec<MonitorValue> {
    if decode_offset == SERIALIZED_NULL {
        return Vec::new();
    }
    let mut stream = CompressedReadStream::new(data, checked_offset(data, decode_offset));
    let len = stream.read_int();
    (0..len).map(|_| MonitorValue::read_from(&mut stream)).collect()
}

/// Decodes the object pool at `decode_offset`.
pub fn read_object_pool(data: &[u8], decode_offset: i32) -> Vec<ObjectValue> {
    if decode_offset == SERIALIZED_NULL {
        return Vec::new();
    }
    let mut stream = CompressedReadStream::new(data, checked_offset(data, decode_offset));
    let len = stream.read_int();
    (0..len).map(|_| ObjectValue::read_from(&mut stream)).collect()
}
