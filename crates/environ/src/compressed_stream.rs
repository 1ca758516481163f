//! Variable-length byte encoding shared by every debug-information table.
//!
//! Unsigned integers use a base-64/192 scheme: a byte below `L` (192)
//! terminates the number, a byte at or above `L` carries six more payload
//! bits and announces a continuation. At most five bytes are used for a
//! 32-bit value, and small values (the common case for decode offsets,
//! register numbers and bcis) take a single byte.
//!
//! Signed integers are zig-zag encoded first so that small negative numbers
//! also stay short.

use core::fmt;

const LG_H: u32 = 6;
const H: u32 = 1 << LG_H;
const L: u32 = (1 << 8) - H;
const MAX_LENGTH: usize = 5;

fn encode_sign(value: i32) -> u32 {
    ((value << 1) ^ (value >> 31)) as u32
}

fn decode_sign(value: u32) -> i32 {
    ((value >> 1) as i32) ^ -((value & 1) as i32)
}

/// A growable buffer that values are appended to.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct CompressedWriteStream {
    buffer: Vec<u8>,
}

impl CompressedWriteStream {
    /// Creates an empty stream.
    pub fn new() -> CompressedWriteStream {
        CompressedWriteStream::default()
    }

    /// Creates an empty stream with room for `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> CompressedWriteStream {
        CompressedWriteStream {
            buffer: Vec::with_capacity(capacity),
        }
    }

    /// Current write position, which is also the decode offset of the next
    /// value written.
    pub fn position(&self) -> usize {
        self.buffer.len()
    }

    /// The bytes written so far.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Consumes the stream and returns its bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    /// Appends raw, already-encoded bytes.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Appends a single raw byte.
    pub fn write_byte(&mut self, value: u8) {
        self.buffer.push(value);
    }

    /// Appends a boolean as one byte.
    pub fn write_bool(&mut self, value: bool) {
        self.write_byte(u8::from(value));
    }

    /// Appends an unsigned integer.
    pub fn write_int(&mut self, value: u32) {
        if value < L {
            self.buffer.push(value as u8);
            return;
        }
        let mut sum = value;
        for i in 0..MAX_LENGTH {
            if sum < L || i == MAX_LENGTH - 1 {
                // Either a terminating low byte or the fifth byte.
                debug_assert!(sum <= u32::from(u8::MAX));
                self.buffer.push(sum as u8);
                break;
            }
            sum -= L;
            self.buffer.push((L + (sum % H)) as u8);
            sum >>= LG_H;
        }
    }

    /// Appends a signed integer.
    pub fn write_signed_int(&mut self, value: i32) {
        self.write_int(encode_sign(value));
    }

    /// Appends a 64-bit integer as its low and then its high half.
    pub fn write_long(&mut self, value: i64) {
        self.write_signed_int(value as i32);
        self.write_signed_int((value >> 32) as i32);
    }

    /// Appends a double by its bit pattern.
    pub fn write_double(&mut self, value: f64) {
        self.write_long(value.to_bits() as i64);
    }
}

impl fmt::Debug for CompressedWriteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompressedWriteStream")
            .field("position", &self.position())
            .finish()
    }
}

/// A cursor over an encoded byte slice.
///
/// Reading is side-effect free on the underlying bytes; every decoder that
/// needs its own position simply creates its own stream.
#[derive(Clone, Debug)]
pub struct CompressedReadStream<'a> {
    buffer: &'a [u8],
    position: usize,
}

impl<'a> CompressedReadStream<'a> {
    /// Creates a stream reading `buffer` from `position`.
    pub fn new(buffer: &'a [u8], position: usize) -> CompressedReadStream<'a> {
        CompressedReadStream { buffer, position }
    }

    /// The current read position.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Moves the read position.
    pub fn set_position(&mut self, position: usize) {
        self.position = position;
    }

    /// Whether the cursor is at the end of the data.
    pub fn at_end(&self) -> bool {
        self.position >= self.buffer.len()
    }

    /// Reads a single raw byte.
    ///
    /// # Panics
    ///
    /// Reading past the end means the encoded data and its consumer have
    /// diverged, which is not recoverable.
    pub fn read_byte(&mut self) -> u8 {
        match self.buffer.get(self.position) {
            Some(b) => {
                self.position += 1;
                *b
            }
            None => panic!(
                "compressed stream overrun: position {} of {} bytes",
                self.position,
                self.buffer.len()
            ),
        }
    }

    /// Reads a boolean written by [`CompressedWriteStream::write_bool`].
    pub fn read_bool(&mut self) -> bool {
        self.read_byte() != 0
    }

    /// Reads an unsigned integer.
    pub fn read_int(&mut self) -> u32 {
        let b0 = u32::from(self.read_byte());
        if b0 < L {
            return b0;
        }
        let mut sum = b0;
        let mut shift = LG_H;
        for i in 1..MAX_LENGTH {
            let b = u32::from(self.read_byte());
            sum = sum.wrapping_add(b.wrapping_shl(shift));
            if b < L || i == MAX_LENGTH - 1 {
                break;
            }
            shift += LG_H;
        }
        sum
    }

    /// Reads a signed integer.
    pub fn read_signed_int(&mut self) -> i32 {
        decode_sign(self.read_int())
    }

    /// Reads a 64-bit integer.
    pub fn read_long(&mut self) -> i64 {
        let low = self.read_signed_int() as u32;
        let high = self.read_signed_int();
        (i64::from(high) << 32) | i64::from(low)
    }

    /// Reads a double.
    pub fn read_double(&mut self) -> f64 {
        f64::from_bits(self.read_long() as u64)
    }
}
