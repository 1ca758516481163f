use crate::HandlerEntry;
use object::{LittleEndian, U32Bytes};

/// Builds the table read by
/// [`ImplicitExceptionTable`](crate::ImplicitExceptionTable).
#[derive(Clone, Debug, Default)]
pub struct ImplicitExceptionTableBuilder {
    exec_offsets: Vec<U32Bytes<LittleEndian>>,
    cont_offsets: Vec<U32Bytes<LittleEndian>>,
}

impl ImplicitExceptionTableBuilder {
    /// Records that a fault at `exec_offset` continues at `cont_offset`.
    ///
    /// Entries must be appended in strictly ascending `exec_offset` order.
    pub fn append(&mut self, exec_offset: u32, cont_offset: u32) {
        if let Some(last) = self.exec_offsets.last() {
            assert!(last.get(LittleEndian) < exec_offset);
        }
        self.exec_offsets.push(U32Bytes::new(LittleEndian, exec_offset));
        self.cont_offsets.push(U32Bytes::new(LittleEndian, cont_offset));
    }

    /// Encodes the table. No entries encode as no bytes.
    pub fn to_vec(&self) -> Vec<u8> {
        if self.exec_offsets.is_empty() {
            return Vec::new();
        }
        let mut bytes = Vec::new();
        let count = u32::try_from(self.exec_offsets.len()).unwrap();
        bytes.extend_from_slice(&count.to_le_bytes());
        bytes.extend_from_slice(object::bytes_of_slice(&self.exec_offsets));
        bytes.extend_from_slice(object::bytes_of_slice(&self.cont_offsets));
        bytes
    }
}

/// Builds the table read by [`HandlerTable`](crate::HandlerTable).
#[derive(Clone, Debug, Default)]
pub struct HandlerTableBuilder {
    catch_offsets: Vec<U32Bytes<LittleEndian>>,
    ranges: Vec<U32Bytes<LittleEndian>>,
    bcis: Vec<U32Bytes<LittleEndian>>,
    depths: Vec<U32Bytes<LittleEndian>>,
    handler_offsets: Vec<U32Bytes<LittleEndian>>,
}

impl HandlerTableBuilder {
    /// Records the handlers of the call returning to `catch_offset`.
    ///
    /// Calls must be added in strictly ascending offset order. Calls
    /// without handlers are omitted.
    pub fn add_handlers(&mut self, catch_offset: u32, handlers: &[HandlerEntry]) {
        if let Some(last) = self.catch_offsets.last() {
            assert!(last.get(LittleEndian) < catch_offset);
        }
        if handlers.is_empty() {
            return;
        }
        for h in handlers {
            self.bcis.push(U32Bytes::new(LittleEndian, h.bci));
            self.depths.push(U32Bytes::new(LittleEndian, h.scope_depth));
            self.handler_offsets
                .push(U32Bytes::new(LittleEndian, h.handler_offset));
        }
        let end = u32::try_from(self.bcis.len()).unwrap();
        self.catch_offsets.push(U32Bytes::new(LittleEndian, catch_offset));
        self.ranges.push(U32Bytes::new(LittleEndian, end));
    }

    /// Serializes the table, taking a closure to consume slices.
    pub fn serialize<F: FnMut(&[u8])>(&self, mut f: F) {
        let catch_count = u32::try_from(self.catch_offsets.len()).unwrap();
        f(&catch_count.to_le_bytes());
        let handler_count = u32::try_from(self.bcis.len()).unwrap();
        f(&handler_count.to_le_bytes());
        f(object::bytes_of_slice(&self.catch_offsets));
        f(object::bytes_of_slice(&self.ranges));
        f(object::bytes_of_slice(&self.bcis));
        f(object::bytes_of_slice(&self.depths));
        f(object::bytes_of_slice(&self.handler_offsets));
    }

    /// Serializes the table to a vector of bytes.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut bytes = vec![];
        self.serialize(|slice| bytes.extend(slice.iter().cloned()));
        bytes
    }
}
