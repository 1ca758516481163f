//! Exception handlers reachable from each call site.
//!
//! For every call (identified by its return offset) that may throw, the
//! compiler records which bytecode handler, at which inlining depth, is
//! entered at which code offset. The runtime consults this table when an
//! exception unwinds into compiled code and the exception cache missed.
//!
//! # Format
//!
//! ```plain
//! catch_count: u32
//! handler_count: u32
//! catch_offsets: [u32; catch_count]  // strictly ascending
//! ranges: [u32; catch_count]         // exclusive end index into the arrays below
//! bcis: [u32; handler_count]
//! depths: [u32; handler_count]
//! handler_offsets: [u32; handler_count]
//! ```

use object::{Bytes, LittleEndian, U32Bytes};

/// A parsed handler table.
#[derive(Clone, Debug)]
pub struct HandlerTable<'a> {
    catch_offsets: &'a [U32Bytes<LittleEndian>],
    ranges: &'a [U32Bytes<LittleEndian>],
    bcis: &'a [U32Bytes<LittleEndian>],
    depths: &'a [U32Bytes<LittleEndian>],
    handler_offsets: &'a [U32Bytes<LittleEndian>],
}

/// One handler of a call site.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HandlerEntry {
    /// Bytecode index of the handler.
    pub bci: u32,
    /// Inlining depth of the scope the handler belongs to; `0` is the
    /// innermost scope.
    pub scope_depth: u32,
    /// Code offset of the compiled handler.
    pub handler_offset: u32,
}

impl<'a> HandlerTable<'a> {
    /// Parses a table. Empty input is an empty table.
    pub fn parse(data: &'a [u8]) -> anyhow::Result<HandlerTable<'a>> {
        if data.is_empty() {
            return Ok(HandlerTable {
                catch_offsets: &[],
                ranges: &[],
                bcis: &[],
                depths: &[],
                handler_offsets: &[],
            });
        }
        let mut data = Bytes(data);
        let catch_count = data
            .read::<U32Bytes<LittleEndian>>()
            .map_err(|_| anyhow::anyhow!("Unable to read catch count"))?;
        let catch_count = usize::try_from(catch_count.get(LittleEndian))?;
        let handler_count = data
            .read::<U32Bytes<LittleEndian>>()
            .map_err(|_| anyhow::anyhow!("Unable to read handler count"))?;
        let handler_count = usize::try_from(handler_count.get(LittleEndian))?;
        let (catch_offsets, data) =
            object::slice_from_bytes::<U32Bytes<LittleEndian>>(data.0, catch_count)
                .map_err(|_| anyhow::anyhow!("Unable to read catch offsets"))?;
        let (ranges, data) = object::slice_from_bytes::<U32Bytes<LittleEndian>>(data, catch_count)
            .map_err(|_| anyhow::anyhow!("Unable to read handler ranges"))?;
        let (bcis, data) = object::slice_from_bytes::<U32Bytes<LittleEndian>>(data, handler_count)
            .map_err(|_| anyhow::anyhow!("Unable to read handler bcis"))?;
        let (depths, data) = object::slice_from_bytes::<U32Bytes<LittleEndian>>(data, handler_count)
            .map_err(|_| anyhow::anyhow!("Unable to read handler depths"))?;
        let (handler_offsets, data) =
            object::slice_from_bytes::<U32Bytes<LittleEndian>>(data, handler_count)
                .map_err(|_| anyhow::anyhow!("Unable to read handler offsets"))?;
        if !data.is_empty() {
            anyhow::bail!("Unexpected data at end of handler table");
        }
        if catch_offsets
            .windows(2)
            .any(|w| w[0].get(LittleEndian) >= w[1].get(LittleEndian))
        {
            anyhow::bail!("catch offsets are not strictly ascending");
        }
        let mut prev = 0;
        for end in ranges {
            let end = end.get(LittleEndian) as usize;
            if end < prev || end > handler_count {
                anyhow::bail!("handler range end {end} out of order or out of bounds");
            }
            prev = end;
        }
        Ok(HandlerTable {
            catch_offsets,
            ranges,
            bcis,
            depths,
            handler_offsets,
        })
    }

    /// All handlers of the call returning to `catch_offset`.
    pub fn handlers_at(&self, catch_offset: u32) -> impl Iterator<Item = HandlerEntry> + '_ {
        let range = match self
            .catch_offsets
            .binary_search_by_key(&catch_offset, |o| o.get(LittleEndian))
        {
            Ok(i) => {
                let end = self.ranges[i].get(LittleEndian) as usize;
                let start = if i > 0 {
                    self.ranges[i - 1].get(LittleEndian) as usize
                } else {
                    0
                };
                start..end
            }
            Err(_) => 0..0,
        };
        range.map(move |i| HandlerEntry {
            bci: self.bcis[i].get(LittleEndian),
            scope_depth: self.depths[i].get(LittleEndian),
            handler_offset: self.handler_offsets[i].get(LittleEndian),
        })
    }

    /// The compiled handler for bytecode handler `handler_bci` at
    /// `scope_depth`, reached from the call returning to `catch_offset`.
    pub fn entry_for(&self, catch_offset: u32, handler_bci: u32, scope_depth: u32) -> Option<u32> {
        self.handlers_at(catch_offset)
            .find(|e| e.bci == handler_bci && e.scope_depth == scope_depth)
            .map(|e| e.handler_offset)
    }
}
