//! Continuations for instructions that may fault on purpose.
//!
//! Compiled code elides explicit null and divide-by-zero checks and lets the
//! hardware trap instead. This table maps the offset of each such
//! instruction to the offset of the stub that raises the corresponding
//! exception.
//!
//! The format is a count followed by two parallel `u32` arrays, sorted by
//! faulting offset, so the table is used in place without decoding:
//!
//! ```plain
//! count: u32
//! exec_offsets: [u32; count]  // strictly ascending
//! cont_offsets: [u32; count]
//! ```

use object::{Bytes, LittleEndian, U32Bytes};

/// A parsed implicit-exception table.
#[derive(Clone, Debug)]
pub struct ImplicitExceptionTable<'a> {
    exec_offsets: &'a [U32Bytes<LittleEndian>],
    cont_offsets: &'a [U32Bytes<LittleEndian>],
}

impl<'a> ImplicitExceptionTable<'a> {
    /// Parses a table. Empty input is an empty table.
    pub fn parse(data: &'a [u8]) -> anyhow::Result<ImplicitExceptionTable<'a>> {
        if data.is_empty() {
            return Ok(ImplicitExceptionTable {
                exec_offsets: &[],
                cont_offsets: &[],
            });
        }
        let mut data = Bytes(data);
        let count = data
            .read::<U32Bytes<LittleEndian>>()
            .map_err(|_| anyhow::anyhow!("Unable to read implicit exception count"))?;
        let count = usize::try_from(count.get(LittleEndian))?;
        let (exec_offsets, data) = object::slice_from_bytes::<U32Bytes<LittleEndian>>(data.0, count)
            .map_err(|_| anyhow::anyhow!("Unable to read faulting offsets"))?;
        let (cont_offsets, data) = object::slice_from_bytes::<U32Bytes<LittleEndian>>(data, count)
            .map_err(|_| anyhow::anyhow!("Unable to read continuation offsets"))?;
        if !data.is_empty() {
            anyhow::bail!("Unexpected data at end of implicit exception table");
        }
        if exec_offsets
            .windows(2)
            .any(|w| w[0].get(LittleEndian) >= w[1].get(LittleEndian))
        {
            anyhow::bail!("implicit exception offsets are not strictly ascending");
        }
        Ok(ImplicitExceptionTable {
            exec_offsets,
            cont_offsets,
        })
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.exec_offsets.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.exec_offsets.is_empty()
    }

    /// The continuation for a fault at `exec_offset`, if that instruction
    /// is allowed to fault.
    pub fn continuation_offset(&self, exec_offset: u32) -> Option<u32> {
        let i = self
            .exec_offsets
            .binary_search_by_key(&exec_offset, |o| o.get(LittleEndian))
            .ok()?;
        Some(self.cont_offsets[i].get(LittleEndian))
    }

    /// Iterates `(exec_offset, cont_offset)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.exec_offsets
            .iter()
            .zip(self.cont_offsets)
            .map(|(e, c)| (e.get(LittleEndian), c.get(LittleEndian)))
    }
}
