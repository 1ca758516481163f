//! Resolving a pc offset to its [`PcDesc`].
//!
//! Nearly every lookup repeats one of the last few, so each nmethod keeps a
//! small most-recently-used cache in front of a search over the sorted
//! table. The search starts from the most recent hit and narrows down in
//! strides of 4096, 256 and 16 entries before finishing linearly.

use crate::safepoint::is_in_async_stack_walk;
use codemeta_environ::PcDesc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Entries of the per-nmethod lookup cache.
pub const PC_DESC_CACHE_SIZE: usize = 4;

// Smaller strides in debug builds exercise more of the search.
const LOG2_RADIX: u32 = if cfg!(debug_assertions) { 3 } else { 4 };

/// Whether `pcs[i]` answers a lookup of `pc_offset`.
///
/// An approximate match is the first entry at or after `pc_offset`. Neither
/// sentinel ever matches.
fn match_desc(pcs: &[PcDesc], i: usize, pc_offset: i32, approximate: bool) -> bool {
    if i == 0 || i + 1 >= pcs.len() {
        return false;
    }
    if approximate {
        pcs[i - 1].pc_offset() < pc_offset && pc_offset <= pcs[i].pc_offset()
    } else {
        pcs[i].pc_offset() == pc_offset
    }
}

fn linear_search(pcs: &[PcDesc], pc_offset: i32, approximate: bool) -> Option<usize> {
    let mut found = None;
    for i in 1..pcs.len().saturating_sub(1) {
        if match_desc(pcs, i, pc_offset, approximate) {
            assert!(found.is_none(), "pc descriptor table has duplicate matches");
            found = Some(i);
        }
    }
    found
}

/// Indices of the most recently found entries, newest first. Index zero is
/// the lower sentinel and marks an empty slot.
///
/// Slots are updated without synchronization; a racing reader sees either
/// an old or a new index, both of which name valid entries.
#[derive(Debug, Default)]
struct PcDescCache {
    pc_descs: [AtomicUsize; PC_DESC_CACHE_SIZE],
}

impl PcDescCache {
    fn find_pc_desc(&self, pcs: &[PcDesc], pc_offset: i32, approximate: bool) -> Option<usize> {
        // Exact lookups already checked the newest entry.
        let res = self.pc_descs[0].load(Ordering::Relaxed);
        if approximate && match_desc(pcs, res, pc_offset, approximate) {
            return Some(res);
        }
        for slot in &self.pc_descs[1..] {
            let res = slot.load(Ordering::Relaxed);
            if res == 0 {
                break;
            }
            if match_desc(pcs, res, pc_offset, approximate) {
                return Some(res);
            }
        }
        None
    }

    fn add_pc_desc(&self, mut index: usize) {
        for slot in &self.pc_descs {
            index = slot.swap(index, Ordering::Relaxed);
        }
    }

    fn last_pc_desc(&self) -> usize {
        self.pc_descs[0].load(Ordering::Relaxed)
    }

    fn cached(&self) -> [usize; PC_DESC_CACHE_SIZE] {
        std::array::from_fn(|i| self.pc_descs[i].load(Ordering::Relaxed))
    }
}

/// The lookup state of one nmethod's pc descriptor table.
#[derive(Debug, Default)]
pub struct PcDescContainer {
    cache: PcDescCache,
}

impl PcDescContainer {
    /// A container with an empty cache.
    pub fn new() -> PcDescContainer {
        PcDescContainer::default()
    }

    /// Finds the entry of `pcs` for `pc_offset`.
    ///
    /// Exact lookups return the entry at `pc_offset`. Approximate lookups
    /// return the first entry at or after it. Offsets before the first or
    /// after the last real entry find nothing.
    ///
    /// `pcs` must be the sentinel-bracketed, strictly ascending table this
    /// container was created for. A hit is remembered in the cache unless
    /// the current thread is inside an
    /// [`AsyncStackWalkScope`](crate::AsyncStackWalkScope).
    pub fn find_pc_desc<'a>(
        &self,
        pcs: &'a [PcDesc],
        pc_offset: i32,
        approximate: bool,
    ) -> Option<&'a PcDesc> {
        if pc_offset < 0 || pc_offset >= PcDesc::UPPER_OFFSET_LIMIT {
            return None;
        }

        let last = self.cache.last_pc_desc();
        if last != 0 && pcs[last].pc_offset() == pc_offset {
            return Some(&pcs[last]);
        }

        if let Some(res) = self.cache.find_pc_desc(pcs, pc_offset, approximate) {
            debug_assert_eq!(
                Some(res),
                linear_search(pcs, pc_offset, approximate),
                "cached pc descriptor disagrees with the table"
            );
            return Some(&pcs[res]);
        }

        // Find the last entry below `pc_offset`; its successor is the only
        // candidate.
        let mut lower = 0;
        let mut upper = pcs.len() - 1;
        if lower + 1 >= upper {
            return None;
        }
        macro_rules! assert_lu_ok {
            () => {
                debug_assert!(pcs[lower].pc_offset() < pc_offset);
                debug_assert!(pcs[upper].pc_offset() >= pc_offset);
            };
        }
        assert_lu_ok!();

        let mid = self.cache.last_pc_desc();
        if pcs[mid].pc_offset() < pc_offset {
            lower = mid;
        } else {
            upper = mid;
        }

        let mut step = 1usize << (LOG2_RADIX * 3);
        while step > 1 {
            while lower + step < upper {
                assert_lu_ok!();
                let mid = lower + step;
                if pcs[mid].pc_offset() < pc_offset {
                    lower = mid;
                } else {
                    upper = mid;
                    break;
                }
            }
            assert_lu_ok!();
            step >>= LOG2_RADIX;
        }

        loop {
            assert_lu_ok!();
            let mid = lower + 1;
            if pcs[mid].pc_offset() < pc_offset {
                lower = mid;
            } else {
                upper = mid;
                break;
            }
        }

        if match_desc(pcs, upper, pc_offset, approximate) {
            debug_assert_eq!(
                Some(upper),
                linear_search(pcs, pc_offset, approximate),
                "pc descriptor search disagrees with a linear scan"
            );
            if !is_in_async_stack_walk() {
                self.cache.add_pc_desc(upper);
            }
            Some(&pcs[upper])
        } else {
            debug_assert_eq!(
                None,
                linear_search(pcs, pc_offset, approximate),
                "pc descriptor search missed an entry"
            );
            log::trace!(
                target: "codecache",
                "no pc descriptor for offset {pc_offset} (approximate: {approximate})"
            );
            None
        }
    }

    /// Table indices currently cached, newest first; `0` is an empty slot.
    pub fn cached_indices(&self) -> [usize; PC_DESC_CACHE_SIZE] {
        self.cache.cached()
    }
}
