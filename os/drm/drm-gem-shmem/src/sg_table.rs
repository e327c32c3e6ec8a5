//! Scatter-gather descriptors.

use alloc::vec::Vec;
use core::slice;
use drm_memory_addresses::PhysicalAddress;

/// One physically contiguous extent.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SgEntry {
    pub phys: PhysicalAddress,
    pub len: u64,
}

/// Ordered physical extents backing a buffer, in buffer offset order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SgTable {
    entries: Vec<SgEntry>,
}

impl SgTable {
    #[must_use]
    pub const fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// One entry of `len` bytes per block.
    pub fn from_blocks(blocks: impl IntoIterator<Item = PhysicalAddress>, len: u64) -> Self {
        blocks.into_iter().map(|phys| SgEntry { phys, len }).collect()
    }

    pub fn push(&mut self, phys: PhysicalAddress, len: u64) {
        self.entries.push(SgEntry { phys, len });
    }

    #[must_use]
    pub fn entries(&self) -> &[SgEntry] {
        &self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of all extent lengths.
    #[must_use]
    pub fn total_len(&self) -> u64 {
        self.entries.iter().map(|e| e.len).sum()
    }

    pub fn iter(&self) -> slice::Iter<'_, SgEntry> {
        self.entries.iter()
    }

    /// `(base, len)` pairs, the shape DMA mapping helpers consume.
    pub fn extents(&self) -> impl Iterator<Item = (PhysicalAddress, u64)> + '_ {
        self.entries.iter().map(|e| (e.phys, e.len))
    }

    /// Physical address backing byte `offset`, if any.
    #[must_use]
    pub fn phys_at(&self, offset: u64) -> Option<PhysicalAddress> {
        let mut start = 0;
        for e in &self.entries {
            if offset < start + e.len {
                return Some(e.phys + (offset - start));
            }
            start += e.len;
        }
        None
    }
}

impl FromIterator<SgEntry> for SgTable {
    fn from_iter<I: IntoIterator<Item = SgEntry>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a SgTable {
    type Item = &'a SgEntry;
    type IntoIter = slice::Iter<'a, SgEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}
