//! Deferred TLB invalidation.
//!
//! Unmapping clears entries immediately but only records the affected IOVA
//! ranges. The device may keep translating through stale TLB entries until
//! [`IoPgtable::iotlb_sync`](crate::IoPgtable::iotlb_sync) pushes the gathered
//! ranges to the driver's [`FlushOps`].

use crate::Cookie;
use alloc::vec::Vec;
use drm_memory_addresses::{IoVirtualAddress, PhysicalAddress};

/// Driver callbacks for TLB and walk-cache maintenance.
pub trait FlushOps: Send + Sync {
    /// Invalidate every translation of the context identified by `cookie`.
    fn tlb_flush_all(&self, cookie: Cookie);

    /// Invalidate the translations for `range`, which was mapped with
    /// `range.pgsize` sized entries.
    fn tlb_flush_range(&self, range: IovaRange, cookie: Cookie);

    /// Make CPU writes to `[table, table + len)` visible to a non-coherent
    /// table walker. Only called when the table is not walked coherently.
    fn sync_table(&self, table: PhysicalAddress, len: u64, cookie: Cookie) {
        let _ = (table, len, cookie);
    }
}

/// A contiguous run of unmapped IOVA space.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct IovaRange {
    pub start: IoVirtualAddress,
    pub len: u64,
    /// Size of the entries that covered the range.
    pub pgsize: u64,
}

impl IovaRange {
    /// One past the last byte; saturates at the top of the address space.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.start.as_u64().saturating_add(self.len)
    }
}

/// Ranges awaiting invalidation. Adjacent ranges of equal page size merge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IotlbGather {
    ranges: Vec<IovaRange>,
}

impl IotlbGather {
    #[must_use]
    pub const fn new() -> Self {
        Self { ranges: Vec::new() }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    #[must_use]
    pub fn ranges(&self) -> &[IovaRange] {
        &self.ranges
    }

    /// Record `[iova, iova + size)` as needing invalidation.
    pub fn add(&mut self, iova: IoVirtualAddress, size: u64, pgsize: u64) {
        if let Some(last) = self.ranges.last_mut()
            && last.pgsize == pgsize
            && last.end() == iova.as_u64()
        {
            last.len += size;
            return;
        }
        self.ranges.push(IovaRange {
            start: iova,
            len: size,
            pgsize,
        });
    }

    /// Drain the recorded ranges.
    pub fn take(&mut self) -> Vec<IovaRange> {
        core::mem::take(&mut self.ranges)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adjacent_ranges_merge() {
        let mut g = IotlbGather::new();
        g.add(IoVirtualAddress::new(0x4000), 0x4000, 0x4000);
        g.add(IoVirtualAddress::new(0x8000), 0x4000, 0x4000);
        g.add(IoVirtualAddress::new(0x10000), 0x4000, 0x4000);
        g.add(IoVirtualAddress::new(0x2000000), 0x2000000, 0x2000000);

        assert_eq!(g.ranges().len(), 3);
        assert_eq!(g.ranges()[0].len, 0x8000);
        assert_eq!(g.take().len(), 3);
        assert!(g.is_empty());
    }

    #[test]
    fn different_page_sizes_do_not_merge() {
        let mut g = IotlbGather::new();
        g.add(IoVirtualAddress::new(0), 0x4000, 0x4000);
        g.add(IoVirtualAddress::new(0x4000), 0x4000, 0x1000);
        assert_eq!(g.ranges().len(), 2);
    }
}
