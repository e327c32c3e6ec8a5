use crate::allocator::TableAllocator;
use crate::gather::FlushOps;
use alloc::sync::Arc;
use bitfield_struct::bitfield;
use drm_memory_addresses::Granule;
use drm_page_alloc::{PageSource, PhysMapper};
use utils_accessors_derive::Setters;

/// `pgsize_bitmap` bit for 4 KiB pages.
pub const SZ_4K: u64 = 1 << 12;
/// `pgsize_bitmap` bit for 16 KiB pages.
pub const SZ_16K: u64 = 1 << 14;
/// `pgsize_bitmap` bit for 2 MiB blocks (4 KiB granule).
pub const SZ_2M: u64 = 1 << 21;
/// `pgsize_bitmap` bit for 32 MiB blocks (16 KiB granule).
pub const SZ_32M: u64 = 1 << 25;
/// `pgsize_bitmap` bit for 1 GiB blocks (4 KiB granule).
pub const SZ_1G: u64 = 1 << 30;

/// Opaque token handed back to custom table allocators and flush callbacks.
///
/// Typically identifies the device or context that owns the page table.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct Cookie(pub usize);

/// Format-specific behavior switches.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PgtableQuirks {
    /// Set the non-secure bit in every entry.
    pub arm_ns: bool,
    /// The table translates the upper half of the address space.
    pub arm_ttbr1: bool,
    /// Table walks use outer write-back write-allocate caching.
    pub arm_outer_wbwa: bool,
    #[bits(29)]
    __: u32,
}

impl PgtableQuirks {
    /// Returns `true` if every quirk in `self` is also set in `supported`.
    #[inline]
    #[must_use]
    pub fn is_subset_of(self, supported: Self) -> bool {
        u32::from(self) & !u32::from(supported) == 0
    }
}

/// Address widths, page sizes and quirks of a page table.
///
/// On allocation the engine copies these and narrows `pgsize_bitmap` to the
/// sizes the chosen granule can express; read them back from
/// [`IoPgtable::params`](crate::IoPgtable::params).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Setters)]
pub struct PgtableParams {
    /// Input (IOVA) address width in bits.
    pub ias: u32,
    /// Output (physical) address width in bits.
    pub oas: u32,
    /// Page and block sizes the caller wants to use, one bit per size.
    pub pgsize_bitmap: u64,
    pub quirks: PgtableQuirks,
    /// The device walks tables coherently with CPU caches.
    pub coherent_walk: bool,
}

impl PgtableParams {
    /// A 48-bit table over 16 KiB pages.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ias: 48,
            oas: 48,
            pgsize_bitmap: SZ_16K,
            quirks: PgtableQuirks::new(),
            coherent_walk: true,
        }
    }

    /// The smallest page size in the bitmap.
    #[must_use]
    pub const fn min_pgsize(&self) -> Option<u64> {
        if self.pgsize_bitmap == 0 {
            None
        } else {
            Some(1 << self.pgsize_bitmap.trailing_zeros())
        }
    }

    /// The granule the bitmap resolves to, once the table is allocated.
    #[must_use]
    pub const fn granule(&self) -> Option<Granule> {
        match self.min_pgsize() {
            Some(size) => Granule::from_size(size),
            None => None,
        }
    }
}

impl Default for PgtableParams {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything needed to allocate a page table.
///
/// Table memory comes from `allocator` if set, otherwise from `dma`. One of
/// the two must be present.
#[derive(Clone, Setters)]
pub struct PgtableConfig {
    pub params: PgtableParams,
    /// Custom table allocator; only for formats that declare support.
    #[setters(non_const)]
    pub allocator: Option<Arc<dyn TableAllocator>>,
    /// Page source for default table allocation.
    #[setters(non_const)]
    pub dma: Option<Arc<dyn PageSource>>,
    /// TLB and walk-cache maintenance callbacks.
    #[setters(non_const)]
    pub flush: Option<Arc<dyn FlushOps>>,
    /// CPU access to table memory.
    #[setters(non_const)]
    pub mapper: Arc<dyn PhysMapper>,
}

impl PgtableConfig {
    #[must_use]
    pub fn new(params: PgtableParams, mapper: Arc<dyn PhysMapper>) -> Self {
        Self {
            params,
            allocator: None,
            dma: None,
            flush: None,
            mapper,
        }
    }
}

impl core::fmt::Debug for PgtableConfig {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PgtableConfig")
            .field("params", &self.params)
            .field("custom_allocator", &self.allocator.is_some())
            .field("dma", &self.dma.is_some())
            .field("flush", &self.flush.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quirk_subsets() {
        let supported = PgtableQuirks::new().with_arm_ns(true).with_arm_ttbr1(true);
        assert!(PgtableQuirks::new().is_subset_of(supported));
        assert!(PgtableQuirks::new().with_arm_ttbr1(true).is_subset_of(supported));
        assert!(!PgtableQuirks::new().with_arm_outer_wbwa(true).is_subset_of(supported));
    }

    #[test]
    fn granule_follows_smallest_size() {
        let p = PgtableParams::new().with_pgsize_bitmap(SZ_4K | SZ_2M);
        assert_eq!(p.min_pgsize(), Some(SZ_4K));
        assert_eq!(p.granule(), Some(Granule::Size4K));
        assert_eq!(PgtableParams::new().with_pgsize_bitmap(0).granule(), None);
    }
}
