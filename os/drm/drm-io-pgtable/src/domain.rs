//! Size-based mapping on top of a page table.
//!
//! [`IoPgtable`] maps whole pages of one size at a time. [`IommuDomain`]
//! takes arbitrary granule-aligned ranges, splits them into the largest
//! pages the alignment allows and rolls back on failure.

use crate::{IoPgtable, IoPgtableError, IommuProt};
use drm_memory_addresses::{IoVirtualAddress, PhysicalAddress, is_aligned};
use log::{debug, warn};

/// Mask of bits `[bit:0]`.
const fn mask_through(bit: u32) -> u64 {
    if bit >= 63 { u64::MAX } else { (1 << (bit + 1)) - 1 }
}

/// Pick the largest page size for the next chunk of `[iova, iova + size)`
/// mapped to `paddr`, and how many such pages to map before a larger size
/// could take over.
fn pick_pgsize(bitmap: u64, iova: u64, paddr: u64, size: u64) -> Option<(u64, u64)> {
    if size == 0 {
        return None;
    }
    let mut candidates = bitmap & mask_through(63 - size.leading_zeros());
    let addr_merge = iova | paddr;
    if addr_merge != 0 {
        candidates &= mask_through(addr_merge.trailing_zeros());
    }
    if candidates == 0 {
        return None;
    }
    let pgsize_idx = 63 - candidates.leading_zeros();
    let pgsize = 1u64 << pgsize_idx;

    // stop at the next boundary where a larger page would fit
    let mut span = size;
    let larger = bitmap & !mask_through(pgsize_idx);
    if larger != 0 {
        let next = 1u64 << larger.trailing_zeros();
        if (iova ^ paddr) & (next - 1) == 0 {
            let to_boundary = next - (iova & (next - 1));
            if to_boundary < span {
                span = to_boundary;
            }
        }
    }
    Some((pgsize, span / pgsize))
}

/// A device address space backed by one page table.
///
/// Mutation needs `&mut self`; wrap the domain in the caller's lock when
/// several threads map into it.
#[derive(Debug)]
pub struct IommuDomain {
    pgtable: IoPgtable,
}

impl IommuDomain {
    #[must_use]
    pub const fn new(pgtable: IoPgtable) -> Self {
        Self { pgtable }
    }

    #[must_use]
    pub const fn pgtable(&self) -> &IoPgtable {
        &self.pgtable
    }

    /// Hand the page table back, keeping its mappings.
    #[must_use]
    pub fn into_pgtable(self) -> IoPgtable {
        self.pgtable
    }

    fn min_pgsize(&self) -> u64 {
        let bitmap = self.pgtable.params().pgsize_bitmap;
        1 << bitmap.trailing_zeros()
    }

    /// Map `[iova, iova + size)` to `[paddr, paddr + size)`.
    ///
    /// Nothing stays mapped if the call fails.
    ///
    /// # Errors
    /// - [`IoPgtableError::InvalidArgument`] if `prot` grants no access or
    ///   an address or `size` is not aligned to the smallest page size.
    /// - Any error of [`IoPgtable::map_pages`].
    pub fn map(
        &mut self,
        iova: IoVirtualAddress,
        paddr: PhysicalAddress,
        size: u64,
        prot: IommuProt,
    ) -> Result<(), IoPgtableError> {
        if !prot.is_accessible() {
            return Err(IoPgtableError::InvalidArgument("mapping grants no access"));
        }
        let min = self.min_pgsize();
        if !is_aligned(iova.as_u64() | paddr.as_u64() | size, min) {
            return Err(IoPgtableError::InvalidArgument(
                "range not aligned to the minimum page size",
            ));
        }

        let bitmap = self.pgtable.params().pgsize_bitmap;
        let mut mapped = 0;
        while mapped < size {
            let cur_iova = iova + mapped;
            let cur_pa = paddr + mapped;
            let fit = pick_pgsize(bitmap, cur_iova.as_u64(), cur_pa.as_u64(), size - mapped);
            let Some((pgsize, count)) = fit else {
                self.rollback(iova, mapped);
                return Err(IoPgtableError::InvalidArgument("no page size fits the range"));
            };
            match self.pgtable.map_pages(cur_iova, cur_pa, pgsize, count, prot) {
                Ok(n) => mapped += n,
                Err(e) => {
                    self.rollback(iova, mapped + e.mapped);
                    return Err(e.source);
                }
            }
        }
        Ok(())
    }

    fn rollback(&mut self, iova: IoVirtualAddress, len: u64) {
        if len == 0 {
            return;
        }
        debug!("rolling back {len:#x} bytes at {iova:?}");
        let undone = self.unmap(iova, len);
        if undone != len {
            warn!("rollback at {iova:?} cleared {undone:#x} of {len:#x} bytes");
        }
    }

    /// Unmap `[iova, iova + size)` and return the bytes cleared.
    ///
    /// Stops at the first hole. Invalidation is deferred to
    /// [`iotlb_sync`](Self::iotlb_sync).
    pub fn unmap(&mut self, iova: IoVirtualAddress, size: u64) -> u64 {
        let bitmap = self.pgtable.params().pgsize_bitmap;
        let min = self.min_pgsize();
        let mut unmapped = 0;
        let mut cap = u64::MAX;
        while unmapped < size {
            let cur = iova + unmapped;
            let fit = pick_pgsize(bitmap & cap, cur.as_u64(), cur.as_u64(), size - unmapped);
            let Some((pgsize, count)) = fit else {
                break;
            };
            let cleared = self.pgtable.unmap_pages(cur, pgsize, count);
            if cleared == 0 {
                if pgsize == min {
                    break;
                }
                // mapped with smaller pages than the alignment allows
                cap = pgsize - 1;
                continue;
            }
            unmapped += cleared;
            cap = u64::MAX;
            if cleared < pgsize * count {
                break;
            }
        }
        unmapped
    }

    /// Map physically discontiguous `extents` back to back from `iova`.
    ///
    /// Returns the total bytes mapped. On failure everything mapped by this
    /// call is unmapped again.
    ///
    /// # Errors
    /// The first error of [`map`](Self::map).
    pub fn map_sg<I>(
        &mut self,
        iova: IoVirtualAddress,
        extents: I,
        prot: IommuProt,
    ) -> Result<u64, IoPgtableError>
    where
        I: IntoIterator<Item = (PhysicalAddress, u64)>,
    {
        let mut total = 0;
        for (pa, len) in extents {
            if let Err(e) = self.map(iova + total, pa, len, prot) {
                self.rollback(iova, total);
                return Err(e);
            }
            total += len;
        }
        Ok(total)
    }

    #[must_use]
    pub fn iova_to_phys(&self, iova: IoVirtualAddress) -> Option<PhysicalAddress> {
        self.pgtable.iova_to_phys(iova)
    }

    pub fn iotlb_sync(&mut self) {
        self.pgtable.iotlb_sync();
    }
}
