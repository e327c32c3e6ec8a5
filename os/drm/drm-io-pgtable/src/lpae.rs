//! LPAE table engine shared by the stage-1 and UAT formats.

mod arena;
mod geometry;
mod pte;

pub use geometry::{LAST_LEVEL, LpaeGeometry};
pub use pte::{LpaePte, PteKind};

use crate::allocator::{DmaTableAllocator, TableAllocator};
use crate::format::{FormatCaps, FormatDescriptor, IoPgtableOps, PgtableFormat};
use crate::gather::{FlushOps, IotlbGather};
use crate::{
    Cookie, IoPgtableError, IommuProt, MapError, PgtableConfig, PgtableConfigError, PgtableParams,
    PgtableQuirks,
};
use alloc::boxed::Box;
use alloc::sync::Arc;
use arena::{TableArena, TableHandle};
use core::sync::atomic::{AtomicU64, Ordering, fence};
use drm_memory_addresses::{Granule, IoVirtualAddress, PhysicalAddress, is_aligned};
use drm_page_alloc::{PhysMapper, phys_slice, zero_phys};
use log::{debug, error, trace, warn};

/// Above this many disjoint ranges, one full invalidation is cheaper.
const FLUSH_ALL_THRESHOLD: usize = 16;

pub fn arm_lpae_s1_descriptor() -> FormatDescriptor {
    FormatDescriptor {
        format: PgtableFormat::ArmLpaeS1,
        caps: FormatCaps::new().with_custom_allocator(true),
        max_ias: 48,
        max_oas: 48,
        supported_quirks: PgtableQuirks::new()
            .with_arm_ns(true)
            .with_arm_ttbr1(true)
            .with_arm_outer_wbwa(true),
        granules: &[Granule::Size4K, Granule::Size16K],
        alloc: alloc_lpae,
        free: free_lpae,
    }
}

pub fn apple_uat_descriptor() -> FormatDescriptor {
    FormatDescriptor {
        format: PgtableFormat::AppleUat,
        caps: FormatCaps::new(),
        max_ias: 48,
        max_oas: 42,
        supported_quirks: PgtableQuirks::new(),
        granules: &[Granule::Size16K],
        alloc: alloc_lpae,
        free: free_lpae,
    }
}

fn alloc_lpae(
    desc: &FormatDescriptor,
    cfg: &PgtableConfig,
    cookie: Cookie,
) -> Result<Box<dyn IoPgtableOps>, PgtableConfigError> {
    let p = cfg.params;
    let granule = desc
        .select_granule(p.pgsize_bitmap)
        .ok_or(PgtableConfigError::NoSupportedGranule(p.pgsize_bitmap))?;
    let geometry =
        LpaeGeometry::new(granule, p.ias).ok_or(PgtableConfigError::InputAddressTooNarrow(p.ias))?;

    let allocator: Arc<dyn TableAllocator> = match (&cfg.allocator, &cfg.dma) {
        (Some(custom), _) => Arc::clone(custom),
        (None, Some(dma)) => Arc::new(DmaTableAllocator::new(Arc::clone(dma))),
        (None, None) => return Err(PgtableConfigError::NoAllocator),
    };

    let params = p.with_pgsize_bitmap(p.pgsize_bitmap & geometry.supported_pgsizes());
    let table = LpaePgtable::new(
        desc.format,
        params,
        geometry,
        allocator,
        Arc::clone(&cfg.mapper),
        cfg.flush.clone(),
        cookie,
    )?;
    Ok(Box::new(table))
}

fn free_lpae(ops: &mut dyn IoPgtableOps) {
    ops.release();
}

/// A live LPAE page table.
///
/// Tables are granule-sized blocks of physical memory seen through the
/// [`PhysMapper`]; the [`TableArena`] owns their bookkeeping.
pub struct LpaePgtable {
    format: PgtableFormat,
    params: PgtableParams,
    geometry: LpaeGeometry,
    allocator: Arc<dyn TableAllocator>,
    mapper: Arc<dyn PhysMapper>,
    flush: Option<Arc<dyn FlushOps>>,
    cookie: Cookie,
    arena: TableArena,
    root: TableHandle,
    ttbr: PhysicalAddress,
    gather: IotlbGather,
}

impl LpaePgtable {
    fn new(
        format: PgtableFormat,
        params: PgtableParams,
        geometry: LpaeGeometry,
        allocator: Arc<dyn TableAllocator>,
        mapper: Arc<dyn PhysMapper>,
        flush: Option<Arc<dyn FlushOps>>,
        cookie: Cookie,
    ) -> Result<Self, PgtableConfigError> {
        let size = geometry.table_size();
        let root_phys = allocator
            .alloc_table(size, cookie)
            .ok_or(PgtableConfigError::OutOfMemory)?;

        let mut arena = TableArena::new();
        let root = arena.insert(root_phys, geometry.start_level());
        let mut table = Self {
            format,
            params,
            geometry,
            allocator,
            mapper,
            flush,
            cookie,
            arena,
            root,
            ttbr: PhysicalAddress::zero(),
            gather: IotlbGather::new(),
        };
        table.init_table(root_phys);
        // publish only after the zeroed root is visible
        fence(Ordering::Release);
        table.ttbr = root_phys;
        debug!(
            "{format:?}: {:?}, start level {}, pgd_bits {}",
            geometry.granule(),
            geometry.start_level(),
            geometry.pgd_bits()
        );
        Ok(table)
    }

    /// Zero a freshly allocated table and make it visible to the walker.
    fn init_table(&self, table: PhysicalAddress) {
        let size = self.geometry.table_size();
        // SAFETY: the table was just allocated for us and nothing points at it yet.
        unsafe { zero_phys(self.mapper.as_ref(), table, size as usize) };
        self.sync_table(table, size);
    }

    fn sync_table(&self, table: PhysicalAddress, len: u64) {
        if self.params.coherent_walk {
            return;
        }
        if let Some(flush) = &self.flush {
            flush.sync_table(table, len, self.cookie);
        }
    }

    fn pte_slot(&self, table: PhysicalAddress, idx: usize) -> &AtomicU64 {
        let count = self.geometry.ptes_per_table();
        // SAFETY: `table` is tracked by the arena, so it is allocated, table
        // sized and size aligned until `release` frees it under `&mut self`.
        let ptes: &[AtomicU64] = unsafe { phys_slice(self.mapper.as_ref(), table, count) };
        &ptes[idx]
    }

    fn write_pte(&self, table: PhysicalAddress, idx: usize, pte: LpaePte) {
        self.pte_slot(table, idx).store(pte.into(), Ordering::Relaxed);
        self.sync_table(table + (idx as u64) * 8, 8);
    }

    /// Decode the entry at `idx`. Reserved encodings and pointers to tables
    /// the arena does not track decode as [`Decoded::Malformed`].
    fn decode(&self, table: PhysicalAddress, idx: usize, level: u32) -> Decoded {
        let raw = LpaePte::from(self.pte_slot(table, idx).load(Ordering::Acquire));
        match raw.kind(level, LAST_LEVEL) {
            None if raw.valid() => {
                error!("reserved descriptor {:#x} at level {level}", u64::from(raw));
                Decoded::Malformed
            }
            None => Decoded::Invalid,
            Some(PteKind::Leaf(pa)) => Decoded::Leaf(pa),
            Some(PteKind::Table(pa)) => match self.arena.lookup(pa) {
                Some(handle) => Decoded::Table(handle, pa),
                None => {
                    error!("descriptor at level {level} points to foreign table {pa}");
                    Decoded::Malformed
                }
            },
        }
    }

    /// Whether `[iova, iova + len)` lies in the translated input range.
    fn range_valid(&self, iova: u64, len: u64) -> bool {
        let Some(last) = iova.checked_add(len - 1) else {
            return false;
        };
        let ias = self.params.ias;
        let ttbr1 = self.params.quirks.arm_ttbr1();
        [iova, last].iter().all(|&a| {
            let iaext = ((a as i64) >> ias) as u64;
            if ttbr1 { !iaext == 0 } else { iaext == 0 }
        })
    }

    fn check_request(
        &self,
        iova: u64,
        paddr: Option<u64>,
        pgsize: u64,
        pgcount: u64,
    ) -> Result<u32, IoPgtableError> {
        if pgsize & self.params.pgsize_bitmap == 0 || !pgsize.is_power_of_two() {
            return Err(IoPgtableError::InvalidArgument("page size not supported"));
        }
        let Some(level) = self.geometry.level_for(pgsize) else {
            return Err(IoPgtableError::InvalidArgument("page size not supported"));
        };
        if !is_aligned(iova | paddr.unwrap_or(0), pgsize) {
            return Err(IoPgtableError::InvalidArgument("address not aligned to page size"));
        }
        let Some(len) = pgsize.checked_mul(pgcount) else {
            return Err(IoPgtableError::InvalidArgument("length overflows"));
        };
        if !self.range_valid(iova, len) {
            return Err(IoPgtableError::InvalidArgument("IOVA range outside input address space"));
        }
        if let Some(pa) = paddr {
            let fits = pa.checked_add(len - 1).is_some_and(|end| end >> self.params.oas == 0);
            if !fits {
                return Err(IoPgtableError::InvalidArgument(
                    "physical range outside output address space",
                ));
            }
        }
        Ok(level)
    }

    fn alloc_child(&mut self, level: u32) -> Result<PhysicalAddress, IoPgtableError> {
        let child = self
            .allocator
            .alloc_table(self.geometry.table_size(), self.cookie)
            .ok_or(IoPgtableError::OutOfMemory)?;
        self.init_table(child);
        self.arena.insert(child, level);
        // the zeroed table must be visible before anything points at it
        fence(Ordering::Release);
        trace!("new level {level} table at {child}");
        Ok(child)
    }

    fn map_one(
        &mut self,
        iova: u64,
        paddr: u64,
        leaf_level: u32,
        attrs: LpaePte,
    ) -> Result<(), IoPgtableError> {
        let malformed = IoPgtableError::InvalidArgument("malformed table entry");
        let already = IoPgtableError::AlreadyMapped {
            iova: IoVirtualAddress::new(iova),
        };
        let mut table = self.ttbr;
        let mut level = self.geometry.start_level();
        loop {
            let idx = self.geometry.index(iova, level);
            let entry = self.decode(table, idx, level);

            if level == leaf_level {
                let last = level == LAST_LEVEL;
                let leaf = LpaePte::make_leaf(PhysicalAddress::new(paddr), attrs, last);
                return match entry {
                    Decoded::Invalid => {
                        self.write_pte(table, idx, leaf);
                        Ok(())
                    }
                    Decoded::Table(handle, child) if self.subtree_is_empty(handle) => {
                        self.write_pte(table, idx, leaf);
                        self.retire_table(iova, level, handle, child);
                        Ok(())
                    }
                    Decoded::Malformed => Err(malformed),
                    Decoded::Table(..) | Decoded::Leaf(_) => Err(already),
                };
            }

            table = match entry {
                Decoded::Invalid => {
                    let child = self.alloc_child(level + 1)?;
                    self.write_pte(table, idx, LpaePte::make_table(child, self.params.quirks));
                    child
                }
                Decoded::Table(_, child) => child,
                Decoded::Leaf(_) => return Err(already),
                Decoded::Malformed => return Err(malformed),
            };
            level += 1;
        }
    }

    fn unmap_one(&mut self, iova: u64, pgsize: u64, leaf_level: u32) -> u64 {
        let mut table = self.ttbr;
        let mut level = self.geometry.start_level();
        loop {
            let idx = self.geometry.index(iova, level);
            match self.decode(table, idx, level) {
                Decoded::Invalid | Decoded::Malformed => return 0,
                Decoded::Leaf(_) if level == leaf_level => {
                    self.write_pte(table, idx, LpaePte::new());
                    self.gather.add(IoVirtualAddress::new(iova), pgsize, pgsize);
                    return pgsize;
                }
                Decoded::Table(_, child) if level < leaf_level => table = child,
                Decoded::Leaf(_) => {
                    warn!(
                        "refusing to unmap {pgsize:#x} at {iova:#x}: covered by a {:#x} block",
                        self.geometry.block_size(level)
                    );
                    return 0;
                }
                Decoded::Table(..) => {
                    warn!("refusing to unmap {pgsize:#x} at {iova:#x}: mapped with smaller pages");
                    return 0;
                }
            }
            level += 1;
        }
    }

    /// No valid leaf anywhere below `handle`.
    fn subtree_is_empty(&self, handle: TableHandle) -> bool {
        let slot = self.arena.get(handle);
        (0..self.geometry.entries(slot.level)).all(|idx| {
            match self.decode(slot.phys, idx, slot.level) {
                Decoded::Invalid => true,
                Decoded::Table(child, _) => self.subtree_is_empty(child),
                Decoded::Leaf(_) | Decoded::Malformed => false,
            }
        })
    }

    /// Free an empty table that a block entry at `level` just replaced.
    ///
    /// The walker may still cache the old pointer, so the block's range is
    /// invalidated before the table memory goes back to the allocator.
    fn retire_table(&mut self, iova: u64, level: u32, handle: TableHandle, table: PhysicalAddress) {
        fence(Ordering::Release);
        let block = self.geometry.block_size(level);
        let start = IoVirtualAddress::new(iova & !(block - 1));
        self.gather.add(start, block, self.geometry.block_size(level + 1));
        self.iotlb_sync();
        self.free_subtree(handle);
        trace!("replaced empty level {} table {table} with a {block:#x} block", level + 1);
    }

    /// Post-order release of `handle` and everything below it.
    fn free_subtree(&mut self, handle: TableHandle) {
        let slot = self.arena.get(handle);
        if slot.level < LAST_LEVEL {
            for idx in 0..self.geometry.entries(slot.level) {
                if let Decoded::Table(child, _) = self.decode(slot.phys, idx, slot.level) {
                    self.free_subtree(child);
                }
            }
        }
        self.arena.remove(handle);
        self.allocator
            .free_table(slot.phys, self.geometry.table_size(), self.cookie);
    }
}

#[derive(Debug, Copy, Clone)]
enum Decoded {
    Invalid,
    Table(TableHandle, PhysicalAddress),
    Leaf(PhysicalAddress),
    Malformed,
}

impl IoPgtableOps for LpaePgtable {
    fn params(&self) -> &PgtableParams {
        &self.params
    }

    fn ttbr(&self) -> PhysicalAddress {
        self.ttbr
    }

    fn map_pages(
        &mut self,
        iova: IoVirtualAddress,
        paddr: PhysicalAddress,
        pgsize: u64,
        pgcount: u64,
        prot: IommuProt,
    ) -> Result<u64, MapError> {
        if self.arena.is_empty() {
            return Err(MapError {
                mapped: 0,
                source: IoPgtableError::InvalidArgument("page table was released"),
            });
        }
        if pgcount == 0 || !prot.is_accessible() {
            return Ok(0);
        }
        let granule = self.geometry.granule().size();
        let iova = iova.align_down_to(granule).as_u64();
        let paddr = paddr.align_down_to(granule).as_u64();
        let leaf_level = self
            .check_request(iova, Some(paddr), pgsize, pgcount)
            .map_err(|source| MapError { mapped: 0, source })?;

        let attrs =
            LpaePte::leaf_attrs(self.format, prot, self.params.quirks, self.params.coherent_walk);
        let mut mapped = 0;
        let mut result = Ok(());
        for i in 0..pgcount {
            let off = i * pgsize;
            if let Err(e) = self.map_one(iova + off, paddr + off, leaf_level, attrs) {
                result = Err(e);
                break;
            }
            mapped += pgsize;
        }
        fence(Ordering::Release);

        match result {
            Ok(()) => {
                trace!("mapped {mapped:#x} bytes at {iova:#x} -> {paddr:#x}");
                Ok(mapped)
            }
            Err(source) => {
                debug!("map at {iova:#x} stopped after {mapped:#x} bytes: {source}");
                Err(MapError { mapped, source })
            }
        }
    }

    fn unmap_pages(&mut self, iova: IoVirtualAddress, pgsize: u64, pgcount: u64) -> u64 {
        if pgcount == 0 || self.arena.is_empty() {
            return 0;
        }
        let iova = iova.align_down_to(self.geometry.granule().size()).as_u64();
        let leaf_level = match self.check_request(iova, None, pgsize, pgcount) {
            Ok(level) => level,
            Err(e) => {
                warn!("unmap of {pgcount} x {pgsize:#x} at {iova:#x} rejected: {e}");
                return 0;
            }
        };

        let unmapped: u64 = (0..pgcount)
            .map(|i| self.unmap_one(iova + i * pgsize, pgsize, leaf_level))
            .sum();
        fence(Ordering::Release);
        trace!("unmapped {unmapped:#x} bytes at {iova:#x}");
        unmapped
    }

    fn iova_to_phys(&self, iova: IoVirtualAddress) -> Option<PhysicalAddress> {
        let iova = iova.as_u64();
        if self.arena.is_empty() || !self.range_valid(iova, 1) {
            return None;
        }
        let mut table = self.ttbr;
        let mut level = self.geometry.start_level();
        loop {
            let idx = self.geometry.index(iova, level);
            match self.decode(table, idx, level) {
                Decoded::Invalid | Decoded::Malformed => return None,
                Decoded::Table(_, child) => table = child,
                Decoded::Leaf(pa) => {
                    let mask = self.geometry.block_size(level) - 1;
                    return Some(pa + (iova & mask));
                }
            }
            level += 1;
        }
    }

    fn pending_invalidations(&self) -> &IotlbGather {
        &self.gather
    }

    fn iotlb_sync(&mut self) {
        let ranges = self.gather.take();
        if ranges.is_empty() {
            return;
        }
        let Some(flush) = &self.flush else {
            debug!("dropping {} pending invalidation(s), no flush callbacks", ranges.len());
            return;
        };
        if ranges.len() > FLUSH_ALL_THRESHOLD {
            trace!("invalidating everything for {} ranges", ranges.len());
            flush.tlb_flush_all(self.cookie);
            return;
        }
        for range in ranges {
            trace!("invalidating {range:?}");
            flush.tlb_flush_range(range, self.cookie);
        }
    }

    fn table_count(&self) -> usize {
        self.arena.len()
    }

    fn release(&mut self) {
        if self.arena.is_empty() {
            return;
        }
        self.iotlb_sync();
        let tables = self.arena.len();
        self.free_subtree(self.root);
        debug!("{:?}: released {tables} table(s), root {}", self.format, self.ttbr);
    }
}

impl Drop for LpaePgtable {
    fn drop(&mut self) {
        self.release();
    }
}
