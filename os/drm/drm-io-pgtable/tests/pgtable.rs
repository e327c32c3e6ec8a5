mod common;

use common::{CountingAllocator, Flush, Machine, RecordingFlush};
use drm_io_pgtable::*;
use drm_memory_addresses::{IoVirtualAddress, PhysicalAddress};
use std::sync::Arc;

fn iova(v: u64) -> IoVirtualAddress {
    IoVirtualAddress::new(v)
}

fn pa(v: u64) -> PhysicalAddress {
    PhysicalAddress::new(v)
}

fn params_16k() -> PgtableParams {
    PgtableParams::new().with_pgsize_bitmap(SZ_16K | SZ_32M)
}

#[test]
fn lookup_adds_offset_within_page() {
    let m = Machine::new();
    let registry = PgtableRegistry::with_default_formats();
    let mut pt = registry
        .alloc(PgtableFormat::ArmLpaeS1, &m.config(params_16k()), Cookie(1))
        .unwrap();

    assert_eq!(pt.ttbr().as_u64() % SZ_16K, 0);
    assert_eq!(pt.table_count(), 1);

    let mapped = pt
        .map_pages(iova(0x1000_0000), pa(0x2000_0000), SZ_16K, 1, IommuProt::READ_WRITE)
        .unwrap();
    assert_eq!(mapped, SZ_16K);
    assert_eq!(pt.iova_to_phys(iova(0x1000_0100)), Some(pa(0x2000_0100)));
    assert_eq!(pt.iova_to_phys(iova(0x1000_4000)), None);
    // root plus one table per level below it
    assert_eq!(pt.table_count(), 4);
}

#[test]
fn unmap_reverses_map_and_defers_invalidation() {
    let m = Machine::new();
    let flush = Arc::new(RecordingFlush::default());
    let cfg = m.config(params_16k()).with_flush(Some(flush.clone() as Arc<dyn FlushOps>));
    let mut pt = PgtableRegistry::with_default_formats()
        .alloc(PgtableFormat::ArmLpaeS1, &cfg, Cookie(0))
        .unwrap();

    pt.map_pages(iova(0x40_0000), pa(0x9000_0000), SZ_16K, 8, IommuProt::READ)
        .unwrap();
    assert_eq!(pt.unmap_pages(iova(0x40_0000), SZ_16K, 8), 8 * SZ_16K);
    assert_eq!(pt.iova_to_phys(iova(0x40_0000)), None);
    assert_eq!(pt.iova_to_phys(iova(0x41_C000)), None);

    // cleared but not yet invalidated; adjacent pages coalesce
    assert!(flush.take().is_empty());
    assert_eq!(pt.pending_invalidations().ranges().len(), 1);

    pt.iotlb_sync();
    assert!(pt.pending_invalidations().is_empty());
    let expected = IovaRange {
        start: iova(0x40_0000),
        len: 8 * SZ_16K,
        pgsize: SZ_16K,
    };
    assert_eq!(flush.take(), vec![Flush::Range(expected)]);
}

#[test]
fn mapping_over_live_entries_is_refused() {
    let m = Machine::new();
    let mut pt = PgtableRegistry::with_default_formats()
        .alloc(PgtableFormat::ArmLpaeS1, &m.config(params_16k()), Cookie(0))
        .unwrap();

    // a 32M block, then a page inside it
    pt.map_pages(iova(0x200_0000), pa(0x4000_0000), SZ_32M, 1, IommuProt::READ_WRITE)
        .unwrap();
    let err = pt
        .map_pages(iova(0x200_4000), pa(0x5000_0000), SZ_16K, 1, IommuProt::READ_WRITE)
        .unwrap_err();
    assert_eq!(err.mapped, 0);
    assert_eq!(err.source, IoPgtableError::AlreadyMapped { iova: iova(0x200_4000) });
    assert_eq!(pt.iova_to_phys(iova(0x200_4000)), Some(pa(0x4000_4000)));

    // a page, then a block over the table holding it
    pt.map_pages(iova(0x1000_0000), pa(0x2000_0000), SZ_16K, 1, IommuProt::READ_WRITE)
        .unwrap();
    let err = pt
        .map_pages(iova(0x1000_0000), pa(0x6000_0000), SZ_32M, 1, IommuProt::READ_WRITE)
        .unwrap_err();
    assert_eq!(err.source, IoPgtableError::AlreadyMapped { iova: iova(0x1000_0000) });
    assert_eq!(pt.iova_to_phys(iova(0x1000_0000)), Some(pa(0x2000_0000)));

    // same size, same slot
    let err = pt
        .map_pages(iova(0x1000_0000), pa(0x7000_0000), SZ_16K, 1, IommuProt::READ)
        .unwrap_err();
    assert_eq!(err.source, IoPgtableError::AlreadyMapped { iova: iova(0x1000_0000) });
}

#[test]
fn block_replaces_emptied_table() {
    let m = Machine::new();
    let alloc = CountingAllocator::new(m.source.clone(), usize::MAX);
    let flush = Arc::new(RecordingFlush::default());
    let cfg = m
        .config(params_16k())
        .with_allocator(Some(alloc.clone() as Arc<dyn TableAllocator>))
        .with_flush(Some(flush.clone() as Arc<dyn FlushOps>));
    let mut pt = PgtableRegistry::with_default_formats()
        .alloc(PgtableFormat::ArmLpaeS1, &cfg, Cookie(0))
        .unwrap();

    pt.map_pages(iova(0x4000_0000), pa(0x2000_0000), SZ_16K, 1, IommuProt::READ_WRITE)
        .unwrap();
    assert_eq!(pt.table_count(), 4);
    assert_eq!(pt.unmap_pages(iova(0x4000_0000), SZ_16K, 1), SZ_16K);
    assert_eq!(pt.iova_to_phys(iova(0x4000_0000)), None);

    let mapped = pt
        .map_pages(iova(0x4000_0000), pa(0x6000_0000), SZ_32M, 1, IommuProt::READ_WRITE)
        .unwrap();
    assert_eq!(mapped, SZ_32M);
    assert_eq!(pt.iova_to_phys(iova(0x4000_4000)), Some(pa(0x6000_4000)));

    // the last-level table is gone, and was invalidated before it was freed
    assert_eq!(pt.table_count(), 3);
    assert_eq!(alloc.live(), 3);
    assert!(pt.pending_invalidations().is_empty());
    let walk = IovaRange {
        start: iova(0x4000_0000),
        len: SZ_32M,
        pgsize: SZ_16K,
    };
    assert!(flush.take().contains(&Flush::Range(walk)));
}

#[test]
fn partial_map_reports_exact_progress() {
    let m = Machine::new();
    let mut pt = PgtableRegistry::with_default_formats()
        .alloc(PgtableFormat::ArmLpaeS1, &m.config(params_16k()), Cookie(0))
        .unwrap();

    pt.map_pages(iova(0x1000_8000), pa(0x3000_0000), SZ_16K, 1, IommuProt::READ)
        .unwrap();
    let err = pt
        .map_pages(iova(0x1000_0000), pa(0x2000_0000), SZ_16K, 4, IommuProt::READ_WRITE)
        .unwrap_err();
    assert_eq!(err.mapped, 2 * SZ_16K);
    assert_eq!(err.source, IoPgtableError::AlreadyMapped { iova: iova(0x1000_8000) });

    // the caller rolls back exactly what was installed
    assert_eq!(pt.unmap_pages(iova(0x1000_0000), SZ_16K, err.mapped / SZ_16K), err.mapped);
    assert_eq!(pt.iova_to_phys(iova(0x1000_8000)), Some(pa(0x3000_0000)));
}

#[test]
fn table_exhaustion_mid_map() {
    let m = Machine::new();
    let alloc = CountingAllocator::new(m.source.clone(), 4);
    let cfg = m
        .config(params_16k())
        .with_allocator(Some(alloc.clone() as Arc<dyn TableAllocator>));
    let mut pt = PgtableRegistry::with_default_formats()
        .alloc(PgtableFormat::ArmLpaeS1, &cfg, Cookie(7))
        .unwrap();

    // last page of the first 32M region, then the first page of the next,
    // which needs a fifth table
    let err = pt
        .map_pages(iova(0x1FF_C000), pa(0x2000_0000), SZ_16K, 2, IommuProt::READ)
        .unwrap_err();
    assert_eq!(err.mapped, SZ_16K);
    assert_eq!(err.source, IoPgtableError::OutOfMemory);
    assert_eq!(pt.iova_to_phys(iova(0x1FF_C000)), Some(pa(0x2000_0000)));
    assert_eq!(pt.table_count(), 4);
    assert_eq!(alloc.live(), 4);
}

#[test]
fn free_returns_every_table() {
    let m = Machine::new();
    let free_before = m.source.free_frames();
    let alloc = CountingAllocator::new(m.source.clone(), usize::MAX);
    let flush = Arc::new(RecordingFlush::default());
    let cfg = m
        .config(params_16k())
        .with_allocator(Some(alloc.clone() as Arc<dyn TableAllocator>))
        .with_flush(Some(flush.clone() as Arc<dyn FlushOps>));
    let mut pt = PgtableRegistry::with_default_formats()
        .alloc(PgtableFormat::ArmLpaeS1, &cfg, Cookie(0))
        .unwrap();

    let bases = [0x0u64, 0x4000_0000, 0x80_0000_0000, 0xFFFF_FE00_0000];
    for (i, base) in bases.into_iter().enumerate() {
        pt.map_pages(iova(base), pa(0x1_0000_0000 + i as u64 * SZ_16K), SZ_16K, 1, IommuProt::READ)
            .unwrap();
    }
    assert!(pt.table_count() > 4);
    assert_eq!(alloc.live(), pt.table_count());

    assert_eq!(pt.unmap_pages(iova(0x4000_0000), SZ_16K, 1), SZ_16K);
    pt.free();

    assert_eq!(alloc.live(), 0);
    assert_eq!(m.source.free_frames(), free_before);
    // the pending range was flushed on the way out
    let flushed = flush.take();
    assert!(flushed.iter().any(|f| matches!(f, Flush::Range(r) if r.start == iova(0x4000_0000))));
}

#[test]
fn different_size_unmap_is_refused() {
    let m = Machine::new();
    let mut pt = PgtableRegistry::with_default_formats()
        .alloc(PgtableFormat::ArmLpaeS1, &m.config(params_16k()), Cookie(0))
        .unwrap();

    pt.map_pages(iova(0x400_0000), pa(0x4000_0000), SZ_32M, 1, IommuProt::READ)
        .unwrap();
    assert_eq!(pt.unmap_pages(iova(0x400_4000), SZ_16K, 1), 0);
    assert_eq!(pt.iova_to_phys(iova(0x400_4000)), Some(pa(0x4000_4000)));

    pt.map_pages(iova(0x800_0000), pa(0x5000_0000), SZ_16K, 1, IommuProt::READ)
        .unwrap();
    assert_eq!(pt.unmap_pages(iova(0x800_0000), SZ_32M, 1), 0);
    assert_eq!(pt.iova_to_phys(iova(0x800_0000)), Some(pa(0x5000_0000)));

    // nothing there at all
    assert_eq!(pt.unmap_pages(iova(0x1_0000_0000), SZ_16K, 4), 0);
    assert!(pt.pending_invalidations().is_empty());
}

#[test]
fn bad_arguments() {
    let m = Machine::new();
    let mut pt = PgtableRegistry::with_default_formats()
        .alloc(PgtableFormat::ArmLpaeS1, &m.config(params_16k()), Cookie(0))
        .unwrap();
    let invalid = |r: Result<u64, MapError>| {
        matches!(
            r,
            Err(MapError {
                mapped: 0,
                source: IoPgtableError::InvalidArgument(_)
            })
        )
    };

    assert_eq!(pt.map_pages(iova(0), pa(0), SZ_16K, 0, IommuProt::READ), Ok(0));
    assert_eq!(pt.map_pages(iova(0), pa(0), SZ_16K, 1, IommuProt::new()), Ok(0));
    assert_eq!(pt.iova_to_phys(iova(0)), None);

    assert!(invalid(pt.map_pages(iova(0), pa(0), SZ_2M, 1, IommuProt::READ)));
    assert!(invalid(pt.map_pages(iova(1 << 48), pa(0), SZ_16K, 1, IommuProt::READ)));
    assert!(invalid(pt.map_pages(iova((1 << 48) - SZ_16K), pa(0), SZ_16K, 2, IommuProt::READ)));
    assert!(invalid(pt.map_pages(iova(u64::MAX - SZ_16K + 1), pa(0), SZ_16K, 2, IommuProt::READ)));
    assert!(invalid(pt.map_pages(iova(0), pa(1 << 48), SZ_16K, 1, IommuProt::READ)));
    assert!(invalid(pt.map_pages(iova(0x4000), pa(0), SZ_32M, 1, IommuProt::READ)));
    assert_eq!(pt.unmap_pages(iova(1 << 48), SZ_16K, 1), 0);
    assert_eq!(pt.table_count(), 1);

    // sub-granule bits are truncated
    pt.map_pages(iova(0x8123), pa(0x1_0000_0456), SZ_16K, 1, IommuProt::READ)
        .unwrap();
    assert_eq!(pt.iova_to_phys(iova(0x8010)), Some(pa(0x1_0000_0010)));
}

#[test]
fn upper_half_tables() {
    let m = Machine::new();
    let params = params_16k().with_quirks(PgtableQuirks::new().with_arm_ttbr1(true));
    let mut pt = PgtableRegistry::with_default_formats()
        .alloc(PgtableFormat::ArmLpaeS1, &m.config(params), Cookie(0))
        .unwrap();

    let top = 0xFFFF_FFFF_F000_0000;
    pt.map_pages(iova(top), pa(0x2000_0000), SZ_16K, 1, IommuProt::READ)
        .unwrap();
    assert_eq!(pt.iova_to_phys(iova(top + 0x10)), Some(pa(0x2000_0010)));

    let err = pt
        .map_pages(iova(0x1000_0000), pa(0x2000_0000), SZ_16K, 1, IommuProt::READ)
        .unwrap_err();
    assert!(matches!(err.source, IoPgtableError::InvalidArgument(_)));
    assert_eq!(pt.iova_to_phys(iova(0x1000_0000)), None);
}

#[test]
fn non_coherent_walker_gets_table_syncs() {
    let m = Machine::new();
    let flush = Arc::new(RecordingFlush::default());
    let cfg = m
        .config(params_16k().with_coherent_walk(false))
        .with_flush(Some(flush.clone() as Arc<dyn FlushOps>));
    let mut pt = PgtableRegistry::with_default_formats()
        .alloc(PgtableFormat::ArmLpaeS1, &cfg, Cookie(0))
        .unwrap();
    let root = pt.ttbr();
    assert_eq!(flush.take(), vec![Flush::Sync(root, SZ_16K)]);

    pt.map_pages(iova(0), pa(0x2000_0000), SZ_16K, 1, IommuProt::READ)
        .unwrap();
    let syncs = flush.take();
    // three new tables plus three table pointers and one leaf
    let table_syncs = syncs.iter().filter(|f| matches!(f, Flush::Sync(_, len) if *len == SZ_16K));
    assert_eq!(table_syncs.count(), 3);
    assert_eq!(syncs.iter().filter(|f| matches!(f, Flush::Sync(_, 8))).count(), 4);
}

#[test]
fn many_disjoint_ranges_flush_everything() {
    let m = Machine::new();
    let flush = Arc::new(RecordingFlush::default());
    let cfg = m.config(params_16k()).with_flush(Some(flush.clone() as Arc<dyn FlushOps>));
    let mut pt = PgtableRegistry::with_default_formats()
        .alloc(PgtableFormat::ArmLpaeS1, &cfg, Cookie(0))
        .unwrap();

    for i in 0..20 {
        let at = iova(i * 2 * SZ_16K);
        pt.map_pages(at, pa(0x2000_0000), SZ_16K, 1, IommuProt::READ).unwrap();
        assert_eq!(pt.unmap_pages(at, SZ_16K, 1), SZ_16K);
    }
    assert_eq!(pt.pending_invalidations().ranges().len(), 20);
    pt.iotlb_sync();
    assert_eq!(flush.take(), vec![Flush::All]);
}
