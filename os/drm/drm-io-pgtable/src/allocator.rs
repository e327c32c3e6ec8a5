use crate::Cookie;
use alloc::sync::Arc;
use drm_memory_addresses::PhysicalAddress;
use drm_page_alloc::{BlockRequest, PageSource, ReleaseHints};

/// Supplier of physical memory for translation tables.
///
/// Tables must be physically contiguous and aligned to their size. The
/// engine zero-fills every table itself, so implementations need not.
pub trait TableAllocator: Send + Sync {
    fn alloc_table(&self, size: u64, cookie: Cookie) -> Option<PhysicalAddress>;

    /// Return a table obtained from [`alloc_table`](Self::alloc_table) with
    /// the same size and cookie.
    fn free_table(&self, table: PhysicalAddress, size: u64, cookie: Cookie);
}

/// Default table allocator: size-aligned blocks from a [`PageSource`].
pub struct DmaTableAllocator {
    source: Arc<dyn PageSource>,
}

impl DmaTableAllocator {
    #[must_use]
    pub fn new(source: Arc<dyn PageSource>) -> Self {
        Self { source }
    }
}

impl TableAllocator for DmaTableAllocator {
    fn alloc_table(&self, size: u64, _cookie: Cookie) -> Option<PhysicalAddress> {
        let req = BlockRequest::zeroed(size).with_align(size).with_zero(false);
        self.source.alloc_block(req)
    }

    fn free_table(&self, table: PhysicalAddress, size: u64, _cookie: Cookie) {
        // tables are written by the CPU on every map
        self.source
            .free_block(table, size, ReleaseHints::default().with_dirty(true));
    }
}
