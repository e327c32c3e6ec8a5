use crate::ShmemConfig;
use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use drm_memory_addresses::{PhysicalAddress, VirtualAddress};
use drm_page_alloc::PageSource;

/// First fake file offset handed out for user mappings.
///
/// Offsets live above 4 GiB so they never collide with legacy map handles.
pub const MMAP_OFFSET_BASE: u64 = 0x1_0000_0000;

/// CPU cache attribute of a mapping.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum CacheMode {
    #[default]
    Normal,
    WriteCombine,
}

/// Builds contiguous kernel mappings over scattered pages.
pub trait KernelMapper: Send + Sync {
    /// Map `pages` (4 KiB each, in order) contiguously, or return `None`
    /// when no virtual range is available.
    fn vmap(&self, pages: &[PhysicalAddress], cache: CacheMode) -> Option<VirtualAddress>;

    /// Tear down a mapping of `pages` 4 KiB pages created by [`vmap`](Self::vmap).
    fn vunmap(&self, vaddr: VirtualAddress, pages: usize);
}

/// The user address space a faulting mapping lives in.
pub trait UserPageTable {
    /// Install one 4 KiB page at `vaddr`. Returns `false` if the page table
    /// could not be extended.
    fn insert_page(&self, vaddr: VirtualAddress, page: PhysicalAddress, cache: CacheMode) -> bool;
}

/// Everything buffer objects of one device share.
#[derive(Clone)]
pub struct GemDevice {
    source: Arc<dyn PageSource>,
    mapper: Arc<dyn KernelMapper>,
    config: ShmemConfig,
    next_offset: Arc<AtomicU64>,
}

impl GemDevice {
    #[must_use]
    pub fn new(
        source: Arc<dyn PageSource>,
        mapper: Arc<dyn KernelMapper>,
        config: ShmemConfig,
    ) -> Self {
        Self {
            source,
            mapper,
            config,
            next_offset: Arc::new(AtomicU64::new(MMAP_OFFSET_BASE)),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &ShmemConfig {
        &self.config
    }

    #[must_use]
    pub fn source(&self) -> &dyn PageSource {
        self.source.as_ref()
    }

    #[must_use]
    pub fn mapper(&self) -> &dyn KernelMapper {
        self.mapper.as_ref()
    }

    /// Reserve a fake file offset range of `size` bytes.
    pub(crate) fn alloc_mmap_offset(&self, size: u64) -> u64 {
        self.next_offset.fetch_add(size, Ordering::Relaxed)
    }
}

impl fmt::Debug for GemDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GemDevice")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
