//! User mappings and page faults.

use crate::{Backing, CacheMode, GemError, ReclaimState, ShmemObject, UserPageTable};
use alloc::sync::Arc;
use bitfield_struct::bitfield;
use core::fmt;
use drm_memory_addresses::{CPU_PAGE_SIZE, PhysicalAddress, VirtualAddress};
use log::trace;

/// Properties of a user mapping.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct VmFlags {
    /// Populated by frame number at fault time, never with pageable memory.
    pub pfn_map: bool,
    /// The mapping cannot be grown.
    pub dont_expand: bool,
    /// Excluded from core dumps.
    pub dont_dump: bool,
    #[bits(5)]
    __: u8,
}

/// A user-space mapping of a whole buffer.
///
/// Native mappings hold a pages reference and are populated one page per
/// fault. Imported mappings belong to the exporter and hold nothing.
pub struct ShmemMapping {
    obj: Arc<ShmemObject>,
    start: VirtualAddress,
    flags: VmFlags,
    cache: CacheMode,
    holds_pages: bool,
}

impl ShmemObject {
    /// Map the buffer into user space at `start`.
    ///
    /// Nothing is inserted into the user page table yet; see
    /// [`ShmemMapping::fault`].
    ///
    /// # Errors
    /// - Any error of [`ShmemLocked::get_pages`](crate::ShmemLocked::get_pages).
    /// - [`GemError::Exporter`] if the exporter refuses an imported mapping.
    pub fn mmap(self: &Arc<Self>, start: VirtualAddress) -> Result<ShmemMapping, GemError> {
        let (flags, cache, holds_pages) = match self.backing() {
            Backing::Imported(exporter) => {
                exporter.mmap(start, self.size())?;
                (VmFlags::new(), CacheMode::Normal, false)
            }
            Backing::Native => {
                self.lock().get_pages()?;
                let flags = VmFlags::new()
                    .with_pfn_map(true)
                    .with_dont_expand(true)
                    .with_dont_dump(true);
                (flags, self.device().config().cache_mode(), true)
            }
        };
        trace!("mmap of {:#x} byte buffer at {start}", self.size());
        Ok(ShmemMapping {
            obj: Arc::clone(self),
            start,
            flags,
            cache,
            holds_pages,
        })
    }
}

impl ShmemMapping {
    #[must_use]
    pub const fn object(&self) -> &Arc<ShmemObject> {
        &self.obj
    }

    #[must_use]
    pub const fn start(&self) -> VirtualAddress {
        self.start
    }

    /// Length of the mapping; always the whole buffer.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.obj.size()
    }

    #[must_use]
    pub const fn flags(&self) -> VmFlags {
        self.flags
    }

    #[must_use]
    pub const fn cache_mode(&self) -> CacheMode {
        self.cache
    }

    /// Resolve a user access at `addr` by inserting the backing page into
    /// `pt`. Only that one page is inserted.
    ///
    /// # Errors
    /// - [`GemError::AccessViolation`] if `addr` lies outside the mapping,
    ///   the pages are not resident or the content was purged.
    /// - [`GemError::OutOfMemory`] if `pt` cannot take the page.
    pub fn fault(
        &self,
        addr: VirtualAddress,
        pt: &dyn UserPageTable,
    ) -> Result<PhysicalAddress, GemError> {
        let offset = addr.as_u64().wrapping_sub(self.start.as_u64());
        // the lock keeps purge from freeing the page under the insertion
        let locked = self.obj.lock();
        let page = locked.page_at(offset)?;
        let vaddr = addr.align_down_to(CPU_PAGE_SIZE);
        if !pt.insert_page(vaddr, page, self.cache) {
            return Err(GemError::OutOfMemory);
        }
        trace!("fault at {addr}: inserted {page}");
        Ok(page)
    }

    /// Copy the mapping into another address space, as on fork.
    ///
    /// The copy takes its own pages reference unless the content was
    /// already purged.
    #[must_use]
    pub fn duplicate(&self) -> Self {
        let mut holds_pages = false;
        if self.holds_pages {
            let mut locked = self.obj.lock();
            if locked.reclaim_state() != ReclaimState::Purged {
                locked.state.pages_use_count += 1;
                holds_pages = true;
            }
        }
        Self {
            obj: Arc::clone(&self.obj),
            start: self.start,
            flags: self.flags,
            cache: self.cache,
            holds_pages,
        }
    }
}

impl fmt::Debug for ShmemMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShmemMapping")
            .field("start", &self.start)
            .field("size", &self.obj.size())
            .field("flags", &self.flags)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl Drop for ShmemMapping {
    fn drop(&mut self) {
        if self.holds_pages {
            self.obj.lock().put_pages();
        }
    }
}
