use crate::pages::release_pages;
use crate::{Backing, DmaBufExporter, GemDevice, GemError, ReclaimState, SgTable};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use drm_memory_addresses::{PhysicalAddress, VirtualAddress};
use drm_sync::{MutexGuard, RawSpin, SpinMutex};
use log::{debug, warn};

/// Mutable part of a buffer object, guarded by its lock.
#[derive(Debug, Default)]
pub(crate) struct ShmemState {
    pub(crate) pages_use_count: u32,
    pub(crate) vmap_use_count: u32,
    /// Explicit pins; each also holds one pages reference.
    pub(crate) pin_count: u32,
    pub(crate) reclaim: ReclaimState,
    /// One 4 KiB CPU page per slot while resident.
    pub(crate) pages: Vec<PhysicalAddress>,
    pub(crate) sgt: Option<SgTable>,
    /// The handed-out scatter-gather table holds a pages reference.
    pub(crate) sgt_held: bool,
    pub(crate) vaddr: Option<VirtualAddress>,
    pub(crate) mmap_offset: Option<u64>,
}

/// A GPU buffer object.
///
/// Shared as `Arc<ShmemObject>`; guards and user mappings keep the object
/// alive. All mutable state sits behind one per-object lock, see
/// [`lock`](Self::lock).
pub struct ShmemObject {
    size: u64,
    backing: Backing,
    dev: GemDevice,
    state: SpinMutex<ShmemState>,
}

impl ShmemObject {
    /// Create a natively backed buffer of at least `size` bytes.
    ///
    /// No pages are allocated until the first reference is taken.
    ///
    /// # Errors
    /// [`GemError::InvalidSize`] for a zero size or one that overflows when
    /// rounded up to the granule.
    pub fn create(dev: &GemDevice, size: u64) -> Result<Arc<Self>, GemError> {
        let size = Self::rounded_size(dev, size)?;
        debug!("created {size:#x} byte buffer");
        Ok(Arc::new(Self::new(dev, size, Backing::Native, None)))
    }

    /// Wrap a buffer exported by another driver.
    ///
    /// The exporter's scatter-gather table becomes the backing; the object
    /// never allocates or frees pages of its own.
    ///
    /// # Errors
    /// [`GemError::InvalidSize`] if the exporter reports an unusable size.
    pub fn import(
        dev: &GemDevice,
        exporter: Arc<dyn DmaBufExporter>,
    ) -> Result<Arc<Self>, GemError> {
        let size = Self::rounded_size(dev, exporter.size())?;
        let sgt = exporter.sg_table();
        debug!("imported {size:#x} byte buffer in {} extent(s)", sgt.len());
        Ok(Arc::new(Self::new(dev, size, Backing::Imported(exporter), Some(sgt))))
    }

    fn rounded_size(dev: &GemDevice, size: u64) -> Result<u64, GemError> {
        if size == 0 {
            return Err(GemError::InvalidSize(0));
        }
        dev.config().granule.round_up(size).ok_or(GemError::InvalidSize(size))
    }

    fn new(dev: &GemDevice, size: u64, backing: Backing, sgt: Option<SgTable>) -> Self {
        let state = ShmemState {
            sgt,
            mmap_offset: Some(dev.alloc_mmap_offset(size)),
            ..ShmemState::default()
        };
        Self {
            size,
            backing,
            dev: dev.clone(),
            state: SpinMutex::new(state),
        }
    }

    /// Size in bytes, a multiple of the device granule.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub const fn backing(&self) -> &Backing {
        &self.backing
    }

    #[must_use]
    pub const fn is_imported(&self) -> bool {
        !self.backing.is_native()
    }

    #[must_use]
    pub const fn device(&self) -> &GemDevice {
        &self.dev
    }

    /// Take the object lock.
    ///
    /// Must not be called while the caller already holds it.
    pub fn lock(&self) -> ShmemLocked<'_> {
        ShmemLocked {
            obj: self,
            state: self.state.lock(),
        }
    }

    /// Take the object lock if nobody holds it.
    ///
    /// Reclaim paths use this to skip busy objects instead of waiting.
    pub fn try_lock(&self) -> Option<ShmemLocked<'_>> {
        self.state.try_lock().map(|state| ShmemLocked { obj: self, state })
    }

    /// Fake file offset user space maps the buffer through; `None` once
    /// purged.
    #[must_use]
    pub fn mmap_offset(&self) -> Option<u64> {
        self.lock().state.mmap_offset
    }
}

impl fmt::Debug for ShmemObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShmemObject")
            .field("size", &self.size)
            .field("backing", &self.backing)
            .finish_non_exhaustive()
    }
}

impl Drop for ShmemObject {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.vmap_use_count > 0 {
            warn!("dropping buffer with {} live kernel mapping(s)", state.vmap_use_count);
            if let Some(vaddr) = state.vaddr.take() {
                match &self.backing {
                    Backing::Native => self.dev.mapper().vunmap(vaddr, state.pages.len()),
                    Backing::Imported(exporter) => exporter.vunmap(vaddr),
                }
            }
            state.vmap_use_count = 0;
        }
        if !self.backing.is_native() {
            return;
        }

        let expected = u32::from(state.sgt_held);
        if state.pages_use_count > expected {
            warn!(
                "dropping buffer with {} unbalanced page reference(s)",
                state.pages_use_count - expected
            );
        }
        if state.pages_use_count > 0 {
            state.pages_use_count = 0;
            release_pages(&self.dev, state);
        }
    }
}

/// A buffer object with its lock held.
///
/// Dropping the guard releases the lock.
pub struct ShmemLocked<'a> {
    pub(crate) obj: &'a ShmemObject,
    pub(crate) state: MutexGuard<'a, ShmemState, RawSpin>,
}

impl<'a> ShmemLocked<'a> {
    #[must_use]
    pub const fn object(&self) -> &'a ShmemObject {
        self.obj
    }

    #[must_use]
    pub fn pages_use_count(&self) -> u32 {
        self.state.pages_use_count
    }

    #[must_use]
    pub fn vmap_use_count(&self) -> u32 {
        self.state.vmap_use_count
    }

    #[must_use]
    pub fn pin_count(&self) -> u32 {
        self.state.pin_count
    }

    #[must_use]
    pub fn reclaim_state(&self) -> ReclaimState {
        self.state.reclaim
    }

    /// The current backing descriptor, if resident or imported.
    #[must_use]
    pub fn sg_table(&self) -> Option<&SgTable> {
        self.state.sgt.as_ref()
    }

    /// Kernel address of the buffer while it is vmapped.
    #[must_use]
    pub fn vaddr(&self) -> Option<VirtualAddress> {
        self.state.vaddr
    }

    /// Physical page backing byte `offset`, as a fault would resolve it.
    ///
    /// # Errors
    /// [`GemError::AccessViolation`] if `offset` is out of bounds, the pages
    /// are not resident or the content was purged.
    pub fn page_at(&self, offset: u64) -> Result<PhysicalAddress, GemError> {
        let violation = GemError::AccessViolation { offset };
        if offset >= self.obj.size || self.state.reclaim == ReclaimState::Purged {
            return Err(violation);
        }
        let slot = usize::try_from(offset / drm_memory_addresses::CPU_PAGE_SIZE)
            .map_err(|_| violation)?;
        self.state.pages.get(slot).copied().ok_or(violation)
    }

    pub(crate) fn expect_native(&self, op: &str) {
        if !self.obj.backing.is_native() {
            contract_violation!("{op} on an imported buffer");
        }
    }
}

impl fmt::Debug for ShmemLocked<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShmemLocked")
            .field("object", self.obj)
            .field("state", &*self.state)
            .finish()
    }
}
