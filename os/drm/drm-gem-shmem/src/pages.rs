//! Page residency, explicit pins and the exported scatter-gather table.

use crate::object::ShmemState;
use crate::{GemDevice, GemError, ReclaimState, SgTable, ShmemLocked, ShmemObject};
use alloc::sync::Arc;
use alloc::vec::Vec;
use drm_memory_addresses::{CPU_PAGE_SIZE, PhysicalAddress};
use drm_page_alloc::{BlockRequest, ReleaseHints};
use log::{debug, trace};

/// Return every resident block to the page source and forget the pages.
///
/// The caller has already dropped the use count to zero.
pub(crate) fn release_pages(dev: &GemDevice, state: &mut ShmemState) {
    let config = dev.config();
    let hints = ReleaseHints::default()
        .with_dirty(config.mark_dirty_on_put)
        .with_accessed(config.mark_accessed_on_put);
    if let Some(sgt) = state.sgt.take() {
        for entry in &sgt {
            dev.source().free_block(entry.phys, entry.len, hints);
        }
        debug!("released {} block(s) of {:#x} bytes", sgt.len(), sgt.total_len());
    }
    state.pages = Vec::new();
    state.sgt_held = false;
}

/// Give back blocks that never became part of the object.
fn discard_blocks(dev: &GemDevice, blocks: &[PhysicalAddress], len: u64) {
    for &block in blocks {
        dev.source().free_block(block, len, ReleaseHints::default());
    }
}

impl ShmemLocked<'_> {
    /// Take a reference on the backing pages, allocating them with the first
    /// reference.
    ///
    /// Each granule is one zero-filled, granule-aligned block. If the page
    /// source runs dry the object lock is dropped while waiting for memory
    /// and the state is re-checked afterward.
    ///
    /// # Errors
    /// - [`GemError::Purged`] once the content has been purged.
    /// - [`GemError::OutOfMemory`] if the backing cannot be allocated; no
    ///   block stays allocated and the use count is unchanged.
    ///
    /// # Panics
    /// On an imported buffer (contract violation).
    pub fn get_pages(&mut self) -> Result<(), GemError> {
        self.expect_native("get_pages");
        if self.state.reclaim == ReclaimState::Purged {
            return Err(GemError::Purged);
        }
        if self.state.pages_use_count > 0 {
            self.state.pages_use_count += 1;
            return Ok(());
        }
        self.populate()
    }

    fn populate(&mut self) -> Result<(), GemError> {
        let obj = self.obj;
        let dev = obj.device();
        let granule = dev.config().granule.size();
        let count = usize::try_from(obj.size() / granule).map_err(|_| GemError::OutOfMemory)?;
        let req = BlockRequest::zeroed(granule).with_align(granule);

        let mut blocks = Vec::new();
        blocks.try_reserve_exact(count).map_err(|_| GemError::OutOfMemory)?;
        while blocks.len() < count {
            if let Some(block) = dev.source().alloc_block(req) {
                blocks.push(block);
                continue;
            }

            trace!(
                "waiting for {granule:#x} bytes with {} of {count} block(s) in hand",
                blocks.len()
            );
            let available = self.state.unlocked(|| dev.source().wait_for_memory(req));

            // another holder of the lock may have moved the object on
            if self.state.reclaim == ReclaimState::Purged {
                discard_blocks(dev, &blocks, granule);
                return Err(GemError::Purged);
            }
            if self.state.pages_use_count > 0 {
                discard_blocks(dev, &blocks, granule);
                self.state.pages_use_count += 1;
                return Ok(());
            }
            if !available {
                debug!("out of memory populating {:#x} byte buffer", obj.size());
                discard_blocks(dev, &blocks, granule);
                return Err(GemError::OutOfMemory);
            }
        }

        let cpu_pages = granule / CPU_PAGE_SIZE;
        let mut pages = Vec::new();
        if pages.try_reserve_exact(blocks.len() * dev.config().granule.cpu_pages()).is_err() {
            discard_blocks(dev, &blocks, granule);
            return Err(GemError::OutOfMemory);
        }
        pages.extend(
            blocks
                .iter()
                .flat_map(|&block| (0..cpu_pages).map(move |i| block + i * CPU_PAGE_SIZE)),
        );

        debug!("populated {:#x} byte buffer with {count} block(s)", obj.size());
        self.state.pages = pages;
        self.state.sgt = Some(SgTable::from_blocks(blocks, granule));
        self.state.pages_use_count = 1;
        Ok(())
    }

    /// Drop a pages reference; the last one releases the backing.
    ///
    /// A no-op once purged, since purge already reclaimed every reference.
    ///
    /// # Panics
    /// On underflow, on an imported buffer, or when the last reference goes
    /// while the buffer is still kernel-mapped (contract violations).
    pub fn put_pages(&mut self) {
        self.expect_native("put_pages");
        if self.state.reclaim == ReclaimState::Purged {
            trace!("put_pages on purged buffer");
            return;
        }
        let Some(count) = self.state.pages_use_count.checked_sub(1) else {
            contract_violation!("put_pages underflow on {:#x} byte buffer", self.obj.size());
        };
        if count == 0 && self.state.vmap_use_count > 0 {
            contract_violation!("last pages reference dropped while kernel-mapped");
        }
        self.state.pages_use_count = count;
        if count == 0 {
            release_pages(self.obj.device(), &mut self.state);
        }
    }

    /// Scatter-gather table for DMA setup.
    ///
    /// The first call on a native buffer takes a pages reference that the
    /// object keeps until it is purged or destroyed. Imported buffers return
    /// the exporter's table.
    ///
    /// # Errors
    /// Any error of [`get_pages`](Self::get_pages).
    pub fn get_pages_sgt(&mut self) -> Result<SgTable, GemError> {
        if self.obj.backing().is_native() && !self.state.sgt_held {
            self.get_pages()?;
            if self.state.sgt_held {
                // taken by a racing caller while this one waited for memory
                self.put_pages();
            } else {
                self.state.sgt_held = true;
            }
        }
        // a native buffer without a table has been purged
        self.state.sgt.clone().ok_or(GemError::Purged)
    }
}

impl ShmemObject {
    /// Pin the backing pages in memory until the guard goes away.
    ///
    /// # Errors
    /// Any error of [`ShmemLocked::get_pages`].
    ///
    /// # Panics
    /// On an imported buffer (contract violation).
    pub fn pin(self: &Arc<Self>) -> Result<PinGuard, GemError> {
        if self.is_imported() {
            contract_violation!("pin of an imported buffer");
        }
        let mut locked = self.lock();
        locked.get_pages()?;
        locked.state.pin_count += 1;
        drop(locked);
        Ok(PinGuard {
            obj: Arc::clone(self),
        })
    }

    /// Lock and call [`ShmemLocked::get_pages_sgt`].
    ///
    /// # Errors
    /// Any error of [`ShmemLocked::get_pages`].
    pub fn get_pages_sgt(&self) -> Result<SgTable, GemError> {
        self.lock().get_pages_sgt()
    }
}

/// An explicit pin; unpins on drop.
#[derive(Debug)]
#[must_use = "dropping the guard unpins the buffer"]
pub struct PinGuard {
    obj: Arc<ShmemObject>,
}

impl PinGuard {
    #[must_use]
    pub const fn object(&self) -> &Arc<ShmemObject> {
        &self.obj
    }

    pub fn unpin(self) {}
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        let mut locked = self.obj.lock();
        let Some(pins) = locked.state.pin_count.checked_sub(1) else {
            contract_violation!("unpin of a buffer that is not pinned");
        };
        locked.state.pin_count = pins;
        locked.put_pages();
    }
}
