use crate::{Backing, GemError, ShmemLocked, ShmemObject};
use alloc::sync::Arc;
use drm_memory_addresses::VirtualAddress;
use log::{debug, warn};

impl ShmemLocked<'_> {
    /// Map the whole buffer contiguously into the kernel.
    ///
    /// Further calls return the same address and only count. A native
    /// buffer takes a pages reference for the lifetime of the mapping; an
    /// imported one is mapped by its exporter.
    ///
    /// # Errors
    /// - Any error of [`get_pages`](Self::get_pages).
    /// - [`GemError::OutOfMemory`] if no kernel mapping can be created; the
    ///   pages reference is dropped again.
    /// - [`GemError::Exporter`] if the exporter refuses.
    pub fn vmap(&mut self) -> Result<VirtualAddress, GemError> {
        if let Some(vaddr) = self.state.vaddr {
            self.state.vmap_use_count += 1;
            return Ok(vaddr);
        }

        let obj = self.obj;
        let vaddr = match obj.backing() {
            Backing::Native => {
                self.get_pages()?;
                // waiting for memory drops the lock, and another caller may
                // have mapped the buffer meanwhile
                if let Some(vaddr) = self.state.vaddr {
                    self.put_pages();
                    self.state.vmap_use_count += 1;
                    return Ok(vaddr);
                }
                let dev = obj.device();
                let mapped = dev.mapper().vmap(&self.state.pages, dev.config().cache_mode());
                let Some(vaddr) = mapped else {
                    warn!("no kernel mapping for {:#x} byte buffer", obj.size());
                    self.put_pages();
                    return Err(GemError::OutOfMemory);
                };
                vaddr
            }
            Backing::Imported(exporter) => exporter.vmap()?,
        };

        debug!("vmapped {:#x} byte buffer at {vaddr}", obj.size());
        self.state.vmap_use_count = 1;
        self.state.vaddr = Some(vaddr);
        Ok(vaddr)
    }

    /// Drop a kernel-mapping reference; the last one tears the mapping down.
    ///
    /// # Panics
    /// If the buffer is not mapped (contract violation).
    pub fn vunmap(&mut self) {
        let Some(count) = self.state.vmap_use_count.checked_sub(1) else {
            contract_violation!("vunmap of a buffer that is not kernel-mapped");
        };
        self.state.vmap_use_count = count;
        if count > 0 {
            return;
        }

        let obj = self.obj;
        let vaddr = self.state.vaddr.take();
        match obj.backing() {
            Backing::Native => {
                if let Some(vaddr) = vaddr {
                    obj.device().mapper().vunmap(vaddr, self.state.pages.len());
                }
                self.put_pages();
            }
            Backing::Imported(exporter) => {
                if let Some(vaddr) = vaddr {
                    exporter.vunmap(vaddr);
                }
            }
        }
        debug!("vunmapped {:#x} byte buffer", obj.size());
    }
}

impl ShmemObject {
    /// Map the buffer into the kernel until the guard goes away.
    ///
    /// # Errors
    /// Any error of [`ShmemLocked::vmap`].
    pub fn vmap(self: &Arc<Self>) -> Result<VmapGuard, GemError> {
        let vaddr = self.lock().vmap()?;
        Ok(VmapGuard {
            obj: Arc::clone(self),
            vaddr,
        })
    }
}

/// A kernel mapping of a buffer; unmaps on drop.
#[derive(Debug)]
#[must_use = "dropping the guard unmaps the buffer"]
pub struct VmapGuard {
    obj: Arc<ShmemObject>,
    vaddr: VirtualAddress,
}

impl VmapGuard {
    #[must_use]
    pub const fn vaddr(&self) -> VirtualAddress {
        self.vaddr
    }

    #[must_use]
    pub const fn object(&self) -> &Arc<ShmemObject> {
        &self.obj
    }

    pub fn vunmap(self) {}
}

impl Drop for VmapGuard {
    fn drop(&mut self) {
        self.obj.lock().vunmap();
    }
}
