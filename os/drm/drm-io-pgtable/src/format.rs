//! Format registry and the page-table handle.

use crate::gather::IotlbGather;
use crate::{
    Cookie, IommuProt, MapError, PgtableConfig, PgtableConfigError, PgtableParams, PgtableQuirks,
    lpae,
};
use alloc::boxed::Box;
use alloc::vec::Vec;
use bitfield_struct::bitfield;
use drm_memory_addresses::{Granule, IoVirtualAddress, PhysicalAddress};
use log::debug;

/// Table formats known to the engine.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum PgtableFormat {
    /// ARM LPAE stage-1 translation.
    ArmLpaeS1,
    /// Apple GPU unified address translation.
    AppleUat,
}

/// Optional capabilities a format declares.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct FormatCaps {
    /// Tables may come from a caller-supplied [`TableAllocator`](crate::TableAllocator).
    pub custom_allocator: bool,
    #[bits(7)]
    __: u8,
}

/// Builds the format's operations; called after the registry validated `cfg`.
pub type AllocFn = fn(
    &FormatDescriptor,
    &PgtableConfig,
    Cookie,
) -> Result<Box<dyn IoPgtableOps>, PgtableConfigError>;

/// Releases every table; called once when the [`IoPgtable`] goes away.
pub type FreeFn = fn(&mut dyn IoPgtableOps);

/// Limits and constructors of one table format.
#[derive(Debug, Clone)]
pub struct FormatDescriptor {
    pub format: PgtableFormat,
    pub caps: FormatCaps,
    pub max_ias: u32,
    pub max_oas: u32,
    pub supported_quirks: PgtableQuirks,
    /// Supported granules, smallest first.
    pub granules: &'static [Granule],
    pub alloc: AllocFn,
    pub free: FreeFn,
}

impl FormatDescriptor {
    /// The smallest supported granule that `pgsize_bitmap` asks for.
    #[must_use]
    pub fn select_granule(&self, pgsize_bitmap: u64) -> Option<Granule> {
        self.granules
            .iter()
            .copied()
            .find(|g| pgsize_bitmap & g.size() != 0)
    }

    /// Check `cfg` against the format's declared limits.
    ///
    /// # Errors
    /// The first violated limit, in the order: address widths, quirks,
    /// allocator source, granule.
    pub fn validate(&self, cfg: &PgtableConfig) -> Result<Granule, PgtableConfigError> {
        let p = &cfg.params;
        if p.ias > self.max_ias {
            return Err(PgtableConfigError::InputAddressTooWide {
                requested: p.ias,
                max: self.max_ias,
            });
        }
        if p.oas > self.max_oas {
            return Err(PgtableConfigError::OutputAddressTooWide {
                requested: p.oas,
                max: self.max_oas,
            });
        }
        if !p.quirks.is_subset_of(self.supported_quirks) {
            return Err(PgtableConfigError::UnsupportedQuirks {
                requested: p.quirks.into(),
                supported: self.supported_quirks.into(),
            });
        }
        if cfg.allocator.is_some() && !self.caps.custom_allocator() {
            return Err(PgtableConfigError::CustomAllocatorUnsupported);
        }
        if cfg.allocator.is_none() && cfg.dma.is_none() {
            return Err(PgtableConfigError::NoAllocator);
        }
        self.select_granule(p.pgsize_bitmap)
            .ok_or(PgtableConfigError::NoSupportedGranule(p.pgsize_bitmap))
    }
}

/// Operations every table format provides.
///
/// Obtained through [`PgtableRegistry::alloc`] and used via [`IoPgtable`].
pub trait IoPgtableOps: Send + Sync {
    /// Effective parameters; `pgsize_bitmap` is narrowed to what the table
    /// can map.
    fn params(&self) -> &PgtableParams;

    /// Physical base of the root table, for the translation base register.
    fn ttbr(&self) -> PhysicalAddress;

    /// Install `pgcount` consecutive `pgsize` mappings.
    ///
    /// # Errors
    /// See [`IoPgtable::map_pages`].
    fn map_pages(
        &mut self,
        iova: IoVirtualAddress,
        paddr: PhysicalAddress,
        pgsize: u64,
        pgcount: u64,
        prot: IommuProt,
    ) -> Result<u64, MapError>;

    /// Clear up to `pgcount` consecutive `pgsize` mappings; returns the bytes
    /// cleared.
    fn unmap_pages(&mut self, iova: IoVirtualAddress, pgsize: u64, pgcount: u64) -> u64;

    fn iova_to_phys(&self, iova: IoVirtualAddress) -> Option<PhysicalAddress>;

    /// Ranges cleared since the last [`iotlb_sync`](Self::iotlb_sync).
    fn pending_invalidations(&self) -> &IotlbGather;

    fn iotlb_sync(&mut self);

    /// Number of translation tables currently allocated, root included.
    fn table_count(&self) -> usize;

    /// Flush pending invalidations and return every table to its allocator.
    /// Idempotent.
    fn release(&mut self);
}

/// The format descriptors of one page-table subsystem instance.
#[derive(Debug, Clone, Default)]
pub struct PgtableRegistry {
    formats: Vec<FormatDescriptor>,
}

impl PgtableRegistry {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            formats: Vec::new(),
        }
    }

    /// A registry with the LPAE stage-1 and UAT formats.
    #[must_use]
    pub fn with_default_formats() -> Self {
        let mut registry = Self::new();
        registry.register(lpae::arm_lpae_s1_descriptor());
        registry.register(lpae::apple_uat_descriptor());
        registry
    }

    /// Add a format, replacing and returning an earlier descriptor for it.
    pub fn register(&mut self, desc: FormatDescriptor) -> Option<FormatDescriptor> {
        debug!("registering page-table format {:?}", desc.format);
        match self.formats.iter_mut().find(|d| d.format == desc.format) {
            Some(existing) => Some(core::mem::replace(existing, desc)),
            None => {
                self.formats.push(desc);
                None
            }
        }
    }

    #[must_use]
    pub fn descriptor(&self, format: PgtableFormat) -> Option<&FormatDescriptor> {
        self.formats.iter().find(|d| d.format == format)
    }

    /// Validate `cfg` and allocate an empty page table of `format`.
    ///
    /// # Errors
    /// [`PgtableConfigError`] for a rejected configuration, or
    /// [`PgtableConfigError::OutOfMemory`] if the root table could not be
    /// allocated. Nothing is left allocated on failure.
    pub fn alloc(
        &self,
        format: PgtableFormat,
        cfg: &PgtableConfig,
        cookie: Cookie,
    ) -> Result<IoPgtable, PgtableConfigError> {
        let desc = self
            .descriptor(format)
            .ok_or(PgtableConfigError::UnknownFormat(format))?;
        desc.validate(cfg)?;
        let ops = (desc.alloc)(desc, cfg, cookie)?;
        debug!(
            "allocated {format:?} page table, root {}, page sizes {:#x}",
            ops.ttbr(),
            ops.params().pgsize_bitmap
        );
        Ok(IoPgtable {
            format,
            ops,
            free: desc.free,
        })
    }
}

/// An allocated page table.
///
/// Dropping it (or calling [`free`](Self::free)) flushes pending
/// invalidations and releases every table. The caller must already have made
/// the table unreachable to the hardware.
pub struct IoPgtable {
    format: PgtableFormat,
    ops: Box<dyn IoPgtableOps>,
    free: FreeFn,
}

impl IoPgtable {
    #[must_use]
    pub const fn format(&self) -> PgtableFormat {
        self.format
    }

    #[must_use]
    pub fn params(&self) -> &PgtableParams {
        self.ops.params()
    }

    #[must_use]
    pub fn ttbr(&self) -> PhysicalAddress {
        self.ops.ttbr()
    }

    /// Install `pgcount` consecutive mappings of `pgsize` bytes from `iova`
    /// to `paddr`. Both are truncated to the granule. Existing mappings are
    /// never overwritten.
    ///
    /// A `pgcount` of zero, or `prot` without read and write access, maps
    /// nothing and succeeds.
    ///
    /// # Errors
    /// - [`IoPgtableError::InvalidArgument`](crate::IoPgtableError::InvalidArgument)
    ///   if `pgsize` is not in the page-size bitmap, an address is not
    ///   `pgsize` aligned, or the range exceeds the address widths.
    /// - [`IoPgtableError::AlreadyMapped`](crate::IoPgtableError::AlreadyMapped)
    ///   if any part of the range is mapped.
    /// - [`IoPgtableError::OutOfMemory`](crate::IoPgtableError::OutOfMemory)
    ///   if an intermediate table could not be allocated.
    ///
    /// [`MapError::mapped`] tells how much was installed before the failure.
    pub fn map_pages(
        &mut self,
        iova: IoVirtualAddress,
        paddr: PhysicalAddress,
        pgsize: u64,
        pgcount: u64,
        prot: IommuProt,
    ) -> Result<u64, MapError> {
        self.ops.map_pages(iova, paddr, pgsize, pgcount, prot)
    }

    /// Clear `pgcount` consecutive `pgsize` mappings starting at `iova`.
    ///
    /// Returns the bytes cleared. Missing entries and entries of a different
    /// size contribute nothing. Cleared ranges are invalidated on the next
    /// [`iotlb_sync`](Self::iotlb_sync).
    pub fn unmap_pages(&mut self, iova: IoVirtualAddress, pgsize: u64, pgcount: u64) -> u64 {
        self.ops.unmap_pages(iova, pgsize, pgcount)
    }

    #[must_use]
    pub fn iova_to_phys(&self, iova: IoVirtualAddress) -> Option<PhysicalAddress> {
        self.ops.iova_to_phys(iova)
    }

    #[must_use]
    pub fn pending_invalidations(&self) -> &IotlbGather {
        self.ops.pending_invalidations()
    }

    /// Push pending invalidations to the configured [`FlushOps`](crate::FlushOps).
    pub fn iotlb_sync(&mut self) {
        self.ops.iotlb_sync();
    }

    #[must_use]
    pub fn table_count(&self) -> usize {
        self.ops.table_count()
    }

    /// Tear the table down.
    pub fn free(self) {}
}

impl Drop for IoPgtable {
    fn drop(&mut self) {
        (self.free)(self.ops.as_mut());
    }
}

impl core::fmt::Debug for IoPgtable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IoPgtable")
            .field("format", &self.format)
            .field("ttbr", &self.ttbr())
            .field("params", self.params())
            .finish_non_exhaustive()
    }
}
