use crate::SgTable;
use alloc::sync::Arc;
use core::fmt;
use drm_memory_addresses::VirtualAddress;

/// Failure reported by a dma-buf exporter.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[error("dma-buf exporter failed: {reason}")]
pub struct ExportError {
    pub reason: &'static str,
}

/// The driver that owns the memory of an imported buffer.
pub trait DmaBufExporter: Send + Sync {
    /// Size of the exported buffer in bytes.
    fn size(&self) -> u64;

    /// Physical extents of the buffer. Must stay valid as long as the
    /// exporter is alive.
    fn sg_table(&self) -> SgTable;

    /// Map the whole buffer into the kernel.
    ///
    /// # Errors
    /// Whatever prevented the mapping.
    fn vmap(&self) -> Result<VirtualAddress, ExportError>;

    fn vunmap(&self, vaddr: VirtualAddress);

    /// Set up a user mapping of `len` bytes at `start`.
    ///
    /// # Errors
    /// Whatever prevented the mapping.
    fn mmap(&self, start: VirtualAddress, len: u64) -> Result<(), ExportError>;
}

/// Where a buffer's memory comes from.
#[derive(Clone)]
pub enum Backing {
    /// Pages allocated and freed by the buffer object itself.
    Native,
    /// Memory owned by another driver.
    Imported(Arc<dyn DmaBufExporter>),
}

impl Backing {
    #[must_use]
    pub const fn is_native(&self) -> bool {
        matches!(self, Self::Native)
    }

    #[must_use]
    pub fn exporter(&self) -> Option<&dyn DmaBufExporter> {
        match self {
            Self::Native => None,
            Self::Imported(exporter) => Some(exporter.as_ref()),
        }
    }
}

impl fmt::Debug for Backing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Native => f.write_str("Native"),
            Self::Imported(exporter) => f
                .debug_struct("Imported")
                .field("size", &exporter.size())
                .finish_non_exhaustive(),
        }
    }
}
