use crate::{CPU_PAGE_SIZE, checked_align_up};
use core::fmt;

/// Translation granule selected at runtime.
///
/// The granule is both the smallest block a device page table resolves and
/// the unit in which buffer objects allocate their backing. It is fixed when
/// a page table or buffer manager is configured and never changes afterward.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub enum Granule {
    /// 4 KiB translation granule.
    Size4K,
    /// 16 KiB translation granule.
    #[default]
    Size16K,
}

impl Granule {
    /// Granule size in bytes.
    #[inline]
    #[must_use]
    pub const fn size(self) -> u64 {
        1 << self.shift()
    }

    /// log2 of the granule size.
    #[inline]
    #[must_use]
    pub const fn shift(self) -> u32 {
        match self {
            Self::Size4K => 12,
            Self::Size16K => 14,
        }
    }

    /// Number of 4 KiB CPU pages covered by one granule.
    #[inline]
    #[must_use]
    pub const fn cpu_pages(self) -> usize {
        (self.size() / CPU_PAGE_SIZE) as usize
    }

    /// Map a byte size to the granule of exactly that size.
    #[must_use]
    pub const fn from_size(size: u64) -> Option<Self> {
        match size {
            0x1000 => Some(Self::Size4K),
            0x4000 => Some(Self::Size16K),
            _ => None,
        }
    }

    /// Round `size` up to a whole number of granules.
    #[inline]
    #[must_use]
    pub const fn round_up(self, size: u64) -> Option<u64> {
        checked_align_up(size, self.size())
    }
}

impl fmt::Debug for Granule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Size4K => f.write_str("Granule(4K)"),
            Self::Size16K => f.write_str("Granule(16K)"),
        }
    }
}
