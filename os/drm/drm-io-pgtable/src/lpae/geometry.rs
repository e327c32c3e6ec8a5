use crate::config::{SZ_1G, SZ_2M, SZ_4K, SZ_16K, SZ_32M};
use drm_memory_addresses::Granule;

/// Deepest level of any LPAE walk; levels count down from the root.
pub const MAX_LEVELS: u32 = 4;
/// The last (page) level.
pub const LAST_LEVEL: u32 = MAX_LEVELS - 1;

const PTE_SHIFT: u32 = 3;

/// Shape of a walk for one granule and input address width.
///
/// ```text
/// 16K granule, ias 48: bits_per_level 11, 4 levels, pgd_bits 1
///
/// | 47 | 46‒36 | 35‒25 | 24‒14 | 13‒0   |
/// | L0 |  L1   |  L2   |  L3   | offset |
/// ```
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct LpaeGeometry {
    granule: Granule,
    bits_per_level: u32,
    start_level: u32,
    pgd_bits: u32,
}

impl LpaeGeometry {
    /// Returns `None` if `ias` leaves no bits to translate or needs more
    /// than four levels.
    #[must_use]
    pub const fn new(granule: Granule, ias: u32) -> Option<Self> {
        let pg_shift = granule.shift();
        if ias <= pg_shift {
            return None;
        }
        let bits_per_level = pg_shift - PTE_SHIFT;
        let va_bits = ias - pg_shift;
        let levels = va_bits.div_ceil(bits_per_level);
        if levels > MAX_LEVELS {
            return None;
        }
        Some(Self {
            granule,
            bits_per_level,
            start_level: MAX_LEVELS - levels,
            pgd_bits: va_bits - bits_per_level * (levels - 1),
        })
    }

    #[inline]
    #[must_use]
    pub const fn granule(&self) -> Granule {
        self.granule
    }

    #[inline]
    #[must_use]
    pub const fn start_level(&self) -> u32 {
        self.start_level
    }

    #[inline]
    #[must_use]
    pub const fn pgd_bits(&self) -> u32 {
        self.pgd_bits
    }

    /// Bit position of the lowest IOVA bit that indexes `level`.
    #[inline]
    #[must_use]
    pub const fn lvl_shift(&self, level: u32) -> u32 {
        (MAX_LEVELS - level) * self.bits_per_level + PTE_SHIFT
    }

    /// Bytes covered by one entry at `level`.
    #[inline]
    #[must_use]
    pub const fn block_size(&self, level: u32) -> u64 {
        1 << self.lvl_shift(level)
    }

    /// Number of indexable entries in a table at `level`.
    #[inline]
    #[must_use]
    pub const fn entries(&self, level: u32) -> usize {
        if level == self.start_level {
            1 << self.pgd_bits
        } else {
            1 << self.bits_per_level
        }
    }

    /// Index of `iova` within the table at `level`.
    #[inline]
    #[must_use]
    pub const fn index(&self, iova: u64, level: u32) -> usize {
        ((iova >> self.lvl_shift(level)) as usize) & (self.entries(level) - 1)
    }

    /// Descriptors in one granule-sized table.
    #[inline]
    #[must_use]
    pub const fn ptes_per_table(&self) -> usize {
        (self.granule.size() >> PTE_SHIFT) as usize
    }

    /// Bytes in a table. The root is padded to a full granule, so every
    /// table has the same size.
    #[inline]
    #[must_use]
    pub const fn table_size(&self) -> u64 {
        let pgd = 1u64 << (self.pgd_bits + PTE_SHIFT);
        if pgd > self.granule.size() { pgd } else { self.granule.size() }
    }

    /// The level at which an entry covers exactly `pgsize` bytes.
    #[must_use]
    pub const fn level_for(&self, pgsize: u64) -> Option<u32> {
        let mut level = self.start_level;
        while level <= LAST_LEVEL {
            if self.block_size(level) == pgsize {
                return Some(level);
            }
            level += 1;
        }
        None
    }

    /// Page and block sizes this geometry can map as a single leaf.
    ///
    /// 4K granule: 4K, 2M and 1G. 16K granule: 16K and 32M. Sizes whose
    /// level lies above the root are dropped.
    #[must_use]
    pub const fn supported_pgsizes(&self) -> u64 {
        let candidates = match self.granule {
            Granule::Size4K => SZ_4K | SZ_2M | SZ_1G,
            Granule::Size16K => SZ_16K | SZ_32M,
        };
        let mut bitmap = 0;
        let mut level = self.start_level;
        while level <= LAST_LEVEL {
            bitmap |= self.block_size(level) & candidates;
            level += 1;
        }
        bitmap
    }
}
