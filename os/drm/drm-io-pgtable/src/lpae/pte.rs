//! LPAE descriptor layout.

use crate::{IommuProt, PgtableFormat, PgtableQuirks};
use bitfield_struct::bitfield;
use drm_memory_addresses::PhysicalAddress;

/// Attribute index into MAIR: normal non-cacheable.
pub const MAIR_IDX_NC: u8 = 0;
/// Attribute index into MAIR: normal write-back cacheable.
pub const MAIR_IDX_CACHE: u8 = 1;
/// Attribute index into MAIR: device nGnRE.
pub const MAIR_IDX_DEV: u8 = 2;

/// GPU memory attribute: private to the GPU.
pub const UAT_MEMATTR_PRIV: u8 = 0;
/// GPU memory attribute: device memory.
pub const UAT_MEMATTR_DEV: u8 = 1;
/// GPU memory attribute: shared and coherent with the CPU.
pub const UAT_MEMATTR_SHARED: u8 = 2;

/// Shareability: outer shareable.
pub const SH_OS: u8 = 0b10;
/// Shareability: inner shareable.
pub const SH_IS: u8 = 0b11;

/// One 64-bit LPAE descriptor.
///
/// | Bits  | Field            | Meaning |
/// |-------|------------------|---------|
/// | 0     | `valid`          | Entry is in use |
/// | 1     | `table_or_page`  | Table pointer (levels 0-2) or page (level 3); clear for a block |
/// | 2-4   | `attr_index`     | MAIR index, or UAT memory attribute |
/// | 5     | `ns`             | Non-secure |
/// | 6     | `ap_unpriv`      | AP\[1\]: unprivileged access (UAT: AP0) |
/// | 7     | `ap_rdonly`      | AP\[2\]: read-only (UAT: AP1) |
/// | 8-9   | `sh`             | Shareability |
/// | 10    | `af`             | Access flag |
/// | 11    | `ng`             | Not global |
/// | 12-47 | address          | Output address bits `[47:12]` |
/// | 52    | `contiguous`     | Contiguous hint |
/// | 53    | `pxn`            | Privileged execute never |
/// | 54    | `uxn`            | (Unprivileged) execute never |
/// | 55    | `gpu_access`     | UAT: GPU contexts may use the mapping |
///
/// Bits 0-1 together give the descriptor type: `0b01` block, `0b11` table
/// above the last level and page at the last level.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct LpaePte {
    pub valid: bool,
    pub table_or_page: bool,
    #[bits(3)]
    pub attr_index: u8,
    pub ns: bool,
    pub ap_unpriv: bool,
    pub ap_rdonly: bool,
    #[bits(2)]
    pub sh: u8,
    pub af: bool,
    pub ng: bool,
    #[bits(36)]
    addr_47_12: u64,
    #[bits(4)]
    __: u8,
    pub contiguous: bool,
    pub pxn: bool,
    pub uxn: bool,
    pub gpu_access: bool,
    #[bits(8)]
    __: u8,
}

/// Decoded meaning of a valid descriptor.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PteKind {
    /// Points to the next-level table at this address.
    Table(PhysicalAddress),
    /// Maps a block or page starting at this address.
    Leaf(PhysicalAddress),
}

impl LpaePte {
    #[inline]
    #[must_use]
    pub const fn output_address(self) -> PhysicalAddress {
        PhysicalAddress::new(self.addr_47_12() << 12)
    }

    #[inline]
    #[must_use]
    pub const fn with_output_address(self, pa: PhysicalAddress) -> Self {
        self.with_addr_47_12(pa.as_u64() >> 12)
    }

    /// Decode the entry as seen at `level` of a table whose last level is
    /// `last_level`, or `None` if the entry is not valid.
    ///
    /// Last-level entries with the type bit clear are reserved and decode as
    /// `None` too.
    #[must_use]
    pub const fn kind(self, level: u32, last_level: u32) -> Option<PteKind> {
        if !self.valid() {
            return None;
        }
        let pa = self.output_address();
        match (level == last_level, self.table_or_page()) {
            (true, true) | (false, false) => Some(PteKind::Leaf(pa)),
            (false, true) => Some(PteKind::Table(pa)),
            (true, false) => None,
        }
    }

    /// A pointer to the next-level table at `table`.
    #[must_use]
    pub const fn make_table(table: PhysicalAddress, quirks: PgtableQuirks) -> Self {
        Self::new()
            .with_valid(true)
            .with_table_or_page(true)
            .with_ns(quirks.arm_ns())
            .with_output_address(table)
    }

    /// A block or page mapping `pa` with previously encoded attributes.
    #[must_use]
    pub const fn make_leaf(pa: PhysicalAddress, attrs: Self, is_last_level: bool) -> Self {
        attrs
            .with_valid(true)
            .with_table_or_page(is_last_level)
            .with_output_address(pa)
    }

    /// Encode protection flags as leaf attributes for `format`.
    #[must_use]
    pub const fn leaf_attrs(
        format: PgtableFormat,
        prot: IommuProt,
        quirks: PgtableQuirks,
        coherent: bool,
    ) -> Self {
        match format {
            PgtableFormat::ArmLpaeS1 => Self::arm_s1_attrs(prot, quirks, coherent),
            PgtableFormat::AppleUat => Self::apple_uat_attrs(prot),
        }
    }

    const fn arm_s1_attrs(prot: IommuProt, quirks: PgtableQuirks, coherent: bool) -> Self {
        let attr_index = if prot.mmio() {
            MAIR_IDX_DEV
        } else if prot.cache() {
            MAIR_IDX_CACHE
        } else {
            MAIR_IDX_NC
        };
        let sh = if prot.cache() && coherent { SH_IS } else { SH_OS };
        Self::new()
            .with_ng(true)
            .with_af(true)
            .with_ns(quirks.arm_ns())
            .with_ap_unpriv(!prot.privileged())
            .with_ap_rdonly(prot.read() && !prot.write())
            .with_attr_index(attr_index)
            .with_sh(sh)
            .with_pxn(prot.noexec())
            .with_uxn(prot.noexec())
    }

    const fn apple_uat_attrs(prot: IommuProt) -> Self {
        let memattr = if prot.mmio() {
            UAT_MEMATTR_DEV
        } else if prot.cache() {
            UAT_MEMATTR_SHARED
        } else {
            UAT_MEMATTR_PRIV
        };
        Self::new()
            .with_af(true)
            .with_sh(SH_OS)
            .with_attr_index(memattr)
            .with_gpu_access(!prot.privileged())
            .with_ap_unpriv(!prot.privileged())
            .with_ap_rdonly(!prot.write())
            .with_pxn(prot.noexec() || !prot.privileged())
            .with_uxn(prot.noexec())
    }
}
