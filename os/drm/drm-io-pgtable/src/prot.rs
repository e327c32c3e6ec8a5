use bitfield_struct::bitfield;

/// Access protection requested for a device mapping.
///
/// | Bit | Flag         | Meaning |
/// |-----|--------------|---------|
/// | 0   | `read`       | Device may read |
/// | 1   | `write`      | Device may write |
/// | 2   | `cache`      | Cacheable, coherent with CPU caches |
/// | 3   | `noexec`     | Never executable by the device |
/// | 4   | `mmio`       | Device memory (strongly ordered) |
/// | 5   | `privileged` | Only privileged device contexts may access |
///
/// A mapping with neither `read` nor `write` maps nothing.
///
/// ```rust
/// # use drm_io_pgtable::IommuProt;
/// let rw = IommuProt::READ_WRITE.with_cache(true);
/// assert_eq!(u8::from(rw), 0b111);
/// assert!(rw.is_accessible());
/// ```
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct IommuProt {
    pub read: bool,
    pub write: bool,
    pub cache: bool,
    pub noexec: bool,
    pub mmio: bool,
    pub privileged: bool,
    #[bits(2)]
    __: u8,
}

impl IommuProt {
    pub const READ: Self = Self::new().with_read(true);
    pub const WRITE: Self = Self::new().with_write(true);
    pub const READ_WRITE: Self = Self::READ.with_write(true);

    /// Returns `true` if the mapping grants any data access at all.
    #[inline]
    #[must_use]
    pub const fn is_accessible(self) -> bool {
        self.read() || self.write()
    }
}
