//! # Physical memory access
//!
//! Code can only dereference virtual addresses. Zero-filling freshly
//! allocated frames and reading or writing device page-table entries both
//! need a way to "see" a physical address from the current address space.
//! [`PhysMapper`] abstracts over how that is done.
//!
//! - [`HhdmPhysMapper`]: every physical address is visible at `offset + pa`.
//! - [`SimulatedRam`]: physical memory is a heap buffer; for hosted builds
//!   and tests.

use alloc::boxed::Box;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};
use drm_memory_addresses::PhysicalAddress;

/// Converts physical addresses to pointers usable in the current address space.
///
/// Implementations must map physically contiguous ranges to virtually
/// contiguous ranges, so a block handed out by a page source can be accessed
/// as one slice.
pub trait PhysMapper: Send + Sync {
    /// Convert a physical address to a pointer in the current address space.
    ///
    /// # Safety
    /// - `pa` must be covered by this mapper.
    /// - The pointer is only valid while the underlying frame stays allocated.
    unsafe fn phys_to_ptr(&self, pa: PhysicalAddress) -> NonNull<u8>;
}

/// Zero `len` bytes of physical memory starting at `pa`.
///
/// # Safety
/// The range must be mapped by `mapper` and exclusively owned by the caller.
pub unsafe fn zero_phys(mapper: &dyn PhysMapper, pa: PhysicalAddress, len: usize) {
    unsafe {
        let ptr = mapper.phys_to_ptr(pa);
        core::ptr::write_bytes(ptr.as_ptr(), 0, len);
    }
}

/// View `count` values of `T` at physical address `pa` as a shared slice.
///
/// Intended for `T` with interior mutability (atomics), so that entries can be
/// written through a shared view that a hardware walker reads concurrently.
///
/// # Safety
/// - The range must be mapped by `mapper`, suitably aligned for `T`, and stay
///   allocated for `'a`.
/// - The bytes must be a valid `T` (e.g. any bit pattern for `AtomicU64`).
pub unsafe fn phys_slice<'a, T>(
    mapper: &dyn PhysMapper,
    pa: PhysicalAddress,
    count: usize,
) -> &'a [T] {
    unsafe {
        let ptr = mapper.phys_to_ptr(pa).cast::<T>();
        debug_assert!(ptr.as_ptr().is_aligned(), "misaligned physical slice");
        core::slice::from_raw_parts(ptr.as_ptr(), count)
    }
}

/// [`PhysMapper`] for kernels with a higher-half direct map (HHDM).
///
/// # Safety
/// The HHDM must cover every physical address handed to it.
#[derive(Debug, Copy, Clone)]
pub struct HhdmPhysMapper {
    offset: u64,
}

impl HhdmPhysMapper {
    #[must_use]
    pub const fn new(offset: u64) -> Self {
        Self { offset }
    }
}

impl PhysMapper for HhdmPhysMapper {
    unsafe fn phys_to_ptr(&self, pa: PhysicalAddress) -> NonNull<u8> {
        let va = self.offset.wrapping_add(pa.as_u64()) as usize as *mut u8;
        // SAFETY: caller guarantees the address is mapped via the HHDM.
        unsafe { NonNull::new_unchecked(va) }
    }
}

/// Heap-backed physical memory for hosted builds and tests.
///
/// Covers `[base, base + size)`. Storage is a slice of `AtomicU64`, so table
/// entries can be read and written through shared references.
pub struct SimulatedRam {
    base: PhysicalAddress,
    words: Box<[AtomicU64]>,
}

impl SimulatedRam {
    /// Simulate `size` bytes of zeroed RAM at physical address `base`.
    ///
    /// `size` is rounded up to a multiple of eight bytes.
    #[must_use]
    pub fn new(base: PhysicalAddress, size: u64) -> Self {
        let words = size.div_ceil(8) as usize;
        Self {
            base,
            words: (0..words).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    #[must_use]
    pub const fn base(&self) -> PhysicalAddress {
        self.base
    }

    #[must_use]
    pub const fn size(&self) -> u64 {
        self.words.len() as u64 * 8
    }

    /// Returns `true` if `[pa, pa + len)` lies inside the simulated range.
    #[must_use]
    pub fn contains(&self, pa: PhysicalAddress, len: u64) -> bool {
        let Some(start) = pa.offset_from(self.base) else {
            return false;
        };
        start.checked_add(len).is_some_and(|end| end <= self.size())
    }

    fn word(&self, pa: PhysicalAddress) -> &AtomicU64 {
        assert!(self.contains(pa, 8), "{pa:?} outside simulated RAM");
        let off = (pa.as_u64() - self.base.as_u64()) as usize;
        assert_eq!(off % 8, 0, "unaligned word access at {pa:?}");
        &self.words[off / 8]
    }

    /// Read the 64-bit word at `pa` (must be 8-byte aligned).
    #[must_use]
    pub fn read_u64(&self, pa: PhysicalAddress) -> u64 {
        self.word(pa).load(Ordering::Acquire)
    }

    /// Write the 64-bit word at `pa` (must be 8-byte aligned).
    pub fn write_u64(&self, pa: PhysicalAddress, value: u64) {
        self.word(pa).store(value, Ordering::Release);
    }
}

impl PhysMapper for SimulatedRam {
    unsafe fn phys_to_ptr(&self, pa: PhysicalAddress) -> NonNull<u8> {
        debug_assert!(self.contains(pa, 1), "{pa:?} outside simulated RAM");
        let off = (pa.as_u64() - self.base.as_u64()) as usize;
        let start = NonNull::from(&*self.words).cast::<u8>();
        // SAFETY: caller guarantees `pa` is inside the simulated range.
        unsafe { start.add(off) }
    }
}

impl core::fmt::Debug for SimulatedRam {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SimulatedRam")
            .field("base", &self.base)
            .field("size", &self.size())
            .finish()
    }
}
