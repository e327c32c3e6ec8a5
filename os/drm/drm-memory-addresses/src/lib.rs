//! # Address Types for GPU Memory Management
//!
//! Strongly typed wrappers for the three address spaces a GPU memory manager
//! juggles at the same time, plus the page and granule math shared by the
//! buffer-object manager and the device page-table engine.
//!
//! ## Overview
//!
//! | Type | Address space | Produced by |
//! |------|---------------|-------------|
//! | [`PhysicalAddress`] | Host RAM and MMIO | The physical page source |
//! | [`VirtualAddress`] | CPU kernel or user virtual memory | `vmap`, `mmap` |
//! | [`IoVirtualAddress`] | Device (IOMMU / GPU MMU) virtual memory | The IOMMU client |
//!
//! Mixing an IOVA with a CPU virtual address is a type error.
//!
//! ## Page Sizes and Granules
//!
//! Two kinds of "page size" coexist:
//!
//! - **CPU pages** ([`CPU_PAGE_SIZE`]) are the unit of fault resolution and
//!   CPU mapping.
//! - **Granules** ([`Granule`]) are the unit in which buffer backing is
//!   allocated and device page tables resolve one translation step.
//!
//! ```text
//!  one 16 KiB granule
//! ┌──────────┬──────────┬──────────┬──────────┐
//! │ 4K page 0│ 4K page 1│ 4K page 2│ 4K page 3│
//! └──────────┴──────────┴──────────┴──────────┘
//!  ^ one scatter-gather entry, physically contiguous
//! ```
//!
//! ## Typical Usage
//!
//! ```rust
//! # use drm_memory_addresses::*;
//! let pa = PhysicalAddress::new(0x2000_0100);
//! let frame = pa.align_down_to(Granule::Size16K.size());
//! assert_eq!(frame.as_u64(), 0x2000_0000);
//! assert_eq!(pa.offset_from(frame), Some(0x100));
//!
//! assert_eq!(Granule::Size16K.round_up(50_000), Some(65_536));
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

/// Declares an address-space specific newtype over a raw `u64` address.
macro_rules! typed_address {
    ($(#[$doc:meta])* $name:ident, $tag:literal) => {
        $(#[$doc])*
        #[repr(transparent)]
        #[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name(u64);

        impl $name {
            #[inline]
            #[must_use]
            pub const fn new(v: u64) -> Self {
                Self(v)
            }

            #[inline]
            #[must_use]
            pub const fn zero() -> Self {
                Self::new(0)
            }

            #[inline]
            #[must_use]
            pub const fn as_u64(self) -> u64 {
                self.0
            }

            /// Align down to an arbitrary power-of-two boundary.
            #[inline]
            #[must_use]
            pub const fn align_down_to(self, align: u64) -> Self {
                Self($crate::align_down(self.0, align))
            }

            /// Add `rhs` bytes, returning `None` if the address space wraps.
            #[inline]
            #[must_use]
            pub const fn checked_add(self, rhs: u64) -> Option<Self> {
                match self.0.checked_add(rhs) {
                    Some(v) => Some(Self(v)),
                    None => None,
                }
            }

            /// Distance in bytes from `base` up to `self`, if `self >= base`.
            #[inline]
            #[must_use]
            pub const fn offset_from(self, base: Self) -> Option<u64> {
                self.as_u64().checked_sub(base.as_u64())
            }
        }

        impl core::fmt::Debug for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, concat!($tag, "(0x{:016X})"), self.as_u64())
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "0x{:016X}", self.as_u64())
            }
        }

        impl From<u64> for $name {
            #[inline]
            fn from(v: u64) -> Self {
                Self::new(v)
            }
        }

        impl From<$name> for u64 {
            #[inline]
            fn from(a: $name) -> Self {
                a.0
            }
        }

        impl core::ops::Add<u64> for $name {
            type Output = Self;
            #[inline]
            fn add(self, rhs: u64) -> Self::Output {
                Self(self.0 + rhs)
            }
        }

        impl core::ops::AddAssign<u64> for $name {
            #[inline]
            fn add_assign(&mut self, rhs: u64) {
                self.0 += rhs;
            }
        }
    };
}

mod granule;
mod io_virtual_address;
mod physical_address;
mod virtual_address;

pub use granule::Granule;
pub use io_virtual_address::IoVirtualAddress;
pub use physical_address::PhysicalAddress;
pub use virtual_address::VirtualAddress;

/// Size of a CPU page in bytes.
pub const CPU_PAGE_SIZE: u64 = 0x1000;

/// Align `x` down to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two.
///
/// ```rust
/// # use drm_memory_addresses::align_down;
/// assert_eq!(align_down(0x1000_0100, 0x4000), 0x1000_0000);
/// assert_eq!(align_down(0x4000, 0x4000), 0x4000);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a`, or `None` if that overflows.
///
/// `a` must be a non-zero power of two.
///
/// ```rust
/// # use drm_memory_addresses::checked_align_up;
/// assert_eq!(checked_align_up(50_000, 16_384), Some(65_536));
/// assert_eq!(checked_align_up(16_384, 16_384), Some(16_384));
/// assert_eq!(checked_align_up(u64::MAX, 16_384), None);
/// ```
#[inline(always)]
#[must_use]
pub const fn checked_align_up(x: u64, a: u64) -> Option<u64> {
    match x.checked_add(a - 1) {
        Some(v) => Some(v & !(a - 1)),
        None => None,
    }
}

/// Returns `true` if `x` is a multiple of the power of two `a`.
#[inline(always)]
#[must_use]
pub const fn is_aligned(x: u64, a: u64) -> bool {
    x & (a - 1) == 0
}
