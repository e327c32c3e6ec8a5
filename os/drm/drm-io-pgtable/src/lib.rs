//! # Device Page Tables
//!
//! Multi-level, LPAE-style translation tables for IOMMUs and GPU MMUs,
//! allocated through a registry of table formats.
//!
//! ## Walk
//!
//! An IOVA is split into per-level index fields below the granule offset.
//! Each table is one granule of 64-bit descriptors; the root may index fewer
//! entries (`pgd_bits`) when the input width is not a multiple of the
//! per-level width.
//!
//! ```text
//!  root (start level)  →  L1  →  L2  →  L3  →  page
//!   │                     │      │      │
//!   │                     │      │      └──► page  (granule sized, last level)
//!   │                     │      └─────────► block (2 MiB / 32 MiB) or table
//!   │                     └────────────────► block (1 GiB, 4K granule) or table
//!   └──────────────────────────────────────► table
//! ```
//!
//! | Granule | bits per level | Page | Blocks          |
//! |---------|----------------|------|-----------------|
//! | 4 KiB   | 9              | 4K   | 2 MiB, 1 GiB    |
//! | 16 KiB  | 11             | 16K  | 32 MiB          |
//!
//! ## Formats
//!
//! | Format                          | ias/oas | Granules | Quirks | Custom allocator |
//! |---------------------------------|---------|----------|--------|------------------|
//! | [`PgtableFormat::ArmLpaeS1`]    | 48/48   | 4K, 16K  | `arm_ns`, `arm_ttbr1`, `arm_outer_wbwa` | yes |
//! | [`PgtableFormat::AppleUat`]     | 48/42   | 16K      | none   | no |
//!
//! ## Ordering
//!
//! New tables are zero-filled and fenced before the entry pointing at them is
//! stored, and every mutating call ends with a release fence. A concurrent
//! hardware walker therefore observes either the old entry or a fully
//! initialized table, never a partial one. Mutation itself needs `&mut`;
//! callers serialize it.
//!
//! ## Example
//!
//! ```rust
//! # use std::sync::Arc;
//! # use drm_io_pgtable::*;
//! # use drm_memory_addresses::{IoVirtualAddress, PhysicalAddress};
//! # use drm_page_alloc::{BitmapPageSource, SimulatedRam, WaitPolicy};
//! let ram = Arc::new(SimulatedRam::new(PhysicalAddress::new(0x8000_0000), 0x10_0000));
//! let source = Arc::new(
//!     BitmapPageSource::new(ram.base(), ram.size(), ram.clone(), WaitPolicy::Fail).unwrap(),
//! );
//!
//! let cfg = PgtableConfig::new(PgtableParams::new(), ram).with_dma(Some(source));
//! let registry = PgtableRegistry::with_default_formats();
//! let mut pgtable = registry.alloc(PgtableFormat::ArmLpaeS1, &cfg, Cookie(0)).unwrap();
//!
//! let iova = IoVirtualAddress::new(0x1000_0000);
//! pgtable
//!     .map_pages(iova, PhysicalAddress::new(0x2000_0000), SZ_16K, 1, IommuProt::READ_WRITE)
//!     .unwrap();
//! assert_eq!(
//!     pgtable.iova_to_phys(IoVirtualAddress::new(0x1000_0100)),
//!     Some(PhysicalAddress::new(0x2000_0100))
//! );
//! pgtable.free();
//! ```

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod allocator;
mod config;
mod domain;
mod format;
mod gather;
mod lpae;
mod prot;

pub use allocator::{DmaTableAllocator, TableAllocator};
pub use config::{
    Cookie, PgtableConfig, PgtableParams, PgtableQuirks, SZ_1G, SZ_2M, SZ_4K, SZ_16K, SZ_32M,
};
pub use domain::IommuDomain;
pub use format::{
    AllocFn, FormatCaps, FormatDescriptor, FreeFn, IoPgtable, IoPgtableOps, PgtableFormat,
    PgtableRegistry,
};
pub use gather::{FlushOps, IotlbGather, IovaRange};
pub use prot::IommuProt;

use drm_memory_addresses::IoVirtualAddress;

/// Why a page table could not be allocated.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PgtableConfigError {
    #[error("page-table format {0:?} is not registered")]
    UnknownFormat(PgtableFormat),
    #[error("input address width {requested} exceeds the format limit of {max} bits")]
    InputAddressTooWide { requested: u32, max: u32 },
    #[error("input address width {0} leaves nothing to translate")]
    InputAddressTooNarrow(u32),
    #[error("output address width {requested} exceeds the format limit of {max} bits")]
    OutputAddressTooWide { requested: u32, max: u32 },
    #[error("quirks {requested:#x} are not a subset of the supported {supported:#x}")]
    UnsupportedQuirks { requested: u32, supported: u32 },
    #[error("the format does not accept a custom table allocator")]
    CustomAllocatorUnsupported,
    #[error("neither a custom table allocator nor a DMA page source was given")]
    NoAllocator,
    #[error("page-size bitmap {0:#x} contains no granule the format supports")]
    NoSupportedGranule(u64),
    #[error("out of memory allocating the root table")]
    OutOfMemory,
}

/// Why a map call stopped.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IoPgtableError {
    #[error("out of memory allocating a translation table")]
    OutOfMemory,
    #[error("{iova:?} is already mapped")]
    AlreadyMapped { iova: IoVirtualAddress },
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

/// A failed map, with the number of bytes installed before the failure.
///
/// The first `mapped` bytes starting at the requested IOVA are live and must
/// be unmapped by the caller to roll back.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[error("mapped {mapped:#x} bytes before failing")]
pub struct MapError {
    pub mapped: u64,
    #[source]
    pub source: IoPgtableError,
}
