//! # Page-backed GPU buffer objects
//!
//! A [`ShmemObject`] owns the physical backing of one GPU-visible buffer and
//! mediates everything that keeps that backing alive or gives it up:
//!
//! ```text
//!                 ┌──────────────┐
//!   create ──────►│  ShmemObject │◄────── import (dma-buf exporter)
//!                 └──────┬───────┘
//!          lock()        │ per-object SpinMutex
//!                 ┌──────▼───────┐
//!                 │ ShmemLocked  │ get_pages / put_pages
//!                 │              │ vmap / vunmap
//!                 │              │ madvise / purge
//!                 └──────┬───────┘
//!     ┌──────────────────┼─────────────────────┐
//!     ▼                  ▼                     ▼
//!  PinGuard          VmapGuard            ShmemMapping
//!  (pages ref)   (pages ref + vaddr)  (pages ref, fault-driven)
//! ```
//!
//! ## Residency
//!
//! Pages are resident iff `pages_use_count > 0`. The first reference
//! allocates one zero-filled, granule-aligned block per granule and builds
//! the [`SgTable`] (one entry per granule). The last reference returns every
//! block to the [`PageSource`](drm_page_alloc::PageSource).
//!
//! While waiting for memory the object lock is released; on re-acquisition
//! the state is re-checked, since a concurrent caller may have populated or
//! purged the object in the meantime.
//!
//! ## Reclaim
//!
//! [`ReclaimState`] moves `Normal ⇄ DontNeed → Purged`. Once purged the
//! object never holds pages again; faults on its mappings report an access
//! violation.
//!
//! ## Import
//!
//! Imported objects borrow their backing from a [`DmaBufExporter`]. They
//! never allocate or count pages; CPU mappings are delegated to the exporter.
//!
//! ## Contract violations
//!
//! Use-count underflow, pinning an imported object and purging a pinned or
//! mapped object are caller bugs. They are logged and then panic with a
//! message starting with `contract violation:`.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

/// Log and raise a caller-contract violation.
macro_rules! contract_violation {
    ($($arg:tt)*) => {{
        log::error!("contract violation: {}", format_args!($($arg)*));
        panic!("contract violation: {}", format_args!($($arg)*));
    }};
}

mod backing;
mod config;
mod device;
mod madvise;
mod mmap;
mod object;
mod pages;
mod sg_table;
mod vmap;

pub use backing::{Backing, DmaBufExporter, ExportError};
pub use config::ShmemConfig;
pub use device::{CacheMode, GemDevice, KernelMapper, MMAP_OFFSET_BASE, UserPageTable};
pub use madvise::ReclaimState;
pub use mmap::{ShmemMapping, VmFlags};
pub use object::{ShmemLocked, ShmemObject};
pub use pages::PinGuard;
pub use sg_table::{SgEntry, SgTable};
pub use vmap::VmapGuard;

/// Recoverable buffer-object failures.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GemError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("invalid buffer size {0:#x}")]
    InvalidSize(u64),
    #[error("buffer content has been purged")]
    Purged,
    #[error("access violation at offset {offset:#x}")]
    AccessViolation { offset: u64 },
    #[error(transparent)]
    Exporter(#[from] ExportError),
}
