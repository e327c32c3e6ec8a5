//! # Physical Page Source
//!
//! The bottom layer of GPU memory management: where physical frames come
//! from, and how the CPU touches them.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │   Buffer objects (drm-gem-shmem)                    │
//! │   Page-table memory (drm-io-pgtable)                │
//! └─────────────────┬───────────────────────────────────┘
//!                   │ alloc_block / free_block / wait_for_memory
//! ┌─────────────────▼───────────────────────────────────┐
//! │              PageSource                             │
//! │    • Contiguous, aligned blocks                     │
//! │    • Optional zero fill                             │
//! │    • Blocking wait under memory pressure            │
//! └─────────────────┬───────────────────────────────────┘
//!                   │ phys_to_ptr
//! ┌─────────────────▼───────────────────────────────────┐
//! │              PhysMapper                             │
//! │    • HHDM (higher-half direct map)                  │
//! │    • Simulated RAM for hosted builds                │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Contract
//!
//! [`PageSource::alloc_block`] never blocks; it either hands out a block or
//! returns `None`. A caller that is allowed to sleep then calls
//! [`PageSource::wait_for_memory`], which blocks without a timeout until the
//! request could be satisfied. It returns `false` when waiting is pointless,
//! and the caller reports out-of-memory.
//!
//! Callers must not hold locks that the releasing side needs while they
//! wait. Buffer objects drop their own lock around the wait.

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod bitmap;
mod page_source;
mod phys_mapper;

pub use bitmap::{BitmapPageSource, ReleaseStats, WaitPolicy};
pub use page_source::{BlockRequest, PageSource, ReleaseHints};
pub use phys_mapper::{HhdmPhysMapper, PhysMapper, SimulatedRam, phys_slice, zero_phys};

/// Errors raised while setting up a page source.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PageAllocError {
    #[error("physical range base {0:#x} is not frame aligned")]
    UnalignedBase(u64),
    #[error("physical range of {0:#x} bytes holds no whole frame")]
    EmptyRange(u64),
    #[error("physical range wraps the address space")]
    RangeOverflow,
}
