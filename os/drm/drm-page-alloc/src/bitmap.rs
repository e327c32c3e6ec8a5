//! Bitmap-backed [`PageSource`] over a fixed physical range.
//!
//! One bit per 4 KiB frame; set means allocated. Blocks are found first-fit at
//! the requested physical alignment.

use crate::{BlockRequest, PageAllocError, PageSource, PhysMapper, ReleaseHints, zero_phys};
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::hint::spin_loop;
use core::sync::atomic::{AtomicUsize, Ordering};
use drm_memory_addresses::{CPU_PAGE_SIZE, PhysicalAddress, is_aligned};
use drm_sync::SpinMutex;
use log::{debug, error, trace};

/// What [`BitmapPageSource::wait_for_memory`] does when memory is short.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum WaitPolicy {
    /// Report failure immediately; callers turn this into out-of-memory.
    #[default]
    Fail,
    /// Spin until a matching block is released.
    Block,
}

/// Counters for frames returned to the source.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct ReleaseStats {
    pub released_frames: u64,
    pub dirty_frames: u64,
    pub accessed_frames: u64,
}

struct Bitmap {
    words: Vec<u64>,
    free: usize,
    stats: ReleaseStats,
}

impl Bitmap {
    fn is_set(&self, frame: usize) -> bool {
        self.words[frame / 64] & (1 << (frame % 64)) != 0
    }

    fn set_range(&mut self, first: usize, count: usize, used: bool) {
        for frame in first..first + count {
            let mask = 1 << (frame % 64);
            if used {
                self.words[frame / 64] |= mask;
            } else {
                self.words[frame / 64] &= !mask;
            }
        }
    }
}

pub struct BitmapPageSource {
    base: PhysicalAddress,
    frames: usize,
    mapper: Arc<dyn PhysMapper>,
    policy: WaitPolicy,
    bitmap: SpinMutex<Bitmap>,
    waiters: AtomicUsize,
}

impl BitmapPageSource {
    /// Manage `[base, base + size)`; `size` is truncated to whole frames.
    ///
    /// # Errors
    /// The base must be frame aligned and the range must hold at least one
    /// frame without wrapping.
    pub fn new(
        base: PhysicalAddress,
        size: u64,
        mapper: Arc<dyn PhysMapper>,
        policy: WaitPolicy,
    ) -> Result<Self, PageAllocError> {
        if !is_aligned(base.as_u64(), CPU_PAGE_SIZE) {
            return Err(PageAllocError::UnalignedBase(base.as_u64()));
        }
        if base.checked_add(size).is_none() {
            return Err(PageAllocError::RangeOverflow);
        }
        let frames = (size / CPU_PAGE_SIZE) as usize;
        if frames == 0 {
            return Err(PageAllocError::EmptyRange(size));
        }

        debug!("page source over {base}+{size:#x}: {frames} frames, {policy:?}");
        Ok(Self {
            base,
            frames,
            mapper,
            policy,
            bitmap: SpinMutex::new(Bitmap {
                words: vec![0; frames.div_ceil(64)],
                free: frames,
                stats: ReleaseStats::default(),
            }),
            waiters: AtomicUsize::new(0),
        })
    }

    #[must_use]
    pub const fn total_frames(&self) -> usize {
        self.frames
    }

    #[must_use]
    pub fn free_frames(&self) -> usize {
        self.bitmap.with_lock(|b| b.free)
    }

    /// Number of callers currently blocked in [`PageSource::wait_for_memory`].
    #[must_use]
    pub fn waiters(&self) -> usize {
        self.waiters.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn release_stats(&self) -> ReleaseStats {
        self.bitmap.with_lock(|b| b.stats)
    }

    fn frame_addr(&self, frame: usize) -> PhysicalAddress {
        self.base + frame as u64 * CPU_PAGE_SIZE
    }

    /// First frame index at or after `from` whose address is `align` aligned.
    fn next_aligned(&self, from: usize, align: u64) -> usize {
        let addr = self.frame_addr(from).as_u64();
        let rem = addr & (align - 1);
        if rem == 0 {
            from
        } else {
            from + ((align - rem) / CPU_PAGE_SIZE) as usize
        }
    }

    fn find_run(&self, bitmap: &Bitmap, count: usize, align: u64) -> Option<usize> {
        if count > bitmap.free {
            return None;
        }
        let step = (align / CPU_PAGE_SIZE).max(1) as usize;
        let mut first = self.next_aligned(0, align);
        while first + count <= self.frames {
            match (first..first + count).find(|&f| bitmap.is_set(f)) {
                None => return Some(first),
                // restart at the next aligned frame past the obstacle
                Some(used) => first = self.next_aligned(used + 1, align).max(first + step),
            }
        }
        None
    }

    fn validate(req: &BlockRequest) -> bool {
        req.size != 0 && req.align.is_power_of_two()
    }
}

impl PageSource for BitmapPageSource {
    fn alloc_block(&self, req: BlockRequest) -> Option<PhysicalAddress> {
        if !Self::validate(&req) {
            error!("rejecting malformed block request {req:?}");
            return None;
        }
        let align = req.align.max(CPU_PAGE_SIZE);
        let count = req.frames() as usize;

        let first = self.bitmap.with_lock(|b| {
            let first = self.find_run(b, count, align)?;
            b.set_range(first, count, true);
            b.free -= count;
            Some(first)
        })?;

        let pa = self.frame_addr(first);
        if req.zero {
            // SAFETY: the frames were just marked used, nobody else can see them.
            unsafe { zero_phys(self.mapper.as_ref(), pa, count * CPU_PAGE_SIZE as usize) };
        }
        trace!("allocated {count} frame(s) at {pa}");
        Some(pa)
    }

    fn free_block(&self, base: PhysicalAddress, size: u64, hints: ReleaseHints) {
        let count = size.div_ceil(CPU_PAGE_SIZE) as usize;
        let first = base
            .offset_from(self.base)
            .filter(|off| is_aligned(*off, CPU_PAGE_SIZE))
            .map(|off| (off / CPU_PAGE_SIZE) as usize);
        let Some(first) = first.filter(|f| f + count <= self.frames) else {
            panic!("free of foreign block {base}+{size:#x}");
        };

        self.bitmap.with_lock(|b| {
            if let Some(f) = (first..first + count).find(|&f| !b.is_set(f)) {
                panic!("double free of frame {}", self.frame_addr(f));
            }
            b.set_range(first, count, false);
            b.free += count;
            b.stats.released_frames += count as u64;
            if hints.dirty {
                b.stats.dirty_frames += count as u64;
            }
            if hints.accessed {
                b.stats.accessed_frames += count as u64;
            }
        });
        trace!("released {count} frame(s) at {base}");
    }

    fn wait_for_memory(&self, req: BlockRequest) -> bool {
        if !Self::validate(&req) || req.frames() > self.frames as u64 {
            return false;
        }
        if self.policy == WaitPolicy::Fail {
            return false;
        }

        let align = req.align.max(CPU_PAGE_SIZE);
        let count = req.frames() as usize;
        self.waiters.fetch_add(1, Ordering::AcqRel);
        while self
            .bitmap
            .with_lock(|b| self.find_run(b, count, align))
            .is_none()
        {
            spin_loop();
        }
        self.waiters.fetch_sub(1, Ordering::AcqRel);
        true
    }
}
