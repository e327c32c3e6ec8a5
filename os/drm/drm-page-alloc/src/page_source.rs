use drm_memory_addresses::{CPU_PAGE_SIZE, PhysicalAddress};
use utils_accessors_derive::Setters;

/// A request for one physically contiguous block.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Setters)]
pub struct BlockRequest {
    /// Block size in bytes; rounded up to whole 4 KiB frames.
    pub size: u64,
    /// Required physical alignment (power of two, at least one frame).
    pub align: u64,
    /// Zero-fill the block before handing it out.
    pub zero: bool,
}

impl BlockRequest {
    /// A zero-filled block of `size` bytes, naturally aligned to `size`
    /// (or one frame, whichever is larger).
    #[must_use]
    pub const fn zeroed(size: u64) -> Self {
        let align = if size.is_power_of_two() && size > CPU_PAGE_SIZE {
            size
        } else {
            CPU_PAGE_SIZE
        };
        Self {
            size,
            align,
            zero: true,
        }
    }

    /// Number of 4 KiB frames this request covers.
    #[must_use]
    pub const fn frames(&self) -> u64 {
        self.size.div_ceil(CPU_PAGE_SIZE)
    }
}

/// Per-release bookkeeping forwarded to the page source.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Setters)]
pub struct ReleaseHints {
    /// The content was (or may have been) written by the CPU or device.
    pub dirty: bool,
    /// The content was accessed since it was handed out.
    pub accessed: bool,
}

/// Supplier of physical memory for buffer backing and page-table frames.
///
/// Object safe; shared as `Arc<dyn PageSource>` between buffer objects and
/// page tables.
pub trait PageSource: Send + Sync {
    /// Hand out one physically contiguous block, or `None` if none is
    /// available right now. Never blocks.
    fn alloc_block(&self, req: BlockRequest) -> Option<PhysicalAddress>;

    /// Return a block previously obtained from [`alloc_block`](Self::alloc_block)
    /// with the same size.
    fn free_block(&self, base: PhysicalAddress, size: u64, hints: ReleaseHints);

    /// Block until `req` could be satisfied.
    ///
    /// Returns `false` without blocking if the request can never be satisfied
    /// or the source does not wait. There is no timeout and no cancellation.
    /// Another caller may take the memory before the retry; callers loop.
    fn wait_for_memory(&self, req: BlockRequest) -> bool;
}
