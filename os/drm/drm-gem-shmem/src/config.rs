use crate::CacheMode;
use drm_memory_addresses::Granule;
use utils_accessors_derive::Setters;

/// Per-device buffer-object policy.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Setters)]
pub struct ShmemConfig {
    /// Allocation unit of buffer backing; sizes are rounded up to it.
    pub granule: Granule,
    /// Map buffers write-combined into the CPU.
    pub map_wc: bool,
    /// Report released pages as dirty to the page source.
    pub mark_dirty_on_put: bool,
    /// Report released pages as accessed to the page source.
    pub mark_accessed_on_put: bool,
}

impl ShmemConfig {
    /// 16 KiB granule, cached CPU mappings, no release hints.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            granule: Granule::Size16K,
            map_wc: false,
            mark_dirty_on_put: false,
            mark_accessed_on_put: false,
        }
    }

    /// Cache attribute for CPU mappings of native buffers.
    #[must_use]
    pub const fn cache_mode(&self) -> CacheMode {
        if self.map_wc {
            CacheMode::WriteCombine
        } else {
            CacheMode::Normal
        }
    }
}

impl Default for ShmemConfig {
    fn default() -> Self {
        Self::new()
    }
}
