//! Reclaim hints and purge.

use crate::pages::release_pages;
use crate::{ShmemLocked, ShmemObject};
use log::{debug, warn};

/// Whether user space still needs a buffer's content.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum ReclaimState {
    #[default]
    Normal,
    /// The content may be discarded under memory pressure.
    DontNeed,
    /// The content is gone for good.
    Purged,
}

impl ShmemLocked<'_> {
    /// Record a reclaim hint and report whether the content is retained.
    ///
    /// Once purged the state never changes again. Requesting
    /// [`ReclaimState::Purged`] reclaims immediately. A pinned, kernel-mapped
    /// or imported buffer cannot be reclaimed; the request is then ignored
    /// and the content reported as retained.
    pub fn madvise(&mut self, state: ReclaimState) -> bool {
        match (self.state.reclaim, state) {
            (ReclaimState::Purged, _) => false,
            (_, ReclaimState::Purged) => {
                if let Some(why) = self.reclaim_blocker() {
                    warn!("ignoring madvise(Purged) of {why} {:#x} byte buffer", self.obj.size());
                    return true;
                }
                self.reclaim();
                false
            }
            (_, state) => {
                self.state.reclaim = state;
                true
            }
        }
    }

    fn reclaim_blocker(&self) -> Option<&'static str> {
        if self.obj.is_imported() {
            Some("an imported")
        } else if self.state.pin_count > 0 {
            Some("a pinned")
        } else if self.state.vmap_use_count > 0 {
            Some("a kernel-mapped")
        } else {
            None
        }
    }

    /// Marked `DontNeed`, native, and neither pinned nor kernel-mapped.
    #[must_use]
    pub fn is_purgeable(&self) -> bool {
        self.state.reclaim == ReclaimState::DontNeed && self.reclaim_blocker().is_none()
    }

    /// Discard the content of a purgeable buffer.
    ///
    /// Releases the scatter-gather reference and every other page
    /// reference, including those of live user mappings, which then fault
    /// with an access violation and release nothing when closed.
    ///
    /// # Panics
    /// If the buffer is not [purgeable](Self::is_purgeable) (contract
    /// violation).
    pub fn purge(&mut self) {
        if self.state.reclaim != ReclaimState::DontNeed {
            contract_violation!("purge of a buffer in state {:?}", self.state.reclaim);
        }
        if let Some(why) = self.reclaim_blocker() {
            contract_violation!("purge of {why} buffer");
        }
        self.reclaim();
    }

    fn reclaim(&mut self) {
        let dropped = self.state.pages_use_count;
        if dropped > 0 {
            self.state.pages_use_count = 0;
            release_pages(self.obj.device(), &mut self.state);
        }
        self.state.reclaim = ReclaimState::Purged;
        self.state.mmap_offset = None;
        debug!("purged {:#x} byte buffer, reclaimed {dropped} page reference(s)", self.obj.size());
    }
}

impl ShmemObject {
    /// Lock and call [`ShmemLocked::madvise`].
    pub fn madvise(&self, state: ReclaimState) -> bool {
        self.lock().madvise(state)
    }

    /// Lock and call [`ShmemLocked::purge`].
    pub fn purge(&self) {
        self.lock().purge();
    }
}
