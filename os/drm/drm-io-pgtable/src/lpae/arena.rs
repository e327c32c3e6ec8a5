//! Bookkeeping for the tables a page table owns.
//!
//! Table memory lives in device-visible physical frames; descriptors only
//! carry physical addresses. The arena maps those addresses back to handles
//! so walks and teardown never trust an address the page table did not
//! allocate itself.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use drm_memory_addresses::PhysicalAddress;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Ord, PartialOrd)]
pub struct TableHandle(u32);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TableSlot {
    pub phys: PhysicalAddress,
    pub level: u32,
}

#[derive(Debug, Default)]
pub struct TableArena {
    slots: Vec<Option<TableSlot>>,
    free_slots: Vec<u32>,
    by_phys: BTreeMap<PhysicalAddress, TableHandle>,
}

impl TableArena {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_slots: Vec::new(),
            by_phys: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, phys: PhysicalAddress, level: u32) -> TableHandle {
        let slot = Some(TableSlot { phys, level });
        let handle = if let Some(idx) = self.free_slots.pop() {
            self.slots[idx as usize] = slot;
            TableHandle(idx)
        } else {
            self.slots.push(slot);
            TableHandle((self.slots.len() - 1) as u32)
        };
        let previous = self.by_phys.insert(phys, handle);
        assert!(previous.is_none(), "table {phys} tracked twice");
        handle
    }

    /// # Panics
    /// If `handle` was removed.
    #[must_use]
    pub fn get(&self, handle: TableHandle) -> TableSlot {
        match self.slots.get(handle.0 as usize).copied().flatten() {
            Some(slot) => slot,
            None => panic!("stale table handle {handle:?}"),
        }
    }

    #[must_use]
    pub fn lookup(&self, phys: PhysicalAddress) -> Option<TableHandle> {
        self.by_phys.get(&phys).copied()
    }

    /// # Panics
    /// If `handle` was removed.
    pub fn remove(&mut self, handle: TableHandle) -> TableSlot {
        let slot = self.get(handle);
        self.slots[handle.0 as usize] = None;
        self.free_slots.push(handle.0);
        self.by_phys.remove(&slot.phys);
        slot
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_phys.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_phys.is_empty()
    }
}
