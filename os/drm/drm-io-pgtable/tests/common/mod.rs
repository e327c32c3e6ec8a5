#![allow(dead_code)]

use drm_io_pgtable::*;
use drm_memory_addresses::PhysicalAddress;
use drm_page_alloc::{BitmapPageSource, PageSource, SimulatedRam, WaitPolicy};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const RAM_BASE: u64 = 0x8000_0000;
pub const RAM_SIZE: u64 = 4 << 20;

pub struct Machine {
    pub ram: Arc<SimulatedRam>,
    pub source: Arc<BitmapPageSource>,
}

impl Machine {
    pub fn new() -> Self {
        let ram = Arc::new(SimulatedRam::new(PhysicalAddress::new(RAM_BASE), RAM_SIZE));
        let source = Arc::new(
            BitmapPageSource::new(ram.base(), ram.size(), ram.clone(), WaitPolicy::Fail).unwrap(),
        );
        Self { ram, source }
    }

    /// A config that allocates tables straight from the page source.
    pub fn config(&self, params: PgtableParams) -> PgtableConfig {
        PgtableConfig::new(params, self.ram.clone())
            .with_dma(Some(self.source.clone() as Arc<dyn PageSource>))
    }
}

/// Table allocator that counts live tables and can run out on purpose.
pub struct CountingAllocator {
    inner: DmaTableAllocator,
    pub live: AtomicUsize,
    pub allocated: AtomicUsize,
    budget: usize,
}

impl CountingAllocator {
    pub fn new(source: Arc<BitmapPageSource>, budget: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: DmaTableAllocator::new(source),
            live: AtomicUsize::new(0),
            allocated: AtomicUsize::new(0),
            budget,
        })
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

impl TableAllocator for CountingAllocator {
    fn alloc_table(&self, size: u64, cookie: Cookie) -> Option<PhysicalAddress> {
        if self.allocated.load(Ordering::SeqCst) >= self.budget {
            return None;
        }
        let table = self.inner.alloc_table(size, cookie)?;
        self.allocated.fetch_add(1, Ordering::SeqCst);
        self.live.fetch_add(1, Ordering::SeqCst);
        Some(table)
    }

    fn free_table(&self, table: PhysicalAddress, size: u64, cookie: Cookie) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        self.inner.free_table(table, size, cookie);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flush {
    All,
    Range(IovaRange),
    Sync(PhysicalAddress, u64),
}

/// Records every maintenance callback.
#[derive(Default)]
pub struct RecordingFlush {
    pub log: Mutex<Vec<Flush>>,
}

impl RecordingFlush {
    pub fn take(&self) -> Vec<Flush> {
        std::mem::take(&mut *self.log.lock().unwrap())
    }
}

impl FlushOps for RecordingFlush {
    fn tlb_flush_all(&self, _cookie: Cookie) {
        self.log.lock().unwrap().push(Flush::All);
    }

    fn tlb_flush_range(&self, range: IovaRange, _cookie: Cookie) {
        self.log.lock().unwrap().push(Flush::Range(range));
    }

    fn sync_table(&self, table: PhysicalAddress, len: u64, _cookie: Cookie) {
        self.log.lock().unwrap().push(Flush::Sync(table, len));
    }
}
