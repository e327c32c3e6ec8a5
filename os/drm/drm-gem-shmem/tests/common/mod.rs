#![allow(dead_code)]

use drm_gem_shmem::*;
use drm_memory_addresses::{CPU_PAGE_SIZE, PhysicalAddress, VirtualAddress};
use drm_page_alloc::{
    BitmapPageSource, BlockRequest, PageSource, ReleaseHints, SimulatedRam, WaitPolicy,
};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

pub const RAM_BASE: u64 = 0x8000_0000;
pub const GRANULE: u64 = 0x4000;
pub const VMAP_BASE: u64 = 0xFFFF_9000_0000_0000;

pub struct Machine {
    pub ram: Arc<SimulatedRam>,
    pub source: Arc<BitmapPageSource>,
    pub mapper: Arc<RecordingMapper>,
}

impl Machine {
    /// RAM of `granules` 16 KiB blocks.
    pub fn new(granules: u64) -> Self {
        let ram = Arc::new(SimulatedRam::new(PhysicalAddress::new(RAM_BASE), granules * GRANULE));
        let source = Arc::new(
            BitmapPageSource::new(ram.base(), ram.size(), ram.clone(), WaitPolicy::Fail).unwrap(),
        );
        Self {
            ram,
            source,
            mapper: Arc::default(),
        }
    }

    pub fn device(&self, config: ShmemConfig) -> GemDevice {
        GemDevice::new(self.source.clone(), self.mapper.clone(), config)
    }

    /// A device whose waits for memory park until the test opens the gate.
    pub fn gated_device(&self, config: ShmemConfig) -> (GemDevice, Gate) {
        let (waiting_tx, waiting_rx) = mpsc::channel();
        let (open_tx, open_rx) = mpsc::channel();
        let source = Arc::new(GatedSource {
            inner: self.source.clone(),
            waiting: Mutex::new(waiting_tx),
            gate: Mutex::new(open_rx),
        });
        let gate = Gate {
            waiting: waiting_rx,
            open: open_tx,
        };
        (GemDevice::new(source, self.mapper.clone(), config), gate)
    }

    pub fn free_granules(&self) -> usize {
        self.source.free_frames() / (GRANULE / CPU_PAGE_SIZE) as usize
    }
}

pub struct Gate {
    /// Receives one message per call that starts waiting.
    pub waiting: Receiver<()>,
    /// Send one message to let one waiter continue.
    pub open: Sender<()>,
}

pub struct GatedSource {
    inner: Arc<BitmapPageSource>,
    waiting: Mutex<Sender<()>>,
    gate: Mutex<Receiver<()>>,
}

impl PageSource for GatedSource {
    fn alloc_block(&self, req: BlockRequest) -> Option<PhysicalAddress> {
        self.inner.alloc_block(req)
    }

    fn free_block(&self, base: PhysicalAddress, size: u64, hints: ReleaseHints) {
        self.inner.free_block(base, size, hints);
    }

    fn wait_for_memory(&self, _req: BlockRequest) -> bool {
        self.waiting.lock().unwrap().send(()).unwrap();
        self.gate.lock().unwrap().recv().unwrap();
        true
    }
}

/// Kernel mapper that hands out fresh addresses and remembers live mappings.
#[derive(Default)]
pub struct RecordingMapper {
    pub fail: AtomicBool,
    next: AtomicU64,
    pub live: Mutex<Vec<(VirtualAddress, Vec<PhysicalAddress>, CacheMode)>>,
}

impl RecordingMapper {
    pub fn live(&self) -> usize {
        self.live.lock().unwrap().len()
    }
}

impl KernelMapper for RecordingMapper {
    fn vmap(&self, pages: &[PhysicalAddress], cache: CacheMode) -> Option<VirtualAddress> {
        if self.fail.load(Ordering::SeqCst) {
            return None;
        }
        let span = pages.len() as u64 * CPU_PAGE_SIZE;
        let vaddr = VirtualAddress::new(VMAP_BASE + self.next.fetch_add(span, Ordering::SeqCst));
        self.live.lock().unwrap().push((vaddr, pages.to_vec(), cache));
        Some(vaddr)
    }

    fn vunmap(&self, vaddr: VirtualAddress, pages: usize) {
        let mut live = self.live.lock().unwrap();
        let idx = live.iter().position(|m| m.0 == vaddr).expect("vunmap of an unknown mapping");
        assert_eq!(live[idx].1.len(), pages);
        live.remove(idx);
    }
}

/// User page table that records every insertion.
#[derive(Default)]
pub struct RecordingPageTable {
    pub inserted: Mutex<Vec<(VirtualAddress, PhysicalAddress, CacheMode)>>,
}

impl RecordingPageTable {
    pub fn inserted(&self) -> Vec<(VirtualAddress, PhysicalAddress, CacheMode)> {
        self.inserted.lock().unwrap().clone()
    }
}

impl UserPageTable for RecordingPageTable {
    fn insert_page(&self, vaddr: VirtualAddress, page: PhysicalAddress, cache: CacheMode) -> bool {
        self.inserted.lock().unwrap().push((vaddr, page, cache));
        true
    }
}

/// A foreign buffer; `vaddr: None` makes every vmap fail.
pub struct FakeExporter {
    pub size: u64,
    pub sgt: SgTable,
    pub vaddr: Option<VirtualAddress>,
    pub vmaps: AtomicUsize,
    pub vunmaps: AtomicUsize,
    pub mmaps: Mutex<Vec<(VirtualAddress, u64)>>,
}

impl FakeExporter {
    pub fn new(size: u64, sgt: SgTable, vaddr: Option<VirtualAddress>) -> Arc<Self> {
        Arc::new(Self {
            size,
            sgt,
            vaddr,
            vmaps: AtomicUsize::new(0),
            vunmaps: AtomicUsize::new(0),
            mmaps: Mutex::default(),
        })
    }
}

impl DmaBufExporter for FakeExporter {
    fn size(&self) -> u64 {
        self.size
    }

    fn sg_table(&self) -> SgTable {
        self.sgt.clone()
    }

    fn vmap(&self) -> Result<VirtualAddress, ExportError> {
        self.vmaps.fetch_add(1, Ordering::SeqCst);
        self.vaddr.ok_or(ExportError {
            reason: "no kernel mapping",
        })
    }

    fn vunmap(&self, _vaddr: VirtualAddress) {
        self.vunmaps.fetch_add(1, Ordering::SeqCst);
    }

    fn mmap(&self, start: VirtualAddress, len: u64) -> Result<(), ExportError> {
        self.mmaps.lock().unwrap().push((start, len));
        Ok(())
    }
}
