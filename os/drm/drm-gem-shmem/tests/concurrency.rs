mod common;

use common::{GRANULE, Machine};
use drm_gem_shmem::*;
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
fn waiting_for_memory_releases_the_object_lock() {
    let m = Machine::new(4);
    let (dev, gate) = m.gated_device(ShmemConfig::new());
    let hog = ShmemObject::create(&dev, 2 * GRANULE).unwrap();
    let obj = ShmemObject::create(&dev, 3 * GRANULE).unwrap();
    let hog_pin = hog.pin().unwrap();

    let worker = {
        let obj = Arc::clone(&obj);
        thread::spawn(move || obj.pin())
    };

    // the worker holds two blocks and waits for the third
    gate.waiting.recv().unwrap();
    {
        let locked = obj.try_lock().expect("lock must be free while waiting");
        assert_eq!(locked.pages_use_count(), 0);
    }
    drop(hog_pin);
    gate.open.send(()).unwrap();

    let pin = worker.join().unwrap().unwrap();
    assert_eq!(obj.lock().pages_use_count(), 1);
    assert_eq!(m.free_granules(), 1);
    drop(pin);
    assert_eq!(m.free_granules(), 4);
}

#[test]
fn populated_meanwhile_takes_a_reference() {
    let m = Machine::new(8);
    let (dev, gate) = m.gated_device(ShmemConfig::new());
    let hog = ShmemObject::create(&dev, 5 * GRANULE).unwrap();
    let obj = ShmemObject::create(&dev, 4 * GRANULE).unwrap();
    let hog_pin = hog.pin().unwrap();

    let worker = {
        let obj = Arc::clone(&obj);
        thread::spawn(move || obj.pin())
    };
    gate.waiting.recv().unwrap();

    // with the hog gone there is room for a complete second population
    drop(hog_pin);
    obj.lock().get_pages().unwrap();
    let sgt = obj.lock().sg_table().cloned().unwrap();
    assert_eq!(m.free_granules(), 1);
    gate.open.send(()).unwrap();

    let pin = worker.join().unwrap().unwrap();
    {
        let locked = obj.lock();
        assert_eq!(locked.pages_use_count(), 2);
        assert_eq!(locked.pin_count(), 1);
        assert_eq!(locked.sg_table(), Some(&sgt));
    }
    // the worker's partial blocks went back
    assert_eq!(m.free_granules(), 4);

    obj.lock().put_pages();
    drop(pin);
    assert_eq!(m.free_granules(), 8);
}

#[test]
fn mapped_meanwhile_shares_the_mapping() {
    let m = Machine::new(8);
    let (dev, gate) = m.gated_device(ShmemConfig::new());
    let hog = ShmemObject::create(&dev, 5 * GRANULE).unwrap();
    let obj = ShmemObject::create(&dev, 4 * GRANULE).unwrap();
    let hog_pin = hog.pin().unwrap();

    let worker = {
        let obj = Arc::clone(&obj);
        thread::spawn(move || obj.vmap())
    };
    gate.waiting.recv().unwrap();

    drop(hog_pin);
    let first = obj.vmap().unwrap();
    gate.open.send(()).unwrap();

    let second = worker.join().unwrap().unwrap();
    assert_eq!(second.vaddr(), first.vaddr());
    {
        let locked = obj.lock();
        assert_eq!(locked.vmap_use_count(), 2);
        assert_eq!(locked.pages_use_count(), 1);
    }
    assert_eq!(m.mapper.live(), 1);
    assert_eq!(m.free_granules(), 4);

    drop(first);
    assert_eq!(m.mapper.live(), 1);
    drop(second);
    assert_eq!(m.mapper.live(), 0);
    assert_eq!(m.free_granules(), 8);
}

#[test]
fn sg_table_reference_is_taken_once_under_contention() {
    let m = Machine::new(8);
    let (dev, gate) = m.gated_device(ShmemConfig::new());
    let hog = ShmemObject::create(&dev, 5 * GRANULE).unwrap();
    let obj = ShmemObject::create(&dev, 4 * GRANULE).unwrap();
    let hog_pin = hog.pin().unwrap();

    let worker = {
        let obj = Arc::clone(&obj);
        thread::spawn(move || obj.get_pages_sgt())
    };
    gate.waiting.recv().unwrap();

    drop(hog_pin);
    let sgt = obj.get_pages_sgt().unwrap();
    gate.open.send(()).unwrap();

    assert_eq!(worker.join().unwrap().unwrap(), sgt);
    assert_eq!(obj.lock().pages_use_count(), 1);
    assert_eq!(m.free_granules(), 4);

    drop(obj);
    assert_eq!(m.free_granules(), 8);
}

#[test]
fn purged_meanwhile_fails_the_waiter() {
    let m = Machine::new(4);
    let (dev, gate) = m.gated_device(ShmemConfig::new());
    let hog = ShmemObject::create(&dev, 2 * GRANULE).unwrap();
    let obj = ShmemObject::create(&dev, 3 * GRANULE).unwrap();
    let hog_pin = hog.pin().unwrap();

    let worker = {
        let obj = Arc::clone(&obj);
        thread::spawn(move || obj.pin().map(drop))
    };
    gate.waiting.recv().unwrap();

    assert!(obj.madvise(ReclaimState::DontNeed));
    obj.purge();
    gate.open.send(()).unwrap();

    assert_eq!(worker.join().unwrap(), Err(GemError::Purged));
    assert_eq!(obj.lock().pin_count(), 0);
    assert_eq!(m.free_granules(), 2);
    drop(hog_pin);
    assert_eq!(m.free_granules(), 4);
}

#[test]
fn objects_are_independent() {
    const THREADS: usize = 4;
    let m = Machine::new(64);
    let dev = m.device(ShmemConfig::new());
    let barrier = Arc::new(Barrier::new(THREADS));

    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let dev = dev.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let obj = ShmemObject::create(&dev, 2 * GRANULE).unwrap();
                barrier.wait();
                for _ in 0..100 {
                    let pin = obj.pin().unwrap();
                    let vmap = obj.vmap().unwrap();
                    assert!(obj.lock().pages_use_count() >= 2);
                    drop(vmap);
                    drop(pin);
                }
                obj.lock().pages_use_count()
            })
        })
        .collect();

    for worker in workers {
        assert_eq!(worker.join().unwrap(), 0);
    }
    assert_eq!(m.free_granules(), 64);
}

#[test]
fn shared_object_counts_stay_balanced() {
    const THREADS: usize = 4;
    let m = Machine::new(4);
    let obj = ShmemObject::create(&m.device(ShmemConfig::new()), 2 * GRANULE).unwrap();
    let barrier = Arc::new(Barrier::new(THREADS));

    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let obj = Arc::clone(&obj);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..200 {
                    let vmap = obj.vmap().unwrap();
                    let locked = obj.lock();
                    assert!(locked.vmap_use_count() > 0);
                    assert!(locked.pages_use_count() > 0);
                    drop(locked);
                    drop(vmap);
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }
    let locked = obj.lock();
    assert_eq!(locked.vmap_use_count(), 0);
    assert_eq!(locked.pages_use_count(), 0);
    assert_eq!(m.free_granules(), 4);
    assert_eq!(m.mapper.live(), 0);
}
