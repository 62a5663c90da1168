use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::{
    aspace::{AddressSpace, CaratImpl, Characteristics},
    c_api,
    error::Error,
    mmap::{MallocAllocator, MmapRegionAllocator, RegionAllocator},
    mutator::Register,
    region::{Protection, Region},
    region_tracker::RegionBackend,
    relocation::RelocationEngine,
    runtime::CaratRuntime,
    safepoint::GlobalSafepoint,
    Carat, CaratAspace, Config,
};

const GIB4: usize = 0x1_0000_0000;

/// Counts allocation attempts and hands out real mappings.
#[derive(Default)]
struct CountingAllocator {
    inner: MmapRegionAllocator,
    attempts: AtomicUsize,
}

impl RegionAllocator for CountingAllocator {
    fn allocate(&self, len: usize) -> Option<usize> {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        self.inner.allocate(len)
    }

    fn release(&self, address: usize) {
        self.inner.release(address)
    }
}

fn counted_aspace(backend: RegionBackend) -> (Arc<CaratAspace>, Arc<CountingAllocator>) {
    let runtime = Arc::new(CaratRuntime::new(Config::default()));
    runtime.init();
    let world = Arc::new(GlobalSafepoint::new(Some(Duration::from_millis(100))));
    let engine = Arc::new(RelocationEngine::new(runtime, world));
    let allocator = Arc::new(CountingAllocator::default());
    let aspace = CaratImpl::new(engine, backend, allocator.clone())
        .create_aspace("counted", Characteristics::default());
    (aspace, allocator)
}

fn rw() -> Protection {
    Protection::from_flags(Protection::READ | Protection::WRITE)
}

#[test]
fn identity_and_overlap_rules_on_every_backend() {
    for backend in RegionBackend::ALL {
        let carat = Carat::boot(Config {
            region_backend: backend,
            ..Config::default()
        });
        let aspace = carat.create_aspace("scenario-a");
        let flags = Protection::READ
            | Protection::WRITE
            | Protection::EXEC
            | Protection::KERN
            | Protection::PIN;
        let region = Region::identity(0, GIB4, Protection::from_flags(flags));
        aspace.add_region(&region).unwrap();

        assert!(matches!(
            aspace.add_region(&region),
            Err(Error::OverlapViolation { .. })
        ));

        let mut other = region;
        other.va_start = 0x2_0000_0000;
        assert_eq!(
            aspace.add_region(&other),
            Err(Error::IdentityViolation {
                va: 0x2_0000_0000,
                pa: 0
            })
        );
        other.pa_start = other.va_start;
        aspace.add_region(&other).unwrap();
        assert_eq!(aspace.regions().len(), 2, "{} backend", backend);
    }
}

#[test]
fn moving_an_allocation_patches_its_escape() {
    let carat = Carat::boot(Config::default());
    let mut x = vec![0u8; 64];
    let mut y = vec![0u8; 64];
    x[5] = 0xaa;
    let (x, y) = (x.as_mut_ptr() as usize, y.as_mut_ptr() as usize);
    let mut slot: usize = x;

    carat.runtime().on_allocate(x, 64);
    carat
        .runtime()
        .on_escaping_store(&mut slot as *mut usize as usize, x);
    carat.engine().move_allocation(x, y).unwrap();

    assert_eq!(slot, y);
    assert_eq!(unsafe { *((y + 5) as *const u8) }, 0xaa);
    let entry = carat.runtime().find_allocation(y).unwrap();
    assert_eq!(entry.size, 64);
    assert!(entry.escapes.contains(&slot as *const usize as usize));
    assert!(carat.runtime().find_allocation(x).is_none());
}

#[test]
fn shrinking_defragment_is_rejected_before_allocating() {
    let (aspace, allocator) = counted_aspace(RegionBackend::BalancedTree);
    let region = Region::identity(0x10_0000, 0x1_0000, rw());
    aspace.add_region(&region).unwrap();

    let mut cur = region;
    assert_eq!(
        aspace.defragment_region(&mut cur, 0x8000),
        Err(Error::ShrinkRejected {
            current: 0x1_0000,
            requested: 0x8000
        })
    );
    assert_eq!(allocator.attempts.load(Ordering::Relaxed), 0);
    assert_eq!(cur, region);
    assert_eq!(aspace.regions(), vec![region]);
}

#[test]
fn pinned_region_cannot_be_defragmented_or_removed() {
    let (aspace, allocator) = counted_aspace(RegionBackend::SplayTree);
    let region = Region::identity(
        0x10_0000,
        0x1000,
        Protection::from_flags(Protection::READ | Protection::PIN),
    );
    aspace.add_region(&region).unwrap();
    let before = aspace.regions();

    let mut cur = region;
    assert_eq!(
        aspace.defragment_region(&mut cur, 0x2000),
        Err(Error::PinnedViolation(0x10_0000))
    );
    assert_eq!(
        aspace.remove_region(&region),
        Err(Error::PinnedViolation(0x10_0000))
    );
    assert_eq!(allocator.attempts.load(Ordering::Relaxed), 0);
    assert_eq!(aspace.regions(), before);
}

#[test]
fn defragment_packs_allocations_into_a_larger_region() {
    let (aspace, allocator) = counted_aspace(RegionBackend::List);
    let backing = MmapRegionAllocator::new();
    let src = backing.allocate(4096).unwrap();
    let region = Region::identity(src, 4096, rw());
    aspace.add_region(&region).unwrap();

    let runtime = aspace_runtime(&aspace);
    unsafe {
        std::ptr::write_bytes((src + 256) as *mut u8, 0x11, 24);
        std::ptr::write_bytes((src + 1024) as *mut u8, 0x22, 40);
    }
    runtime.register_allocation(src + 1024, 40);
    runtime.register_allocation(src + 256, 24);
    let mut slot: usize = src + 1024 + 8;
    runtime.record_escape(&mut slot as *mut usize as usize, slot);

    let mut cur = region;
    let free_start = aspace.defragment_region(&mut cur, 8192).unwrap();
    let start = cur.va_start;

    assert_eq!(allocator.attempts.load(Ordering::Relaxed), 1);
    assert_eq!(cur.len_bytes, 8192);
    assert!(cur.is_identity());
    assert_eq!(free_start, start + 64);
    assert_eq!(slot, start + 24 + 8);
    assert_eq!(aspace.regions(), vec![cur]);
    unsafe {
        assert_eq!(*(start as *const u8), 0x11);
        assert_eq!(*((start + 24) as *const u8), 0x22);
        assert_eq!(*((start + 63) as *const u8), 0x22);
    }
    assert_eq!(runtime.find_allocation(start).unwrap().size, 24);
    assert_eq!(runtime.find_allocation(start + 24).unwrap().size, 40);
    assert!(runtime.find_allocation(src + 256).is_none());
}

#[test]
fn aspace_move_region_relocates_contents() {
    let carat = Carat::boot(Config::default());
    let aspace = carat.create_aspace("move");
    let backing = MmapRegionAllocator::new();
    let (src, dst) = (
        backing.allocate(4096).unwrap(),
        backing.allocate(4096).unwrap(),
    );
    let cur = Region::identity(src, 4096, rw());
    aspace.add_region(&cur).unwrap();
    aspace.request_permission(src, false).unwrap();

    unsafe { *((src + 128) as *mut u64) = 99 };
    carat.runtime().register_allocation(src + 128, 16);
    let mut slot: usize = src + 128;
    carat
        .runtime()
        .record_escape(&mut slot as *mut usize as usize, slot);

    let new = Region::identity(dst, 4096, Protection::from_flags(Protection::READ));
    assert_eq!(
        aspace.move_region(&cur, &Region::identity(dst, 2048, rw())),
        Err(Error::LengthMismatch {
            current: 4096,
            requested: 2048
        })
    );
    aspace.move_region(&cur, &new).unwrap();

    let moved = aspace.find_region(dst).unwrap();
    assert_eq!(moved.protection, rw());
    assert!(aspace.find_region(src).is_none());
    assert_eq!(slot, dst);
    assert_eq!(unsafe { *(dst as *const u64) }, 99);
}

#[test]
fn registers_of_suspended_threads_are_patched() {
    let carat = Carat::boot(Config::default());
    let mut x = vec![0u64; 4];
    let mut y = vec![0u64; 4];
    let (x, y) = (x.as_mut_ptr() as usize, y.as_mut_ptr() as usize);
    carat.runtime().on_allocate(x, 32);

    let worker = carat.safepoint().attach("worker");
    worker.store(Register::Rbx, x + 8);
    worker.store(Register::R12, x + 31);
    worker.store(Register::Rip, x);
    worker.store(Register::Rdi, x + 32);

    let done = Arc::new(AtomicBool::new(false));
    let handle = {
        let worker = worker.clone();
        let done = done.clone();
        std::thread::spawn(move || {
            while !done.load(Ordering::Acquire) {
                worker.safepoint();
                std::thread::yield_now();
            }
        })
    };

    let report = carat.engine().move_allocation(x, y).unwrap();
    done.store(true, Ordering::Release);
    handle.join().unwrap();

    assert_eq!(report.registers_patched, 2);
    assert_eq!(worker.load(Register::Rbx), y + 8);
    assert_eq!(worker.load(Register::R12), y + 31);
    assert_eq!(worker.load(Register::Rip), x);
    assert_eq!(worker.load(Register::Rdi), x + 32);
    assert!(carat.safepoint().detach(&worker));
}

#[test]
fn batch_moves_share_one_barrier() {
    let carat = Carat::boot(Config::default());
    let mut a = vec![1u8; 16];
    let mut b = vec![2u8; 48];
    let mut a2 = vec![0u8; 16];
    let mut b2 = vec![0u8; 48];
    let (a, b) = (a.as_mut_ptr() as usize, b.as_mut_ptr() as usize);
    let (a2, b2) = (a2.as_mut_ptr() as usize, b2.as_mut_ptr() as usize);
    let runtime = carat.runtime();
    runtime.on_allocate(a, 16);
    runtime.on_allocate(b, 48);
    let mut slots = [a + 4, b + 47];
    runtime.on_escaping_store(&mut slots[0] as *mut usize as usize, a + 4);
    runtime.on_escaping_store(&mut slots[1] as *mut usize as usize, b + 47);

    assert_eq!(
        carat.engine().move_allocations(&[(a, a2), (0x10, 0x20)]),
        Err(Error::LookupFailure(0x10))
    );
    assert_eq!(slots, [a + 4, b + 47]);

    let report = carat.engine().move_allocations(&[(a, a2), (b, b2)]).unwrap();
    assert_eq!(report.allocations, 2);
    assert_eq!(report.bytes, 64);
    assert_eq!(slots, [a2 + 4, b2 + 47]);
    let stats = runtime.statistics();
    assert_eq!(stats.moves, 1);
    assert_eq!(stats.allocations_moved, 2);
    assert_eq!(stats.escapes_patched, 2);
}

#[test]
fn defragmenting_the_table_rehomes_malloc_memory() {
    let carat = Carat::boot(Config::default());
    let runtime = carat.runtime();
    let mut slots = [0usize; 3];
    for (i, slot) in slots.iter_mut().enumerate() {
        let size = 16 * (i + 1);
        let base = MallocAllocator.allocate(size).unwrap();
        unsafe { std::ptr::write_bytes(base as *mut u8, i as u8 + 1, size) };
        runtime.on_allocate(base, size);
        *slot = base + size - 1;
        runtime.on_escaping_store(slot as *mut usize as usize, *slot);
    }
    let old: Vec<usize> = runtime.lock_map().iter().map(|e| e.base).collect();

    let report = carat
        .engine()
        .defragment_allocations(&MallocAllocator, true)
        .unwrap();
    assert_eq!(report.allocations, 3);
    assert_eq!(report.escapes_patched, 3);
    for (i, slot) in slots.iter().enumerate() {
        assert!(!old.contains(&(slot + 1 - 16 * (i + 1))));
        let entry = runtime.find_allocation_containing(*slot).unwrap();
        assert_eq!(entry.size, 16 * (i + 1));
        assert_eq!(unsafe { *(*slot as *const u8) }, i as u8 + 1);
        runtime.on_deallocate(entry.base);
        MallocAllocator.release(entry.base);
    }
}

#[test]
fn concurrent_producers_lose_no_escapes() {
    let carat = Carat::boot(Config::default());
    let runtime = carat.runtime().clone();
    runtime.register_allocation(0x10_0000, 0x1000);

    let producers: Vec<_> = (0..4)
        .map(|t| {
            let runtime = runtime.clone();
            std::thread::spawn(move || {
                for i in 0..1000 {
                    let slot = 0x100_0000 + (t * 1000 + i) * 8;
                    runtime.on_escaping_store(slot, 0x10_0000 + i % 0x1000);
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    let report = runtime.drain_escape_window();
    assert_eq!(report.merged, 4000);
    assert_eq!(runtime.find_allocation(0x10_0000).unwrap().escapes.len(), 4000);
    assert_eq!(runtime.statistics().escapes_recorded, 4000);
}

#[test]
fn c_api_round_trip() {
    let carat = c_api::carat_boot();
    let runtime = c_api::carat_runtime(carat);
    let engine = c_api::carat_engine(carat);
    assert!(!runtime.is_null() && !engine.is_null());

    let mut x = vec![3u64; 4];
    let mut y = vec![0u64; 4];
    let (x, y) = (x.as_mut_ptr() as *mut u8, y.as_mut_ptr() as *mut u8);
    let mut slot: *mut u8 = x;
    c_api::carat_on_allocate(runtime, x, 32);
    c_api::carat_on_escaping_store(runtime, &mut slot, x);
    assert_eq!(c_api::carat_drain_escape_window(runtime), 1);

    assert_eq!(c_api::carat_move_allocation(engine, x, y), 0);
    assert_eq!(slot, y);
    assert_eq!(c_api::carat_move_allocation(engine, x, y), -1);
    assert_eq!(
        c_api::carat_move_allocation(std::ptr::null(), x, y),
        c_api::CARAT_INVALID_HANDLE
    );

    let mut free_end: *mut u8 = std::ptr::null_mut();
    let mut z = vec![0u64; 8];
    let z = z.as_mut_ptr() as *mut u8;
    assert_eq!(c_api::carat_move_region(engine, y, z, 32, &mut free_end), 0);
    assert_eq!(free_end, unsafe { z.add(32) });
    assert_eq!(slot, z);

    c_api::carat_on_deallocate(runtime, z);
    c_api::carat_shutdown(carat);
}

#[test]
fn region_moves_let_threads_waiting_on_the_aspace_reach_a_safepoint() {
    let carat = Carat::boot(Config::default());
    let aspace = carat.create_aspace("contended");
    let backing = MmapRegionAllocator::new();
    let ends = [
        backing.allocate(4096).unwrap(),
        backing.allocate(4096).unwrap(),
    ];
    aspace.add_region(&Region::identity(ends[0], 4096, rw())).unwrap();
    carat.runtime().register_allocation(ends[0] + 64, 32);

    let worker = carat.safepoint().attach("requester");
    let done = Arc::new(AtomicBool::new(false));
    let handle = {
        let (aspace, worker, done) = (aspace.clone(), worker.clone(), done.clone());
        std::thread::spawn(move || {
            let mut i = 0;
            while !done.load(Ordering::Acquire) {
                let _ = aspace.request_permission(ends[i % 2], false);
                worker.safepoint();
                i += 1;
            }
        })
    };

    for round in 0..20 {
        let (from, to) = (ends[round % 2], ends[(round + 1) % 2]);
        aspace
            .move_region(
                &Region::identity(from, 4096, rw()),
                &Region::identity(to, 4096, rw()),
            )
            .unwrap();
    }
    done.store(true, Ordering::Release);
    handle.join().unwrap();

    assert_eq!(aspace.regions().len(), 1);
    assert!(aspace.find_region(ends[0]).is_some());
    assert_eq!(carat.runtime().find_allocation(ends[0] + 64).unwrap().size, 32);
    assert_eq!(carat.runtime().statistics().barrier_failures, 0);
    assert!(carat.safepoint().detach(&worker));
}

#[test]
fn c_api_tracks_globals() {
    let carat = c_api::carat_boot();
    let runtime = c_api::carat_runtime(carat);
    let mut global = [0u64; 2];
    let address = global.as_mut_ptr() as *mut u8;
    c_api::carat_on_global(runtime, address, 16, 42);
    c_api::carat_on_global(std::ptr::null(), address, 16, 43);

    let runtime = unsafe { &*runtime };
    assert_eq!(runtime.find_allocation(address as usize).unwrap().size, 16);
    assert_eq!(runtime.statistics().globals_registered, 1);
    c_api::carat_shutdown(carat);
}

fn aspace_runtime(aspace: &CaratAspace) -> Arc<CaratRuntime> {
    aspace.engine().runtime().clone()
}
