//! Backing memory for relocation targets.
use std::collections::BTreeMap;

use memmap2::MmapMut;
use parking_lot::Mutex;

/// Source of fresh memory for defragmentation and table-wide moves.
pub trait RegionAllocator: Send + Sync {
    /// Returns the start of `len` writable bytes, or `None` if none are left.
    fn allocate(&self, len: usize) -> Option<usize>;
    /// Hands back memory obtained from `allocate`.
    fn release(&self, address: usize);
}

/// Anonymous private mappings, one per request. The mapping stays alive until
/// it is released or the allocator is dropped.
#[derive(Default)]
pub struct MmapRegionAllocator {
    mappings: Mutex<BTreeMap<usize, MmapMut>>,
}

impl MmapRegionAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mapped_bytes(&self) -> usize {
        self.mappings.lock().values().map(|m| m.len()).sum()
    }
}

impl RegionAllocator for MmapRegionAllocator {
    fn allocate(&self, len: usize) -> Option<usize> {
        if len == 0 {
            return None;
        }
        match MmapMut::map_anon(len) {
            Ok(mut map) => {
                let address = map.as_mut_ptr() as usize;
                self.mappings.lock().insert(address, map);
                Some(address)
            }
            Err(e) => {
                log::debug!("carat: mmap of {:#x} bytes failed: {}", len, e);
                None
            }
        }
    }

    fn release(&self, address: usize) {
        if self.mappings.lock().remove(&address).is_none() {
            log::warn!("carat: release of unknown mapping {:#x}", address);
        }
    }
}

/// The C heap. Used where the moved memory must look like any other
/// `malloc`'d object.
#[derive(Default, Clone, Copy)]
pub struct MallocAllocator;

impl RegionAllocator for MallocAllocator {
    fn allocate(&self, len: usize) -> Option<usize> {
        if len == 0 {
            return None;
        }
        let ptr = unsafe { libc::malloc(len) };
        if ptr.is_null() {
            None
        } else {
            Some(ptr as usize)
        }
    }

    fn release(&self, address: usize) {
        unsafe { libc::free(address as *mut libc::c_void) }
    }
}
