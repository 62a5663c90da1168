//! Address spaces backed by the relocation runtime.
//!
//! A CARAT address space is identity mapped: every region has `va == pa` and
//! protection is enforced in software against the region set rather than by
//! page tables. Moving or defragmenting a region goes through the
//! [`RelocationEngine`], which patches every pointer into the moved bytes.
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::{
    error::{Error, Result},
    mmap::RegionAllocator,
    mutator::{ContextId, MutatorContext},
    region::{MatchFlags, Protection, Region, RequestedPermission},
    region_tracker::{create_tracker, Overlap, RegionBackend, RegionTracker},
    relocation::RelocationEngine,
    statistics::Counters,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Characteristics {
    pub granularity: usize,
    pub alignment: usize,
}

/// Exception vectors delivered to an address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExceptionVector {
    GeneralProtection,
    PageFault,
    Other(u8),
}

impl ExceptionVector {
    pub const GP: u8 = 13;
    pub const PF: u8 = 14;

    pub fn from_vector(vector: u8) -> Self {
        match vector {
            Self::GP => ExceptionVector::GeneralProtection,
            Self::PF => ExceptionVector::PageFault,
            other => ExceptionVector::Other(other),
        }
    }
}

/// Operations every address-space implementation provides.
pub trait AddressSpace: Send + Sync {
    fn name(&self) -> &str;
    fn characteristics(&self) -> Characteristics;
    /// Tears down the region set and thread associations. Panics if the
    /// address space is in use.
    fn destroy(&self);
    fn add_thread(&self, thread: ContextId) -> Result<()>;
    fn remove_thread(&self, thread: ContextId) -> Result<()>;
    fn add_region(&self, region: &Region) -> Result<()>;
    fn remove_region(&self, region: &Region) -> Result<()>;
    fn protect_region(&self, region: &Region, protection: Protection) -> Result<()>;
    fn protection_check(&self, region: &Region) -> Result<()>;
    fn request_permission(&self, address: usize, is_write: bool) -> Result<()>;
    fn move_region(&self, cur: &Region, new: &Region) -> Result<()>;
    /// Moves `cur` into a fresh region of `new_size` bytes, packing its
    /// allocations at the front. Updates `cur` and returns the first free
    /// byte of the new region.
    fn defragment_region(&self, cur: &mut Region, new_size: usize) -> Result<usize>;
    fn switch_from(&self, thread: ContextId) -> Result<()>;
    fn switch_to(&self, thread: ContextId) -> Result<()>;
    fn exception(&self, vector: ExceptionVector) -> Result<()>;
    fn print(&self, detailed: bool) -> String;
}

/// A kind of address space that can be instantiated by name.
pub trait AddressSpaceImpl: Send + Sync {
    fn impl_name(&self) -> &'static str;
    fn get_characteristics(&self) -> Characteristics;
    fn create(&self, name: &str, characteristics: Characteristics) -> Arc<dyn AddressSpace>;
}

pub struct CaratImpl {
    engine: Arc<RelocationEngine>,
    backend: RegionBackend,
    allocator: Arc<dyn RegionAllocator>,
}

impl CaratImpl {
    pub fn new(
        engine: Arc<RelocationEngine>,
        backend: RegionBackend,
        allocator: Arc<dyn RegionAllocator>,
    ) -> Self {
        Self {
            engine,
            backend,
            allocator,
        }
    }

    pub fn create_aspace(&self, name: &str, characteristics: Characteristics) -> Arc<CaratAspace> {
        Arc::new(CaratAspace::new(
            name,
            characteristics,
            self.backend,
            self.engine.clone(),
            self.allocator.clone(),
        ))
    }
}

impl AddressSpaceImpl for CaratImpl {
    fn impl_name(&self) -> &'static str {
        "carat"
    }

    fn get_characteristics(&self) -> Characteristics {
        Characteristics {
            granularity: 0,
            alignment: 0,
        }
    }

    fn create(&self, name: &str, characteristics: Characteristics) -> Arc<dyn AddressSpace> {
        self.create_aspace(name, characteristics)
    }
}

struct AspaceState {
    tracker: Box<dyn RegionTracker>,
    threads: Vec<ContextId>,
    /// Destination of a region move that runs with the lock released.
    in_flight: Option<Region>,
}

impl AspaceState {
    /// Starts a region move. Only one may be in flight per address space.
    fn begin_move(&mut self, destination: Region) -> Result<()> {
        if self.in_flight.is_some() {
            return Err(Error::BarrierFailure);
        }
        self.in_flight = Some(destination);
        Ok(())
    }

    /// Re-keys the region moved from `tracked` to `va`. Protection and latched
    /// access are taken from the tracker, since both may have changed while
    /// the move ran. Returns `None` if the region was removed meanwhile.
    fn finish_move(&mut self, tracked: &Region, va: usize, len: usize) -> Option<Region> {
        let current = self
            .tracker
            .remove(tracked, MatchFlags::all().with_protect(false))?;
        let moved = Region {
            va_start: va,
            pa_start: va,
            len_bytes: len,
            protection: current.protection,
            requested: current.requested,
        };
        self.tracker.insert(moved);
        Some(moved)
    }
}

pub struct CaratAspace {
    name: String,
    characteristics: Characteristics,
    state: Mutex<AspaceState>,
    engine: Arc<RelocationEngine>,
    allocator: Arc<dyn RegionAllocator>,
}

fn check_identity(region: &Region) -> Result<()> {
    if region.is_identity() {
        Ok(())
    } else {
        Err(Error::IdentityViolation {
            va: region.va_start,
            pa: region.pa_start,
        })
    }
}

fn overlap_error(region: &Region, existing: &Region) -> Error {
    Error::OverlapViolation {
        va: region.va_start,
        len: region.len_bytes,
        existing_va: existing.va_start,
        existing_len: existing.len_bytes,
    }
}

impl CaratAspace {
    pub fn new(
        name: &str,
        characteristics: Characteristics,
        backend: RegionBackend,
        engine: Arc<RelocationEngine>,
        allocator: Arc<dyn RegionAllocator>,
    ) -> Self {
        log::debug!(
            "aspace-carat: created {} ({} region tracker)",
            name,
            backend
        );
        Self {
            name: name.to_owned(),
            characteristics,
            state: Mutex::new(AspaceState {
                tracker: create_tracker(backend),
                threads: Vec::new(),
                in_flight: None,
            }),
            engine,
            allocator,
        }
    }

    pub fn engine(&self) -> &Arc<RelocationEngine> {
        &self.engine
    }

    pub fn backend(&self) -> RegionBackend {
        self.state.lock().tracker.backend()
    }

    pub fn regions(&self) -> Vec<Region> {
        self.state.lock().tracker.regions()
    }

    pub fn find_region(&self, address: usize) -> Option<Region> {
        self.state.lock().tracker.find_region_at(address).copied()
    }

    pub fn threads(&self) -> Vec<ContextId> {
        self.state.lock().threads.clone()
    }

    /// Clears the access latched by `request_permission` on the region
    /// governing `address`.
    pub fn release_permission(&self, address: usize) -> Result<()> {
        let mut state = self.state.lock();
        let region = state
            .tracker
            .find_region_at(address)
            .ok_or(Error::RegionNotFound(address))?;
        region.requested = RequestedPermission::None;
        Ok(())
    }

    /// Like `request_permission`, but an illegal access is fatal.
    pub fn guard_address(&self, address: usize, is_write: bool) {
        let counters = &self.engine.runtime().counters;
        Counters::bump(&counters.guard_address_calls, 1);
        let started = Instant::now();
        let result = self.request_permission(address, is_write);
        Counters::bump(
            &counters.request_permission_nanos,
            started.elapsed().as_nanos() as usize,
        );
        if let Err(e) = result {
            log::error!(
                "aspace-carat: illegal {} access to {:#x} in {}: {}",
                RequestedPermission::for_access(is_write).name(),
                address,
                self.name,
                e
            );
            panic!("illegal access to {:#x}: {}", address, e);
        }
    }

    /// Panics if a callee frame of `frame_size` bytes would not fit on the
    /// stack of `context`.
    pub fn guard_callee_stack(&self, context: &MutatorContext, frame_size: usize) {
        Counters::bump(&self.engine.runtime().counters.guard_stack_calls, 1);
        if let Err(e) = context.check_callee_stack(frame_size) {
            log::error!(
                "aspace-carat: thread {} in {}: {}",
                context.name(),
                self.name,
                e
            );
            panic!("stack of thread {} has grown outside of valid memory: {}", context.name(), e);
        }
    }

    /// Pins the region governing `address` so it can no longer be removed,
    /// moved or defragmented.
    pub fn pin_pointer(&self, address: usize) -> Result<()> {
        let mut state = self.state.lock();
        let region = state
            .tracker
            .find_region_at(address)
            .ok_or(Error::RegionNotFound(address))?;
        region.protection.set_pin(true);
        log::debug!("aspace-carat: pinned {}", region);
        Ok(())
    }

    /// Pins the region governing the pointer stored at `slot`.
    ///
    /// # Safety
    /// `slot` must be readable and hold a pointer-sized value.
    pub unsafe fn pin_escaped_pointer(&self, slot: usize) -> Result<()> {
        let pointer = std::ptr::read_unaligned(slot as *const usize);
        self.pin_pointer(pointer)
    }
}

impl AddressSpace for CaratAspace {
    fn name(&self) -> &str {
        &self.name
    }

    fn characteristics(&self) -> Characteristics {
        self.characteristics
    }

    fn destroy(&self) {
        let Some(mut state) = self.state.try_lock() else {
            log::error!("aspace-carat: destroying {} while it is locked", self.name);
            panic!("address space {} destroyed while in use", self.name);
        };
        if !self.engine.is_idle() || state.in_flight.is_some() {
            log::error!(
                "aspace-carat: destroying {} during a relocation ({:?})",
                self.name,
                self.engine.state()
            );
            panic!("address space {} destroyed during a relocation", self.name);
        }
        log::debug!(
            "aspace-carat: destroying {} ({} regions, {} threads)",
            self.name,
            state.tracker.len(),
            state.threads.len()
        );
        state.tracker.clear();
        state.threads.clear();
    }

    fn add_thread(&self, thread: ContextId) -> Result<()> {
        let mut state = self.state.lock();
        if !state.threads.contains(&thread) {
            state.threads.push(thread);
        }
        log::debug!("aspace-carat: adding thread {} to {}", thread, self.name);
        Ok(())
    }

    fn remove_thread(&self, thread: ContextId) -> Result<()> {
        let mut state = self.state.lock();
        let position = state
            .threads
            .iter()
            .position(|t| *t == thread)
            .ok_or(Error::UnknownThread(thread.0))?;
        state.threads.remove(position);
        log::debug!("aspace-carat: removing thread {} from {}", thread, self.name);
        Ok(())
    }

    fn add_region(&self, region: &Region) -> Result<()> {
        log::debug!("aspace-carat: adding region {} to {}", region, self.name);
        if region.len_bytes == 0 {
            return Err(Error::ZeroLengthRegion(region.va_start));
        }
        check_identity(region)?;
        let mut state = self.state.lock();
        if let Some(existing) = state.tracker.check_overlap(region).region() {
            log::debug!("aspace-carat: {} overlaps {}", region, existing);
            return Err(overlap_error(region, existing));
        }
        if let Some(destination) = state.in_flight.filter(|d| d.intersects(region)) {
            return Err(overlap_error(region, &destination));
        }
        let mut tracked = *region;
        tracked.requested = RequestedPermission::None;
        state.tracker.insert(tracked);
        Ok(())
    }

    fn remove_region(&self, region: &Region) -> Result<()> {
        log::debug!("aspace-carat: removing region {} from {}", region, self.name);
        check_identity(region)?;
        if region.is_pinned() {
            return Err(Error::PinnedViolation(region.va_start));
        }
        let mut state = self.state.lock();
        let pinned = state
            .tracker
            .contains(region, MatchFlags::all().with_protect(false))
            .map_or(false, |tracked| tracked.is_pinned());
        if pinned {
            return Err(Error::PinnedViolation(region.va_start));
        }
        state
            .tracker
            .remove(region, MatchFlags::all())
            .map(|_| ())
            .ok_or(Error::RegionNotFound(region.va_start))
    }

    fn protect_region(&self, region: &Region, protection: Protection) -> Result<()> {
        let mut state = self.state.lock();
        let flags = MatchFlags::all().with_protect(false);
        let tracked = state
            .tracker
            .contains(region, flags)
            .ok_or(Error::RegionNotFound(region.va_start))?;
        if !protection.allows(tracked.requested) {
            let violation = Error::PermissionViolation {
                va: tracked.va_start,
                latched: tracked.requested.name(),
            };
            log::error!(
                "aspace-carat: protecting {} as {} in {}: {}",
                tracked,
                protection,
                self.name,
                violation
            );
            panic!("{}", violation);
        }
        tracked.protection = protection;
        Ok(())
    }

    fn protection_check(&self, region: &Region) -> Result<()> {
        check_identity(region)?;
        let mut state = self.state.lock();
        match state.tracker.check_overlap(region) {
            Overlap::Contained(tracked) if region.protection.leq(tracked.protection) => {
                log::debug!("aspace-carat: {} allowed, contained by {}", region, tracked);
                Ok(())
            }
            Overlap::Contained(tracked) => {
                log::debug!("aspace-carat: {} exceeds permissions of {}", region, tracked);
                Err(Error::AccessDenied(region.va_start))
            }
            Overlap::Partial(_) | Overlap::None => Err(Error::NotMapped {
                va: region.va_start,
                len: region.len_bytes,
            }),
        }
    }

    fn request_permission(&self, address: usize, is_write: bool) -> Result<()> {
        let access = RequestedPermission::for_access(is_write);
        let mut state = self.state.lock();
        let region = state
            .tracker
            .find_region_at(address)
            .ok_or(Error::RegionNotFound(address))?;
        if !region.protection.allows(access) {
            return Err(Error::AccessDenied(address));
        }
        region.requested = region.requested.max(access);
        Ok(())
    }

    fn move_region(&self, cur: &Region, new: &Region) -> Result<()> {
        check_identity(cur)?;
        check_identity(new)?;
        if cur.len_bytes != new.len_bytes {
            return Err(Error::LengthMismatch {
                current: cur.len_bytes,
                requested: new.len_bytes,
            });
        }
        let tracked = {
            let mut state = self.state.lock();
            let tracked = *state
                .tracker
                .contains(cur, MatchFlags::all())
                .ok_or(Error::RegionNotFound(cur.va_start))?;
            if tracked.is_pinned() {
                return Err(Error::PinnedViolation(tracked.va_start));
            }
            if let Some(other) = state
                .tracker
                .regions()
                .iter()
                .find(|r| r.va_start != tracked.va_start && r.intersects(new))
            {
                return Err(overlap_error(new, other));
            }
            state.begin_move(*new)?;
            tracked
        };

        // Threads blocked on this address space have to reach their
        // safepoint, so the world is stopped without the lock held.
        let result = self
            .engine
            .move_region(cur.va_start, new.va_start, cur.len_bytes);

        let mut state = self.state.lock();
        state.in_flight = None;
        result?;
        match state.finish_move(&tracked, new.va_start, new.len_bytes) {
            Some(moved) => log::debug!("aspace-carat: moved {} to {}", tracked, moved),
            None => log::warn!("aspace-carat: {} was removed while it was moved", tracked),
        }
        Ok(())
    }

    fn defragment_region(&self, cur: &mut Region, new_size: usize) -> Result<usize> {
        log::debug!(
            "aspace-carat: defragmentation initialized - ({:#x},{:#x}) -> {:#x}",
            cur.va_start,
            cur.len_bytes,
            new_size
        );
        check_identity(cur)?;
        let (tracked, start) = {
            let mut state = self.state.lock();
            let tracked = *state
                .tracker
                .contains(cur, MatchFlags::all())
                .ok_or(Error::RegionNotFound(cur.va_start))?;
            if tracked.is_pinned() {
                return Err(Error::PinnedViolation(tracked.va_start));
            }
            if new_size < tracked.len_bytes {
                return Err(Error::ShrinkRejected {
                    current: tracked.len_bytes,
                    requested: new_size,
                });
            }
            if state.in_flight.is_some() {
                return Err(Error::BarrierFailure);
            }

            let start = self
                .allocator
                .allocate(new_size)
                .ok_or(Error::AllocationFailure(new_size))?;
            let destination = Region::identity(start, new_size, tracked.protection);
            if let Some(existing) = state.tracker.check_overlap(&destination).region() {
                let error = overlap_error(&destination, existing);
                self.allocator.release(start);
                return Err(error);
            }
            state.begin_move(destination)?;
            (tracked, start)
        };

        let result = self
            .engine
            .move_region(tracked.va_start, start, tracked.len_bytes);

        let mut state = self.state.lock();
        state.in_flight = None;
        let free_start = match result {
            Ok(free_start) => free_start,
            Err(e) => {
                self.allocator.release(start);
                return Err(e);
            }
        };
        let new_region = match state.finish_move(&tracked, start, new_size) {
            Some(moved) => moved,
            None => {
                log::warn!("aspace-carat: {} was removed while it was defragmented", tracked);
                Region::identity(start, new_size, tracked.protection)
            }
        };
        log::debug!(
            "aspace-carat: defragmented {} into {}, free from {:#x}",
            tracked,
            new_region,
            free_start
        );
        *cur = new_region;
        Ok(free_start)
    }

    fn switch_from(&self, thread: ContextId) -> Result<()> {
        log::debug!("aspace-carat: switching out {} from thread {}", self.name, thread);
        Ok(())
    }

    fn switch_to(&self, thread: ContextId) -> Result<()> {
        log::debug!("aspace-carat: switching in {} for thread {}", self.name, thread);
        Ok(())
    }

    fn exception(&self, vector: ExceptionVector) -> Result<()> {
        match vector {
            ExceptionVector::GeneralProtection => {
                log::error!("aspace-carat: general protection fault in {}", self.name);
                panic!("general protection fault delivered to {}", self.name);
            }
            ExceptionVector::Other(v) => {
                log::error!("aspace-carat: unknown exception {} delivered to {}", v, self.name);
                panic!("unknown exception {} delivered to {}", v, self.name);
            }
            ExceptionVector::PageFault => {
                let _state = self.state.lock();
                Ok(())
            }
        }
    }

    fn print(&self, detailed: bool) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{}: carat address space [granularity {:#x} alignment {:#x}]",
            self.name, self.characteristics.granularity, self.characteristics.alignment
        );
        if detailed {
            let state = self.state.lock();
            let _ = writeln!(
                out,
                "  {} regions ({} tracker), {} threads",
                state.tracker.len(),
                state.tracker.backend(),
                state.threads.len()
            );
            for region in state.tracker.regions() {
                let _ = writeln!(out, "  {} {}", region, region.protection);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mmap::MmapRegionAllocator, mutator::Register, runtime::CaratRuntime,
        safepoint::GlobalSafepoint, Config,
    };
    use std::time::Duration;

    const GIB4: usize = 0x1_0000_0000;

    fn aspace(backend: RegionBackend) -> Arc<CaratAspace> {
        let runtime = Arc::new(CaratRuntime::new(Config::default()));
        runtime.init();
        let world = Arc::new(GlobalSafepoint::new(Some(Duration::from_millis(50))));
        let engine = Arc::new(RelocationEngine::new(runtime, world));
        CaratImpl::new(engine, backend, Arc::new(MmapRegionAllocator::new()))
            .create_aspace("test", Characteristics::default())
    }

    fn prot(flags: u8) -> Protection {
        Protection::from_flags(flags)
    }

    #[test]
    fn request_permission_latches_strongest_access() {
        let aspace = aspace(RegionBackend::BalancedTree);
        let rw = prot(Protection::READ | Protection::WRITE);
        aspace.add_region(&Region::identity(0x1000, 0x1000, rw)).unwrap();
        aspace.request_permission(0x1800, true).unwrap();
        aspace.request_permission(0x1800, false).unwrap();
        assert_eq!(
            aspace.find_region(0x1000).unwrap().requested,
            RequestedPermission::Write
        );
        aspace.release_permission(0x1000).unwrap();
        assert_eq!(
            aspace.find_region(0x1000).unwrap().requested,
            RequestedPermission::None
        );
    }

    #[test]
    fn request_permission_denies_write_to_read_only() {
        let aspace = aspace(RegionBackend::List);
        aspace
            .add_region(&Region::identity(0x1000, 0x1000, prot(Protection::READ)))
            .unwrap();
        assert_eq!(
            aspace.request_permission(0x1000, true),
            Err(Error::AccessDenied(0x1000))
        );
        assert_eq!(
            aspace.request_permission(0x9000, false),
            Err(Error::RegionNotFound(0x9000))
        );
    }

    #[test]
    fn protect_region_keeps_latched_reads_valid() {
        let aspace = aspace(RegionBackend::SplayTree);
        let region = Region::identity(0x1000, 0x1000, prot(Protection::READ | Protection::WRITE));
        aspace.add_region(&region).unwrap();
        aspace.request_permission(0x1000, false).unwrap();
        aspace
            .protect_region(&region, prot(Protection::READ))
            .unwrap();
        assert_eq!(
            aspace.find_region(0x1000).unwrap().protection,
            prot(Protection::READ)
        );
    }

    #[test]
    #[should_panic]
    fn protect_region_revoking_latched_write_panics() {
        let aspace = aspace(RegionBackend::BalancedTree);
        let region = Region::identity(0x1000, 0x1000, prot(Protection::READ | Protection::WRITE));
        aspace.add_region(&region).unwrap();
        aspace.request_permission(0x1000, true).unwrap();
        let _ = aspace.protect_region(&region, prot(Protection::READ));
    }

    #[test]
    #[should_panic]
    fn guard_address_panics_on_illegal_access() {
        let aspace = aspace(RegionBackend::BalancedTree);
        aspace
            .add_region(&Region::identity(0x1000, 0x1000, prot(Protection::READ)))
            .unwrap();
        aspace.guard_address(0x1000, true);
    }

    #[test]
    fn guards_are_profiled() {
        let aspace = aspace(RegionBackend::List);
        aspace
            .add_region(&Region::identity(0x1000, 0x1000, prot(Protection::READ | Protection::WRITE)))
            .unwrap();
        for i in 0..10 {
            aspace.guard_address(0x1000 + i * 8, i % 2 == 0);
        }
        let context = GlobalSafepoint::new(None).attach("guarded");
        context.set_stack(0x7000, 0x1000);
        context.store(Register::Rsp, 0x7800);
        aspace.guard_callee_stack(&context, 0x100);

        let stats = aspace.engine().runtime().statistics();
        assert_eq!(stats.guard_address_calls, 10);
        assert_eq!(stats.guard_stack_calls, 1);
        assert!(stats.average_request_permission_nanos().is_some());
    }

    #[test]
    #[should_panic(expected = "outside of valid memory")]
    fn guard_callee_stack_panics_past_the_stack_end() {
        let aspace = aspace(RegionBackend::SplayTree);
        let context = GlobalSafepoint::new(None).attach("deep");
        context.set_stack(0x7000, 0x1000);
        context.store(Register::Rsp, 0x7f00);
        aspace.guard_callee_stack(&context, 0x200);
    }

    #[test]
    fn pin_pointer_blocks_removal() {
        let aspace = aspace(RegionBackend::List);
        let region = Region::identity(0x1000, 0x1000, prot(Protection::READ));
        aspace.add_region(&region).unwrap();
        aspace.pin_pointer(0x1010).unwrap();
        let pinned = aspace.find_region(0x1000).unwrap();
        assert!(pinned.is_pinned());
        assert_eq!(
            aspace.remove_region(&pinned),
            Err(Error::PinnedViolation(0x1000))
        );
        let slot: usize = 0x1020;
        unsafe {
            aspace
                .pin_escaped_pointer(&slot as *const usize as usize)
                .unwrap()
        };
    }

    #[test]
    fn remove_requires_exact_match() {
        let aspace = aspace(RegionBackend::BalancedTree);
        let region = Region::identity(0x1000, 0x1000, prot(Protection::READ));
        aspace.add_region(&region).unwrap();
        let mut other = region;
        other.protection = prot(Protection::WRITE);
        assert_eq!(
            aspace.remove_region(&other),
            Err(Error::RegionNotFound(0x1000))
        );
        aspace.remove_region(&region).unwrap();
        assert!(aspace.regions().is_empty());
    }

    #[test]
    fn zero_length_region_is_rejected() {
        let aspace = aspace(RegionBackend::BalancedTree);
        assert_eq!(
            aspace.add_region(&Region::identity(0x1000, 0, Protection::new())),
            Err(Error::ZeroLengthRegion(0x1000))
        );
    }

    #[test]
    fn threads_are_tracked() {
        let aspace = aspace(RegionBackend::BalancedTree);
        aspace.add_thread(ContextId(1)).unwrap();
        aspace.add_thread(ContextId(1)).unwrap();
        assert_eq!(aspace.threads(), vec![ContextId(1)]);
        assert_eq!(
            aspace.remove_thread(ContextId(2)),
            Err(Error::UnknownThread(2))
        );
        aspace.remove_thread(ContextId(1)).unwrap();
        aspace.switch_to(ContextId(1)).unwrap();
        aspace.switch_from(ContextId(1)).unwrap();
    }

    #[test]
    fn page_fault_is_accepted() {
        let aspace = aspace(RegionBackend::BalancedTree);
        aspace.exception(ExceptionVector::PageFault).unwrap();
        assert_eq!(
            ExceptionVector::from_vector(13),
            ExceptionVector::GeneralProtection
        );
    }

    #[test]
    #[should_panic]
    fn general_protection_fault_panics() {
        let aspace = aspace(RegionBackend::BalancedTree);
        let _ = aspace.exception(ExceptionVector::GeneralProtection);
    }

    #[test]
    fn print_lists_regions_when_detailed() {
        let aspace = aspace(RegionBackend::SplayTree);
        aspace
            .add_region(&Region::identity(GIB4, GIB4, prot(Protection::READ)))
            .unwrap();
        let brief = aspace.print(false);
        assert!(brief.starts_with("test: carat address space"));
        let detailed = aspace.print(true);
        assert!(detailed.contains("VA=0x100000000"));
        assert!(detailed.contains("splay"));
    }

    #[test]
    fn destroy_clears_state() {
        let aspace = aspace(RegionBackend::BalancedTree);
        aspace
            .add_region(&Region::identity(0x1000, 0x1000, prot(Protection::READ)))
            .unwrap();
        aspace.add_thread(ContextId(3)).unwrap();
        aspace.destroy();
        assert!(aspace.regions().is_empty());
        assert!(aspace.threads().is_empty());
    }
}
