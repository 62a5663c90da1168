//! Compiler-assisted allocation relocation.
//!
//! Instrumented code reports allocations and address-valued stores to a
//! [`CaratRuntime`]. The [`RelocationEngine`] uses that record to move live
//! allocations while the world is stopped, patching every tracked copy of
//! their addresses. [`aspace::CaratAspace`] layers identity-mapped,
//! software-protected regions on top and relocates whole regions on request.
//!
//! # Environment Variables
//!
//! [`Config::from_env`] reads:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `CARAT_ESCAPE_WINDOW` | Pending escape records before an in-line drain | 1048576 |
//! | `CARAT_REGION_BACKEND` | Region tracker (`list`/`tree`/`splay`) | `tree` |
//! | `CARAT_BARRIER_TIMEOUT_MS` | Stop-the-world timeout in milliseconds (0 = wait forever) | 1000 |
//! | `CARAT_PACK_ALIGNMENT` | Alignment of allocations packed by `move_region` | 8 |
//! | `CARAT_VERBOSE` | Debug logging in the `carat` binary | false |
use std::env;
use std::sync::Arc;
use std::time::Duration;

pub mod allocation_map;
pub mod aspace;
pub mod diagnostics;
pub mod error;
pub mod escape;
pub mod mmap;
pub mod mutator;
pub mod region;
pub mod region_tracker;
pub mod relocation;
pub mod runtime;
pub mod safepoint;
pub mod statistics;

#[cfg(test)]
mod tests;

pub use aspace::{AddressSpace, AddressSpaceImpl, CaratAspace, CaratImpl, Characteristics};
pub use error::{Error, Result};
pub use region::{Protection, Region};
pub use region_tracker::RegionBackend;
pub use relocation::{MoveReport, RelocationEngine};
pub use runtime::CaratRuntime;
pub use safepoint::{GlobalSafepoint, World};

use mmap::{MmapRegionAllocator, RegionAllocator};

/// Configuration for the relocation runtime.
#[derive(Clone, Debug)]
pub struct Config {
    /// Escape records buffered before the producer drains in-line
    pub escape_window_capacity: usize,
    /// Region tracker used by new address spaces
    pub region_backend: RegionBackend,
    /// How long a stop-the-world request waits for running contexts
    pub barrier_timeout: Option<Duration>,
    /// Alignment of allocations packed by `move_region`. Power of two.
    pub pack_alignment: usize,
    /// Enables verbose printing
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            escape_window_capacity: 1 << 20,
            region_backend: RegionBackend::BalancedTree,
            barrier_timeout: Some(Duration::from_millis(1000)),
            pack_alignment: 8,
            verbose: false,
        }
    }
}

impl Config {
    /// Defaults overridden by `CARAT_*` environment variables. Values that do
    /// not parse are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(val) = parse_env_usize("CARAT_ESCAPE_WINDOW") {
            if val > 0 {
                config.escape_window_capacity = val;
            }
        }

        if let Ok(val) = env::var("CARAT_REGION_BACKEND") {
            match val.parse() {
                Ok(backend) => config.region_backend = backend,
                Err(e) => log::warn!("carat: {}", e),
            }
        }

        if let Some(val) = parse_env_usize("CARAT_BARRIER_TIMEOUT_MS") {
            config.barrier_timeout = if val == 0 {
                None
            } else {
                Some(Duration::from_millis(val as u64))
            };
        }

        if let Some(val) = parse_env_usize("CARAT_PACK_ALIGNMENT") {
            if val.is_power_of_two() {
                config.pack_alignment = val;
            }
        }

        if let Some(val) = parse_env_bool("CARAT_VERBOSE") {
            config.verbose = val;
        }

        config
    }
}

fn parse_env_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

fn parse_env_bool(name: &str) -> Option<bool> {
    env::var(name)
        .ok()
        .and_then(|s| match s.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Some(true),
            "false" | "0" | "no" | "off" => Some(false),
            _ => None,
        })
}

/// The kernel-wide relocation service: runtime, stop-the-world barrier and
/// engine, booted together and shared by every address space.
pub struct Carat {
    runtime: Arc<CaratRuntime>,
    safepoint: Arc<GlobalSafepoint>,
    engine: Arc<RelocationEngine>,
    allocator: Arc<dyn RegionAllocator>,
    backend: RegionBackend,
}

impl Carat {
    pub fn boot(config: Config) -> Self {
        let backend = config.region_backend;
        let safepoint = Arc::new(GlobalSafepoint::new(config.barrier_timeout));
        let runtime = Arc::new(CaratRuntime::new(config));
        let engine = Arc::new(RelocationEngine::new(runtime.clone(), safepoint.clone()));
        runtime.init();
        Self {
            runtime,
            safepoint,
            engine,
            allocator: Arc::new(MmapRegionAllocator::new()),
            backend,
        }
    }

    pub fn runtime(&self) -> &Arc<CaratRuntime> {
        &self.runtime
    }

    pub fn safepoint(&self) -> &Arc<GlobalSafepoint> {
        &self.safepoint
    }

    pub fn engine(&self) -> &Arc<RelocationEngine> {
        &self.engine
    }

    pub fn aspace_impl(&self) -> CaratImpl {
        CaratImpl::new(self.engine.clone(), self.backend, self.allocator.clone())
    }

    pub fn create_aspace(&self, name: &str) -> Arc<CaratAspace> {
        let carat = self.aspace_impl();
        let characteristics = carat.get_characteristics();
        carat.create_aspace(name, characteristics)
    }

    pub fn shutdown(self) {
        self.runtime.teardown();
    }
}

pub mod c_api {
    //! Producer hooks and the relocation API for instrumented C code. Every
    //! call takes an explicit handle obtained from [`carat_boot`].
    use crate::{error::status_of, Carat, CaratRuntime, Config, RelocationEngine};

    /// Returned when a null handle is passed in.
    pub const CARAT_INVALID_HANDLE: i32 = -64;

    #[no_mangle]
    pub extern "C" fn carat_boot() -> *mut Carat {
        Box::into_raw(Box::new(Carat::boot(Config::from_env())))
    }

    #[no_mangle]
    pub extern "C" fn carat_shutdown(carat: *mut Carat) {
        if carat.is_null() {
            return;
        }
        unsafe { Box::from_raw(carat) }.shutdown();
    }

    #[no_mangle]
    pub extern "C" fn carat_runtime(carat: *const Carat) -> *const CaratRuntime {
        match unsafe { carat.as_ref() } {
            Some(carat) => &**carat.runtime(),
            None => std::ptr::null(),
        }
    }

    #[no_mangle]
    pub extern "C" fn carat_engine(carat: *const Carat) -> *const RelocationEngine {
        match unsafe { carat.as_ref() } {
            Some(carat) => &**carat.engine(),
            None => std::ptr::null(),
        }
    }

    #[no_mangle]
    pub extern "C" fn carat_on_allocate(runtime: *const CaratRuntime, address: *mut u8, size: usize) {
        if let Some(runtime) = unsafe { runtime.as_ref() } {
            runtime.on_allocate(address as usize, size);
        }
    }

    #[no_mangle]
    pub extern "C" fn carat_on_reallocate(
        runtime: *const CaratRuntime,
        old_address: *mut u8,
        new_address: *mut u8,
        size: usize,
    ) {
        if let Some(runtime) = unsafe { runtime.as_ref() } {
            runtime.on_reallocate(old_address as usize, new_address as usize, size);
        }
    }

    #[no_mangle]
    pub extern "C" fn carat_on_allocate_zeroed(
        runtime: *const CaratRuntime,
        address: *mut u8,
        nmemb: usize,
        size: usize,
    ) {
        if let Some(runtime) = unsafe { runtime.as_ref() } {
            runtime.on_allocate_zeroed(address as usize, nmemb, size);
        }
    }

    #[no_mangle]
    pub extern "C" fn carat_on_deallocate(runtime: *const CaratRuntime, address: *mut u8) {
        if let Some(runtime) = unsafe { runtime.as_ref() } {
            runtime.on_deallocate(address as usize);
        }
    }

    #[no_mangle]
    pub extern "C" fn carat_on_global(
        runtime: *const CaratRuntime,
        address: *mut u8,
        size: usize,
        global_id: u64,
    ) {
        if let Some(runtime) = unsafe { runtime.as_ref() } {
            runtime.on_global(address as usize, size, global_id);
        }
    }

    #[no_mangle]
    pub extern "C" fn carat_on_escaping_store(
        runtime: *const CaratRuntime,
        slot: *mut *mut u8,
        value: *mut u8,
    ) {
        if let Some(runtime) = unsafe { runtime.as_ref() } {
            runtime.on_escaping_store(slot as usize, value as usize);
        }
    }

    /// Returns the number of records folded into the allocation map.
    #[no_mangle]
    pub extern "C" fn carat_drain_escape_window(runtime: *const CaratRuntime) -> usize {
        match unsafe { runtime.as_ref() } {
            Some(runtime) => runtime.drain_escape_window().merged,
            None => 0,
        }
    }

    #[no_mangle]
    pub extern "C" fn carat_move_allocation(
        engine: *const RelocationEngine,
        old: *mut u8,
        new: *mut u8,
    ) -> i32 {
        match unsafe { engine.as_ref() } {
            Some(engine) => status_of(&engine.move_allocation(old as usize, new as usize)),
            None => CARAT_INVALID_HANDLE,
        }
    }

    #[no_mangle]
    pub extern "C" fn carat_move_allocations(
        engine: *const RelocationEngine,
        old: *const *mut u8,
        new: *const *mut u8,
        count: usize,
    ) -> i32 {
        let Some(engine) = (unsafe { engine.as_ref() }) else {
            return CARAT_INVALID_HANDLE;
        };
        if count == 0 {
            return 0;
        }
        if old.is_null() || new.is_null() {
            return CARAT_INVALID_HANDLE;
        }
        let (old, new) = unsafe {
            (
                std::slice::from_raw_parts(old, count),
                std::slice::from_raw_parts(new, count),
            )
        };
        let moves: Vec<(usize, usize)> = old
            .iter()
            .zip(new)
            .map(|(o, n)| (*o as usize, *n as usize))
            .collect();
        status_of(&engine.move_allocations(&moves))
    }

    #[no_mangle]
    pub extern "C" fn carat_move_region(
        engine: *const RelocationEngine,
        region_start: *mut u8,
        new_region_start: *mut u8,
        len: usize,
        free_end: *mut *mut u8,
    ) -> i32 {
        let Some(engine) = (unsafe { engine.as_ref() }) else {
            return CARAT_INVALID_HANDLE;
        };
        let result = engine.move_region(region_start as usize, new_region_start as usize, len);
        if let (Ok(end), false) = (&result, free_end.is_null()) {
            unsafe { *free_end = *end as *mut u8 };
        }
        status_of(&result)
    }
}
