//! The relocation runtime service object.
//!
//! One `CaratRuntime` exists per kernel. It owns the allocation map and the
//! escape window and is handed by reference to the relocation engine and to
//! every address space. Instrumented code reaches it through the producer
//! hooks (`on_*`), which are no-ops until [`CaratRuntime::init`] has run.
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::{
    allocation_map::{AllocationEntry, AllocationMap},
    escape::{EscapeRecord, EscapeWindow},
    statistics::{Counters, RelocationStatistics},
    Config,
};

/// Outcome of folding the escape window into the allocation map.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Records folded into some entry's escape set.
    pub merged: usize,
    /// Records whose value did not fall inside any live allocation.
    pub discarded: usize,
    /// Records superseded by a later store to the same slot.
    pub superseded: usize,
}

pub struct CaratRuntime {
    map: Mutex<AllocationMap>,
    window: EscapeWindow,
    ready: AtomicBool,
    pub(crate) counters: Counters,
    config: Config,
}

impl CaratRuntime {
    pub fn new(config: Config) -> Self {
        Self {
            map: Mutex::new(AllocationMap::new()),
            window: EscapeWindow::new(config.escape_window_capacity),
            ready: AtomicBool::new(false),
            counters: Counters::default(),
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Starts tracking. Hooks fired before this point are ignored.
    pub fn init(&self) {
        log::info!(
            "carat: runtime ready (escape window {} records)",
            self.window.capacity()
        );
        self.ready.store(true, Ordering::Release);
    }

    /// Stops tracking and forgets every allocation and pending escape.
    pub fn teardown(&self) {
        self.ready.store(false, Ordering::Release);
        let mut map = self.map.lock();
        let dropped = self.window.clear();
        log::info!(
            "carat: runtime teardown ({} allocations, {} pending escapes dropped)",
            map.len(),
            dropped
        );
        map.clear();
        self.counters.reset();
    }

    /// Hooks are ignored until [`resume`](Self::resume) is called. Lets trusted
    /// code allocate memory the runtime should not track.
    pub fn pause(&self) -> bool {
        self.ready.swap(false, Ordering::AcqRel)
    }

    pub fn resume(&self) {
        self.ready.store(true, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn on_allocate(&self, address: usize, size: usize) {
        if !self.is_ready() || address == 0 {
            return;
        }
        self.register_allocation(address, size);
    }

    pub fn on_reallocate(&self, old_address: usize, new_address: usize, size: usize) {
        if !self.is_ready() {
            return;
        }
        if old_address == 0 {
            self.on_allocate(new_address, size);
            return;
        }
        if new_address == 0 {
            self.remove_allocation(old_address);
            return;
        }
        self.resize_allocation(old_address, new_address, size);
    }

    pub fn on_allocate_zeroed(&self, address: usize, nmemb: usize, size: usize) {
        if !self.is_ready() || address == 0 {
            return;
        }
        match nmemb.checked_mul(size) {
            Some(total) => self.register_allocation(address, total),
            None => log::warn!(
                "carat: zeroed allocation at {:#x} overflows ({} x {})",
                address,
                nmemb,
                size
            ),
        }
    }

    pub fn on_deallocate(&self, address: usize) {
        if !self.is_ready() || address == 0 {
            return;
        }
        self.remove_allocation(address);
    }

    /// Tracks a global variable like any other allocation. `global_id` only
    /// identifies the global in the log.
    pub fn on_global(&self, address: usize, size: usize, global_id: u64) {
        if !self.is_ready() || address == 0 {
            return;
        }
        log::debug!(
            "carat: global {} at {:#x} ({:#x} bytes)",
            global_id,
            address,
            size
        );
        Counters::bump(&self.counters.globals_registered, 1);
        self.register_allocation(address, size);
    }

    pub fn on_escaping_store(&self, slot_address: usize, stored_value: usize) {
        if !self.is_ready() {
            return;
        }
        self.record_escape(slot_address, stored_value);
    }

    pub fn register_allocation(&self, address: usize, size: usize) {
        let mut map = self.map.lock();
        let (_, replaced) = map.insert(AllocationEntry::new(address, size));
        if let Some(old) = replaced {
            log::warn!(
                "carat: allocation at {:#x} registered twice (size {:#x} -> {:#x})",
                address,
                old.size,
                size
            );
        }
    }

    /// The old entry is dropped together with its escape set; the new entry
    /// starts with none.
    pub fn resize_allocation(&self, old_address: usize, new_address: usize, size: usize) {
        let mut map = self.map.lock();
        if map.remove(old_address).is_none() {
            log::warn!(
                "carat: reallocation of untracked address {:#x}",
                old_address
            );
        }
        map.insert(AllocationEntry::new(new_address, size));
    }

    pub fn remove_allocation(&self, address: usize) -> bool {
        let removed = self.map.lock().remove(address).is_some();
        if !removed {
            log::warn!("carat: free of untracked address {:#x}", address);
        }
        removed
    }

    /// Exact lookup by base address.
    pub fn find_allocation(&self, address: usize) -> Option<AllocationEntry> {
        let map = self.map.lock();
        map.find(address).and_then(|id| map.get(id)).cloned()
    }

    /// Lookup of the allocation containing `address`.
    pub fn find_allocation_containing(&self, address: usize) -> Option<AllocationEntry> {
        let map = self.map.lock();
        map.find_containing(address)
            .and_then(|id| map.get(id))
            .cloned()
    }

    /// Appends to the escape window. Drains in-line once the window fills up.
    #[inline]
    pub fn record_escape(&self, slot_address: usize, observed_value: usize) {
        Counters::bump(&self.counters.escapes_recorded, 1);
        if self
            .window
            .push(EscapeRecord::new(slot_address, observed_value))
        {
            log::debug!("carat: escape window full, draining");
            self.drain_escape_window();
        }
    }

    pub fn pending_escapes(&self) -> usize {
        self.window.len()
    }

    pub fn drain_escape_window(&self) -> DrainReport {
        let mut map = self.map.lock();
        self.drain_locked(&mut map)
    }

    /// Folds the window into `map`. When one slot was stored to more than once
    /// only its latest record counts.
    pub(crate) fn drain_locked(&self, map: &mut AllocationMap) -> DrainReport {
        let mut records = Vec::new();
        self.window.take(|record| records.push(record));
        let mut report = DrainReport::default();
        if records.is_empty() {
            return report;
        }

        let mut processed = HashSet::with_capacity(records.len());
        for record in records.into_iter().rev() {
            if record.slot == 0 || !processed.insert(record.slot) {
                report.superseded += 1;
                continue;
            }
            let target = map
                .find_containing(record.value)
                .and_then(|id| map.get_mut(id));
            match target {
                Some(entry) => {
                    entry.escapes.insert(record.slot);
                    report.merged += 1;
                }
                None => {
                    log::trace!(
                        "carat: discarding escape {:#x} -> {:#x}",
                        record.slot,
                        record.value
                    );
                    report.discarded += 1;
                }
            }
        }

        Counters::bump(&self.counters.drains, 1);
        Counters::bump(&self.counters.escapes_discarded, report.discarded);
        log::debug!(
            "carat: drained escape window ({} merged, {} discarded, {} superseded)",
            report.merged,
            report.discarded,
            report.superseded
        );
        report
    }

    pub(crate) fn lock_map(&self) -> MutexGuard<'_, AllocationMap> {
        self.map.lock()
    }

    pub fn statistics(&self) -> RelocationStatistics {
        let mut stats = RelocationStatistics::default();
        {
            let map = self.map.lock();
            stats.live_allocations = map.len();
            stats.live_bytes = map.iter().map(|e| e.size).sum();
            stats.tracked_escapes = map.escape_count();
        }
        stats.pending_escapes = self.window.len();
        self.counters.fill(&mut stats);
        stats
    }
}
