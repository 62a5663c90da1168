//! The stop-the-world relocation engine.
//!
//! A relocation runs in two phases. The pre-flight phase drains the escape
//! window, resolves every allocation to move and checks the destination; any
//! failure there leaves all state untouched. Once the world is stopped the
//! committed phase patches escapes and saved registers, copies the bytes and
//! rewrites the allocation map. Nothing in the committed phase can fail: an
//! escape that no longer points into the allocation is skipped, not reverted.
use std::collections::HashSet;
use std::ptr;
use std::sync::Arc;

use atomic::{Atomic, Ordering};

use crate::{
    allocation_map::{query_offset, AllocationId, AllocationMap},
    error::{Error, Result},
    mmap::RegionAllocator,
    mutator::{Register, SavedContext},
    runtime::CaratRuntime,
    safepoint::World,
    statistics::Counters,
};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum EngineState {
    Idle = 0,
    BarrierRequested,
    WorldStopped,
    Patching,
    Copying,
    WorldResumed,
}

/// What one relocation call did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MoveReport {
    pub allocations: usize,
    pub bytes: usize,
    pub escapes_patched: usize,
    pub escapes_skipped: usize,
    pub registers_patched: usize,
    /// Contained escape slots that moved along with the bytes holding them.
    pub escapes_rebased: usize,
}

#[derive(Clone, Copy, Debug)]
struct PlannedMove {
    id: AllocationId,
    from: usize,
    to: usize,
    size: usize,
}

/// Rounds `value` up to a multiple of `align` (a power of two).
#[inline]
pub fn align_up(value: usize, align: usize) -> usize {
    if align <= 1 {
        return value;
    }
    (value + align - 1) & !(align - 1)
}

/// Re-enables the runtime hooks when a relocation ends, however it ends.
struct PausedHooks<'a> {
    runtime: &'a CaratRuntime,
    was_ready: bool,
}

impl<'a> PausedHooks<'a> {
    fn new(runtime: &'a CaratRuntime) -> Self {
        let was_ready = runtime.pause();
        Self { runtime, was_ready }
    }
}

impl Drop for PausedHooks<'_> {
    fn drop(&mut self) {
        if self.was_ready {
            self.runtime.resume();
        }
    }
}

/// Returns the engine to `Idle` when a relocation ends, unwinding included.
struct InFlight<'a> {
    state: &'a Atomic<EngineState>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.state.store(EngineState::Idle, Ordering::Release);
    }
}

pub struct RelocationEngine {
    runtime: Arc<CaratRuntime>,
    world: Arc<dyn World>,
    state: Atomic<EngineState>,
}

impl RelocationEngine {
    pub fn new(runtime: Arc<CaratRuntime>, world: Arc<dyn World>) -> Self {
        Self {
            runtime,
            world,
            state: Atomic::new(EngineState::Idle),
        }
    }

    pub fn runtime(&self) -> &Arc<CaratRuntime> {
        &self.runtime
    }

    pub fn world(&self) -> &Arc<dyn World> {
        &self.world
    }

    pub fn state(&self) -> EngineState {
        self.state.load(Ordering::Acquire)
    }

    pub fn is_idle(&self) -> bool {
        self.state() == EngineState::Idle
    }

    fn set_state(&self, state: EngineState) {
        self.state.store(state, Ordering::Release);
    }

    /// Moves the allocation based at `old` to `new`.
    pub fn move_allocation(&self, old: usize, new: usize) -> Result<MoveReport> {
        self.move_allocations(&[(old, new)])
    }

    /// Moves every `(old, new)` pair under a single barrier. Fails without
    /// moving anything if any `old` is not the base of a tracked allocation
    /// or appears more than once.
    pub fn move_allocations(&self, moves: &[(usize, usize)]) -> Result<MoveReport> {
        log::debug!("carat: moving {} allocations", moves.len());
        self.relocate(|map| {
            let mut sources = HashSet::with_capacity(moves.len());
            moves
                .iter()
                .map(|&(from, to)| {
                    if !sources.insert(from) {
                        return Err(Error::InvalidArgument(format!(
                            "allocation {:#x} is moved twice in one batch",
                            from
                        )));
                    }
                    let id = map.find(from).ok_or(Error::LookupFailure(from))?;
                    let size = map.get(id).map_or(0, |entry| entry.size);
                    Ok(PlannedMove { id, from, to, size })
                })
                .collect()
        })
        .map(|(report, _)| report)
    }

    /// Packs every allocation based in `[start, start + len)` into the range
    /// starting at `new_start`, in address order, each aligned to the
    /// configured pack alignment. Returns the end of the packed area.
    ///
    /// A pack alignment of 1 packs allocations back to back. The default of 8
    /// leaves padding after allocations whose size is not a multiple of 8.
    /// Allocations are copied in address order, so a source that an earlier
    /// destination would overwrite fails the move with an overlap violation.
    pub fn move_region(&self, start: usize, new_start: usize, len: usize) -> Result<usize> {
        log::debug!(
            "carat: move_region ({:#x},{:#x}) -> {:#x}",
            start,
            len,
            new_start
        );
        if new_start > start && new_start < start.saturating_add(len) {
            return Err(Error::OverlapViolation {
                va: new_start,
                len,
                existing_va: start,
                existing_len: len,
            });
        }
        let alignment = self.runtime.config().pack_alignment;
        let limit = new_start.saturating_add(len);
        let (_, free_end) = self.relocate(|map| {
            let mut cursor = new_start;
            let mut planned = Vec::new();
            for id in map.ids_in_range(start, len) {
                let Some(entry) = map.get(id) else {
                    continue;
                };
                let to = align_up(cursor, alignment);
                if to.saturating_add(entry.size) > limit {
                    return Err(Error::AllocationFailure(entry.size));
                }
                // Earlier destinations are written before this source is read.
                if cursor > new_start
                    && entry.base < cursor
                    && entry.base.saturating_add(entry.size) > new_start
                {
                    return Err(Error::OverlapViolation {
                        va: new_start,
                        len: cursor - new_start,
                        existing_va: entry.base,
                        existing_len: entry.size,
                    });
                }
                planned.push(PlannedMove {
                    id,
                    from: entry.base,
                    to,
                    size: entry.size,
                });
                cursor = to + entry.size;
            }
            Ok(planned)
        })?;
        Ok(free_end.unwrap_or(new_start))
    }

    /// Moves every tracked allocation to fresh memory from `allocator`. With
    /// `release_old` the vacated memory is handed back to the same allocator
    /// once the world runs again.
    pub fn defragment_allocations(
        &self,
        allocator: &dyn RegionAllocator,
        release_old: bool,
    ) -> Result<MoveReport> {
        let mut destinations = Vec::new();
        let mut sources = Vec::new();
        let result = self.relocate(|map| {
            let mut planned = Vec::with_capacity(map.len());
            for id in map.ids() {
                let Some(entry) = map.get(id) else {
                    continue;
                };
                let to = allocator
                    .allocate(entry.size.max(1))
                    .ok_or(Error::AllocationFailure(entry.size))?;
                destinations.push(to);
                sources.push(entry.base);
                planned.push(PlannedMove {
                    id,
                    from: entry.base,
                    to,
                    size: entry.size,
                });
            }
            Ok(planned)
        });
        match result {
            Ok((report, _)) => {
                if release_old {
                    for from in sources {
                        allocator.release(from);
                    }
                }
                Ok(report)
            }
            Err(e) => {
                for to in destinations {
                    allocator.release(to);
                }
                Err(e)
            }
        }
    }

    fn relocate(
        &self,
        plan: impl FnOnce(&AllocationMap) -> Result<Vec<PlannedMove>>,
    ) -> Result<(MoveReport, Option<usize>)> {
        if self
            .state
            .compare_exchange(
                EngineState::Idle,
                EngineState::BarrierRequested,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            log::debug!("carat: relocation already in flight");
            return Err(Error::BarrierFailure);
        }
        let _in_flight = InFlight { state: &self.state };
        self.relocate_single_flight(plan)
    }

    fn relocate_single_flight(
        &self,
        plan: impl FnOnce(&AllocationMap) -> Result<Vec<PlannedMove>>,
    ) -> Result<(MoveReport, Option<usize>)> {
        let planned = {
            let mut map = self.runtime.lock_map();
            self.runtime.drain_locked(&mut map);
            plan(&map).map_err(|e| {
                log::debug!("carat: relocation pre-flight failed: {}", e);
                e
            })?
        };

        if !self.world.suspend_all() {
            Counters::bump(&self.runtime.counters.barrier_failures, 1);
            log::debug!("carat: could not stop the world");
            return Err(Error::BarrierFailure);
        }
        self.set_state(EngineState::WorldStopped);
        let hooks = PausedHooks::new(&self.runtime);

        let mut map = self.runtime.lock_map();
        // Stores that landed between the pre-flight drain and the barrier.
        self.runtime.drain_locked(&mut map);
        if let Some(stale) = planned.iter().find(|mv| {
            map.get(mv.id)
                .map_or(true, |entry| entry.base != mv.from || entry.size != mv.size)
        }) {
            drop(map);
            drop(hooks);
            self.world.resume_all();
            log::debug!("carat: allocation {:#x} vanished before the barrier", stale.from);
            return Err(Error::LookupFailure(stale.from));
        }

        let mut report = MoveReport::default();
        for mv in &planned {
            self.commit(&mut map, mv, &mut report);
        }
        drop(map);
        drop(hooks);

        self.set_state(EngineState::WorldResumed);
        self.world.resume_all();

        let counters = &self.runtime.counters;
        Counters::bump(&counters.moves, 1);
        Counters::bump(&counters.allocations_moved, report.allocations);
        Counters::bump(&counters.bytes_copied, report.bytes);
        Counters::bump(&counters.escapes_patched, report.escapes_patched);
        Counters::bump(&counters.escapes_skipped, report.escapes_skipped);
        Counters::bump(&counters.registers_patched, report.registers_patched);
        log::debug!(
            "carat: moved {} allocations ({} escapes patched, {} skipped, {} registers)",
            report.allocations,
            report.escapes_patched,
            report.escapes_skipped,
            report.registers_patched
        );
        Ok((report, planned.last().map(|mv| mv.to + mv.size)))
    }

    fn commit(&self, map: &mut AllocationMap, mv: &PlannedMove, report: &mut MoveReport) {
        let PlannedMove { id, from, to, size } = *mv;
        let slots: Vec<usize> = match map.get(id) {
            Some(entry) => entry.escapes.iter().collect(),
            None => return,
        };

        self.set_state(EngineState::Patching);
        for slot in slots {
            // Escape slots stay mapped for as long as they are tracked.
            let value = unsafe { ptr::read_unaligned(slot as *const usize) };
            match query_offset(value, from, size) {
                Some(offset) => {
                    unsafe { ptr::write_unaligned(slot as *mut usize, to + offset) };
                    report.escapes_patched += 1;
                }
                None => {
                    log::debug!(
                        "carat: skipping escape {:#x} (holds {:#x}, outside {:#x}+{:#x})",
                        slot,
                        value,
                        from,
                        size
                    );
                    report.escapes_skipped += 1;
                }
            }
        }

        let mut registers = 0;
        let mut patch = |context: &mut dyn SavedContext| {
            for reg in Register::GENERAL_PURPOSE {
                if let Some(offset) = query_offset(context.read(reg), from, size) {
                    context.write(reg, to + offset);
                    registers += 1;
                }
            }
        };
        self.world.for_each_suspended_context(&mut patch);
        report.registers_patched += registers;

        self.set_state(EngineState::Copying);
        if from != to && size != 0 {
            unsafe { ptr::copy(from as *const u8, to as *mut u8, size) };
        }

        if let Some(mut entry) = map.remove_id(id) {
            entry.base = to;
            map.insert(entry);
        }
        report.escapes_rebased += map.rebase_contained_escapes(from, to, size);
        report.allocations += 1;
        report.bytes += size;
    }
}
