use std::sync::atomic::{AtomicUsize, Ordering};

/// Snapshot of the relocation runtime counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RelocationStatistics {
    pub live_allocations: usize,
    pub live_bytes: usize,
    pub tracked_escapes: usize,
    pub pending_escapes: usize,
    pub escapes_recorded: usize,
    pub escapes_discarded: usize,
    pub drains: usize,
    pub moves: usize,
    pub allocations_moved: usize,
    pub bytes_copied: usize,
    pub escapes_patched: usize,
    pub escapes_skipped: usize,
    pub registers_patched: usize,
    pub barrier_failures: usize,
    pub globals_registered: usize,
    pub guard_address_calls: usize,
    pub guard_stack_calls: usize,
    /// Total time spent in permission requests made by address guards.
    pub request_permission_nanos: usize,
}

impl RelocationStatistics {
    /// Mean permission request time per address guard, if any ran.
    pub fn average_request_permission_nanos(&self) -> Option<usize> {
        self.request_permission_nanos
            .checked_div(self.guard_address_calls)
    }
}

#[derive(Default)]
pub(crate) struct Counters {
    pub escapes_recorded: AtomicUsize,
    pub escapes_discarded: AtomicUsize,
    pub drains: AtomicUsize,
    pub moves: AtomicUsize,
    pub allocations_moved: AtomicUsize,
    pub bytes_copied: AtomicUsize,
    pub escapes_patched: AtomicUsize,
    pub escapes_skipped: AtomicUsize,
    pub registers_patched: AtomicUsize,
    pub barrier_failures: AtomicUsize,
    pub globals_registered: AtomicUsize,
    pub guard_address_calls: AtomicUsize,
    pub guard_stack_calls: AtomicUsize,
    pub request_permission_nanos: AtomicUsize,
}

impl Counters {
    #[inline]
    pub fn bump(counter: &AtomicUsize, by: usize) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    pub fn fill(&self, stats: &mut RelocationStatistics) {
        let load = |c: &AtomicUsize| c.load(Ordering::Relaxed);
        stats.escapes_recorded = load(&self.escapes_recorded);
        stats.escapes_discarded = load(&self.escapes_discarded);
        stats.drains = load(&self.drains);
        stats.moves = load(&self.moves);
        stats.allocations_moved = load(&self.allocations_moved);
        stats.bytes_copied = load(&self.bytes_copied);
        stats.escapes_patched = load(&self.escapes_patched);
        stats.escapes_skipped = load(&self.escapes_skipped);
        stats.registers_patched = load(&self.registers_patched);
        stats.barrier_failures = load(&self.barrier_failures);
        stats.globals_registered = load(&self.globals_registered);
        stats.guard_address_calls = load(&self.guard_address_calls);
        stats.guard_stack_calls = load(&self.guard_stack_calls);
        stats.request_permission_nanos = load(&self.request_permission_nanos);
    }

    pub fn reset(&self) {
        for counter in [
            &self.escapes_recorded,
            &self.escapes_discarded,
            &self.drains,
            &self.moves,
            &self.allocations_moved,
            &self.bytes_copied,
            &self.escapes_patched,
            &self.escapes_skipped,
            &self.registers_patched,
            &self.barrier_failures,
            &self.globals_registered,
            &self.guard_address_calls,
            &self.guard_stack_calls,
            &self.request_permission_nanos,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

pub(crate) struct FormattedSize {
    pub size: usize,
}

impl std::fmt::Display for FormattedSize {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let ksize = (self.size as f64) / 1024f64;

        if ksize < 1f64 {
            return write!(f, "{}B", self.size);
        }

        let msize = ksize / 1024f64;

        if msize < 1f64 {
            return write!(f, "{:.1}K", ksize);
        }

        let gsize = msize / 1024f64;

        if gsize < 1f64 {
            write!(f, "{:.1}M", msize)
        } else {
            write!(f, "{:.1}G", gsize)
        }
    }
}

pub(crate) fn formatted_size(size: usize) -> FormattedSize {
    FormattedSize { size }
}

impl std::fmt::Display for RelocationStatistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Relocation statistics:")?;
        writeln!(
            f,
            "  Live allocations: {} ({})",
            self.live_allocations,
            formatted_size(self.live_bytes)
        )?;
        writeln!(
            f,
            "  Escapes: {} tracked, {} pending",
            self.tracked_escapes, self.pending_escapes
        )?;
        writeln!(
            f,
            "  Escapes recorded: {} ({} discarded over {} drains)",
            self.escapes_recorded, self.escapes_discarded, self.drains
        )?;
        writeln!(
            f,
            "  Moves: {} ({} allocations, {} copied)",
            self.moves,
            self.allocations_moved,
            formatted_size(self.bytes_copied)
        )?;
        writeln!(
            f,
            "  Escapes patched: {} ({} skipped)",
            self.escapes_patched, self.escapes_skipped
        )?;
        writeln!(f, "  Registers patched: {}", self.registers_patched)?;
        writeln!(f, "  Barrier failures: {}", self.barrier_failures)?;
        writeln!(f, "  Globals registered: {}", self.globals_registered)?;
        write!(
            f,
            "  Guards: {} address, {} stack",
            self.guard_address_calls, self.guard_stack_calls
        )?;
        match self.average_request_permission_nanos() {
            Some(avg) => writeln!(f, " (average request_permission {}ns)", avg)?,
            None => writeln!(f)?,
        }
        Ok(())
    }
}
