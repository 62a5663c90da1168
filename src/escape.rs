//! Escape bookkeeping.
//!
//! An *escape* is a copy of an allocation's address stored somewhere the
//! allocation does not own: a heap field, a stack slot or a saved register.
//! Instrumented stores append [`EscapeRecord`]s to the [`EscapeWindow`]
//! without looking anything up. The window is folded into the per-allocation
//! [`EscapeSet`]s only when a relocation is about to start (or when it fills
//! up), which keeps the store path down to a queue push.
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::queue::SegQueue;
use crossbeam_utils::CachePadded;

/// `slot` was observed holding `value` at the time of the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EscapeRecord {
    pub slot: usize,
    pub value: usize,
}

impl EscapeRecord {
    pub const fn new(slot: usize, value: usize) -> Self {
        Self { slot, value }
    }
}

/// Slot addresses believed to hold a pointer into one allocation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EscapeSet {
    slots: BTreeSet<usize>,
}

impl EscapeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if `slot` was already recorded.
    pub fn insert(&mut self, slot: usize) -> bool {
        self.slots.insert(slot)
    }

    pub fn remove(&mut self, slot: usize) -> bool {
        self.slots.remove(&slot)
    }

    pub fn contains(&self, slot: usize) -> bool {
        self.slots.contains(&slot)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.slots.iter().copied()
    }

    /// Moves every slot inside `[old, old + size)` to the same offset from
    /// `new`. Used when the bytes holding those slots were themselves moved.
    ///
    /// Returns the number of rebased slots.
    pub fn rebase(&mut self, old: usize, new: usize, size: usize) -> usize {
        if old == new || size == 0 {
            return 0;
        }
        let end = old.saturating_add(size);
        let inside: Vec<usize> = self.slots.range(old..end).copied().collect();
        for slot in &inside {
            self.slots.remove(slot);
        }
        for slot in &inside {
            self.slots.insert(new + (slot - old));
        }
        inside.len()
    }
}

impl FromIterator<usize> for EscapeSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        Self {
            slots: iter.into_iter().collect(),
        }
    }
}

/// Pending escape records that have not been folded into an [`EscapeSet`] yet.
///
/// Appends never block. `push` reports when the window reached its capacity
/// so the caller can drain it before it grows without bound.
pub struct EscapeWindow {
    queue: SegQueue<EscapeRecord>,
    pending: CachePadded<AtomicUsize>,
    capacity: usize,
}

impl EscapeWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: SegQueue::new(),
            pending: CachePadded::new(AtomicUsize::new(0)),
            capacity: capacity.max(1),
        }
    }

    /// Appends `record`. Returns true if the window is now full.
    #[inline]
    pub fn push(&self, record: EscapeRecord) -> bool {
        // Count before publishing, so a concurrent `take` never pops a record
        // that has not been counted yet.
        let pending = self.pending.fetch_add(1, Ordering::AcqRel).saturating_add(1);
        self.queue.push(record);
        pending >= self.capacity
    }

    /// Records pushed but not yet taken. May briefly count a record whose
    /// producer has not finished publishing it.
    pub fn len(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Pops records in arrival order until the window is empty.
    pub(crate) fn take(&self, mut visitor: impl FnMut(EscapeRecord)) -> usize {
        let mut taken = 0;
        while let Some(record) = self.queue.pop() {
            let _ = self
                .pending
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
            visitor(record);
            taken += 1;
        }
        taken
    }

    /// Drops every pending record.
    pub(crate) fn clear(&self) -> usize {
        self.take(|_| {})
    }
}
