//! Table of live allocations keyed by base address.
//!
//! Entries live in a slot arena. Each slot carries a generation that is bumped
//! whenever the slot is released, so an [`AllocationId`] taken before a free
//! can never resolve to whatever later reuses the slot (or the address).
use std::collections::BTreeMap;

use crate::escape::EscapeSet;

/// Generation of a freshly created slot. Zero is never handed out.
pub const INITIAL_GENERATION: u32 = 1;

/// Stable handle to an entry in an [`AllocationMap`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AllocationId {
    index: u32,
    generation: u32,
}

impl AllocationId {
    pub fn index(self) -> u32 {
        self.index
    }

    pub fn generation(self) -> u32 {
        self.generation
    }
}

/// Offset of `value` inside `[base, base + size)`, if it lies there.
#[inline]
pub fn query_offset(value: usize, base: usize, size: usize) -> Option<usize> {
    value.checked_sub(base).filter(|offset| *offset < size)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllocationEntry {
    pub base: usize,
    pub size: usize,
    pub escapes: EscapeSet,
}

impl AllocationEntry {
    pub fn new(base: usize, size: usize) -> Self {
        Self {
            base,
            size,
            escapes: EscapeSet::new(),
        }
    }

    pub fn end(&self) -> usize {
        self.base.saturating_add(self.size)
    }

    pub fn contains(&self, address: usize) -> bool {
        self.offset_of(address).is_some()
    }

    pub fn offset_of(&self, value: usize) -> Option<usize> {
        query_offset(value, self.base, self.size)
    }
}

struct Slot {
    generation: u32,
    entry: Option<AllocationEntry>,
}

#[derive(Default)]
pub struct AllocationMap {
    slots: Vec<Slot>,
    free: Vec<u32>,
    by_base: BTreeMap<usize, AllocationId>,
}

impl AllocationMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_base.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_base.is_empty()
    }

    /// Inserts `entry`, replacing any entry with the same base address. The
    /// replaced entry (if any) is returned and its id becomes stale.
    pub fn insert(&mut self, entry: AllocationEntry) -> (AllocationId, Option<AllocationEntry>) {
        let replaced = self.remove(entry.base);
        let base = entry.base;
        let id = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.entry = Some(entry);
                AllocationId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: INITIAL_GENERATION,
                    entry: Some(entry),
                });
                AllocationId {
                    index,
                    generation: INITIAL_GENERATION,
                }
            }
        };
        self.by_base.insert(base, id);
        (id, replaced)
    }

    /// Removes the entry whose base address is exactly `base`.
    pub fn remove(&mut self, base: usize) -> Option<AllocationEntry> {
        let id = self.by_base.remove(&base)?;
        self.release(id)
    }

    pub fn remove_id(&mut self, id: AllocationId) -> Option<AllocationEntry> {
        let base = self.get(id)?.base;
        self.remove(base)
    }

    fn release(&mut self, id: AllocationId) -> Option<AllocationEntry> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let entry = slot.entry.take();
        slot.generation = match slot.generation.wrapping_add(1) {
            0 => INITIAL_GENERATION,
            g => g,
        };
        self.free.push(id.index);
        entry
    }

    pub fn get(&self, id: AllocationId) -> Option<&AllocationEntry> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    pub fn get_mut(&mut self, id: AllocationId) -> Option<&mut AllocationEntry> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_mut()
    }

    /// Exact lookup: `base` must be the start of a tracked allocation.
    pub fn find(&self, base: usize) -> Option<AllocationId> {
        self.by_base.get(&base).copied()
    }

    /// Lower-bound lookup: the allocation whose range contains `address`.
    pub fn find_containing(&self, address: usize) -> Option<AllocationId> {
        let (_, id) = self.by_base.range(..=address).next_back()?;
        let entry = self.get(*id)?;
        if entry.contains(address) {
            Some(*id)
        } else {
            None
        }
    }

    /// Every allocation whose base lies in `[start, start + len)`, ordered by base.
    pub fn ids_in_range(&self, start: usize, len: usize) -> Vec<AllocationId> {
        let end = start.saturating_add(len);
        self.by_base.range(start..end).map(|(_, id)| *id).collect()
    }

    pub fn ids(&self) -> Vec<AllocationId> {
        self.by_base.values().copied().collect()
    }

    /// Entries ordered by base address.
    pub fn iter(&self) -> impl Iterator<Item = &AllocationEntry> + '_ {
        self.by_base.values().filter_map(move |id| self.get(*id))
    }

    /// Total number of escape slots across every entry.
    pub fn escape_count(&self) -> usize {
        self.iter().map(|entry| entry.escapes.len()).sum()
    }

    /// Rebases escape slots of every entry that lived inside the bytes moved
    /// from `old` to `new`.
    pub fn rebase_contained_escapes(&mut self, old: usize, new: usize, size: usize) -> usize {
        self.slots
            .iter_mut()
            .filter_map(|slot| slot.entry.as_mut())
            .map(|entry| entry.escapes.rebase(old, new, size))
            .sum()
    }

    pub fn clear(&mut self) {
        let ids: Vec<AllocationId> = self.by_base.values().copied().collect();
        self.by_base.clear();
        for id in ids {
            self.release(id);
        }
    }
}
