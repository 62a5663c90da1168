//! Pluggable sets of disjoint regions.
//!
//! Every backend keeps the same contract; which one an address space uses is
//! picked at creation time through [`create_tracker`].
use std::fmt;
use std::str::FromStr;

use crate::region::{MatchFlags, Region};

pub mod btree;
pub mod list;
pub mod splay;

/// How a queried range relates to the tracked regions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Overlap {
    /// The query lies entirely inside this tracked region.
    Contained(Region),
    /// The query intersects this region (and possibly others) but no single
    /// tracked region contains it.
    Partial(Region),
    None,
}

impl Overlap {
    pub fn region(&self) -> Option<&Region> {
        match self {
            Overlap::Contained(r) | Overlap::Partial(r) => Some(r),
            Overlap::None => None,
        }
    }

    /// Classifies `query` against candidates that intersect it, in address
    /// order. Tracked regions are disjoint, so at most one can contain it.
    pub(crate) fn classify<'a>(
        query: &Region,
        candidates: impl IntoIterator<Item = &'a Region>,
    ) -> Overlap {
        let mut first = None;
        for candidate in candidates {
            if !candidate.intersects(query) {
                continue;
            }
            if candidate.contains(query) {
                return Overlap::Contained(*candidate);
            }
            if first.is_none() {
                first = Some(*candidate);
            }
        }
        first.map_or(Overlap::None, Overlap::Partial)
    }
}

pub trait RegionTracker: Send {
    fn backend(&self) -> RegionBackend;
    /// Inserts without checking for overlap. Callers run `check_overlap` first.
    fn insert(&mut self, region: Region);
    /// Removes the region starting at `region.va_start` if it matches on every
    /// field selected by `flags`.
    fn remove(&mut self, region: &Region, flags: MatchFlags) -> Option<Region>;
    fn check_overlap(&mut self, region: &Region) -> Overlap;
    fn find_region_at(&mut self, address: usize) -> Option<&mut Region>;
    /// The tracked region starting at `region.va_start` that matches on every
    /// field selected by `flags`.
    fn contains(&mut self, region: &Region, flags: MatchFlags) -> Option<&mut Region>;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Every tracked region ordered by virtual start address.
    fn regions(&self) -> Vec<Region>;
    fn clear(&mut self);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum RegionBackend {
    List,
    #[default]
    BalancedTree,
    SplayTree,
}

impl RegionBackend {
    pub const ALL: [RegionBackend; 3] = [
        RegionBackend::List,
        RegionBackend::BalancedTree,
        RegionBackend::SplayTree,
    ];

    pub fn name(self) -> &'static str {
        match self {
            RegionBackend::List => "list",
            RegionBackend::BalancedTree => "tree",
            RegionBackend::SplayTree => "splay",
        }
    }
}

impl fmt::Display for RegionBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for RegionBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "list" | "linked-list" => Ok(RegionBackend::List),
            "tree" | "btree" | "rb" | "rbtree" | "balanced" => Ok(RegionBackend::BalancedTree),
            "splay" | "splay-tree" => Ok(RegionBackend::SplayTree),
            other => Err(format!("unknown region backend '{}'", other)),
        }
    }
}

pub fn create_tracker(backend: RegionBackend) -> Box<dyn RegionTracker> {
    match backend {
        RegionBackend::List => Box::new(list::ListTracker::new()),
        RegionBackend::BalancedTree => Box::new(btree::TreeTracker::new()),
        RegionBackend::SplayTree => Box::new(splay::SplayTracker::new()),
    }
}
