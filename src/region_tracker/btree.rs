use std::collections::BTreeMap;

use super::{Overlap, RegionBackend, RegionTracker};
use crate::region::{MatchFlags, Region};

/// Balanced search tree keyed by virtual start address.
#[derive(Default)]
pub struct TreeTracker {
    regions: BTreeMap<usize, Region>,
}

impl TreeTracker {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RegionTracker for TreeTracker {
    fn backend(&self) -> RegionBackend {
        RegionBackend::BalancedTree
    }

    fn insert(&mut self, region: Region) {
        self.regions.insert(region.va_start, region);
    }

    fn remove(&mut self, region: &Region, flags: MatchFlags) -> Option<Region> {
        let tracked = self.regions.get(&region.va_start)?;
        if !flags.matches(tracked, region) {
            return None;
        }
        self.regions.remove(&region.va_start)
    }

    fn check_overlap(&mut self, region: &Region) -> Overlap {
        // The only region starting below the query that can intersect it is
        // its predecessor.
        let predecessor = self
            .regions
            .range(..region.va_start)
            .next_back()
            .map(|(_, r)| r);
        let following = self
            .regions
            .range(region.va_start..region.end())
            .map(|(_, r)| r);
        Overlap::classify(region, predecessor.into_iter().chain(following))
    }

    fn find_region_at(&mut self, address: usize) -> Option<&mut Region> {
        let (_, region) = self.regions.range_mut(..=address).next_back()?;
        if region.contains_address(address) {
            Some(region)
        } else {
            None
        }
    }

    fn contains(&mut self, region: &Region, flags: MatchFlags) -> Option<&mut Region> {
        let tracked = self.regions.get_mut(&region.va_start)?;
        if flags.matches(tracked, region) {
            Some(tracked)
        } else {
            None
        }
    }

    fn len(&self) -> usize {
        self.regions.len()
    }

    fn regions(&self) -> Vec<Region> {
        self.regions.values().copied().collect()
    }

    fn clear(&mut self) {
        self.regions.clear();
    }
}
