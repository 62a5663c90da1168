use super::{Overlap, RegionBackend, RegionTracker};
use crate::region::{MatchFlags, Region};

/// Unordered list. Every operation is a linear scan.
#[derive(Default)]
pub struct ListTracker {
    regions: Vec<Region>,
}

impl ListTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, region: &Region, flags: MatchFlags) -> Option<usize> {
        self.regions
            .iter()
            .position(|r| r.va_start == region.va_start && flags.matches(r, region))
    }
}

impl RegionTracker for ListTracker {
    fn backend(&self) -> RegionBackend {
        RegionBackend::List
    }

    fn insert(&mut self, region: Region) {
        self.regions.push(region);
    }

    fn remove(&mut self, region: &Region, flags: MatchFlags) -> Option<Region> {
        let index = self.position(region, flags)?;
        Some(self.regions.remove(index))
    }

    fn check_overlap(&mut self, region: &Region) -> Overlap {
        let mut hits: Vec<&Region> = self
            .regions
            .iter()
            .filter(|r| r.intersects(region))
            .collect();
        hits.sort_by_key(|r| r.va_start);
        Overlap::classify(region, hits)
    }

    fn find_region_at(&mut self, address: usize) -> Option<&mut Region> {
        self.regions
            .iter_mut()
            .find(|r| r.contains_address(address))
    }

    fn contains(&mut self, region: &Region, flags: MatchFlags) -> Option<&mut Region> {
        let index = self.position(region, flags)?;
        self.regions.get_mut(index)
    }

    fn len(&self) -> usize {
        self.regions.len()
    }

    fn regions(&self) -> Vec<Region> {
        let mut regions = self.regions.clone();
        regions.sort_by_key(|r| r.va_start);
        regions
    }

    fn clear(&mut self) {
        self.regions.clear();
    }
}
