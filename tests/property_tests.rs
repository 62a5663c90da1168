//! Property-based tests for the region tracker and the relocation engine.

use carat::{AddressSpace, Carat, Config, Protection, Region, RegionBackend};
use proptest::prelude::*;

const PAGE: usize = 0x1000;

#[derive(Clone, Debug)]
enum Op {
    Add { page: usize, pages: usize, flags: u8 },
    /// Removes the n-th tracked region (modulo the count).
    Remove(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0usize..64, 1usize..8, 0u8..0x20).prop_map(|(page, pages, flags)| Op::Add {
            page,
            pages,
            flags: flags & !Protection::PIN,
        }),
        1 => any::<usize>().prop_map(Op::Remove),
    ]
}

fn permission_bits() -> impl Strategy<Value = u8> {
    (0u8..8, any::<bool>()).prop_map(|(rwx, kern)| rwx | if kern { Protection::KERN } else { 0 })
}

fn boot(backend: RegionBackend) -> Carat {
    Carat::boot(Config {
        region_backend: backend,
        ..Config::default()
    })
}

proptest! {
    /// Tracked regions never intersect, and every backend agrees on the set.
    #[test]
    fn tracked_regions_stay_disjoint(ops in prop::collection::vec(op(), 1..60)) {
        let carats: Vec<_> = RegionBackend::ALL.iter().map(|b| boot(*b)).collect();
        let spaces: Vec<_> = carats.iter().map(|c| c.create_aspace("prop")).collect();

        for op in ops {
            let mut results = Vec::new();
            for space in &spaces {
                let result = match &op {
                    Op::Add { page, pages, flags } => space.add_region(&Region::identity(
                        page * PAGE,
                        pages * PAGE,
                        Protection::from_flags(*flags),
                    )),
                    Op::Remove(n) => {
                        let regions = space.regions();
                        if regions.is_empty() {
                            Ok(())
                        } else {
                            space.remove_region(&regions[n % regions.len()])
                        }
                    }
                };
                results.push(result.is_ok());

                let regions = space.regions();
                for pair in regions.windows(2) {
                    prop_assert!(pair[0].end() <= pair[1].va_start, "{} overlaps {}", pair[0], pair[1]);
                }
            }
            prop_assert!(results.windows(2).all(|w| w[0] == w[1]), "backends disagree on {:?}", op);
            prop_assert_eq!(spaces[0].regions(), spaces[1].regions());
            prop_assert_eq!(spaces[1].regions(), spaces[2].regions());
        }
    }

    /// A check passes iff one tracked region contains the query with at
    /// least its permissions.
    #[test]
    fn protection_check_matches_containment(
        tracked in prop::collection::vec((0usize..32, 1usize..6, permission_bits()), 1..12),
        query in (0usize..40, 1usize..4, permission_bits()),
    ) {
        for backend in RegionBackend::ALL {
            let carat = boot(backend);
            let space = carat.create_aspace("prop");
            for (page, pages, flags) in &tracked {
                let _ = space.add_region(&Region::identity(
                    page * PAGE,
                    pages * PAGE,
                    Protection::from_flags(*flags),
                ));
            }
            let (page, pages, flags) = query;
            let q = Region::identity(page * PAGE, pages * PAGE, Protection::from_flags(flags));
            let expected = space
                .regions()
                .iter()
                .any(|r| r.contains(&q) && q.protection.leq(r.protection));
            prop_assert_eq!(space.protection_check(&q).is_ok(), expected, "{} backend", backend);
        }
    }

    /// Moving an allocation preserves its bytes and re-points every escape by
    /// the same offset.
    #[test]
    fn move_preserves_contents_and_escapes(
        words in 1usize..64,
        fill in any::<u8>(),
        offsets in prop::collection::vec(any::<prop::sample::Index>(), 0..16),
    ) {
        let carat = boot(RegionBackend::BalancedTree);
        let size = words * 8;
        let mut src = vec![0u64; words];
        let mut dst = vec![0u64; words];
        let (old, new) = (src.as_mut_ptr() as usize, dst.as_mut_ptr() as usize);
        unsafe { std::ptr::write_bytes(old as *mut u8, fill, size) };
        let before: Vec<u64> = src.clone();

        let offsets: Vec<usize> = offsets.iter().map(|i| i.index(size)).collect();
        let mut slots: Vec<usize> = offsets.iter().map(|o| old + o).collect();
        carat.runtime().on_allocate(old, size);
        for slot in slots.iter_mut() {
            let value = *slot;
            carat.runtime().on_escaping_store(slot as *mut usize as usize, value);
        }

        let report = carat.engine().move_allocation(old, new).unwrap();
        prop_assert_eq!(report.escapes_patched, offsets.len());
        for (slot, offset) in slots.iter().zip(&offsets) {
            prop_assert_eq!(*slot, new + offset);
        }
        prop_assert_eq!(&dst, &before);

        let entry = carat.runtime().find_allocation(new).unwrap();
        prop_assert_eq!(entry.size, size);
        prop_assert_eq!(entry.escapes.len(), offsets.len());
        prop_assert!(carat.runtime().find_allocation(old).is_none());
    }
}
