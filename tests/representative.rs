use proptest::prelude::*;

use locality_coll::topology::NodeSlices;

proptest! {
    #[test]
    fn slices_partition_exactly_once(n in 0usize..200, ppn in 1usize..17) {
        let s = NodeSlices::new(n, ppn);
        let mut next = 0;
        for local in 0..ppn {
            let r = s.range(local);
            prop_assert_eq!(r.start, next);
            prop_assert!(r.len() <= s.max_slice_len());
            prop_assert_eq!(s.max_slice_len(), n.div_ceil(ppn));
            next = r.end;
        }
        prop_assert_eq!(next, n);
    }

    #[test]
    fn owner_matches_range(n in 1usize..200, ppn in 1usize..17, pick in any::<prop::sample::Index>()) {
        let s = NodeSlices::new(n, ppn);
        let item = pick.index(n);
        prop_assert!(s.range(s.owner(item)).contains(&item));
    }

    #[test]
    fn slice_sizes_differ_by_at_most_one(n in 0usize..200, ppn in 1usize..17) {
        let s = NodeSlices::new(n, ppn);
        let lens: Vec<usize> = (0..ppn).map(|l| s.slice_len(l)).collect();
        let (lo, hi) = (lens.iter().min().unwrap(), lens.iter().max().unwrap());
        prop_assert!(hi - lo <= 1);
        // larger slices come first
        prop_assert!(lens.windows(2).all(|w| w[0] >= w[1]));
    }
}
