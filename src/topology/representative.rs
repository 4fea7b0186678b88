//! Representative mapping: which local rank carries traffic for which node.
//!
//! A list of `n` items is cut into `ppn` contiguous slices. Slice `i` holds
//! `n / ppn` items, and the first `n % ppn` slices hold one more, so no local
//! rank carries more than `ceil(n / ppn)` items and the slices partition the
//! list exactly once. The computation uses only `(n, ppn)`, so every process
//! derives the same mapping without communicating.

use std::ops::Range;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeSlices {
    n: usize,
    ppn: usize,
    base: usize,
    extra: usize,
}

impl NodeSlices {
    /// # Panics
    /// If `ppn` is zero.
    pub fn new(n: usize, ppn: usize) -> Self {
        assert!(ppn > 0, "NodeSlices needs at least one local rank");
        Self {
            n,
            ppn,
            base: n / ppn,
            extra: n % ppn,
        }
    }

    pub fn len(&self) -> usize {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    pub fn ppn(&self) -> usize {
        self.ppn
    }

    /// First item of slice `local`.
    pub fn start(&self, local: usize) -> usize {
        local * self.base + local.min(self.extra)
    }

    pub fn slice_len(&self, local: usize) -> usize {
        self.base + usize::from(local < self.extra)
    }

    /// Items carried by local rank `local`.
    pub fn range(&self, local: usize) -> Range<usize> {
        let s = self.start(local);
        s..s + self.slice_len(local)
    }

    /// Local rank whose slice contains `item`.
    pub fn owner(&self, item: usize) -> usize {
        debug_assert!(item < self.n);
        let wide = self.extra * (self.base + 1);
        if item < wide {
            item / (self.base + 1)
        } else {
            // base > 0 here: item >= wide implies n > extra * (base + 1)
            self.extra + (item - wide) / self.base
        }
    }

    /// Largest slice length; `ceil(n / ppn)`.
    pub fn max_slice_len(&self) -> usize {
        self.base + usize::from(self.extra > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remainder_goes_to_lowest_ranks() {
        let s = NodeSlices::new(7, 3);
        assert_eq!(s.range(0), 0..3);
        assert_eq!(s.range(1), 3..5);
        assert_eq!(s.range(2), 5..7);
        assert_eq!(s.max_slice_len(), 3);
    }

    #[test]
    fn owner_inverts_range() {
        for n in 0..20 {
            for ppn in 1..7 {
                let s = NodeSlices::new(n, ppn);
                for local in 0..ppn {
                    for item in s.range(local) {
                        assert_eq!(s.owner(item), local, "n={n} ppn={ppn}");
                    }
                }
            }
        }
    }

    #[test]
    fn more_ranks_than_items_leaves_empty_slices() {
        let s = NodeSlices::new(2, 4);
        assert_eq!(s.slice_len(0), 1);
        assert_eq!(s.slice_len(1), 1);
        assert!(s.range(2).is_empty());
        assert!(s.range(3).is_empty());
        assert_eq!(s.range(3).start, 2);
    }
}
