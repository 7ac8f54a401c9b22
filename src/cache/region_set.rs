//! Disjoint closed-interval set (spec §3 "Byte-region set"), used by each
//! cached page to track which bytes are populated and which are dirty.
//!
//! Grounded on the teacher's `LruCache` bookkeeping style in
//! `buffer/lru.rs` (a plain `Vec` scanned linearly rather than a tree),
//! kept here for the same reason: region counts per page are small, so a
//! sorted `Vec<(u64, u64)>` with linear merge/split beats the complexity
//! of an interval tree.

/// A set of disjoint, non-adjacent closed intervals `[first, last]`
/// (both ends inclusive), kept sorted ascending by `first`.
#[derive(Debug, Clone, Default)]
pub struct ByteRegionSet {
    regions: Vec<(u64, u64)>,
}

impl ByteRegionSet {
    pub fn new() -> Self {
        Self { regions: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Enumerate regions in ascending order of `first`.
    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.regions.iter().copied()
    }

    /// Add `[first, last]`, merging with any overlapping or touching
    /// (adjacent, `last + 1 == other.first`) interval.
    pub fn add(&mut self, first: u64, last: u64) {
        debug_assert!(first <= last);
        let mut new_first = first;
        let mut new_last = last;
        let mut merged = Vec::with_capacity(self.regions.len() + 1);
        for &(f, l) in &self.regions {
            let touches = f <= new_last.saturating_add(1) && new_first <= l.saturating_add(1);
            if touches {
                new_first = new_first.min(f);
                new_last = new_last.max(l);
            } else {
                merged.push((f, l));
            }
        }
        merged.push((new_first, new_last));
        merged.sort_unstable_by_key(|&(f, _)| f);
        self.regions = merged;
    }

    /// Remove `[first, last]`, splitting any interval that only partially
    /// intersects it.
    pub fn remove(&mut self, first: u64, last: u64) {
        debug_assert!(first <= last);
        let mut result = Vec::with_capacity(self.regions.len() + 1);
        for &(f, l) in &self.regions {
            if last < f || l < first {
                result.push((f, l));
                continue;
            }
            if f < first {
                result.push((f, first - 1));
            }
            if last < l {
                result.push((last + 1, l));
            }
        }
        self.regions = result;
    }

    /// Clip every stored interval to `[bound_first, bound_last]`,
    /// dropping those that fall entirely outside it.
    pub fn clip_to_bounds(&self, bound_first: u64, bound_last: u64) -> Vec<(u64, u64)> {
        self.regions
            .iter()
            .filter_map(|&(f, l)| {
                if l < bound_first || bound_last < f {
                    None
                } else {
                    Some((f.max(bound_first), l.min(bound_last)))
                }
            })
            .collect()
    }

    /// The complement of this set within `[bound_first, bound_last]`.
    pub fn missing_within(&self, bound_first: u64, bound_last: u64) -> Vec<(u64, u64)> {
        if bound_first > bound_last {
            return Vec::new();
        }
        let mut gaps = Vec::new();
        let mut cursor = bound_first;
        for (f, l) in self.clip_to_bounds(bound_first, bound_last) {
            if cursor < f {
                gaps.push((cursor, f - 1));
            }
            cursor = l + 1;
        }
        if cursor <= bound_last {
            gaps.push((cursor, bound_last));
        }
        gaps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_merges_overlapping_and_adjacent() {
        let mut set = ByteRegionSet::new();
        set.add(0, 3);
        set.add(4, 7);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![(0, 7)]);
        set.add(20, 25);
        set.add(10, 15);
        assert_eq!(
            set.iter().collect::<Vec<_>>(),
            vec![(0, 7), (10, 15), (20, 25)]
        );
    }

    #[test]
    fn remove_splits_partial_overlap() {
        let mut set = ByteRegionSet::new();
        set.add(0, 9);
        set.remove(3, 5);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![(0, 2), (6, 9)]);
    }

    #[test]
    fn missing_within_finds_every_gap() {
        let mut set = ByteRegionSet::new();
        set.add(2, 4);
        set.add(8, 9);
        assert_eq!(
            set.missing_within(0, 10),
            vec![(0, 1), (5, 7), (10, 10)]
        );
    }

    #[test]
    fn missing_within_empty_set_is_whole_bound() {
        let set = ByteRegionSet::new();
        assert_eq!(set.missing_within(0, 5), vec![(0, 5)]);
    }

    #[test]
    fn clip_to_bounds_drops_outside_and_trims_overlap() {
        let mut set = ByteRegionSet::new();
        set.add(0, 2);
        set.add(5, 10);
        assert_eq!(set.clip_to_bounds(1, 6), vec![(1, 2), (5, 6)]);
    }
}
