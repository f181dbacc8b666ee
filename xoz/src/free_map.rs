//! Free pool of full-block runs.
//!
//! The pool is indexed twice: by starting block number, so a deallocation
//! can coalesce with its lower and higher neighbours in one lookup, and by
//! run length, so an allocation can grab the best-fitting run without
//! scanning. Both views always describe the same set of runs.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Error, Result};
use crate::extent::Extent;

/// Requests of at least this many blocks avoid leaving tiny leftovers
/// behind (see `MIN_LEFTOVER_BLKS`).
const SPLIT_ABOVE_THRESHOLD_BLKS: u16 = 4;

/// A split that would leave a leftover smaller than this is taken only
/// when no friendlier run exists.
const MIN_LEFTOVER_BLKS: u16 = 2;

#[derive(Default, Debug)]
pub(crate) struct FreeMap {
    by_blk: BTreeMap<u32, u16>,
    by_cnt: BTreeMap<u16, BTreeSet<u32>>,
}

impl FreeMap {
    pub fn new() -> FreeMap {
        FreeMap::default()
    }

    pub fn is_empty(&self) -> bool {
        self.by_blk.is_empty()
    }

    /// Total free blocks in the pool.
    pub fn free_blk_cnt(&self) -> u64 {
        self.by_blk.values().map(|c| u64::from(*c)).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, u16)> + '_ {
        self.by_blk.iter().map(|(nr, cnt)| (*nr, *cnt))
    }

    fn insert(&mut self, blk_nr: u32, blk_cnt: u16) {
        debug_assert!(blk_cnt > 0);
        self.by_blk.insert(blk_nr, blk_cnt);
        self.by_cnt.entry(blk_cnt).or_default().insert(blk_nr);
    }

    fn remove(&mut self, blk_nr: u32, blk_cnt: u16) {
        self.by_blk.remove(&blk_nr);
        if let Some(set) = self.by_cnt.get_mut(&blk_cnt) {
            set.remove(&blk_nr);
            if set.is_empty() {
                self.by_cnt.remove(&blk_cnt);
            }
        }
    }

    /// Return a run to the pool, coalescing with adjacent runs. A run that
    /// overlaps something already free is a double free.
    pub fn dealloc(&mut self, ext: &Extent) -> Result<()> {
        debug_assert!(!ext.is_suballoc());
        let mut start = ext.blk_nr();
        let mut end = ext.past_end_blk_nr();
        if start == end {
            return Ok(());
        }

        // the nearest free run at or below the new one
        if let Some((&p_nr, &p_cnt)) = self.by_blk.range(..=start).next_back() {
            let p_end = p_nr + u32::from(p_cnt);
            if p_end > start || p_nr == start {
                return Err(Error::InconsistentState(format!(
                    "free of extent {} overlaps the already free run at block {} of {} blocks",
                    ext, p_nr, p_cnt
                )));
            }
            if p_end == start && u32::from(p_cnt) + (end - start) <= u32::from(u16::MAX) {
                self.remove(p_nr, p_cnt);
                start = p_nr;
            }
        }

        // the nearest free run above
        if let Some((&n_nr, &n_cnt)) = self.by_blk.range(ext.blk_nr()..).next() {
            if n_nr < end {
                return Err(Error::InconsistentState(format!(
                    "free of extent {} overlaps the already free run at block {} of {} blocks",
                    ext, n_nr, n_cnt
                )));
            }
            if n_nr == end && (end - start) + u32::from(n_cnt) <= u32::from(u16::MAX) {
                self.remove(n_nr, n_cnt);
                end = n_nr + u32::from(n_cnt);
            }
        }

        self.insert(start, (end - start) as u16);
        Ok(())
    }

    /// Best-fit allocation of exactly `blk_cnt` blocks, splitting a larger
    /// run when needed. Returns `None` when no single run is big enough.
    ///
    /// Large requests prefer runs whose leftover would be zero or at least
    /// `MIN_LEFTOVER_BLKS`; an undersized-leftover run is used only as the
    /// last resort so the pool does not fill up with unusable crumbs.
    pub fn alloc(&mut self, blk_cnt: u16) -> Option<Extent> {
        if blk_cnt == 0 {
            return None;
        }

        let mut fallback: Option<(u32, u16)> = None;
        let mut chosen: Option<(u32, u16)> = None;

        for (&cnt, blks) in self.by_cnt.range(blk_cnt..) {
            let Some(&blk_nr) = blks.iter().next() else {
                continue;
            };
            let leftover = cnt - blk_cnt;
            if blk_cnt >= SPLIT_ABOVE_THRESHOLD_BLKS && leftover > 0 && leftover < MIN_LEFTOVER_BLKS {
                if fallback.is_none() {
                    fallback = Some((blk_nr, cnt));
                }
                continue;
            }
            chosen = Some((blk_nr, cnt));
            break;
        }

        let (blk_nr, cnt) = chosen.or(fallback)?;
        self.remove(blk_nr, cnt);
        if cnt > blk_cnt {
            self.insert(blk_nr + u32::from(blk_cnt), cnt - blk_cnt);
        }

        Some(Extent::new_unchecked(blk_nr, blk_cnt, false))
    }

    /// Take the largest run not exceeding `max_cnt` blocks; used to drain
    /// the pool before falling back to the tail.
    pub fn alloc_up_to(&mut self, max_cnt: u16) -> Option<Extent> {
        let (&cnt, blks) = self.by_cnt.range(..=max_cnt).next_back()?;
        let blk_nr = *blks.iter().next()?;
        self.remove(blk_nr, cnt);
        Some(Extent::new_unchecked(blk_nr, cnt, false))
    }

    /// Pop the run that ends exactly at `past_end`, if any; the tail
    /// allocator can then shrink the array by it.
    pub fn take_tail(&mut self, past_end: u32) -> Option<Extent> {
        let (&blk_nr, &cnt) = self.by_blk.range(..past_end).next_back()?;
        if blk_nr + u32::from(cnt) != past_end {
            return None;
        }
        self.remove(blk_nr, cnt);
        Some(Extent::new_unchecked(blk_nr, cnt, false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ext(blk_nr: u32, cnt: u16) -> Extent {
        Extent::new(blk_nr, cnt, false).unwrap()
    }

    #[test]
    fn test_alloc_empty() {
        let mut fm = FreeMap::new();
        assert!(fm.is_empty());
        assert!(fm.alloc(1).is_none());
        assert!(fm.alloc_up_to(10).is_none());
    }

    #[test]
    fn test_dealloc_then_alloc_exact() {
        let mut fm = FreeMap::new();
        fm.dealloc(&ext(10, 3)).unwrap();
        assert_eq!(fm.free_blk_cnt(), 3);

        let got = fm.alloc(3).unwrap();
        assert_eq!(got, ext(10, 3));
        assert!(fm.is_empty());
    }

    #[test]
    fn test_alloc_splits_best_fit() {
        let mut fm = FreeMap::new();
        fm.dealloc(&ext(10, 8)).unwrap();
        fm.dealloc(&ext(100, 3)).unwrap();

        // 2 blocks best-fit from the 3-run, leftover re-pooled
        let got = fm.alloc(2).unwrap();
        assert_eq!(got, ext(100, 2));
        assert_eq!(fm.free_blk_cnt(), 8 + 1);

        let got = fm.alloc(8).unwrap();
        assert_eq!(got, ext(10, 8));

        let got = fm.alloc(1).unwrap();
        assert_eq!(got, ext(102, 1));
        assert!(fm.is_empty());
    }

    #[test]
    fn test_coalesce_lower_and_higher() {
        let mut fm = FreeMap::new();
        fm.dealloc(&ext(10, 2)).unwrap();
        fm.dealloc(&ext(14, 2)).unwrap();
        assert_eq!(fm.iter().collect::<Vec<_>>(), vec![(10, 2), (14, 2)]);

        // the middle run glues everything into one
        fm.dealloc(&ext(12, 2)).unwrap();
        assert_eq!(fm.iter().collect::<Vec<_>>(), vec![(10, 6)]);

        let got = fm.alloc(6).unwrap();
        assert_eq!(got, ext(10, 6));
    }

    #[test]
    fn test_double_free_detected() {
        let mut fm = FreeMap::new();
        fm.dealloc(&ext(10, 4)).unwrap();

        let err = fm.dealloc(&ext(10, 4)).unwrap_err();
        assert!(matches!(err, Error::InconsistentState(_)));

        let err = fm.dealloc(&ext(12, 1)).unwrap_err();
        assert!(matches!(err, Error::InconsistentState(_)));

        let err = fm.dealloc(&ext(8, 3)).unwrap_err();
        assert!(matches!(err, Error::InconsistentState(_)));
    }

    #[test]
    fn test_split_policy_avoids_tiny_leftover() {
        let mut fm = FreeMap::new();
        fm.dealloc(&ext(10, 5)).unwrap(); // leftover would be 1: shunned
        fm.dealloc(&ext(100, 8)).unwrap(); // leftover 4: fine

        let got = fm.alloc(4).unwrap();
        assert_eq!(got, ext(100, 4));
        assert_eq!(fm.iter().collect::<Vec<_>>(), vec![(10, 5), (104, 4)]);

        // with only the crumb-producing run left, it is still used
        let got = fm.alloc(4).unwrap();
        assert_eq!(got, ext(104, 4));
        let got = fm.alloc(4).unwrap();
        assert_eq!(got, ext(10, 4));
        assert_eq!(fm.iter().collect::<Vec<_>>(), vec![(14, 1)]);
    }

    #[test]
    fn test_small_requests_split_freely() {
        let mut fm = FreeMap::new();
        fm.dealloc(&ext(10, 4)).unwrap();

        // a request under the threshold may leave a 1-block crumb
        let got = fm.alloc(3).unwrap();
        assert_eq!(got, ext(10, 3));
        assert_eq!(fm.iter().collect::<Vec<_>>(), vec![(13, 1)]);
    }

    #[test]
    fn test_alloc_up_to_drains_largest() {
        let mut fm = FreeMap::new();
        fm.dealloc(&ext(10, 2)).unwrap();
        fm.dealloc(&ext(50, 6)).unwrap();

        let got = fm.alloc_up_to(4).unwrap();
        assert_eq!(got, ext(10, 2));

        let got = fm.alloc_up_to(10).unwrap();
        assert_eq!(got, ext(50, 6));
        assert!(fm.is_empty());
    }

    #[test]
    fn test_take_tail() {
        let mut fm = FreeMap::new();
        fm.dealloc(&ext(10, 2)).unwrap();
        fm.dealloc(&ext(20, 5)).unwrap();

        assert!(fm.take_tail(24).is_none());
        let got = fm.take_tail(25).unwrap();
        assert_eq!(got, ext(20, 5));
        assert!(fm.take_tail(25).is_none());

        let got = fm.take_tail(12).unwrap();
        assert_eq!(got, ext(10, 2));
        assert!(fm.is_empty());
    }
}
