//! Free pool of sub-blocks, one bitmap per *shared block*.
//!
//! Every shared block is owned by exactly one entry here. A set bit means
//! the sub-block is free; allocation hands out the highest free bits first
//! so bitmaps stay packed towards the MSB, the same order the read/write
//! walk follows. A shared block whose 16 sub-blocks all return home leaves
//! the pool and goes back to the full-block world.

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::extent::{Extent, SUBBLK_CNT_PER_BLK};

#[derive(Default, Debug)]
pub(crate) struct SubBlockFreeMap {
    // blk_nr -> bitmap of free sub-blocks
    by_blk: BTreeMap<u32, u16>,
}

impl SubBlockFreeMap {
    pub fn new() -> SubBlockFreeMap {
        SubBlockFreeMap::default()
    }

    pub fn is_empty(&self) -> bool {
        self.by_blk.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, u16)> + '_ {
        self.by_blk.iter().map(|(nr, bm)| (*nr, *bm))
    }

    /// Total free sub-blocks across all shared blocks.
    pub fn free_subblk_cnt(&self) -> u64 {
        self.by_blk.values().map(|bm| u64::from(bm.count_ones())).sum()
    }

    /// Bring a brand new shared block under management, fully free.
    pub fn register_shared_blk(&mut self, blk_nr: u32) -> Result<()> {
        if self.by_blk.insert(blk_nr, 0xffff).is_some() {
            return Err(Error::InconsistentState(format!(
                "block {blk_nr} is already managed as a shared block"
            )));
        }
        Ok(())
    }

    /// Adopt a shared block rediscovered from disk with only `free_bitmap`
    /// sub-blocks free (used by allocator initialization).
    pub fn register_shared_blk_partial(&mut self, blk_nr: u32, free_bitmap: u16) -> Result<()> {
        if self.by_blk.insert(blk_nr, free_bitmap).is_some() {
            return Err(Error::InconsistentState(format!(
                "block {blk_nr} is already managed as a shared block"
            )));
        }
        Ok(())
    }

    /// Carve `subblk_cnt` sub-blocks out of the shared block that fits
    /// best: the one with the fewest free sub-blocks still large enough,
    /// so nearly-full blocks fill up before fresh ones are broached.
    pub fn alloc(&mut self, subblk_cnt: u16) -> Option<Extent> {
        debug_assert!(subblk_cnt > 0 && subblk_cnt <= SUBBLK_CNT_PER_BLK as u16);

        let (&blk_nr, _) = self
            .by_blk
            .iter()
            .filter(|(_, bm)| bm.count_ones() as u16 >= subblk_cnt)
            .min_by_key(|(_, bm)| bm.count_ones())?;

        let taken = self.take_bits(blk_nr, subblk_cnt)?;
        Some(Extent::new_unchecked(blk_nr, taken, true))
    }

    /// Take `subblk_cnt` free bits (highest first) from one specific
    /// shared block, returning the bitmap of the taken bits. `None` when
    /// the block is unknown or has fewer free bits than asked.
    pub fn take_bits(&mut self, blk_nr: u32, subblk_cnt: u16) -> Option<u16> {
        let free = self.by_blk.get_mut(&blk_nr)?;
        if (free.count_ones() as u16) < subblk_cnt {
            return None;
        }

        let mut taken: u16 = 0;
        let mut left = subblk_cnt;
        for i in (0..SUBBLK_CNT_PER_BLK).rev() {
            if left == 0 {
                break;
            }
            let bit = 1u16 << i;
            if *free & bit != 0 {
                taken |= bit;
                left -= 1;
            }
        }

        *free &= !taken;
        Some(taken)
    }

    /// Return the sub-blocks of a suballoc'd extent to its shared block.
    /// When the whole block becomes free it is removed from the pool and
    /// handed back to the caller as a plain 1-block extent.
    pub fn dealloc(&mut self, ext: &Extent) -> Result<Option<Extent>> {
        debug_assert!(ext.is_suballoc());

        let free = self.by_blk.get_mut(&ext.blk_nr()).ok_or_else(|| {
            Error::InconsistentState(format!(
                "the {ext} does not belong to any managed shared block"
            ))
        })?;

        let bitmap = ext.blk_bitmap();
        if *free & bitmap != 0 {
            return Err(Error::InconsistentState(format!(
                "double free: some sub-blocks of the {ext} are already free"
            )));
        }

        *free |= bitmap;
        if *free == 0xffff {
            self.by_blk.remove(&ext.blk_nr());
            return Ok(Some(Extent::new_unchecked(ext.blk_nr(), 1, false)));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_from_fresh_block() {
        let mut sm = SubBlockFreeMap::new();
        assert!(sm.alloc(1).is_none());

        sm.register_shared_blk(7).unwrap();
        assert_eq!(sm.free_subblk_cnt(), 16);

        // highest bits first
        let ext = sm.alloc(3).unwrap();
        assert_eq!(ext.blk_nr(), 7);
        assert!(ext.is_suballoc());
        assert_eq!(ext.blk_bitmap(), 0b1110_0000_0000_0000);
        assert_eq!(sm.free_subblk_cnt(), 13);

        let ext = sm.alloc(2).unwrap();
        assert_eq!(ext.blk_bitmap(), 0b0001_1000_0000_0000);
    }

    #[test]
    fn test_alloc_prefers_fullest_block() {
        let mut sm = SubBlockFreeMap::new();
        sm.register_shared_blk(1).unwrap();
        sm.register_shared_blk(2).unwrap();

        // leave block 2 with only 2 free bits
        sm.take_bits(2, 14).unwrap();

        // a 2-bit request fits block 2 and should go there
        let ext = sm.alloc(2).unwrap();
        assert_eq!(ext.blk_nr(), 2);
        assert_eq!(ext.blk_bitmap(), 0b0000_0000_0000_0011);

        // a 3-bit request only fits block 1
        let ext = sm.alloc(3).unwrap();
        assert_eq!(ext.blk_nr(), 1);
    }

    #[test]
    fn test_dealloc_and_full_free_promotion() {
        let mut sm = SubBlockFreeMap::new();
        sm.register_shared_blk(5).unwrap();

        let e1 = sm.alloc(10).unwrap();
        let e2 = sm.alloc(6).unwrap();
        assert_eq!(sm.free_subblk_cnt(), 0);
        // the fully-used block stays managed
        assert!(!sm.is_empty());

        assert_eq!(sm.dealloc(&e1).unwrap(), None);
        assert_eq!(sm.free_subblk_cnt(), 10);

        // the last return frees the whole block: promoted out of the pool
        let freed = sm.dealloc(&e2).unwrap().unwrap();
        assert_eq!(freed, Extent::new(5, 1, false).unwrap());
        assert!(sm.is_empty());
    }

    #[test]
    fn test_double_free_and_unknown_block() {
        let mut sm = SubBlockFreeMap::new();
        sm.register_shared_blk(5).unwrap();
        let e = sm.alloc(4).unwrap();

        let stranger = Extent::new(9, 0b1, true).unwrap();
        assert!(matches!(sm.dealloc(&stranger), Err(Error::InconsistentState(_))));

        sm.dealloc(&e).unwrap();
        assert!(matches!(sm.dealloc(&e), Err(Error::InconsistentState(_))));

        assert!(matches!(
            sm.register_shared_blk(5),
            Err(Error::InconsistentState(_))
        ));
    }

    #[test]
    fn test_take_bits_for_in_place_expansion() {
        let mut sm = SubBlockFreeMap::new();
        sm.register_shared_blk(3).unwrap();
        let e = sm.alloc(4).unwrap();
        assert_eq!(e.blk_bitmap(), 0xf000);

        // expansion grabs the next highest free bits of the same block
        let more = sm.take_bits(3, 2).unwrap();
        assert_eq!(more, 0x0c00);

        assert!(sm.take_bits(3, 11).is_none());
        assert!(sm.take_bits(99, 1).is_none());
    }
}
