//! The tail allocator only ever touches the end of a block array: it
//! allocates by growing past the tail and deallocates only extents that
//! end exactly at the tail, shrinking the array back. Anything else is
//! politely declined (`false`) so a caller with a free list can keep the
//! extent around for later.

use log::trace;

use crate::block_array::BlockArray;
use crate::error::{Error, Result};
use crate::extent::Extent;

pub struct TailAllocator;

impl TailAllocator {
    /// Grow the array by `blk_cnt` blocks and return the run as an extent.
    pub fn alloc<A: BlockArray>(ba: &mut A, blk_cnt: u16) -> Result<Extent> {
        if blk_cnt == 0 {
            return Err(Error::InvalidArgument(
                "cannot allocate an extent of zero blocks".to_string(),
            ));
        }
        let old_past_end = ba.grow_by_blocks(blk_cnt)?;
        trace!("tail alloc: {} blocks at {}", blk_cnt, old_past_end);
        Extent::new(old_past_end, blk_cnt, false)
    }

    /// Shrink the array iff `ext` ends exactly at the tail. Returns `true`
    /// when the blocks were returned, `false` when the extent is interior
    /// and nothing happened.
    pub fn dealloc<A: BlockArray>(ba: &mut A, ext: &Extent) -> Result<bool> {
        if ext.is_suballoc() {
            return Err(Error::InvalidArgument(
                "cannot deallocate a suballoc'd extent through the tail allocator".to_string(),
            ));
        }
        if ext.blk_cnt() == 0 {
            return Err(Error::InvalidArgument(
                "cannot deallocate an extent of zero blocks".to_string(),
            ));
        }

        ba.fail_if_out_of_boundaries(ext, "dealloc")?;

        if ext.past_end_blk_nr() != ba.past_end_blk_nr() {
            return Ok(false);
        }

        ba.shrink_by_blocks(u32::from(ext.blk_cnt()))?;
        trace!("tail dealloc: {} blocks, past_end now {}", ext.blk_cnt(), ba.past_end_blk_nr());
        Ok(true)
    }
}
