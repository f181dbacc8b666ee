//! General-purpose allocator over a block array.
//!
//! The allocation unit is one byte of data space, but space is only ever
//! realized as full-block runs, sub-blocks of a shared block, or inline
//! bytes packed into the returned segment, tried in that order of
//! granularity: full blocks from the free pool (or the tail), a remainder
//! smaller than a block from a shared block's bitmap, and a small-enough
//! remainder straight into the inline tail when the caller allows it.
//!
//! The allocator owns only its free-pool view. The block array is borrowed
//! per call; no allocator call re-enters another.

use std::collections::BTreeMap;

use log::debug;

use crate::block_array::BlockArray;
use crate::error::{Error, Result};
use crate::extent::{Extent, SUBBLK_CNT_PER_BLK};
use crate::free_map::FreeMap;
use crate::segment::{Segment, INLINE_SZ_MAX};
use crate::subblock_map::SubBlockFreeMap;
use crate::tail_allocator::TailAllocator;

/// Knobs for a single allocation.
#[derive(Debug, Clone, Copy)]
pub struct AllocRequest {
    /// Allow a sub-block remainder carved from a shared block.
    pub allow_suballoc: bool,
    /// Allow a small remainder packed as the segment's inline tail.
    pub allow_inline: bool,
    /// Cap for the inline remainder (hard-capped at 63 bytes anyway).
    pub max_inline_sz: u16,
}

impl Default for AllocRequest {
    fn default() -> AllocRequest {
        AllocRequest {
            allow_suballoc: true,
            allow_inline: true,
            max_inline_sz: INLINE_SZ_MAX,
        }
    }
}

#[derive(Default, Debug)]
pub struct SegmentAllocator {
    fr_map: FreeMap,
    subfr_map: SubBlockFreeMap,
    initialized: bool,
}

impl SegmentAllocator {
    pub fn new() -> SegmentAllocator {
        SegmentAllocator::default()
    }

    /// Allocate `sz` bytes of data space as a fresh segment.
    pub fn alloc<A: BlockArray>(&mut self, ba: &mut A, sz: u32) -> Result<Segment> {
        self.alloc_with(ba, sz, &AllocRequest::default())
    }

    pub fn alloc_with<A: BlockArray>(&mut self, ba: &mut A, sz: u32, req: &AllocRequest) -> Result<Segment> {
        if sz == 0 {
            return Err(Error::InvalidArgument(
                "cannot allocate zero bytes of data space".to_string(),
            ));
        }

        let order = ba.blk_sz_order();
        let subblk_sz = ba.subblk_sz();

        let mut full_cnt = sz >> order;
        let remain = sz - (full_cnt << order);

        let mut inline_sz: u16 = 0;
        let mut subblk_cnt: u16 = 0;
        if remain > 0 {
            let max_inline = u32::from(req.max_inline_sz.min(INLINE_SZ_MAX));
            if req.allow_inline && remain <= max_inline {
                inline_sz = remain as u16;
            } else {
                let cnt = remain.div_ceil(subblk_sz);
                if req.allow_suballoc && cnt < SUBBLK_CNT_PER_BLK {
                    subblk_cnt = cnt as u16;
                } else {
                    full_cnt += 1;
                }
            }
        }

        let mut sg = Segment::new(order);
        self.alloc_full_runs(ba, full_cnt, &mut sg)?;
        if subblk_cnt > 0 {
            let ext = self.alloc_subblk(ba, subblk_cnt)?;
            sg.add_extent(ext);
        }
        if inline_sz > 0 {
            sg.reserve_inline_data(inline_sz)?;
        }

        debug!(
            "allocated {} bytes as {} extents + {} inline bytes",
            sz,
            sg.ext_cnt(),
            inline_sz
        );
        Ok(sg)
    }

    /// Return every extent of the segment to the pools. The inline tail,
    /// having no backing storage, just vanishes with the segment.
    pub fn dealloc<A: BlockArray>(&mut self, ba: &mut A, sg: &Segment) -> Result<()> {
        // validate everything up front so a bogus segment cannot leave the
        // pools half updated
        for ext in sg.extents() {
            if !ext.is_empty_space() {
                ba.fail_if_out_of_boundaries(ext, "dealloc")?;
            }
        }
        for ext in sg.extents() {
            self.dealloc_extent_unchecked(ext)?;
        }
        debug!("deallocated segment with {} extents", sg.ext_cnt());
        Ok(())
    }

    /// One-extent convenience for dense fixed-layout callers: the space
    /// comes back as a single extent (sub-block based when it fits in a
    /// shared block, one full-block run otherwise).
    pub fn alloc_single_extent<A: BlockArray>(&mut self, ba: &mut A, sz: u32) -> Result<Extent> {
        if sz == 0 {
            return Err(Error::InvalidArgument(
                "cannot allocate zero bytes of data space".to_string(),
            ));
        }

        let subblk_cnt = sz.div_ceil(ba.subblk_sz());
        if subblk_cnt < SUBBLK_CNT_PER_BLK {
            return self.alloc_subblk(ba, subblk_cnt as u16);
        }

        let blk_cnt = sz.div_ceil(ba.blk_sz());
        if blk_cnt > u32::from(u16::MAX) {
            return Err(Error::InvalidArgument(format!(
                "{sz} bytes do not fit in a single extent"
            )));
        }
        match self.fr_map.alloc(blk_cnt as u16) {
            Some(ext) => Ok(ext),
            None => TailAllocator::alloc(ba, blk_cnt as u16),
        }
    }

    pub fn dealloc_single_extent<A: BlockArray>(&mut self, ba: &mut A, ext: &Extent) -> Result<()> {
        if !ext.is_empty_space() {
            ba.fail_if_out_of_boundaries(ext, "dealloc")?;
        }
        self.dealloc_extent_unchecked(ext)
    }

    /// Try to widen a suballoc'd extent in place with more free sub-blocks
    /// of the same shared block. Returns the widened extent, or `None`
    /// when the shared block cannot give that much.
    pub fn try_expand_suballoc(&mut self, ext: &Extent, subblk_cnt: u16) -> Option<Extent> {
        if !ext.is_suballoc() || subblk_cnt == 0 {
            return None;
        }
        let more = self.subfr_map.take_bits(ext.blk_nr(), subblk_cnt)?;
        Some(Extent::new_unchecked(ext.blk_nr(), ext.blk_bitmap() | more, true))
    }

    /// Rebuild the free state from the segments that are known to be in
    /// use (say, rediscovered from on-disk data): the free space is
    /// `[begin, past_end)` minus their union. Overlapping declarations are
    /// rejected.
    pub fn initialize_from_allocated<A: BlockArray>(&mut self, ba: &A, segments: &[Segment]) -> Result<()> {
        if self.initialized {
            return Err(Error::InconsistentState(
                "the allocator was already initialized".to_string(),
            ));
        }

        // gather what is in use; shared blocks merge their bitmaps
        let mut spans: Vec<(u32, u32, Extent)> = Vec::new();
        let mut shared: BTreeMap<u32, (u16, Extent)> = BTreeMap::new();

        for sg in segments {
            for ext in sg.extents() {
                if ext.is_empty_space() && !ext.is_suballoc() {
                    continue;
                }
                ba.fail_if_out_of_boundaries(ext, "allocator initialization")?;

                if ext.is_suballoc() {
                    let entry = shared.entry(ext.blk_nr()).or_insert((0u16, *ext));
                    if entry.0 & ext.blk_bitmap() != 0 {
                        return Err(Error::ExtentOverlap {
                            target: ext.to_string(),
                            reference: entry.1.to_string(),
                            position: "at same start",
                        });
                    }
                    entry.0 |= ext.blk_bitmap();
                } else {
                    spans.push((ext.blk_nr(), ext.past_end_blk_nr(), *ext));
                }
            }
        }

        for (blk_nr, (_, repr)) in &shared {
            spans.push((*blk_nr, *blk_nr + 1, *repr));
        }
        spans.sort_by_key(|(start, end, _)| (*start, *end));

        for win in spans.windows(2) {
            let (a_start, a_end, a_ext) = &win[0];
            let (b_start, _, b_ext) = &win[1];
            if *b_start < *a_end {
                return Err(Error::ExtentOverlap {
                    target: b_ext.to_string(),
                    reference: a_ext.to_string(),
                    position: if b_start == a_start {
                        "at same start"
                    } else {
                        "ext start is ahead ref"
                    },
                });
            }
        }

        // the free space is the complement over [begin, past_end)
        let mut cursor = ba.begin_blk_nr();
        for (start, end, _) in &spans {
            if *start > cursor {
                self.add_free_run(cursor, *start)?;
            }
            cursor = cursor.max(*end);
        }
        if ba.past_end_blk_nr() > cursor {
            self.add_free_run(cursor, ba.past_end_blk_nr())?;
        }

        for (blk_nr, (used, _)) in shared {
            self.subfr_map.register_shared_blk_partial(blk_nr, !used)?;
        }

        self.initialized = true;
        debug!(
            "allocator initialized from {} segments: {} free blocks, {} free sub-blocks",
            segments.len(),
            self.fr_map.free_blk_cnt(),
            self.subfr_map.free_subblk_cnt()
        );
        Ok(())
    }

    /// Give tail-adjacent free runs back to the array and force the
    /// physical storage down. Returns the count of released blocks.
    pub fn release<A: BlockArray>(&mut self, ba: &mut A) -> Result<u32> {
        while let Some(ext) = self.fr_map.take_tail(ba.past_end_blk_nr()) {
            let shrunk = TailAllocator::dealloc(ba, &ext)?;
            debug_assert!(shrunk);
        }
        ba.release_blocks()
    }

    /// Free blocks currently pooled (full-block runs only).
    pub fn free_blk_cnt(&self) -> u64 {
        self.fr_map.free_blk_cnt()
    }

    /// Free sub-blocks currently pooled across all shared blocks.
    pub fn free_subblk_cnt(&self) -> u64 {
        self.subfr_map.free_subblk_cnt()
    }

    fn alloc_full_runs<A: BlockArray>(&mut self, ba: &mut A, mut blk_cnt: u32, sg: &mut Segment) -> Result<()> {
        while blk_cnt > 0 {
            let chunk = blk_cnt.min(u32::from(u16::MAX)) as u16;
            let ext = if let Some(ext) = self.fr_map.alloc(chunk) {
                ext
            } else if let Some(ext) = self.fr_map.alloc_up_to(chunk) {
                ext
            } else {
                TailAllocator::alloc(ba, chunk)?
            };
            blk_cnt -= u32::from(ext.blk_cnt());
            sg.add_extent(ext);
        }
        Ok(())
    }

    fn alloc_subblk<A: BlockArray>(&mut self, ba: &mut A, subblk_cnt: u16) -> Result<Extent> {
        if let Some(ext) = self.subfr_map.alloc(subblk_cnt) {
            return Ok(ext);
        }

        // no shared block has room: broach a new one
        let blk = match self.fr_map.alloc(1) {
            Some(ext) => ext,
            None => TailAllocator::alloc(ba, 1)?,
        };
        self.subfr_map.register_shared_blk(blk.blk_nr())?;
        self.subfr_map.alloc(subblk_cnt).ok_or_else(|| {
            Error::InconsistentState(
                "a freshly broached shared block could not satisfy a sub-block allocation".to_string(),
            )
        })
    }

    fn dealloc_extent_unchecked(&mut self, ext: &Extent) -> Result<()> {
        if ext.is_suballoc() {
            if ext.blk_bitmap() == 0 {
                return Ok(());
            }
            if let Some(freed_blk) = self.subfr_map.dealloc(ext)? {
                self.fr_map.dealloc(&freed_blk)?;
            }
        } else if ext.blk_cnt() > 0 {
            self.fr_map.dealloc(ext)?;
        }
        Ok(())
    }

    fn add_free_run(&mut self, mut start: u32, end: u32) -> Result<()> {
        while start < end {
            let cnt = (end - start).min(u32::from(u16::MAX)) as u16;
            self.fr_map.dealloc(&Extent::new_unchecked(start, cnt, false))?;
            start += u32::from(cnt);
        }
        Ok(())
    }
}
