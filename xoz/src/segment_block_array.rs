//! A block array whose storage is a segment allocated inside a *parent*
//! block array.
//!
//! The inner blocks are logically contiguous even though the backing
//! segment may scatter them across the parent; reads and writes simply run
//! through an [`IoSegment`] over the parent. Growing asks the parent's
//! allocator for more bytes (sub-blocks allowed, inline forbidden: a
//! segment with inline data cannot back addressable blocks); since the
//! parent allocates at its own granularity, the array may end up with more
//! capacity than requested, which later grows consume first.

use log::debug;

use crate::allocator::{AllocRequest, SegmentAllocator};
use crate::block_array::{BlockArray, BlockArrayState};
use crate::error::{Error, Result};
use crate::io::{IoBase, Seekdir};
use crate::iosegment::IoSegment;
use crate::segment::Segment;

/// On grow, first try to widen the trailing suballoc'd extent in place
/// instead of appending a new extent.
pub const SG_BLKARR_REALLOC_ON_GROW: u32 = 0x0001;

#[derive(Debug)]
pub struct SegmentBlockArray<'a, A: BlockArray> {
    state: BlockArrayState,
    sg: Segment,
    parent: &'a mut A,
    palloc: &'a mut SegmentAllocator,
    flags: u32,
    initialized: bool,
}

impl<'a, A: BlockArray> SegmentBlockArray<'a, A> {
    /// An uninitialized array: call `initialize_segment` exactly once
    /// before any other operation. `inner_blk_sz` must be a power of two
    /// strictly smaller than the parent's block size.
    pub fn new(
        parent: &'a mut A,
        palloc: &'a mut SegmentAllocator,
        inner_blk_sz: u32,
        flags: u32,
    ) -> Result<SegmentBlockArray<'a, A>> {
        if inner_blk_sz >= parent.blk_sz() {
            return Err(Error::InvalidArgument(format!(
                "inner block size {} must be smaller than the parent's block size {}",
                inner_blk_sz,
                parent.blk_sz()
            )));
        }
        Ok(SegmentBlockArray {
            state: BlockArrayState::new(inner_blk_sz, 0, 0)?,
            sg: Segment::new(parent.blk_sz_order()),
            parent,
            palloc,
            flags,
            initialized: false,
        })
    }

    /// `new` + `initialize_segment` in one go.
    pub fn from_segment(
        sg: Segment,
        parent: &'a mut A,
        palloc: &'a mut SegmentAllocator,
        inner_blk_sz: u32,
        flags: u32,
    ) -> Result<SegmentBlockArray<'a, A>> {
        let mut arr = Self::new(parent, palloc, inner_blk_sz, flags)?;
        arr.initialize_segment(sg)?;
        Ok(arr)
    }

    /// Adopt the backing segment. The segment must not carry inline data
    /// (a zero-length inline marker is silently stripped). All the blocks
    /// it covers start out as used.
    pub fn initialize_segment(&mut self, mut sg: Segment) -> Result<()> {
        if self.initialized {
            return Err(Error::AlreadyInitialized(
                "the segment block array is already initialized".to_string(),
            ));
        }
        if sg.inline_data_sz() > 0 {
            return Err(Error::InvalidArgument(format!(
                "a segment with {} bytes of inline data cannot back a block array",
                sg.inline_data_sz()
            )));
        }
        sg.remove_inline_data();

        let capacity = self.segment_data_sz(&sg) / self.state_blk_sz();
        self.state = BlockArrayState::new(self.state_blk_sz(), 0, capacity)?;
        self.sg = sg;
        self.initialized = true;
        Ok(())
    }

    /// The backing segment as it stands; the owner persists this to later
    /// rebuild the array.
    pub fn segment(&self) -> Result<&Segment> {
        self.fail_if_not_initialized()?;
        Ok(&self.sg)
    }

    fn state_blk_sz(&self) -> u32 {
        // accessor that does not require initialization
        self.ba_state().blk_sz()
    }

    fn segment_data_sz(&self, sg: &Segment) -> u32 {
        let order = self.parent.blk_sz_order();
        sg.extents().iter().map(|e| e.calc_data_space_size(order)).sum()
    }

    fn fail_if_not_initialized(&self) -> Result<()> {
        if !self.initialized {
            return Err(Error::InconsistentState(
                "the segment block array was not initialized with a segment".to_string(),
            ));
        }
        Ok(())
    }
}

impl<A: BlockArray> BlockArray for SegmentBlockArray<'_, A> {
    fn ba_state(&self) -> &BlockArrayState {
        &self.state
    }

    fn ba_state_mut(&mut self) -> &mut BlockArrayState {
        &mut self.state
    }

    fn impl_grow_by_blocks(&mut self, blk_cnt: u32) -> Result<()> {
        self.fail_if_not_initialized()?;
        let inner_sz = self.blk_sz();
        let bytes_needed = blk_cnt * inner_sz;
        let subblk_sz = self.parent.subblk_sz();

        let mut satisfied = false;
        if self.flags & SG_BLKARR_REALLOC_ON_GROW != 0 {
            if let Some(last) = self.sg.extents().last().copied() {
                if last.is_suballoc() {
                    let subblk_cnt = bytes_needed.div_ceil(subblk_sz) as u16;
                    if let Some(wider) = self.palloc.try_expand_suballoc(&last, subblk_cnt) {
                        self.sg.set_last_extent(wider);
                        satisfied = true;
                    }
                }
            }
        }

        if !satisfied {
            let req = AllocRequest {
                allow_inline: false,
                ..AllocRequest::default()
            };
            let got = self.palloc.alloc_with(&mut *self.parent, bytes_needed, &req)?;
            for ext in got.extents() {
                self.sg.add_extent(*ext);
            }
        }

        // the parent's granularity may have given us more than asked
        let capacity = self.segment_data_sz(&self.sg) / inner_sz;
        self.state.set_capacity_end_blk_nr(capacity);
        debug!(
            "segment block array grew by {} inner blocks (capacity {})",
            blk_cnt, capacity
        );
        Ok(())
    }

    fn impl_release_blocks(&mut self) -> Result<u32> {
        self.fail_if_not_initialized()?;
        let inner_sz = self.blk_sz();
        let parent_order = self.parent.blk_sz_order();
        let subblk_sz = self.parent.subblk_sz();
        let blk_sz = self.parent.blk_sz();

        let need_bytes = self.past_end_blk_nr() * inner_sz;
        let mut data_sz = self.segment_data_sz(&self.sg);
        let mut removed = Segment::new(parent_order);

        while let Some(last) = self.sg.extents().last().copied() {
            let esz = last.calc_data_space_size(parent_order);
            if data_sz - esz >= need_bytes {
                self.sg.pop_extent();
                if !last.is_empty_space() {
                    removed.add_extent(last);
                }
                data_sz -= esz;
                continue;
            }

            // partial trim of the trailing extent, at the parent's own
            // granularity (sub-blocks for suballoc'd extents, whole
            // blocks otherwise)
            let surplus = data_sz - need_bytes;
            let unit = if last.is_suballoc() { subblk_sz } else { blk_sz };
            let units_to_free = (surplus / unit) as u16;
            if units_to_free > 0 {
                let mut kept = last;
                let total_units = if last.is_suballoc() {
                    last.subblk_cnt()
                } else {
                    last.blk_cnt()
                };
                let freed = kept.split(total_units - units_to_free)?;
                self.sg.set_last_extent(kept);
                removed.add_extent(freed);
                data_sz -= u32::from(units_to_free) * unit;
            }
            break;
        }

        let old_capacity = self.capacity();
        let new_capacity = data_sz / inner_sz;

        if removed.ext_cnt() > 0 {
            self.palloc.dealloc(&mut *self.parent, &removed)?;
        }
        debug!(
            "segment block array released {} inner blocks back to the parent",
            old_capacity - new_capacity
        );
        Ok(old_capacity - new_capacity)
    }

    fn impl_read(&mut self, blk_nr: u32, offset: u32, buf: &mut [u8]) -> Result<()> {
        self.fail_if_not_initialized()?;
        let pos = blk_nr * self.state.blk_sz() + offset;
        let mut io = IoSegment::new(&mut *self.parent, &mut self.sg);
        io.seek_rd(pos, Seekdir::Beg);
        io.readall(buf)
    }

    fn impl_write(&mut self, blk_nr: u32, offset: u32, buf: &[u8]) -> Result<()> {
        self.fail_if_not_initialized()?;
        let pos = blk_nr * self.state.blk_sz() + offset;
        let mut io = IoSegment::new(&mut *self.parent, &mut self.sg);
        io.seek_wr(pos, Seekdir::Beg);
        io.writeall(buf)
    }
}
