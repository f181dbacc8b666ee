//! Abstract blocked byte store.
//!
//! A block array exposes a range of equally sized blocks `[begin_blk_nr,
//! past_end_blk_nr)` over some physical storage. The physical storage may
//! extend further, up to `capacity_end_blk_nr`: that slack is
//! reserved-but-unused space kept around so grow/shrink cycles do not hit
//! the storage every time. `release_blocks` gives the slack back.
//!
//! Concrete implementations provide the `impl_*` hooks (raw storage grow/
//! release and raw byte IO); the trait supplies the bounds checking, the
//! zero-fill-on-grow guarantee and the sub-block bitmap walk shared by all
//! of them.

use log::debug;

use crate::error::{Error, Result};
use crate::extent::{Extent, SUBBLK_CNT_PER_BLK, SUBBLK_SIZE_ORDER};

/// Geometry and trailer state common to every block array.
#[derive(Debug)]
pub struct BlockArrayState {
    blk_sz: u32,
    blk_sz_order: u8,
    begin_blk_nr: u32,
    past_end_blk_nr: u32,
    capacity_end_blk_nr: u32,
    trailer: Vec<u8>,
}

impl BlockArrayState {
    /// `begin_blk_nr` blocks are reserved in front for a header; the array
    /// initially spans `[begin_blk_nr, past_end_blk_nr)` with no slack.
    pub fn new(blk_sz: u32, begin_blk_nr: u32, past_end_blk_nr: u32) -> Result<BlockArrayState> {
        if blk_sz == 0 || !blk_sz.is_power_of_two() {
            return Err(Error::InvalidArgument(format!(
                "block size {blk_sz} is not a power of 2"
            )));
        }
        if past_end_blk_nr < begin_blk_nr {
            return Err(Error::InvalidArgument(format!(
                "past-end block number {past_end_blk_nr} is behind the begin block number {begin_blk_nr}"
            )));
        }
        Ok(BlockArrayState {
            blk_sz,
            blk_sz_order: blk_sz.trailing_zeros() as u8,
            begin_blk_nr,
            past_end_blk_nr,
            capacity_end_blk_nr: past_end_blk_nr,
            trailer: Vec::new(),
        })
    }

    pub(crate) fn set_trailer(&mut self, trailer: Vec<u8>) {
        self.trailer = trailer;
    }

    pub(crate) fn blk_sz(&self) -> u32 {
        self.blk_sz
    }

    pub(crate) fn capacity_end_blk_nr(&self) -> u32 {
        self.capacity_end_blk_nr
    }

    pub(crate) fn trailer_clone(&self) -> Vec<u8> {
        self.trailer.clone()
    }

    pub(crate) fn set_capacity_end_blk_nr(&mut self, blk_nr: u32) {
        self.capacity_end_blk_nr = blk_nr;
    }
}

pub trait BlockArray {
    fn ba_state(&self) -> &BlockArrayState;
    fn ba_state_mut(&mut self) -> &mut BlockArrayState;

    /// Extend the physical storage by `blk_cnt` blocks past the current
    /// capacity end. The new region must read back as zeros unless the
    /// trait-level grow overwrites it anyway.
    fn impl_grow_by_blocks(&mut self, blk_cnt: u32) -> Result<()>;

    /// Return slack storage `[past_end, capacity_end)` to the system.
    /// Returns how many blocks were actually released (an implementation
    /// may be unable to release all of them due to its own granularity).
    fn impl_release_blocks(&mut self) -> Result<u32>;

    /// Raw read of `buf.len()` bytes starting at byte `offset` of block
    /// `blk_nr`. The range is within the physical storage; `offset` may
    /// run past the first block.
    fn impl_read(&mut self, blk_nr: u32, offset: u32, buf: &mut [u8]) -> Result<()>;

    /// Raw write counterpart of `impl_read`.
    fn impl_write(&mut self, blk_nr: u32, offset: u32, buf: &[u8]) -> Result<()>;

    fn blk_sz(&self) -> u32 {
        self.ba_state().blk_sz
    }

    fn blk_sz_order(&self) -> u8 {
        self.ba_state().blk_sz_order
    }

    fn subblk_sz(&self) -> u32 {
        self.blk_sz() >> SUBBLK_SIZE_ORDER
    }

    fn begin_blk_nr(&self) -> u32 {
        self.ba_state().begin_blk_nr
    }

    fn past_end_blk_nr(&self) -> u32 {
        self.ba_state().past_end_blk_nr
    }

    /// Count of usable blocks, headers excluded.
    fn blk_cnt(&self) -> u32 {
        self.ba_state().past_end_blk_nr - self.ba_state().begin_blk_nr
    }

    /// Blocks physically backed, used or not (`blk_cnt` plus the slack).
    fn capacity(&self) -> u32 {
        self.ba_state().capacity_end_blk_nr - self.ba_state().begin_blk_nr
    }

    fn is_empty(&self) -> bool {
        self.blk_cnt() == 0
    }

    /// Grow the array by `blk_cnt` blocks, reusing capacity slack when
    /// available, and return the old past-end block number (the first
    /// block of the freshly grown run). Fresh blocks read back as zeros.
    fn grow_by_blocks(&mut self, blk_cnt: u16) -> Result<u32> {
        if blk_cnt == 0 {
            return Err(Error::InvalidArgument(
                "cannot grow the block array by zero blocks".to_string(),
            ));
        }

        let old_past_end = self.past_end_blk_nr();
        let new_past_end = old_past_end + u32::from(blk_cnt);

        let capacity_end = self.ba_state().capacity_end_blk_nr;
        if new_past_end > capacity_end {
            // the implementation may over-allocate (its storage has its
            // own granularity); keep whatever capacity it reports
            self.impl_grow_by_blocks(new_past_end - capacity_end)?;
            let st = self.ba_state_mut();
            st.capacity_end_blk_nr = st.capacity_end_blk_nr.max(new_past_end);
        }

        // blocks may be recycled slack with stale content in them
        self.zero_blocks(old_past_end, new_past_end)?;

        self.ba_state_mut().past_end_blk_nr = new_past_end;
        debug!(
            "block array grew by {} blocks: past_end {} -> {}",
            blk_cnt, old_past_end, new_past_end
        );
        Ok(old_past_end)
    }

    /// Retract the past-end by `blk_cnt` blocks. The storage is not
    /// touched: the blocks become capacity slack until `release_blocks`.
    fn shrink_by_blocks(&mut self, blk_cnt: u32) -> Result<()> {
        if blk_cnt == 0 {
            return Err(Error::InvalidArgument(
                "cannot shrink the block array by zero blocks".to_string(),
            ));
        }
        if blk_cnt > self.blk_cnt() {
            return Err(Error::InvalidArgument(format!(
                "cannot shrink the block array by {} blocks, it has only {} blocks",
                blk_cnt,
                self.blk_cnt()
            )));
        }
        let st = self.ba_state_mut();
        st.past_end_blk_nr -= blk_cnt;
        debug!("block array shrank by {} blocks: past_end {}", blk_cnt, st.past_end_blk_nr);
        Ok(())
    }

    /// Force the capacity down to the past-end, returning the storage of
    /// any pending shrinks. Returns the count of blocks released.
    fn release_blocks(&mut self) -> Result<u32> {
        let slack = self.ba_state().capacity_end_blk_nr - self.ba_state().past_end_blk_nr;
        if slack == 0 {
            return Ok(0);
        }
        let released = self.impl_release_blocks()?;
        self.ba_state_mut().capacity_end_blk_nr -= released;
        debug!("block array released {} of {} slack blocks", released, slack);
        Ok(released)
    }

    /// Read from the extent's data space starting `start` bytes in, up to
    /// `buf.len()` bytes. Returns how many bytes were read; zero means end
    /// of the extent's data space (or an empty `buf`), POSIX-read style.
    fn read_extent(&mut self, ext: &Extent, buf: &mut [u8]) -> Result<u32> {
        self.read_extent_at(ext, buf, 0)
    }

    fn read_extent_at(&mut self, ext: &Extent, buf: &mut [u8], start: u32) -> Result<u32> {
        let to_read = self.chk_extent_for_rw(true, ext, buf.len() as u32, start)?;
        if to_read == 0 {
            return Ok(0);
        }
        if ext.is_suballoc() {
            self.rw_suballocated_extent_rd(ext, &mut buf[..to_read as usize], start)?;
        } else {
            self.impl_read(ext.blk_nr(), start, &mut buf[..to_read as usize])?;
        }
        Ok(to_read)
    }

    /// Write into the extent's data space starting `start` bytes in.
    /// Writes past the usable window are silently truncated; returns how
    /// many bytes were written (zero at/after the end).
    fn write_extent(&mut self, ext: &Extent, buf: &[u8]) -> Result<u32> {
        self.write_extent_at(ext, buf, 0)
    }

    fn write_extent_at(&mut self, ext: &Extent, buf: &[u8], start: u32) -> Result<u32> {
        let to_write = self.chk_extent_for_rw(false, ext, buf.len() as u32, start)?;
        if to_write == 0 {
            return Ok(0);
        }
        if ext.is_suballoc() {
            self.rw_suballocated_extent_wr(ext, &buf[..to_write as usize], start)?;
        } else {
            self.impl_write(ext.blk_nr(), start, &buf[..to_write as usize])?;
        }
        Ok(to_write)
    }

    /// Bounds/geometry check shared by reads, writes and deallocations.
    /// Returns how many bytes the operation may move (zero means EOF).
    fn chk_extent_for_rw(&self, is_read_op: bool, ext: &Extent, max_data_sz: u32, start: u32) -> Result<u32> {
        if ext.blk_nr() == 0 && self.begin_blk_nr() > 0 {
            return Err(Error::NullBlockAccess {
                operation: if is_read_op { "read" } else { "written" },
            });
        }

        // OOB is checked before the usable-space calculation so a bogus
        // zero-count extent pointing outside the array is still reported
        // as OOB and not silently treated as EOF
        self.fail_if_out_of_boundaries(ext, if is_read_op { "read" } else { "write" })?;

        let usable_sz = ext.calc_data_space_size(self.blk_sz_order());
        if usable_sz <= start {
            return Ok(0); // EOF
        }

        Ok((usable_sz - start).min(max_data_sz))
    }

    /// `ExtentOutOfBounds` unless the extent is fully inside
    /// `[begin_blk_nr, past_end_blk_nr)`.
    fn fail_if_out_of_boundaries(&self, ext: &Extent, operation: &str) -> Result<()> {
        let begin = self.begin_blk_nr();
        let past_end = self.past_end_blk_nr();

        let start = ext.blk_nr();
        let end = ext.past_end_blk_nr(); // exclusive; suballoc spans 1 block

        if start >= begin && start < past_end && end <= past_end {
            return Ok(());
        }

        let fully_out = start >= past_end || end <= begin;
        let kind = if fully_out { "completely" } else { "partially" };

        let descr = if ext.blk_span() == 0 {
            format!("The extent of 0 blocks (empty) at block {start}")
        } else {
            format!(
                "The extent of {} blocks that starts at block {} and ends at block {}",
                ext.blk_span(),
                start,
                end - 1
            )
        };

        Err(Error::ExtentOutOfBounds(format!(
            "{descr} {kind} falls out of bounds. \
             The blocks from {begin} to {} (inclusive) are within the bounds and allowed. \
             Detected on a {operation} operation.",
            past_end.saturating_sub(1)
        )))
    }

    /// The read half of the sub-block walk: load the shared block and pick
    /// the owned sub-blocks following the bitmap from the highest to the
    /// lowest bit.
    fn rw_suballocated_extent_rd(&mut self, ext: &Extent, buf: &mut [u8], start: u32) -> Result<()> {
        let blk_sz = self.blk_sz();
        let mut scratch = vec![0u8; blk_sz as usize];
        self.impl_read(ext.blk_nr(), 0, &mut scratch)?;

        let mut pdata = 0usize;
        walk_subblocks(ext.blk_bitmap(), blk_sz, start, buf.len() as u32, |pscratch, sz| {
            buf[pdata..pdata + sz].copy_from_slice(&scratch[pscratch..pscratch + sz]);
            pdata += sz;
        });
        Ok(())
    }

    /// The write half: read-modify-write of the whole shared block.
    fn rw_suballocated_extent_wr(&mut self, ext: &Extent, buf: &[u8], start: u32) -> Result<()> {
        let blk_sz = self.blk_sz();
        let mut scratch = vec![0u8; blk_sz as usize];
        self.impl_read(ext.blk_nr(), 0, &mut scratch)?;

        let mut pdata = 0usize;
        walk_subblocks(ext.blk_bitmap(), blk_sz, start, buf.len() as u32, |pscratch, sz| {
            scratch[pscratch..pscratch + sz].copy_from_slice(&buf[pdata..pdata + sz]);
            pdata += sz;
        });

        self.impl_write(ext.blk_nr(), 0, &scratch)
    }

    fn header_sz(&self) -> u32 {
        self.begin_blk_nr() * self.blk_sz()
    }

    /// Read the header space (the bytes in front of `begin_blk_nr`).
    /// The buffer cannot exceed the fixed header capacity.
    fn read_header(&mut self, buf: &mut [u8]) -> Result<()> {
        let hdr_sz = self.header_sz();
        if buf.len() as u32 > hdr_sz {
            return Err(Error::NotEnoughRoom(format!(
                "Requested {} bytes but the header has only {} bytes.",
                buf.len(),
                hdr_sz
            )));
        }
        self.impl_read(0, 0, buf)
    }

    fn write_header(&mut self, buf: &[u8]) -> Result<()> {
        let hdr_sz = self.header_sz();
        if buf.len() as u32 > hdr_sz {
            return Err(Error::NotEnoughRoom(format!(
                "Requested {} bytes but the header has only {} bytes.",
                buf.len(),
                hdr_sz
            )));
        }
        self.impl_write(0, 0, buf)
    }

    fn trailer_sz(&self) -> u32 {
        self.ba_state().trailer.len() as u32
    }

    /// Read from the in-memory trailer. The buffer cannot exceed the
    /// current trailer size.
    fn read_trailer(&mut self, buf: &mut [u8]) -> Result<()> {
        let trailer = &self.ba_state().trailer;
        if buf.len() > trailer.len() {
            return Err(Error::NotEnoughRoom(format!(
                "Requested {} bytes but the trailer has only {} bytes.",
                buf.len(),
                trailer.len()
            )));
        }
        buf.copy_from_slice(&trailer[..buf.len()]);
        Ok(())
    }

    /// Replace the in-memory trailer; it may grow or shrink but must stay
    /// strictly smaller than one block. Persisting it (if at all) is the
    /// concrete implementation's close-time business.
    fn write_trailer(&mut self, buf: &[u8]) -> Result<()> {
        if buf.len() as u32 >= self.blk_sz() {
            return Err(Error::NotEnoughRoom(format!(
                "Requested {} bytes but the trailer must be smaller than the block size of {} bytes.",
                buf.len(),
                self.blk_sz()
            )));
        }
        self.ba_state_mut().trailer = buf.to_vec();
        Ok(())
    }

    /// Overwrite the blocks `[from, to)` with zeros.
    fn zero_blocks(&mut self, from: u32, to: u32) -> Result<()> {
        if from >= to {
            return Ok(());
        }
        let zeros = vec![0u8; self.blk_sz() as usize];
        for blk_nr in from..to {
            self.impl_write(blk_nr, 0, &zeros)?;
        }
        Ok(())
    }
}

/// Shared bitmap walk: calls `copy(pscratch, sz)` for each in-block byte
/// range selected by the bitmap (MSB first), after skipping `start` bytes
/// of the extent's data space and moving at most `max` bytes total.
fn walk_subblocks<F: FnMut(usize, usize)>(bitmap: u16, blk_sz: u32, start: u32, max: u32, mut copy: F) {
    let subblk_sz = blk_sz >> SUBBLK_SIZE_ORDER;
    let mut skip_offset = start;
    let mut remain = max;
    let mut pscratch = 0u32;

    for i in 0..SUBBLK_CNT_PER_BLK {
        if remain == 0 {
            break;
        }
        let bit = 1u16 << (SUBBLK_CNT_PER_BLK - i - 1);
        if bitmap & bit != 0 {
            if skip_offset >= subblk_sz {
                skip_offset -= subblk_sz;
            } else {
                let copy_sz = (subblk_sz - skip_offset).min(remain);
                copy((pscratch + skip_offset) as usize, copy_sz as usize);
                remain -= copy_sz;
                skip_offset = 0;
            }
        }
        pscratch += subblk_sz;
    }

    debug_assert_eq!(remain, 0);
}
