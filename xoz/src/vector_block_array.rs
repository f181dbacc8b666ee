//! The simplest concrete block array: a `Vec<u8>` with no header blocks
//! and no trailer persistence. The base array of choice for allocator and
//! segment-block-array tests, and for throwaway in-memory block spaces.

use crate::block_array::{BlockArray, BlockArrayState};
use crate::error::Result;

#[derive(Debug)]
pub struct VectorBlockArray {
    buf: Vec<u8>,
    state: BlockArrayState,
}

impl VectorBlockArray {
    pub fn new(blk_sz: u32) -> Result<VectorBlockArray> {
        Ok(VectorBlockArray {
            buf: Vec::new(),
            state: BlockArrayState::new(blk_sz, 0, 0)?,
        })
    }

    /// The raw backing bytes, blocks `[0, capacity_end)`.
    pub fn data(&self) -> &[u8] {
        &self.buf
    }

    /// The bytes of the used blocks only, `[0, past_end)`.
    pub fn used_data(&self) -> &[u8] {
        &self.buf[..(self.past_end_blk_nr() * self.blk_sz()) as usize]
    }
}

impl BlockArray for VectorBlockArray {
    fn ba_state(&self) -> &BlockArrayState {
        &self.state
    }

    fn ba_state_mut(&mut self) -> &mut BlockArrayState {
        &mut self.state
    }

    fn impl_grow_by_blocks(&mut self, blk_cnt: u32) -> Result<()> {
        let add = (blk_cnt * self.blk_sz()) as usize;
        self.buf.resize(self.buf.len() + add, 0);
        Ok(())
    }

    fn impl_release_blocks(&mut self) -> Result<u32> {
        let slack = self.capacity() - self.blk_cnt();
        self.buf
            .truncate((self.past_end_blk_nr() * self.blk_sz()) as usize);
        Ok(slack)
    }

    fn impl_read(&mut self, blk_nr: u32, offset: u32, buf: &mut [u8]) -> Result<()> {
        let at = (blk_nr * self.blk_sz() + offset) as usize;
        buf.copy_from_slice(&self.buf[at..at + buf.len()]);
        Ok(())
    }

    fn impl_write(&mut self, blk_nr: u32, offset: u32, buf: &[u8]) -> Result<()> {
        let at = (blk_nr * self.blk_sz() + offset) as usize;
        self.buf[at..at + buf.len()].copy_from_slice(buf);
        Ok(())
    }
}
