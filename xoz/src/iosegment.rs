//! IO over the data space of a segment rooted in a block array.
//!
//! The virtual byte stream is the concatenation of each extent's data
//! space in declaration order, followed by the segment's inline data.
//! Writes into the inline region mutate the segment's inline buffer in
//! place; the inline data never grows through IO, so running past the end
//! of the stream behaves like any other out-of-room condition.

use crate::block_array::BlockArray;
use crate::error::Result;
use crate::io::{IoBase, RwState};
use crate::segment::Segment;

pub struct IoSegment<'a, A: BlockArray> {
    ba: &'a mut A,
    sg: &'a mut Segment,
    ext_sizes: Vec<u32>,
    ext_total: u32,
    st: RwState,
}

impl<'a, A: BlockArray> IoSegment<'a, A> {
    /// Both the array and the segment stay mutably borrowed for the whole
    /// life of the IO: the stream geometry cannot shift under the cursors.
    pub fn new(ba: &'a mut A, sg: &'a mut Segment) -> IoSegment<'a, A> {
        let order = ba.blk_sz_order();
        let ext_sizes: Vec<u32> = sg.extents().iter().map(|e| e.calc_data_space_size(order)).collect();
        let ext_total: u32 = ext_sizes.iter().sum();
        let total = ext_total + u32::from(sg.inline_data_sz());
        IoSegment {
            ba,
            sg,
            ext_sizes,
            ext_total,
            st: RwState::new(total),
        }
    }
}

impl<A: BlockArray> IoBase for IoSegment<'_, A> {
    fn src_sz(&self) -> u32 {
        self.ext_total + u32::from(self.sg.inline_data_sz())
    }

    fn rw_state(&self) -> &RwState {
        &self.st
    }

    fn rw_state_mut(&mut self) -> &mut RwState {
        &mut self.st
    }

    fn impl_read(&mut self, pos: u32, buf: &mut [u8]) -> Result<()> {
        let mut pos = pos;
        let mut done = 0usize;

        for (i, ext) in self.sg.extents().iter().enumerate() {
            if done == buf.len() {
                return Ok(());
            }
            let esz = self.ext_sizes[i];
            if pos >= esz {
                pos -= esz;
                continue;
            }
            let n = ((esz - pos) as usize).min(buf.len() - done);
            self.ba.read_extent_at(ext, &mut buf[done..done + n], pos)?;
            done += n;
            pos = 0;
        }

        if done < buf.len() {
            let n = buf.len() - done;
            let inl = self.sg.inline_data();
            buf[done..].copy_from_slice(&inl[pos as usize..pos as usize + n]);
        }
        Ok(())
    }

    fn impl_write(&mut self, pos: u32, buf: &[u8]) -> Result<()> {
        let mut pos = pos;
        let mut done = 0usize;

        for (i, ext) in self.sg.extents().iter().enumerate() {
            if done == buf.len() {
                return Ok(());
            }
            let esz = self.ext_sizes[i];
            if pos >= esz {
                pos -= esz;
                continue;
            }
            let n = ((esz - pos) as usize).min(buf.len() - done);
            self.ba.write_extent_at(ext, &buf[done..done + n], pos)?;
            done += n;
            pos = 0;
        }

        if done < buf.len() {
            let n = buf.len() - done;
            let inl = self.sg.inline_data_mut();
            inl[pos as usize..pos as usize + n].copy_from_slice(&buf[done..]);
        }
        Ok(())
    }
}
