//! A segment is an ordered list of extents plus an optional *inline* tail
//! of up to 63 bytes stored directly in the segment's own encoding.
//!
//! On disk a segment is a stream of 2-byte little-endian words. The first
//! word of each element carries flags in its high bits:
//!
//! ```text
//! bit 15        suballoc flag
//! bit 14        inline flag (bits 15+14 set means inline element)
//! bits 14..11   smallcnt: block count 1..15 of a full extent, inlined
//!               in the header word (0 means "count word follows")
//! bit 10        more: another element follows this extent
//! bits 9..0     high 10 bits of the block number
//! ```
//!
//! An extent element is `[hi word][lo blk_nr word]` plus one extra count/
//! bitmap word when it is suballoc'd or its count cannot live in smallcnt.
//! An inline element stores its size in bits 13..8, its odd trailing byte
//! in bits 7..0, and terminates the segment.

use crate::error::{Error, Result};
use crate::extent::Extent;
use crate::io::IoBase;
use crate::mem::{read_bitfield_u16, write_bitfield_u16};

const MASK_SUBALLOC_FLAG: u16 = 0x8000;
const MASK_INLINE_FLAG: u16 = 0x4000;
const MASK_INLINE_SZ: u16 = 0x3f00;
const MASK_INLINE_LAST: u16 = 0x00ff;
const MASK_SMALLCNT: u16 = 0x7800;
const MASK_MORE_FLAG: u16 = 0x0400;
const MASK_HI_BLK_NR: u16 = 0x03ff;

const SMALLCNT_MAX: u16 = 15;

/// Hard cap of the inline tail.
pub const INLINE_SZ_MAX: u16 = 63;

/// Serialized size of the end-of-segment marker (an empty inline element).
pub const END_OF_SEGMENT_SZ: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    blk_sz_order: u8,
    arr: Vec<Extent>,
    inline: Option<Vec<u8>>,
}

impl Segment {
    /// A segment bound to a block size order. The new segment has no
    /// extents and no inline data: it cannot be serialized until it gets
    /// at least one element (see `Segment::empty`).
    pub fn new(blk_sz_order: u8) -> Segment {
        Segment {
            blk_sz_order,
            arr: Vec::new(),
            inline: None,
        }
    }

    /// The canonical *valid* empty segment: no extents, zero-length
    /// inline. Serializes to the 2-byte end-of-segment marker.
    pub fn empty(blk_sz_order: u8) -> Segment {
        Segment {
            blk_sz_order,
            arr: Vec::new(),
            inline: Some(Vec::new()),
        }
    }

    pub fn blk_sz_order(&self) -> u8 {
        self.blk_sz_order
    }

    pub fn add_extent(&mut self, ext: Extent) {
        self.arr.push(ext);
    }

    pub fn extents(&self) -> &[Extent] {
        &self.arr
    }

    pub fn ext_cnt(&self) -> usize {
        self.arr.len()
    }

    pub fn clear_extents(&mut self) {
        self.arr.clear();
    }

    pub(crate) fn pop_extent(&mut self) -> Option<Extent> {
        self.arr.pop()
    }

    pub(crate) fn set_last_extent(&mut self, ext: Extent) {
        if let Some(last) = self.arr.last_mut() {
            *last = ext;
        }
    }

    /// No extents and no inline bytes. Note that a zero-length inline
    /// (the end-of-segment marker) still counts as empty space.
    pub fn is_empty_space(&self) -> bool {
        self.arr.is_empty() && self.inline_data_sz() == 0
    }

    pub fn has_inline_data(&self) -> bool {
        self.inline.is_some()
    }

    pub fn inline_data(&self) -> &[u8] {
        self.inline.as_deref().unwrap_or(&[])
    }

    pub fn inline_data_mut(&mut self) -> &mut [u8] {
        self.inline.as_deref_mut().unwrap_or(&mut [])
    }

    pub fn inline_data_sz(&self) -> u16 {
        self.inline.as_ref().map_or(0, |raw| raw.len() as u16)
    }

    pub fn set_inline_data(&mut self, data: Vec<u8>) -> Result<()> {
        fail_if_bad_inline_sz(data.len())?;
        self.inline = Some(data);
        Ok(())
    }

    /// Make room for `sz` inline bytes (zero-filled), to be written later
    /// through `inline_data_mut` or an IO over the segment.
    pub fn reserve_inline_data(&mut self, sz: u16) -> Result<()> {
        fail_if_bad_inline_sz(sz as usize)?;
        self.inline = Some(vec![0u8; sz as usize]);
        Ok(())
    }

    pub fn remove_inline_data(&mut self) {
        self.inline = None;
    }

    /// Mark the end of the segment with a zero-length inline element.
    /// Required only when the segment is stored in a slot without a length
    /// prefix (like the repository header's root slot). A segment that
    /// already carries inline data is already terminated.
    pub fn add_end_of_segment(&mut self) {
        if self.inline.is_none() {
            self.inline = Some(Vec::new());
        }
    }

    /// Serialized size in bytes of this segment.
    pub fn calc_struct_footprint_size(&self) -> Result<u32> {
        self.fail_if_invalid_empty()?;

        let mut sz: u32 = 0;
        for ext in &self.arr {
            // header word + low blk_nr word, always present
            sz += 2 + 2;

            // the count word is present unless smallcnt can hold the count
            if ext.is_suballoc() || ext.blk_cnt() == 0 || ext.blk_cnt() > SMALLCNT_MAX {
                sz += 2;
            }
        }

        if let Some(raw) = &self.inline {
            fail_if_bad_inline_sz(raw.len())?;
            sz += 2;
            // an odd last byte travels inside the header word
            sz += (raw.len() as u32) & !1;
        }

        Ok(sz)
    }

    /// Total user-addressable bytes: the extents' data space plus the
    /// inline tail.
    pub fn calc_data_space_size(&self) -> Result<u32> {
        self.fail_if_invalid_empty()?;

        let mut sz: u32 = 0;
        for ext in &self.arr {
            sz += ext.calc_data_space_size(self.blk_sz_order);
        }
        if let Some(raw) = &self.inline {
            fail_if_bad_inline_sz(raw.len())?;
            sz += raw.len() as u32;
        }
        Ok(sz)
    }

    pub fn write_struct_into<IO: IoBase>(&self, io: &mut IO) -> Result<()> {
        self.fail_if_invalid_empty()?;

        // every extent except the last element carries the 'more' bit;
        // an inline tail counts as one more element
        let mut remain = self.arr.len() + usize::from(self.inline.is_some());

        for ext in &self.arr {
            remain -= 1;

            let mut hi_ext: u16 = 0;
            if remain > 0 {
                hi_ext = write_bitfield_u16(hi_ext, MASK_MORE_FLAG, 1);
            }
            if ext.is_suballoc() {
                hi_ext = write_bitfield_u16(hi_ext, MASK_SUBALLOC_FLAG, 1);
            }

            let mut smallcnt: u16 = 0;
            if !ext.is_suballoc() && ext.blk_cnt() <= SMALLCNT_MAX && ext.blk_cnt() > 0 {
                smallcnt = ext.blk_cnt();
            }
            hi_ext = write_bitfield_u16(hi_ext, MASK_SMALLCNT, smallcnt);
            hi_ext = write_bitfield_u16(hi_ext, MASK_HI_BLK_NR, ext.hi_blk_nr());

            io.write_u16_le(hi_ext)?;
            io.write_u16_le(ext.lo_blk_nr())?;

            if ext.is_suballoc() || smallcnt == 0 {
                io.write_u16_le(ext.blk_cnt())?;
            }
        }

        if let Some(raw) = &self.inline {
            fail_if_bad_inline_sz(raw.len())?;

            let inline_sz = raw.len() as u16;
            let mut hi_ext: u16 = 0;
            hi_ext = write_bitfield_u16(hi_ext, MASK_SUBALLOC_FLAG, 1);
            hi_ext = write_bitfield_u16(hi_ext, MASK_INLINE_FLAG, 1);
            hi_ext = write_bitfield_u16(hi_ext, MASK_INLINE_SZ, inline_sz);

            // an odd-sized tail parks its last byte in the header word
            let even_sz = (inline_sz & !1) as usize;
            if inline_sz % 2 == 1 {
                hi_ext = write_bitfield_u16(hi_ext, MASK_INLINE_LAST, u16::from(raw[even_sz]));
            }

            io.write_u16_le(hi_ext)?;
            if even_sz > 0 {
                io.writeall(&raw[..even_sz])?;
            }
        }

        Ok(())
    }

    /// Decode a segment from the IO's read cursor. The read stops at the
    /// element with the `more` bit clear or at an inline element; it fails
    /// with `NotEnoughRoom` when a declared element word is missing from
    /// the window and with `InconsistentFile` when a declared inline size
    /// exceeds what the window still holds.
    pub fn load_struct_from<IO: IoBase>(io: &mut IO, blk_sz_order: u8) -> Result<Segment> {
        let mut segm = Segment::new(blk_sz_order);
        let mut is_more = true;

        while is_more {
            is_more = false;

            let hi_ext = io.read_u16_le()?;
            let is_suballoc = read_bitfield_u16(hi_ext, MASK_SUBALLOC_FLAG) == 1;
            let is_inline = read_bitfield_u16(hi_ext, MASK_INLINE_FLAG) == 1;

            if is_suballoc && is_inline {
                let inline_sz = read_bitfield_u16(hi_ext, MASK_INLINE_SZ);
                let last = read_bitfield_u16(hi_ext, MASK_INLINE_LAST) as u8;

                let mut raw = vec![0u8; inline_sz as usize];
                let mut even_sz = inline_sz;
                if inline_sz % 2 == 1 {
                    raw[(inline_sz - 1) as usize] = last;
                    even_sz -= 1;
                }

                if u32::from(even_sz) > io.remain_rd() {
                    return Err(Error::InconsistentFile(format!(
                        "the segment declares {} bytes of inline data but only {} bytes \
                         are left in the io object",
                        even_sz,
                        io.remain_rd()
                    )));
                }
                if even_sz > 0 {
                    io.readall(&mut raw[..even_sz as usize])?;
                }

                segm.inline = Some(raw);
            } else {
                is_more = read_bitfield_u16(hi_ext, MASK_MORE_FLAG) == 1;

                let smallcnt = read_bitfield_u16(hi_ext, MASK_SMALLCNT);
                let hi_blk_nr = read_bitfield_u16(hi_ext, MASK_HI_BLK_NR);
                let lo_blk_nr = io.read_u16_le()?;

                let blk_cnt = if !is_suballoc && smallcnt > 0 {
                    smallcnt
                } else {
                    if is_suballoc && smallcnt != 0 {
                        return Err(Error::InconsistentFile(format!(
                            "the segment contains a suballoc'd extent with a non-zero \
                             smallcnt field ({smallcnt})"
                        )));
                    }
                    io.read_u16_le()?
                };

                segm.arr.push(Extent::from_parts(hi_blk_nr, lo_blk_nr, blk_cnt, is_suballoc));
            }
        }

        Ok(segm)
    }

    fn fail_if_invalid_empty(&self) -> Result<()> {
        if self.arr.is_empty() && self.inline.is_none() {
            return Err(Error::InconsistentState(
                "Segment is literally empty: no extents and no inline data. \
                 This is not allowed, a valid empty Segment can be made by a zero inline data."
                    .to_string(),
            ));
        }
        Ok(())
    }
}

fn fail_if_bad_inline_sz(sz: usize) -> Result<()> {
    if sz > INLINE_SZ_MAX as usize {
        return Err(Error::InconsistentState(format!(
            "Inline data too large: it has {sz} bytes but only up to {INLINE_SZ_MAX} bytes are allowed."
        )));
    }
    Ok(())
}
