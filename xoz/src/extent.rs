//! An extent describes a contiguous run of `blk_cnt` full blocks starting
//! at `blk_nr`, or, when the suballoc flag is set, a single *shared* block
//! whose 16 sub-blocks are individually owned via a bitmap stored in the
//! same 16-bit field.
//!
//! Block numbers are 26-bit unsigned; the two spare high bits of the
//! on-disk word encode the suballoc/inline flags (see the segment codec).

use std::fmt;

use crate::error::{Error, Result};

/// Largest representable block number (26 bits).
pub const MAX_BLK_NR: u32 = 0x03ff_ffff;

/// Sub-blocks per shared block; one bitmap bit each.
pub const SUBBLK_CNT_PER_BLK: u32 = 16;

/// `blk_sz >> SUBBLK_SIZE_ORDER` is the sub-block size.
pub const SUBBLK_SIZE_ORDER: u8 = 4;

/// Two extents closer than this many blocks are considered "near" for
/// allocation placement purposes.
pub const NEAR_THRESHOLD_BLKS: u32 = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    blk_nr: u32,
    blk_cnt: u16,
    suballoc: bool,
}

/// Signed distance in blocks between the end of a reference extent and the
/// start of a target extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlkDistance {
    pub blk_cnt: u32,
    pub is_backwards: bool,
    pub is_near: bool,
}

impl Extent {
    /// When `is_suballoc` is false, `blk_nr` points to the first block of a
    /// run of `blk_cnt` blocks; when true, `blk_nr` points to one shared
    /// block and `blk_cnt` is a bitmap of owned sub-blocks.
    pub fn new(blk_nr: u32, blk_cnt: u16, is_suballoc: bool) -> Result<Extent> {
        if blk_nr > MAX_BLK_NR {
            return Err(Error::InvalidBlockNr {
                blk_nr,
                blk_cnt,
                is_suballoc: is_suballoc as u8,
            });
        }
        Ok(Extent {
            blk_nr,
            blk_cnt,
            suballoc: is_suballoc,
        })
    }

    /// Block number rebuilt from the 10 high bits and 16 low bits the
    /// on-disk words carry. Infallible: 26 bits by construction.
    pub(crate) fn from_parts(hi_blk_nr: u16, lo_blk_nr: u16, blk_cnt: u16, is_suballoc: bool) -> Extent {
        Extent {
            blk_nr: (u32::from(hi_blk_nr & 0x03ff) << 16) | u32::from(lo_blk_nr),
            blk_cnt,
            suballoc: is_suballoc,
        }
    }

    /// Internal constructor for block numbers that are already inside an
    /// array's range (and so under the 26-bit cap by construction).
    pub(crate) fn new_unchecked(blk_nr: u32, blk_cnt: u16, is_suballoc: bool) -> Extent {
        debug_assert!(blk_nr <= MAX_BLK_NR);
        Extent {
            blk_nr,
            blk_cnt,
            suballoc: is_suballoc,
        }
    }

    /// The all-zeros extent: not pointing anywhere, owning nothing.
    pub fn empty() -> Extent {
        Extent {
            blk_nr: 0,
            blk_cnt: 0,
            suballoc: false,
        }
    }

    pub fn blk_nr(&self) -> u32 {
        self.blk_nr
    }

    /// High 10 bits of the block number, as stored on disk.
    pub fn hi_blk_nr(&self) -> u16 {
        ((self.blk_nr >> 16) & 0x03ff) as u16
    }

    /// Low 16 bits of the block number, as stored on disk.
    pub fn lo_blk_nr(&self) -> u16 {
        (self.blk_nr & 0xffff) as u16
    }

    pub fn blk_cnt(&self) -> u16 {
        self.blk_cnt
    }

    /// Alias of `blk_cnt()`, on purpose: for suballoc'd extents the field
    /// is a bitmap.
    pub fn blk_bitmap(&self) -> u16 {
        self.blk_cnt
    }

    pub fn is_suballoc(&self) -> bool {
        self.suballoc
    }

    /// Count of sub-blocks owned (suballoc'd extents only, zero otherwise).
    pub fn subblk_cnt(&self) -> u16 {
        if self.suballoc {
            self.blk_cnt.count_ones() as u16
        } else {
            0
        }
    }

    /// Neither points to a block nor owns any: both fields zero.
    pub fn is_unallocated(&self) -> bool {
        self.blk_nr == 0 && self.blk_cnt == 0
    }

    /// Owns no data space (zero block count / empty bitmap).
    pub fn is_empty_space(&self) -> bool {
        self.blk_cnt == 0
    }

    /// How many whole blocks this extent spans: a suballoc'd extent spans
    /// its single shared block.
    pub fn blk_span(&self) -> u32 {
        if self.suballoc {
            1
        } else {
            u32::from(self.blk_cnt)
        }
    }

    /// One past the last block spanned.
    pub fn past_end_blk_nr(&self) -> u32 {
        self.blk_nr + self.blk_span()
    }

    /// Bytes of user data addressable through this extent for a given
    /// block size order.
    pub fn calc_data_space_size(&self, blk_sz_order: u8) -> u32 {
        if self.suballoc {
            u32::from(self.blk_cnt.count_ones() as u16) << (blk_sz_order - SUBBLK_SIZE_ORDER)
        } else {
            u32::from(self.blk_cnt) << blk_sz_order
        }
    }

    /// Keep the first `cnt` units in `self` (blocks, or set bitmap bits in
    /// MSB-to-LSB order) and return an extent owning the remainder.
    pub fn split(&mut self, cnt: u16) -> Result<Extent> {
        if self.suballoc {
            let mut kept: u16 = 0;
            let mut taken: u16 = 0;
            for i in (0..SUBBLK_CNT_PER_BLK).rev() {
                let bit = 1u16 << i;
                if self.blk_cnt & bit != 0 {
                    if taken == cnt {
                        break;
                    }
                    kept |= bit;
                    taken += 1;
                }
            }
            if taken < cnt {
                return Err(Error::InvalidArgument(format!(
                    "cannot split a suballoc'd extent of {} sub-blocks at {} sub-blocks",
                    self.subblk_cnt(),
                    cnt
                )));
            }
            let remain = self.blk_cnt & !kept;
            self.blk_cnt = kept;
            Ok(Extent {
                blk_nr: self.blk_nr,
                blk_cnt: remain,
                suballoc: true,
            })
        } else {
            if cnt > self.blk_cnt {
                return Err(Error::InvalidArgument(format!(
                    "cannot split an extent of {} blocks at {} blocks",
                    self.blk_cnt, cnt
                )));
            }
            let remain = Extent {
                blk_nr: self.blk_nr + u32::from(cnt),
                blk_cnt: self.blk_cnt - cnt,
                suballoc: false,
            };
            self.blk_cnt = cnt;
            Ok(remain)
        }
    }

    /// Unsigned distance in blocks between the end of `reference` and the
    /// start of `target` (or the other way around, flagged `is_backwards`).
    /// Overlapping extents have no distance and fail; suballoc'd extents
    /// span their single shared block.
    pub fn distance_in_blks(reference: &Extent, target: &Extent) -> Result<BlkDistance> {
        let ref_end = reference.past_end_blk_nr();
        let target_end = target.past_end_blk_nr();

        let position = if target.blk_nr == reference.blk_nr {
            "at same start"
        } else if target.blk_nr > reference.blk_nr {
            if target.blk_nr >= ref_end {
                let d = target.blk_nr - ref_end;
                return Ok(BlkDistance {
                    blk_cnt: d,
                    is_backwards: false,
                    is_near: d < NEAR_THRESHOLD_BLKS,
                });
            }
            "ext start is ahead ref"
        } else {
            if target_end <= reference.blk_nr {
                let d = reference.blk_nr - target_end;
                return Ok(BlkDistance {
                    blk_cnt: d,
                    is_backwards: true,
                    is_near: d < NEAR_THRESHOLD_BLKS,
                });
            }
            "ext start is behind ref"
        };

        Err(Error::ExtentOverlap {
            target: target.to_string(),
            reference: reference.to_string(),
            position,
        })
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.suballoc {
            write!(f, "suballoc'd block {:05x} [{:016b}]", self.blk_nr, self.blk_cnt)
        } else {
            write!(
                f,
                "extent {:05x} {:05x} [{:4x}]",
                self.blk_nr,
                self.blk_nr + u32::from(self.blk_cnt),
                self.blk_cnt
            )
        }
    }
}
