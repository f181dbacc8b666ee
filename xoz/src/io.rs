//! Cursor-style IO contract shared by [`crate::iospan::IoSpan`] and
//! [`crate::iosegment::IoSegment`].
//!
//! Each IO object carries an independent read cursor and write cursor,
//! each confined to its own `[lo, hi)` limit window over the source.
//! Seeks clamp into the window instead of failing. `*some` operations
//! return short counts at the window end; `*all` operations verify room
//! *before* touching anything and fail with `NotEnoughRoom` otherwise.

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Seekdir {
    /// Absolute position (clamped into the window).
    Beg,
    /// Offset backwards from the window end.
    End,
    /// Relative forward.
    Fwd,
    /// Relative backwards.
    Bwd,
}

/// Cursor positions and limit windows. A copy of this is the snapshot
/// that `save_state`/`restore_state` exchange; restoring brings back both
/// the limits and the positions (the scope-exit guards of a RAII design,
/// made explicit).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RwState {
    pub(crate) rd: u32,
    pub(crate) wr: u32,
    pub(crate) rd_lo: u32,
    pub(crate) rd_hi: u32,
    pub(crate) wr_lo: u32,
    pub(crate) wr_hi: u32,
}

impl RwState {
    pub(crate) fn new(src_sz: u32) -> RwState {
        RwState {
            rd: 0,
            wr: 0,
            rd_lo: 0,
            rd_hi: src_sz,
            wr_lo: 0,
            wr_hi: src_sz,
        }
    }
}

fn clamp(pos: u32, lo: u32, hi: u32) -> u32 {
    pos.max(lo).min(hi)
}

fn seek_pos(cur: u32, offset: u32, dir: Seekdir, lo: u32, hi: u32) -> u32 {
    match dir {
        Seekdir::Beg => clamp(offset, lo, hi),
        Seekdir::End => clamp(hi.saturating_sub(offset), lo, hi),
        Seekdir::Fwd => clamp(cur.saturating_add(offset), lo, hi),
        Seekdir::Bwd => clamp(cur.saturating_sub(offset), lo, hi),
    }
}

pub trait IoBase {
    /// Total size in bytes of the underlying source, limits aside.
    fn src_sz(&self) -> u32;

    fn rw_state(&self) -> &RwState;
    fn rw_state_mut(&mut self) -> &mut RwState;

    /// Read exactly `buf.len()` bytes at the absolute position `pos`.
    /// The caller guarantees `pos + buf.len() <= src_sz()`.
    fn impl_read(&mut self, pos: u32, buf: &mut [u8]) -> Result<()>;

    /// Write exactly `buf.len()` bytes at the absolute position `pos`.
    /// The caller guarantees `pos + buf.len() <= src_sz()`.
    fn impl_write(&mut self, pos: u32, buf: &[u8]) -> Result<()>;

    fn tell_rd(&self) -> u32 {
        self.rw_state().rd
    }

    fn tell_wr(&self) -> u32 {
        self.rw_state().wr
    }

    fn remain_rd(&self) -> u32 {
        let st = self.rw_state();
        st.rd_hi.saturating_sub(st.rd)
    }

    fn remain_wr(&self) -> u32 {
        let st = self.rw_state();
        st.wr_hi.saturating_sub(st.wr)
    }

    fn seek_rd(&mut self, offset: u32, dir: Seekdir) {
        let st = self.rw_state_mut();
        st.rd = seek_pos(st.rd, offset, dir, st.rd_lo, st.rd_hi);
    }

    fn seek_wr(&mut self, offset: u32, dir: Seekdir) {
        let st = self.rw_state_mut();
        st.wr = seek_pos(st.wr, offset, dir, st.wr_lo, st.wr_hi);
    }

    /// Read up to `buf.len()` bytes; short count at the window end.
    fn readsome(&mut self, buf: &mut [u8]) -> Result<u32> {
        let n = (buf.len() as u32).min(self.remain_rd());
        if n == 0 {
            return Ok(0);
        }
        let pos = self.rw_state().rd;
        self.impl_read(pos, &mut buf[..n as usize])?;
        self.rw_state_mut().rd += n;
        Ok(n)
    }

    /// Write up to `buf.len()` bytes; short count at the window end.
    fn writesome(&mut self, buf: &[u8]) -> Result<u32> {
        let n = (buf.len() as u32).min(self.remain_wr());
        if n == 0 {
            return Ok(0);
        }
        let pos = self.rw_state().wr;
        self.impl_write(pos, &buf[..n as usize])?;
        self.rw_state_mut().wr += n;
        Ok(n)
    }

    /// Read exactly `buf.len()` bytes or fail before reading anything.
    fn readall(&mut self, buf: &mut [u8]) -> Result<()> {
        let sz = buf.len() as u32;
        if sz > self.remain_rd() {
            return Err(Error::not_enough_room_rd(sz, self.remain_rd(), self.tell_rd()));
        }
        let pos = self.rw_state().rd;
        self.impl_read(pos, buf)?;
        self.rw_state_mut().rd += sz;
        Ok(())
    }

    /// Read exactly `sz` bytes appending into `v` (which is cleared first).
    fn readall_into_vec(&mut self, v: &mut Vec<u8>, sz: u32) -> Result<()> {
        v.clear();
        v.resize(sz as usize, 0);
        self.readall(v)
    }

    /// Write exactly `buf.len()` bytes or fail before writing anything.
    fn writeall(&mut self, buf: &[u8]) -> Result<()> {
        let sz = buf.len() as u32;
        if sz > self.remain_wr() {
            return Err(Error::not_enough_room_wr(sz, self.remain_wr(), self.tell_wr()));
        }
        let pos = self.rw_state().wr;
        self.impl_write(pos, buf)?;
        self.rw_state_mut().wr += sz;
        Ok(())
    }

    /// Write exactly `sz` bytes taken from `buf`. A `buf` shorter than `sz`
    /// is the *caller's* shortfall, not the sink's: it fails with
    /// `Overflow` before the sink is touched.
    fn writeall_sz(&mut self, buf: &[u8], sz: u32) -> Result<()> {
        if (buf.len() as u32) < sz {
            return Err(Error::Overflow(format!(
                "Requested {} bytes but the source buffer has only {} bytes. \
                 Write exact-byte-count operation at position {} failed; \
                 detected before the write.",
                sz,
                buf.len(),
                self.tell_wr()
            )));
        }
        self.writeall(&buf[..sz as usize])
    }

    /// Write `sz` copies of `byte`; exact-or-fail.
    fn fill(&mut self, byte: u8, sz: u32) -> Result<()> {
        if sz > self.remain_wr() {
            return Err(Error::not_enough_room_wr(sz, self.remain_wr(), self.tell_wr()));
        }
        let chunk = [byte; 64];
        let mut remain = sz;
        while remain > 0 {
            let n = remain.min(chunk.len() as u32);
            self.writeall(&chunk[..n as usize])?;
            remain -= n;
        }
        Ok(())
    }

    /// Copy `sz` bytes from the read cursor to the write cursor of the
    /// same IO. Any overlap between the two ranges is fine (the bytes are
    /// staged through a scratch buffer, so the effect is that of memmove).
    fn copy_into_self(&mut self, sz: u32) -> Result<()> {
        if sz > self.remain_rd() {
            return Err(Error::not_enough_room_rd(sz, self.remain_rd(), self.tell_rd()));
        }
        if sz > self.remain_wr() {
            return Err(Error::not_enough_room_wr(sz, self.remain_wr(), self.tell_wr()));
        }
        let mut scratch = vec![0u8; sz as usize];
        self.readall(&mut scratch)?;
        self.writeall(&scratch)
    }

    /// Copy `sz` bytes from this IO's read cursor into `other`'s write
    /// cursor.
    fn copy_into<O: IoBase + ?Sized>(&mut self, other: &mut O, sz: u32) -> Result<()>
    where
        Self: Sized,
    {
        if sz > self.remain_rd() {
            return Err(Error::not_enough_room_rd(sz, self.remain_rd(), self.tell_rd()));
        }
        if sz > other.remain_wr() {
            return Err(Error::not_enough_room_wr(sz, other.remain_wr(), other.tell_wr()));
        }
        let mut scratch = [0u8; 512];
        let mut remain = sz;
        while remain > 0 {
            let n = remain.min(scratch.len() as u32) as usize;
            self.readall(&mut scratch[..n])?;
            other.writeall(&scratch[..n])?;
            remain -= n as u32;
        }
        Ok(())
    }

    /// Restrict the read window to `[lo, lo + sz)`, clamped to the source
    /// size. The read cursor is moved into the new window if it fell
    /// outside of it.
    fn limit_rd(&mut self, lo: u32, sz: u32) {
        let src = self.src_sz();
        let st = self.rw_state_mut();
        st.rd_lo = lo.min(src);
        st.rd_hi = lo.saturating_add(sz).min(src);
        st.rd = clamp(st.rd, st.rd_lo, st.rd_hi);
    }

    /// Restrict the write window to `[lo, lo + sz)`, clamped to the source
    /// size. The write cursor is moved into the new window if it fell
    /// outside of it.
    fn limit_wr(&mut self, lo: u32, sz: u32) {
        let src = self.src_sz();
        let st = self.rw_state_mut();
        st.wr_lo = lo.min(src);
        st.wr_hi = lo.saturating_add(sz).min(src);
        st.wr = clamp(st.wr, st.wr_lo, st.wr_hi);
    }

    /// Forbid any further write: the write window collapses onto the
    /// current write position (which `tell_wr` keeps reporting).
    fn limit_to_read_only(&mut self) {
        let st = self.rw_state_mut();
        st.wr_lo = st.wr;
        st.wr_hi = st.wr;
    }

    /// Snapshot of cursors and limits; pass it back to `restore_state`.
    fn save_state(&self) -> RwState {
        *self.rw_state()
    }

    fn restore_state(&mut self, saved: RwState) {
        *self.rw_state_mut() = saved;
    }

    fn read_u16_le(&mut self) -> Result<u16> {
        let mut b = [0u8; 2];
        self.readall(&mut b)?;
        Ok(u16::from_le_bytes(b))
    }

    fn read_u32_le(&mut self) -> Result<u32> {
        let mut b = [0u8; 4];
        self.readall(&mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    fn read_u64_le(&mut self) -> Result<u64> {
        let mut b = [0u8; 8];
        self.readall(&mut b)?;
        Ok(u64::from_le_bytes(b))
    }

    fn write_u16_le(&mut self, x: u16) -> Result<()> {
        self.writeall(&x.to_le_bytes())
    }

    fn write_u32_le(&mut self, x: u32) -> Result<()> {
        self.writeall(&x.to_le_bytes())
    }

    fn write_u64_le(&mut self, x: u64) -> Result<()> {
        self.writeall(&x.to_le_bytes())
    }
}
