//! IO over a plain byte buffer.

use crate::error::Result;
use crate::io::{IoBase, RwState};

pub struct IoSpan<'a> {
    buf: &'a mut [u8],
    st: RwState,
}

impl<'a> IoSpan<'a> {
    pub fn new(buf: &'a mut [u8]) -> IoSpan<'a> {
        let sz = buf.len() as u32;
        IoSpan {
            buf,
            st: RwState::new(sz),
        }
    }
}

impl IoBase for IoSpan<'_> {
    fn src_sz(&self) -> u32 {
        self.buf.len() as u32
    }

    fn rw_state(&self) -> &RwState {
        &self.st
    }

    fn rw_state_mut(&mut self) -> &mut RwState {
        &mut self.st
    }

    fn impl_read(&mut self, pos: u32, buf: &mut [u8]) -> Result<()> {
        let pos = pos as usize;
        buf.copy_from_slice(&self.buf[pos..pos + buf.len()]);
        Ok(())
    }

    fn impl_write(&mut self, pos: u32, buf: &[u8]) -> Result<()> {
        let pos = pos as usize;
        self.buf[pos..pos + buf.len()].copy_from_slice(buf);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::Seekdir;

    #[test]
    fn test_small_chunk() {
        let mut buf = vec![0u8; 64];

        let mut io = IoSpan::new(&mut buf);
        io.writeall(b"ABCD").unwrap();
        assert_eq!(io.remain_wr(), 64 - 4);
        assert_eq!(io.tell_wr(), 4);

        let mut rdbuf = [0u8; 4];
        io.readall(&mut rdbuf).unwrap();
        assert_eq!(&rdbuf, b"ABCD");
        assert_eq!(io.remain_rd(), 64 - 4);
        assert_eq!(io.tell_rd(), 4);

        assert_eq!(&buf[..4], b"ABCD");
        assert!(buf[4..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_full_buffer() {
        let mut buf = vec![0u8; 64];
        let wrbuf: Vec<u8> = (0..64).collect();

        let mut io = IoSpan::new(&mut buf);
        io.writeall(&wrbuf).unwrap();
        assert_eq!(io.remain_wr(), 0);
        assert_eq!(io.tell_wr(), 64);

        let mut rdbuf = Vec::new();
        io.readall_into_vec(&mut rdbuf, 64).unwrap();
        assert_eq!(rdbuf, wrbuf);
        assert_eq!(io.remain_rd(), 0);
        assert_eq!(io.tell_rd(), 64);
    }

    #[test]
    fn test_rw_exact_fail() {
        // a 64-byte buffer cannot satisfy an exact 65-byte operation
        let mut buf = vec![0u8; 64];
        let wrbuf: Vec<u8> = (0..65).collect();

        let mut io = IoSpan::new(&mut buf);
        let err = io.writeall(&wrbuf).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Requested 65 bytes but only 64 bytes are available. \
             Write exact-byte-count operation at position 0 failed; \
             detected before the write."
        );
        // nothing was written, the cursor did not move
        assert_eq!(io.tell_wr(), 0);

        let mut rdbuf = [0u8; 128];
        let err = io.readall(&mut rdbuf[..65]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Requested 65 bytes but only 64 bytes are available. \
             Read exact-byte-count operation at position 0 failed; \
             detected before the read."
        );
        assert_eq!(io.tell_rd(), 0);
        assert!(rdbuf.iter().all(|b| *b == 0));

        // a partial write is still possible afterwards
        io.writeall(&wrbuf[..8]).unwrap();
        assert_eq!(io.tell_wr(), 8);
        drop(io);
        assert_eq!(&buf[..8], &[0, 1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn test_writeall_sz_overflow() {
        let mut buf = vec![0u8; 64];
        let mut io = IoSpan::new(&mut buf);

        let err = io.writeall_sz(b"ABC", 4).unwrap_err();
        assert!(matches!(err, crate::error::Error::Overflow(_)));
        assert!(err.to_string().contains("Requested 4 bytes"));
        assert_eq!(io.tell_wr(), 0);
        drop(io);
        assert!(buf.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_readsome_writesome_short() {
        let mut buf = vec![0u8; 8];
        let mut io = IoSpan::new(&mut buf);

        assert_eq!(io.writesome(&[1u8; 16]).unwrap(), 8);
        assert_eq!(io.writesome(&[2u8; 4]).unwrap(), 0);

        let mut rdbuf = [0u8; 16];
        assert_eq!(io.readsome(&mut rdbuf).unwrap(), 8);
        assert_eq!(io.readsome(&mut rdbuf).unwrap(), 0);
        assert_eq!(&rdbuf[..8], &[1u8; 8]);
    }

    #[test]
    fn test_seek_clamps() {
        let mut buf = vec![0u8; 64];
        let mut io = IoSpan::new(&mut buf);

        io.seek_wr(5, Seekdir::Beg);
        io.seek_rd(9, Seekdir::Beg);
        assert_eq!((io.tell_wr(), io.tell_rd()), (5, 9));

        // past the end is clamped to the end
        io.seek_wr(9999, Seekdir::Beg);
        io.seek_rd(9999, Seekdir::Beg);
        assert_eq!((io.tell_wr(), io.tell_rd()), (64, 64));

        io.seek_wr(2, Seekdir::Bwd);
        io.seek_rd(1, Seekdir::Bwd);
        assert_eq!((io.tell_wr(), io.tell_rd()), (62, 63));

        // underflow is clamped to the begin
        io.seek_wr(999, Seekdir::Bwd);
        io.seek_rd(999, Seekdir::Bwd);
        assert_eq!((io.tell_wr(), io.tell_rd()), (0, 0));

        io.seek_wr(4, Seekdir::Fwd);
        io.seek_rd(4, Seekdir::Fwd);
        assert_eq!((io.tell_wr(), io.tell_rd()), (4, 4));

        io.seek_wr(999, Seekdir::Fwd);
        assert_eq!(io.tell_wr(), 64);

        io.seek_wr(3, Seekdir::End);
        io.seek_rd(0, Seekdir::End);
        assert_eq!((io.tell_wr(), io.tell_rd()), (61, 64));

        io.seek_rd(65, Seekdir::End);
        assert_eq!(io.tell_rd(), 0);
    }

    #[test]
    fn test_limits_and_restore() {
        let mut buf = vec![0u8; 8];
        let wrbuf: Vec<u8> = b"ABCDEFGH".to_vec();

        let mut io = IoSpan::new(&mut buf);
        io.writeall(&wrbuf).unwrap();
        assert_eq!((io.remain_wr(), io.tell_wr()), (0, 8));

        // wr cursor was beyond the new window: moved to one past its end
        io.limit_wr(2, 4);
        assert_eq!((io.remain_wr(), io.tell_wr()), (0, 6));
        // rd untouched
        assert_eq!((io.remain_rd(), io.tell_rd()), (8, 0));

        // rd cursor was behind the new window: moved to its begin
        io.limit_rd(1, 1);
        assert_eq!((io.remain_rd(), io.tell_rd()), (1, 1));

        let mut rdbuf = [0u8; 1];
        io.readall(&mut rdbuf).unwrap();
        assert_eq!(&rdbuf, b"B");

        let err = io.writeall(&wrbuf).unwrap_err();
        assert!(err
            .to_string()
            .contains("Requested 8 bytes but only 0 bytes are available"));
        assert!(err.to_string().contains("at position 6"));

        let saved = io.save_state();

        // limits can be redefined; sizes past the real size are truncated
        io.limit_wr(0, u32::MAX);
        assert_eq!((io.remain_wr(), io.tell_wr()), (2, 6));
        io.writeall(&wrbuf[..1]).unwrap();
        assert_eq!(io.tell_wr(), 7);

        io.limit_to_read_only();
        assert_eq!((io.remain_wr(), io.tell_wr()), (0, 7));
        let err = io.writeall(&wrbuf[..1]).unwrap_err();
        assert!(err
            .to_string()
            .contains("Requested 1 bytes but only 0 bytes are available"));
        assert!(err.to_string().contains("at position 7"));

        io.restore_state(saved);
        assert_eq!((io.remain_wr(), io.tell_wr()), (0, 6));
        assert_eq!((io.remain_rd(), io.tell_rd()), (0, 2));

        io.seek_wr(0, Seekdir::Beg);
        io.seek_rd(0, Seekdir::Beg);
        assert_eq!((io.remain_wr(), io.tell_wr()), (4, 2));
        assert_eq!((io.remain_rd(), io.tell_rd()), (1, 1));
    }

    #[test]
    fn test_seek_is_limit_aware() {
        let mut buf = vec![0u8; 64];
        let mut io = IoSpan::new(&mut buf);
        io.limit_wr(1, 60);
        io.limit_rd(10, 30);

        assert_eq!((io.remain_wr(), io.tell_wr()), (60, 1));
        assert_eq!((io.remain_rd(), io.tell_rd()), (30, 10));

        io.seek_wr(5, Seekdir::Beg);
        io.seek_rd(19, Seekdir::Beg);
        assert_eq!((io.remain_wr(), io.tell_wr()), (60 - 5 + 1, 5));
        assert_eq!((io.remain_rd(), io.tell_rd()), (30 - 19 + 10, 19));

        io.seek_wr(64, Seekdir::Beg);
        io.seek_rd(65, Seekdir::Beg);
        assert_eq!((io.remain_wr(), io.tell_wr()), (0, 61));
        assert_eq!((io.remain_rd(), io.tell_rd()), (0, 40));

        io.seek_wr(2, Seekdir::Bwd);
        io.seek_rd(1, Seekdir::Bwd);
        assert_eq!((io.remain_wr(), io.tell_wr()), (2, 59));
        assert_eq!((io.remain_rd(), io.tell_rd()), (1, 39));

        io.seek_wr(999, Seekdir::Bwd);
        io.seek_rd(999, Seekdir::Bwd);
        assert_eq!(io.tell_wr(), 1);
        assert_eq!(io.tell_rd(), 10);
    }

    #[test]
    fn test_fill() {
        // a fill followed by a read at the same position returns the
        // filled byte
        let mut buf = vec![0u8; 64];
        let mut io = IoSpan::new(&mut buf);
        io.seek_wr(3, Seekdir::Beg);
        io.fill(0x41, 10).unwrap();
        assert_eq!(io.tell_wr(), 13);

        io.seek_rd(3, Seekdir::Beg);
        let mut rdbuf = [0u8; 10];
        io.readall(&mut rdbuf).unwrap();
        assert_eq!(rdbuf, [0x41; 10]);

        let err = io.fill(0x42, 99).unwrap_err();
        assert!(matches!(err, crate::error::Error::NotEnoughRoom(_)));
    }

    #[test]
    fn test_fill_large_crosses_chunks() {
        let mut buf = vec![0u8; 300];
        let mut io = IoSpan::new(&mut buf);
        io.fill(0x5a, 300).unwrap();
        drop(io);
        assert!(buf.iter().all(|b| *b == 0x5a));
    }

    #[test]
    fn test_copy_into_self_overlap() {
        // memmove semantics: forward-overlapping copy must not see the
        // bytes it already wrote
        let mut buf: Vec<u8> = (0..16).collect();
        let mut io = IoSpan::new(&mut buf);
        io.seek_rd(0, Seekdir::Beg);
        io.seek_wr(4, Seekdir::Beg);
        io.copy_into_self(8).unwrap();
        drop(io);
        assert_eq!(buf, vec![0, 1, 2, 3, 0, 1, 2, 3, 4, 5, 6, 7, 12, 13, 14, 15]);

        // backward overlap
        let mut buf: Vec<u8> = (0..16).collect();
        let mut io = IoSpan::new(&mut buf);
        io.seek_rd(4, Seekdir::Beg);
        io.seek_wr(0, Seekdir::Beg);
        io.copy_into_self(8).unwrap();
        drop(io);
        assert_eq!(buf, vec![4, 5, 6, 7, 8, 9, 10, 11, 8, 9, 10, 11, 12, 13, 14, 15]);
    }

    #[test]
    fn test_copy_into_other() {
        let mut src: Vec<u8> = (0..32).collect();
        let mut dst = vec![0u8; 32];

        let mut io_src = IoSpan::new(&mut src);
        let mut io_dst = IoSpan::new(&mut dst);
        io_src.seek_rd(8, Seekdir::Beg);
        io_dst.seek_wr(4, Seekdir::Beg);
        io_src.copy_into(&mut io_dst, 8).unwrap();
        assert_eq!(io_src.tell_rd(), 16);
        assert_eq!(io_dst.tell_wr(), 12);
        drop(io_dst);
        assert_eq!(&dst[4..12], &[8, 9, 10, 11, 12, 13, 14, 15]);
        assert!(dst[..4].iter().all(|b| *b == 0));

        // room checks happen before any byte moves
        let mut small = vec![0u8; 4];
        let mut io_small = IoSpan::new(&mut small);
        let err = io_src.copy_into(&mut io_small, 8).unwrap_err();
        assert!(matches!(err, crate::error::Error::NotEnoughRoom(_)));
        assert_eq!(io_src.tell_rd(), 16);
    }

    #[test]
    fn test_le_integer_helpers() {
        let mut buf = vec![0u8; 16];
        let mut io = IoSpan::new(&mut buf);
        io.write_u16_le(0x1234).unwrap();
        io.write_u32_le(0xdeadbeef).unwrap();
        io.write_u64_le(0x0102030405060708).unwrap();

        assert_eq!(io.read_u16_le().unwrap(), 0x1234);
        assert_eq!(io.read_u32_le().unwrap(), 0xdeadbeef);
        assert_eq!(io.read_u64_le().unwrap(), 0x0102030405060708);

        let err = io.read_u16_le().unwrap_err();
        assert!(matches!(err, crate::error::Error::NotEnoughRoom(_)));
    }
}
