//! On-disk repository header and trailer.
//!
//! The header is fixed at 64 bytes at the very start of the file; any
//! remaining bytes of the header block(s) are zero. The trailer is 4 bytes
//! at `repo_start + repo_sz`. All integers little-endian; every field has
//! alignment 1 so the structs map straight onto the disk bytes.

use zerocopy::byteorder::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::mem::{fold_inet_checksum, inet_checksum};

pub const XOZ_MAGIC: [u8; 4] = *b"XOZ\0";
pub const EOF_MAGIC: [u8; 4] = *b"EOF\0";

/// Capacity of the header slot holding the encoded root segment.
pub const ROOT_SG_SLOT_SZ: usize = 12;

pub const HEADER_SZ: usize = 64;
pub const TRAILER_SZ: usize = 4;

#[derive(Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct RepoHeader {
    /// "XOZ" followed by a NUL.
    pub magic: [u8; 4],

    /// Size of the whole repository in bytes, header included, trailer
    /// excluded. Always `blk_total_cnt << blk_sz_order`.
    pub repo_sz: U64,

    /// Size in bytes of the trailer.
    pub trailer_sz: U64,

    /// Blocks in the repository, the header block(s) included.
    pub blk_total_cnt: U32,

    /// Blocks the repository had when it was created.
    pub blk_init_cnt: U32,

    /// Log base 2 of the block size.
    pub blk_sz_order: u8,

    pub reserved: [u8; 7],

    /// An unknown compat bit is harmless; an unknown incompat bit forbids
    /// opening the file; an unknown ro-compat bit allows reading only.
    pub feature_flags_compat: U32,
    pub feature_flags_incompat: U32,
    pub feature_flags_ro_compat: U32,

    /// The root segment, encoded in place when it fits, or encoded as a
    /// single-extent locator (with a checksum inline) when it does not.
    pub root_sg: [u8; ROOT_SG_SLOT_SZ],

    pub hdr_checksum: U32,
}

#[derive(Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct RepoTrailer {
    /// "EOF" followed by a NUL.
    pub magic: [u8; 4],
}

impl RepoHeader {
    /// Checksum over the 64 header bytes with the checksum field itself
    /// taken as zero.
    pub fn compute_checksum(&self) -> u32 {
        let mut bytes = [0u8; HEADER_SZ];
        bytes.copy_from_slice(self.as_bytes());
        bytes[HEADER_SZ - 4..].fill(0);
        fold_inet_checksum(inet_checksum(&bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizeof() {
        assert_eq!(HEADER_SZ, std::mem::size_of::<RepoHeader>(), "RepoHeader");
        assert_eq!(TRAILER_SZ, std::mem::size_of::<RepoTrailer>(), "RepoTrailer");
    }

    #[test]
    fn test_checksum_ignores_own_field() {
        let mut hdr = RepoHeader {
            magic: XOZ_MAGIC,
            repo_sz: 128.into(),
            blk_total_cnt: 2.into(),
            blk_init_cnt: 2.into(),
            blk_sz_order: 6,
            trailer_sz: 4.into(),
            ..RepoHeader::default()
        };
        let chk = hdr.compute_checksum();
        assert!(chk <= 0xffff);

        hdr.hdr_checksum = chk.into();
        assert_eq!(hdr.compute_checksum(), chk);

        // any payload change moves the checksum
        hdr.blk_total_cnt = 3.into();
        assert_ne!(hdr.compute_checksum(), chk);
    }

    #[test]
    fn test_header_roundtrip_via_bytes() {
        let hdr = RepoHeader {
            magic: XOZ_MAGIC,
            repo_sz: (4u64 * 4096).into(),
            trailer_sz: 4.into(),
            blk_total_cnt: 4.into(),
            blk_init_cnt: 1.into(),
            blk_sz_order: 12,
            ..RepoHeader::default()
        };

        let bytes = hdr.as_bytes().to_vec();
        assert_eq!(bytes.len(), HEADER_SZ);
        assert_eq!(&bytes[..4], b"XOZ\0");

        let (parsed, rest) = RepoHeader::ref_from_prefix(&bytes).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed.repo_sz.get(), 4 * 4096);
        assert_eq!(parsed.blk_sz_order, 12);
        assert_eq!(parsed.blk_total_cnt.get(), 4);
    }
}
