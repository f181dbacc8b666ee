//! Repository bootstrap: the header/trailer pair that turns a plain file
//! into a block array plus allocator, and the "root segment" indirection.
//!
//! The 12-byte `root_sg` slot in the header either holds the root segment
//! encoded in place (with an end-of-segment marker when it does not fill
//! the slot exactly) or, when the segment outgrows the slot, a locator:
//! one extent pointing at the externally stored segment plus 4 inline
//! bytes carrying its checksum. The header has its own checksum, so the
//! in-place form needs none.

use std::io::Read;
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt};
use log::{info, warn};
use zerocopy::{FromBytes, IntoBytes};

use crate::allocator::SegmentAllocator;
use crate::block_array::BlockArray;
use crate::error::{Error, Result};
use crate::file_block_array::{FileBlockArray, FileGeometry};
use crate::header::{RepoHeader, EOF_MAGIC, HEADER_SZ, ROOT_SG_SLOT_SZ, TRAILER_SZ, XOZ_MAGIC};
use crate::io::IoBase;
use crate::iosegment::IoSegment;
use crate::iospan::IoSpan;
use crate::mem::{fold_inet_checksum, inet_checksum};
use crate::segment::{Segment, END_OF_SEGMENT_SZ};

/// Feature flag bits this implementation understands. None are defined
/// yet: any set bit comes from a future (or foreign) writer.
const KNOWN_INCOMPAT_FLAGS: u32 = 0;
const KNOWN_RO_COMPAT_FLAGS: u32 = 0;

#[derive(Debug, Clone, Copy)]
pub struct GlobalParameters {
    /// Log base 2 of the block size; 6..=16 (64 bytes to 64K).
    pub blk_sz_order: u8,
    /// Blocks reserved at creation, the header block included; >= 1.
    pub blk_init_cnt: u32,
}

impl Default for GlobalParameters {
    fn default() -> GlobalParameters {
        GlobalParameters {
            blk_sz_order: 12,
            blk_init_cnt: 1,
        }
    }
}

#[derive(Debug)]
pub struct Repository {
    fba: FileBlockArray,
    alloc: SegmentAllocator,
    root_sg: Segment,
    external_root_sg_loc: Segment,
    blk_init_cnt: u32,
    feature_flags_compat: u32,
    feature_flags_incompat: u32,
    feature_flags_ro_compat: u32,
    read_only: bool,
    closed: bool,
}

impl Repository {
    /// Build a brand new repository file at `fpath` (an existing file is
    /// truncated first).
    pub fn create<P: AsRef<Path>>(fpath: P, gp: GlobalParameters) -> Result<Repository> {
        Self::check_gp(&gp)?;
        // start from a clean slate; the block array itself never inspects
        // nor clears pre-existing content
        std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(fpath.as_ref())?;
        let fba = FileBlockArray::create(fpath, 1u32 << gp.blk_sz_order, 1, false)?;
        Self::init_new(fba, gp)
    }

    /// Build a brand new repository backed by memory.
    pub fn create_mem_based(gp: GlobalParameters) -> Result<Repository> {
        Self::check_gp(&gp)?;
        let fba = FileBlockArray::create_mem_based(1u32 << gp.blk_sz_order, 1)?;
        Self::init_new(fba, gp)
    }

    /// Open an existing repository file, learning the block size from the
    /// file's own header.
    pub fn open<P: AsRef<Path>>(fpath: P) -> Result<Repository> {
        let fba = FileBlockArray::open_with_preload(fpath, Self::preload)?;
        Self::open_internal(fba)
    }

    /// Open a repository from an in-memory image.
    pub fn open_mem(mem: Vec<u8>) -> Result<Repository> {
        let fba = FileBlockArray::from_mem_with_preload(mem, Self::preload)?;
        Self::open_internal(fba)
    }

    pub fn blk_sz(&self) -> u32 {
        self.fba.blk_sz()
    }

    pub fn blk_sz_order(&self) -> u8 {
        self.fba.blk_sz_order()
    }

    pub fn blk_init_cnt(&self) -> u32 {
        self.blk_init_cnt
    }

    /// Total blocks of the repository, the header block included.
    pub fn blk_total_cnt(&self) -> u32 {
        self.fba.past_end_blk_nr()
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn root_segment(&self) -> &Segment {
        &self.root_sg
    }

    /// Install the segment that points at the root descriptor set; it is
    /// persisted (in the header slot or externally) at close. The root
    /// segment never carries inline payload of its own (the slot encoding
    /// reserves inline for the end marker and the locator checksum).
    pub fn set_root_segment(&mut self, sg: Segment) -> Result<()> {
        self.fail_if_read_only()?;
        if sg.inline_data_sz() != 0 {
            return Err(Error::InvalidArgument(format!(
                "the root segment cannot carry inline data ({} bytes given)",
                sg.inline_data_sz()
            )));
        }
        self.root_sg = sg;
        Ok(())
    }

    /// The underlying block array, for IO over extents and segments.
    pub fn block_array_mut(&mut self) -> &mut FileBlockArray {
        &mut self.fba
    }

    pub fn block_array(&self) -> &FileBlockArray {
        &self.fba
    }

    /// The allocator together with the array it allocates from (split
    /// borrow: every allocator call takes the array explicitly).
    pub fn allocator_and_array(&mut self) -> (&mut SegmentAllocator, &mut FileBlockArray) {
        (&mut self.alloc, &mut self.fba)
    }

    /// The raw bytes of a memory-based repository.
    pub fn mem_contents(&self) -> Option<&[u8]> {
        self.fba.mem_contents()
    }

    /// Re-encode the root segment, rewrite header and trailer and close
    /// the underlying array. Idempotent. On failure a minimal valid
    /// end-of-stream is put in place (best effort) before the error
    /// propagates.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        if self.read_only {
            // nothing may be rewritten; drop the file as we found it
            self.closed = true;
            return Ok(());
        }

        match self.close_inner() {
            Ok(()) => {
                self.closed = true;
                info!("repository closed: {} blocks", self.fba.past_end_blk_nr());
                Ok(())
            }
            Err(e) => {
                let _ = self.fba.write_trailer(&EOF_MAGIC);
                let _ = self.fba.close();
                self.closed = true;
                Err(e)
            }
        }
    }

    fn check_gp(gp: &GlobalParameters) -> Result<()> {
        if !(6..=16).contains(&gp.blk_sz_order) {
            return Err(Error::InvalidArgument(format!(
                "block size order {} is out of range [6 to 16] (block sizes of 64 to 64K)",
                gp.blk_sz_order
            )));
        }
        if gp.blk_init_cnt == 0 {
            return Err(Error::InvalidArgument(
                "invalid initial blocks count of zero".to_string(),
            ));
        }
        Ok(())
    }

    fn init_new(mut fba: FileBlockArray, gp: GlobalParameters) -> Result<Repository> {
        let mut remain = gp.blk_init_cnt - 1;
        while remain > 0 {
            let chunk = remain.min(u32::from(u16::MAX)) as u16;
            fba.grow_by_blocks(chunk)?;
            remain -= u32::from(chunk);
        }

        let order = gp.blk_sz_order;
        let mut repo = Repository {
            fba,
            alloc: SegmentAllocator::new(),
            root_sg: Segment::empty(order),
            external_root_sg_loc: Segment::new(order),
            blk_init_cnt: gp.blk_init_cnt,
            feature_flags_compat: 0,
            feature_flags_incompat: 0,
            feature_flags_ro_compat: 0,
            read_only: false,
            closed: false,
        };
        repo.alloc.initialize_from_allocated(&repo.fba, &[])?;

        // leave a valid file behind from the start
        let root_slot = repo.update_and_encode_root_segment()?;
        repo.write_header_with_root(root_slot)?;
        repo.fba.write_trailer(&EOF_MAGIC)?;
        repo.fba.sync_trailer()?;

        info!(
            "repository created: blk_sz {} init blocks {}",
            repo.blk_sz(),
            gp.blk_init_cnt
        );
        Ok(repo)
    }

    fn preload(r: &mut dyn Read) -> Result<FileGeometry> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if magic != XOZ_MAGIC {
            return Err(Error::InconsistentFile(
                "magic string 'XOZ' not found in the header.".to_string(),
            ));
        }

        let _repo_sz = r.read_u64::<LittleEndian>()?;
        let _trailer_sz = r.read_u64::<LittleEndian>()?;
        let _blk_total_cnt = r.read_u32::<LittleEndian>()?;
        let _blk_init_cnt = r.read_u32::<LittleEndian>()?;
        let blk_sz_order = r.read_u8()?;

        if !(6..=16).contains(&blk_sz_order) {
            return Err(Error::InconsistentFile(format!(
                "block size order {blk_sz_order} is out of range [6 to 16] (block sizes of 64 to 64K)."
            )));
        }

        Ok(FileGeometry {
            blk_sz: 1u32 << blk_sz_order,
            begin_blk_nr: 1,
        })
    }

    fn open_internal(mut fba: FileBlockArray) -> Result<Repository> {
        let mut hdr_bytes = [0u8; HEADER_SZ];
        fba.read_header(&mut hdr_bytes)?;
        let hdr = RepoHeader::read_from_bytes(&hdr_bytes)
            .map_err(|_| Error::InconsistentFile("the repository header cannot be decoded.".to_string()))?;

        let order = hdr.blk_sz_order;
        let blk_total_cnt = hdr.blk_total_cnt.get();
        if blk_total_cnt == 0 {
            return Err(Error::InconsistentFile(
                "the repository has a declared block total count of zero.".to_string(),
            ));
        }

        let repo_sz = u64::from(blk_total_cnt) << order;
        let repo_sz_read = hdr.repo_sz.get();
        if repo_sz != repo_sz_read {
            return Err(Error::InconsistentFile(format!(
                "the repository declared a size of {} bytes but it is expected to have {} bytes \
                 based on the block total count {} and block size {}.",
                repo_sz_read,
                repo_sz,
                blk_total_cnt,
                1u32 << order
            )));
        }

        if blk_total_cnt != fba.past_end_blk_nr() {
            return Err(Error::InconsistentFile(format!(
                "the repository declared {} blocks but the file holds {} blocks.",
                blk_total_cnt,
                fba.past_end_blk_nr()
            )));
        }

        if hdr.blk_init_cnt.get() == 0 {
            return Err(Error::InconsistentFile(
                "the repository has a declared initial block count of zero.".to_string(),
            ));
        }

        let computed = hdr.compute_checksum();
        if computed != hdr.hdr_checksum.get() {
            return Err(Error::InconsistentFile(format!(
                "header checksum mismatch: computed {:#06x} but the header says {:#06x}.",
                computed,
                hdr.hdr_checksum.get()
            )));
        }

        let trailer_sz = hdr.trailer_sz.get();
        if trailer_sz < TRAILER_SZ as u64 {
            return Err(Error::InconsistentFile(format!(
                "the declared trailer size ({trailer_sz}) is too small, required at least {TRAILER_SZ} bytes."
            )));
        }
        if trailer_sz != u64::from(fba.trailer_sz()) {
            return Err(Error::InconsistentFile(format!(
                "the declared trailer size ({}) does not match the {} trailer bytes in the file.",
                trailer_sz,
                fba.trailer_sz()
            )));
        }
        let mut eof = [0u8; TRAILER_SZ];
        fba.read_trailer(&mut eof)?;
        if eof != EOF_MAGIC {
            return Err(Error::InconsistentFile(
                "magic string 'EOF' not found in the trailer.".to_string(),
            ));
        }

        let incompat = hdr.feature_flags_incompat.get();
        if incompat & !KNOWN_INCOMPAT_FLAGS != 0 {
            return Err(Error::IncompatibleFeature(format!(
                "the repository has incompatible features (incompat flags: {:#010x}).",
                incompat
            )));
        }
        let ro_compat = hdr.feature_flags_ro_compat.get();
        let read_only = ro_compat & !KNOWN_RO_COMPAT_FLAGS != 0;
        if read_only {
            warn!(
                "unknown ro-compat feature flags ({:#010x}): opening read-only",
                ro_compat
            );
        }

        // the root segment: either in place or behind a locator with a
        // checksum inline
        let mut slot = hdr.root_sg;
        let mut slot_io = IoSpan::new(&mut slot);
        let mut root_sg = Segment::load_struct_from(&mut slot_io, order)?;
        let mut external_root_sg_loc = Segment::new(order);

        if root_sg.ext_cnt() == 1 && root_sg.inline_data_sz() == 4 {
            let mut chk_bytes = [0u8; 4];
            chk_bytes.copy_from_slice(root_sg.inline_data());
            let stored_chksum = u32::from_le_bytes(chk_bytes);

            external_root_sg_loc.add_extent(root_sg.extents()[0]);

            let mut loc = external_root_sg_loc.clone();
            let real_root = {
                let mut io = IoSegment::new(&mut fba, &mut loc);
                Segment::load_struct_from(&mut io, order)?
            };

            let sz = real_root.calc_struct_footprint_size()?;
            let mut bytes = vec![0u8; sz as usize];
            let mut io = IoSpan::new(&mut bytes);
            real_root.write_struct_into(&mut io)?;
            let chksum = fold_inet_checksum(inet_checksum(&bytes));
            if chksum != stored_chksum {
                return Err(Error::InconsistentFile(format!(
                    "root segment checksum mismatch: computed {chksum:#06x} but the locator says {stored_chksum:#06x}."
                )));
            }

            root_sg = real_root;
        } else if root_sg.inline_data_sz() != 0 {
            return Err(Error::InconsistentFile(
                "the repository header contains a root segment with an unexpected format.".to_string(),
            ));
        }

        // a zero-length inline is just the end-of-segment marker
        if root_sg.inline_data_sz() == 0 {
            root_sg.remove_inline_data();
        }

        let mut repo = Repository {
            fba,
            alloc: SegmentAllocator::new(),
            root_sg,
            external_root_sg_loc,
            blk_init_cnt: hdr.blk_init_cnt.get(),
            feature_flags_compat: hdr.feature_flags_compat.get(),
            feature_flags_incompat: incompat,
            feature_flags_ro_compat: ro_compat,
            read_only,
            closed: false,
        };

        repo.alloc.initialize_from_allocated(
            &repo.fba,
            &[repo.root_sg.clone(), repo.external_root_sg_loc.clone()],
        )?;

        info!(
            "repository opened: blk_sz {} blocks {}{}",
            repo.blk_sz(),
            blk_total_cnt,
            if read_only { " (read-only)" } else { "" }
        );
        Ok(repo)
    }

    fn fail_if_read_only(&self) -> Result<()> {
        if self.read_only {
            return Err(Error::InvalidArgument(
                "the repository was opened in read-only mode".to_string(),
            ));
        }
        Ok(())
    }

    fn close_inner(&mut self) -> Result<()> {
        let root_slot = self.update_and_encode_root_segment()?;
        self.alloc.release(&mut self.fba)?;
        self.write_header_with_root(root_slot)?;
        self.fba.write_trailer(&EOF_MAGIC)?;
        self.fba.close()
    }

    fn write_header_with_root(&mut self, root_sg_slot: [u8; ROOT_SG_SLOT_SZ]) -> Result<()> {
        let blk_total_cnt = self.fba.past_end_blk_nr();
        let mut hdr = RepoHeader {
            magic: XOZ_MAGIC,
            repo_sz: (u64::from(blk_total_cnt) << self.blk_sz_order()).into(),
            trailer_sz: (TRAILER_SZ as u64).into(),
            blk_total_cnt: blk_total_cnt.into(),
            blk_init_cnt: self.blk_init_cnt.into(),
            blk_sz_order: self.blk_sz_order(),
            reserved: [0u8; 7],
            feature_flags_compat: self.feature_flags_compat.into(),
            feature_flags_incompat: self.feature_flags_incompat.into(),
            feature_flags_ro_compat: self.feature_flags_ro_compat.into(),
            root_sg: root_sg_slot,
            hdr_checksum: 0.into(),
        };
        hdr.hdr_checksum = hdr.compute_checksum().into();
        self.fba.write_header(hdr.as_bytes())
    }

    /// Encode the root segment into the 12-byte header slot, storing it
    /// externally (and shrinking or growing that external space) when it
    /// does not fit.
    fn update_and_encode_root_segment(&mut self) -> Result<[u8; ROOT_SG_SLOT_SZ]> {
        let order = self.blk_sz_order();
        let mut slot = [0u8; ROOT_SG_SLOT_SZ];

        let mut root = self.root_sg.clone();
        root.remove_inline_data();
        if root.ext_cnt() == 0 {
            root.add_end_of_segment();
        }

        let root_sz = root.calc_struct_footprint_size()?;
        let fits_exactly = root_sz as usize == ROOT_SG_SLOT_SZ;
        let fits_with_marker = root_sz + END_OF_SEGMENT_SZ <= ROOT_SG_SLOT_SZ as u32;

        if fits_exactly || fits_with_marker {
            // direct: the slot is the storage; release any external space
            if !fits_exactly {
                root.add_end_of_segment();
            }
            if self.external_root_sg_loc.ext_cnt() > 0 {
                let old = std::mem::replace(&mut self.external_root_sg_loc, Segment::new(order));
                self.alloc.dealloc(&mut self.fba, &old)?;
            }
            let mut io = IoSpan::new(&mut slot);
            root.write_struct_into(&mut io)?;
            return Ok(slot);
        }

        // indirect: make sure the external space fits (and is not wildly
        // oversized: over 4x triggers a shrinking realloc)
        let external_capacity: u32 = self
            .external_root_sg_loc
            .extents()
            .iter()
            .map(|e| e.calc_data_space_size(order))
            .sum();
        if external_capacity < root_sz || (external_capacity >> 2) > root_sz {
            if self.external_root_sg_loc.ext_cnt() > 0 {
                let old = std::mem::replace(&mut self.external_root_sg_loc, Segment::new(order));
                self.alloc.dealloc(&mut self.fba, &old)?;
            }
            let ext = self.alloc.alloc_single_extent(&mut self.fba, root_sz)?;
            let mut loc = Segment::new(order);
            loc.add_extent(ext);
            self.external_root_sg_loc = loc;
        }

        let mut bytes = vec![0u8; root_sz as usize];
        {
            let mut io = IoSpan::new(&mut bytes);
            root.write_struct_into(&mut io)?;
        }
        {
            let mut loc = self.external_root_sg_loc.clone();
            let mut io = IoSegment::new(&mut self.fba, &mut loc);
            io.writeall(&bytes)?;
        }

        let chksum = fold_inet_checksum(inet_checksum(&bytes));
        let mut loc_enc = self.external_root_sg_loc.clone();
        loc_enc.set_inline_data(chksum.to_le_bytes().to_vec())?;

        let mut io = IoSpan::new(&mut slot);
        loc_enc.write_struct_into(&mut io)?;
        Ok(slot)
    }
}

impl Drop for Repository {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
