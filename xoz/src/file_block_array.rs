//! Block array over a real file or an in-memory buffer.
//!
//! The physical layout is `[header blocks][data blocks][trailer bytes]`.
//! The trailer is loaded into memory at open and written back only at
//! close, so a `write_trailer` never touches the storage by itself. A
//! closed array stays closed: reopening means building a new instance, so
//! stale observers of the old one can never silently switch to different
//! underlying data.

use std::fs::OpenOptions;
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::info;

use crate::block_array::{BlockArray, BlockArrayState};
use crate::error::{Error, Result};

/// Geometry reported by a preload callback: some formats (the repository
/// header among them) store their own block size in a prefix of the file,
/// so the callback gets to read it before the array is laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileGeometry {
    pub blk_sz: u32,
    pub begin_blk_nr: u32,
}

#[derive(Debug)]
enum Store {
    Disk(std::fs::File),
    Mem(Cursor<Vec<u8>>),
}

impl Store {
    fn len(&self) -> Result<u64> {
        match self {
            Store::Disk(f) => Ok(f.metadata()?.len()),
            Store::Mem(c) => Ok(c.get_ref().len() as u64),
        }
    }

    fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<()> {
        match self {
            Store::Disk(f) => {
                f.seek(SeekFrom::Start(pos))?;
                f.read_exact(buf)?;
            }
            Store::Mem(c) => {
                c.seek(SeekFrom::Start(pos))?;
                c.read_exact(buf)?;
            }
        }
        Ok(())
    }

    fn write_at(&mut self, pos: u64, buf: &[u8]) -> Result<()> {
        match self {
            Store::Disk(f) => {
                f.seek(SeekFrom::Start(pos))?;
                f.write_all(buf)?;
            }
            Store::Mem(c) => {
                c.seek(SeekFrom::Start(pos))?;
                c.write_all(buf)?;
            }
        }
        Ok(())
    }

    fn set_len(&mut self, sz: u64) -> Result<()> {
        match self {
            Store::Disk(f) => f.set_len(sz)?,
            Store::Mem(c) => c.get_mut().resize(sz as usize, 0),
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        match self {
            Store::Disk(f) => f.flush()?,
            Store::Mem(_) => {}
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct FileBlockArray {
    store: Store,
    state: BlockArrayState,
    fpath: Option<PathBuf>,
    closed: bool,
}

impl FileBlockArray {
    /// Open the file at `fpath`, creating it empty if it does not exist
    /// (or failing if it exists and `fail_if_exists` is set). No check of
    /// any kind is made on the content: if it can be opened, it is good.
    pub fn create<P: AsRef<Path>>(
        fpath: P,
        blk_sz: u32,
        begin_blk_nr: u32,
        fail_if_exists: bool,
    ) -> Result<FileBlockArray> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .create_new(fail_if_exists)
            .open(fpath.as_ref())?;

        Self::from_store(
            Store::Disk(file),
            FileGeometry { blk_sz, begin_blk_nr },
            Some(fpath.as_ref().to_path_buf()),
        )
    }

    /// Like `create` but backed by a fresh in-memory buffer.
    pub fn create_mem_based(blk_sz: u32, begin_blk_nr: u32) -> Result<FileBlockArray> {
        Self::from_store(
            Store::Mem(Cursor::new(Vec::new())),
            FileGeometry { blk_sz, begin_blk_nr },
            None,
        )
    }

    /// Adopt an existing in-memory image (say, the bytes a previous
    /// instance left behind at close).
    pub fn from_mem(mem: Vec<u8>, blk_sz: u32, begin_blk_nr: u32) -> Result<FileBlockArray> {
        Self::from_store(
            Store::Mem(Cursor::new(mem)),
            FileGeometry { blk_sz, begin_blk_nr },
            None,
        )
    }

    /// Open an existing file whose geometry is decided by the caller from
    /// the file's own bytes: `preload` reads from the start of the stream
    /// and reports the block size and reserved header blocks.
    pub fn open_with_preload<P, F>(fpath: P, preload: F) -> Result<FileBlockArray>
    where
        P: AsRef<Path>,
        F: FnOnce(&mut dyn Read) -> Result<FileGeometry>,
    {
        let file = OpenOptions::new().read(true).write(true).open(fpath.as_ref())?;
        let mut store = Store::Disk(file);
        let geom = Self::run_preload(&mut store, preload)?;
        Self::from_store(store, geom, Some(fpath.as_ref().to_path_buf()))
    }

    /// The in-memory flavor of `open_with_preload`.
    pub fn from_mem_with_preload<F>(mem: Vec<u8>, preload: F) -> Result<FileBlockArray>
    where
        F: FnOnce(&mut dyn Read) -> Result<FileGeometry>,
    {
        let mut store = Store::Mem(Cursor::new(mem));
        let geom = Self::run_preload(&mut store, preload)?;
        Self::from_store(store, geom, None)
    }

    fn run_preload<F>(store: &mut Store, preload: F) -> Result<FileGeometry>
    where
        F: FnOnce(&mut dyn Read) -> Result<FileGeometry>,
    {
        match store {
            Store::Disk(f) => {
                f.seek(SeekFrom::Start(0))?;
                preload(f)
            }
            Store::Mem(c) => {
                c.seek(SeekFrom::Start(0))?;
                preload(c)
            }
        }
    }

    fn from_store(mut store: Store, geom: FileGeometry, fpath: Option<PathBuf>) -> Result<FileBlockArray> {
        if geom.blk_sz < 64 || geom.blk_sz > 65536 {
            return Err(Error::InvalidArgument(format!(
                "block size {} is out of range [64 to 65536]",
                geom.blk_sz
            )));
        }

        let header_sz = u64::from(geom.begin_blk_nr) * u64::from(geom.blk_sz);
        let file_sz = store.len()?;

        // a fresh (or too short) file gets its header space reserved now
        if file_sz < header_sz {
            store.set_len(header_sz)?;
        }
        let file_sz = store.len()?.max(header_sz);

        let blocks_bytes = file_sz - header_sz;
        let blk_cnt = (blocks_bytes / u64::from(geom.blk_sz)) as u32;
        let trailer_sz = (blocks_bytes % u64::from(geom.blk_sz)) as usize;

        let mut trailer = vec![0u8; trailer_sz];
        if trailer_sz > 0 {
            store.read_at(header_sz + u64::from(blk_cnt) * u64::from(geom.blk_sz), &mut trailer)?;
        }

        let mut state = BlockArrayState::new(geom.blk_sz, geom.begin_blk_nr, geom.begin_blk_nr + blk_cnt)?;
        state.set_trailer(trailer);

        info!(
            "file block array opened: blk_sz {} begin {} blocks {} trailer {}B ({})",
            geom.blk_sz,
            geom.begin_blk_nr,
            blk_cnt,
            trailer_sz,
            fpath
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "@in-memory".to_string()),
        );

        Ok(FileBlockArray {
            store,
            state,
            fpath,
            closed: false,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_mem_based(&self) -> bool {
        matches!(self.store, Store::Mem(_))
    }

    pub fn fpath(&self) -> Option<&Path> {
        self.fpath.as_deref()
    }

    /// Current physical size, trailer and pending-release slack included.
    pub fn phy_file_sz(&self) -> Result<u64> {
        self.store.len()
    }

    /// The raw bytes of a memory-based array; `None` when disk-based.
    pub fn mem_contents(&self) -> Option<&[u8]> {
        match &self.store {
            Store::Mem(c) => Some(c.get_ref()),
            Store::Disk(_) => None,
        }
    }

    /// Release pending blocks and push the in-memory trailer out to the
    /// storage, truncating it to exactly the used blocks plus the trailer.
    /// The array stays usable; this is what `close` runs one last time.
    pub fn sync_trailer(&mut self) -> Result<()> {
        self.fail_if_closed()?;
        self.release_blocks()?;

        let end = u64::from(self.past_end_blk_nr()) * u64::from(self.blk_sz());
        let trailer = self.ba_state().trailer_clone();
        if !trailer.is_empty() {
            self.store.write_at(end, &trailer)?;
        }
        self.store.set_len(end + trailer.len() as u64)?;
        self.store.flush()
    }

    /// Release pending blocks, write the trailer at the end and shrink the
    /// storage to exactly the used blocks plus the trailer. Once closed
    /// the array rejects any further IO; closing again is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.sync_trailer()?;
        self.closed = true;

        info!(
            "file block array closed: {} blocks + {}B trailer",
            self.blk_cnt(),
            self.trailer_sz()
        );
        Ok(())
    }

    fn fail_if_closed(&self) -> Result<()> {
        if self.closed {
            return Err(Error::InconsistentState(
                "the file block array is closed; create a new instance to reopen the file".to_string(),
            ));
        }
        Ok(())
    }
}

impl BlockArray for FileBlockArray {
    fn ba_state(&self) -> &BlockArrayState {
        &self.state
    }

    fn ba_state_mut(&mut self) -> &mut BlockArrayState {
        &mut self.state
    }

    fn impl_grow_by_blocks(&mut self, blk_cnt: u32) -> Result<()> {
        self.fail_if_closed()?;
        let new_end =
            u64::from(self.ba_state().capacity_end_blk_nr() + blk_cnt) * u64::from(self.blk_sz());
        self.store.set_len(new_end)
    }

    fn impl_release_blocks(&mut self) -> Result<u32> {
        self.fail_if_closed()?;
        let slack = self.capacity() - self.blk_cnt();
        let end = u64::from(self.past_end_blk_nr()) * u64::from(self.blk_sz());
        self.store.set_len(end)?;
        Ok(slack)
    }

    fn impl_read(&mut self, blk_nr: u32, offset: u32, buf: &mut [u8]) -> Result<()> {
        self.fail_if_closed()?;
        let pos = u64::from(blk_nr) * u64::from(self.blk_sz()) + u64::from(offset);
        self.store.read_at(pos, buf)
    }

    fn impl_write(&mut self, blk_nr: u32, offset: u32, buf: &[u8]) -> Result<()> {
        self.fail_if_closed()?;
        let pos = u64::from(blk_nr) * u64::from(self.blk_sz()) + u64::from(offset);
        self.store.write_at(pos, buf)
    }
}

impl Drop for FileBlockArray {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extent::Extent;

    #[test]
    fn test_create_mem_and_grow() {
        let mut fba = FileBlockArray::create_mem_based(64, 1).unwrap();
        assert_eq!(fba.begin_blk_nr(), 1);
        assert_eq!(fba.past_end_blk_nr(), 1);
        assert_eq!(fba.blk_cnt(), 0);
        assert_eq!(fba.header_sz(), 64);
        assert_eq!(fba.phy_file_sz().unwrap(), 64);

        let old = fba.grow_by_blocks(3).unwrap();
        assert_eq!(old, 1);
        assert_eq!(fba.blk_cnt(), 3);
        assert_eq!(fba.phy_file_sz().unwrap(), 4 * 64);

        let ext = Extent::new(1, 3, false).unwrap();
        let wrbuf: Vec<u8> = (0..192).map(|i| i as u8).collect();
        assert_eq!(fba.write_extent(&ext, &wrbuf).unwrap(), 192);

        let mut rdbuf = vec![0u8; 192];
        assert_eq!(fba.read_extent(&ext, &mut rdbuf).unwrap(), 192);
        assert_eq!(rdbuf, wrbuf);
    }

    #[test]
    fn test_block_zero_is_reserved() {
        let mut fba = FileBlockArray::create_mem_based(64, 1).unwrap();
        fba.grow_by_blocks(1).unwrap();

        let ext = Extent::new(0, 1, false).unwrap();
        let err = fba.write_extent(&ext, &[0u8; 64]).unwrap_err();
        assert_eq!(err.to_string(), "The block 0x00 cannot be written");

        let err = fba.read_extent(&ext, &mut [0u8; 64]).unwrap_err();
        assert_eq!(err.to_string(), "The block 0x00 cannot be read");
    }

    #[test]
    fn test_shrink_defers_physical_release() {
        let mut fba = FileBlockArray::create_mem_based(64, 1).unwrap();
        fba.grow_by_blocks(5).unwrap();
        assert_eq!(fba.phy_file_sz().unwrap(), 6 * 64);

        fba.shrink_by_blocks(2).unwrap();
        assert_eq!(fba.blk_cnt(), 3);
        assert_eq!(fba.capacity(), 5);
        assert_eq!(fba.phy_file_sz().unwrap(), 6 * 64);

        assert_eq!(fba.release_blocks().unwrap(), 2);
        assert_eq!(fba.capacity(), 3);
        assert_eq!(fba.phy_file_sz().unwrap(), 4 * 64);

        // regrow reuses no stale bytes: blocks read back as zeros
        fba.grow_by_blocks(1).unwrap();
        let mut rdbuf = [0xffu8; 64];
        fba.read_extent(&Extent::new(4, 1, false).unwrap(), &mut rdbuf).unwrap();
        assert_eq!(rdbuf, [0u8; 64]);
    }

    #[test]
    fn test_close_writes_trailer_and_truncates() {
        let mut fba = FileBlockArray::create_mem_based(64, 1).unwrap();
        fba.grow_by_blocks(3).unwrap();

        let mut wrbuf = vec![0u8; 64];
        for (i, b) in wrbuf.iter_mut().enumerate() {
            *b = i as u8;
        }
        for blk in 1..=3u32 {
            wrbuf[0] = blk as u8;
            fba.write_extent(&Extent::new(blk, 1, false).unwrap(), &wrbuf).unwrap();
        }

        fba.write_trailer(b"EOF\0").unwrap();
        fba.shrink_by_blocks(1).unwrap();
        fba.close().unwrap();
        // close is idempotent
        fba.close().unwrap();

        let mem = fba.mem_contents().unwrap().to_vec();
        assert_eq!(mem.len(), 64 + 2 * 64 + 4);
        assert_eq!(&mem[mem.len() - 4..], b"EOF\0");
        assert_eq!(mem[64], 1);
        assert_eq!(mem[128], 2);

        // any IO after close fails
        let mut fba2 = fba;
        assert!(fba2.grow_by_blocks(1).is_err());
        assert!(fba2
            .read_extent(&Extent::new(1, 1, false).unwrap(), &mut [0u8; 64])
            .is_err());

        // reopening is a new instance; geometry and data survive
        let mut fba3 = FileBlockArray::from_mem(mem, 64, 1).unwrap();
        assert_eq!(fba3.blk_cnt(), 2);
        assert_eq!(fba3.trailer_sz(), 4);
        let mut t = [0u8; 4];
        fba3.read_trailer(&mut t).unwrap();
        assert_eq!(&t, b"EOF\0");

        let mut rdbuf = [0u8; 64];
        fba3.read_extent(&Extent::new(1, 1, false).unwrap(), &mut rdbuf).unwrap();
        assert_eq!(rdbuf[0], 1);
        assert_eq!(rdbuf[1], 1);
    }

    #[test]
    fn test_trailer_update_in_memory_only() {
        let mut fba = FileBlockArray::create_mem_based(64, 1).unwrap();
        fba.grow_by_blocks(1).unwrap();

        fba.write_trailer(b"AB").unwrap();
        assert_eq!(fba.trailer_sz(), 2);
        // the storage does not see the trailer until close
        assert_eq!(fba.phy_file_sz().unwrap(), 2 * 64);

        // the trailer may grow and shrink freely (under one block)
        fba.write_trailer(b"ABCDEF").unwrap();
        assert_eq!(fba.trailer_sz(), 6);
        assert!(fba.write_trailer(&[0u8; 64]).is_err());

        fba.close().unwrap();
        assert_eq!(fba.phy_file_sz().unwrap(), 2 * 64 + 6);
    }

    #[test]
    fn test_disk_backed_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocks.xoz");

        {
            let mut fba = FileBlockArray::create(&path, 128, 1, false).unwrap();
            fba.grow_by_blocks(2).unwrap();
            fba.write_extent(&Extent::new(1, 1, false).unwrap(), b"hello disk").unwrap();
            fba.write_trailer(b"EOF\0").unwrap();
            fba.close().unwrap();
        }

        assert_eq!(std::fs::metadata(&path).unwrap().len(), 3 * 128 + 4);

        {
            let mut fba = FileBlockArray::create(&path, 128, 1, false).unwrap();
            assert_eq!(fba.blk_cnt(), 2);
            assert_eq!(fba.trailer_sz(), 4);
            let mut rdbuf = [0u8; 10];
            fba.read_extent(&Extent::new(1, 1, false).unwrap(), &mut rdbuf).unwrap();
            assert_eq!(&rdbuf, b"hello disk");
        }

        // create_new on an existing file fails
        assert!(FileBlockArray::create(&path, 128, 1, true).is_err());
    }

    #[test]
    fn test_preload_reads_geometry_from_prefix() {
        // a tiny format: one byte of block size order at offset 0
        let mut fba = FileBlockArray::create_mem_based(128, 1).unwrap();
        fba.grow_by_blocks(1).unwrap();
        fba.write_header(&[7u8]).unwrap();
        fba.close().unwrap();
        let mem = fba.mem_contents().unwrap().to_vec();

        let fba = FileBlockArray::from_mem_with_preload(mem, |r| {
            let mut b = [0u8; 1];
            r.read_exact(&mut b)?;
            Ok(FileGeometry {
                blk_sz: 1u32 << b[0],
                begin_blk_nr: 1,
            })
        })
        .unwrap();

        assert_eq!(fba.blk_sz(), 128);
        assert_eq!(fba.begin_blk_nr(), 1);
        assert_eq!(fba.blk_cnt(), 1);
    }

    #[test]
    fn test_bad_blk_sz_rejected() {
        assert!(FileBlockArray::create_mem_based(48, 0).is_err());
        assert!(FileBlockArray::create_mem_based(32, 0).is_err());
        assert!(FileBlockArray::create_mem_based(131072, 0).is_err());
        assert!(FileBlockArray::create_mem_based(65536, 0).is_ok());
    }
}
