//! Single-file block/extent/segment storage engine core.
//!
//! A host file (or in-memory buffer) is organized as an array of fixed-size
//! blocks. Space inside the array is described by [`Extent`]s (runs of full
//! blocks, or sub-block bitmaps over one shared block) grouped into
//! [`Segment`]s, which can also carry a small inline tail. The
//! [`SegmentAllocator`] hands out segments over any [`BlockArray`];
//! [`IoSpan`]/[`IoSegment`] provide cursor-style IO over buffers and
//! segments; [`Repository`] bootstraps the whole thing from the on-disk
//! header/trailer.

pub mod allocator;
pub mod block_array;
pub mod error;
pub mod extent;
pub mod file_block_array;
pub mod free_map;
pub mod header;
pub mod io;
pub mod iosegment;
pub mod iospan;
pub mod mem;
pub mod repository;
pub mod segment;
pub mod segment_block_array;
pub mod subblock_map;
pub mod tail_allocator;
pub mod vector_block_array;

pub use allocator::{AllocRequest, SegmentAllocator};
pub use block_array::{BlockArray, BlockArrayState};
pub use error::{Error, Result};
pub use extent::{BlkDistance, Extent};
pub use file_block_array::{FileBlockArray, FileGeometry};
pub use io::{IoBase, RwState, Seekdir};
pub use iosegment::IoSegment;
pub use iospan::IoSpan;
pub use repository::{GlobalParameters, Repository};
pub use segment::Segment;
pub use segment_block_array::{SegmentBlockArray, SG_BLKARR_REALLOC_ON_GROW};
pub use tail_allocator::TailAllocator;
pub use vector_block_array::VectorBlockArray;
