//! Inter-stage ring of shared-memory blocks.
//!
//! One segment per ring, laid out as
//!
//! ```text
//! +--------------------------+
//! | RingHeader               |
//! +--------------------------+
//! | text header, block 0     |   80-char cards ending in END
//! | ...                      |
//! | text header, block N-1   |
//! +--------------------------+
//! | index, block 0           |   heap index or disk (row) index
//! | ...                      |
//! +--------------------------+
//! | data, block 0            |
//! | ...                      |
//! +--------------------------+
//! ```
//!
//! One System V semaphore per block: 0 = free, 1 = filled. Each block has
//! exactly one producer and one consumer; the semaphore is the only
//! synchronization between them.

use std::mem::size_of;

use crate::error::{DaqError, Result};
use crate::shm::{SemSet, ShmSegment};
use crate::status;

pub const MAX_BLOCKS: usize = 1024;
pub const MAX_HEAPS_PER_BLOCK: usize = 4096;

/// Per-block text header size. Large enough to hold a full status-area copy,
/// which is what the capture stage seeds each block with.
pub const BLOCK_HEADER_SIZE: usize = status::STATUS_SIZE;

const RING_MAGIC: u64 = 0x5350_4543_5452_4144; // "SPECTRAD"
const RING_HEADER_SIZE: usize = 64;

/// Base for the SysV semaphore keys; ring id is added on.
const SEM_KEY_BASE: i32 = 0x5d1b_2c00;

#[repr(C)]
struct RingHeader {
    magic: u64,
    ring_id: u32,
    n_block: u32,
    block_size: u64,
}

/// One slot of the index for upstream (heap-carrying) blocks.
#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct HeapSlot {
    pub heap_cntr: u32,
    pub heap_valid: u32,
    pub heap_rcvd_mjd: f64,
}

/// One slot of the index for the disk (row-carrying) ring.
#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct RowSlot {
    pub struct_offset: u32,
    pub array_offset: u32,
}

/// Index header for blocks holding heaps.
#[repr(C)]
pub struct HeapIndex {
    pub num_heaps: u32,
    /// Heap header plus payload bytes for one heap.
    pub heap_size: u32,
    pub slots: [HeapSlot; MAX_HEAPS_PER_BLOCK],
}

/// Index header for blocks holding integration rows.
#[repr(C)]
pub struct RowIndex {
    pub num_datasets: u32,
    /// Data-array bytes per row, fixed for the scan.
    pub array_size: u32,
    pub slots: [RowSlot; 2 * MAX_HEAPS_PER_BLOCK],
}

pub const INDEX_SIZE: usize = size_of::<HeapIndex>();

const _: () = assert!(size_of::<HeapIndex>() == size_of::<RowIndex>());
const _: () = assert!(size_of::<HeapSlot>() == 16);
const _: () = assert!(size_of::<RowSlot>() == 8);

fn shm_name(ring_id: u32) -> String {
    format!("/spectrad-ring-{ring_id}")
}

fn segment_size(n_block: usize, block_size: usize) -> usize {
    RING_HEADER_SIZE + n_block * (BLOCK_HEADER_SIZE + INDEX_SIZE + block_size)
}

pub struct Ring {
    seg: ShmSegment,
    sems: SemSet,
    ring_id: u32,
    n_block: usize,
    block_size: usize,
}

impl Ring {
    /// Allocate the segment and semaphore set; all blocks start free.
    pub fn create(ring_id: u32, n_block: usize, block_size: usize) -> Result<Ring> {
        if n_block == 0 || n_block > MAX_BLOCKS {
            return Err(DaqError::Param(format!("n_block {n_block} out of range")));
        }
        let seg = ShmSegment::create(&shm_name(ring_id), segment_size(n_block, block_size))?;
        let sems = SemSet::create(SEM_KEY_BASE + ring_id as i32, n_block)?;
        let ring = Ring {
            seg,
            sems,
            ring_id,
            n_block,
            block_size,
        };
        unsafe {
            let hdr = &mut *(ring.seg.as_ptr() as *mut RingHeader);
            hdr.magic = RING_MAGIC;
            hdr.ring_id = ring_id;
            hdr.n_block = n_block as u32;
            hdr.block_size = block_size as u64;
        }
        ring.clear()?;
        Ok(ring)
    }

    /// Attach to an existing ring; geometry comes from the segment header.
    pub fn attach(ring_id: u32) -> Result<Ring> {
        let seg = ShmSegment::attach(&shm_name(ring_id))?;
        if seg.len() < RING_HEADER_SIZE {
            return Err(DaqError::Param(format!("ring {ring_id} segment truncated")));
        }
        let (n_block, block_size) = unsafe {
            let hdr = &*(seg.as_ptr() as *const RingHeader);
            if hdr.magic != RING_MAGIC {
                return Err(DaqError::Param(format!("ring {ring_id} has a bad magic")));
            }
            (hdr.n_block as usize, hdr.block_size as usize)
        };
        if seg.len() < segment_size(n_block, block_size) {
            return Err(DaqError::Param(format!("ring {ring_id} segment truncated")));
        }
        let sems = SemSet::attach(SEM_KEY_BASE + ring_id as i32, n_block)?;
        Ok(Ring {
            seg,
            sems,
            ring_id,
            n_block,
            block_size,
        })
    }

    pub fn unlink(ring_id: u32) {
        ShmSegment::unlink(&shm_name(ring_id));
        SemSet::remove(SEM_KEY_BASE + ring_id as i32);
    }

    pub fn ring_id(&self) -> u32 {
        self.ring_id
    }

    pub fn n_block(&self) -> usize {
        self.n_block
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Heaps that fit one block given the per-heap payload size: the header
    /// table is always sized for `MAX_HEAPS_PER_BLOCK` entries, payload slots
    /// take the rest.
    pub fn heaps_per_block(&self, payload_size: usize) -> usize {
        let hdr_area = MAX_HEAPS_PER_BLOCK * crate::spead::HEAP_HEADER_SIZE;
        if payload_size == 0 || self.block_size <= hdr_area {
            return 0;
        }
        ((self.block_size - hdr_area) / payload_size).min(MAX_HEAPS_PER_BLOCK)
    }

    // ---- block state ----

    pub fn wait_filled(&self, block: usize) -> Result<()> {
        self.sems.wait_positive(block)
    }

    pub fn wait_free(&self, block: usize) -> Result<()> {
        self.sems.wait_zero(block)
    }

    pub fn set_filled(&self, block: usize) -> Result<()> {
        self.sems.set(block, 1)
    }

    pub fn set_free(&self, block: usize) -> Result<()> {
        self.sems.set(block, 0)
    }

    pub fn block_status(&self, block: usize) -> Result<i32> {
        self.sems.value(block)
    }

    /// Number of blocks currently filled.
    pub fn total_status(&self) -> Result<u32> {
        Ok(self.sems.values()?.iter().map(|&v| v as u32).sum())
    }

    /// Free every block and reseed every text header with a bare `END`.
    pub fn clear(&self) -> Result<()> {
        for i in 0..self.n_block {
            self.sems.set(i, 0)?;
            status::clear_cards(unsafe { self.seg.slice_mut(self.header_offset(i), BLOCK_HEADER_SIZE) });
            let idx = unsafe { self.seg.slice_mut(self.index_offset(i), INDEX_SIZE) };
            idx[..8].fill(0);
        }
        Ok(())
    }

    // ---- block regions ----

    fn header_offset(&self, block: usize) -> usize {
        assert!(block < self.n_block);
        RING_HEADER_SIZE + block * BLOCK_HEADER_SIZE
    }

    fn index_offset(&self, block: usize) -> usize {
        assert!(block < self.n_block);
        RING_HEADER_SIZE + self.n_block * BLOCK_HEADER_SIZE + block * INDEX_SIZE
    }

    fn data_offset(&self, block: usize) -> usize {
        assert!(block < self.n_block);
        RING_HEADER_SIZE
            + self.n_block * (BLOCK_HEADER_SIZE + INDEX_SIZE)
            + block * self.block_size
    }

    pub fn header(&self, block: usize) -> &[u8] {
        unsafe { self.seg.slice(self.header_offset(block), BLOCK_HEADER_SIZE) }
    }

    pub fn header_mut(&mut self, block: usize) -> &mut [u8] {
        unsafe { self.seg.slice_mut(self.header_offset(block), BLOCK_HEADER_SIZE) }
    }

    pub fn heap_index(&self, block: usize) -> &HeapIndex {
        unsafe { &*(self.seg.as_ptr().add(self.index_offset(block)) as *const HeapIndex) }
    }

    pub fn heap_index_mut(&mut self, block: usize) -> &mut HeapIndex {
        unsafe { &mut *(self.seg.as_ptr().add(self.index_offset(block)) as *mut HeapIndex) }
    }

    pub fn row_index(&self, block: usize) -> &RowIndex {
        unsafe { &*(self.seg.as_ptr().add(self.index_offset(block)) as *const RowIndex) }
    }

    pub fn row_index_mut(&mut self, block: usize) -> &mut RowIndex {
        unsafe { &mut *(self.seg.as_ptr().add(self.index_offset(block)) as *mut RowIndex) }
    }

    pub fn data(&self, block: usize) -> &[u8] {
        unsafe { self.seg.slice(self.data_offset(block), self.block_size) }
    }

    pub fn data_mut(&mut self, block: usize) -> &mut [u8] {
        unsafe { self.seg.slice_mut(self.data_offset(block), self.block_size) }
    }

    /// Mutable views of two distinct blocks' data regions at once (the
    /// low-bandwidth block merge compacts several blocks into the first).
    pub fn data_pair_mut(&mut self, a: usize, b: usize) -> (&mut [u8], &mut [u8]) {
        assert!(a != b);
        unsafe {
            (
                self.seg.slice_mut(self.data_offset(a), self.block_size),
                self.seg.slice_mut(self.data_offset(b), self.block_size),
            )
        }
    }

    /// Copy the text header of `src` into the header of `dst` within the same
    /// ring (the accumulator seeds fresh output blocks this way).
    pub fn copy_header(&mut self, src_header: &[u8], dst: usize) {
        let dst_buf = self.header_mut(dst);
        dst_buf.copy_from_slice(src_header);
    }
}
