#![forbid(unsafe_code)]
//! Block and inode-slot allocation.
//!
//! The allocator owns two persistent bitmaps (one bit per physical block,
//! one bit per inode-table slot) stored in the container's metadata regions.
//! Every allocate/free writes the affected bitmap block back to the store,
//! so after a clean shutdown the persisted view and the in-memory view
//! agree. On mount the in-memory view is rebuilt purely from the superblock
//! and the bitmap regions.
//!
//! Interior state sits behind a single lock, acquired for the duration of
//! one allocate/free call. This is the allocator's own mutual-exclusion
//! discipline, independent of the per-inode serialization imposed on
//! resolver operations by their callers.
//!
//! Freed blocks are handed back to the host filesystem via hole punching:
//! every freed block's byte range is `BLOCK_SIZE`-aligned and sized, which
//! satisfies the deallocation granularity of hole-punch capable hosts.

use parking_lot::Mutex;
use tracing::debug;
use vatfs_block::punch_block;
use vatfs_error::{Result, VatError};
use vatfs_ondisk::Superblock;
use vatfs_store::BackingStore;
use vatfs_types::{Index, BLOCK_SIZE};

const BITS_PER_BLOCK: u64 = (BLOCK_SIZE * 8) as u64;

// ── Bitmap ───────────────────────────────────────────────────────────────────

/// A used/free bitmap over `count` units, kept block-padded so persisting a
/// mutation is one aligned block write. Bit set = used.
#[derive(Debug, Clone)]
struct Bitmap {
    bytes: Vec<u8>,
    count: u64,
}

impl Bitmap {
    fn new_free(count: u64, region_blocks: u64) -> Result<Self> {
        let len = region_blocks
            .checked_mul(BLOCK_SIZE as u64)
            .and_then(|bytes| usize::try_from(bytes).ok())
            .ok_or_else(|| {
                VatError::InvalidArgument(format!(
                    "bitmap region of {region_blocks} blocks does not fit in memory"
                ))
            })?;
        Ok(Self {
            bytes: vec![0_u8; len],
            count,
        })
    }

    fn get(&self, idx: u64) -> bool {
        let byte = self.bytes[(idx / 8) as usize];
        (byte >> (idx % 8)) & 1 == 1
    }

    fn set(&mut self, idx: u64) {
        self.bytes[(idx / 8) as usize] |= 1 << (idx % 8);
    }

    fn clear(&mut self, idx: u64) {
        self.bytes[(idx / 8) as usize] &= !(1 << (idx % 8));
    }

    /// Count free (zero) bits among the first `count` units.
    fn count_free(&self) -> u64 {
        let full_bytes = (self.count / 8) as usize;
        let remainder = self.count % 8;
        let mut free: u64 = self
            .bytes
            .iter()
            .take(full_bytes)
            .map(|byte| u64::from(byte.count_zeros()))
            .sum();
        for bit in 0..remainder {
            if (self.bytes[full_bytes] >> bit) & 1 == 0 {
                free += 1;
            }
        }
        free
    }

    /// First free bit at or after `start`, wrapping around once.
    fn find_free(&self, start: u64) -> Option<u64> {
        (start..self.count)
            .chain(0..start)
            .find(|idx| !self.get(*idx))
    }

    /// Byte range (offset, len) of the bitmap block containing `idx`,
    /// relative to the start of the bitmap region.
    fn block_of(idx: u64) -> (usize, usize) {
        let block = (idx / BITS_PER_BLOCK) as usize;
        (block * BLOCK_SIZE, BLOCK_SIZE)
    }
}

// ── Allocator ────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Maps {
    blocks: Bitmap,
    inodes: Bitmap,
    block_cursor: u64,
    inode_cursor: u64,
    free_blocks: u64,
    free_inodes: u64,
}

/// Tracks which physical block indices and inode-table slots are in use.
#[derive(Debug)]
pub struct IndexAllocator {
    block_region_start: u64,
    inode_region_start: u64,
    data_start: u64,
    total_blocks: u64,
    inode_count: u64,
    inner: Mutex<Maps>,
}

impl IndexAllocator {
    /// Build fresh bitmaps for a new container and persist them.
    ///
    /// Metadata blocks (superblock through the end of the inode table) and
    /// inode slot 0 are pre-marked used.
    pub fn format(store: &BackingStore, sb: &Superblock) -> Result<Self> {
        let mut blocks = Bitmap::new_free(sb.total_blocks, sb.block_bitmap_blocks)?;
        for idx in 0..sb.data_start {
            blocks.set(idx);
        }
        let mut inodes = Bitmap::new_free(sb.inode_count, sb.inode_bitmap_blocks)?;
        inodes.set(0);

        let allocator = Self::assemble(sb, blocks, inodes);
        {
            let maps = allocator.inner.lock();
            store.write_bytes(region_offset(sb.block_bitmap_start)?, &maps.blocks.bytes)?;
            store.write_bytes(region_offset(sb.inode_bitmap_start)?, &maps.inodes.bytes)?;
        }
        Ok(allocator)
    }

    /// Rebuild the in-memory free set from the persisted bitmap regions.
    pub fn load(store: &BackingStore, sb: &Superblock) -> Result<Self> {
        let mut blocks = Bitmap::new_free(sb.total_blocks, sb.block_bitmap_blocks)?;
        store.read_bytes(region_offset(sb.block_bitmap_start)?, &mut blocks.bytes)?;
        let mut inodes = Bitmap::new_free(sb.inode_count, sb.inode_bitmap_blocks)?;
        store.read_bytes(region_offset(sb.inode_bitmap_start)?, &mut inodes.bytes)?;

        if (0..sb.data_start).any(|idx| !blocks.get(idx)) {
            return Err(VatError::Corrupt {
                block: sb.block_bitmap_start,
                detail: "metadata blocks marked free in block bitmap".to_owned(),
            });
        }
        Ok(Self::assemble(sb, blocks, inodes))
    }

    fn assemble(sb: &Superblock, blocks: Bitmap, inodes: Bitmap) -> Self {
        let free_blocks = blocks.count_free();
        let free_inodes = inodes.count_free();
        Self {
            block_region_start: sb.block_bitmap_start,
            inode_region_start: sb.inode_bitmap_start,
            data_start: sb.data_start,
            total_blocks: sb.total_blocks,
            inode_count: sb.inode_count,
            inner: Mutex::new(Maps {
                blocks,
                inodes,
                block_cursor: sb.data_start,
                inode_cursor: 1,
                free_blocks,
                free_inodes,
            }),
        }
    }

    /// Hand out an unused block index and mark it used.
    ///
    /// Fails with `NoSpace` when the bitmap is exhausted or the host volume
    /// cannot materialize one more block (the container is sparse, so an
    /// allocation turns a hole into real storage).
    pub fn allocate_block(&self, store: &BackingStore) -> Result<Index> {
        let mut maps = self.inner.lock();
        let Some(idx) = maps.blocks.find_free(maps.block_cursor) else {
            return Err(VatError::NoSpace);
        };
        if store.stat()?.available_bytes < BLOCK_SIZE as u64 {
            return Err(VatError::NoSpace);
        }
        maps.blocks.set(idx);
        if let Err(err) = self.persist_block_bit(store, &maps, idx) {
            maps.blocks.clear(idx);
            return Err(err);
        }
        maps.free_blocks -= 1;
        maps.block_cursor = if idx + 1 < self.total_blocks {
            idx + 1
        } else {
            self.data_start
        };
        Ok(Index(idx))
    }

    /// Reclaim a block index and punch its byte range back to the host.
    ///
    /// Freeing an index that is already free is a `DoubleFree` consistency
    /// violation, never silently ignored.
    pub fn free_block(&self, store: &BackingStore, index: Index) -> Result<()> {
        let idx = index.0;
        if idx < self.data_start || idx >= self.total_blocks {
            return Err(VatError::InvalidArgument(format!(
                "cannot free reserved or out-of-range block {idx}"
            )));
        }
        let mut maps = self.inner.lock();
        if !maps.blocks.get(idx) {
            return Err(VatError::DoubleFree { index: idx });
        }
        // Punch while the bit still marks the block used: once the bit
        // clears, a concurrent allocation may reissue the index, and a punch
        // landing after that would zero live data.
        punch_block(store, index)?;
        maps.blocks.clear(idx);
        if let Err(err) = self.persist_block_bit(store, &maps, idx) {
            maps.blocks.set(idx);
            return Err(err);
        }
        maps.free_blocks += 1;
        drop(maps);
        debug!(index = idx, "freed block");
        Ok(())
    }

    /// Hand out an unused inode-table slot (never slot 0).
    pub fn allocate_inode(&self, store: &BackingStore) -> Result<u64> {
        let mut maps = self.inner.lock();
        let Some(slot) = maps.inodes.find_free(maps.inode_cursor) else {
            return Err(VatError::NoSpace);
        };
        maps.inodes.set(slot);
        if let Err(err) = self.persist_inode_bit(store, &maps, slot) {
            maps.inodes.clear(slot);
            return Err(err);
        }
        maps.free_inodes -= 1;
        maps.inode_cursor = if slot + 1 < self.inode_count {
            slot + 1
        } else {
            1
        };
        Ok(slot)
    }

    /// Reclaim an inode-table slot.
    pub fn free_inode(&self, store: &BackingStore, slot: u64) -> Result<()> {
        if slot == 0 || slot >= self.inode_count {
            return Err(VatError::InvalidArgument(format!(
                "cannot free reserved or out-of-range inode slot {slot}"
            )));
        }
        let mut maps = self.inner.lock();
        if !maps.inodes.get(slot) {
            return Err(VatError::DoubleFree { index: slot });
        }
        maps.inodes.clear(slot);
        if let Err(err) = self.persist_inode_bit(store, &maps, slot) {
            maps.inodes.set(slot);
            return Err(err);
        }
        maps.free_inodes += 1;
        Ok(())
    }

    /// Currently free block count.
    #[must_use]
    pub fn free_blocks(&self) -> u64 {
        self.inner.lock().free_blocks
    }

    /// Currently free inode-slot count.
    #[must_use]
    pub fn free_inodes(&self) -> u64 {
        self.inner.lock().free_inodes
    }

    fn persist_block_bit(&self, store: &BackingStore, maps: &Maps, idx: u64) -> Result<()> {
        let (at, len) = Bitmap::block_of(idx);
        store.write_bytes(
            region_offset(self.block_region_start)? + at as u64,
            &maps.blocks.bytes[at..at + len],
        )
    }

    fn persist_inode_bit(&self, store: &BackingStore, maps: &Maps, slot: u64) -> Result<()> {
        let (at, len) = Bitmap::block_of(slot);
        store.write_bytes(
            region_offset(self.inode_region_start)? + at as u64,
            &maps.inodes.bytes[at..at + len],
        )
    }
}

fn region_offset(start_block: u64) -> Result<u64> {
    start_block.checked_mul(BLOCK_SIZE as u64).ok_or_else(|| {
        VatError::InvalidArgument(format!(
            "bitmap region offset overflows: start block {start_block}"
        ))
    })
}
