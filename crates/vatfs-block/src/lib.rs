#![forbid(unsafe_code)]
//! The fixed-size storage granule.
//!
//! A block is a plain byte buffer with three disjoint interpretations, never
//! mixed within one block's lifetime: raw file data, an array of index slots
//! (indirection-tree interior node), or a symlink-target buffer. The
//! interpretation is determined solely by the slot that references the
//! block, never by inspecting its bytes, so there is no runtime tag, only
//! context-applied accessors.
//!
//! A block performs no I/O of its own; [`read_block`] and [`write_block`]
//! materialize and persist blocks through the backing store at the byte
//! offset `index * BLOCK_SIZE`.

use vatfs_error::{Result, VatError};
use vatfs_store::BackingStore;
use vatfs_types::{Index, BLOCK_SIZE, INDEX_SPAN, SLOTS_PER_BLOCK};

/// One fixed-size storage unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    bytes: Box<[u8; BLOCK_SIZE]>,
}

impl Block {
    /// A new data block: zero-filled.
    #[must_use]
    pub fn new_data() -> Self {
        Self {
            bytes: Box::new([0_u8; BLOCK_SIZE]),
        }
    }

    /// A new interior index block: every slot holds the "no block" sentinel.
    #[must_use]
    pub fn new_indices() -> Self {
        // The sentinel is raw 0, so the byte patterns coincide; the
        // distinction is the declared interpretation.
        Self::new_data()
    }

    /// A new symlink-target block: zero-filled, semantically distinct from a
    /// data block.
    #[must_use]
    pub fn new_target() -> Self {
        Self::new_data()
    }

    /// Reinitialize as a data block.
    pub fn reset_data(&mut self) {
        self.bytes.fill(0);
    }

    /// Reinitialize as an index block: all slots become the sentinel.
    pub fn reset_indices(&mut self) {
        self.bytes.fill(0);
    }

    /// Reinitialize as a symlink-target block.
    pub fn reset_target(&mut self) {
        self.bytes.fill(0);
    }

    /// Read index slot `slot` (interpretation: index block).
    ///
    /// # Panics
    /// Panics if `slot >= SLOTS_PER_BLOCK`.
    #[must_use]
    pub fn slot(&self, slot: usize) -> Option<Index> {
        assert!(slot < SLOTS_PER_BLOCK, "slot {slot} out of range");
        let at = slot * INDEX_SPAN;
        let mut raw = [0_u8; INDEX_SPAN];
        raw.copy_from_slice(&self.bytes[at..at + INDEX_SPAN]);
        Index::from_slot(u64::from_le_bytes(raw))
    }

    /// Write index slot `slot` (interpretation: index block).
    ///
    /// # Panics
    /// Panics if `slot >= SLOTS_PER_BLOCK`.
    pub fn set_slot(&mut self, slot: usize, index: Option<Index>) {
        assert!(slot < SLOTS_PER_BLOCK, "slot {slot} out of range");
        let at = slot * INDEX_SPAN;
        self.bytes[at..at + INDEX_SPAN].copy_from_slice(&Index::to_slot(index).to_le_bytes());
    }

    /// Whether every slot holds the sentinel (interior node is empty).
    #[must_use]
    pub fn all_slots_free(&self) -> bool {
        self.bytes.iter().all(|byte| *byte == 0)
    }

    /// Raw bytes (interpretation: data or target block).
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.bytes.as_slice()
    }

    /// Mutable raw bytes.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        self.bytes.as_mut_slice()
    }
}

/// Read the block at `index` from the store.
pub fn read_block(store: &BackingStore, index: Index) -> Result<Block> {
    let offset = block_offset(index)?;
    let mut block = Block::new_data();
    store.read_bytes(offset, block.as_bytes_mut())?;
    Ok(block)
}

/// Persist `block` at `index`.
pub fn write_block(store: &BackingStore, index: Index, block: &Block) -> Result<()> {
    store.write_bytes(block_offset(index)?, block.as_bytes())
}

/// Punch the byte range of the block at `index` (best-effort, see store).
pub fn punch_block(store: &BackingStore, index: Index) -> Result<()> {
    store.punch_hole(block_offset(index)?, BLOCK_SIZE as u64)
}

fn block_offset(index: Index) -> Result<u64> {
    index
        .byte_offset()
        .ok_or_else(|| VatError::InvalidArgument(format!("block offset overflow: index={index}")))
}
