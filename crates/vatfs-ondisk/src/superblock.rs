use crate::inode::INODE_RECORD_SIZE;
use serde::{Deserialize, Serialize};
use vatfs_types::{read_le_u32, read_le_u64, write_le_u32, write_le_u64, ParseError, BLOCK_SIZE};

/// Container magic, `b"vatfs"` plus a format version byte, little-endian.
pub const VAT_MAGIC: u64 = u64::from_le_bytes(*b"vatfs\x00\x00\x01");

/// Serialized superblock width in bytes. The record lives at the start of
/// block 0; the rest of the block is reserved.
pub const SUPERBLOCK_SPAN: usize = 84;

const BITS_PER_BLOCK: u64 = (BLOCK_SIZE * 8) as u64;

/// The self-describing layout record at block 0.
///
/// Region order is fixed: superblock, block bitmap, inode bitmap, inode
/// table, data/index block area. All region extents are stored explicitly so
/// the allocator's free set can be rebuilt on mount from this record and the
/// bitmap regions alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub block_size: u32,
    pub total_blocks: u64,
    pub inode_count: u64,
    pub block_bitmap_start: u64,
    pub block_bitmap_blocks: u64,
    pub inode_bitmap_start: u64,
    pub inode_bitmap_blocks: u64,
    pub inode_table_start: u64,
    pub inode_table_blocks: u64,
    pub data_start: u64,
}

impl Superblock {
    /// Compute the layout for a fresh container.
    ///
    /// `total_blocks` counts every block including metadata; `inode_count`
    /// counts inode-table slots including the reserved slot 0.
    pub fn for_geometry(total_blocks: u64, inode_count: u64) -> Result<Self, ParseError> {
        if inode_count < 2 {
            return Err(ParseError::InvalidField {
                field: "inode_count",
                reason: "need at least the reserved slot and one usable inode",
            });
        }
        let block_bitmap_blocks = total_blocks.div_ceil(BITS_PER_BLOCK);
        let inode_bitmap_blocks = inode_count.div_ceil(BITS_PER_BLOCK);
        let table_bytes = inode_count
            .checked_mul(INODE_RECORD_SIZE as u64)
            .ok_or(ParseError::IntegerConversion {
                field: "inode_count",
            })?;
        let inode_table_blocks = table_bytes.div_ceil(BLOCK_SIZE as u64);

        let block_bitmap_start = 1;
        let inode_bitmap_start = block_bitmap_start + block_bitmap_blocks;
        let inode_table_start = inode_bitmap_start + inode_bitmap_blocks;
        let data_start = inode_table_start + inode_table_blocks;
        if data_start >= total_blocks {
            return Err(ParseError::InvalidField {
                field: "total_blocks",
                reason: "too small to hold metadata plus one data block",
            });
        }

        let sb = Self {
            block_size: BLOCK_SIZE as u32,
            total_blocks,
            inode_count,
            block_bitmap_start,
            block_bitmap_blocks,
            inode_bitmap_start,
            inode_bitmap_blocks,
            inode_table_start,
            inode_table_blocks,
            data_start,
        };
        sb.container_bytes()?;
        Ok(sb)
    }

    /// Container length in bytes implied by the geometry.
    pub fn container_bytes(&self) -> Result<u64, ParseError> {
        self.total_blocks
            .checked_mul(BLOCK_SIZE as u64)
            .ok_or(ParseError::IntegerConversion {
                field: "total_blocks",
            })
    }

    /// Parse and validate a superblock from the start of block 0.
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        let magic = read_le_u64(bytes, 0x00)?;
        if magic != VAT_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: VAT_MAGIC,
                actual: magic,
            });
        }
        let sb = Self {
            block_size: read_le_u32(bytes, 0x08)?,
            total_blocks: read_le_u64(bytes, 0x0C)?,
            inode_count: read_le_u64(bytes, 0x14)?,
            block_bitmap_start: read_le_u64(bytes, 0x1C)?,
            block_bitmap_blocks: read_le_u64(bytes, 0x24)?,
            inode_bitmap_start: read_le_u64(bytes, 0x2C)?,
            inode_bitmap_blocks: read_le_u64(bytes, 0x34)?,
            inode_table_start: read_le_u64(bytes, 0x3C)?,
            inode_table_blocks: read_le_u64(bytes, 0x44)?,
            data_start: read_le_u64(bytes, 0x4C)?,
        };
        sb.validate()?;
        Ok(sb)
    }

    /// Serialize into the start of a block buffer.
    pub fn write_to_bytes(&self, bytes: &mut [u8]) -> Result<(), ParseError> {
        write_le_u64(bytes, 0x00, VAT_MAGIC)?;
        write_le_u32(bytes, 0x08, self.block_size)?;
        write_le_u64(bytes, 0x0C, self.total_blocks)?;
        write_le_u64(bytes, 0x14, self.inode_count)?;
        write_le_u64(bytes, 0x1C, self.block_bitmap_start)?;
        write_le_u64(bytes, 0x24, self.block_bitmap_blocks)?;
        write_le_u64(bytes, 0x2C, self.inode_bitmap_start)?;
        write_le_u64(bytes, 0x34, self.inode_bitmap_blocks)?;
        write_le_u64(bytes, 0x3C, self.inode_table_start)?;
        write_le_u64(bytes, 0x44, self.inode_table_blocks)?;
        write_le_u64(bytes, 0x4C, self.data_start)
    }

    /// Sanity-check a parsed record. Every field is untrusted input, so all
    /// derived quantities use checked arithmetic; an overflow is as corrupt
    /// as an out-of-order region.
    fn validate(&self) -> Result<(), ParseError> {
        let overflow = |field: &'static str| ParseError::IntegerConversion { field };
        if self.block_size as usize != BLOCK_SIZE {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "container block size differs from this build",
            });
        }
        let inode_bitmap_start = self
            .block_bitmap_start
            .checked_add(self.block_bitmap_blocks)
            .ok_or(overflow("regions"))?;
        let inode_table_start = inode_bitmap_start
            .checked_add(self.inode_bitmap_blocks)
            .ok_or(overflow("regions"))?;
        let data_start = inode_table_start
            .checked_add(self.inode_table_blocks)
            .ok_or(overflow("regions"))?;
        if self.block_bitmap_start != 1
            || self.inode_bitmap_start != inode_bitmap_start
            || self.inode_table_start != inode_table_start
            || self.data_start != data_start
        {
            return Err(ParseError::InvalidField {
                field: "regions",
                reason: "metadata regions are not contiguous in layout order",
            });
        }
        if self.data_start >= self.total_blocks {
            return Err(ParseError::InvalidField {
                field: "data_start",
                reason: "no data region within total_blocks",
            });
        }
        self.container_bytes()?;
        let block_bits = self
            .block_bitmap_blocks
            .checked_mul(BITS_PER_BLOCK)
            .ok_or(overflow("block_bitmap_blocks"))?;
        if block_bits < self.total_blocks {
            return Err(ParseError::InvalidField {
                field: "block_bitmap_blocks",
                reason: "bitmap does not cover all blocks",
            });
        }
        let inode_bits = self
            .inode_bitmap_blocks
            .checked_mul(BITS_PER_BLOCK)
            .ok_or(overflow("inode_bitmap_blocks"))?;
        if inode_bits < self.inode_count {
            return Err(ParseError::InvalidField {
                field: "inode_bitmap_blocks",
                reason: "bitmap does not cover all inode slots",
            });
        }
        let table_bytes = self
            .inode_count
            .checked_mul(INODE_RECORD_SIZE as u64)
            .ok_or(overflow("inode_count"))?;
        let table_capacity = self
            .inode_table_blocks
            .checked_mul(BLOCK_SIZE as u64)
            .ok_or(overflow("inode_table_blocks"))?;
        if table_capacity < table_bytes {
            return Err(ParseError::InvalidField {
                field: "inode_table_blocks",
                reason: "table does not cover all inode records",
            });
        }
        Ok(())
    }
}
