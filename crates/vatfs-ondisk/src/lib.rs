#![forbid(unsafe_code)]
//! Packed on-disk records: the superblock and the inode.
//!
//! Both records use explicit little-endian field-order serialization rather
//! than native struct layout, so the byte-exact format is a contract of this
//! module alone. Field offsets are spelled out in the (de)serialization
//! routines; each record has a `parse_from_bytes` / `write_to_bytes` pair
//! that must stay in lockstep.

mod inode;
mod superblock;

pub use inode::{Inode, INODE_RECORD_SIZE};
pub use superblock::{Superblock, SUPERBLOCK_SPAN, VAT_MAGIC};
