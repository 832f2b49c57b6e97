#![forbid(unsafe_code)]
//! The vatfs storage engine.
//!
//! A [`Vat`] is one open container file: superblock, allocator bitmaps, a
//! fixed inode table, and the data/index block area. The engine exposes
//! inode-table access and byte-granular file I/O; directory entries, name
//! lookup, and permissions belong to the layer above.
//!
//! Concurrency contract: mutating file operations take `&mut Inode`, so the
//! borrow checker enforces per-inode serialization. The allocator locks
//! internally; the engine itself holds no lock.

pub mod resolve;

use serde::Serialize;
use std::path::Path;
use tracing::debug;
use vatfs_alloc::IndexAllocator;
use vatfs_block::{read_block, write_block, Block};
use vatfs_error::{Result, VatError};
use vatfs_ondisk::INODE_RECORD_SIZE;
use vatfs_store::BackingStore;
use vatfs_types::{Index, Time, BLOCK_SIZE};

pub use vatfs_ondisk::{Inode, Superblock};

/// Shape of a new container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Container size in blocks, metadata included.
    pub total_blocks: u64,
    /// Inode-table slots, the reserved slot 0 included.
    pub inode_count: u64,
}

/// Usage counters for an open container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VatStat {
    pub block_size: u32,
    pub total_blocks: u64,
    pub free_blocks: u64,
    pub total_inodes: u64,
    pub free_inodes: u64,
}

/// One open container.
#[derive(Debug)]
pub struct Vat {
    store: BackingStore,
    sb: Superblock,
    alloc: IndexAllocator,
}

impl Vat {
    /// Create and open a fresh container at `path`.
    ///
    /// The file is sized to its full logical extent up front (sparse on
    /// hosts that support it); metadata blocks and inode slot 0 start out
    /// marked used, and the whole inode table starts zeroed.
    pub fn format(path: impl AsRef<Path>, geometry: Geometry) -> Result<Self> {
        let sb = Superblock::for_geometry(geometry.total_blocks, geometry.inode_count)
            .map_err(|err| VatError::InvalidArgument(err.to_string()))?;
        let container_bytes = sb
            .container_bytes()
            .map_err(|err| VatError::InvalidArgument(err.to_string()))?;

        let store = BackingStore::open(path)?;
        // Reset to zero length first so a reused path starts all-zero.
        store.set_size_bytes(0)?;
        store.set_size_bytes(container_bytes)?;

        let mut block0 = Block::new_data();
        sb.write_to_bytes(block0.as_bytes_mut())
            .map_err(|err| VatError::InvalidArgument(err.to_string()))?;
        write_block(&store, Index(0), &block0)?;

        let alloc = IndexAllocator::format(&store, &sb)?;
        store.sync()?;
        debug!(
            total_blocks = sb.total_blocks,
            inode_count = sb.inode_count,
            "formatted container"
        );
        Ok(Self { store, sb, alloc })
    }

    /// Open an existing container, validating its superblock and rebuilding
    /// the allocator from the persisted bitmaps.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let store = BackingStore::open(path)?;
        let block0 = read_block(&store, Index(0))?;
        let sb = Superblock::parse_from_bytes(block0.as_bytes())
            .map_err(|err| corrupt(0, err.to_string()))?;
        let expected = sb
            .container_bytes()
            .map_err(|err| corrupt(0, err.to_string()))?;
        if store.size_in_bytes()? < expected {
            return Err(corrupt(
                0,
                "container shorter than its superblock geometry".to_owned(),
            ));
        }
        let alloc = IndexAllocator::load(&store, &sb)?;
        debug!(total_blocks = sb.total_blocks, "opened container");
        Ok(Self { store, sb, alloc })
    }

    /// Release the container handle. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        self.store.close()
    }

    /// Flush pending writes to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.store.sync()
    }

    /// The validated layout record.
    #[must_use]
    pub fn superblock(&self) -> &Superblock {
        &self.sb
    }

    /// Usage counters.
    #[must_use]
    pub fn stat(&self) -> VatStat {
        VatStat {
            block_size: self.sb.block_size,
            total_blocks: self.sb.total_blocks,
            free_blocks: self.alloc.free_blocks(),
            total_inodes: self.sb.inode_count,
            free_inodes: self.alloc.free_inodes(),
        }
    }

    // ── Inode table ──────────────────────────────────────────────────────────

    /// Read the packed record at `slot`.
    pub fn read_inode(&self, slot: u64) -> Result<Inode> {
        self.check_slot(slot)?;
        let mut buf = [0_u8; INODE_RECORD_SIZE];
        self.store.read_bytes(self.inode_offset(slot), &mut buf)?;
        Inode::parse_from_bytes(&buf)
            .map_err(|err| corrupt(self.inode_block(slot), err.to_string()))
    }

    /// Persist the packed record at `slot`.
    ///
    /// In growth sequences this is the last write: the record only starts
    /// referencing blocks that are already on disk.
    pub fn write_inode(&self, slot: u64, inode: &Inode) -> Result<()> {
        self.check_slot(slot)?;
        let mut buf = [0_u8; INODE_RECORD_SIZE];
        inode
            .write_to_bytes(&mut buf)
            .map_err(|err| corrupt(self.inode_block(slot), err.to_string()))?;
        self.store.write_bytes(self.inode_offset(slot), &buf)
    }

    /// Place a new inode into a free table slot and return the slot number.
    pub fn create_inode(&self, inode: &Inode) -> Result<u64> {
        let slot = self.alloc.allocate_inode(&self.store)?;
        if let Err(err) = self.write_inode(slot, inode) {
            let _ = self.alloc.free_inode(&self.store, slot);
            return Err(err);
        }
        Ok(slot)
    }

    /// Reclaim an inode and every block it references.
    ///
    /// Valid only for logically deleted inodes (`nlink == 0`); callers drop
    /// the last link first. Frees the index trees, the symlink target block
    /// if any, and the extended-attribute block, then zeroes the record.
    pub fn remove_inode(&self, slot: u64) -> Result<()> {
        let mut inode = self.read_inode(slot)?;
        if inode.is_free_slot() {
            return Err(VatError::InvalidArgument(format!(
                "inode slot {slot} is already free"
            )));
        }
        if inode.nlink != 0 {
            return Err(VatError::InvalidArgument(format!(
                "inode slot {slot} still has {} links",
                inode.nlink
            )));
        }
        resolve::shrink(&self.store, &self.alloc, &mut inode, 0)?;
        if let Some(xattr) = inode.xattr_index.take() {
            self.alloc.free_block(&self.store, xattr)?;
        }
        self.write_inode(slot, &Inode::empty())?;
        self.alloc.free_inode(&self.store, slot)
    }

    // ── File data ────────────────────────────────────────────────────────────

    /// Read up to `buf.len()` bytes at `offset`, clamped to `inode.size`.
    ///
    /// Holes read as zeros. Never allocates; returns the byte count read.
    pub fn read_at(&self, inode: &Inode, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if offset >= inode.size || buf.is_empty() {
            return Ok(0);
        }
        let len = (inode.size - offset).min(buf.len() as u64) as usize;
        let mut done = 0;
        while done < len {
            let pos = offset + done as u64;
            let logical = pos / BLOCK_SIZE as u64;
            let within = (pos % BLOCK_SIZE as u64) as usize;
            let chunk = (BLOCK_SIZE - within).min(len - done);
            let out = &mut buf[done..done + chunk];
            match resolve::resolve_for_read(&self.store, inode, logical)? {
                Some(index) => {
                    let block = read_block(&self.store, index)?;
                    out.copy_from_slice(&block.as_bytes()[within..within + chunk]);
                }
                None => out.fill(0),
            }
            done += chunk;
        }
        Ok(len)
    }

    /// Write all of `data` at `offset`, materializing blocks as needed.
    ///
    /// Extends `inode.size` past the written range and stamps mtime/ctime.
    /// The updated record is the caller's to persist via [`Self::write_inode`].
    pub fn write_at(&self, inode: &mut Inode, offset: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let end = offset.checked_add(data.len() as u64).ok_or_else(|| {
            VatError::InvalidArgument(format!(
                "write range overflows: offset={offset} len={}",
                data.len()
            ))
        })?;
        let mut done = 0;
        while done < data.len() {
            let pos = offset + done as u64;
            let logical = pos / BLOCK_SIZE as u64;
            let within = (pos % BLOCK_SIZE as u64) as usize;
            let chunk = (BLOCK_SIZE - within).min(data.len() - done);
            let index = resolve::resolve_for_write(&self.store, &self.alloc, inode, logical)?;
            let mut block = read_block(&self.store, index)?;
            block.as_bytes_mut()[within..within + chunk]
                .copy_from_slice(&data[done..done + chunk]);
            write_block(&self.store, index, &block)?;
            done += chunk;
        }
        if end > inode.size {
            inode.size = end;
        }
        let now = Time::now();
        inode.mtime = now;
        inode.ctime = now;
        Ok(())
    }

    /// Set the file length to `new_size`.
    ///
    /// Shrinking frees and hole-punches every block beyond the new end and
    /// zeroes the tail of a partially kept block, so a later re-extension
    /// reads zeros there. Growing is purely logical; no blocks are touched.
    pub fn truncate(&self, inode: &mut Inode, new_size: u64) -> Result<()> {
        if new_size < inode.size {
            let keep_blocks = new_size.div_ceil(BLOCK_SIZE as u64);
            resolve::shrink(&self.store, &self.alloc, inode, keep_blocks)?;
            let tail = (new_size % BLOCK_SIZE as u64) as usize;
            if tail != 0 {
                let logical = new_size / BLOCK_SIZE as u64;
                if let Some(index) = resolve::resolve_for_read(&self.store, inode, logical)? {
                    let mut block = read_block(&self.store, index)?;
                    block.as_bytes_mut()[tail..].fill(0);
                    write_block(&self.store, index, &block)?;
                }
            }
        }
        inode.size = new_size;
        let now = Time::now();
        inode.mtime = now;
        inode.ctime = now;
        Ok(())
    }

    // ── Symlink targets ──────────────────────────────────────────────────────

    /// Store a symlink target and return its freshly minted inode.
    ///
    /// Targets occupy exactly one block, so they are bounded by
    /// `BLOCK_SIZE` bytes and never use tree indirection.
    pub fn write_symlink_target(&self, target: &[u8]) -> Result<Inode> {
        if target.is_empty() || target.len() > BLOCK_SIZE {
            return Err(VatError::InvalidArgument(format!(
                "symlink target length {} outside 1..={BLOCK_SIZE}",
                target.len()
            )));
        }
        let index = self.alloc.allocate_block(&self.store)?;
        let mut block = Block::new_target();
        block.as_bytes_mut()[..target.len()].copy_from_slice(target);
        if let Err(err) = write_block(&self.store, index, &block) {
            let _ = self.alloc.free_block(&self.store, index);
            return Err(err);
        }
        Ok(Inode::symlink(target.len() as u64, index))
    }

    /// Read back a symlink's target bytes.
    pub fn read_symlink_target(&self, inode: &Inode) -> Result<Vec<u8>> {
        if !inode.is_symlink() {
            return Err(VatError::InvalidArgument(
                "inode is not a symlink".to_owned(),
            ));
        }
        let Some(index) = inode.slot_trees[0] else {
            return Err(corrupt(
                self.sb.inode_table_start,
                "symlink without a target block".to_owned(),
            ));
        };
        let len = usize::try_from(inode.size)
            .ok()
            .filter(|len| *len <= BLOCK_SIZE)
            .ok_or_else(|| corrupt(index.0, "symlink target longer than one block".to_owned()))?;
        let block = read_block(&self.store, index)?;
        Ok(block.as_bytes()[..len].to_vec())
    }

    // ── Internals ────────────────────────────────────────────────────────────

    fn check_slot(&self, slot: u64) -> Result<()> {
        if slot >= self.sb.inode_count {
            return Err(corrupt(
                self.sb.inode_table_start,
                format!(
                    "inode slot {slot} out of range (table holds {})",
                    self.sb.inode_count
                ),
            ));
        }
        Ok(())
    }

    fn inode_offset(&self, slot: u64) -> u64 {
        self.sb.inode_table_start * BLOCK_SIZE as u64 + slot * INODE_RECORD_SIZE as u64
    }

    fn inode_block(&self, slot: u64) -> u64 {
        self.sb.inode_table_start + (slot * INODE_RECORD_SIZE as u64) / BLOCK_SIZE as u64
    }
}

fn corrupt(block: u64, detail: String) -> VatError {
    VatError::Corrupt { block, detail }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use vatfs_types::S_IFREG;

    fn fresh_vat() -> (tempfile::TempDir, Vat) {
        let dir = tempdir().expect("tempdir");
        let vat = Vat::format(
            dir.path().join("vat.img"),
            Geometry {
                total_blocks: 2048,
                inode_count: 64,
            },
        )
        .expect("format");
        (dir, vat)
    }

    #[test]
    fn inode_table_round_trip() {
        let (_dir, vat) = fresh_vat();
        let mut inode = Inode::node(S_IFREG | 0o644, 0);
        inode.uid = 1000;
        let slot = vat.create_inode(&inode).expect("create");
        assert!(slot >= 1);
        assert_eq!(vat.read_inode(slot).expect("read"), inode);

        inode.size = 999;
        vat.write_inode(slot, &inode).expect("write");
        assert_eq!(vat.read_inode(slot).expect("reread").size, 999);
    }

    #[test]
    fn out_of_range_slot_is_corruption() {
        let (_dir, vat) = fresh_vat();
        assert!(matches!(
            vat.read_inode(64),
            Err(VatError::Corrupt { .. })
        ));
        assert!(matches!(
            vat.write_inode(u64::MAX, &Inode::empty()),
            Err(VatError::Corrupt { .. })
        ));
    }

    #[test]
    fn remove_requires_zero_links() {
        let (_dir, vat) = fresh_vat();
        let inode = Inode::node(S_IFREG | 0o644, 0);
        let slot = vat.create_inode(&inode).expect("create");
        assert!(matches!(
            vat.remove_inode(slot),
            Err(VatError::InvalidArgument(_))
        ));

        let mut unlinked = inode;
        unlinked.nlink = 0;
        vat.write_inode(slot, &unlinked).expect("unlink");
        vat.remove_inode(slot).expect("remove");
        assert!(vat.read_inode(slot).expect("read").is_free_slot());
        assert!(matches!(
            vat.remove_inode(slot),
            Err(VatError::InvalidArgument(_))
        ));
    }

    #[test]
    fn stat_reflects_geometry() {
        let (_dir, vat) = fresh_vat();
        let stat = vat.stat();
        assert_eq!(stat.block_size as usize, BLOCK_SIZE);
        assert_eq!(stat.total_blocks, 2048);
        assert_eq!(stat.total_inodes, 64);
        assert_eq!(stat.free_blocks, 2048 - vat.superblock().data_start);
        assert_eq!(stat.free_inodes, 63);
    }
}
