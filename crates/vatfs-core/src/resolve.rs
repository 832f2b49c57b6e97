//! Logical-to-physical block resolution through the per-inode index trees.
//!
//! An inode carries five independently-rooted trees. The tree at slot `L`
//! has `L` levels of index blocks above its data blocks and therefore
//! addresses `512^L` logical blocks. Slot 0 is the degenerate case: its
//! root, when set, is the data block itself. The trees cover disjoint,
//! consecutive logical ranges: tree 0 holds logical block 0, tree 1 the
//! next 512, tree 2 the next 512 squared, and so on. Growing a file never
//! restructures an existing tree; it populates the next root.
//!
//! Growth ordering: a newly allocated block is written (zeroed or
//! all-sentinel) before the parent slot that references it, and the inode
//! record itself is persisted by the caller last. A crash mid-growth can
//! leak a block but never leaves a reachable reference to garbage.

use tracing::trace;
use vatfs_alloc::IndexAllocator;
use vatfs_block::{read_block, write_block, Block};
use vatfs_error::{Result, VatError};
use vatfs_ondisk::Inode;
use vatfs_store::BackingStore;
use vatfs_types::{Index, SLOTS_PER_BLOCK, SLOT_TREE_COUNT};

/// Logical blocks addressed by the tree rooted at `slot_trees[level]`.
const fn capacity(level: u32) -> u64 {
    (SLOTS_PER_BLOCK as u64).pow(level)
}

/// Total logical blocks addressable by one inode (all five trees).
pub const MAX_LOGICAL_BLOCKS: u64 = {
    let mut total = 0;
    let mut level = 0;
    while level < SLOT_TREE_COUNT {
        total += capacity(level as u32);
        level += 1;
    }
    total
};

/// Which tree holds `logical`, and the offset within that tree.
fn locate(logical: u64) -> Option<(usize, u64)> {
    let mut base = 0_u64;
    for level in 0..SLOT_TREE_COUNT {
        let cap = capacity(level as u32);
        if logical < base + cap {
            return Some((level, logical - base));
        }
        base += cap;
    }
    None
}

/// Find the physical block backing `logical`, if any.
///
/// A sentinel anywhere on the descent means the logical block was never
/// written; the caller reads it as zeros. Never allocates.
pub fn resolve_for_read(
    store: &BackingStore,
    inode: &Inode,
    logical: u64,
) -> Result<Option<Index>> {
    let Some((level, mut within)) = locate(logical) else {
        return Ok(None);
    };
    let Some(mut current) = inode.slot_trees[level] else {
        return Ok(None);
    };
    for depth in (1..=level).rev() {
        let span = capacity(depth as u32 - 1);
        let slot = (within / span) as usize;
        within %= span;
        let node = read_block(store, current)?;
        match node.slot(slot) {
            Some(child) => current = child,
            None => return Ok(None),
        }
    }
    Ok(Some(current))
}

/// Find or materialize the physical block backing `logical`.
///
/// Every sentinel on the descent is replaced by a freshly allocated block,
/// persisted before the parent slot that references it. The updated inode
/// record is the caller's to persist.
pub fn resolve_for_write(
    store: &BackingStore,
    alloc: &IndexAllocator,
    inode: &mut Inode,
    logical: u64,
) -> Result<Index> {
    let Some((level, mut within)) = locate(logical) else {
        return Err(VatError::InvalidArgument(format!(
            "logical block {logical} beyond maximum file extent"
        )));
    };
    let mut current = match inode.slot_trees[level] {
        Some(index) => index,
        None => {
            let index = allocate_node(store, alloc, level > 0)?;
            trace!(level, index = index.0, "rooted indirection tree");
            inode.slot_trees[level] = Some(index);
            index
        }
    };
    for depth in (1..=level).rev() {
        let span = capacity(depth as u32 - 1);
        let slot = (within / span) as usize;
        within %= span;
        let mut node = read_block(store, current)?;
        current = match node.slot(slot) {
            Some(child) => child,
            None => {
                let child = allocate_node(store, alloc, depth > 1)?;
                node.set_slot(slot, Some(child));
                write_block(store, current, &node)?;
                child
            }
        };
    }
    Ok(current)
}

/// Free every block strictly beyond the first `keep_blocks` logical blocks.
///
/// Interior blocks whose children are all gone are freed too, and roots of
/// fully-emptied trees are cleared in the inode. Parent references are
/// persisted before the children they dropped are handed back, so a crash
/// mid-shrink leaks blocks rather than leaving reachable dangling slots.
pub fn shrink(
    store: &BackingStore,
    alloc: &IndexAllocator,
    inode: &mut Inode,
    keep_blocks: u64,
) -> Result<()> {
    let mut base = 0_u64;
    for level in 0..SLOT_TREE_COUNT {
        let cap = capacity(level as u32);
        if keep_blocks <= base {
            if let Some(root) = inode.slot_trees[level].take() {
                free_subtree(store, alloc, root, level)?;
            }
        } else if keep_blocks < base + cap {
            if let Some(root) = inode.slot_trees[level] {
                prune(store, alloc, root, level, keep_blocks - base)?;
            }
        }
        base += cap;
    }
    Ok(())
}

fn allocate_node(store: &BackingStore, alloc: &IndexAllocator, interior: bool) -> Result<Index> {
    let index = alloc.allocate_block(store)?;
    let block = if interior {
        Block::new_indices()
    } else {
        Block::new_data()
    };
    write_block(store, index, &block)?;
    Ok(index)
}

/// Free a whole subtree rooted at `index`, leaves first.
pub(crate) fn free_subtree(
    store: &BackingStore,
    alloc: &IndexAllocator,
    index: Index,
    depth: usize,
) -> Result<()> {
    if depth > 0 {
        let node = read_block(store, index)?;
        for slot in 0..SLOTS_PER_BLOCK {
            if let Some(child) = node.slot(slot) {
                free_subtree(store, alloc, child, depth - 1)?;
            }
        }
    }
    alloc.free_block(store, index)
}

/// Drop everything beyond the first `keep` logical blocks of the subtree
/// rooted at `index`. Precondition: `0 < keep < capacity(depth)`, which
/// implies `depth >= 1`.
fn prune(
    store: &BackingStore,
    alloc: &IndexAllocator,
    index: Index,
    depth: usize,
    keep: u64,
) -> Result<()> {
    let child_cap = capacity(depth as u32 - 1);
    let full_children = (keep / child_cap) as usize;
    let partial = keep % child_cap;
    let first_dead = full_children + usize::from(partial > 0);

    let mut node = read_block(store, index)?;
    let mut dropped = Vec::new();
    for slot in first_dead..SLOTS_PER_BLOCK {
        if let Some(child) = node.slot(slot) {
            node.set_slot(slot, None);
            dropped.push(child);
        }
    }
    if !dropped.is_empty() {
        write_block(store, index, &node)?;
    }
    for child in dropped {
        free_subtree(store, alloc, child, depth - 1)?;
    }
    if partial > 0 {
        if let Some(child) = node.slot(full_children) {
            prune(store, alloc, child, depth - 1, partial)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use vatfs_ondisk::Superblock;
    use vatfs_types::{BLOCK_SIZE, S_IFREG};

    fn engine_parts() -> (tempfile::TempDir, BackingStore, IndexAllocator) {
        let dir = tempdir().expect("tempdir");
        let store = BackingStore::open(dir.path().join("vat.img")).expect("open");
        let sb = Superblock::for_geometry(2048, 64).expect("geometry");
        store
            .set_size_bytes(2048 * BLOCK_SIZE as u64)
            .expect("size");
        let alloc = IndexAllocator::format(&store, &sb).expect("format");
        (dir, store, alloc)
    }

    fn regular_inode() -> Inode {
        Inode::node(S_IFREG | 0o644, 0)
    }

    #[test]
    fn tree_ranges_are_disjoint_and_consecutive() {
        assert_eq!(locate(0), Some((0, 0)));
        assert_eq!(locate(1), Some((1, 0)));
        assert_eq!(locate(512), Some((1, 511)));
        assert_eq!(locate(513), Some((2, 0)));
        assert_eq!(locate(513 + 512 * 512), Some((3, 0)));
        assert_eq!(locate(MAX_LOGICAL_BLOCKS - 1).map(|(level, _)| level), Some(4));
        assert_eq!(locate(MAX_LOGICAL_BLOCKS), None);
    }

    #[test]
    fn read_never_allocates() {
        let (_dir, store, alloc) = engine_parts();
        let inode = regular_inode();
        let before = alloc.free_blocks();
        for logical in [0, 1, 512, 513, 100_000] {
            assert_eq!(
                resolve_for_read(&store, &inode, logical).expect("resolve"),
                None
            );
        }
        assert_eq!(alloc.free_blocks(), before);
    }

    #[test]
    fn write_at_level_zero_roots_the_data_block_directly() {
        let (_dir, store, alloc) = engine_parts();
        let mut inode = regular_inode();
        let index = resolve_for_write(&store, &alloc, &mut inode, 0).expect("resolve");
        assert_eq!(inode.slot_trees[0], Some(index));
        assert_eq!(
            resolve_for_read(&store, &inode, 0).expect("read"),
            Some(index)
        );
    }

    #[test]
    fn write_at_deeper_levels_builds_the_index_chain() {
        let (_dir, store, alloc) = engine_parts();
        let mut inode = regular_inode();
        let before = alloc.free_blocks();

        // Logical 513 lives in the level-2 tree: root + interior + data.
        let data = resolve_for_write(&store, &alloc, &mut inode, 513).expect("resolve");
        assert_eq!(alloc.free_blocks(), before - 3);
        assert!(inode.slot_trees[2].is_some());
        assert!(inode.slot_trees[0].is_none());
        assert!(inode.slot_trees[1].is_none());
        assert_eq!(
            resolve_for_read(&store, &inode, 513).expect("read"),
            Some(data)
        );
        // Its neighbor shares the whole chain: only the data block is new.
        resolve_for_write(&store, &alloc, &mut inode, 514).expect("resolve");
        assert_eq!(alloc.free_blocks(), before - 4);
        // Unrelated logical blocks in the same tree stay holes.
        assert_eq!(resolve_for_read(&store, &inode, 600).expect("read"), None);
    }

    #[test]
    fn resolving_twice_returns_the_same_block() {
        let (_dir, store, alloc) = engine_parts();
        let mut inode = regular_inode();
        let first = resolve_for_write(&store, &alloc, &mut inode, 5).expect("resolve");
        let second = resolve_for_write(&store, &alloc, &mut inode, 5).expect("resolve");
        assert_eq!(first, second);
    }

    #[test]
    fn shrink_frees_everything_beyond_the_kept_prefix() {
        let (_dir, store, alloc) = engine_parts();
        let mut inode = regular_inode();
        let before = alloc.free_blocks();
        for logical in [0, 1, 2, 512, 513] {
            resolve_for_write(&store, &alloc, &mut inode, logical).expect("resolve");
        }

        // Keep logical blocks 0..3: tree 0 intact, tree 1 pruned to two
        // leaves, tree 2 gone entirely.
        shrink(&store, &alloc, &mut inode, 3).expect("shrink");
        assert!(inode.slot_trees[0].is_some());
        assert!(inode.slot_trees[1].is_some());
        assert!(inode.slot_trees[2].is_none());
        assert_eq!(resolve_for_read(&store, &inode, 512).expect("read"), None);
        assert!(resolve_for_read(&store, &inode, 2).expect("read").is_some());

        shrink(&store, &alloc, &mut inode, 0).expect("shrink all");
        assert!(inode.slot_trees.iter().all(Option::is_none));
        assert_eq!(alloc.free_blocks(), before);
    }

    #[test]
    fn writes_beyond_the_maximum_extent_are_rejected() {
        let (_dir, store, alloc) = engine_parts();
        let mut inode = regular_inode();
        assert!(matches!(
            resolve_for_write(&store, &alloc, &mut inode, MAX_LOGICAL_BLOCKS),
            Err(VatError::InvalidArgument(_))
        ));
    }
}
