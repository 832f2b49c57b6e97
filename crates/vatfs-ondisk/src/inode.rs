use serde::{Deserialize, Serialize};
use vatfs_types::{
    read_le_u16, read_le_u32, read_le_u64, write_le_u16, write_le_u32, write_le_u64, FileType,
    Index, ParseError, Time, MODE_MASK, SLOT_TREE_COUNT, S_IFDIR, S_IFLNK,
};

/// Serialized inode width in bytes (packed, no padding).
pub const INODE_RECORD_SIZE: usize = 112;

/// Fixed-layout metadata record for one filesystem object.
///
/// This is essentially `struct stat` with explicit member widths plus the
/// roots of the indirection trees that locate the object's data. A record
/// whose `type_and_mode` is zero is a free inode-table slot.
///
/// On-disk layout (little-endian, field order = offset order):
///
/// ```text
/// 0x00 atime      (i64 secs + u32 nanos)
/// 0x0C ctime
/// 0x18 mtime
/// 0x24 uid        u32
/// 0x28 gid        u32
/// 0x2C nlink      u16
/// 0x2E type_and_mode u16   (S_IF* tag | 12 permission bits)
/// 0x30 rdev       u64      (device nodes only)
/// 0x38 size       u64
/// 0x40 slot_trees 5 × u64  (0 = InvalidIndex)
/// 0x68 xattr_index u64     (0 = none)
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inode {
    pub atime: Time,
    pub ctime: Time,
    pub mtime: Time,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u16,
    pub type_and_mode: u16,
    pub rdev: u64,
    pub size: u64,
    pub slot_trees: [Option<Index>; SLOT_TREE_COUNT],
    pub xattr_index: Option<Index>,
}

impl Inode {
    /// A zeroed record: a free inode-table slot.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            atime: Time::default(),
            ctime: Time::default(),
            mtime: Time::default(),
            uid: 0,
            gid: 0,
            nlink: 0,
            type_and_mode: 0,
            rdev: 0,
            size: 0,
            slot_trees: [None; SLOT_TREE_COUNT],
            xattr_index: None,
        }
    }

    /// A new directory inode. Owner and group are inherited from `parent`
    /// when present (the root directory has no parent).
    #[must_use]
    pub fn directory(parent: Option<&Inode>, mode: u16) -> Self {
        let now = Time::now();
        Self {
            atime: now,
            ctime: now,
            mtime: now,
            uid: parent.map_or(0, |p| p.uid),
            gid: parent.map_or(0, |p| p.gid),
            nlink: 1,
            type_and_mode: S_IFDIR | (mode & MODE_MASK),
            ..Self::empty()
        }
    }

    /// A new special-file inode: device node, socket, or fifo.
    ///
    /// `rdev` is meaningful only for device types; special files never carry
    /// data blocks, so `size` is always zero.
    #[must_use]
    pub fn node(type_and_mode: u16, rdev: u64) -> Self {
        let now = Time::now();
        Self {
            atime: now,
            ctime: now,
            mtime: now,
            nlink: 1,
            type_and_mode,
            rdev,
            ..Self::empty()
        }
    }

    /// A new symlink inode referencing exactly one target block.
    ///
    /// The target block index lives in `slot_trees[0]`; symlinks never use
    /// tree indirection, so `target_len` is bounded by one block.
    #[must_use]
    pub fn symlink(target_len: u64, target_block: Index) -> Self {
        let now = Time::now();
        let mut slot_trees = [None; SLOT_TREE_COUNT];
        slot_trees[0] = Some(target_block);
        Self {
            atime: now,
            ctime: now,
            mtime: now,
            nlink: 1,
            type_and_mode: S_IFLNK | 0o777,
            size: target_len,
            slot_trees,
            ..Self::empty()
        }
    }

    /// The derived object type, `None` for a free slot or an unknown tag.
    #[must_use]
    pub fn file_type(&self) -> Option<FileType> {
        FileType::from_mode(self.type_and_mode)
    }

    /// Permission/suid/sgid/sticky bits.
    #[must_use]
    pub fn mode(&self) -> u16 {
        self.type_and_mode & MODE_MASK
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.file_type() == Some(FileType::Directory)
    }

    #[must_use]
    pub fn is_symlink(&self) -> bool {
        self.file_type() == Some(FileType::Symlink)
    }

    #[must_use]
    pub fn is_regular(&self) -> bool {
        self.file_type() == Some(FileType::Regular)
    }

    /// Whether this record is a free inode-table slot.
    #[must_use]
    pub fn is_free_slot(&self) -> bool {
        self.type_and_mode == 0
    }

    /// Parse a packed record.
    ///
    /// A nonzero `type_and_mode` must carry a known type tag; anything else
    /// is an on-disk sanity violation.
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.len() < INODE_RECORD_SIZE {
            return Err(ParseError::InsufficientData {
                needed: INODE_RECORD_SIZE,
                offset: 0,
                actual: bytes.len(),
            });
        }
        let type_and_mode = read_le_u16(bytes, 0x2E)?;
        if type_and_mode != 0 && FileType::from_mode(type_and_mode).is_none() {
            return Err(ParseError::InvalidField {
                field: "type_and_mode",
                reason: "type tag not in the known set",
            });
        }
        let mut slot_trees = [None; SLOT_TREE_COUNT];
        for (level, root) in slot_trees.iter_mut().enumerate() {
            *root = Index::from_slot(read_le_u64(bytes, 0x40 + level * 8)?);
        }
        Ok(Self {
            atime: Time::parse_from_bytes(bytes, 0x00)?,
            ctime: Time::parse_from_bytes(bytes, 0x0C)?,
            mtime: Time::parse_from_bytes(bytes, 0x18)?,
            uid: read_le_u32(bytes, 0x24)?,
            gid: read_le_u32(bytes, 0x28)?,
            nlink: read_le_u16(bytes, 0x2C)?,
            type_and_mode,
            rdev: read_le_u64(bytes, 0x30)?,
            size: read_le_u64(bytes, 0x38)?,
            slot_trees,
            xattr_index: Index::from_slot(read_le_u64(bytes, 0x68)?),
        })
    }

    /// Serialize the packed record into `bytes`.
    pub fn write_to_bytes(&self, bytes: &mut [u8]) -> Result<(), ParseError> {
        if bytes.len() < INODE_RECORD_SIZE {
            return Err(ParseError::InsufficientData {
                needed: INODE_RECORD_SIZE,
                offset: 0,
                actual: bytes.len(),
            });
        }
        self.atime.write_to_bytes(bytes, 0x00)?;
        self.ctime.write_to_bytes(bytes, 0x0C)?;
        self.mtime.write_to_bytes(bytes, 0x18)?;
        write_le_u32(bytes, 0x24, self.uid)?;
        write_le_u32(bytes, 0x28, self.gid)?;
        write_le_u16(bytes, 0x2C, self.nlink)?;
        write_le_u16(bytes, 0x2E, self.type_and_mode)?;
        write_le_u64(bytes, 0x30, self.rdev)?;
        write_le_u64(bytes, 0x38, self.size)?;
        for (level, root) in self.slot_trees.iter().enumerate() {
            write_le_u64(bytes, 0x40 + level * 8, Index::to_slot(*root))?;
        }
        write_le_u64(bytes, 0x68, Index::to_slot(self.xattr_index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vatfs_types::{S_IFBLK, S_IFCHR, S_IFSOCK};

    #[test]
    fn record_round_trip_at_exact_offsets() {
        let mut inode = Inode::directory(None, 0o755);
        inode.uid = 1000;
        inode.gid = 1000;
        inode.size = 4096;
        inode.slot_trees[1] = Some(Index(42));
        inode.xattr_index = Some(Index(77));

        let mut buf = [0_u8; INODE_RECORD_SIZE];
        inode.write_to_bytes(&mut buf).expect("write");

        // Spot-check the byte positions the format promises.
        assert_eq!(read_le_u32(&buf, 0x24), Ok(1000)); // uid
        assert_eq!(read_le_u16(&buf, 0x2C), Ok(1)); // nlink
        assert_eq!(read_le_u16(&buf, 0x2E), Ok(S_IFDIR | 0o755));
        assert_eq!(read_le_u64(&buf, 0x38), Ok(4096)); // size
        assert_eq!(read_le_u64(&buf, 0x40), Ok(0)); // slot_trees[0] sentinel
        assert_eq!(read_le_u64(&buf, 0x48), Ok(42)); // slot_trees[1]
        assert_eq!(read_le_u64(&buf, 0x68), Ok(77)); // xattr_index

        assert_eq!(Inode::parse_from_bytes(&buf), Ok(inode));
    }

    #[test]
    fn zeroed_record_is_a_free_slot() {
        let buf = [0_u8; INODE_RECORD_SIZE];
        let inode = Inode::parse_from_bytes(&buf).expect("parse");
        assert!(inode.is_free_slot());
        assert_eq!(inode, Inode::empty());
        assert_eq!(inode.file_type(), None);
    }

    #[test]
    fn unknown_type_tag_is_rejected() {
        let mut buf = [0_u8; INODE_RECORD_SIZE];
        // 0o030000 is not a defined S_IF* tag.
        write_le_u16(&mut buf, 0x2E, 0o030_000).expect("tamper");
        assert!(matches!(
            Inode::parse_from_bytes(&buf),
            Err(ParseError::InvalidField {
                field: "type_and_mode",
                ..
            })
        ));
    }

    #[test]
    fn directory_inherits_owner_from_parent() {
        let mut parent = Inode::directory(None, 0o755);
        parent.uid = 501;
        parent.gid = 20;
        let child = Inode::directory(Some(&parent), 0o700);
        assert_eq!(child.uid, 501);
        assert_eq!(child.gid, 20);
        assert!(child.is_dir());
        assert_eq!(child.mode(), 0o700);
        assert_eq!(child.size, 0);

        let root = Inode::directory(None, 0o755);
        assert_eq!(root.uid, 0);
        assert_eq!(root.gid, 0);
    }

    #[test]
    fn special_nodes_have_zero_size() {
        for type_and_mode in [S_IFBLK | 0o660, S_IFCHR | 0o660, S_IFSOCK | 0o777] {
            let node = Inode::node(type_and_mode, 0x0103);
            assert_eq!(node.size, 0);
            assert_eq!(node.rdev, 0x0103);
            assert_eq!(node.nlink, 1);
            assert!(node.slot_trees.iter().all(Option::is_none));
        }
    }

    #[test]
    fn symlink_references_exactly_one_target_block() {
        let link = Inode::symlink(11, Index(9));
        assert!(link.is_symlink());
        assert_eq!(link.size, 11);
        assert_eq!(link.slot_trees[0], Some(Index(9)));
        assert!(link.slot_trees[1..].iter().all(Option::is_none));
        assert_eq!(link.mode(), 0o777);
    }

    #[test]
    fn truncated_buffers_are_rejected() {
        let buf = [0_u8; INODE_RECORD_SIZE - 1];
        assert!(Inode::parse_from_bytes(&buf).is_err());
        let mut buf = [0_u8; INODE_RECORD_SIZE - 1];
        assert!(Inode::empty().write_to_bytes(&mut buf).is_err());
    }
}
