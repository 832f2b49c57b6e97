#![forbid(unsafe_code)]
//! Core value types for the vatfs storage engine.
//!
//! Everything here is a plain value: physical block indices, the fixed
//! storage geometry, timestamps, POSIX mode bits, and the little-endian
//! parse/serialize helpers shared by the on-disk record types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

// ── Storage geometry ─────────────────────────────────────────────────────────

/// Size of one storage block in bytes. Power of two, fixed at compile time.
pub const BLOCK_SIZE: usize = 4096;

/// Width of one serialized [`Index`] in bytes.
pub const INDEX_SPAN: usize = 8;

/// Number of index slots that fit in one block.
pub const SLOTS_PER_BLOCK: usize = BLOCK_SIZE / INDEX_SPAN;

/// Number of independently-rooted indirection trees per inode.
pub const SLOT_TREE_COUNT: usize = 5;

// ── Index ────────────────────────────────────────────────────────────────────

/// Physical block identifier within the backing container.
///
/// Block 0 holds the superblock and is never allocatable, so the raw value 0
/// doubles as the on-disk "no block" sentinel. In-memory APIs use
/// `Option<Index>`; the sentinel only appears in serialized slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Index(pub u64);

impl Index {
    /// Decode a raw on-disk slot value. 0 is the sentinel for "no block".
    #[must_use]
    pub fn from_slot(raw: u64) -> Option<Self> {
        (raw != 0).then_some(Self(raw))
    }

    /// Encode an optional index as its raw on-disk slot value.
    #[must_use]
    pub fn to_slot(slot: Option<Self>) -> u64 {
        slot.map_or(0, |index| index.0)
    }

    /// Byte offset of this block within the container (`index * BLOCK_SIZE`).
    ///
    /// Returns `None` on overflow.
    #[must_use]
    pub fn byte_offset(self) -> Option<u64> {
        self.0.checked_mul(BLOCK_SIZE as u64)
    }

    /// Add a block count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, count: u64) -> Option<Self> {
        self.0.checked_add(count).map(Self)
    }
}

impl fmt::Display for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Timestamps ───────────────────────────────────────────────────────────────

/// Serialized width of a [`Time`] value (i64 seconds + u32 nanoseconds).
pub const TIME_SPAN: usize = 12;

/// Fixed-width timestamp: seconds since the Unix epoch plus nanoseconds.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Time {
    pub secs: i64,
    pub nanos: u32,
}

impl Time {
    /// Current wall-clock time. Times before the epoch clamp to zero.
    #[must_use]
    pub fn now() -> Self {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(elapsed) => Self {
                secs: i64::try_from(elapsed.as_secs()).unwrap_or(i64::MAX),
                nanos: elapsed.subsec_nanos(),
            },
            Err(_) => Self::default(),
        }
    }

    /// Parse from 12 little-endian bytes at `offset`.
    pub fn parse_from_bytes(data: &[u8], offset: usize) -> Result<Self, ParseError> {
        Ok(Self {
            secs: read_le_i64(data, offset)?,
            nanos: read_le_u32(data, offset + 8)?,
        })
    }

    /// Serialize as 12 little-endian bytes at `offset`.
    pub fn write_to_bytes(self, data: &mut [u8], offset: usize) -> Result<(), ParseError> {
        #[allow(clippy::cast_sign_loss)] // lossless bit reinterpretation
        write_le_u64(data, offset, self.secs as u64)?;
        write_le_u32(data, offset + 8, self.nanos)
    }
}

// ── POSIX type and mode bits ─────────────────────────────────────────────────

/// File type mask (upper bits of `type_and_mode`).
pub const S_IFMT: u16 = 0o170_000;
/// Named pipe (FIFO).
pub const S_IFIFO: u16 = 0o010_000;
/// Character device.
pub const S_IFCHR: u16 = 0o020_000;
/// Directory.
pub const S_IFDIR: u16 = 0o040_000;
/// Block device.
pub const S_IFBLK: u16 = 0o060_000;
/// Regular file.
pub const S_IFREG: u16 = 0o100_000;
/// Symbolic link.
pub const S_IFLNK: u16 = 0o120_000;
/// Socket.
pub const S_IFSOCK: u16 = 0o140_000;

/// Permission + suid/sgid/sticky mask (low 12 bits of `type_and_mode`).
pub const MODE_MASK: u16 = 0o7777;
pub const MODE_SUID: u16 = 0o4000;
pub const MODE_SGID: u16 = 0o2000;
pub const MODE_SVTX: u16 = 0o1000;

/// Filesystem object type, derived from the high bits of `type_and_mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileType {
    Fifo,
    CharDevice,
    Directory,
    BlockDevice,
    Regular,
    Symlink,
    Socket,
}

impl FileType {
    /// Decode the type tag of a `type_and_mode` word.
    ///
    /// Returns `None` for tags outside the known set; callers treat that as
    /// on-disk corruption.
    #[must_use]
    pub fn from_mode(type_and_mode: u16) -> Option<Self> {
        match type_and_mode & S_IFMT {
            S_IFIFO => Some(Self::Fifo),
            S_IFCHR => Some(Self::CharDevice),
            S_IFDIR => Some(Self::Directory),
            S_IFBLK => Some(Self::BlockDevice),
            S_IFREG => Some(Self::Regular),
            S_IFLNK => Some(Self::Symlink),
            S_IFSOCK => Some(Self::Socket),
            _ => None,
        }
    }

    /// The `S_IF*` tag bits for this type.
    #[must_use]
    pub fn to_mode(self) -> u16 {
        match self {
            Self::Fifo => S_IFIFO,
            Self::CharDevice => S_IFCHR,
            Self::Directory => S_IFDIR,
            Self::BlockDevice => S_IFBLK,
            Self::Regular => S_IFREG,
            Self::Symlink => S_IFLNK,
            Self::Socket => S_IFSOCK,
        }
    }
}

// ── Parse errors ─────────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

// ── Little-endian parse/serialize helpers ────────────────────────────────────

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };
    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }
    Ok(&data[offset..end])
}

#[inline]
fn ensure_slice_mut(data: &mut [u8], offset: usize, len: usize) -> Result<&mut [u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };
    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }
    Ok(&mut data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_le_i64(data: &[u8], offset: usize) -> Result<i64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(i64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn write_le_u16(data: &mut [u8], offset: usize, value: u16) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 2)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 4)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u64(data: &mut [u8], offset: usize, value: u64) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 8)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_constants() {
        assert!(BLOCK_SIZE.is_power_of_two());
        assert_eq!(SLOTS_PER_BLOCK, 512);
        assert_eq!(BLOCK_SIZE % INDEX_SPAN, 0);
    }

    #[test]
    fn index_sentinel_round_trip() {
        assert_eq!(Index::from_slot(0), None);
        assert_eq!(Index::from_slot(7), Some(Index(7)));
        assert_eq!(Index::to_slot(None), 0);
        assert_eq!(Index::to_slot(Some(Index(7))), 7);
    }

    #[test]
    fn index_byte_offset() {
        assert_eq!(Index(0).byte_offset(), Some(0));
        assert_eq!(Index(3).byte_offset(), Some(3 * BLOCK_SIZE as u64));
        assert_eq!(Index(u64::MAX).byte_offset(), None);
    }

    #[test]
    fn time_round_trip() {
        let time = Time {
            secs: 1_700_000_000,
            nanos: 123_456_789,
        };
        let mut buf = [0_u8; TIME_SPAN];
        time.write_to_bytes(&mut buf, 0).expect("write");
        assert_eq!(Time::parse_from_bytes(&buf, 0), Ok(time));

        // Negative seconds survive the unsigned detour.
        let before_epoch = Time {
            secs: -42,
            nanos: 1,
        };
        before_epoch.write_to_bytes(&mut buf, 0).expect("write");
        assert_eq!(Time::parse_from_bytes(&buf, 0), Ok(before_epoch));
    }

    #[test]
    fn time_truncated_buffer() {
        let buf = [0_u8; TIME_SPAN - 1];
        assert!(Time::parse_from_bytes(&buf, 0).is_err());
        let mut buf = [0_u8; TIME_SPAN - 1];
        assert!(Time::default().write_to_bytes(&mut buf, 0).is_err());
    }

    #[test]
    fn file_type_tags() {
        assert_eq!(FileType::from_mode(S_IFREG | 0o644), Some(FileType::Regular));
        assert_eq!(
            FileType::from_mode(S_IFDIR | 0o755),
            Some(FileType::Directory)
        );
        assert_eq!(
            FileType::from_mode(S_IFLNK | 0o777),
            Some(FileType::Symlink)
        );
        assert_eq!(FileType::from_mode(S_IFSOCK), Some(FileType::Socket));
        // 0o030000 is not a defined type tag.
        assert_eq!(FileType::from_mode(0o030_000), None);
        assert_eq!(FileType::from_mode(0), None);

        for file_type in [
            FileType::Fifo,
            FileType::CharDevice,
            FileType::Directory,
            FileType::BlockDevice,
            FileType::Regular,
            FileType::Symlink,
            FileType::Socket,
        ] {
            assert_eq!(FileType::from_mode(file_type.to_mode()), Some(file_type));
        }
    }

    #[test]
    fn read_write_helpers() {
        let mut buf = [0_u8; 16];
        write_le_u16(&mut buf, 0, 0x1234).expect("u16");
        write_le_u32(&mut buf, 2, 0x9ABC_DEF0).expect("u32");
        write_le_u64(&mut buf, 6, 0x1122_3344_5566_7788).expect("u64");
        assert_eq!(read_le_u16(&buf, 0), Ok(0x1234));
        assert_eq!(read_le_u32(&buf, 2), Ok(0x9ABC_DEF0));
        assert_eq!(read_le_u64(&buf, 6), Ok(0x1122_3344_5566_7788));

        assert_eq!(
            read_le_u64(&buf, 9),
            Err(ParseError::InsufficientData {
                needed: 8,
                offset: 9,
                actual: 7,
            })
        );
        assert!(write_le_u64(&mut buf, 9, 0).is_err());
        assert!(ensure_slice(&buf, usize::MAX, 2).is_err());
    }
}
