#![forbid(unsafe_code)]
//! The backing store: a single host-level container file.
//!
//! Provides positional byte I/O with retry-until-complete semantics,
//! capacity reporting for the hosting volume, sparse-hole deallocation, and
//! resizing. Partial reads and writes are a normal occurrence at the host
//! I/O layer, not an error condition, so every multi-byte transfer loops
//! until satisfied or a real error occurs.
//!
//! Hole punching is best-effort: the first host-level failure logs a warning
//! and permanently disables further attempts for the life of the process.
//! The store's logical structure stays valid either way; only real disk
//! usage is affected.

use nix::fcntl::{fallocate, FallocateFlags};
use nix::sys::statvfs::statvfs;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;
use vatfs_error::{Result, VatError};

/// Whether hole punching has failed on this host filesystem.
///
/// Process-wide and monotonic: once set it is never cleared, so a mounted
/// store stops issuing doomed fallocate calls after the first failure. The
/// flag is advisory; a racing redundant attempt is harmless.
static PUNCH_HOLES_DISABLED: AtomicBool = AtomicBool::new(false);

/// Host filesystem space report for the volume hosting the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceReport {
    pub capacity_bytes: u64,
    pub available_bytes: u64,
}

/// A single open container file providing random-access byte I/O.
#[derive(Debug)]
pub struct BackingStore {
    path: PathBuf,
    file: Option<File>,
}

impl BackingStore {
    /// Open the container at `path`, creating it if absent.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        Ok(Self {
            path,
            file: Some(file),
        })
    }

    /// Release the handle. Idempotent; a second close is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }
        Ok(())
    }

    fn file(&self) -> Result<&File> {
        self.file
            .as_ref()
            .ok_or_else(|| VatError::Io(io::Error::other("backing store is closed")))
    }

    /// Path of the container file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Space accounting of the host filesystem hosting the container.
    pub fn stat(&self) -> Result<SpaceReport> {
        let vfs = statvfs(self.path.as_path()).map_err(errno_to_io)?;
        let frsize = u64::from(vfs.fragment_size());
        Ok(SpaceReport {
            capacity_bytes: u64::from(vfs.blocks()).saturating_mul(frsize),
            available_bytes: u64::from(vfs.blocks_available()).saturating_mul(frsize),
        })
    }

    /// Current container length in bytes.
    pub fn size_in_bytes(&self) -> Result<u64> {
        Ok(self.file()?.metadata()?.len())
    }

    /// Read exactly `buf.len()` bytes starting at `offset`.
    ///
    /// Retries partial transfers; a short read at EOF is an error, never a
    /// shorter result.
    pub fn read_bytes(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let file = self.file()?;
        let mut pos = offset;
        let mut remaining = buf;
        while !remaining.is_empty() {
            match file.read_at(remaining, pos) {
                Ok(0) => {
                    return Err(VatError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("short read at offset {pos}"),
                    )));
                }
                Ok(n) => {
                    pos += n as u64;
                    remaining = &mut remaining[n..];
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Write all of `buf` starting at `offset`, retrying partial transfers.
    pub fn write_bytes(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let file = self.file()?;
        let mut pos = offset;
        let mut remaining = buf;
        while !remaining.is_empty() {
            match file.write_at(remaining, pos) {
                Ok(0) => {
                    return Err(VatError::Io(io::Error::new(
                        io::ErrorKind::WriteZero,
                        format!("short write at offset {pos}"),
                    )));
                }
                Ok(n) => {
                    pos += n as u64;
                    remaining = &remaining[n..];
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Ask the host filesystem to deallocate physical storage for the given
    /// byte range while preserving the container's logical size.
    ///
    /// Best-effort: on host failure the call still succeeds, a warning is
    /// logged once, and hole punching is disabled for the rest of the
    /// process lifetime.
    pub fn punch_hole(&self, offset: u64, len: u64) -> Result<()> {
        if PUNCH_HOLES_DISABLED.load(Ordering::Relaxed) {
            return Ok(());
        }
        let file = self.file()?;
        let flags = FallocateFlags::FALLOC_FL_PUNCH_HOLE | FallocateFlags::FALLOC_FL_KEEP_SIZE;
        let (offset, len) = match (i64::try_from(offset), i64::try_from(len)) {
            (Ok(offset), Ok(len)) => (offset, len),
            _ => {
                return Err(VatError::InvalidArgument(format!(
                    "punch range overflows off_t: offset={offset} len={len}"
                )));
            }
        };
        if let Err(errno) = fallocate(file, flags, offset, len) {
            PUNCH_HOLES_DISABLED.store(true, Ordering::Relaxed);
            warn!(%errno, "punching a hole failed, not trying again");
        }
        Ok(())
    }

    /// Whether hole punching has been disabled for this process.
    #[must_use]
    pub fn hole_punching_disabled(&self) -> bool {
        PUNCH_HOLES_DISABLED.load(Ordering::Relaxed)
    }

    /// Truncate or extend the container to `new_size` bytes.
    pub fn set_size_bytes(&self, new_size: u64) -> Result<()> {
        self.file()?.set_len(new_size)?;
        Ok(())
    }

    /// Flush pending writes to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.file()?.sync_all()?;
        Ok(())
    }
}

impl Drop for BackingStore {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = file.sync_all();
        }
    }
}

fn errno_to_io(errno: nix::errno::Errno) -> VatError {
    VatError::Io(io::Error::from_raw_os_error(errno as i32))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_store() -> (tempfile::TempDir, BackingStore) {
        let dir = tempdir().expect("tempdir");
        let store = BackingStore::open(dir.path().join("vat.img")).expect("open");
        (dir, store)
    }

    #[test]
    fn open_creates_container() {
        let (dir, store) = open_store();
        assert!(dir.path().join("vat.img").exists());
        assert_eq!(store.size_in_bytes().expect("size"), 0);
    }

    #[test]
    fn open_propagates_host_error() {
        let err = BackingStore::open("/nonexistent-dir/vat.img").unwrap_err();
        match err {
            VatError::Io(io_err) => assert!(io_err.raw_os_error().is_some()),
            other => panic!("expected Io, got {other:?}"),
        }
    }

    #[test]
    fn write_read_round_trip() {
        let (_dir, store) = open_store();
        let data = (0..=255_u8).collect::<Vec<_>>();
        store.write_bytes(1000, &data).expect("write");
        let mut back = vec![0_u8; data.len()];
        store.read_bytes(1000, &mut back).expect("read");
        assert_eq!(back, data);
        // The gap before the write reads as zeros.
        let mut gap = vec![0xFF_u8; 1000];
        store.read_bytes(0, &mut gap).expect("read gap");
        assert!(gap.iter().all(|byte| *byte == 0));
    }

    #[test]
    fn short_read_at_eof_is_error() {
        let (_dir, store) = open_store();
        store.write_bytes(0, b"abc").expect("write");
        let mut buf = [0_u8; 8];
        let err = store.read_bytes(0, &mut buf).unwrap_err();
        match err {
            VatError::Io(io_err) => {
                assert_eq!(io_err.kind(), io::ErrorKind::UnexpectedEof);
            }
            other => panic!("expected Io, got {other:?}"),
        }
    }

    #[test]
    fn set_size_truncates_and_extends() {
        let (_dir, store) = open_store();
        store.set_size_bytes(8192).expect("extend");
        assert_eq!(store.size_in_bytes().expect("size"), 8192);
        store.set_size_bytes(100).expect("truncate");
        assert_eq!(store.size_in_bytes().expect("size"), 100);
    }

    #[test]
    fn stat_reports_plausible_volume_space() {
        let (_dir, store) = open_store();
        let report = store.stat().expect("stat");
        assert!(report.capacity_bytes > 0);
        assert!(report.available_bytes <= report.capacity_bytes);
    }

    #[test]
    fn close_is_idempotent() {
        let (_dir, mut store) = open_store();
        store.close().expect("close");
        store.close().expect("second close");
        assert!(store.read_bytes(0, &mut [0_u8; 1]).is_err());
    }
}
