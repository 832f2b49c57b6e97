#![forbid(unsafe_code)]
//! Error types for vatfs.
//!
//! `VatError` is the single error type crossing crate boundaries. Host I/O
//! failures are wrapped unchanged (`Io`), so the original error code stays
//! distinguishable all the way up to the protocol adapter. Parse-layer
//! failures (`vatfs-types::ParseError`) are converted into `Corrupt` at the
//! crate that knows the affected block; this crate stays free of
//! dependencies on the rest of the workspace.
//!
//! Propagation policy: store errors pass through the allocator and the
//! resolver unchanged. The one locally-swallowed failure is hole punching,
//! which `vatfs-store` downgrades to a warning plus a permanent
//! feature-disablement because sparse reclamation never affects logical
//! correctness.

use thiserror::Error;

/// Unified error type for all vatfs operations.
#[derive(Debug, Error)]
pub enum VatError {
    /// Host I/O failure; the OS error code is preserved.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The allocator cannot satisfy a request: the bitmap is full or the
    /// host volume has no room to materialize another block.
    #[error("no space left on device")]
    NoSpace,

    /// A block index or inode slot that is already free was freed again.
    /// This is an internal consistency violation, not a recoverable
    /// user-facing condition.
    #[error("double free of index {index}")]
    DoubleFree { index: u64 },

    /// An on-disk structure failed a sanity invariant on read.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corrupt { block: u64, detail: String },

    /// Caller-supplied argument out of range (offset overflow, bad
    /// geometry, oversized symlink target).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl VatError {
    /// Convert this error into a POSIX errno for protocol adapters.
    ///
    /// The match is exhaustive; adding a variant without assigning its errno
    /// is a compile error. `DoubleFree` maps to `EIO` because by the time it
    /// is observed the on-disk accounting can no longer be trusted.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::NoSpace => libc::ENOSPC,
            Self::DoubleFree { .. } | Self::Corrupt { .. } => libc::EIO,
            Self::InvalidArgument(_) => libc::EINVAL,
        }
    }
}

/// Result alias using `VatError`.
pub type Result<T> = std::result::Result<T, VatError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(VatError, libc::c_int)> = vec![
            (VatError::Io(std::io::Error::other("test")), libc::EIO),
            (VatError::NoSpace, libc::ENOSPC),
            (VatError::DoubleFree { index: 9 }, libc::EIO),
            (
                VatError::Corrupt {
                    block: 0,
                    detail: "bad magic".into(),
                },
                libc::EIO,
            ),
            (VatError::InvalidArgument("len".into()), libc::EINVAL),
        ];
        for (error, expected) in &cases {
            assert_eq!(error.to_errno(), *expected, "wrong errno for {error:?}");
        }
    }

    #[test]
    fn io_error_preserves_raw_os_error() {
        let raw = std::io::Error::from_raw_os_error(libc::EACCES);
        assert_eq!(VatError::Io(raw).to_errno(), libc::EACCES);
    }

    #[test]
    fn display_formatting() {
        assert_eq!(
            VatError::DoubleFree { index: 17 }.to_string(),
            "double free of index 17"
        );
        assert_eq!(
            VatError::Corrupt {
                block: 0,
                detail: "superblock magic mismatch".into(),
            }
            .to_string(),
            "corrupt metadata at block 0: superblock magic mismatch"
        );
        assert_eq!(VatError::NoSpace.to_string(), "no space left on device");
    }
}
