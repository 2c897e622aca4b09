#![forbid(unsafe_code)]
//! Error types for xstage.
//!
//! # Error Taxonomy
//!
//! Staging storage behaves like process memory that happens to be pageable,
//! so its failures are grouped by what the caller can do about them rather
//! than by which syscall produced them:
//!
//! | Variant | Meaning | errno |
//! |---------|---------|-------|
//! | `Io` | Unclassified OS error from a byte transfer | raw errno or `EIO` |
//! | `Resource` | No backing object could be created, or a map/unmap/extend call failed | raw errno or `ENOMEM` |
//! | `OutOfSpace` | Request exceeds a partition's capacity or an internal bound, or a transfer came up short | `ENOMEM` |
//! | `Corruption` | Finalize-time structural verification failed | `EUCLEAN` (EFSCORRUPTED) |
//! | `InvalidArgument` | Caller passed a malformed size or configuration | `EINVAL` |
//! | `NotMemoryBacked` | A memory-only operation was invoked on a disk-backed target | `EOPNOTSUPP` |
//!
//! ## Propagation Policy
//!
//! Nothing in the staging layers retries. Every allocation, mapping and
//! verification failure is returned from the call that triggered it. The only
//! failures swallowed are the best-effort reclaim operations (tail truncation
//! after a partition is released, hole punching on discard); those are logged
//! by the caller and never converted into an `XsError`.
//!
//! `OutOfSpace` deliberately maps to `ENOMEM` and not to `ENOSPC`: from the
//! client's point of view this store *is* memory.

use thiserror::Error;

/// Unified error type for all xstage operations.
#[derive(Debug, Error)]
pub enum XsError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A backing object or memory mapping could not be obtained.
    ///
    /// `op` names the failing step (`"memfd_create"`, `"mmap"`, `"extend"`)
    /// so that traces identify which part of the fallback chain gave up.
    #[error("resource unavailable during {op}: {source}")]
    Resource {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// A load/store/extend would exceed the partition, or a transfer was short.
    #[error("out of staging space: {0}")]
    OutOfSpace(String),

    /// Structural verification of a staged block failed.
    ///
    /// `block` is the buffer's address in target block units; `detail`
    /// carries the verifier name and the failure locus.
    #[error("corrupt staged block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// Malformed caller input (zero cache capacity, oversize description).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation requires a memory-backed buffer target.
    #[error("buffer target is not memory-backed")]
    NotMemoryBacked,
}

impl XsError {
    /// Build a `Resource` error from anything convertible to `std::io::Error`.
    pub fn resource(op: &'static str, source: impl Into<std::io::Error>) -> Self {
        Self::Resource {
            op,
            source: source.into(),
        }
    }

    /// Convert this error into a POSIX errno.
    ///
    /// The mapping is exhaustive so that adding a variant fails to compile
    /// until its errno is decided.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Resource { source, .. } => source.raw_os_error().unwrap_or(libc::ENOMEM),
            Self::OutOfSpace(_) => libc::ENOMEM,
            Self::Corruption { .. } => libc::EUCLEAN,
            Self::InvalidArgument(_) => libc::EINVAL,
            Self::NotMemoryBacked => libc::EOPNOTSUPP,
        }
    }

    /// True for errors the caller should treat as an allocation failure.
    #[must_use]
    pub fn is_out_of_space(&self) -> bool {
        matches!(self, Self::OutOfSpace(_))
    }
}

/// Result alias using `XsError`.
pub type Result<T> = std::result::Result<T, XsError>;
