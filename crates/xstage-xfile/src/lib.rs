#![forbid(unsafe_code)]
//! Swappable temporary memory for offline repair.
//!
//! Offline checking sometimes needs to stage more data than fits comfortably
//! in RAM, and not all of it needs to be resident at once. Anonymous memory
//! files (memfd, or an unlinked tmpfs file on older kernels) give us an
//! indexed byte store that the kernel can page out to swap.
//!
//! Each client gets a [`Partition`]: a byte range inside a [`BackingFile`].
//! Bounded partitions share backing files through the [`XfilePool`] to keep
//! the number of descriptors small; unbounded partitions always get a
//! private file.
//!
//! Partitions assume the caller serializes overlapping access; no file locks
//! are taken.

mod backing;
mod partition;
mod pool;

pub use backing::{BackingFile, BackingOrigin, create_backing_file};
pub use partition::{MAX_TRANSFER, Partition};
pub use pool::{PoolStats, XfilePool};
