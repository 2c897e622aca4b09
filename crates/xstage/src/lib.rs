#![forbid(unsafe_code)]
//! xstage public API facade.
//!
//! Memory-backed staging storage for offline repair: swappable backing files
//! carved into partitions, and buffer-cache targets that map those partitions
//! page by page. Downstream consumers depend on this crate rather than on the
//! individual layers.

pub use xstage_buf as buf;
pub use xstage_error::{Result, XsError};
pub use xstage_types as types;
pub use xstage_xfile as xfile;
pub use xstage_xmbuf as xmbuf;

pub use xstage_buf::{
    Buf, BufFlags, BufOps, BufTarget, CacheConfig, FailureLocus, Transaction, is_memory_backed,
};
pub use xstage_types::{BlockNumber, ByteOffset, MountContext};
pub use xstage_xfile::{Partition, PoolStats, XfilePool};
pub use xstage_xmbuf::{BufferTarget, MappedPage, XmbufConfig, create_partition};
