#![forbid(unsafe_code)]
//! Shared newtypes for the staging layers.
//!
//! Byte offsets and block addresses are kept in distinct wrappers so that the
//! partition layer (bytes) and the buffer-cache layer (blocks) cannot be mixed
//! up by accident.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// Fallback block size when the OS reports a page size we cannot use.
pub const DEFAULT_PAGE_SIZE: u32 = 4096;

/// Largest byte offset a backing file can address (`loff_t` max).
pub const MAX_FILE_OFFSET: u64 = i64::MAX.unsigned_abs();

/// Address of a block in target block units, relative to the target start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Byte offset within a partition or backing file.
///
/// This is a unit-carrying wrapper to prevent mixing bytes and blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ByteOffset(pub u64);

impl ByteOffset {
    pub const ZERO: Self = Self(0);

    /// Add a byte count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }

    /// Subtract a byte count, returning `None` on underflow.
    #[must_use]
    pub fn checked_sub(self, bytes: u64) -> Option<Self> {
        self.0.checked_sub(bytes).map(Self)
    }
}

/// Validated block size (power of two in 512..=65536).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSize(u32);

impl BlockSize {
    /// Create a `BlockSize` if `value` is a power of two in [512, 65536].
    #[must_use]
    pub fn new(value: u32) -> Option<Self> {
        if !value.is_power_of_two() || !(512..=65536).contains(&value) {
            return None;
        }
        Some(Self(value))
    }

    /// The system page size, which is the only block size memory targets use.
    ///
    /// Queried once per process. Falls back to 4096 when the reported value
    /// is not a usable power of two.
    #[must_use]
    pub fn system_page() -> Self {
        static PAGE: OnceLock<BlockSize> = OnceLock::new();
        *PAGE.get_or_init(|| {
            u32::try_from(rustix::param::page_size())
                .ok()
                .and_then(Self::new)
                .unwrap_or(Self(DEFAULT_PAGE_SIZE))
        })
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn as_u64(self) -> u64 {
        u64::from(self.0)
    }

    #[must_use]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Number of bits to shift to convert between bytes and blocks.
    #[must_use]
    pub fn shift(self) -> u32 {
        self.0.trailing_zeros()
    }

    /// Convert a byte offset to a block number (truncating).
    #[must_use]
    pub fn byte_to_block(self, byte_offset: u64) -> BlockNumber {
        BlockNumber(byte_offset >> self.shift())
    }

    /// Convert a block number to a byte offset.
    #[must_use]
    pub fn block_to_byte(self, block: BlockNumber) -> Option<ByteOffset> {
        block.0.checked_mul(self.as_u64()).map(ByteOffset)
    }

    /// Round `bytes` up to a multiple of this block size.
    #[must_use]
    pub fn round_up(self, bytes: u64) -> Option<u64> {
        let mask = self.as_u64() - 1;
        bytes.checked_add(mask).map(|v| v & !mask)
    }
}

/// Identifies one backing file inside an `XfilePool` arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BackingId(pub u64);

/// Identifies one buffer target (memory or disk) for cache keys and traces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TargetId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxnId(pub u64);

/// The filesystem a buffer target stages data for.
///
/// Staging targets never touch the mounted device; this only travels along so
/// that traces and corruption reports name the filesystem being repaired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountContext {
    /// Human-readable name of the filesystem (device path or label).
    pub fs_name: String,
    /// Filesystem block size, for callers that convert on-disk pointers.
    pub fs_block_size: u32,
}

impl MountContext {
    #[must_use]
    pub fn new(fs_name: impl Into<String>, fs_block_size: u32) -> Self {
        Self {
            fs_name: fs_name.into(),
            fs_block_size,
        }
    }
}
