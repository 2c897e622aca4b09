use crate::txn::BufLogItem;
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use xstage_error::{Result, XsError};
use xstage_types::BlockNumber;

/// Cache key: block address plus length in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BufKey {
    pub block: BlockNumber,
    pub len: u32,
}

impl BufKey {
    #[must_use]
    pub fn new(block: BlockNumber, len: u32) -> Self {
        Self { block, len }
    }
}

bitflags::bitflags! {
    /// Buffer status bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufFlags: u32 {
        /// Contents reflect the backing store.
        const UPTODATE = 0x01;
        /// Contents changed since the last write-back.
        const DIRTY = 0x02;
        /// Logically discarded; never handed out again.
        const STALE = 0x04;
        /// Structure not yet checked by a verifier.
        const UNCHECKED = 0x08;
    }
}

/// Where a verifier found a problem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureLocus {
    /// Byte offset within the block.
    pub offset: usize,
    pub reason: String,
}

impl fmt::Display for FailureLocus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at offset {}", self.reason, self.offset)
    }
}

/// Structural verifier for one block type.
pub trait BufOps: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Check `data` (the whole block at `block`); `None` means it is sound.
    fn verify_struct(&self, block: BlockNumber, data: &[u8]) -> Option<FailureLocus>;
}

/// Byte storage behind one buffer.
pub trait BlockStorage: Send {
    fn as_slice(&self) -> &[u8];

    fn as_mut_slice(&mut self) -> &mut [u8];
}

/// One cached block.
///
/// Status bits live in an atomic word so cache lookups read them without
/// locking. Contents, verifier and log items each sit behind their own lock;
/// none of them is ever taken while another is held.
pub struct Buf<S> {
    key: BufKey,
    flags: AtomicU32,
    ops: Mutex<Option<Arc<dyn BufOps>>>,
    log_items: Mutex<Vec<BufLogItem>>,
    storage: Mutex<S>,
}

impl<S> fmt::Debug for Buf<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = f.debug_struct("Buf");
        out.field("key", &self.key).field("flags", &self.flags());
        if let Some(ops) = self.ops.try_lock() {
            out.field("ops", &ops.as_ref().map(|ops| ops.name()));
        }
        if let Some(items) = self.log_items.try_lock() {
            out.field("log_items", &items.len());
        }
        out.finish_non_exhaustive()
    }
}

impl<S: BlockStorage> Buf<S> {
    pub(crate) fn new(key: BufKey, storage: S, ops: Option<Arc<dyn BufOps>>) -> Self {
        Self {
            key,
            flags: AtomicU32::new((BufFlags::UPTODATE | BufFlags::UNCHECKED).bits()),
            ops: Mutex::new(ops),
            log_items: Mutex::new(Vec::new()),
            storage: Mutex::new(storage),
        }
    }

    /// Read access to the block contents.
    pub fn data(&self) -> MappedMutexGuard<'_, [u8]> {
        MutexGuard::map(self.storage.lock(), |storage| storage.as_mut_slice())
    }

    /// Write access to the block contents; marks the buffer dirty.
    pub fn data_mut(&self) -> MappedMutexGuard<'_, [u8]> {
        self.set_flags(BufFlags::DIRTY);
        MutexGuard::map(self.storage.lock(), |storage| storage.as_mut_slice())
    }

    /// Run the attached verifier over the contents.
    ///
    /// Buffers without a verifier pass. On success the buffer is no longer
    /// `UNCHECKED`.
    pub fn verify(&self) -> Result<()> {
        let Some(ops) = self.ops() else {
            return Ok(());
        };
        let failure = ops.verify_struct(self.key.block, self.storage.lock().as_slice());
        if let Some(locus) = failure {
            return Err(XsError::Corruption {
                block: self.key.block.0,
                detail: format!("{}: {locus}", ops.name()),
            });
        }
        self.clear_flags(BufFlags::UNCHECKED);
        Ok(())
    }

    /// Give up the storage; used by providers when releasing.
    pub fn into_storage(self) -> S {
        self.storage.into_inner()
    }
}

impl<S> Buf<S> {
    #[must_use]
    pub fn key(&self) -> BufKey {
        self.key
    }

    #[must_use]
    pub fn flags(&self) -> BufFlags {
        BufFlags::from_bits_retain(self.flags.load(Ordering::Acquire))
    }

    fn set_flags(&self, flags: BufFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub fn clear_flags(&self, flags: BufFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// Logically discard the buffer. Terminal: a stale buffer is never reused.
    pub fn mark_stale(&self) {
        let stale = BufFlags::STALE.bits();
        let dirty = BufFlags::DIRTY.bits();
        // The closure never declines, so the update always lands.
        let _ = self
            .flags
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                Some((bits | stale) & !dirty)
            });
    }

    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.flags().contains(BufFlags::STALE)
    }

    #[must_use]
    pub fn ops(&self) -> Option<Arc<dyn BufOps>> {
        self.ops.lock().clone()
    }

    pub fn set_ops(&self, ops: Arc<dyn BufOps>) {
        *self.ops.lock() = Some(ops);
    }

    #[must_use]
    pub fn log_item_count(&self) -> usize {
        self.log_items.lock().len()
    }

    pub(crate) fn with_log_items<R>(&self, f: impl FnOnce(&mut Vec<BufLogItem>) -> R) -> R {
        f(&mut self.log_items.lock())
    }

    /// Remove and return every log item attached to this buffer.
    pub fn take_log_items(&self) -> Vec<BufLogItem> {
        std::mem::take(&mut *self.log_items.lock())
    }
}
