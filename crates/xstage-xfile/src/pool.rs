//! Arena of backing files shared between bounded partitions.

use crate::backing::create_backing_file;
use crate::partition::Partition;
use parking_lot::Mutex;
use rustix::fs::FallocateFlags;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::sync::{Arc, OnceLock};
use tracing::{debug, trace, warn};
use xstage_error::{Result, XsError};
use xstage_types::{BackingId, BlockSize, MAX_FILE_OFFSET};

#[derive(Debug)]
struct PoolEntry {
    file: Arc<File>,
    /// Number of live partitions carved from this file.
    refcount: u32,
    /// Private files are never offered to other partitions.
    shareable: bool,
}

#[derive(Debug, Default)]
struct PoolState {
    next_id: u64,
    /// Ordered by creation, so scanning yields first-created-first.
    files: BTreeMap<BackingId, PoolEntry>,
}

impl PoolState {
    fn insert(&mut self, file: File, shareable: bool) -> (BackingId, Arc<File>) {
        let id = BackingId(self.next_id);
        self.next_id += 1;
        let file = Arc::new(file);
        self.files.insert(
            id,
            PoolEntry {
                file: Arc::clone(&file),
                refcount: 1,
                shareable,
            },
        );
        (id, file)
    }

    /// First shareable file that can be extended by `span` bytes.
    ///
    /// Returns the id, the file and the page-aligned start of the new range.
    fn extend_first_fit(&mut self, span: u64, page: BlockSize) -> Option<(BackingId, Arc<File>, u64)> {
        for (id, entry) in &mut self.files {
            if !entry.shareable {
                continue;
            }
            let Ok(meta) = entry.file.metadata() else {
                continue;
            };
            let Some(pos) = page.round_up(meta.len()) else {
                continue;
            };
            let Some(end) = pos.checked_add(span).filter(|end| *end <= MAX_FILE_OFFSET) else {
                continue;
            };
            // Extend now so that stores to the end of the range cannot fail later.
            if let Err(err) = entry.file.set_len(end) {
                trace!(
                    target: "xstage::xfile",
                    event = "backing_extend_failed",
                    backing = id.0,
                    end,
                    error = %err
                );
                continue;
            }
            entry.refcount += 1;
            return Some((*id, Arc::clone(&entry.file), pos));
        }
        None
    }
}

/// Counters describing the pool's current membership.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Backing files alive, private ones included.
    pub backing_files: usize,
    /// Backing files that may still accept new partitions.
    pub shared_backing_files: usize,
    /// Partitions not yet released.
    pub live_partitions: usize,
}

/// Hands out partitions, sharing backing files where that is safe.
///
/// All membership changes and reference counts go through one pool-wide
/// mutex. Buffer traffic never takes it; only acquire and release do.
#[derive(Debug, Clone, Default)]
pub struct XfilePool {
    state: Arc<Mutex<PoolState>>,
}

impl XfilePool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide pool.
    #[must_use]
    pub fn global() -> &'static Self {
        static GLOBAL: OnceLock<XfilePool> = OnceLock::new();
        GLOBAL.get_or_init(Self::new)
    }

    /// Carve a partition of at most `max_bytes` out of the pool.
    ///
    /// `max_bytes == 0` asks for an unbounded partition, which always gets a
    /// private backing file. Otherwise the request is rounded up to the page
    /// size and placed at the end of the first pooled file that can grow by
    /// that much, or in a new file if none can.
    pub fn acquire_partition(&self, description: &str, max_bytes: u64) -> Result<Partition> {
        if max_bytes == 0 {
            let backing = create_backing_file(description)?;
            let (id, file) = self.state.lock().insert(backing.into_file(), false);
            debug!(
                target: "xstage::xfile",
                event = "partition_acquire",
                description,
                backing = id.0,
                private = true,
                new_file = true
            );
            return Ok(Partition::new(self.clone(), id, file, 0, 0, 0, description));
        }

        let page = BlockSize::system_page();
        let span = page
            .round_up(max_bytes)
            .filter(|span| *span <= MAX_FILE_OFFSET)
            .ok_or_else(|| {
                XsError::OutOfSpace(format!("partition size {max_bytes} exceeds file offset range"))
            })?;

        let mut state = self.state.lock();
        if let Some((id, file, start)) = state.extend_first_fit(span, page) {
            drop(state);
            debug!(
                target: "xstage::xfile",
                event = "partition_acquire",
                description,
                backing = id.0,
                start,
                span,
                new_file = false
            );
            return Ok(Partition::new(self.clone(), id, file, start, max_bytes, span, description));
        }

        let backing = create_backing_file(description)?;
        backing
            .file()
            .set_len(span)
            .map_err(|err| XsError::resource("extend", err))?;
        let (id, file) = state.insert(backing.into_file(), true);
        drop(state);
        debug!(
            target: "xstage::xfile",
            event = "partition_acquire",
            description,
            backing = id.0,
            start = 0_u64,
            span,
            new_file = true
        );
        Ok(Partition::new(self.clone(), id, file, 0, max_bytes, span, description))
    }

    /// Return a partition to the pool. Equivalent to dropping it.
    pub fn release_partition(&self, partition: Partition) {
        debug_assert!(
            partition.belongs_to(self),
            "partition released to a pool it was not acquired from"
        );
        drop(partition);
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        let mut stats = PoolStats {
            backing_files: state.files.len(),
            ..PoolStats::default()
        };
        for entry in state.files.values() {
            if entry.shareable {
                stats.shared_backing_files += 1;
            }
            stats.live_partitions += entry.refcount as usize;
        }
        stats
    }

    /// Reference count of one backing file, `None` once it has been destroyed.
    #[must_use]
    pub fn refcount(&self, id: BackingId) -> Option<u32> {
        self.state.lock().files.get(&id).map(|entry| entry.refcount)
    }

    pub(crate) fn same_pool(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    /// Drop one reference to `id`; called from `Partition::drop`.
    ///
    /// The last reference destroys the file outright since its contents are
    /// ephemeral. Otherwise the released range is given back: truncated away
    /// if it was the tail of the file, hole-punched if it was not. Both are
    /// best effort.
    pub(crate) fn release(&self, id: BackingId, start: u64, span: u64) {
        let mut state = self.state.lock();
        let Some(entry) = state.files.get_mut(&id) else {
            warn!(target: "xstage::xfile", event = "release_unknown", backing = id.0);
            return;
        };

        entry.refcount = entry.refcount.saturating_sub(1);
        if entry.refcount == 0 {
            let _ = state.files.remove(&id);
            drop(state);
            debug!(target: "xstage::xfile", event = "backing_destroy", backing = id.0);
            return;
        }
        if span == 0 {
            return;
        }

        let file = Arc::clone(&entry.file);
        let end = start.saturating_add(span);
        match file.metadata() {
            Ok(meta) if meta.len() == end => {
                if let Err(err) = file.set_len(start) {
                    debug!(
                        target: "xstage::xfile",
                        event = "tail_reclaim_failed",
                        backing = id.0,
                        start,
                        error = %err
                    );
                } else {
                    trace!(target: "xstage::xfile", event = "tail_reclaim", backing = id.0, start);
                }
            }
            Ok(_) => {
                if let Err(errno) = rustix::fs::fallocate(
                    &*file,
                    FallocateFlags::PUNCH_HOLE | FallocateFlags::KEEP_SIZE,
                    start,
                    span,
                ) {
                    debug!(
                        target: "xstage::xfile",
                        event = "range_reclaim_failed",
                        backing = id.0,
                        start,
                        span,
                        %errno
                    );
                }
            }
            Err(err) => {
                debug!(
                    target: "xstage::xfile",
                    event = "tail_reclaim_failed",
                    backing = id.0,
                    error = %err
                );
            }
        }
        drop(state);
    }
}
