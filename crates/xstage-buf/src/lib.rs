#![forbid(unsafe_code)]
//! Generic buffer cache and the provider contract behind it.
//!
//! A [`BufCache`] indexes [`Buf`]s by [`BufKey`] in a fixed set of hash
//! buckets and evicts unreferenced buffers in LRU order. How a buffer's bytes
//! come to exist, and what happens to them on eviction, is delegated to a
//! [`CacheProvider`]: the disk-backed provider in [`disk`] reads and writes a
//! byte device, while memory-backed providers map their storage directly.
//!
//! Key hashing and comparison are provided methods on the trait, so every
//! provider addresses blocks the same way.

mod buf;
pub mod disk;
mod txn;

pub use buf::{BlockStorage, Buf, BufFlags, BufKey, BufOps, FailureLocus};
pub use disk::{BlockBuf, ByteDevice, DiskProvider, DiskTarget, FileByteDevice};
pub use txn::{BliFlags, BufLogItem, Transaction, TxnSummary, detach_all};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace, warn};
use xstage_error::{Result, XsError};
use xstage_types::{BlockNumber, BlockSize, TargetId};

/// Default number of resident buffers per cache.
pub const DEFAULT_CACHE_CAPACITY: usize = 4096;

/// Hash bucket count for a cache; kept a power of two for the shift hash.
const HASH_BUCKETS: usize = 512;

static TARGET_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique buffer target id.
pub fn next_target_id() -> TargetId {
    TargetId(TARGET_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
}

/// Outcome of comparing a lookup key against a cached buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheCompare {
    Hit,
    Miss,
    /// Same address, different length: the cached buffer must go.
    Purge,
}

/// Callbacks a [`BufCache`] needs from whatever backs its buffers.
pub trait CacheProvider: Send + Sync {
    type Storage: BlockStorage;

    /// Produce the storage for a newly requested block.
    ///
    /// There is no "allocated but not ready" state: a failure here means no
    /// buffer exists.
    fn construct(&self, key: &BufKey) -> Result<Self::Storage>;

    /// Bring a buffer's backing up to date before it is evicted.
    fn flush_before_evict(&self, buf: &Buf<Self::Storage>) -> Result<()>;

    /// Dispose of an evicted buffer.
    fn release(&self, buf: Buf<Self::Storage>) {
        drop(buf);
    }

    /// Release every buffer in `bufs`, returning how many were released.
    fn bulk_release(&self, bufs: Vec<Buf<Self::Storage>>) -> usize {
        let mut count = 0;
        for buf in bufs {
            self.release(buf);
            count += 1;
        }
        count
    }

    /// Bucket index for `key` among `buckets` (a power of two).
    fn hash(&self, key: &BufKey, buckets: usize) -> usize {
        const GOLDEN_RATIO_64: u64 = 0x61C8_8646_80B5_83EB;
        let bits = buckets.trailing_zeros();
        if bits == 0 {
            return 0;
        }
        let hashed = key.block.0.wrapping_mul(GOLDEN_RATIO_64) >> (64 - bits);
        usize::try_from(hashed).unwrap_or(0) & (buckets - 1)
    }

    fn compare(&self, key: &BufKey, buf: &Buf<Self::Storage>) -> CacheCompare {
        let cached = buf.key();
        if cached.block != key.block {
            return CacheCompare::Miss;
        }
        if cached.len == key.len {
            return CacheCompare::Hit;
        }
        if !buf.flags().contains(BufFlags::STALE) {
            warn!(
                target: "xstage::buf",
                event = "key_length_mismatch",
                block = key.block.0,
                cached_len = cached.len,
                wanted_len = key.len
            );
        }
        CacheCompare::Purge
    }
}

/// Buffer cache tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Resident buffers allowed before unreferenced ones are evicted.
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

/// Anything the staging engine can read and write buffers through.
pub trait BufTarget {
    fn target_id(&self) -> TargetId;

    fn is_memory_backed(&self) -> bool;

    fn block_size(&self) -> BlockSize;

    /// True if `block` may be requested from this target.
    fn address_is_valid(&self, block: BlockNumber) -> bool;
}

/// True if `target` stores its blocks in process memory.
pub fn is_memory_backed(target: &dyn BufTarget) -> bool {
    target.is_memory_backed()
}

/// Fail with `NotMemoryBacked` unless `target` stores blocks in memory.
pub fn require_memory_backed(target: &dyn BufTarget) -> Result<()> {
    if target.is_memory_backed() {
        Ok(())
    } else {
        Err(XsError::NotMemoryBacked)
    }
}

#[derive(Debug)]
struct CacheState<S> {
    buckets: Vec<Vec<Arc<Buf<S>>>>,
    /// Keys by use stamp; least recently used first.
    lru: BTreeMap<u64, BufKey>,
    stamps: HashMap<BufKey, u64>,
    clock: u64,
    count: usize,
}

impl<S> CacheState<S> {
    fn new() -> Self {
        Self {
            buckets: (0..HASH_BUCKETS).map(|_| Vec::new()).collect(),
            lru: BTreeMap::new(),
            stamps: HashMap::new(),
            clock: 0,
            count: 0,
        }
    }

    fn remove_from_lru(&mut self, key: BufKey) {
        if let Some(stamp) = self.stamps.remove(&key) {
            self.lru.remove(&stamp);
        }
    }

    fn touch(&mut self, key: BufKey) {
        self.remove_from_lru(key);
        self.clock += 1;
        self.lru.insert(self.clock, key);
        self.stamps.insert(key, self.clock);
    }

    fn unlink(&mut self, bucket: usize, index: usize) -> Arc<Buf<S>> {
        let buf = self.buckets[bucket].swap_remove(index);
        self.remove_from_lru(buf.key());
        self.count -= 1;
        buf
    }
}

/// Hash + LRU cache of buffers for one target.
///
/// At most one indexed buffer exists per key. The cache's mutex guards the
/// index only; buffer contents are guarded by each buffer's own lock.
///
/// Lookups under the index lock read only a buffer's atomic status word, so a
/// caller may hold a buffer's data guard while getting other blocks (or the
/// same one). The only buffer lock taken under the index lock is inside
/// `flush_before_evict`, and only for a buffer nobody else references.
pub struct BufCache<P: CacheProvider> {
    provider: P,
    config: CacheConfig,
    state: Mutex<CacheState<P::Storage>>,
}

impl<P: CacheProvider> std::fmt::Debug for BufCache<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufCache")
            .field("config", &self.config)
            .field("len", &self.state.lock().count)
            .finish_non_exhaustive()
    }
}

impl<P: CacheProvider> BufCache<P> {
    pub fn new(provider: P, config: CacheConfig) -> Result<Self> {
        if config.capacity == 0 {
            return Err(XsError::InvalidArgument(
                "BufCache capacity must be > 0".to_owned(),
            ));
        }
        Ok(Self {
            provider,
            config,
            state: Mutex::new(CacheState::new()),
        })
    }

    #[must_use]
    pub fn provider(&self) -> &P {
        &self.provider
    }

    #[must_use]
    pub fn config(&self) -> CacheConfig {
        self.config
    }

    /// Number of indexed buffers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().count
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up `key`, constructing the buffer on a miss.
    ///
    /// `ops` is attached to a newly constructed buffer and replaces the
    /// verifier on a cached one when given.
    pub fn get(&self, key: BufKey, ops: Option<Arc<dyn BufOps>>) -> Result<Arc<Buf<P::Storage>>> {
        let bucket = self.provider.hash(&key, HASH_BUCKETS);
        let mut state = self.state.lock();

        let mut index = 0;
        let mut purged = Vec::new();
        while index < state.buckets[bucket].len() {
            let cached = &state.buckets[bucket][index];
            let verdict = match self.provider.compare(&key, cached) {
                // Stale buffers are never handed out again.
                CacheCompare::Hit if cached.flags().contains(BufFlags::STALE) => CacheCompare::Purge,
                verdict => verdict,
            };
            match verdict {
                CacheCompare::Hit => {
                    let buf = Arc::clone(cached);
                    state.touch(key);
                    drop(state);
                    if let Some(ops) = ops {
                        buf.set_ops(ops);
                    }
                    trace!(target: "xstage::buf", event = "cache_hit", block = key.block.0);
                    return Ok(buf);
                }
                CacheCompare::Miss => index += 1,
                CacheCompare::Purge => {
                    let old = state.unlink(bucket, index);
                    purged.push(old);
                }
            }
        }

        let storage = self.provider.construct(&key)?;
        let buf = Arc::new(Buf::new(key, storage, ops));
        state.buckets[bucket].push(Arc::clone(&buf));
        state.touch(key);
        state.count += 1;
        let victims = self.collect_victims(&mut state);
        drop(state);

        self.release_unreferenced(purged);
        if !victims.is_empty() {
            let released = self.provider.bulk_release(victims);
            debug!(target: "xstage::buf", event = "cache_evict", released);
        }
        Ok(buf)
    }

    /// Return a buffer obtained from [`Self::get`].
    ///
    /// A stale buffer leaves the index here; once the last handle is gone its
    /// storage is released.
    pub fn put(&self, buf: Arc<Buf<P::Storage>>) {
        if buf.flags().contains(BufFlags::STALE) {
            self.forget(buf);
        }
    }

    /// Drop `buf` from the index without flushing it.
    ///
    /// The storage is released here if this was the last handle, otherwise
    /// when the remaining holders drop theirs.
    pub fn forget(&self, buf: Arc<Buf<P::Storage>>) {
        let key = buf.key();
        let bucket = self.provider.hash(&key, HASH_BUCKETS);
        let mut state = self.state.lock();
        if let Some(index) = state.buckets[bucket]
            .iter()
            .position(|cached| Arc::ptr_eq(cached, &buf))
        {
            let indexed = state.unlink(bucket, index);
            drop(indexed);
        }
        drop(state);
        self.release_unreferenced(vec![buf]);
    }

    /// Mark a buffer stale; it will be dropped from the index when put.
    pub fn mark_stale(&self, buf: &Buf<P::Storage>) {
        buf.mark_stale();
    }

    /// Flush and release every unreferenced buffer. Returns the count released.
    pub fn purge(&self) -> usize {
        let mut state = self.state.lock();
        let mut victims = Vec::new();
        for bucket in 0..state.buckets.len() {
            let mut index = 0;
            while index < state.buckets[bucket].len() {
                if self.evictable(&state.buckets[bucket][index]) {
                    let buf = state.unlink(bucket, index);
                    victims.extend(Arc::into_inner(buf));
                } else {
                    index += 1;
                }
            }
        }
        drop(state);
        self.provider.bulk_release(victims)
    }

    /// Only the cache holds an unreferenced buffer, and it can be flushed.
    fn evictable(&self, buf: &Arc<Buf<P::Storage>>) -> bool {
        if Arc::strong_count(buf) != 1 {
            return false;
        }
        if buf.flags().contains(BufFlags::STALE) {
            return true;
        }
        match self.provider.flush_before_evict(buf) {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    target: "xstage::buf",
                    event = "flush_before_evict_failed",
                    block = buf.key().block.0,
                    error = %err
                );
                false
            }
        }
    }

    fn collect_victims(&self, state: &mut CacheState<P::Storage>) -> Vec<Buf<P::Storage>> {
        let mut victims = Vec::new();
        let mut cursor = 0;
        while state.count > self.config.capacity {
            let Some((&stamp, &key)) = state.lru.range(cursor..).next() else {
                break;
            };
            cursor = stamp + 1;
            let bucket = self.provider.hash(&key, HASH_BUCKETS);
            let found = state.buckets[bucket]
                .iter()
                .position(|cached| cached.key() == key && self.evictable(cached));
            if let Some(index) = found {
                let buf = state.unlink(bucket, index);
                victims.extend(Arc::into_inner(buf));
            }
        }
        victims
    }

    fn release_unreferenced(&self, bufs: Vec<Arc<Buf<P::Storage>>>) {
        let owned: Vec<_> = bufs.into_iter().filter_map(Arc::into_inner).collect();
        if !owned.is_empty() {
            let _ = self.provider.bulk_release(owned);
        }
    }
}

impl<P: CacheProvider> Drop for BufCache<P> {
    fn drop(&mut self) {
        let released = self.purge();
        let leftover = self.state.lock().count;
        if leftover > 0 {
            warn!(
                target: "xstage::buf",
                event = "cache_drop_with_references",
                released,
                leftover
            );
        }
    }
}
