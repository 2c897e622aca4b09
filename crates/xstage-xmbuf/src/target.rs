//! The buffer target bound to one partition.

use crate::mapped::MappedPage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, trace, warn};
use xstage_buf::{
    Buf, BufCache, BufKey, BufOps, BufTarget, CacheConfig, CacheProvider, Transaction,
    detach_all, next_target_id,
};
use xstage_error::{Result, XsError};
use xstage_types::{BlockNumber, BlockSize, MountContext, TargetId};
use xstage_xfile::{Partition, XfilePool};

/// Addressable bytes of an unbounded target unless configured otherwise.
pub const DEFAULT_UNBOUNDED_LIMIT: u64 = 64 << 30;

fn default_unbounded_limit() -> u64 {
    DEFAULT_UNBOUNDED_LIMIT
}

/// Settings for a new memory-backed target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XmbufConfig {
    /// Names the backing file and shows up in traces.
    pub description: String,
    /// Partition capacity in bytes; 0 for an unbounded, private partition.
    pub max_bytes: u64,
    /// Highest byte an unbounded target will map. Ignored when `max_bytes`
    /// is set.
    #[serde(default = "default_unbounded_limit")]
    pub unbounded_limit: u64,
    pub cache: CacheConfig,
}

impl Default for XmbufConfig {
    fn default() -> Self {
        Self {
            description: "xmbuf".to_owned(),
            max_bytes: 0,
            unbounded_limit: DEFAULT_UNBOUNDED_LIMIT,
            cache: CacheConfig::default(),
        }
    }
}

/// Serves buffers by mapping partition pages in place.
///
/// Blocks are exactly one system page. There is nothing to write back: the
/// mapping is the storage.
#[derive(Debug)]
pub struct XmbufProvider {
    partition: Arc<Partition>,
    page: BlockSize,
    /// Byte limit on addresses: `max_bytes`, or the configured cap for an
    /// unbounded partition.
    limit: u64,
    live: Arc<AtomicUsize>,
}

impl XmbufProvider {
    fn block_limit(&self) -> u64 {
        self.limit >> self.page.shift()
    }
}

impl CacheProvider for XmbufProvider {
    type Storage = MappedPage;

    fn construct(&self, key: &BufKey) -> Result<MappedPage> {
        if key.len != self.page.get() {
            return Err(XsError::InvalidArgument(format!(
                "memory-backed buffers are one page ({} bytes), not {}",
                self.page.get(),
                key.len
            )));
        }
        if key.block.0 >= self.block_limit() {
            return Err(XsError::OutOfSpace(format!(
                "block {} beyond partition of {} blocks",
                key.block,
                self.block_limit()
            )));
        }
        let pos = self
            .page
            .block_to_byte(key.block)
            .ok_or_else(|| XsError::OutOfSpace(format!("block {} overflows", key.block)))?;
        MappedPage::map(
            Arc::clone(&self.partition),
            pos,
            self.page.as_usize(),
            Arc::clone(&self.live),
        )
        .inspect_err(|err| {
            warn!(
                target: "xstage::xmbuf",
                event = "map_failed",
                backing = self.partition.backing_id().0,
                block = key.block.0,
                error = %err
            );
        })
    }

    fn flush_before_evict(&self, _buf: &Buf<MappedPage>) -> Result<()> {
        Ok(())
    }

    fn release(&self, buf: Buf<MappedPage>) {
        trace!(target: "xstage::xmbuf", event = "page_release", block = buf.key().block.0);
        drop(buf.into_storage());
    }
}

/// A buffer-cache target whose blocks live in swappable memory.
///
/// Each target owns exactly one partition, created with it and released when
/// the target is destroyed. Buffers still held by callers keep the partition
/// alive until they are dropped.
#[derive(Debug)]
pub struct BufferTarget {
    id: TargetId,
    mount: MountContext,
    partition: Arc<Partition>,
    cache: BufCache<XmbufProvider>,
}

/// Create a memory-backed target of at most `max_bytes` in the process-wide
/// pool. `max_bytes == 0` gives an unbounded target with a private backing
/// file.
pub fn create_partition(
    mount: &MountContext,
    description: &str,
    max_bytes: u64,
) -> Result<BufferTarget> {
    BufferTarget::create_with_config(
        XfilePool::global(),
        mount,
        &XmbufConfig {
            description: description.to_owned(),
            max_bytes,
            ..XmbufConfig::default()
        },
    )
}

impl BufferTarget {
    /// Create a target in `pool` from `config`.
    pub fn create_with_config(
        pool: &XfilePool,
        mount: &MountContext,
        config: &XmbufConfig,
    ) -> Result<Self> {
        let page = BlockSize::system_page();
        if config.max_bytes == 0 && config.unbounded_limit < page.as_u64() {
            return Err(XsError::InvalidArgument(format!(
                "unbounded_limit {} is smaller than one page ({} bytes)",
                config.unbounded_limit,
                page.get()
            )));
        }
        let partition = Arc::new(pool.acquire_partition(&config.description, config.max_bytes)?);
        let limit = if partition.is_private() {
            config.unbounded_limit.min(partition.limit())
        } else {
            partition.limit()
        };
        let provider = XmbufProvider {
            partition: Arc::clone(&partition),
            page,
            limit,
            live: Arc::new(AtomicUsize::new(0)),
        };
        let cache = BufCache::new(provider, config.cache)?;
        let id = next_target_id();
        debug!(
            target: "xstage::xmbuf",
            event = "target_create",
            target_id = id.0,
            fs = %mount.fs_name,
            description = %config.description,
            max_bytes = config.max_bytes,
            limit,
            backing = partition.backing_id().0
        );
        Ok(Self {
            id,
            mount: mount.clone(),
            partition,
            cache,
        })
    }

    /// Tear down the target and release its partition.
    ///
    /// Unreferenced buffers are unmapped now; any still held are unmapped as
    /// their last handle drops, after which the partition goes back to its
    /// pool.
    pub fn destroy(self) {
        debug!(
            target: "xstage::xmbuf",
            event = "target_destroy",
            target_id = self.id.0,
            cached = self.cache.len()
        );
        drop(self);
    }

    #[must_use]
    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    #[must_use]
    pub fn mount(&self) -> &MountContext {
        &self.mount
    }

    #[must_use]
    pub fn cache(&self) -> &BufCache<XmbufProvider> {
        &self.cache
    }

    /// Pages currently mapped on behalf of this target.
    #[must_use]
    pub fn mapped_pages(&self) -> usize {
        self.cache.provider().live.load(Ordering::Acquire)
    }

    /// Memory actually consumed by the target's partition.
    pub fn bytes_used(&self) -> Result<u64> {
        self.partition.bytes_used()
    }

    /// Map block `block`, attaching `ops` as its verifier.
    pub fn get(
        &self,
        block: BlockNumber,
        ops: Option<Arc<dyn BufOps>>,
    ) -> Result<Arc<Buf<MappedPage>>> {
        let len = self.cache.provider().page.get();
        self.cache.get(BufKey::new(block, len), ops)
    }

    pub fn put(&self, buf: Arc<Buf<MappedPage>>) {
        self.cache.put(buf);
    }

    pub fn mark_stale(&self, buf: &Buf<MappedPage>) {
        self.cache.mark_stale(buf);
    }

    /// Settle a buffer the caller has finished changing.
    ///
    /// A stale buffer has its page punched out of the partition; the length
    /// of the partition does not change. Anything else goes through its
    /// verifier, and a failure comes back as `Corruption` for the caller to
    /// judge.
    pub fn finalize(&self, buf: &Buf<MappedPage>) -> Result<()> {
        let block = buf.key().block;
        if buf.is_stale() {
            let page = self.cache.provider().page;
            if let Some(pos) = page.block_to_byte(block) {
                self.partition.discard(pos, page.as_u64());
            }
            debug!(target: "xstage::xmbuf", event = "stale_discard", block = block.0);
            return Ok(());
        }
        if buf.ops().is_none() {
            trace!(target: "xstage::xmbuf", event = "finalize_unchecked", block = block.0);
            return Ok(());
        }
        buf.verify().inspect_err(|err| {
            warn!(
                target: "xstage::xmbuf",
                event = "verify_failed",
                target_id = self.id.0,
                fs = %self.mount.fs_name,
                block = block.0,
                error = %err
            );
        })
    }

    /// Remove every transaction log item from `buf`.
    ///
    /// Nothing staged here is ever logged, so the items are cleared and
    /// dropped rather than committed. Returns how many were removed.
    pub fn detach_from_transaction(&self, txn: &mut Transaction, buf: &Buf<MappedPage>) -> usize {
        let detached = detach_all(txn, buf);
        if detached > 0 {
            trace!(
                target: "xstage::xmbuf",
                event = "txn_detach",
                txn = txn.id().0,
                block = buf.key().block.0,
                detached
            );
        }
        detached
    }
}

impl BufTarget for BufferTarget {
    fn target_id(&self) -> TargetId {
        self.id
    }

    fn is_memory_backed(&self) -> bool {
        true
    }

    fn block_size(&self) -> BlockSize {
        self.cache.provider().page
    }

    /// Blocks are valid strictly below `max_bytes >> page_shift`, or below
    /// the configured cap for an unbounded target.
    fn address_is_valid(&self, block: BlockNumber) -> bool {
        block.0 < self.cache.provider().block_limit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xstage_buf::{BufFlags, FailureLocus};

    fn mount() -> MountContext {
        MountContext::new("/dev/test", 4096)
    }

    fn page() -> u64 {
        BlockSize::system_page().as_u64()
    }

    fn target(pool: &XfilePool, max_bytes: u64) -> BufferTarget {
        BufferTarget::create_with_config(
            pool,
            &mount(),
            &XmbufConfig {
                description: "target-test".to_owned(),
                max_bytes,
                cache: CacheConfig { capacity: 4 },
                ..XmbufConfig::default()
            },
        )
        .expect("target")
    }

    #[derive(Debug)]
    struct HeaderOps;

    impl BufOps for HeaderOps {
        fn name(&self) -> &'static str {
            "header"
        }

        fn verify_struct(&self, _block: BlockNumber, data: &[u8]) -> Option<FailureLocus> {
            (!data.starts_with(b"XSTG")).then(|| FailureLocus {
                offset: 0,
                reason: "bad header".to_owned(),
            })
        }
    }

    #[test]
    fn get_maps_partition_page_in_place() {
        let pool = XfilePool::new();
        let target = target(&pool, 8 * page());
        let buf = target.get(BlockNumber(2), None).expect("block 2");
        buf.data_mut()[..4].copy_from_slice(b"abcd");

        let mut out = [0_u8; 4];
        target
            .partition()
            .load(&mut out, xstage_types::ByteOffset(2 * page()))
            .expect("load");
        assert_eq!(&out, b"abcd");
        assert_eq!(target.mapped_pages(), 1);
    }

    #[test]
    fn construct_rejects_block_past_partition() {
        let pool = XfilePool::new();
        let target = target(&pool, 2 * page());
        assert!(target.address_is_valid(BlockNumber(1)));
        assert!(!target.address_is_valid(BlockNumber(2)));
        let err = target.get(BlockNumber(2), None).expect_err("past end");
        assert!(err.is_out_of_space());
        assert_eq!(target.mapped_pages(), 0);
    }

    #[test]
    fn finalize_runs_verifier() {
        let pool = XfilePool::new();
        let target = target(&pool, 4 * page());
        let buf = target
            .get(BlockNumber(0), Some(Arc::new(HeaderOps)))
            .expect("block 0");
        let err = target.finalize(&buf).expect_err("zeroed page has no header");
        assert!(matches!(err, XsError::Corruption { block: 0, .. }));

        buf.data_mut()[..4].copy_from_slice(b"XSTG");
        target.finalize(&buf).expect("valid header");
        assert!(!buf.flags().contains(BufFlags::UNCHECKED));
    }

    #[test]
    fn finalize_without_verifier_passes() {
        let pool = XfilePool::new();
        let target = target(&pool, page());
        let buf = target.get(BlockNumber(0), None).expect("block 0");
        buf.data_mut()[0] = 0xFF;
        target.finalize(&buf).expect("nothing to check");
    }

    #[test]
    fn finalize_of_stale_buffer_discards_page() {
        let pool = XfilePool::new();
        let target = target(&pool, 4 * page());
        let buf = target
            .get(BlockNumber(1), Some(Arc::new(HeaderOps)))
            .expect("block 1");
        buf.data_mut().fill(0x99);
        target.mark_stale(&buf);
        target.finalize(&buf).expect("stale finalize skips verifier");
        target.put(buf);
        assert_eq!(target.mapped_pages(), 0);

        let len = target.partition().file().metadata().expect("meta").len();
        assert_eq!(len, 4 * page());
        let again = target.get(BlockNumber(1), None).expect("remapped");
        assert!(again.data().iter().all(|&b| b == 0));
    }

    #[test]
    fn detach_from_transaction_drains_all_items() {
        let pool = XfilePool::new();
        let target = target(&pool, page());
        let buf = target.get(BlockNumber(0), None).expect("block 0");
        let mut t1 = Transaction::new(xstage_types::TxnId(1));
        let mut t2 = Transaction::new(xstage_types::TxnId(2));
        t1.log_buf(&buf);
        t2.ordered_buf(&buf);

        assert_eq!(target.detach_from_transaction(&mut t1, &buf), 2);
        assert_eq!(buf.log_item_count(), 0);
        assert!(t1.joined().is_empty());
        assert!(t2.joined().is_empty());
        assert_eq!(target.detach_from_transaction(&mut t1, &buf), 0);
    }

    #[test]
    fn unbounded_target_addresses_stop_at_configured_cap() {
        let pool = XfilePool::new();
        let target = BufferTarget::create_with_config(
            &pool,
            &mount(),
            &XmbufConfig {
                unbounded_limit: 8 * page(),
                ..XmbufConfig::default()
            },
        )
        .expect("unbounded target");
        assert!(target.address_is_valid(BlockNumber(7)));
        assert!(!target.address_is_valid(BlockNumber(8)));
        assert!(!target.address_is_valid(BlockNumber(u64::MAX >> 12)));

        let err = target.get(BlockNumber(8), None).expect_err("past cap");
        assert!(err.is_out_of_space());
        assert_eq!(target.partition().file().metadata().expect("meta").len(), 0);
    }

    #[test]
    fn sub_page_unbounded_cap_is_rejected() {
        let pool = XfilePool::new();
        let err = BufferTarget::create_with_config(
            &pool,
            &mount(),
            &XmbufConfig {
                unbounded_limit: 1,
                ..XmbufConfig::default()
            },
        )
        .expect_err("cap below one page");
        assert!(matches!(err, XsError::InvalidArgument(_)));
        assert_eq!(pool.stats().live_partitions, 0);
    }

    #[test]
    fn destroy_releases_partition() {
        let pool = XfilePool::new();
        let target = target(&pool, page());
        drop(target.get(BlockNumber(0), None).expect("block 0"));
        assert_eq!(pool.stats().live_partitions, 1);
        target.destroy();
        assert_eq!(pool.stats().live_partitions, 0);
    }

    #[test]
    fn held_buffer_outlives_target() {
        let pool = XfilePool::new();
        let target = target(&pool, page());
        let buf = target.get(BlockNumber(0), None).expect("block 0");
        target.destroy();
        buf.data_mut()[0] = 1;
        assert_eq!(pool.stats().live_partitions, 1);
        drop(buf);
        assert_eq!(pool.stats().live_partitions, 0);
    }
}
