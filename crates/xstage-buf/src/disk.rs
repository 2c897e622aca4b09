//! Disk-backed buffer provider.
//!
//! Buffers own a copy of their block, read from a [`ByteDevice`] on
//! construction and written back when dirty before eviction. This is the
//! ordinary case a memory-backed target is measured against.

use crate::buf::{BlockStorage, Buf, BufFlags, BufKey, BufOps};
use crate::{BufCache, BufTarget, CacheConfig, CacheProvider, next_target_id};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, trace};
use xstage_error::{Result, XsError};
use xstage_types::{BlockNumber, BlockSize, ByteOffset, TargetId};

/// Owned block contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Vec<u8>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

impl BlockStorage for BlockBuf {
    fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: ByteOffset, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

/// File-backed byte device.
///
/// Uses `FileExt`, so concurrent transfers never share a seek position.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    /// Open `path` read-write, falling back to read-only.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }

    #[must_use]
    pub fn file(&self) -> &Arc<File> {
        &self.file
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    fn check_range(&self, op: &str, offset: ByteOffset, len: usize) -> Result<()> {
        let end = u64::try_from(len)
            .ok()
            .and_then(|len| offset.0.checked_add(len))
            .ok_or_else(|| XsError::InvalidArgument(format!("{op} range overflows u64")))?;
        if end > self.len {
            return Err(XsError::InvalidArgument(format!(
                "{op} out of bounds: offset={} len={len} file_len={}",
                offset.0, self.len
            )));
        }
        Ok(())
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        self.check_range("read", offset, buf.len())?;
        self.file.read_exact_at(buf, offset.0)?;
        Ok(())
    }

    fn write_all_at(&self, offset: ByteOffset, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(io::Error::from(io::ErrorKind::PermissionDenied).into());
        }
        self.check_range("write", offset, buf.len())?;
        self.file.write_all_at(buf, offset.0)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// Reads blocks from a device and writes dirty ones back before eviction.
#[derive(Debug)]
pub struct DiskProvider<D: ByteDevice> {
    dev: D,
    block_size: BlockSize,
    block_count: u64,
}

impl<D: ByteDevice> DiskProvider<D> {
    pub fn new(dev: D, block_size: BlockSize) -> Result<Self> {
        let len = dev.len_bytes();
        let remainder = len % block_size.as_u64();
        if remainder != 0 {
            return Err(XsError::InvalidArgument(format!(
                "device length is not block-aligned: len_bytes={len} block_size={block_size:?} remainder={remainder}"
            )));
        }
        Ok(Self {
            dev,
            block_size,
            block_count: block_size.byte_to_block(len).0,
        })
    }

    #[must_use]
    pub fn device(&self) -> &D {
        &self.dev
    }

    #[must_use]
    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    /// Device offset of `key`, after checking it lies inside the device.
    fn locate(&self, key: &BufKey) -> Result<ByteOffset> {
        let blocks = u64::from(key.len).div_ceil(self.block_size.as_u64());
        let end = key.block.0.checked_add(blocks);
        if key.len == 0 || end.is_none_or(|end| end > self.block_count) {
            return Err(XsError::InvalidArgument(format!(
                "block out of range: block={} len={} block_count={}",
                key.block, key.len, self.block_count
            )));
        }
        self.block_size
            .block_to_byte(key.block)
            .ok_or_else(|| XsError::InvalidArgument(format!("block {} offset overflows", key.block)))
    }

    /// Verify a dirty, live buffer and write it to the device.
    pub fn write_back(&self, buf: &Buf<BlockBuf>) -> Result<()> {
        let flags = buf.flags();
        if !flags.contains(BufFlags::DIRTY) || flags.contains(BufFlags::STALE) {
            return Ok(());
        }
        buf.verify()?;
        let offset = self.locate(&buf.key())?;
        self.dev.write_all_at(offset, &buf.data())?;
        buf.clear_flags(BufFlags::DIRTY);
        trace!(target: "xstage::buf", event = "write_back", block = buf.key().block.0);
        Ok(())
    }
}

impl<D: ByteDevice> CacheProvider for DiskProvider<D> {
    type Storage = BlockBuf;

    fn construct(&self, key: &BufKey) -> Result<BlockBuf> {
        let offset = self.locate(key)?;
        let mut bytes = vec![0_u8; key.len as usize];
        self.dev.read_exact_at(offset, &mut bytes)?;
        Ok(BlockBuf::new(bytes))
    }

    fn flush_before_evict(&self, buf: &Buf<BlockBuf>) -> Result<()> {
        self.write_back(buf)
    }
}

/// A buffer target over a block device.
#[derive(Debug)]
pub struct DiskTarget<D: ByteDevice> {
    id: TargetId,
    cache: BufCache<DiskProvider<D>>,
}

impl<D: ByteDevice> DiskTarget<D> {
    pub fn open(dev: D, block_size: BlockSize, config: CacheConfig) -> Result<Self> {
        let provider = DiskProvider::new(dev, block_size)?;
        let id = next_target_id();
        debug!(
            target: "xstage::buf",
            event = "disk_target_open",
            target_id = id.0,
            block_count = provider.block_count(),
            block_size = block_size.get()
        );
        Ok(Self {
            id,
            cache: BufCache::new(provider, config)?,
        })
    }

    #[must_use]
    pub fn cache(&self) -> &BufCache<DiskProvider<D>> {
        &self.cache
    }

    /// Fetch one block.
    pub fn get(&self, block: BlockNumber, ops: Option<Arc<dyn BufOps>>) -> Result<Arc<Buf<BlockBuf>>> {
        let len = self.cache.provider().block_size.get();
        self.cache.get(BufKey::new(block, len), ops)
    }

    pub fn put(&self, buf: Arc<Buf<BlockBuf>>) {
        self.cache.put(buf);
    }

    /// Write `buf` back now if it is dirty.
    pub fn flush(&self, buf: &Buf<BlockBuf>) -> Result<()> {
        self.cache.provider().write_back(buf)
    }

    /// Write back and drop every unreferenced buffer, then sync the device.
    pub fn sync(&self) -> Result<usize> {
        let released = self.cache.purge();
        self.cache.provider().device().sync()?;
        Ok(released)
    }
}

impl<D: ByteDevice> BufTarget for DiskTarget<D> {
    fn target_id(&self) -> TargetId {
        self.id
    }

    fn is_memory_backed(&self) -> bool {
        false
    }

    fn block_size(&self) -> BlockSize {
        self.cache.provider().block_size
    }

    fn address_is_valid(&self, block: BlockNumber) -> bool {
        block.0 < self.cache.provider().block_count
    }
}
