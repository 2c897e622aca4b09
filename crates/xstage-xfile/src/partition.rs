//! Byte-addressed access to one client's range of a backing file.

use crate::pool::XfilePool;
use parking_lot::Mutex;
use rustix::fs::{FallocateFlags, SeekFrom};
use rustix::io::Errno;
use std::fs::File;
use std::os::unix::fs::{FileExt, MetadataExt};
use std::sync::Arc;
use tracing::{trace, warn};
use xstage_error::{Result, XsError};
use xstage_types::{BackingId, ByteOffset, MAX_FILE_OFFSET};

/// Largest single load or store, matching the `INT_MAX` bound on one
/// `pread`/`pwrite` transfer.
pub const MAX_TRANSFER: usize = i32::MAX.unsigned_abs() as usize;

/// One client's private byte range inside a backing file.
///
/// A bounded partition (`max_bytes > 0`) occupies
/// `[start, start + span)` of a possibly shared file, where `span` is
/// `max_bytes` rounded up to the page size. An unbounded partition owns its
/// file outright and may grow to the largest file offset.
///
/// Dropping the partition releases it back to its pool.
#[derive(Debug)]
pub struct Partition {
    pool: XfilePool,
    backing: BackingId,
    file: Arc<File>,
    start: u64,
    max_bytes: u64,
    span: u64,
    description: String,
    /// Serializes growth of a private file so concurrent extends never shrink it.
    grow: Mutex<()>,
}

impl Partition {
    pub(crate) fn new(
        pool: XfilePool,
        backing: BackingId,
        file: Arc<File>,
        start: u64,
        max_bytes: u64,
        span: u64,
        description: &str,
    ) -> Self {
        Self {
            pool,
            backing,
            file,
            start,
            max_bytes,
            span,
            description: description.to_owned(),
            grow: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn backing_id(&self) -> BackingId {
        self.backing
    }

    #[must_use]
    pub fn file(&self) -> &Arc<File> {
        &self.file
    }

    /// Offset of this partition within its backing file.
    #[must_use]
    pub fn start(&self) -> ByteOffset {
        ByteOffset(self.start)
    }

    /// Declared capacity in bytes; 0 for an unbounded partition.
    #[must_use]
    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// True if this partition owns its backing file exclusively.
    #[must_use]
    pub fn is_private(&self) -> bool {
        self.max_bytes == 0
    }

    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Largest partition-relative offset a transfer may end at.
    #[must_use]
    pub fn limit(&self) -> u64 {
        if self.max_bytes > 0 {
            self.max_bytes
        } else {
            MAX_FILE_OFFSET
        }
    }

    pub(crate) fn belongs_to(&self, pool: &XfilePool) -> bool {
        self.pool.same_pool(pool)
    }

    /// Validate `[pos, pos + count)` and translate it to a file offset.
    fn absolute(&self, pos: ByteOffset, count: usize) -> Result<u64> {
        if count > MAX_TRANSFER {
            return Err(XsError::OutOfSpace(format!(
                "transfer of {count} bytes exceeds the {MAX_TRANSFER} byte limit"
            )));
        }
        let count = count as u64;
        let end = pos.0.checked_add(count);
        if end.is_none_or(|end| end > self.limit()) {
            return Err(XsError::OutOfSpace(format!(
                "range pos={} count={count} exceeds partition limit {}",
                pos.0,
                self.limit()
            )));
        }
        self.start
            .checked_add(pos.0)
            .filter(|abs| abs.checked_add(count).is_some_and(|e| e <= MAX_FILE_OFFSET))
            .ok_or_else(|| XsError::OutOfSpace(format!("offset {} overflows backing file", pos.0)))
    }

    /// Fill `buf` from partition offset `pos`.
    ///
    /// A short read is reported as `OutOfSpace`: this store behaves like
    /// memory, so a transfer either completes or fails.
    pub fn load(&self, buf: &mut [u8], pos: ByteOffset) -> Result<()> {
        let abs = self.absolute(pos, buf.len())?;
        let got = self.file.read_at(buf, abs)?;
        if got != buf.len() {
            return Err(XsError::OutOfSpace(format!(
                "short load at pos={}: wanted {} got {got}",
                pos.0,
                buf.len()
            )));
        }
        Ok(())
    }

    /// Write all of `buf` at partition offset `pos`. Short writes fail.
    pub fn store(&self, buf: &[u8], pos: ByteOffset) -> Result<()> {
        let abs = self.absolute(pos, buf.len())?;
        let put = self.file.write_at(buf, abs)?;
        if put != buf.len() {
            return Err(XsError::OutOfSpace(format!(
                "short store at pos={}: wanted {} put {put}",
                pos.0,
                buf.len()
            )));
        }
        Ok(())
    }

    /// Bytes of memory actually consumed by this partition.
    ///
    /// Bounded partitions walk the file's data/hole map over their own range,
    /// since the block count of a shared file says nothing about one tenant.
    /// Unbounded partitions report the allocated block count of their file.
    pub fn bytes_used(&self) -> Result<u64> {
        if self.max_bytes == 0 {
            let meta = self.file.metadata()?;
            return Ok(meta.blocks() << 9);
        }
        Ok(self.resident_bytes())
    }

    fn resident_bytes(&self) -> u64 {
        let stop = self.start.saturating_add(self.max_bytes);
        let mut bytes = 0_u64;
        let mut data = rustix::fs::seek(&*self.file, SeekFrom::Data(self.start));
        while let Ok(data_pos) = data {
            if data_pos >= stop {
                break;
            }
            let hole_pos = match rustix::fs::seek(&*self.file, SeekFrom::Hole(data_pos)) {
                Ok(hole_pos) => hole_pos,
                Err(errno) => {
                    data = Err(errno);
                    break;
                }
            };
            if hole_pos >= stop {
                return bytes + (stop - data_pos);
            }
            bytes += hole_pos - data_pos;
            data = rustix::fs::seek(&*self.file, SeekFrom::Data(hole_pos));
        }
        match data {
            // ENXIO means no data past the offset: the walk is complete.
            Err(errno) if errno != Errno::NXIO => {
                trace!(
                    target: "xstage::xfile",
                    event = "resident_walk_failed",
                    backing = self.backing.0,
                    %errno
                );
                self.max_bytes
            }
            _ => bytes,
        }
    }

    /// Let the OS reclaim the pages under `[pos, pos + len)`.
    ///
    /// The range is clipped to the partition so a discard can never reach a
    /// neighbour. The file size is unchanged and later loads of the range
    /// return zeroes. Failure is logged, not returned.
    pub fn discard(&self, pos: ByteOffset, len: u64) {
        let limit = self.limit();
        if pos.0 >= limit || len == 0 {
            return;
        }
        let len = len.min(limit - pos.0);
        let Some(abs) = self.start.checked_add(pos.0) else {
            return;
        };
        if let Err(errno) = rustix::fs::fallocate(
            &*self.file,
            FallocateFlags::PUNCH_HOLE | FallocateFlags::KEEP_SIZE,
            abs,
            len,
        ) {
            warn!(
                target: "xstage::xfile",
                event = "discard_failed",
                backing = self.backing.0,
                pos = pos.0,
                len,
                %errno
            );
        }
    }

    /// Make sure the backing file covers partition bytes up to `end`.
    ///
    /// Bounded partitions are fully extended when acquired. A private file
    /// starts empty, and touching a mapping past its end faults, so callers
    /// that map pages must extend it first.
    pub fn ensure_backed(&self, end: ByteOffset) -> Result<()> {
        if end.0 > self.limit() {
            return Err(XsError::OutOfSpace(format!(
                "offset {} exceeds partition limit {}",
                end.0,
                self.limit()
            )));
        }
        if self.max_bytes > 0 {
            return Ok(());
        }
        let _guard = self.grow.lock();
        let len = self.file.metadata()?.len();
        if len < end.0 {
            self.file
                .set_len(end.0)
                .map_err(|err| XsError::resource("extend", err))?;
        }
        Ok(())
    }
}

impl Drop for Partition {
    fn drop(&mut self) {
        self.pool.release(self.backing, self.start, self.span);
    }
}
