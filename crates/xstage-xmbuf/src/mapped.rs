//! Owned shared mappings of partition pages.

use rustix::mm::{MapFlags, ProtFlags};
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::warn;
use xstage_buf::BlockStorage;
use xstage_error::{Result, XsError};
use xstage_types::ByteOffset;
use xstage_xfile::Partition;

/// A read/write shared mapping of `[pos, pos + len)` of one partition.
///
/// The mapping keeps its partition alive, so the backing range can neither
/// be released nor truncated while the page is mapped. Dropping the page
/// unmaps it.
pub struct MappedPage {
    partition: Arc<Partition>,
    base: NonNull<u8>,
    len: usize,
    pos: ByteOffset,
    live: Arc<AtomicUsize>,
}

impl fmt::Debug for MappedPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedPage")
            .field("backing", &self.partition.backing_id())
            .field("pos", &self.pos)
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

impl MappedPage {
    /// Map `len` bytes of `partition` starting at partition offset `pos`.
    ///
    /// `pos` and the partition start must be page aligned. Unbounded
    /// partitions are extended first so the mapping never reaches past the
    /// end of the file. `live` counts mappings currently outstanding.
    pub fn map(
        partition: Arc<Partition>,
        pos: ByteOffset,
        len: usize,
        live: Arc<AtomicUsize>,
    ) -> Result<Self> {
        if len == 0 {
            return Err(XsError::InvalidArgument("cannot map an empty range".to_owned()));
        }
        let end = u64::try_from(len)
            .ok()
            .and_then(|len| pos.checked_add(len))
            .ok_or_else(|| XsError::OutOfSpace(format!("mapping at {} overflows", pos.0)))?;
        partition.ensure_backed(end)?;
        let offset = partition
            .start()
            .0
            .checked_add(pos.0)
            .ok_or_else(|| XsError::OutOfSpace(format!("mapping at {} overflows", pos.0)))?;

        // SAFETY: a fresh mapping at a kernel-chosen address aliases no Rust
        // object. The file covers `[offset, offset + len)` after
        // `ensure_backed`, and holding `partition` keeps it that way.
        let addr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &**partition.file(),
                offset,
            )
        }
        .map_err(|errno| XsError::resource("mmap", errno))?;
        let base = NonNull::new(addr.cast::<u8>()).ok_or_else(|| {
            XsError::resource("mmap", std::io::Error::other("mmap returned null"))
        })?;

        live.fetch_add(1, Ordering::AcqRel);
        Ok(Self {
            partition,
            base,
            len,
            pos,
            live,
        })
    }

    /// Partition offset of the first mapped byte.
    #[must_use]
    pub fn pos(&self) -> ByteOffset {
        self.pos
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn partition(&self) -> &Arc<Partition> {
        &self.partition
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: `base` points at `len` mapped bytes that stay mapped until
        // `drop`; shared access follows from `&self`.
        unsafe { std::slice::from_raw_parts(self.base.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as for `as_slice`; `&mut self` makes this the only live
        // reference into the mapping.
        unsafe { std::slice::from_raw_parts_mut(self.base.as_ptr(), self.len) }
    }
}

impl BlockStorage for MappedPage {
    fn as_slice(&self) -> &[u8] {
        Self::as_slice(self)
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        Self::as_mut_slice(self)
    }
}

impl Drop for MappedPage {
    fn drop(&mut self) {
        // SAFETY: `base`/`len` describe exactly the mapping created in `map`,
        // and no slice borrowed from it can outlive `self`.
        if let Err(errno) = unsafe { rustix::mm::munmap(self.base.as_ptr().cast(), self.len) } {
            warn!(
                target: "xstage::xmbuf",
                event = "unmap_failed",
                backing = self.partition.backing_id().0,
                pos = self.pos.0,
                %errno
            );
        }
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

// SAFETY: the mapping is owned by this value alone and is reachable only
// through `&self`/`&mut self`; the partition it borrows from is `Send + Sync`.
unsafe impl Send for MappedPage {}
// SAFETY: `&MappedPage` only hands out shared byte slices.
unsafe impl Sync for MappedPage {}
