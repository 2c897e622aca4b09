//! Creation of anonymous, swappable backing files.

use rustix::fs::{MemfdFlags, Mode, OFlags};
use std::ffi::{CStr, CString};
use std::fs::File;
use std::path::Path;
use tracing::{debug, warn};
use xstage_error::{Result, XsError};

/// memfd names are limited to 249 bytes by the kernel (NAME_MAX minus "memfd:").
const MEMFD_NAME_MAX: usize = 249;

/// Which mechanism produced a backing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackingOrigin {
    /// `memfd_create(MFD_CLOEXEC | MFD_NOEXEC_SEAL)`, Linux 6.3+.
    MemfdNoExec,
    /// `memfd_create(MFD_CLOEXEC)`, Linux 3.17+.
    Memfd,
    /// `O_TMPFILE` under `/dev/shm`.
    TmpfileShm,
    /// `O_TMPFILE` under `/tmp`.
    TmpfileTmp,
    /// Unlinked temporary file in the process temp directory.
    UnlinkedTemp,
}

/// An OS-level anonymous storage object.
///
/// The descriptor is close-on-exec and mode 0600: these files act as
/// windowed RAM and must never be shared with other processes.
#[derive(Debug)]
pub struct BackingFile {
    file: File,
    origin: BackingOrigin,
}

impl BackingFile {
    #[must_use]
    pub fn file(&self) -> &File {
        &self.file
    }

    #[must_use]
    pub fn origin(&self) -> BackingOrigin {
        self.origin
    }

    #[must_use]
    pub fn into_file(self) -> File {
        self.file
    }
}

fn memfd_name(description: &str) -> Result<CString> {
    let mut end = description.len().min(MEMFD_NAME_MAX);
    while !description.is_char_boundary(end) {
        end -= 1;
    }
    CString::new(&description[..end]).map_err(|_| {
        XsError::InvalidArgument(format!("backing file description contains NUL: {description:?}"))
    })
}

fn open_tmpfile(dir: &str) -> rustix::io::Result<File> {
    rustix::fs::open(
        Path::new(dir),
        OFlags::TMPFILE | OFlags::RDWR | OFlags::CLOEXEC,
        Mode::RUSR | Mode::WUSR,
    )
    .map(File::from)
}

const FALLBACK_CHAIN: [BackingOrigin; 5] = [
    BackingOrigin::MemfdNoExec,
    BackingOrigin::Memfd,
    BackingOrigin::TmpfileShm,
    BackingOrigin::TmpfileTmp,
    BackingOrigin::UnlinkedTemp,
];

fn try_create(origin: BackingOrigin, name: &CStr) -> rustix::io::Result<File> {
    match origin {
        BackingOrigin::MemfdNoExec => {
            rustix::fs::memfd_create(name, MemfdFlags::CLOEXEC | MemfdFlags::NOEXEC_SEAL)
                .map(File::from)
        }
        BackingOrigin::Memfd => rustix::fs::memfd_create(name, MemfdFlags::CLOEXEC).map(File::from),
        BackingOrigin::TmpfileShm => open_tmpfile("/dev/shm"),
        BackingOrigin::TmpfileTmp => open_tmpfile("/tmp"),
        BackingOrigin::UnlinkedTemp => tempfile::tempfile().map_err(|err| {
            err.raw_os_error()
                .map_or(rustix::io::Errno::IO, rustix::io::Errno::from_raw_os_error)
        }),
    }
}

/// Ask the OS for an anonymous, swap-eligible storage object.
///
/// Tries, in order: a memfd sealed against exec, a plain memfd (older kernels
/// reject `MFD_NOEXEC_SEAL` with `EINVAL`), an `O_TMPFILE` in `/dev/shm`, an
/// `O_TMPFILE` in `/tmp`, and finally an unlinked temp file. Group and other
/// permission bits are cleared on whatever succeeds.
pub fn create_backing_file(description: &str) -> Result<BackingFile> {
    let name = memfd_name(description)?;

    let mut found = None;
    let mut last_errno = rustix::io::Errno::OPNOTSUPP;
    for origin in FALLBACK_CHAIN {
        match try_create(origin, &name) {
            Ok(file) => {
                found = Some((file, origin));
                break;
            }
            Err(errno) => {
                last_errno = errno;
                debug!(
                    target: "xstage::xfile",
                    event = "backing_fallback",
                    description,
                    ?origin,
                    %errno
                );
            }
        }
    }

    let Some((file, origin)) = found else {
        return Err(XsError::resource("create_backing_file", last_errno));
    };

    // memfds are created 0777; the other mechanisms should already be 0600.
    if let Err(errno) = rustix::fs::fchmod(&file, Mode::RUSR | Mode::WUSR) {
        warn!(
            target: "xstage::xfile",
            event = "backing_chmod_failed",
            description,
            %errno
        );
    }

    debug!(
        target: "xstage::xfile",
        event = "backing_create",
        description,
        ?origin
    );
    Ok(BackingFile { file, origin })
}
