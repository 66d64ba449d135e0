//! Memory shared between tasks.
//!
//! Two kinds of backing exist:
//! - [`SharedMapping`]: a `MAP_SHARED` mapping, memfd-backed on Linux so it
//!   survives `exec` and can be re-attached by an image child from an
//!   inherited descriptor. Used for the exported region and the control block
//!   in process modes.
//! - a zeroed heap block, used for the exported region in thread mode where
//!   every task already shares the address space.
//!
//! Callers only ever see [`ExportedRegion`], a view onto whichever backing the
//! instance owns.

use crate::error::{Error, Result};

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr::{self, NonNull};

/// Alignment of every region handed to callers.
pub(crate) const REGION_ALIGN: usize = 64;

/// A `MAP_SHARED` mapping, unmapped on drop.
pub(crate) struct SharedMapping {
    ptr: NonNull<u8>,
    len: usize,
    fd: Option<OwnedFd>,
}

// The mapping is plain shared memory; synchronization of its contents is the
// job of whatever is placed inside it.
unsafe impl Send for SharedMapping {}
unsafe impl Sync for SharedMapping {}

impl SharedMapping {
    /// Creates a zero-filled shared mapping of `len` bytes.
    #[cfg(target_os = "linux")]
    pub(crate) fn create(name: &str, len: usize) -> Result<Self> {
        let name = std::ffi::CString::new(name)
            .map_err(|_| Error::InvalidArgument("mapping name contains a NUL byte".into()))?;

        let raw = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
        if raw < 0 {
            return Err(io::Error::last_os_error().into());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let size = libc::off_t::try_from(len)
            .map_err(|_| Error::InvalidArgument(format!("mapping of {len} bytes is too large")))?;
        if unsafe { libc::ftruncate(fd.as_raw_fd(), size) } != 0 {
            return Err(io::Error::last_os_error().into());
        }

        Self::map(Some(fd), len)
    }

    /// Creates a zero-filled shared mapping of `len` bytes.
    ///
    /// Without memfd the mapping is anonymous: it is inherited across `fork`
    /// but cannot follow an `exec`.
    #[cfg(not(target_os = "linux"))]
    pub(crate) fn create(_name: &str, len: usize) -> Result<Self> {
        Self::map(None, len)
    }

    /// Maps a descriptor inherited from the spawner, taking ownership of it.
    ///
    /// # Safety
    /// `raw` must be an open descriptor owned by nobody else in this process.
    pub(crate) unsafe fn attach(raw: RawFd, len: usize) -> Result<Self> {
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        // Keep it out of whatever this process executes next.
        if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) } != 0 {
            return Err(io::Error::last_os_error().into());
        }

        Self::map(Some(fd), len)
    }

    fn map(fd: Option<OwnedFd>, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::InvalidArgument("cannot map an empty region".into()));
        }

        let (flags, raw) = match &fd {
            Some(fd) => (libc::MAP_SHARED, fd.as_raw_fd()),
            None => (libc::MAP_SHARED | libc::MAP_ANON, -1),
        };

        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                raw,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error().into());
        }

        let ptr = NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| Error::Io(io::Error::other("mmap returned a null mapping")))?;

        Ok(Self { ptr, len, fd })
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// The backing descriptor, if the mapping can be re-attached after `exec`.
    pub(crate) fn raw_fd(&self) -> Option<RawFd> {
        self.fd.as_ref().map(AsRawFd::as_raw_fd)
    }
}

impl Drop for SharedMapping {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast(), self.len);
        }
    }
}

/// Zeroed heap memory with [`REGION_ALIGN`] alignment.
pub(crate) struct HeapBlock {
    ptr: NonNull<u8>,
    layout: Layout,
}

unsafe impl Send for HeapBlock {}
unsafe impl Sync for HeapBlock {}

impl HeapBlock {
    pub(crate) fn new(len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::InvalidArgument("cannot allocate an empty region".into()));
        }

        let layout = Layout::from_size_align(len, REGION_ALIGN)
            .map_err(|_| Error::InvalidArgument(format!("region of {len} bytes is too large")))?;

        let ptr = NonNull::new(unsafe { alloc_zeroed(layout) })
            .ok_or_else(|| Error::Io(io::ErrorKind::OutOfMemory.into()))?;

        Ok(Self { ptr, layout })
    }
}

impl Drop for HeapBlock {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// Storage behind an instance's exported region.
pub(crate) enum RegionBacking {
    Heap(HeapBlock),
    Shared(SharedMapping),
}

impl RegionBacking {
    pub(crate) fn view(&self) -> ExportedRegion {
        let (ptr, len) = match self {
            RegionBacking::Heap(block) => (block.ptr, block.layout.size()),
            RegionBacking::Shared(mapping) => (mapping.ptr, mapping.len),
        };

        ExportedRegion { ptr, len }
    }

    pub(crate) fn shared(&self) -> Option<&SharedMapping> {
        match self {
            RegionBacking::Heap(_) => None,
            RegionBacking::Shared(mapping) => Some(mapping),
        }
    }
}

/// View of the memory the root exported to every task.
///
/// The region is zero-filled at `init` and lives until `fin`. The runtime
/// never reads or writes it; callers place their own synchronization objects
/// inside, which must work across processes in process modes (atomics do,
/// `std::sync` types do not).
#[derive(Clone, Copy, Debug)]
pub struct ExportedRegion {
    ptr: NonNull<u8>,
    len: usize,
}

unsafe impl Send for ExportedRegion {}
unsafe impl Sync for ExportedRegion {}

impl ExportedRegion {
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Reinterprets the start of the region as a `T`.
    ///
    /// Fails `InvalidArgument` if the region is too small or misaligned for
    /// `T`.
    ///
    /// # Safety
    /// The caller picks `T`. It must be valid for an all-zero bit pattern (or
    /// already initialized by the root), usable through a shared reference
    /// from several tasks at once, and must not outlive `fin`.
    pub unsafe fn cast<T: Sync>(&self) -> Result<&T> {
        if std::mem::size_of::<T>() > self.len {
            return Err(Error::InvalidArgument(format!(
                "exported region of {} bytes cannot hold {} bytes",
                self.len,
                std::mem::size_of::<T>()
            )));
        }

        if self.ptr.as_ptr().align_offset(std::mem::align_of::<T>()) != 0 {
            return Err(Error::InvalidArgument(
                "exported region is misaligned for the requested type".into(),
            ));
        }

        Ok(unsafe { &*self.ptr.as_ptr().cast::<T>() })
    }
}
