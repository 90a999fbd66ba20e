//! Named POSIX shared-memory regions.
//!
//! A [`SharedRegion`] is a `shm_open` object mapped read-write into this
//! process. The creating side owns the name and unlinks it on drop; attaching
//! sides only unmap. Any process that knows the name can attach while the
//! creator is alive.

use crate::error::{Error, Result};
use rustix::fd::OwnedFd;
use rustix::fs::Mode;
use rustix::mm::{MapFlags, ProtFlags};
use rustix::shm::OFlags;
use std::ptr::NonNull;

/// Longest region name accepted, excluding the leading `/`.
const NAME_MAX: usize = 254;

/// A named shared-memory region mapped into this process.
///
/// # Example
///
/// ```rust,ignore
/// use shmalloc::shm::SharedRegion;
///
/// let owner = SharedRegion::create("demo#cachbin", 4096)?;
/// let peer = SharedRegion::attach("demo#cachbin")?;
/// assert_eq!(peer.len(), 4096);
/// ```
pub struct SharedRegion {
    /// Keeps the shm object open for the lifetime of the mapping.
    _fd: OwnedFd,
    ptr: NonNull<u8>,
    len: usize,
    name: String,
    owner: bool,
}

// SAFETY: the mapping is plain shared memory. Concurrent access to its bytes
// is coordinated by the allocators that hand out disjoint ranges.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Create the region `name` with `size` bytes, or open and resize it if a
    /// stale one already exists. The returned handle unlinks the name on drop.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::ZeroSize);
        }
        let path = shm_path(name)?;

        let fd = rustix::shm::open(
            path.as_str(),
            OFlags::CREATE | OFlags::RDWR,
            Mode::RUSR | Mode::WUSR,
        )
        .map_err(|source| unavailable(name, source))?;

        if let Err(source) = rustix::fs::ftruncate(&fd, size as u64) {
            let _ = rustix::shm::unlink(path.as_str());
            return Err(unavailable(name, source));
        }

        let ptr = match map(&fd, size) {
            Ok(ptr) => ptr,
            Err(source) => {
                let _ = rustix::shm::unlink(path.as_str());
                return Err(unavailable(name, source));
            }
        };

        tracing::debug!("Created shared region {} ({} bytes)", name, size);

        Ok(Self {
            _fd: fd,
            ptr,
            len: size,
            name: name.to_string(),
            owner: true,
        })
    }

    /// Attach an existing region at its current size.
    pub fn attach(name: &str) -> Result<Self> {
        let path = shm_path(name)?;

        let fd = rustix::shm::open(path.as_str(), OFlags::RDWR, Mode::empty())
            .map_err(|source| unavailable(name, source))?;
        let stat = rustix::fs::fstat(&fd).map_err(|source| unavailable(name, source))?;
        let len = usize::try_from(stat.st_size).unwrap_or(0);
        if len == 0 {
            return Err(Error::InvalidDescriptor(format!(
                "region {name:?} exists but is empty"
            )));
        }

        let ptr = map(&fd, len).map_err(|source| unavailable(name, source))?;

        tracing::debug!("Attached shared region {} ({} bytes)", name, len);

        Ok(Self {
            _fd: fd,
            ptr,
            len,
            name: name.to_string(),
            owner: false,
        })
    }

    /// Base address of the mapping in this process.
    #[inline]
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Mapped size in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Regions are never empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this handle created the region and will unlink its name.
    #[inline]
    pub fn is_owner(&self) -> bool {
        self.owner
    }

    /// Pointer `offset` bytes into the mapping, if `offset + len` fits.
    pub fn ptr_at(&self, offset: usize, len: usize) -> Option<NonNull<u8>> {
        let end = offset.checked_add(len)?;
        if end > self.len {
            return None;
        }
        // SAFETY: offset is within the mapping.
        Some(unsafe { self.ptr.add(offset) })
    }

    /// Copy `data` into the mapping at `offset`.
    pub fn write_at(&self, offset: usize, data: &[u8]) -> Result<()> {
        let dst = self
            .ptr_at(offset, data.len())
            .ok_or(Error::RangeError {
                offset,
                size: data.len(),
            })?;
        // SAFETY: bounds checked above; the source is a distinct Rust slice.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst.as_ptr(), data.len());
        }
        Ok(())
    }

    /// Copy `len` bytes starting at `offset` out of the mapping.
    pub fn read_at(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        let src = self
            .ptr_at(offset, len)
            .ok_or(Error::RangeError { offset, size: len })?;
        let mut out = vec![0u8; len];
        // SAFETY: bounds checked above; `out` is freshly allocated.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), out.as_mut_ptr(), len);
        }
        Ok(out)
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        // SAFETY: ptr/len describe the mapping created in create()/attach().
        unsafe {
            let _ = rustix::mm::munmap(self.ptr.as_ptr().cast(), self.len);
        }
        if self.owner {
            if let Ok(path) = shm_path(&self.name) {
                if let Err(e) = rustix::shm::unlink(path.as_str()) {
                    tracing::warn!("Failed to unlink shared region {}: {}", self.name, e);
                }
            }
        }
        tracing::trace!("Released shared region {}", self.name);
    }
}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("name", &self.name)
            .field("len", &self.len)
            .field("owner", &self.owner)
            .finish()
    }
}

fn shm_path(name: &str) -> Result<String> {
    if name.is_empty() || name.len() > NAME_MAX || name.contains('/') || name.contains('\0') {
        return Err(Error::InvalidConfig(format!(
            "invalid shared region name {name:?}"
        )));
    }
    Ok(format!("/{name}"))
}

fn map(fd: &OwnedFd, len: usize) -> rustix::io::Result<NonNull<u8>> {
    // SAFETY: a fresh shared mapping of an fd we own; no existing memory is replaced.
    let ptr = unsafe {
        rustix::mm::mmap(
            std::ptr::null_mut(),
            len,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            fd,
            0,
        )?
    };
    NonNull::new(ptr.cast::<u8>()).ok_or(rustix::io::Errno::NOMEM)
}

fn unavailable(name: &str, source: rustix::io::Errno) -> Error {
    Error::RegionUnavailable {
        name: name.to_string(),
        source,
    }
}

#[cfg(test)]
pub(crate) fn test_region_name(prefix: &str) -> String {
    use std::sync::atomic::{AtomicUsize, Ordering};
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    format!(
        "{}-{}-{}",
        prefix,
        std::process::id(),
        NEXT.fetch_add(1, Ordering::Relaxed)
    )
}
