//! Ring storage: private or named shared memory, optionally mirror-mapped.
//!
//! A mirror-mapped region maps the same physical pages twice, back to back,
//! so a read of up to `size` bytes starting anywhere in `[0, size)` is always
//! virtually contiguous and wrap handling disappears from the hot path. When
//! mirroring is unavailable the ring falls back to explicit wrap records.

use std::ffi::CString;
use std::ptr::NonNull;

use crate::error::{Error, Result};

pub fn page_size() -> usize {
    // SAFETY: sysconf(_SC_PAGESIZE) has no preconditions.
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz <= 0 {
        4096
    } else {
        sz as usize
    }
}

enum Backing {
    Private,
    Shared { name: CString },
}

/// A mapped ring data region. The mapping spans `size` bytes, or `2 * size`
/// virtual bytes when mirrored.
pub struct RingMem {
    base: NonNull<u8>,
    size: usize,
    mirrored: bool,
    backing: Backing,
    /// Whether this process created the shared object (for diagnostics).
    created: bool,
}

// SAFETY: the mapping is process-wide; synchronization of the bytes within is
// the ring protocol's responsibility.
unsafe impl Send for RingMem {}
unsafe impl Sync for RingMem {}

impl RingMem {
    /// Maps an anonymous, process-private region.
    pub fn private(size: usize, mirror: bool) -> Result<Self> {
        let size = validate_size(size)?;
        if !mirror {
            let base = map_anon(size)?;
            return Ok(Self {
                base,
                size,
                mirrored: false,
                backing: Backing::Private,
                created: true,
            });
        }
        let fd = memfd(size)?;
        let base = map_mirrored(fd, size);
        // SAFETY: fd is owned here and no longer needed once mapped.
        unsafe { libc::close(fd) };
        Ok(Self {
            base: base?,
            size,
            mirrored: true,
            backing: Backing::Private,
            created: true,
        })
    }

    /// Creates or attaches a named POSIX shared-memory region. Idempotent:
    /// the first caller creates and sizes the object, later callers attach.
    pub fn shared(name: &str, size: usize, mirror: bool) -> Result<Self> {
        let size = validate_size(size)?;
        let cname = shm_name(name)?;

        // SAFETY: cname is a valid NUL-terminated string.
        let mut created = true;
        let mut fd = unsafe {
            libc::shm_open(
                cname.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600,
            )
        };
        if fd == -1 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EEXIST) {
                return Err(Error::Io(err));
            }
            created = false;
            fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDWR, 0o600) };
            if fd == -1 {
                return Err(Error::Io(std::io::Error::last_os_error()));
            }
        }
        if unsafe { libc::ftruncate(fd, size as libc::off_t) } == -1 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(Error::Io(err));
        }

        let base = if mirror {
            map_mirrored(fd, size)
        } else {
            map_fd(fd, size)
        };
        unsafe { libc::close(fd) };
        Ok(Self {
            base: base?,
            size,
            mirrored: mirror,
            backing: Backing::Shared { name: cname },
            created,
        })
    }

    /// Removes a named region. Existing mappings stay valid until unmapped.
    pub fn unlink(name: &str) -> Result<()> {
        let cname = shm_name(name)?;
        // SAFETY: cname is a valid NUL-terminated string.
        if unsafe { libc::shm_unlink(cname.as_ptr()) } == -1 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOENT) {
                return Err(Error::Io(err));
            }
        }
        Ok(())
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn mirrored(&self) -> bool {
        self.mirrored
    }

    pub fn created(&self) -> bool {
        self.created
    }

    /// A contiguous read of `len` bytes starting at ring offset `pos`.
    ///
    /// With mirroring the slice may virtually cross the wrap point; without,
    /// the caller must have ensured the frame does not wrap.
    ///
    /// # Safety
    ///
    /// `pos < size` and `len <= size`; the bytes must have been published
    /// with release ordering by the writer.
    pub unsafe fn slice(&self, pos: usize, len: usize) -> &[u8] {
        debug_assert!(pos < self.size);
        debug_assert!(len <= self.size);
        debug_assert!(self.mirrored || pos + len <= self.size);
        std::slice::from_raw_parts(self.base.as_ptr().add(pos), len)
    }

    /// Mutable counterpart of `slice`, for the writer's reservation.
    ///
    /// # Safety
    ///
    /// Same bounds as `slice`, plus the range must be exclusively reserved.
    pub unsafe fn slice_mut(&self, pos: usize, len: usize) -> &mut [u8] {
        debug_assert!(pos < self.size);
        debug_assert!(len <= self.size);
        debug_assert!(self.mirrored || pos + len <= self.size);
        std::slice::from_raw_parts_mut(self.base.as_ptr().add(pos), len)
    }
}

impl Drop for RingMem {
    fn drop(&mut self) {
        let span = if self.mirrored {
            self.size * 2
        } else {
            self.size
        };
        // SAFETY: base/span describe exactly the mapping established above.
        unsafe {
            libc::munmap(self.base.as_ptr().cast(), span);
        }
        let _ = &self.backing;
    }
}

fn validate_size(size: usize) -> Result<usize> {
    if size == 0 {
        return Err(Error::Config("ring size must be non-zero"));
    }
    let page = page_size();
    let size = size.next_power_of_two().max(page);
    Ok(size)
}

fn shm_name(name: &str) -> Result<CString> {
    let full = if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{name}")
    };
    CString::new(full).map_err(|_| Error::Config("ring name contains NUL"))
}

#[cfg(target_os = "linux")]
fn memfd(size: usize) -> Result<libc::c_int> {
    // SAFETY: the name is a static NUL-terminated literal.
    let fd = unsafe {
        libc::memfd_create(
            b"seqlink-ring\0".as_ptr() as *const libc::c_char,
            libc::MFD_CLOEXEC,
        )
    };
    if fd == -1 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    if unsafe { libc::ftruncate(fd, size as libc::off_t) } == -1 {
        let err = std::io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(Error::Io(err));
    }
    Ok(fd)
}

#[cfg(not(target_os = "linux"))]
fn memfd(size: usize) -> Result<libc::c_int> {
    // No memfd outside Linux: back the anonymous mirror with an unlinked
    // shm object instead.
    let name = format!("seqlink-anon-{}-{:p}", std::process::id(), &size);
    let cname = shm_name(&name)?;
    // SAFETY: cname is a valid NUL-terminated string.
    let fd = unsafe {
        libc::shm_open(
            cname.as_ptr(),
            libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
            0o600,
        )
    };
    if fd == -1 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    unsafe {
        libc::shm_unlink(cname.as_ptr());
    }
    if unsafe { libc::ftruncate(fd, size as libc::off_t) } == -1 {
        let err = std::io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(Error::Io(err));
    }
    Ok(fd)
}

fn map_anon(size: usize) -> Result<NonNull<u8>> {
    // SAFETY: anonymous mapping with no address hint.
    let addr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    NonNull::new(addr as *mut u8).ok_or(Error::Corrupt("mmap returned null"))
}

fn map_fd(fd: libc::c_int, size: usize) -> Result<NonNull<u8>> {
    // SAFETY: fd is a valid shm object of at least `size` bytes.
    let addr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    NonNull::new(addr as *mut u8).ok_or(Error::Corrupt("mmap returned null"))
}

/// Maps `fd` twice, back to back: reserve `2 * size` of address space, then
/// fix both halves onto the same pages.
fn map_mirrored(fd: libc::c_int, size: usize) -> Result<NonNull<u8>> {
    // SAFETY: reservation mapping; replaced below with MAP_FIXED.
    let reserve = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size * 2,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if reserve == libc::MAP_FAILED {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    for half in 0..2 {
        // SAFETY: MAP_FIXED inside the reservation just established.
        let addr = unsafe {
            libc::mmap(
                (reserve as *mut u8).add(half * size).cast(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_FIXED,
                fd,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            let err = std::io::Error::last_os_error();
            unsafe {
                libc::munmap(reserve, size * 2);
            }
            return Err(Error::Io(err));
        }
    }
    NonNull::new(reserve as *mut u8).ok_or(Error::Corrupt("mmap returned null"))
}
