// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 labhub contributors

//! POSIX shared-memory segment wrapper.
//!
//! Thin, safe layer over `shm_open`/`ftruncate`/`mmap`/`shm_unlink`.
//!
//! # Lifecycle
//!
//! 1. The producer creates the segment with [`ShmSegment::create`]
//!    (`O_EXCL`: an existing segment is a name conflict, never silently
//!    replaced - a crashed producer's region must stay inspectable).
//! 2. Consumers and recovery tools map it with [`ShmSegment::open`], which
//!    sizes the mapping from the segment itself.
//! 3. Drop unmaps. Only an explicit [`ShmSegment::unlink`] removes the name.

use super::{DataBlockError, Result};
use std::ffi::CString;
use std::io;
use std::ptr;

/// A mapped POSIX shared-memory segment.
///
/// Unmaps on drop; never unlinks implicitly.
pub struct ShmSegment {
    ptr: *mut u8,
    size: usize,
    name: String,
}

// SAFETY: the mapping is shared between processes by construction; all
// concurrent access goes through atomics inside the mapped structures.
unsafe impl Send for ShmSegment {}
unsafe impl Sync for ShmSegment {}

fn c_name(name: &str) -> Result<CString> {
    CString::new(name).map_err(|_| DataBlockError::InvalidName(name.to_string()))
}

fn map_create_errno(name: &str, err: io::Error) -> DataBlockError {
    match err.raw_os_error() {
        Some(libc::EEXIST) => DataBlockError::NameConflict(name.to_string()),
        Some(libc::EACCES | libc::EPERM) => DataBlockError::Permission(name.to_string()),
        _ => DataBlockError::MapFailed(err),
    }
}

fn map_open_errno(name: &str, err: io::Error) -> DataBlockError {
    match err.raw_os_error() {
        Some(libc::ENOENT) => DataBlockError::NotFound(name.to_string()),
        Some(libc::EACCES | libc::EPERM) => DataBlockError::Permission(name.to_string()),
        _ => DataBlockError::MapFailed(err),
    }
}

impl ShmSegment {
    /// Create a new segment of exactly `size` bytes, zero-filled.
    ///
    /// Fails with [`DataBlockError::NameConflict`] if the name is taken.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        let cname = c_name(name)?;

        // SAFETY: `cname` is a valid NUL-terminated string; O_EXCL makes the
        // call fail rather than reuse an existing segment; 0o600 keeps the
        // region private to the owning user.
        let fd = unsafe {
            libc::shm_open(
                cname.as_ptr(),
                libc::O_CREAT | libc::O_RDWR | libc::O_EXCL,
                0o600,
            )
        };
        if fd < 0 {
            return Err(map_create_errno(name, io::Error::last_os_error()));
        }

        // SAFETY: `fd` is the segment just created; sizes are bounded by the
        // geometry validation upstream, so the off_t cast cannot wrap.
        let rc = unsafe { libc::ftruncate(fd, size as libc::off_t) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: fd is valid and unused after this error path.
            unsafe {
                libc::close(fd);
                libc::shm_unlink(cname.as_ptr());
            }
            return Err(DataBlockError::MapFailed(err));
        }

        let ptr = Self::map(fd, size);

        // SAFETY: the mapping (when it succeeded) holds its own reference;
        // the descriptor is no longer needed either way.
        unsafe { libc::close(fd) };

        let Some(ptr) = ptr else {
            let err = io::Error::last_os_error();
            // SAFETY: unlink only touches the namespace entry we created.
            unsafe { libc::shm_unlink(cname.as_ptr()) };
            return Err(DataBlockError::MapFailed(err));
        };

        // SAFETY: `ptr` addresses exactly `size` freshly mapped writable
        // bytes; nothing else references the segment yet.
        unsafe { ptr::write_bytes(ptr, 0, size) };

        Ok(Self {
            ptr,
            size,
            name: name.to_string(),
        })
    }

    /// Map an existing segment, sized from the segment itself.
    pub fn open(name: &str) -> Result<Self> {
        let cname = c_name(name)?;

        // SAFETY: valid NUL-terminated name; mode is ignored without O_CREAT.
        let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            return Err(map_open_errno(name, io::Error::last_os_error()));
        }

        let mut stat = std::mem::MaybeUninit::<libc::stat>::uninit();
        // SAFETY: `fd` is valid and `stat` is a valid out-pointer.
        let rc = unsafe { libc::fstat(fd, stat.as_mut_ptr()) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: fd is valid and unused after this error path.
            unsafe { libc::close(fd) };
            return Err(DataBlockError::MapFailed(err));
        }
        // SAFETY: fstat succeeded, so the struct is initialized.
        let size = unsafe { stat.assume_init() }.st_size as usize;

        let ptr = Self::map(fd, size);
        // SAFETY: the mapping (when it succeeded) holds its own reference.
        unsafe { libc::close(fd) };

        let Some(ptr) = ptr else {
            return Err(DataBlockError::MapFailed(io::Error::last_os_error()));
        };

        Ok(Self {
            ptr,
            size,
            name: name.to_string(),
        })
    }

    fn map(fd: i32, size: usize) -> Option<*mut u8> {
        // SAFETY: fd is a valid shm descriptor of at least `size` bytes;
        // MAP_SHARED makes writes visible across processes; the kernel picks
        // the address.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            None
        } else {
            Some(ptr as *mut u8)
        }
    }

    /// Remove a segment name. Idempotent: a missing name is not an error.
    pub fn unlink(name: &str) -> Result<()> {
        let cname = c_name(name)?;
        // SAFETY: unlink only touches the namespace entry; live mappings
        // survive until their owners unmap.
        let rc = unsafe { libc::shm_unlink(cname.as_ptr()) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOENT) {
                return Err(DataBlockError::MapFailed(err));
            }
        }
        Ok(())
    }

    /// Check whether a segment with this name exists.
    #[must_use]
    pub fn exists(name: &str) -> bool {
        let Ok(cname) = CString::new(name) else {
            return false;
        };
        // SAFETY: read-only open for an existence probe.
        let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDONLY, 0) };
        if fd >= 0 {
            // SAFETY: fd is valid and closed exactly once.
            unsafe { libc::close(fd) };
            true
        } else {
            false
        }
    }

    /// Base pointer of the mapping.
    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Size of the mapping in bytes.
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Segment name (POSIX form, leading `/`).
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        // SAFETY: `ptr`/`size` describe exactly the region returned by mmap,
        // and Drop runs once.
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name() -> String {
        use std::time::{SystemTime, UNIX_EPOCH};
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("/labhub_segtest_{ts}")
    }

    #[test]
    fn test_create_open_roundtrip() {
        let name = unique_name();
        let seg = ShmSegment::create(&name, 8192).expect("create");
        assert_eq!(seg.size(), 8192);

        // SAFETY: offsets 0 and 4095 lie inside the 8192-byte mapping.
        unsafe {
            *seg.as_ptr() = 0xAB;
            *seg.as_ptr().add(4095) = 0xCD;
        }

        let other = ShmSegment::open(&name).expect("open");
        assert_eq!(other.size(), 8192);
        // SAFETY: same mapping as above, observed through a second handle.
        unsafe {
            assert_eq!(*other.as_ptr(), 0xAB);
            assert_eq!(*other.as_ptr().add(4095), 0xCD);
        }

        ShmSegment::unlink(&name).ok();
    }

    #[test]
    fn test_create_twice_is_name_conflict() {
        let name = unique_name();
        let _seg = ShmSegment::create(&name, 4096).expect("create");
        let again = ShmSegment::create(&name, 4096);
        assert!(matches!(again, Err(DataBlockError::NameConflict(_))));
        ShmSegment::unlink(&name).ok();
    }

    #[test]
    fn test_open_missing_is_not_found() {
        let result = ShmSegment::open("/labhub_segtest_missing_0");
        assert!(matches!(result, Err(DataBlockError::NotFound(_))));
    }

    #[test]
    fn test_open_sizes_from_segment() {
        let name = unique_name();
        let _seg = ShmSegment::create(&name, 12288).expect("create");
        let opened = ShmSegment::open(&name).expect("open");
        assert_eq!(opened.size(), 12288);
        ShmSegment::unlink(&name).ok();
    }

    #[test]
    fn test_unlink_idempotent() {
        let name = unique_name();
        let _seg = ShmSegment::create(&name, 4096).expect("create");
        assert!(ShmSegment::unlink(&name).is_ok());
        assert!(ShmSegment::unlink(&name).is_ok());
    }

    #[test]
    fn test_exists() {
        let name = unique_name();
        assert!(!ShmSegment::exists(&name));
        let _seg = ShmSegment::create(&name, 4096).expect("create");
        assert!(ShmSegment::exists(&name));
        ShmSegment::unlink(&name).ok();
        assert!(!ShmSegment::exists(&name));
    }
}
