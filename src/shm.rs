// Copyright 2025 xsnap Authors
// SPDX-License-Identifier: Apache-2.0

//! Scoped POSIX shared memory segments
//!
//! A segment is created under an exclusive name, sized, mapped, and
//! unlinked before the constructor returns, so it is never discoverable by
//! other processes. Dropping the segment unmaps it and then closes the fd,
//! which releases the kernel object.

use std::ffi::CString;
use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};

static SEGMENT_SEQ: AtomicU32 = AtomicU32::new(0);

/// A mapped, unnamed shared memory segment.
///
/// The fd stays open for the segment's lifetime so it can be duplicated
/// and handed to the X server.
pub struct ShmSegment {
    fd: OwnedFd,
    addr: *mut u8,
    size: usize,
}

// The mapping is only reached through &self/&mut self.
unsafe impl Send for ShmSegment {}

impl ShmSegment {
    /// Create, size, and map a fresh segment of `size` bytes.
    pub fn new(size: usize) -> io::Result<Self> {
        if size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "zero-sized segment",
            ));
        }

        let name = format!(
            "/xsnap-{}-{}",
            std::process::id(),
            SEGMENT_SEQ.fetch_add(1, Ordering::Relaxed)
        );
        let c_name = CString::new(name)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;

        let raw = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_RDWR | libc::O_EXCL,
                0o600,
            )
        };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        // Closed on every early return below.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        if unsafe { libc::ftruncate(fd.as_raw_fd(), size as libc::off_t) } < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
            return Err(err);
        }

        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
            return Err(err);
        }

        // Unlink right away: the mapping and the fd keep the object alive,
        // and the name never becomes visible to other processes.
        unsafe { libc::shm_unlink(c_name.as_ptr()) };

        Ok(Self {
            fd,
            addr: addr as *mut u8,
            size,
        })
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.addr, self.size) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.addr, self.size) }
    }

    /// Duplicate the fd for handing to the X server, which takes ownership
    /// of its copy.
    pub fn dup_fd(&self) -> io::Result<OwnedFd> {
        self.fd.try_clone()
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.addr as *mut libc::c_void, self.size);
        }
        // The fd closes after the unmap.
    }
}

impl fmt::Debug for ShmSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShmSegment")
            .field("fd", &self.fd.as_raw_fd())
            .field("size", &self.size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_write_read() {
        let mut seg = ShmSegment::new(4096).unwrap();
        assert_eq!(seg.len(), 4096);
        seg.as_mut_slice()[..4].copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(&seg.as_slice()[..4], &[1, 2, 3, 4]);
        assert!(seg.as_slice()[4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn segment_rejects_zero_size() {
        assert!(ShmSegment::new(0).is_err());
    }

    #[test]
    fn segment_is_unnamed() {
        let seg = ShmSegment::new(64).unwrap();
        let fd = seg.dup_fd().unwrap();
        let link = std::fs::read_link(format!("/proc/self/fd/{}", fd.as_raw_fd())).unwrap();
        let target = link.to_string_lossy().into_owned();
        assert!(target.contains("(deleted)"), "segment still linked: {}", target);
        let path = target.trim_end_matches(" (deleted)");
        assert!(!std::path::Path::new(path).exists());
    }
}
