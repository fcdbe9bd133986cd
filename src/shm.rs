//! Low-level POSIX shared memory segments

use crate::error::{Error, Result};
use rustix::fd::OwnedFd;
use rustix::fs::ftruncate;
use rustix::io::Errno;
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use rustix::shm::{shm_open, shm_unlink, Mode, ShmOFlags};
use std::ffi::CString;
use std::ptr::NonNull;

/// Longest object name accepted by the shared memory namespace (`NAME_MAX`)
pub const MAX_SHM_NAME_LEN: usize = 255;

/// How a segment is mapped into this process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    ReadWrite,
}

/// Handle to a mapped shared memory segment
///
/// The mapping is released when the handle drops. The creating handle also
/// unlinks the name from the namespace.
pub struct ShmSegment {
    #[allow(dead_code)]
    fd: OwnedFd,
    addr: NonNull<u8>,
    size: usize,
    name: String,
    access: Access,
    is_owner: bool,
}

// SAFETY: the handle only holds a pointer to a process-wide mapping; all
// concurrent access to the bytes is coordinated by the layers above.
unsafe impl Send for ShmSegment {}
unsafe impl Sync for ShmSegment {}

/// Turn a caller supplied name into the `/name` form `shm_open` expects.
pub fn os_name(name: &str) -> Result<CString> {
    let bare = name.strip_prefix('/').unwrap_or(name);
    if bare.is_empty() {
        return Err(Error::InvalidArgument(
            "shared memory name is empty".to_string(),
        ));
    }
    if bare.contains('/') {
        return Err(Error::InvalidArgument(format!(
            "shared memory name '{name}' contains '/'"
        )));
    }
    if bare.len() + 1 > MAX_SHM_NAME_LEN {
        return Err(Error::InvalidArgument(format!(
            "shared memory name too long: max {} chars, got {}",
            MAX_SHM_NAME_LEN - 1,
            bare.len()
        )));
    }
    CString::new(format!("/{bare}")).map_err(|_| {
        Error::InvalidArgument(format!("shared memory name '{name}' contains NUL"))
    })
}

impl ShmSegment {
    /// Exclusively create a new segment of `size` bytes and map it read/write.
    ///
    /// Fails with [`Error::AlreadyExists`] if the name is taken. Any failure
    /// after the object was created unlinks it again before returning.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidArgument(
                "shared memory size must be non-zero".to_string(),
            ));
        }
        let c_name = os_name(name)?;

        let fd = shm_open(
            c_name.as_c_str(),
            ShmOFlags::CREATE | ShmOFlags::EXCL | ShmOFlags::RDWR,
            Mode::RUSR | Mode::WUSR | Mode::RGRP | Mode::WGRP | Mode::ROTH,
        )
        .map_err(|e| {
            if e == Errno::EXIST {
                Error::AlreadyExists {
                    name: name.to_string(),
                }
            } else {
                Error::from_os(format!("creating shared memory '{name}'"), e.into())
            }
        })?;

        // New objects are zero-filled by ftruncate.
        let mapped = ftruncate(&fd, size as u64)
            .map_err(|e| Error::from_os("sizing shared memory", e.into()))
            .and_then(|()| map(&fd, size, Access::ReadWrite));

        let addr = match mapped {
            Ok(addr) => addr,
            Err(err) => {
                let _ = shm_unlink(c_name.as_c_str());
                return Err(err);
            }
        };

        Ok(Self {
            fd,
            addr,
            size,
            name: name.to_string(),
            access: Access::ReadWrite,
            is_owner: true,
        })
    }

    /// Open and map an existing segment that must be exactly `size` bytes.
    pub fn open(name: &str, size: usize, access: Access) -> Result<Self> {
        let c_name = os_name(name)?;
        let flags = match access {
            Access::ReadOnly => ShmOFlags::RDONLY,
            Access::ReadWrite => ShmOFlags::RDWR,
        };

        let fd = shm_open(c_name.as_c_str(), flags, Mode::empty())
            .map_err(|e| Error::from_os(format!("opening shared memory '{name}'"), e.into()))?;

        let stat = rustix::fs::fstat(&fd)
            .map_err(|e| Error::from_os(format!("inspecting shared memory '{name}'"), e.into()))?;
        if stat.st_size as u64 != size as u64 {
            return Err(Error::InvalidArgument(format!(
                "shared memory '{name}' is {} bytes, expected {size}",
                stat.st_size
            )));
        }

        let addr = map(&fd, size, access)?;

        Ok(Self {
            fd,
            addr,
            size,
            name: name.to_string(),
            access,
            is_owner: false,
        })
    }

    /// Get raw pointer to the start of the mapping
    #[inline(always)]
    pub fn as_ptr(&self) -> *mut u8 {
        self.addr.as_ptr()
    }

    /// Get size of the mapping in bytes
    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Get the name the segment was created or opened with
    #[inline(always)]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline(always)]
    pub fn access(&self) -> Access {
        self.access
    }

    /// Check if this handle created (and will unlink) the segment
    #[inline(always)]
    pub fn is_owner(&self) -> bool {
        self.is_owner
    }

    /// Remove the name from the namespace now instead of on drop.
    ///
    /// Existing mappings in every process stay valid.
    pub fn unlink(&mut self) -> Result<()> {
        if !self.is_owner {
            return Err(Error::NotOwner {
                name: self.name.clone(),
            });
        }
        self.is_owner = false;
        let c_name = os_name(&self.name)?;
        shm_unlink(c_name.as_c_str())
            .map_err(|e| Error::from_os(format!("unlinking shared memory '{}'", self.name), e.into()))
    }
}

fn map(fd: &OwnedFd, size: usize, access: Access) -> Result<NonNull<u8>> {
    let prot = match access {
        Access::ReadOnly => ProtFlags::READ,
        Access::ReadWrite => ProtFlags::READ | ProtFlags::WRITE,
    };

    let addr = unsafe {
        mmap(std::ptr::null_mut(), size, prot, MapFlags::SHARED, fd, 0)
            .map_err(|e| Error::unavailable("mapping shared memory", e.into()))?
    };

    NonNull::new(addr.cast::<u8>()).ok_or_else(|| {
        Error::unavailable(
            "mapping shared memory",
            std::io::Error::new(std::io::ErrorKind::Other, "mmap returned null"),
        )
    })
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.addr.as_ptr().cast(), self.size);
        }

        if self.is_owner {
            if let Ok(c_name) = os_name(&self.name) {
                let _ = shm_unlink(c_name.as_c_str());
            }
        }
    }
}
