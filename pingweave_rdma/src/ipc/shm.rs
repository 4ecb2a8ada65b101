/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! POSIX shared memory regions backing the IPC ring.

use std::ffi::CString;
use std::fs::File;
use std::num::NonZeroUsize;
use std::ptr::NonNull;

use nix::fcntl::OFlag;
use nix::sys::mman::MapFlags;
use nix::sys::mman::ProtFlags;
use nix::sys::mman::mmap;
use nix::sys::mman::munmap;
use nix::sys::mman::shm_open;
use nix::sys::mman::shm_unlink;
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;

use super::IpcError;

/// A mapped shared memory object.
///
/// The creating side owns the name and unlinks it when dropped; an attached
/// side only unmaps.
pub(crate) struct SharedMemory {
    ptr: NonNull<u8>,
    size: usize,
    name: CString,
    owner: bool,
}

// SAFETY: the mapping is process wide and is not tied to the creating thread.
// Concurrent access to its contents is coordinated by the ring's atomics.
unsafe impl Send for SharedMemory {}

impl SharedMemory {
    /// Creates the named object, or opens it if it already exists, sizes it
    /// to `size` bytes and maps it.
    pub(crate) fn create(name: &str, size: usize) -> Result<Self, IpcError> {
        let cname = to_cstring(name)?;
        let len = NonZeroUsize::new(size).ok_or_else(|| IpcError::InvalidName {
            name: name.to_string(),
            reason: "region size must be non-zero".to_string(),
        })?;

        let fd = shm_open(
            cname.as_c_str(),
            OFlag::O_CREAT | OFlag::O_RDWR,
            Mode::from_bits_truncate(0o666),
        )
        .map_err(|source| IpcError::Shm {
            name: name.to_string(),
            op: "shm_open",
            source,
        })?;

        if let Err(source) = ftruncate(&fd, size as i64) {
            let _ = shm_unlink(cname.as_c_str());
            return Err(IpcError::Shm {
                name: name.to_string(),
                op: "ftruncate",
                source,
            });
        }

        // SAFETY: the object was just sized to `size` bytes, and the mapping
        // is released in `Drop`.
        let ptr = match unsafe {
            mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &fd,
                0,
            )
        } {
            Ok(ptr) => ptr,
            Err(source) => {
                let _ = shm_unlink(cname.as_c_str());
                return Err(IpcError::Shm {
                    name: name.to_string(),
                    op: "mmap",
                    source,
                });
            }
        };

        tracing::debug!("created shared memory {} ({} bytes)", name, size);
        Ok(Self {
            ptr: ptr.cast(),
            size,
            name: cname,
            owner: true,
        })
    }

    /// Maps an existing object. Fails unless it is exactly `size` bytes.
    pub(crate) fn open(name: &str, size: usize) -> Result<Self, IpcError> {
        let cname = to_cstring(name)?;
        let len = NonZeroUsize::new(size).ok_or_else(|| IpcError::InvalidName {
            name: name.to_string(),
            reason: "region size must be non-zero".to_string(),
        })?;

        let fd = shm_open(cname.as_c_str(), OFlag::O_RDWR, Mode::empty()).map_err(|source| {
            IpcError::Shm {
                name: name.to_string(),
                op: "shm_open",
                source,
            }
        })?;

        let file = File::from(fd);
        let actual = file
            .metadata()
            .map_err(|source| IpcError::Io {
                name: name.to_string(),
                source,
            })?
            .len() as usize;
        if actual != size {
            return Err(IpcError::LayoutMismatch {
                name: name.to_string(),
                reason: format!("{} bytes, expected {}", actual, size),
            });
        }

        // SAFETY: the object is `size` bytes long, and the mapping
        // is released in `Drop`.
        let ptr = unsafe {
            mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &file,
                0,
            )
        }
        .map_err(|source| IpcError::Shm {
            name: name.to_string(),
            op: "mmap",
            source,
        })?;

        Ok(Self {
            ptr: ptr.cast(),
            size,
            name: cname,
            owner: false,
        })
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        // SAFETY: `ptr` and `size` describe the mapping created in the
        // constructor, which nothing else unmaps.
        unsafe {
            if let Err(e) = munmap(self.ptr.cast(), self.size) {
                tracing::error!("failed to unmap {:?}: {}", self.name, e);
            }
        }
        if self.owner {
            if let Err(e) = shm_unlink(self.name.as_c_str()) {
                tracing::error!("failed to unlink {:?}: {}", self.name, e);
            }
        }
    }
}

fn to_cstring(name: &str) -> Result<CString, IpcError> {
    let invalid = |reason: &str| IpcError::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    };
    if !name.starts_with('/') || name.len() < 2 {
        return Err(invalid("name must be '/' followed by at least one character"));
    }
    if name[1..].contains('/') {
        return Err(invalid("name must not contain '/' after the leading one"));
    }
    CString::new(name).map_err(|_| invalid("name contains a NUL byte"))
}
