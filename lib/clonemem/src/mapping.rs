// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Process-private anonymous memory mappings.

use std::io::{Error, ErrorKind, Result};
use std::ptr::NonNull;

use crate::common::{round_up, PAGE_SIZE};

/// An anonymous, private, read/write mapping in the process address space.
///
/// The mapping is released when the structure is dropped.  Access to the
/// contents goes through raw pointers handed out by the owner, which is
/// responsible for upholding aliasing rules over the regions it hands out.
#[derive(Debug)]
pub(crate) struct AnonMapping {
    ptr: NonNull<u8>,
    len: usize,
}

impl AnonMapping {
    /// Map `len` bytes, rounded up to the page size.
    pub(crate) fn new(len: usize) -> Result<Self> {
        let len = round_up(len, PAGE_SIZE)
            .filter(|l| *l != 0)
            .ok_or_else(|| {
                Error::new(ErrorKind::InvalidInput, "invalid mapping length")
            })?;

        // Safety: with a NULL `addr` the OS picks a location which does not
        // conflict with any existing mapping.
        let ptr = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Error::last_os_error());
        }
        let ptr = NonNull::new(ptr as *mut u8)
            .expect("mmap() result should be non-NULL");

        Ok(Self { ptr, len })
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Discard the physical backing of `[offset, offset + len)`.  The range
    /// stays mapped and reads back as zeroes.
    pub(crate) fn discard(&self, offset: usize, len: usize) -> Result<()> {
        discard_range(self.ptr, self.len, offset, len, libc::MADV_DONTNEED)
    }
}

impl Drop for AnonMapping {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

// Safety: `AnonMapping` does not create references to its contents; owners
// hand out disjoint regions.
unsafe impl Send for AnonMapping {}
unsafe impl Sync for AnonMapping {}

/// Apply a discarding `advice` to a page-aligned subrange of a mapping.
pub(crate) fn discard_range(
    base: NonNull<u8>,
    map_len: usize,
    offset: usize,
    len: usize,
    advice: libc::c_int,
) -> Result<()> {
    let end = offset.checked_add(len).ok_or(ErrorKind::InvalidInput)?;
    if offset % PAGE_SIZE != 0 || len % PAGE_SIZE != 0 || end > map_len {
        return Err(Error::new(
            ErrorKind::InvalidInput,
            "discard range must be page aligned and within the mapping",
        ));
    }
    if len == 0 {
        return Ok(());
    }

    // Safety: the range was checked to lie within the mapping.
    let res = unsafe {
        libc::madvise(
            base.as_ptr().add(offset) as *mut libc::c_void,
            len,
            advice,
        )
    };
    if res != 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}
