// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Named POSIX shared memory objects, mapped into the process.
//!
//! Every object starts with a header page holding the number of live
//! attachments across all processes.  The name is removed by whichever
//! holder drops the count to zero, so a process which created an object may
//! exit while peers keep using it, and later openers still find the same
//! object.  The last holder marks the count [`DEAD`] before unlinking; an
//! opener which finds a dead object waits for the name to go away and
//! creates a fresh one.

use std::ffi::CString;
use std::io::{Error, ErrorKind, Result};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::common::{round_up, PAGE_SIZE};

/// Size of the header ahead of the caller-visible contents.
const HDR_SIZE: usize = PAGE_SIZE;

/// Attachment count of an object whose last holder is removing it.
const DEAD: u32 = u32::MAX;

/// Bound on waiting for a peer to finish creating (or removing) an object.
const OPEN_RETRIES: u32 = 200;
const OPEN_BACKOFF: Duration = Duration::from_millis(1);

/// A named shared memory object, mapped read/write and `MAP_SHARED` so that
/// cooperating processes observe each other's stores.
#[derive(Debug)]
pub(crate) struct ShmObject {
    name: CString,
    fd: OwnedFd,
    base: NonNull<u8>,
    map_len: usize,
    len: usize,
    created: bool,
    released: bool,
}

impl ShmObject {
    /// Create the object called `name`, or attach to it if it already exists.
    ///
    /// A freshly created object is sized to `len` (rounded up to the page
    /// size) and reads back as zeroes.  An existing object is mapped as-is;
    /// its contents are left untouched, and it must be at least `len` bytes.
    pub(crate) fn create_or_attach(name: &str, len: usize) -> Result<Self> {
        let len = round_up(len, PAGE_SIZE)
            .filter(|l| *l != 0)
            .and_then(|l| l.checked_add(HDR_SIZE).map(|_| l))
            .ok_or_else(|| {
                Error::new(ErrorKind::InvalidInput, "invalid object length")
            })?;
        let name = CString::new(name).map_err(|_| {
            Error::new(ErrorKind::InvalidInput, "object name contains NUL")
        })?;

        for _ in 0..OPEN_RETRIES {
            if let Some(obj) = Self::try_open(&name, len)? {
                return Ok(obj);
            }
            std::thread::sleep(OPEN_BACKOFF);
        }
        Err(Error::new(
            ErrorKind::TimedOut,
            format!("object {name:?} did not become ready"),
        ))
    }

    /// One attempt at opening and attaching.  `None` means a peer is midway
    /// through creating or removing the object, and the caller should retry.
    fn try_open(name: &CString, len: usize) -> Result<Option<Self>> {
        let map_len = len + HDR_SIZE;

        let (fd, created) = match shm_open(
            name,
            libc::O_RDWR | libc::O_CREAT | libc::O_EXCL | libc::O_CLOEXEC,
        ) {
            Ok(fd) => (fd, true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                match shm_open(name, libc::O_RDWR | libc::O_CLOEXEC) {
                    Ok(fd) => (fd, false),
                    Err(e) if e.kind() == ErrorKind::NotFound => {
                        return Ok(None)
                    }
                    Err(e) => return Err(e),
                }
            }
            Err(e) => return Err(e),
        };

        if created {
            if let Err(e) = ftruncate(&fd, map_len) {
                unsafe { libc::shm_unlink(name.as_ptr()) };
                return Err(e);
            }
        } else {
            match fstat_size(&fd)? {
                // The creator has not sized it yet
                0 => return Ok(None),
                existing if existing < map_len => {
                    return Err(Error::new(
                        ErrorKind::InvalidData,
                        format!(
                            "existing object {name:?} holds {} bytes, \
                            {len} required",
                            existing.saturating_sub(HDR_SIZE)
                        ),
                    ));
                }
                _ => {}
            }
        }

        // Safety: with a NULL `addr` the OS picks a location which does not
        // conflict with other resources.  The object was checked to be at
        // least `map_len` bytes long.
        let ptr = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            let e = Error::last_os_error();
            if created {
                unsafe { libc::shm_unlink(name.as_ptr()) };
            }
            return Err(e);
        }
        let base = NonNull::new(ptr as *mut u8)
            .expect("mmap() result should be non-NULL");

        let mut obj = Self {
            name: name.clone(),
            fd,
            base,
            map_len,
            len,
            created,
            released: false,
        };
        let attached = obj.attachments().fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |n| (n != DEAD).then(|| n + 1),
        );
        if attached.is_err() {
            // Its last holder is unlinking it; unmap and try again
            obj.released = true;
            return Ok(None);
        }
        Ok(Some(obj))
    }

    fn attachments(&self) -> &AtomicU32 {
        // Safety: the header page is part of the mapping, page aligned, and
        // its first word is only ever accessed atomically.
        unsafe { &*(self.base.as_ptr() as *const AtomicU32) }
    }

    /// Start of the caller-visible contents.
    pub(crate) fn as_ptr(&self) -> NonNull<u8> {
        // Safety: the mapping extends `len` bytes past the header.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(HDR_SIZE)) }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Whether this process created the object (as opposed to attaching).
    pub(crate) fn created(&self) -> bool {
        self.created
    }

    pub(crate) fn name(&self) -> &str {
        self.name.to_str().expect("object name was built from a &str")
    }

    /// Duplicate the underlying descriptor, for handing to a peer process.
    pub(crate) fn dup_fd(&self) -> Result<OwnedFd> {
        self.fd.try_clone()
    }

    /// Detach from the object, removing its name if this was the last
    /// attachment.  Returns whether the name was removed.
    pub(crate) fn close(mut self) -> Result<bool> {
        self.detach()
    }

    fn detach(&mut self) -> Result<bool> {
        if self.released {
            return Ok(false);
        }
        self.released = true;

        let prev = self.attachments().fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |n| match n {
                0 | DEAD => None,
                1 => Some(DEAD),
                n => Some(n - 1),
            },
        );
        match prev {
            Ok(1) => {
                if unsafe { libc::shm_unlink(self.name.as_ptr()) } != 0 {
                    return Err(Error::last_os_error());
                }
                Ok(true)
            }
            Ok(_) => Ok(false),
            Err(n) => Err(Error::new(
                ErrorKind::InvalidData,
                format!("object {:?} has attachment count {n:#x}", self.name),
            )),
        }
    }
}

impl Drop for ShmObject {
    fn drop(&mut self) {
        // Owners wanting to observe a failure call close() first
        let _ = self.detach();
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.map_len);
        }
    }
}

// Safety: `ShmObject` hands out its base pointer only; users of that pointer
// are responsible for serializing access (see `sync`).
unsafe impl Send for ShmObject {}
unsafe impl Sync for ShmObject {}

fn shm_open(name: &CString, flags: libc::c_int) -> Result<OwnedFd> {
    let fd = unsafe { libc::shm_open(name.as_ptr(), flags, 0o600) };
    if fd < 0 {
        return Err(Error::last_os_error());
    }
    // Safety: shm_open() returned a fresh descriptor which we now own.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn ftruncate(fd: &OwnedFd, len: usize) -> Result<()> {
    if unsafe { libc::ftruncate(fd.as_raw_fd(), len as libc::off_t) } != 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

fn fstat_size(fd: &OwnedFd) -> Result<usize> {
    let mut st = std::mem::MaybeUninit::<libc::stat>::uninit();
    if unsafe { libc::fstat(fd.as_raw_fd(), st.as_mut_ptr()) } != 0 {
        return Err(Error::last_os_error());
    }
    // Safety: fstat() succeeded, so the buffer was filled.
    let st = unsafe { st.assume_init() };
    Ok(st.st_size as usize)
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_name() -> String {
        format!("/clonemem-shm-test-{}", uuid::Uuid::new_v4())
    }

    #[test]
    fn create_then_attach() {
        let name = test_name();
        let first = ShmObject::create_or_attach(&name, 100).unwrap();
        assert!(first.created());
        assert_eq!(first.len(), PAGE_SIZE);

        unsafe { first.as_ptr().as_ptr().write(0x5a) };

        let second = ShmObject::create_or_attach(&name, PAGE_SIZE).unwrap();
        assert!(!second.created());
        assert_eq!(unsafe { second.as_ptr().as_ptr().read() }, 0x5a);

        assert!(!second.close().unwrap());
        assert!(first.close().unwrap());
    }

    #[test]
    fn attach_rejects_short_object() {
        let name = test_name();
        let first = ShmObject::create_or_attach(&name, PAGE_SIZE).unwrap();
        let res = ShmObject::create_or_attach(&name, 2 * PAGE_SIZE);
        assert_eq!(res.unwrap_err().kind(), ErrorKind::InvalidData);
        assert!(first.close().unwrap());
    }

    #[test]
    fn last_holder_removes_name() {
        let name = test_name();
        let first = ShmObject::create_or_attach(&name, PAGE_SIZE).unwrap();
        drop(first);

        let second = ShmObject::create_or_attach(&name, PAGE_SIZE).unwrap();
        assert!(second.created());
        assert!(second.close().unwrap());
    }

    #[test]
    fn creator_exit_keeps_object_for_peers() {
        let name = test_name();
        let creator = ShmObject::create_or_attach(&name, PAGE_SIZE).unwrap();
        let peer = ShmObject::create_or_attach(&name, PAGE_SIZE).unwrap();
        unsafe { peer.as_ptr().as_ptr().write(0x77) };

        assert!(!creator.close().unwrap());

        let late = ShmObject::create_or_attach(&name, PAGE_SIZE).unwrap();
        assert!(!late.created());
        assert_eq!(unsafe { late.as_ptr().as_ptr().read() }, 0x77);

        assert!(!peer.close().unwrap());
        assert!(late.close().unwrap());
    }

    #[test]
    fn attach_waits_for_creator_to_size() {
        let name = test_name();
        let cname = CString::new(name.clone()).unwrap();
        let fd = shm_open(
            &cname,
            libc::O_RDWR | libc::O_CREAT | libc::O_EXCL | libc::O_CLOEXEC,
        )
        .unwrap();

        std::thread::scope(|s| {
            s.spawn(|| {
                std::thread::sleep(Duration::from_millis(20));
                ftruncate(&fd, HDR_SIZE + PAGE_SIZE).unwrap();
            });
            let obj = ShmObject::create_or_attach(&name, PAGE_SIZE).unwrap();
            assert!(!obj.created());
            assert_eq!(obj.len(), PAGE_SIZE);
            assert!(obj.close().unwrap());
        });
    }

    #[test]
    fn dead_object_is_replaced() {
        let name = test_name();
        let dying = ShmObject::create_or_attach(&name, PAGE_SIZE).unwrap();
        // As left by a last holder between marking and unlinking
        dying.attachments().store(DEAD, Ordering::Release);

        std::thread::scope(|s| {
            s.spawn(|| {
                std::thread::sleep(Duration::from_millis(20));
                let cname = CString::new(name.clone()).unwrap();
                assert_eq!(unsafe { libc::shm_unlink(cname.as_ptr()) }, 0);
            });
            let fresh = ShmObject::create_or_attach(&name, PAGE_SIZE).unwrap();
            assert!(fresh.created());
            assert!(fresh.close().unwrap());
        });

        // Its count is already DEAD, so detaching reports the inconsistency
        assert!(dying.close().is_err());
    }
}
