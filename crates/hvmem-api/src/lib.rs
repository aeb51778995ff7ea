// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fs::{File, OpenOptions};
use std::io::{Error, ErrorKind, Result};
use std::os::fd::*;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};

use num_enum::IntoPrimitive;
use uuid::Uuid;

pub use hvmem_api_sys::*;

pub const HVMEM_PATH_PREFIX: &str = "/dev/hvmem";
pub const HVMEM_CTL_PATH: &str = "/dev/hvmemctl";

pub struct HvmemCtlFd(File);
impl HvmemCtlFd {
    pub fn open() -> Result<Self> {
        let ctl = OpenOptions::new().write(true).open(HVMEM_CTL_PATH)?;
        Ok(Self(ctl))
    }

    /// Issue ioctl against open hvmemctl handle
    ///
    /// # Safety
    ///
    /// Caller is charged with providing `data` argument which is adequate for
    /// any copyin/copyout actions which may occur as part of the ioctl
    /// processing.
    pub unsafe fn ioctl<T>(&self, cmd: i32, data: *mut T) -> Result<i32> {
        ioctl(self.as_raw_fd(), cmd, data as *mut libc::c_void)
    }
    pub fn ioctl_usize(&self, cmd: i32, data: usize) -> Result<i32> {
        if !Self::ioctl_usize_safe(cmd) {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "unsafe cmd provided",
            ));
        }
        // Safety: Since we are explicitly filtering for hvmem ioctls which
        // will not assume the data argument is a pointer for copyin/copyout,
        // we can dismiss those dangers.
        unsafe { ioctl(self.as_raw_fd(), cmd, data as *mut libc::c_void) }
    }

    /// Query the API version exposed by the kernel component.
    pub fn api_version(&self) -> Result<u32> {
        cache_api_version(|| -> Result<u32> { self.query_api_version() })
    }

    fn query_api_version(&self) -> Result<u32> {
        let vers = self.ioctl_usize(ioctls::HVMEM_INTERFACE_VERSION, 0)?;

        // We expect and demand a positive version number from the
        // HVMEM_INTERFACE_VERSION interface.
        assert!(vers > 0);
        Ok(vers as u32)
    }

    /// Ask the hypervisor whether a VM with the given UUID is running.
    pub fn vm_exists(&self, uuid: &Uuid) -> Result<bool> {
        let mut req = hvmem_vm_exists {
            uuid: *uuid.as_bytes(),
            ..Default::default()
        };

        // Safety: We are using the appropriate struct for this ioctl
        unsafe { self.ioctl(ioctls::HVMEM_VM_EXISTS, &mut req) }?;

        Ok(req.exists != 0)
    }

    /// Check ioctl command against those known to not require any
    /// copyin/copyout to function.
    const fn ioctl_usize_safe(cmd: i32) -> bool {
        matches!(cmd, ioctls::HVMEM_INTERFACE_VERSION,)
    }
}

impl AsRawFd for HvmemCtlFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

/// Handle to the memory device of a single VM, `/dev/hvmem/{uuid}`.
pub struct HvmemFd(File);
impl HvmemFd {
    pub fn open(vm: &Uuid) -> Result<Self> {
        Self::open_in(Path::new(HVMEM_PATH_PREFIX), vm)
    }

    /// Open the device node for `vm` under an alternate device directory.
    pub fn open_in(dir: &Path, vm: &Uuid) -> Result<Self> {
        let mut path = dir.to_path_buf();
        path.push(vm.hyphenated().to_string());

        let fp = OpenOptions::new().write(true).read(true).open(path)?;
        Ok(Self(fp))
    }

    /// Create new instance from raw `File` resource
    ///
    /// # Safety
    ///
    /// Caller is expected to provide `File` resource which is a valid hvmem
    /// resource.  (Or alternatively, is not to make any hvmem-related ioctls,
    /// if this instance was created for unit-testing purposes.)
    pub unsafe fn new_raw(fp: File) -> Self {
        Self(fp)
    }

    /// Issue ioctl against open hvmem instance
    ///
    /// # Safety
    ///
    /// Caller is charged with providing `data` argument which is adequate for
    /// any copyin/copyout actions which may occur as part of the ioctl
    /// processing.
    pub unsafe fn ioctl<T>(&self, cmd: i32, data: *mut T) -> Result<i32> {
        ioctl(self.as_raw_fd(), cmd, data as *mut libc::c_void)
    }

    pub fn ioctl_usize(&self, cmd: i32, data: usize) -> Result<i32> {
        if !Self::ioctl_usize_safe(cmd) {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "unsafe cmd provided",
            ));
        }
        // Safety: see HvmemCtlFd::ioctl_usize
        unsafe { ioctl(self.as_raw_fd(), cmd, data as *mut libc::c_void) }
    }

    /// Capture the frames described by `infos` into `buf`.
    ///
    /// Returns the number of leading entries of `infos` which the device
    /// fulfilled.  Each fulfilled entry has its `type_` and `offset` fields
    /// set to describe where in `buf` the page contents were placed.
    pub fn capture(
        &self,
        infos: &mut [hvmem_gpfn_info],
        buf: &mut [u8],
    ) -> Result<usize> {
        if infos.len() > HVMEM_MAX_BATCH {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "capture batch exceeds HVMEM_MAX_BATCH",
            ));
        }
        let mut req = hvmem_capture {
            nr_gpfns: infos.len() as u32,
            nr_done: 0,
            gpfn_info_list: infos.as_mut_ptr(),
            buffer: buf.as_mut_ptr(),
            buffer_size: buf.len(),
        };

        // Safety: `infos` and `buf` are exclusively borrowed for the duration
        // of the call, and their lengths are conveyed to the device.
        unsafe { self.ioctl(ioctls::HVMEM_CAPTURE, &mut req) }?;

        Ok(req.nr_done as usize)
    }

    /// Populate the VM physmap at `gpfns` with consecutive pages from `buf`.
    pub fn populate(&self, gpfns: &[u64], buf: &[u8]) -> Result<()> {
        if gpfns.len() > HVMEM_MAX_BATCH {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "populate batch exceeds HVMEM_MAX_BATCH",
            ));
        }
        if buf.len() < gpfns.len() * HVMEM_PAGE_SIZE {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "populate buffer shorter than batch",
            ));
        }
        let mut req = hvmem_populate {
            nr_gpfns: gpfns.len() as u32,
            _pad: 0,
            gpfn_list: gpfns.as_ptr(),
            buffer: buf.as_ptr(),
            buffer_size: buf.len(),
        };

        // Safety: the device only reads through the supplied pointers, and
        // their lengths are conveyed to the device.
        unsafe { self.ioctl(ioctls::HVMEM_POPULATE, &mut req) }?;
        Ok(())
    }

    /// Free every frame still owned privately by the VM.
    pub fn release_all(&self) -> Result<()> {
        self.ioctl_usize(ioctls::HVMEM_RELEASE_ALL, 0)?;
        Ok(())
    }

    /// Check ioctl command against those known to not require any
    /// copyin/copyout to function.
    const fn ioctl_usize_safe(cmd: i32) -> bool {
        matches!(cmd, ioctls::HVMEM_RELEASE_ALL)
    }
}

impl AsRawFd for HvmemFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

/// Store a cached copy of the queried API version.  Negative values indicate an
/// error occurred during query (and hold the corresponding negated `errno`).
/// A positive value indicates the cached version, and should be less than
/// `u32::MAX`.  A value of 0 indicates that no query has been performed yet.
static VERSION_CACHE: AtomicI64 = AtomicI64::new(0);

/// Query the API version from the kernel component on the system.
///
/// Caches said version (or any emitted error) for later calls.
pub fn api_version() -> Result<u32> {
    cache_api_version(|| -> Result<u32> {
        let ctl = HvmemCtlFd::open()?;
        let vers = ctl.query_api_version()?;
        Ok(vers)
    })
}

fn cache_api_version(do_query: impl FnOnce() -> Result<u32>) -> Result<u32> {
    if VERSION_CACHE.load(Ordering::Acquire) == 0 {
        let newval = match do_query() {
            Ok(x) => x as i64,
            Err(e) => -(e.raw_os_error().unwrap_or(libc::ENOENT) as i64),
        };
        let _ = VERSION_CACHE.compare_exchange(
            0,
            newval,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
    }

    match VERSION_CACHE.load(Ordering::Acquire) {
        0 => {
            panic!("expected VERSION_CACHE to be initialized")
        }
        x if x < 0 => Err(Error::from_raw_os_error(-x as i32)),
        y => {
            assert!(y < u32::MAX as i64);

            Ok(y as u32)
        }
    }
}

#[cfg(target_os = "linux")]
unsafe fn ioctl(fd: RawFd, cmd: i32, data: *mut libc::c_void) -> Result<i32> {
    match libc::ioctl(fd, cmd as _, data) {
        -1 => Err(Error::last_os_error()),
        other => Ok(other),
    }
}

#[cfg(not(target_os = "linux"))]
unsafe fn ioctl(
    _fd: RawFd,
    _cmd: i32,
    _data: *mut libc::c_void,
) -> Result<i32> {
    Err(Error::new(ErrorKind::Other, "linux required"))
}

/// Convenience constants to provide some documentation on what changes have
/// been introduced in the various hvmem API versions.
#[repr(u32)]
#[derive(IntoPrimitive)]
pub enum ApiVersion {
    /// Captured pages may be returned LZ4 compressed
    V3 = 3,

    /// Adds HVMEM_RELEASE_ALL for bulk teardown of VM-owned frames
    V2 = 2,

    /// Initial capture/populate interface
    V1 = 1,
}
impl ApiVersion {
    pub const fn current() -> Self {
        Self::V3
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn latest_api_version() {
        let cur = ApiVersion::current();
        assert_eq!(HVMEM_CURRENT_INTERFACE_VERSION, cur.into());
    }

    #[test]
    fn oversized_batches_rejected() {
        let fp = tempfile::tempfile().unwrap();
        let hdl = unsafe { HvmemFd::new_raw(fp) };

        let mut infos = vec![hvmem_gpfn_info::default(); HVMEM_MAX_BATCH + 1];
        let mut buf = vec![0u8; HVMEM_PAGE_SIZE];
        let err = hdl.capture(&mut infos, &mut buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);

        let gpfns = vec![0u64; HVMEM_MAX_BATCH + 1];
        let err = hdl.populate(&gpfns, &buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn short_populate_buffer_rejected() {
        let fp = tempfile::tempfile().unwrap();
        let hdl = unsafe { HvmemFd::new_raw(fp) };

        let buf = vec![0u8; HVMEM_PAGE_SIZE];
        let err = hdl.populate(&[1, 2], &buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }
}
