// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::io::{Error, ErrorKind, Result};
use std::path::Path;

use hvmem_api::{ApiVersion, HvmemCtlFd, HvmemFd};
use slog::info;
use uuid::Uuid;

use super::{Backend, CaptureDesc};

/// Backend issuing capture/populate requests to the hypervisor memory device.
pub struct HypercallBackend {
    hdl: HvmemFd,
    log: slog::Logger,
}

impl HypercallBackend {
    /// Attach to the memory device of `vm` under `dev_dir`.
    pub fn open(dev_dir: &Path, vm: &Uuid, log: &slog::Logger) -> Result<Self> {
        let log = log.new(slog::o!(
            "backend" => "hypercall",
            "vm" => vm.to_string(),
        ));

        let vers = hvmem_api::api_version()?;
        let required: u32 = ApiVersion::V2.into();
        if vers < required {
            return Err(Error::new(
                ErrorKind::Unsupported,
                format!("hvmem API v{vers} lacks bulk release"),
            ));
        }
        let hdl = HvmemFd::open_in(dev_dir, vm)?;
        info!(log, "attached to hvmem device"; "api_version" => vers);

        Ok(Self { hdl, log })
    }

    /// Wrap an already-open device handle.
    pub fn from_handle(hdl: HvmemFd, log: &slog::Logger) -> Self {
        Self { hdl, log: log.new(slog::o!("backend" => "hypercall")) }
    }
}

impl Backend for HypercallBackend {
    fn name(&self) -> &'static str {
        "hypercall"
    }

    fn capture_batch(
        &self,
        descs: &mut [CaptureDesc],
        buf: &mut [u8],
    ) -> Result<usize> {
        self.hdl.capture(descs, buf)
    }

    fn populate_batch(&self, gfns: &[u64], buf: &[u8]) -> Result<()> {
        self.hdl.populate(gfns, buf)
    }

    fn vm_exists(&self, uuid: &Uuid) -> Result<bool> {
        HvmemCtlFd::open()?.vm_exists(uuid)
    }

    fn needs_explicit_remove(&self) -> bool {
        true
    }

    fn supports_incremental_undo(&self) -> bool {
        true
    }

    fn release_all(&self) -> Result<()> {
        info!(self.log, "releasing all VM-owned frames");
        self.hdl.release_all()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_util::test_logger;

    #[test]
    fn capabilities() {
        let fp = tempfile::tempfile().unwrap();
        let be = HypercallBackend::from_handle(
            unsafe { HvmemFd::new_raw(fp) },
            &test_logger(),
        );
        assert_eq!(be.name(), "hypercall");
        assert!(be.needs_explicit_remove());
        assert!(be.supports_incremental_undo());
    }

    #[test]
    fn device_errors_surface() {
        let fp = tempfile::tempfile().unwrap();
        let be = HypercallBackend::from_handle(
            unsafe { HvmemFd::new_raw(fp) },
            &test_logger(),
        );
        // A plain file does not implement the device ioctls
        let mut descs = [CaptureDesc::default(); 1];
        let mut buf = vec![0u8; crate::PAGE_SIZE];
        assert!(be.capture_batch(&mut descs, &mut buf).is_err());
        assert!(be.populate_batch(&[0], &buf).is_err());
    }
}
