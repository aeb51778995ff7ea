// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Execution backends: where guest frames actually come from and go to.

use std::io;
use std::path::Path;

use uuid::Uuid;

mod hypercall;
mod inproc;

pub use hypercall::HypercallBackend;
pub use inproc::InprocBackend;

/// Per-frame capture request, filled in by the backend with the location and
/// type of the captured contents.
pub type CaptureDesc = hvmem_api::hvmem_gpfn_info;

bitflags! {
    /// Request flags carried in [`CaptureDesc::flags`].
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct CaptureFlags: u32 {
        const VM = hvmem_api::HVMEM_GI_FLAG_VM;
        const TEMPLATE = hvmem_api::HVMEM_GI_FLAG_TEMPLATE;
        const REMOVE_PFN = hvmem_api::HVMEM_GI_FLAG_REMOVE_PFN;
    }
}

/// Page type reported by a backend in [`CaptureDesc::type_`].
pub const TYPE_NORMAL: u32 = hvmem_api::HVMEM_GI_TYPE_NORMAL;
pub const TYPE_MASK: u32 = hvmem_api::HVMEM_GI_TYPE_MASK;
pub const TYPE_COMPRESSED: u32 = hvmem_api::HVMEM_GI_TYPE_COMPRESSED;

/// Interface to the hypervisor facility owning guest memory.
#[cfg_attr(test, mockall::automock)]
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Capture the frames described by `descs` into `buf`.
    ///
    /// Returns how many leading descriptors were fulfilled; for each of those
    /// `type_` and `offset` describe the contents placed in `buf`.
    fn capture_batch(
        &self,
        descs: &mut [CaptureDesc],
        buf: &mut [u8],
    ) -> io::Result<usize>;

    /// Back each of `gfns` with the consecutive pages of `buf`.
    fn populate_batch(&self, gfns: &[u64], buf: &[u8]) -> io::Result<()>;

    fn vm_exists(&self, uuid: &Uuid) -> io::Result<bool>;

    /// Captured VM frames stay mapped unless the request carries
    /// [`CaptureFlags::REMOVE_PFN`].
    fn needs_explicit_remove(&self) -> bool;

    /// Populated frames can be taken back one at a time (by capturing them
    /// with removal).  Otherwise they are only freed by [`release_all`].
    ///
    /// [`release_all`]: Backend::release_all
    fn supports_incremental_undo(&self) -> bool;

    /// Free every frame still owned privately by the VM.
    fn release_all(&self) -> io::Result<()>;
}

/// Backend selected at runtime from configuration.
pub enum ConfiguredBackend {
    Hypercall(HypercallBackend),
    Inproc(InprocBackend),
}

impl ConfiguredBackend {
    pub fn from_config(
        cfg: &clonemem_config::Backend,
        vm: &Uuid,
        log: &slog::Logger,
    ) -> io::Result<Self> {
        use clonemem_config::BackendKind;

        Ok(match cfg.kind {
            BackendKind::Hypercall => Self::Hypercall(HypercallBackend::open(
                Path::new(&cfg.device),
                vm,
                log,
            )?),
            BackendKind::Inproc => {
                let pages = usize::try_from(cfg.inproc_pages).map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "inproc_pages exceeds address space",
                    )
                })?;
                Self::Inproc(InprocBackend::new(
                    *vm,
                    pages,
                    cfg.inproc_compress,
                    log,
                )?)
            }
        })
    }

    fn inner(&self) -> &dyn Backend {
        match self {
            Self::Hypercall(be) => be,
            Self::Inproc(be) => be,
        }
    }
}

impl Backend for ConfiguredBackend {
    fn name(&self) -> &'static str {
        self.inner().name()
    }
    fn capture_batch(
        &self,
        descs: &mut [CaptureDesc],
        buf: &mut [u8],
    ) -> io::Result<usize> {
        self.inner().capture_batch(descs, buf)
    }
    fn populate_batch(&self, gfns: &[u64], buf: &[u8]) -> io::Result<()> {
        self.inner().populate_batch(gfns, buf)
    }
    fn vm_exists(&self, uuid: &Uuid) -> io::Result<bool> {
        self.inner().vm_exists(uuid)
    }
    fn needs_explicit_remove(&self) -> bool {
        self.inner().needs_explicit_remove()
    }
    fn supports_incremental_undo(&self) -> bool {
        self.inner().supports_incremental_undo()
    }
    fn release_all(&self) -> io::Result<()> {
        self.inner().release_all()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_util::test_logger;

    #[test]
    fn inproc_from_config() {
        let cfg: clonemem_config::Config = r#"
            [backend]
            kind = "inproc"
            inproc_pages = 16
            inproc_compress = true
        "#
        .parse()
        .unwrap();
        let vm = Uuid::new_v4();
        let be =
            ConfiguredBackend::from_config(&cfg.backend, &vm, &test_logger())
                .unwrap();
        assert_eq!(be.name(), "inproc");
        assert!(!be.supports_incremental_undo());
        assert!(be.vm_exists(&vm).unwrap());
        match be {
            ConfiguredBackend::Inproc(inner) => assert_eq!(inner.pages(), 16),
            _ => panic!("expected the in-process backend"),
        }
    }

    #[test]
    fn missing_device_dir() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = clonemem_config::Backend {
            device: dir.path().join("absent").display().to_string(),
            ..Default::default()
        };
        let res = ConfiguredBackend::from_config(
            &cfg,
            &Uuid::new_v4(),
            &test_logger(),
        );
        assert!(res.is_err());
    }
}
