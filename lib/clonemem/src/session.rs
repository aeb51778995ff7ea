// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ownership of all engine resources for one save or restore operation.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use slog::{error, info};
use uuid::Uuid;

use crate::backend::Backend;
use crate::common::{Gfn, TRANSPORT_SIZE};
use crate::context::{Removal, ThreadContext, UndoOutcome};
use crate::heap::Heap;
use crate::section::{SectionInfo, SectionKind, SectionManager};
use crate::sync::{CancelSignal, Cancelled, Domain, DomainGuard, SyncLayer};
use crate::Error;

/// Identity and control handed to a session by the migration orchestrator.
#[derive(Clone, Debug)]
pub struct SaveContext {
    pub cancel: CancelSignal,
    pub vm: Uuid,
    pub template: Uuid,
    /// Prefix of the cross-process mutex names.
    pub engine_id: String,
}

impl SaveContext {
    pub fn new(vm: Uuid, template: Uuid, engine_id: impl Into<String>) -> Self {
        Self {
            cancel: CancelSignal::new(),
            vm,
            template,
            engine_id: engine_id.into(),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SessionOpts {
    /// Number of worker threads, each with its own context.
    pub threads: usize,
    /// Extra heap capacity beyond the per-thread transport buffers.
    pub heap_slack: usize,
    /// Default removal policy for captures.
    pub removal: Removal,
}

impl Default for SessionOpts {
    fn default() -> Self {
        Self { threads: 1, heap_slack: 0, removal: Removal::Release }
    }
}

impl From<&clonemem_config::Engine> for SessionOpts {
    fn from(cfg: &clonemem_config::Engine) -> Self {
        Self {
            threads: cfg.threads,
            removal: if cfg.remove_captured {
                Removal::Release
            } else {
                Removal::Retain
            },
            ..Default::default()
        }
    }
}

/// Session state shared by all worker threads.
///
/// Field order is drop order: mutexes go before the sections they guard.
pub struct SessionShared {
    sync: SyncLayer,
    sections: SectionManager,
    save: SaveContext,
}

impl SessionShared {
    pub fn lock(&self, domain: Domain) -> Result<DomainGuard<'_>, Cancelled> {
        self.sync.lock(domain)
    }

    pub fn sections(&self) -> &SectionManager {
        &self.sections
    }

    pub fn save_context(&self) -> &SaveContext {
        &self.save
    }

    pub fn cancel(&self) {
        self.save.cancel.fire();
    }

    pub fn is_cancelled(&self) -> bool {
        self.save.cancel.is_fired()
    }
}

pub struct Session<B: Backend> {
    log: slog::Logger,
    backend: Arc<B>,
    threads: Vec<ThreadContext<B>>,
    shared: Option<SessionShared>,
    heap: Option<Heap>,
    bulk_release: Arc<AtomicBool>,
}

impl<B: Backend> Session<B> {
    pub fn new(
        opts: SessionOpts,
        backend: Arc<B>,
        save: SaveContext,
        log: &slog::Logger,
    ) -> Result<Self, Error> {
        let log = log.new(slog::o!(
            "component" => "session",
            "vm" => save.vm.to_string(),
            "backend" => backend.name(),
        ));
        if opts.threads == 0 {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "session requires at least one thread",
            )));
        }

        let capacity = opts
            .threads
            .checked_mul(TRANSPORT_SIZE)
            .and_then(|sz| sz.checked_add(opts.heap_slack))
            .ok_or(Error::OutOfMemory("session heap"))?;
        let heap = Heap::new(capacity, &log)?;

        let bulk_release = Arc::new(AtomicBool::new(false));
        let threads = (0..opts.threads)
            .map(|id| {
                ThreadContext::new(
                    id,
                    backend.clone(),
                    &heap,
                    opts.removal,
                    bulk_release.clone(),
                    &log,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        let sync = SyncLayer::new(&save.engine_id, &save.cancel, &log)?;
        let sections = SectionManager::new(save.template, &log);

        info!(log, "session initialized";
            "threads" => opts.threads,
            "heap_bytes" => heap.capacity(),
        );
        Ok(Self {
            log,
            backend,
            threads,
            shared: Some(SessionShared { sync, sections, save }),
            heap: Some(heap),
            bulk_release,
        })
    }

    fn shared(&self) -> &SessionShared {
        self.shared
            .as_ref()
            .expect("session state is present until teardown")
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    pub fn context(
        &mut self,
        tid: usize,
    ) -> Result<&mut ThreadContext<B>, Error> {
        self.threads.get_mut(tid).ok_or(Error::NoSuchThread(tid))
    }

    /// Shared state alongside every thread context, for handing each
    /// context to its own worker.
    pub fn split(&mut self) -> (&SessionShared, &mut [ThreadContext<B>]) {
        let shared = self
            .shared
            .as_ref()
            .expect("session state is present until teardown");
        (shared, &mut self.threads)
    }

    pub fn sections(&self) -> &SectionManager {
        self.shared().sections()
    }

    /// Open the three shared sections with the configured sizes, pinning the
    /// working buffer if asked to.
    pub fn open_sections(
        &self,
        cfg: &clonemem_config::Sections,
    ) -> Result<Vec<SectionInfo>, Error> {
        let size = |bytes: u64| {
            usize::try_from(bytes).map_err(|_| {
                Error::Io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "section size exceeds address space",
                ))
            })
        };
        let sections = self.sections();
        let infos = vec![
            sections.open_section(SectionKind::Index0, size(cfg.index0_size)?)?,
            sections.open_section(SectionKind::Index1, size(cfg.index1_size)?)?,
            sections.open_section(SectionKind::Pin, size(cfg.pin_size)?)?,
        ];
        if cfg.pin {
            sections.pin_section(SectionKind::Pin, size(cfg.pin_size)?)?;
        }
        Ok(infos)
    }

    pub fn lock(&self, domain: Domain) -> Result<DomainGuard<'_>, Cancelled> {
        self.shared().lock(domain)
    }

    pub fn cancel(&self) {
        info!(self.log, "cancellation requested");
        self.shared().cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared().is_cancelled()
    }

    pub fn save_context(&self) -> &SaveContext {
        self.shared().save_context()
    }

    pub fn vm_exists(&self, uuid: &Uuid) -> io::Result<bool> {
        self.backend.vm_exists(uuid)
    }

    pub fn capture(
        &mut self,
        tid: usize,
        frames: &[Gfn],
        out: &mut [u8],
    ) -> Result<usize, Error> {
        self.context(tid)?.capture(frames, out)
    }

    pub fn get_buffer(
        &mut self,
        tid: usize,
    ) -> Result<(&mut [u8], usize), Error> {
        Ok(self.context(tid)?.buffer())
    }

    pub fn populate(&mut self, tid: usize, frames: &[u64]) -> io::Result<()> {
        self.context(tid)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?
            .populate(frames)
    }

    pub fn undo(&mut self, tid: usize) -> Result<UndoOutcome, Error> {
        self.context(tid)?.undo()
    }

    /// Undo the populated frames of every context.
    pub fn undo_all(&mut self) -> Result<Vec<UndoOutcome>, Error> {
        self.threads.iter_mut().map(ThreadContext::undo).collect()
    }

    /// Release every resource held by the session.
    ///
    /// Dropping the session does the same, but can only log a failure of
    /// the final bulk release.
    pub fn teardown(mut self) -> Result<(), Error> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<(), Error> {
        let Some(shared) = self.shared.take() else {
            return Ok(());
        };

        self.threads.clear();
        drop(shared);

        let res = if self.bulk_release.load(Ordering::Acquire) {
            info!(self.log, "releasing VM frames in bulk");
            self.backend.release_all().map_err(Error::from)
        } else {
            Ok(())
        };

        drop(self.heap.take());
        info!(self.log, "session torn down");
        res
    }
}

impl<B: Backend> Drop for Session<B> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!(self.log, "session teardown failed"; "error" => %e);
        }
    }
}
