// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Named shared memory sections.
//!
//! Cooperating engine processes working against the same template share
//! three sections: two index sections and a working buffer which can be
//! pinned resident.  Sections are named after the template they belong to,
//! so the first process to open a kind creates it and later processes attach
//! to the existing contents.  The name stays in place until the last process
//! holding the section closes it, whichever process that is.

use std::collections::BTreeMap;
use std::io;
use std::os::fd::OwnedFd;
use std::sync::Mutex;

use slog::{debug, info, warn};
use uuid::Uuid;

use crate::common::{round_up, PAGE_SIZE};
use crate::mapping::discard_range;
use crate::shm::ShmObject;
use crate::sync::{Domain, DomainGuard};
use crate::Error;

#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    strum::Display,
    strum::IntoStaticStr,
    strum::EnumIter,
)]
#[strum(serialize_all = "lowercase")]
pub enum SectionKind {
    Index0,
    Index1,
    Pin,
}

impl SectionKind {
    /// Name of the shared memory object backing this kind for `template`.
    pub fn object_name(self, template: &Uuid) -> String {
        let kind: &'static str = self.into();
        format!("/{kind}-{}", template.hyphenated())
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SectionInfo {
    pub name: String,
    pub len: usize,
    /// This process created the object, rather than attaching to it.
    pub created: bool,
}

/// Accounting for memory locked resident by this process.
///
/// Pinning must be preceded by growing the quota, and every byte granted
/// must be handed back when the pin is dropped.
#[cfg_attr(test, mockall::automock)]
pub trait ResidentQuota: Send + Sync {
    fn grow(&self, bytes: usize) -> io::Result<()>;
    fn shrink(&self, bytes: usize) -> io::Result<()>;
}

/// [`ResidentQuota`] backed by the process `RLIMIT_MEMLOCK`.
pub struct MemlockQuota;

impl MemlockQuota {
    fn adjust(
        f: impl FnOnce(libc::rlim_t) -> Option<libc::rlim_t>,
    ) -> io::Result<()> {
        let mut lim = libc::rlimit { rlim_cur: 0, rlim_max: 0 };
        if unsafe { libc::getrlimit(libc::RLIMIT_MEMLOCK, &mut lim) } != 0 {
            return Err(io::Error::last_os_error());
        }
        if lim.rlim_cur == libc::RLIM_INFINITY {
            return Ok(());
        }
        let Some(cur) = f(lim.rlim_cur) else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "memlock limit adjustment overflows",
            ));
        };
        lim.rlim_cur = cur;
        if lim.rlim_max != libc::RLIM_INFINITY && lim.rlim_max < cur {
            lim.rlim_max = cur;
        }
        if unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &lim) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl ResidentQuota for MemlockQuota {
    fn grow(&self, bytes: usize) -> io::Result<()> {
        Self::adjust(|cur| cur.checked_add(bytes as libc::rlim_t))
    }
    fn shrink(&self, bytes: usize) -> io::Result<()> {
        Self::adjust(|cur| Some(cur.saturating_sub(bytes as libc::rlim_t)))
    }
}

lazy_static::lazy_static! {
    /// Host large page size, which pin requests are rounded up to.
    static ref LARGE_PAGE_SIZE: usize = {
        std::fs::read_to_string(
            "/sys/kernel/mm/transparent_hugepage/hpage_pmd_size",
        )
        .ok()
        .and_then(|s| s.trim().parse::<usize>().ok())
        .filter(|sz| sz.is_power_of_two() && *sz >= PAGE_SIZE)
        .unwrap_or(2 * 1024 * 1024)
    };
}

struct Section {
    shm: ShmObject,
    pinned: usize,
}

pub struct SectionManager {
    template: Uuid,
    quota: Box<dyn ResidentQuota>,
    sections: Mutex<BTreeMap<SectionKind, Section>>,
    log: slog::Logger,
}

impl SectionManager {
    pub fn new(template: Uuid, log: &slog::Logger) -> Self {
        Self::with_quota(template, Box::new(MemlockQuota), log)
    }

    pub fn with_quota(
        template: Uuid,
        quota: Box<dyn ResidentQuota>,
        log: &slog::Logger,
    ) -> Self {
        Self {
            template,
            quota,
            sections: Mutex::new(BTreeMap::new()),
            log: log.new(slog::o!("component" => "sections")),
        }
    }

    pub fn open_section(
        &self,
        kind: SectionKind,
        size: usize,
    ) -> Result<SectionInfo, Error> {
        let mut sections = self.sections.lock().unwrap();
        if sections.contains_key(&kind) {
            return Err(Error::SectionOpen(kind));
        }

        let name = kind.object_name(&self.template);
        let shm = ShmObject::create_or_attach(&name, size)?;
        let info = SectionInfo {
            name: shm.name().to_string(),
            len: shm.len(),
            created: shm.created(),
        };
        info!(self.log, "section opened";
            "section" => %kind,
            "name" => &info.name,
            "len" => info.len,
            "created" => info.created,
        );

        sections.insert(kind, Section { shm, pinned: 0 });
        Ok(info)
    }

    pub fn close_section(&self, kind: SectionKind) -> Result<(), Error> {
        let section = self
            .sections
            .lock()
            .unwrap()
            .remove(&kind)
            .ok_or(Error::SectionNotOpen(kind))?;
        self.teardown_section(kind, section);
        Ok(())
    }

    fn teardown_section(&self, kind: SectionKind, mut section: Section) {
        self.unpin(kind, &mut section);
        match section.shm.close() {
            Ok(removed) => {
                debug!(self.log, "section closed";
                    "section" => %kind,
                    "removed" => removed,
                );
            }
            Err(e) => {
                warn!(self.log, "failed to close section";
                    "section" => %kind,
                    "error" => %e,
                );
            }
        }
    }

    fn unpin(&self, kind: SectionKind, section: &mut Section) {
        if section.pinned == 0 {
            return;
        }
        let pinned = std::mem::replace(&mut section.pinned, 0);
        unsafe {
            libc::munlock(
                section.shm.as_ptr().as_ptr() as *const libc::c_void,
                pinned,
            );
        }
        if let Err(e) = self.quota.shrink(pinned) {
            warn!(self.log, "failed to shrink resident quota";
                "section" => %kind,
                "bytes" => pinned,
                "error" => %e,
            );
        }
    }

    /// Attempt to lock (at least) `size` bytes at the start of the section
    /// resident.
    ///
    /// Pinning is best-effort: failure is logged and leaves the section
    /// unpinned.  Returns the number of bytes actually pinned.
    pub fn pin_section(
        &self,
        kind: SectionKind,
        size: usize,
    ) -> Result<usize, Error> {
        let mut sections = self.sections.lock().unwrap();
        let section =
            sections.get_mut(&kind).ok_or(Error::SectionNotOpen(kind))?;

        // A repeated pin replaces the previous one
        self.unpin(kind, section);

        let want = round_up(size, *LARGE_PAGE_SIZE)
            .unwrap_or(usize::MAX)
            .min(section.shm.len());
        if want == 0 {
            return Ok(0);
        }

        if let Err(e) = self.quota.grow(want) {
            warn!(self.log, "unable to grow resident quota, not pinning";
                "section" => %kind,
                "bytes" => want,
                "error" => %e,
            );
            return Ok(0);
        }

        let res = unsafe {
            libc::mlock(
                section.shm.as_ptr().as_ptr() as *const libc::c_void,
                want,
            )
        };
        if res != 0 {
            let e = io::Error::last_os_error();
            warn!(self.log, "failed to pin section";
                "section" => %kind,
                "bytes" => want,
                "error" => %e,
            );
            if let Err(e) = self.quota.shrink(want) {
                warn!(self.log, "failed to roll back resident quota";
                    "section" => %kind,
                    "error" => %e,
                );
            }
            return Ok(0);
        }

        info!(self.log, "section pinned"; "section" => %kind, "bytes" => want);
        section.pinned = want;
        Ok(want)
    }

    /// Drop the contents of `[offset, offset + len)` of a section.
    ///
    /// The mapping is left in place (in this process and its peers), and the
    /// range reads back as zeroes afterwards.
    pub fn reset_section(
        &self,
        kind: SectionKind,
        offset: usize,
        len: usize,
    ) -> Result<(), Error> {
        let sections = self.sections.lock().unwrap();
        let section = sections.get(&kind).ok_or(Error::SectionNotOpen(kind))?;
        discard_range(
            section.shm.as_ptr(),
            section.shm.len(),
            offset,
            len,
            libc::MADV_REMOVE,
        )?;
        debug!(self.log, "section reset";
            "section" => %kind,
            "offset" => offset,
            "len" => len,
        );
        Ok(())
    }

    /// A duplicate of the descriptor backing a section, suitable for handing
    /// to a peer process.
    pub fn share_handle(&self, kind: SectionKind) -> Result<OwnedFd, Error> {
        let sections = self.sections.lock().unwrap();
        let section = sections.get(&kind).ok_or(Error::SectionNotOpen(kind))?;
        Ok(section.shm.dup_fd()?)
    }

    pub fn pinned_bytes(&self, kind: SectionKind) -> Option<usize> {
        self.sections.lock().unwrap().get(&kind).map(|s| s.pinned)
    }

    pub fn is_open(&self, kind: SectionKind) -> bool {
        self.sections.lock().unwrap().contains_key(&kind)
    }

    /// Run `f` over the contents of a section.
    ///
    /// The caller must hold the lock of the domain guarding that section,
    /// which serializes access against peer processes as well.
    pub fn access<R>(
        &self,
        kind: SectionKind,
        guard: &DomainGuard<'_>,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, Error> {
        let domain = Domain::from(kind);
        if guard.domain() != domain {
            return Err(Error::WrongLock(kind, domain));
        }
        let sections = self.sections.lock().unwrap();
        let section = sections.get(&kind).ok_or(Error::SectionNotOpen(kind))?;

        // Safety: the mapping is live for as long as we hold the section
        // table lock, and the domain lock excludes every other accessor.
        let buf = unsafe {
            std::slice::from_raw_parts_mut(
                section.shm.as_ptr().as_ptr(),
                section.shm.len(),
            )
        };
        Ok(f(buf))
    }
}

impl Drop for SectionManager {
    fn drop(&mut self) {
        let sections = std::mem::take(self.sections.get_mut().unwrap());
        for (kind, section) in sections {
            self.teardown_section(kind, section);
        }
    }
}
