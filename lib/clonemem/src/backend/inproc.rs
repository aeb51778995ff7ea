// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Backend whose guest memory lives inside this process.
//!
//! Used when the VM is run by an in-process monitor rather than a separate
//! hypervisor.  Two frame stores are kept: the VM's private frames, and the
//! read-only frames of the template it was cloned from.  Captures flagged
//! [`CaptureFlags::TEMPLATE`] are served from the template store, which
//! neither removal nor [`Backend::release_all`] ever touches.

use std::io::{Error, ErrorKind, Result};
use std::sync::Mutex;

use bitvec::vec::BitVec;
use slog::{debug, info};
use uuid::Uuid;

use super::{Backend, CaptureDesc, CaptureFlags, TYPE_COMPRESSED, TYPE_NORMAL};
use crate::common::PAGE_SIZE;
use crate::mapping::AnonMapping;

/// Size of the length prefix ahead of a compressed page.
const COMPRESSED_HDR: usize = std::mem::size_of::<u16>();

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Store {
    Vm,
    Template,
}

/// Presence of each frame, per store.
struct Frames {
    vm: BitVec,
    template: BitVec,
}

impl Frames {
    fn of(&self, store: Store) -> &BitVec {
        match store {
            Store::Vm => &self.vm,
            Store::Template => &self.template,
        }
    }

    fn of_mut(&mut self, store: Store) -> &mut BitVec {
        match store {
            Store::Vm => &mut self.vm,
            Store::Template => &mut self.template,
        }
    }
}

pub struct InprocBackend {
    vm: Uuid,
    ram: AnonMapping,
    template_ram: AnonMapping,
    pages: usize,
    frames: Mutex<Frames>,
    compress: bool,
    log: slog::Logger,
}

impl InprocBackend {
    pub fn new(
        vm: Uuid,
        pages: usize,
        compress: bool,
        log: &slog::Logger,
    ) -> Result<Self> {
        let len = pages.checked_mul(PAGE_SIZE).ok_or_else(|| {
            Error::new(ErrorKind::InvalidInput, "guest size overflows")
        })?;
        let ram = AnonMapping::new(len)?;
        let template_ram = AnonMapping::new(len)?;
        let log = log.new(slog::o!(
            "backend" => "inproc",
            "vm" => vm.to_string(),
        ));
        info!(log, "in-process guest memory allocated";
            "pages" => pages,
            "compress" => compress,
        );

        Ok(Self {
            vm,
            ram,
            template_ram,
            pages,
            frames: Mutex::new(Frames {
                vm: BitVec::repeat(false, pages),
                template: BitVec::repeat(false, pages),
            }),
            compress,
            log,
        })
    }

    pub fn pages(&self) -> usize {
        self.pages
    }

    pub fn is_present(&self, gfn: u64) -> bool {
        self.lookup(Store::Vm, gfn)
    }

    pub fn has_template_page(&self, gfn: u64) -> bool {
        self.lookup(Store::Template, gfn)
    }

    /// Back `gfn` with the contents of `data` (one page).
    pub fn write_page(&self, gfn: u64, data: &[u8]) -> Result<()> {
        self.store_page(Store::Vm, gfn, data)
    }

    /// Place `data` (one page) at `gfn` in the template the VM was cloned
    /// from.
    pub fn write_template_page(&self, gfn: u64, data: &[u8]) -> Result<()> {
        self.store_page(Store::Template, gfn, data)
    }

    /// Read back the contents of a present frame.
    pub fn read_page(&self, gfn: u64, data: &mut [u8]) -> Result<()> {
        self.load_page(Store::Vm, gfn, data)
    }

    pub fn read_template_page(&self, gfn: u64, data: &mut [u8]) -> Result<()> {
        self.load_page(Store::Template, gfn, data)
    }

    fn lookup(&self, store: Store, gfn: u64) -> bool {
        let frames = self.frames.lock().unwrap();
        usize::try_from(gfn)
            .ok()
            .and_then(|idx| frames.of(store).get(idx).map(|b| *b))
            .unwrap_or(false)
    }

    fn store_page(&self, store: Store, gfn: u64, data: &[u8]) -> Result<()> {
        let idx = self.index(gfn)?;
        if data.len() != PAGE_SIZE {
            return Err(Error::from_raw_os_error(libc::EINVAL));
        }
        let mut frames = self.frames.lock().unwrap();
        self.page_mut(store, idx).copy_from_slice(data);
        frames.of_mut(store).set(idx, true);
        Ok(())
    }

    fn load_page(&self, store: Store, gfn: u64, data: &mut [u8]) -> Result<()> {
        let idx = self.index(gfn)?;
        if data.len() != PAGE_SIZE {
            return Err(Error::from_raw_os_error(libc::EINVAL));
        }
        let frames = self.frames.lock().unwrap();
        if !frames.of(store)[idx] {
            return Err(Error::from_raw_os_error(libc::ENOENT));
        }
        data.copy_from_slice(self.page_mut(store, idx));
        Ok(())
    }

    fn index(&self, gfn: u64) -> Result<usize> {
        usize::try_from(gfn)
            .ok()
            .filter(|idx| *idx < self.pages)
            .ok_or_else(|| Error::from_raw_os_error(libc::EINVAL))
    }

    #[allow(clippy::mut_from_ref)]
    fn page_mut(&self, store: Store, idx: usize) -> &mut [u8] {
        assert!(idx < self.pages);
        let base = match store {
            Store::Vm => self.ram.as_ptr(),
            Store::Template => self.template_ram.as_ptr(),
        };
        // Safety: the index is in range, and every caller holds the
        // `frames` lock while touching page contents.
        unsafe {
            std::slice::from_raw_parts_mut(base.add(idx * PAGE_SIZE), PAGE_SIZE)
        }
    }

    fn remove(&self, frames: &mut Frames, idx: usize) -> Result<()> {
        self.ram.discard(idx * PAGE_SIZE, PAGE_SIZE)?;
        frames.vm.set(idx, false);
        Ok(())
    }
}

impl Backend for InprocBackend {
    fn name(&self) -> &'static str {
        "inproc"
    }

    fn capture_batch(
        &self,
        descs: &mut [CaptureDesc],
        buf: &mut [u8],
    ) -> Result<usize> {
        let mut frames = self.frames.lock().unwrap();
        let mut cursor = 0usize;

        for (done, desc) in descs.iter_mut().enumerate() {
            let flags = CaptureFlags::from_bits_truncate(desc.flags);
            let store = if flags.contains(CaptureFlags::TEMPLATE) {
                Store::Template
            } else {
                Store::Vm
            };
            let idx = match self.index(desc.gpfn) {
                Ok(idx) if frames.of(store)[idx] => idx,
                _ => return Ok(done),
            };
            let page = self.page_mut(store, idx);

            let packed = if self.compress {
                Some(lz4_flex::block::compress(page))
                    .filter(|c| c.len() < PAGE_SIZE - COMPRESSED_HDR)
            } else {
                None
            };
            let need = match &packed {
                Some(c) => COMPRESSED_HDR + c.len(),
                None => PAGE_SIZE,
            };
            if cursor + need > buf.len() {
                return Ok(done);
            }

            let out = &mut buf[cursor..cursor + need];
            match &packed {
                Some(c) => {
                    out[..COMPRESSED_HDR]
                        .copy_from_slice(&(c.len() as u16).to_le_bytes());
                    out[COMPRESSED_HDR..].copy_from_slice(c);
                    desc.type_ = TYPE_NORMAL | TYPE_COMPRESSED;
                }
                None => {
                    out.copy_from_slice(page);
                    desc.type_ = TYPE_NORMAL;
                }
            }
            desc.offset = cursor as u64;
            cursor += need;

            // Template frames are shared with every clone
            if store == Store::Vm && flags.contains(CaptureFlags::REMOVE_PFN) {
                self.remove(&mut frames, idx)?;
            }
        }
        debug!(self.log, "captured batch";
            "frames" => descs.len(),
            "bytes" => cursor,
        );
        Ok(descs.len())
    }

    fn populate_batch(&self, gfns: &[u64], buf: &[u8]) -> Result<()> {
        if buf.len() < gfns.len() * PAGE_SIZE {
            return Err(Error::from_raw_os_error(libc::EINVAL));
        }
        let mut frames = self.frames.lock().unwrap();

        // Nothing is touched unless the whole batch is acceptable
        let idxs = gfns
            .iter()
            .map(|gfn| {
                let idx = self.index(*gfn)?;
                if frames.vm[idx] {
                    return Err(Error::from_raw_os_error(libc::EEXIST));
                }
                Ok(idx)
            })
            .collect::<Result<Vec<_>>>()?;

        for (idx, page) in idxs.into_iter().zip(buf.chunks_exact(PAGE_SIZE)) {
            self.page_mut(Store::Vm, idx).copy_from_slice(page);
            frames.vm.set(idx, true);
        }
        Ok(())
    }

    fn vm_exists(&self, uuid: &Uuid) -> Result<bool> {
        Ok(*uuid == self.vm)
    }

    fn needs_explicit_remove(&self) -> bool {
        false
    }

    fn supports_incremental_undo(&self) -> bool {
        false
    }

    fn release_all(&self) -> Result<()> {
        let mut frames = self.frames.lock().unwrap();
        self.ram.discard(0, self.ram.len())?;
        let count = frames.vm.count_ones();
        frames.vm.fill(false);
        info!(self.log, "released all guest frames"; "frames" => count);
        Ok(())
    }
}
