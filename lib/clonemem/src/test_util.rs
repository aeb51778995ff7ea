// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeMap;
use std::io;
use std::sync::Mutex;

use slog::Drain;
use uuid::Uuid;

use crate::backend::{
    Backend, CaptureDesc, CaptureFlags, TYPE_COMPRESSED, TYPE_NORMAL,
};
use crate::common::PAGE_SIZE;

pub(crate) fn test_logger() -> slog::Logger {
    let dec = slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
    let drain = slog_term::FullFormat::new(dec).build().fuse();
    slog::Logger::root(drain, slog::o!())
}

/// Deterministic page contents for a frame, distinct between the VM and the
/// template copy of the same frame number.
pub(crate) fn fake_page(pfn: u64, template: bool) -> Vec<u8> {
    let seed = pfn.wrapping_mul(0x9e37_79b9_7f4a_7c15) ^ u64::from(template);
    (0..PAGE_SIZE)
        .map(|i| {
            let hi = (seed.rotate_left((i % 64) as u32) >> 56) as u8;
            hi ^ (i / 512) as u8
        })
        .collect()
}

#[derive(Default)]
struct FakeState {
    vm: BTreeMap<u64, Vec<u8>>,
    batches: Vec<Vec<CaptureDesc>>,
    removed: Vec<u64>,
    populate_calls: usize,
    release_all_calls: usize,
}

/// Backend double keeping VM frames in a map and recording every request.
///
/// Template frames always exist, with contents from [`fake_page`].
pub(crate) struct FakeBackend {
    state: Mutex<FakeState>,
    explicit_remove: bool,
    incremental_undo: bool,
    compress: bool,
    vm: Uuid,
}

impl FakeBackend {
    /// Behaves like the hypercall backend.
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::default(),
            explicit_remove: true,
            incremental_undo: true,
            compress: false,
            vm: Uuid::new_v4(),
        }
    }

    /// Behaves like the in-process backend.
    pub(crate) fn bulk_only() -> Self {
        Self { explicit_remove: false, incremental_undo: false, ..Self::new() }
    }

    pub(crate) fn compressing(mut self) -> Self {
        self.compress = true;
        self
    }

    pub(crate) fn with_vm_frames(
        self,
        pfns: impl IntoIterator<Item = u64>,
    ) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            for pfn in pfns {
                state.vm.insert(pfn, fake_page(pfn, false));
            }
        }
        self
    }

    pub(crate) fn vm_uuid(&self) -> Uuid {
        self.vm
    }

    pub(crate) fn batches(&self) -> Vec<Vec<CaptureDesc>> {
        self.state.lock().unwrap().batches.clone()
    }

    pub(crate) fn removed(&self) -> Vec<u64> {
        self.state.lock().unwrap().removed.clone()
    }

    pub(crate) fn vm_page(&self, pfn: u64) -> Option<Vec<u8>> {
        self.state.lock().unwrap().vm.get(&pfn).cloned()
    }

    pub(crate) fn vm_frame_count(&self) -> usize {
        self.state.lock().unwrap().vm.len()
    }

    pub(crate) fn populate_calls(&self) -> usize {
        self.state.lock().unwrap().populate_calls
    }

    pub(crate) fn release_all_calls(&self) -> usize {
        self.state.lock().unwrap().release_all_calls
    }
}

impl Backend for FakeBackend {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn capture_batch(
        &self,
        descs: &mut [CaptureDesc],
        buf: &mut [u8],
    ) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        state.batches.push(descs.to_vec());

        let mut cursor = 0;
        for (done, desc) in descs.iter_mut().enumerate() {
            let flags = CaptureFlags::from_bits_truncate(desc.flags);
            let page = if flags.contains(CaptureFlags::TEMPLATE) {
                fake_page(desc.gpfn, true)
            } else {
                match state.vm.get(&desc.gpfn) {
                    Some(page) => page.clone(),
                    None => return Ok(done),
                }
            };

            desc.offset = cursor as u64;
            if self.compress {
                let packed = lz4_flex::block::compress(&page);
                buf[cursor..cursor + 2]
                    .copy_from_slice(&(packed.len() as u16).to_le_bytes());
                buf[cursor + 2..cursor + 2 + packed.len()]
                    .copy_from_slice(&packed);
                desc.type_ = TYPE_NORMAL | TYPE_COMPRESSED;
                cursor += 2 + packed.len();
            } else {
                buf[cursor..cursor + PAGE_SIZE].copy_from_slice(&page);
                desc.type_ = TYPE_NORMAL;
                cursor += PAGE_SIZE;
            }

            if flags.contains(CaptureFlags::REMOVE_PFN) {
                state.vm.remove(&desc.gpfn);
                state.removed.push(desc.gpfn);
            }
        }
        Ok(descs.len())
    }

    fn populate_batch(&self, gfns: &[u64], buf: &[u8]) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.populate_calls += 1;
        for (gfn, page) in gfns.iter().zip(buf.chunks_exact(PAGE_SIZE)) {
            state.vm.insert(*gfn, page.to_vec());
        }
        Ok(())
    }

    fn vm_exists(&self, uuid: &Uuid) -> io::Result<bool> {
        Ok(*uuid == self.vm)
    }

    fn needs_explicit_remove(&self) -> bool {
        self.explicit_remove
    }

    fn supports_incremental_undo(&self) -> bool {
        self.incremental_undo
    }

    fn release_all(&self) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.release_all_calls += 1;
        state.vm.clear();
        Ok(())
    }
}
