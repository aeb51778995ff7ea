// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Batched capture of guest frames.
//!
//! Any disagreement between what was requested of the backend and what it
//! reports back is fatal: at that point there is no telling which frames
//! were removed from the VM, so neither the capture nor the VM can be
//! trusted any further.

use std::io;
use std::sync::atomic::Ordering;

use byteorder::{ByteOrder, LittleEndian};
use slog::{crit, debug};

use crate::backend::{
    Backend, CaptureDesc, CaptureFlags, TYPE_COMPRESSED, TYPE_MASK,
    TYPE_NORMAL,
};
use crate::common::{Gfn, MAX_BATCH, PAGE_SIZE};
use crate::context::{Removal, ThreadContext};
use crate::Error;

/// Size of the length prefix ahead of a compressed page.
const COMPRESSED_HDR: usize = std::mem::size_of::<u16>();

#[derive(Debug, thiserror::Error)]
pub(crate) enum Desync {
    #[error("backend capture failed: {0}")]
    Call(#[source] io::Error),

    #[error("backend fulfilled {done} of {requested} frames")]
    Short { done: usize, requested: usize },

    #[error("unexpected page type {0:#x}")]
    UnexpectedType(u32),

    #[error("page offset {0:#x} outside transport buffer")]
    OutOfRange(u64),

    #[error("invalid compressed length {0}")]
    BadLength(usize),

    #[error("decompression failed: {0}")]
    Decompress(#[from] lz4_flex::block::DecompressError),

    #[error("page decompressed to {0} bytes")]
    WrongSize(usize),
}

/// Interpret one fulfilled descriptor, writing the page it refers to in
/// `transport` into `dst`.
pub(crate) fn classify(
    desc: &CaptureDesc,
    transport: &[u8],
    dst: &mut [u8],
) -> Result<(), Desync> {
    let ty = desc.type_;
    if ty & !(TYPE_MASK | TYPE_COMPRESSED) != 0 || ty & TYPE_MASK != TYPE_NORMAL
    {
        return Err(Desync::UnexpectedType(ty));
    }
    let off = usize::try_from(desc.offset)
        .ok()
        .filter(|off| *off < transport.len())
        .ok_or(Desync::OutOfRange(desc.offset))?;

    if ty & TYPE_COMPRESSED == 0 {
        let src = transport
            .get(off..off + PAGE_SIZE)
            .ok_or(Desync::OutOfRange(desc.offset))?;
        dst.copy_from_slice(src);
        return Ok(());
    }

    let hdr = transport
        .get(off..off + COMPRESSED_HDR)
        .ok_or(Desync::OutOfRange(desc.offset))?;
    let len = LittleEndian::read_u16(hdr) as usize;
    let start = off + COMPRESSED_HDR;
    let src = transport
        .get(start..start + len)
        .filter(|_| len != 0)
        .ok_or(Desync::BadLength(len))?;
    match lz4_flex::block::decompress_into(src, dst)? {
        PAGE_SIZE => Ok(()),
        n => Err(Desync::WrongSize(n)),
    }
}

impl<B: Backend> ThreadContext<B> {
    /// Capture `frames` into `out`, one page per frame in list order, using
    /// the context's default removal policy.
    ///
    /// Returns the number of bytes written.
    pub fn capture(
        &mut self,
        frames: &[Gfn],
        out: &mut [u8],
    ) -> Result<usize, Error> {
        self.capture_with(frames, out, self.removal)
    }

    pub fn capture_with(
        &mut self,
        frames: &[Gfn],
        out: &mut [u8],
        removal: Removal,
    ) -> Result<usize, Error> {
        let need = frames
            .len()
            .checked_mul(PAGE_SIZE)
            .ok_or(Error::BufferTooSmall { need: usize::MAX, have: out.len() })?;
        if out.len() < need {
            return Err(Error::BufferTooSmall { need, have: out.len() });
        }

        let vm_flags = match removal {
            Removal::Release if self.backend.needs_explicit_remove() => {
                CaptureFlags::VM | CaptureFlags::REMOVE_PFN
            }
            Removal::Release => {
                // Frames stay put until the bulk release at teardown
                self.bulk_release.store(true, Ordering::Release);
                CaptureFlags::VM
            }
            Removal::Retain => CaptureFlags::VM,
        };

        for (batch, dst) in
            frames.chunks(MAX_BATCH).zip(out.chunks_mut(MAX_BATCH * PAGE_SIZE))
        {
            let reqs = batch.iter().map(|gfn| {
                if gfn.is_template() {
                    (gfn.pfn(), CaptureFlags::TEMPLATE)
                } else {
                    (gfn.pfn(), vm_flags)
                }
            });
            self.run_batch(reqs, Some(dst));
        }
        Ok(need)
    }

    /// Issue a single backend capture call for up to [`MAX_BATCH`] frames.
    ///
    /// With a `dst`, page `i` of the batch is written at `i * PAGE_SIZE`;
    /// without one the captured contents are dropped.
    pub(crate) fn run_batch(
        &mut self,
        reqs: impl Iterator<Item = (u64, CaptureFlags)>,
        dst: Option<&mut [u8]>,
    ) {
        let Self { backend, descs, transport, log, .. } = self;

        let mut count = 0;
        for (desc, (pfn, flags)) in descs.iter_mut().zip(reqs) {
            *desc = CaptureDesc {
                gpfn: pfn,
                flags: flags.bits(),
                ..Default::default()
            };
            count += 1;
        }
        let batch = &mut descs[..count];

        fn fatal(
            log: &slog::Logger,
            err: Desync,
            desc: Option<&CaptureDesc>,
        ) -> ! {
            crit!(log, "capture desynchronized from backend";
                "error" => %err,
                "desc" => ?desc,
            );
            panic!("capture desynchronized from backend: {err}");
        }

        match backend.capture_batch(batch, transport.as_mut_slice()) {
            Err(e) => fatal(log, Desync::Call(e), None),
            Ok(done) if done != count => {
                fatal(log, Desync::Short { done, requested: count }, None)
            }
            Ok(_) => {}
        }
        debug!(log, "captured batch"; "frames" => count);

        let Some(dst) = dst else {
            return;
        };
        let transport = transport.as_slice();
        for (desc, page) in batch.iter().zip(dst.chunks_exact_mut(PAGE_SIZE)) {
            if let Err(err) = classify(desc, transport, page) {
                fatal(log, err, Some(desc));
            }
        }
    }
}
