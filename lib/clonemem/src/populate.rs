// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Batched population of guest frames, with rollback.

use std::io;
use std::sync::atomic::Ordering;

use slog::{debug, info};

use crate::backend::{Backend, CaptureFlags};
use crate::common::{Gfn, MAX_BATCH, PAGE_SIZE};
use crate::context::{ThreadContext, UndoOutcome};
use crate::Error;

impl<B: Backend> ThreadContext<B> {
    /// Back each of `frames` with the corresponding page of the transport
    /// buffer (page `i` at `i * PAGE_SIZE`), in a single backend call.
    ///
    /// Errors from the backend are returned as-is, so the raw status remains
    /// available through [`io::Error::raw_os_error`].  Frames are only
    /// logged for [`ThreadContext::undo`] once the backend accepted them.
    pub fn populate(&mut self, frames: &[u64]) -> io::Result<()> {
        if frames.len() > MAX_BATCH {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                Error::BatchTooLarge(frames.len()),
            ));
        }
        if frames.iter().any(|f| Gfn::from_raw(*f).is_template()) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "template frames cannot be populated",
            ));
        }
        if frames.is_empty() {
            return Ok(());
        }

        // Make room up front, so a successful populate is always logged
        self.populated.try_reserve(frames.len()).map_err(|_| {
            io::Error::new(
                io::ErrorKind::OutOfMemory,
                Error::OutOfMemory("populated frame log"),
            )
        })?;

        let pages = &self.transport.as_slice()[..frames.len() * PAGE_SIZE];
        self.backend.populate_batch(frames, pages)?;
        self.populated.extend_from_slice(frames);

        debug!(self.log, "populated batch";
            "frames" => frames.len(),
            "logged" => self.populated.len(),
        );
        Ok(())
    }

    /// Roll back every frame populated through this context.
    ///
    /// Where the backend can remove frames individually they are captured
    /// with removal, newest first, and the contents dropped.  Otherwise the
    /// removal is left to the bulk release at session teardown.  Either way
    /// the log is empty afterwards, so repeating an undo does nothing.
    pub fn undo(&mut self) -> Result<UndoOutcome, Error> {
        let count = self.populated.len();

        if !self.backend.supports_incremental_undo() {
            self.populated.clear();
            if count != 0 {
                self.bulk_release.store(true, Ordering::Release);
                info!(self.log, "undo deferred to bulk release";
                    "frames" => count,
                );
            }
            return Ok(UndoOutcome::Deferred(count));
        }

        let log = std::mem::take(&mut self.populated);
        for batch in log.rchunks(MAX_BATCH) {
            let reqs = batch
                .iter()
                .rev()
                .map(|pfn| (*pfn, CaptureFlags::VM | CaptureFlags::REMOVE_PFN));
            self.run_batch(reqs, None);
        }

        // Keep the allocation for reuse
        self.populated = log;
        self.populated.clear();

        if count != 0 {
            info!(self.log, "undo removed populated frames"; "frames" => count);
        }
        Ok(UndoOutcome::Removed(count))
    }

    /// Frames populated through this context, oldest first.
    pub fn populated(&self) -> &[u64] {
        &self.populated
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    use super::*;
    use crate::common::TRANSPORT_SIZE;
    use crate::context::Removal;
    use crate::heap::Heap;
    use crate::test_util::{fake_page, test_logger, FakeBackend};

    fn context<B: Backend>(backend: B) -> (Heap, ThreadContext<B>) {
        let log = test_logger();
        let heap = Heap::new(TRANSPORT_SIZE, &log).unwrap();
        let ctx = ThreadContext::new(
            0,
            Arc::new(backend),
            &heap,
            Removal::Release,
            Arc::new(AtomicBool::new(false)),
            &log,
        )
        .unwrap();
        (heap, ctx)
    }

    fn stage(ctx: &mut ThreadContext<FakeBackend>, pfns: &[u64]) {
        let (buf, pages) = ctx.buffer();
        assert!(pfns.len() <= pages);
        for (pfn, page) in pfns.iter().zip(buf.chunks_exact_mut(PAGE_SIZE)) {
            page.copy_from_slice(&fake_page(*pfn, false));
        }
    }

    #[test]
    fn populate_then_capture_roundtrip() {
        let (_heap, mut ctx) = context(FakeBackend::new());
        let pfns: Vec<u64> = (100..140).collect();
        stage(&mut ctx, &pfns);
        ctx.populate(&pfns).unwrap();
        assert_eq!(ctx.populated(), &pfns[..]);

        let frames: Vec<Gfn> = pfns.iter().copied().map(Gfn::vm).collect();
        let mut out = vec![0u8; frames.len() * PAGE_SIZE];
        ctx.capture_with(&frames, &mut out, Removal::Retain).unwrap();
        for (pfn, page) in pfns.iter().zip(out.chunks_exact(PAGE_SIZE)) {
            assert_eq!(page, &fake_page(*pfn, false)[..]);
        }
    }

    #[test]
    fn oversized_or_template_batches_rejected() {
        let (_heap, mut ctx) = context(FakeBackend::new());
        let too_many: Vec<u64> = (0..MAX_BATCH as u64 + 1).collect();
        let err = ctx.populate(&too_many).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        let err = ctx.populate(&[Gfn::template(3).raw()]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        assert_eq!(ctx.backend.populate_calls(), 0);
        assert!(ctx.populated().is_empty());
    }

    #[test]
    fn failed_populate_is_not_logged() {
        let mut be = crate::backend::MockBackend::new();
        be.expect_populate_batch()
            .times(1)
            .returning(|_, _| Err(io::Error::from_raw_os_error(libc::ENOSPC)));

        let (_heap, mut ctx) = context(be);
        let err = ctx.populate(&[1, 2, 3]).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOSPC));
        assert!(ctx.populated().is_empty());
    }

    #[test]
    fn undo_removes_newest_first() {
        let (_heap, mut ctx) = context(FakeBackend::new());
        let first: Vec<u64> = (0..MAX_BATCH as u64).collect();
        let second: Vec<u64> = (5000..5010).collect();
        stage(&mut ctx, &first);
        ctx.populate(&first).unwrap();
        stage(&mut ctx, &second);
        ctx.populate(&second).unwrap();
        assert_eq!(ctx.backend.vm_frame_count(), MAX_BATCH + 10);

        assert_eq!(ctx.undo().unwrap(), UndoOutcome::Removed(MAX_BATCH + 10));
        assert_eq!(ctx.backend.vm_frame_count(), 0);
        assert!(ctx.populated().is_empty());

        let batches = ctx.backend.batches();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), MAX_BATCH);
        assert_eq!(batches[0][0].gpfn, 5009);
        assert_eq!(batches[1].last().map(|d| d.gpfn), Some(0));
        for desc in batches.iter().flatten() {
            assert_eq!(
                desc.flags,
                (CaptureFlags::VM | CaptureFlags::REMOVE_PFN).bits()
            );
        }

        let removed = ctx.backend.removed();
        assert_eq!(removed.first(), Some(&5009));
        assert_eq!(removed.last(), Some(&0));
    }

    #[test]
    fn second_undo_is_noop() {
        let (_heap, mut ctx) = context(FakeBackend::new());
        stage(&mut ctx, &[1, 2]);
        ctx.populate(&[1, 2]).unwrap();

        assert_eq!(ctx.undo().unwrap(), UndoOutcome::Removed(2));
        let calls = ctx.backend.batches().len();
        assert_eq!(ctx.undo().unwrap(), UndoOutcome::Removed(0));
        assert_eq!(ctx.backend.batches().len(), calls);
    }

    #[test]
    fn undo_defers_without_incremental_support() {
        let (_heap, mut ctx) = context(FakeBackend::bulk_only());
        stage(&mut ctx, &[7, 8, 9]);
        ctx.populate(&[7, 8, 9]).unwrap();

        assert_eq!(ctx.undo().unwrap(), UndoOutcome::Deferred(3));
        assert!(ctx.populated().is_empty());
        assert!(ctx.backend.batches().is_empty());
        assert!(ctx.bulk_release.load(Ordering::Acquire));
        // Still mapped until the bulk release
        assert_eq!(ctx.backend.vm_frame_count(), 3);

        assert_eq!(ctx.undo().unwrap(), UndoOutcome::Deferred(0));
    }
}
