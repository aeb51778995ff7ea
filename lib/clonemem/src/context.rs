// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::backend::{Backend, CaptureDesc};
use crate::common::{MAX_BATCH, TRANSPORT_SIZE};
use crate::heap::{Heap, HeapBuf};
use crate::Error;

/// What happens to VM-owned frames once their contents are captured.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Removal {
    /// Take the frame away from the VM.
    #[default]
    Release,
    /// Leave the frame mapped in the VM.
    Retain,
}

/// Result of rolling back a context's populated frames.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UndoOutcome {
    /// The frames were removed from the VM.
    Removed(usize),
    /// The backend cannot remove frames individually; they are released in
    /// bulk when the session is torn down.
    Deferred(usize),
}

/// Per-worker engine state.
///
/// Each worker thread drives exactly one context, so nothing in here is
/// shared: the transport buffer, the descriptor scratch space and the log of
/// populated frames are all owned outright.
pub struct ThreadContext<B: Backend> {
    pub(crate) id: usize,
    pub(crate) backend: Arc<B>,
    pub(crate) transport: HeapBuf,
    pub(crate) descs: Vec<CaptureDesc>,
    pub(crate) populated: Vec<u64>,
    pub(crate) removal: Removal,
    pub(crate) bulk_release: Arc<AtomicBool>,
    pub(crate) log: slog::Logger,
}

impl<B: Backend> ThreadContext<B> {
    pub(crate) fn new(
        id: usize,
        backend: Arc<B>,
        heap: &Heap,
        removal: Removal,
        bulk_release: Arc<AtomicBool>,
        log: &slog::Logger,
    ) -> Result<Self, Error> {
        let transport = heap.alloc(TRANSPORT_SIZE)?;
        let mut descs = Vec::new();
        descs
            .try_reserve_exact(MAX_BATCH)
            .map_err(|_| Error::OutOfMemory("capture descriptors"))?;
        descs.resize(MAX_BATCH, CaptureDesc::default());

        Ok(Self {
            id,
            backend,
            transport,
            descs,
            populated: Vec::new(),
            removal,
            bulk_release,
            log: log.new(slog::o!("thread" => id)),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Default removal policy for [`ThreadContext::capture`].
    pub fn removal(&self) -> Removal {
        self.removal
    }

    pub fn set_removal(&mut self, removal: Removal) {
        self.removal = removal;
    }

    /// The transport buffer, as a zero-copy staging area for populate, along
    /// with the number of pages it holds.
    pub fn buffer(&mut self) -> (&mut [u8], usize) {
        (self.transport.as_mut_slice(), MAX_BATCH)
    }
}
