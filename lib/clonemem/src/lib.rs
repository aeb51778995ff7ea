// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Live memory capture and population for template-cloned VMs.
//!
//! A [`Session`] owns everything needed to pull guest frames out of a running
//! VM (separating template-backed frames from VM-private ones) or to push
//! previously captured frames back into a VM, with rollback of a partially
//! completed population.  Captured state is persisted with the record stream
//! in [`save`].

#![allow(clippy::style)]

pub extern crate hvmem_api;
#[macro_use]
extern crate bitflags;

pub mod backend;
mod capture;
pub mod common;
mod context;
pub mod heap;
mod mapping;
mod populate;
pub mod save;
pub mod section;
pub mod session;
mod shm;
pub mod sync;

#[cfg(test)]
mod test_util;

pub use backend::Backend;
pub use common::{Gfn, MAX_BATCH, PAGE_SIZE};
pub use context::{Removal, ThreadContext, UndoOutcome};
pub use session::{SaveContext, Session, SessionOpts, SessionShared};

use thiserror::Error;

/// Errors surfaced by the engine to its orchestrator.
///
/// Protocol desynchronization with the hypervisor has no variant here: the
/// engine cannot know which frames are left in an inconsistent state, so
/// those conditions terminate the process instead.
#[derive(Debug, Error)]
pub enum Error {
    #[error("out of memory allocating {0}")]
    OutOfMemory(&'static str),

    #[error("no thread context {0}")]
    NoSuchThread(usize),

    #[error("output buffer holds {have} bytes, {need} required")]
    BufferTooSmall { need: usize, have: usize },

    #[error("batch of {0} frames exceeds limit of {MAX_BATCH}")]
    BatchTooLarge(usize),

    #[error("section {0} is already open")]
    SectionOpen(section::SectionKind),

    #[error("section {0} is not open")]
    SectionNotOpen(section::SectionKind),

    #[error("section {0} requires the {1:?} lock")]
    WrongLock(section::SectionKind, sync::Domain),

    #[error("IO Error")]
    Io(#[from] std::io::Error),
}

pub fn version() -> &'static str {
    lazy_static::lazy_static! {
        static ref VERSION: String = {
            let mut version = format!("v{}", env!("CARGO_PKG_VERSION"));
            match hvmem_api::api_version() {
                Ok(v) => version.push_str(&format!(", hvmem API v{v}")),
                Err(_) => version.push_str(", <unknown hvmem API version>"),
            }
            version
        };
    };
    &VERSION
}
