// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cross-process mutual exclusion with cancellation.
//!
//! Each synchronization [`Domain`] is guarded by a mutex living in a named
//! shared memory object, so that every engine process using the same engine
//! id contends on the same lock.  Waiting for a domain can be aborted at any
//! time by firing the [`CancelSignal`] the layer was built with; once the
//! signal has fired, no further acquisition succeeds.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use slog::{debug, info, warn};
use strum::IntoEnumIterator;
use thiserror::Error;

use crate::section::SectionKind;
use crate::shm::ShmObject;

/// Upper bound on a single futex sleep.  Waiters recheck the cancellation
/// signal at least this often, even if a wakeup is missed.
const WAIT_SLICE: Duration = Duration::from_millis(10);

/// The wait for a lock was abandoned because cancellation was requested.
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
#[error("operation cancelled")]
pub struct Cancelled;

#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, strum::EnumIter,
)]
#[repr(u8)]
pub enum Domain {
    Index0 = 0,
    Index1 = 1,
    Pin = 2,
}

impl Domain {
    pub const fn index(self) -> usize {
        self as usize
    }
}

impl From<SectionKind> for Domain {
    fn from(kind: SectionKind) -> Self {
        match kind {
            SectionKind::Index0 => Domain::Index0,
            SectionKind::Index1 => Domain::Index1,
            SectionKind::Pin => Domain::Pin,
        }
    }
}

#[derive(Default)]
struct CancelInner {
    fired: AtomicBool,
    waiters: Mutex<Vec<Weak<NamedMutex>>>,
}

/// Process-wide request to abandon the current operation.
///
/// Clones share the same underlying flag.  Firing is sticky.
#[derive(Clone, Default)]
pub struct CancelSignal(Arc<CancelInner>);

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation, waking every lock waiter in this process.
    pub fn fire(&self) {
        self.0.fired.store(true, Ordering::SeqCst);
        let waiters = self.0.waiters.lock().unwrap();
        for mtx in waiters.iter().filter_map(Weak::upgrade) {
            mtx.wake_all();
        }
    }

    pub fn is_fired(&self) -> bool {
        self.0.fired.load(Ordering::SeqCst)
    }

    fn register(&self, mtx: &Arc<NamedMutex>) {
        let mut waiters = self.0.waiters.lock().unwrap();
        waiters.retain(|w| w.strong_count() > 0);
        waiters.push(Arc::downgrade(mtx));
    }
}

impl std::fmt::Debug for CancelSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelSignal")
            .field("fired", &self.is_fired())
            .finish()
    }
}

/// Futex-based mutex (unlocked 0, locked 1, locked with waiters 2) over a
/// word at the start of a shared memory object.
#[derive(Debug)]
struct NamedMutex {
    shm: ShmObject,
}

impl NamedMutex {
    fn open(name: &str) -> io::Result<Self> {
        let shm = ShmObject::create_or_attach(name, std::mem::size_of::<u32>())?;
        Ok(Self { shm })
    }

    fn word(&self) -> &AtomicU32 {
        // Safety: the object is at least one page, page aligned, and its
        // first word is only ever accessed atomically.
        unsafe { &*(self.shm.as_ptr().as_ptr() as *const AtomicU32) }
    }

    fn lock(&self, cancel: &CancelSignal) -> Result<(), Cancelled> {
        if cancel.is_fired() {
            return Err(Cancelled);
        }
        let word = self.word();
        if word
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            loop {
                if cancel.is_fired() {
                    return Err(Cancelled);
                }
                if word.swap(2, Ordering::Acquire) == 0 {
                    break;
                }
                futex_wait(word, 2, WAIT_SLICE);
            }
        }

        // The signal may have fired while we were acquiring
        if cancel.is_fired() {
            self.unlock();
            return Err(Cancelled);
        }
        Ok(())
    }

    fn unlock(&self) {
        if self.word().swap(0, Ordering::Release) == 2 {
            futex_wake(self.word(), 1);
        }
    }

    fn wake_all(&self) {
        futex_wake(self.word(), i32::MAX);
    }
}

#[cfg(target_os = "linux")]
fn futex_wait(word: &AtomicU32, expected: u32, timeout: Duration) {
    let ts = libc::timespec {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_nsec: timeout.subsec_nanos() as libc::c_long,
    };
    // Safety: `word` is a valid, aligned u32 for the duration of the call.
    let res = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT,
            expected,
            &ts as *const libc::timespec,
            std::ptr::null::<u32>(),
            0u32,
        )
    };
    if res != 0 {
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EAGAIN | libc::EINTR | libc::ETIMEDOUT) => {}
            _ => panic!("unexpected futex wait failure: {err}"),
        }
    }
}

#[cfg(target_os = "linux")]
fn futex_wake(word: &AtomicU32, count: i32) {
    // Safety: `word` is a valid, aligned u32 for the duration of the call.
    let res = unsafe {
        libc::syscall(libc::SYS_futex, word.as_ptr(), libc::FUTEX_WAKE, count)
    };
    if res < 0 {
        panic!("unexpected futex wake failure: {}", io::Error::last_os_error());
    }
}

#[cfg(not(target_os = "linux"))]
fn futex_wait(_word: &AtomicU32, _expected: u32, timeout: Duration) {
    std::thread::sleep(timeout);
}

#[cfg(not(target_os = "linux"))]
fn futex_wake(_word: &AtomicU32, _count: i32) {}

/// The set of named mutexes shared by all engine processes with the same
/// engine id.
pub struct SyncLayer {
    cancel: CancelSignal,
    mutexes: Vec<Arc<NamedMutex>>,
    log: slog::Logger,
}

impl SyncLayer {
    pub fn mutex_name(engine_id: &str, domain: Domain) -> String {
        format!("/{engine_id}-mutex-{}", domain.index())
    }

    pub fn new(
        engine_id: &str,
        cancel: &CancelSignal,
        log: &slog::Logger,
    ) -> io::Result<Self> {
        let log = log.new(slog::o!("component" => "sync"));
        let mutexes = Domain::iter()
            .map(|domain| {
                let name = Self::mutex_name(engine_id, domain);
                let mtx = Arc::new(NamedMutex::open(&name)?);
                cancel.register(&mtx);
                Ok(mtx)
            })
            .collect::<io::Result<Vec<_>>>()?;
        info!(log, "sync layer initialized"; "engine_id" => engine_id);

        Ok(Self { cancel: cancel.clone(), mutexes, log })
    }

    /// Block until `domain` is held, or cancellation is requested.
    pub fn lock(&self, domain: Domain) -> Result<DomainGuard<'_>, Cancelled> {
        let mtx = &self.mutexes[domain.index()];
        mtx.lock(&self.cancel).map_err(|e| {
            debug!(self.log, "lock wait cancelled"; "domain" => ?domain);
            e
        })?;
        Ok(DomainGuard { mtx, domain })
    }

    pub fn cancel_signal(&self) -> &CancelSignal {
        &self.cancel
    }
}

impl Drop for SyncLayer {
    fn drop(&mut self) {
        for mtx in self.mutexes.drain(..) {
            // A mutex still shared elsewhere detaches when its last Arc drops
            let Ok(mtx) = Arc::try_unwrap(mtx) else { continue };
            let name = mtx.shm.name().to_string();
            match mtx.shm.close() {
                Ok(true) => debug!(self.log, "mutex removed"; "name" => name),
                Ok(false) => {}
                Err(e) => {
                    warn!(self.log, "failed to close mutex";
                        "name" => name, "error" => %e)
                }
            }
        }
    }
}

/// Holds the lock of a [`Domain`] until dropped.
#[must_use = "the domain is unlocked as soon as the guard is dropped"]
pub struct DomainGuard<'a> {
    mtx: &'a NamedMutex,
    domain: Domain,
}

impl DomainGuard<'_> {
    pub fn domain(&self) -> Domain {
        self.domain
    }

    pub fn unlock(self) {}
}

impl Drop for DomainGuard<'_> {
    fn drop(&mut self) {
        self.mtx.unlock();
    }
}
