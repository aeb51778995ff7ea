// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-session arena for engine buffers.
//!
//! All large engine allocations (the per-thread transport buffers) are
//! carved out of one anonymous mapping reserved when the session starts.
//! Individual buffers are never returned to the arena; the whole mapping is
//! released at once when the [`Heap`] and every [`HeapBuf`] taken from it
//! have been dropped.

use std::io::ErrorKind;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use slog::{debug, info};

use crate::common::{round_up, PAGE_SIZE};
use crate::mapping::AnonMapping;
use crate::Error;

struct Arena {
    map: AnonMapping,
    next: AtomicUsize,
}

pub struct Heap {
    arena: Arc<Arena>,
    log: slog::Logger,
}

impl Heap {
    /// Reserve an arena of (at least) `capacity` bytes.
    pub fn new(capacity: usize, log: &slog::Logger) -> Result<Self, Error> {
        let map = AnonMapping::new(capacity).map_err(|e| {
            match e.kind() {
                ErrorKind::OutOfMemory => Error::OutOfMemory("session heap"),
                _ if e.raw_os_error() == Some(libc::ENOMEM) => {
                    Error::OutOfMemory("session heap")
                }
                _ => Error::Io(e),
            }
        })?;
        let log = log.new(slog::o!("component" => "heap"));
        info!(log, "session heap reserved"; "bytes" => map.len());

        Ok(Self {
            arena: Arc::new(Arena { map, next: AtomicUsize::new(0) }),
            log,
        })
    }

    /// Carve a page-aligned buffer of `len` bytes out of the arena.
    pub fn alloc(&self, len: usize) -> Result<HeapBuf, Error> {
        let rounded = round_up(len.max(1), PAGE_SIZE)
            .ok_or(Error::OutOfMemory("heap buffer"))?;
        let capacity = self.arena.map.len();

        let offset = self
            .arena
            .next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |next| {
                next.checked_add(rounded).filter(|end| *end <= capacity)
            })
            .map_err(|_| Error::OutOfMemory("heap buffer"))?;
        debug!(self.log, "heap alloc"; "offset" => offset, "len" => len);

        // Safety: `offset + rounded` was checked to lie within the mapping,
        // and the bump allocator never hands out the same range twice.
        let ptr = unsafe { self.arena.map.as_ptr().add(offset) };
        Ok(HeapBuf {
            arena: self.arena.clone(),
            ptr: NonNull::new(ptr).expect("arena pointer is non-NULL"),
            offset,
            len,
        })
    }

    /// Bytes handed out so far, including alignment padding.
    pub fn used(&self) -> usize {
        self.arena.next.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.arena.map.len()
    }
}

/// A buffer carved from a [`Heap`].
///
/// Holds a reference on the arena, so the backing memory outlives the heap
/// handle itself if need be.
pub struct HeapBuf {
    arena: Arc<Arena>,
    ptr: NonNull<u8>,
    offset: usize,
    len: usize,
}

impl HeapBuf {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        // Safety: the region is exclusively owned by this buffer, and lies
        // within the arena mapping, which we hold a reference to.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // Safety: as above; `&mut self` guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Drop the physical backing of the buffer without giving up its address
    /// or length.  Contents read back as zeroes afterwards.
    pub fn reset(&mut self) -> std::io::Result<()> {
        let len = round_up(self.len, PAGE_SIZE).unwrap_or(self.len);
        self.arena.map.discard(self.offset, len)
    }
}

// Safety: a `HeapBuf` is the only handle to its region of the arena, and
// only hands out references to it under the usual borrowing rules.
unsafe impl Send for HeapBuf {}
unsafe impl Sync for HeapBuf {}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_util::test_logger;

    #[test]
    fn allocations_are_page_aligned_and_disjoint() {
        let heap = Heap::new(4 * PAGE_SIZE, &test_logger()).unwrap();
        let mut a = heap.alloc(10).unwrap();
        let mut b = heap.alloc(PAGE_SIZE + 1).unwrap();
        assert_eq!(heap.used(), 3 * PAGE_SIZE);
        assert_eq!(a.len(), 10);
        assert_eq!(b.len(), PAGE_SIZE + 1);
        assert_eq!(a.as_slice().as_ptr() as usize % PAGE_SIZE, 0);
        assert_eq!(b.as_slice().as_ptr() as usize % PAGE_SIZE, 0);

        a.as_mut_slice().fill(1);
        b.as_mut_slice().fill(2);
        assert!(a.as_slice().iter().all(|v| *v == 1));
        assert!(b.as_slice().iter().all(|v| *v == 2));
    }

    #[test]
    fn exhaustion_is_out_of_memory() {
        let heap = Heap::new(2 * PAGE_SIZE, &test_logger()).unwrap();
        let _a = heap.alloc(PAGE_SIZE).unwrap();
        let _b = heap.alloc(PAGE_SIZE).unwrap();
        assert!(matches!(heap.alloc(1), Err(Error::OutOfMemory(_))));
        assert_eq!(heap.used(), heap.capacity());
    }

    #[test]
    fn reset_keeps_address_and_zeroes() {
        let heap = Heap::new(PAGE_SIZE, &test_logger()).unwrap();
        let mut buf = heap.alloc(PAGE_SIZE).unwrap();
        buf.as_mut_slice().fill(0xff);
        let before = buf.as_slice().as_ptr();

        buf.reset().unwrap();
        assert_eq!(buf.as_slice().as_ptr(), before);
        assert_eq!(buf.len(), PAGE_SIZE);
        assert!(buf.as_slice().iter().all(|v| *v == 0));
    }

    #[test]
    fn buffers_outlive_heap_handle() {
        let heap = Heap::new(PAGE_SIZE, &test_logger()).unwrap();
        let mut buf = heap.alloc(PAGE_SIZE).unwrap();
        drop(heap);
        buf.as_mut_slice()[0] = 7;
        assert_eq!(buf.as_slice()[0], 7);
    }
}
