// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The save-record stream.
//!
//! A saved VM is a sequence of records, each introduced by a signed 32-bit
//! little-endian marker and followed by a payload whose layout is fixed by
//! the marker.  The first record carries the format version; the stream
//! ends with the [`Marker::End`] marker, which has no payload.  A stream may
//! carry an [`Record::Index`] record, just ahead of the end marker, listing
//! the byte offset of every record written before it.

use bitvec::prelude::*;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;
use uuid::Uuid;

use crate::common::PAGE_SIZE;

mod codec;

pub use codec::{decode_all, Reader, Writer};

/// Version written by [`Writer`], and the only one [`Reader`] accepts.
pub const FORMAT_VERSION: u32 = 1;

/// Upper bound on any variable-length payload accepted when decoding.
pub const MAX_BLOB: usize = 256 * 1024 * 1024;

#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Hash, IntoPrimitive, TryFromPrimitive,
)]
#[repr(i32)]
pub enum Marker {
    End = 0,
    Version = -1,
    VcpuInfo = -2,
    HvmIdentPt = -3,
    HvmVm86Tss = -4,
    TscInfo = -7,
    HvmConsolePfn = -8,
    HvmAcpiIoports = -10,
    HvmViridian = -11,
    HvmContext = -20,
    HvmDmState = -21,
    PageOffsets = -22,
    ZeroBitmap = -23,
    PageFingerprints = -24,
    DedupData = -25,
    VmUuid = -26,
    TemplateUuid = -27,
    TemplateFile = -28,
    Index = -29,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VcpuInfo {
    pub max_vcpu_id: u32,
    /// Bitmap of online vCPUs, bit `n` of byte `n / 8` for vCPU `n`.
    pub online: Vec<u8>,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TscInfo {
    pub mode: u32,
    pub nsec: u64,
    pub khz: u32,
    pub incarnation: u32,
}

/// Which pages of a capture were entirely zero.
///
/// Zero pages are elided from the page data; the bitmap lets a restore put
/// them back without reading anything.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ZeroBitmap {
    bits: BitVec<u8, Lsb0>,
}

impl ZeroBitmap {
    pub fn from_pages<'a>(pages: impl IntoIterator<Item = &'a [u8]>) -> Self {
        let bits = pages
            .into_iter()
            .map(|page| page.iter().all(|b| *b == 0))
            .collect();
        Self { bits }
    }

    pub(crate) fn from_raw(mut bytes: Vec<u8>, nbits: usize) -> Self {
        bytes.truncate((nbits + 7) / 8);
        let mut bits = BitVec::from_vec(bytes);
        bits.resize(nbits, false);
        Self { bits }
    }

    pub(crate) fn as_raw(&self) -> &[u8] {
        self.bits.as_raw_slice()
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn is_zero(&self, idx: usize) -> bool {
        self.bits.get(idx).map(|b| *b).unwrap_or(false)
    }

    pub fn zero_count(&self) -> usize {
        self.bits.count_ones()
    }

    /// Indices of the pages which carry data.
    pub fn nonzero(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.iter_zeros()
    }
}

/// Short content hash of one guest page, used for deduplication.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct PageFingerprint {
    pub gfn: u64,
    pub hash: u64,
}

impl PageFingerprint {
    pub fn of(gfn: u64, page: &[u8]) -> Self {
        debug_assert_eq!(page.len(), PAGE_SIZE);
        let digest = ring::digest::digest(&ring::digest::SHA256, page);
        let mut hash = [0u8; 8];
        hash.copy_from_slice(&digest.as_ref()[..8]);
        Self { gfn, hash: u64::from_le_bytes(hash) }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct IndexEntry {
    pub marker: Marker,
    pub offset: u64,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Record {
    Version(u32),
    VcpuInfo(VcpuInfo),
    HvmIdentPt(u64),
    HvmVm86Tss(u64),
    TscInfo(TscInfo),
    HvmConsolePfn(u64),
    HvmAcpiIoports(u64),
    HvmViridian(u64),
    HvmContext(Vec<u8>),
    HvmDmState(Vec<u8>),
    PageOffsets(Vec<u64>),
    ZeroBitmap(ZeroBitmap),
    PageFingerprints(Vec<PageFingerprint>),
    DedupData(Vec<u8>),
    VmUuid(Uuid),
    TemplateUuid(Uuid),
    TemplateFile(String),
    Index(Vec<IndexEntry>),
}

impl From<&Record> for Marker {
    fn from(r: &Record) -> Marker {
        match r {
            Record::Version(_) => Marker::Version,
            Record::VcpuInfo(_) => Marker::VcpuInfo,
            Record::HvmIdentPt(_) => Marker::HvmIdentPt,
            Record::HvmVm86Tss(_) => Marker::HvmVm86Tss,
            Record::TscInfo(_) => Marker::TscInfo,
            Record::HvmConsolePfn(_) => Marker::HvmConsolePfn,
            Record::HvmAcpiIoports(_) => Marker::HvmAcpiIoports,
            Record::HvmViridian(_) => Marker::HvmViridian,
            Record::HvmContext(_) => Marker::HvmContext,
            Record::HvmDmState(_) => Marker::HvmDmState,
            Record::PageOffsets(_) => Marker::PageOffsets,
            Record::ZeroBitmap(_) => Marker::ZeroBitmap,
            Record::PageFingerprints(_) => Marker::PageFingerprints,
            Record::DedupData(_) => Marker::DedupData,
            Record::VmUuid(_) => Marker::VmUuid,
            Record::TemplateUuid(_) => Marker::TemplateUuid,
            Record::TemplateFile(_) => Marker::TemplateFile,
            Record::Index(_) => Marker::Index,
        }
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unknown record marker {0}")]
    UnknownMarker(i32),

    #[error("unsupported format version {0}")]
    UnsupportedVersion(u32),

    #[error("stream does not start with a version record (found {0:?})")]
    MissingVersion(Marker),

    #[error("{marker:?} payload of {len} bytes exceeds limit")]
    PayloadTooLarge { marker: Marker, len: u64 },

    #[error("template path is not UTF-8")]
    BadUtf8(#[from] std::string::FromUtf8Error),

    #[error("zero bitmap failed to decompress: {0}")]
    Decompress(#[from] lz4_flex::block::DecompressError),

    #[error("{0} bytes follow the end of the stream")]
    TrailingBytes(usize),

    #[error("IO Error")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn marker_values() {
        assert_eq!(i32::from(Marker::End), 0);
        assert_eq!(i32::from(Marker::TscInfo), -7);
        assert_eq!(i32::from(Marker::Index), -29);
        assert_eq!(Marker::try_from(-23i32).unwrap(), Marker::ZeroBitmap);
        assert!(Marker::try_from(-5i32).is_err());
        assert!(Marker::try_from(1i32).is_err());
    }

    #[test]
    fn zero_bitmap_from_pages() {
        let zero = vec![0u8; PAGE_SIZE];
        let mut data = vec![0u8; PAGE_SIZE];
        data[PAGE_SIZE - 1] = 1;

        let pages = [&zero[..], &data[..], &zero[..]];
        let bm = ZeroBitmap::from_pages(pages);
        assert_eq!(bm.len(), 3);
        assert!(bm.is_zero(0));
        assert!(!bm.is_zero(1));
        assert!(bm.is_zero(2));
        assert!(!bm.is_zero(3));
        assert_eq!(bm.zero_count(), 2);
        assert_eq!(bm.nonzero().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn fingerprints_track_content() {
        let a = vec![0u8; PAGE_SIZE];
        let mut b = a.clone();
        b[17] = 1;

        let fa = PageFingerprint::of(5, &a);
        assert_eq!(fa, PageFingerprint::of(5, &a));
        assert_ne!(fa.hash, PageFingerprint::of(5, &b).hash);
        assert_eq!(fa.hash, PageFingerprint::of(6, &a).hash);
    }
}
