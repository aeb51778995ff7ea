// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Encoding and decoding of save records.
//!
//! Every multi-byte field is little-endian.  Variable-length payloads carry
//! an explicit count or length ahead of their contents, which the decoder
//! checks against [`MAX_BLOB`] before allocating anything.

use std::io::{self, Cursor, ErrorKind, Read, Write};

use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use uuid::Uuid;

use super::{
    DecodeError, IndexEntry, Marker, PageFingerprint, Record, TscInfo,
    VcpuInfo, ZeroBitmap, FORMAT_VERSION, MAX_BLOB,
};

/// Sink for a save-record stream.
pub struct Writer<W: Write> {
    inner: W,
    pos: u64,
    index: Option<Vec<IndexEntry>>,
}

impl<W: Write> Writer<W> {
    /// Start a stream, emitting its leading version record.
    pub fn new(inner: W, version: u32) -> io::Result<Self> {
        let mut writer = Self { inner, pos: 0, index: None };
        writer.write(&Record::Version(version))?;
        Ok(writer)
    }

    /// Record the offset of every subsequent record, to be emitted as an
    /// index ahead of the end marker.
    pub fn with_index(mut self) -> Self {
        self.index = Some(Vec::new());
        self
    }

    /// Bytes written so far.
    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn write(&mut self, rec: &Record) -> io::Result<()> {
        let marker = Marker::from(rec);
        let mut buf = Vec::new();
        buf.write_i32::<LE>(marker.into())?;
        encode_payload(rec, &mut buf)?;
        self.inner.write_all(&buf)?;

        if let Some(index) = self.index.as_mut() {
            index.push(IndexEntry { marker, offset: self.pos });
        }
        self.pos += buf.len() as u64;
        Ok(())
    }

    /// Close the stream (index first, if enabled) and hand back the sink.
    pub fn finish(mut self) -> io::Result<W> {
        if let Some(entries) = self.index.take() {
            self.write(&Record::Index(entries))?;
        }
        self.inner.write_i32::<LE>(Marker::End.into())?;
        self.pos += std::mem::size_of::<i32>() as u64;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

fn too_long(what: &str) -> io::Error {
    io::Error::new(ErrorKind::InvalidInput, format!("{what} too long to encode"))
}

/// Length field for a payload of `count` entries of `entry_size` bytes.
fn length_field(count: usize, entry_size: usize) -> io::Result<u32> {
    match count.checked_mul(entry_size) {
        Some(bytes) if bytes <= MAX_BLOB => Ok(count as u32),
        _ => Err(too_long("payload")),
    }
}

fn put_blob(buf: &mut Vec<u8>, data: &[u8]) -> io::Result<()> {
    buf.write_u32::<LE>(length_field(data.len(), 1)?)?;
    buf.write_all(data)
}

fn encode_payload(rec: &Record, buf: &mut Vec<u8>) -> io::Result<()> {
    match rec {
        Record::Version(v) => buf.write_u32::<LE>(*v)?,
        Record::VcpuInfo(info) => {
            buf.write_u32::<LE>(info.max_vcpu_id)?;
            put_blob(buf, &info.online)?;
        }
        Record::HvmIdentPt(v)
        | Record::HvmVm86Tss(v)
        | Record::HvmConsolePfn(v)
        | Record::HvmAcpiIoports(v)
        | Record::HvmViridian(v) => buf.write_u64::<LE>(*v)?,
        Record::TscInfo(tsc) => {
            buf.write_u32::<LE>(tsc.mode)?;
            buf.write_u64::<LE>(tsc.nsec)?;
            buf.write_u32::<LE>(tsc.khz)?;
            buf.write_u32::<LE>(tsc.incarnation)?;
        }
        Record::HvmContext(data)
        | Record::HvmDmState(data)
        | Record::DedupData(data) => put_blob(buf, data)?,
        Record::PageOffsets(offsets) => {
            buf.write_u32::<LE>(length_field(offsets.len(), 8)?)?;
            for off in offsets {
                buf.write_u64::<LE>(*off)?;
            }
        }
        Record::ZeroBitmap(bm) => {
            let nbits = u32::try_from(bm.len())
                .map_err(|_| too_long("zero bitmap"))?;
            buf.write_u32::<LE>(nbits)?;
            put_blob(buf, &lz4_flex::block::compress(bm.as_raw()))?;
        }
        Record::PageFingerprints(fps) => {
            buf.write_u32::<LE>(length_field(fps.len(), 16)?)?;
            for fp in fps {
                buf.write_u64::<LE>(fp.gfn)?;
                buf.write_u64::<LE>(fp.hash)?;
            }
        }
        Record::VmUuid(id) | Record::TemplateUuid(id) => {
            buf.write_all(id.as_bytes())?
        }
        Record::TemplateFile(path) => {
            let len = u16::try_from(path.len())
                .map_err(|_| too_long("template path"))?;
            buf.write_u16::<LE>(len)?;
            buf.write_all(path.as_bytes())?;
        }
        Record::Index(entries) => {
            buf.write_u32::<LE>(length_field(entries.len(), 12)?)?;
            for entry in entries {
                buf.write_i32::<LE>(entry.marker.into())?;
                buf.write_u64::<LE>(entry.offset)?;
            }
        }
    }
    Ok(())
}

/// Source of a save-record stream.
pub struct Reader<R: Read> {
    inner: R,
    version: u32,
    done: bool,
}

impl<R: Read> Reader<R> {
    /// Open a stream, consuming and checking its version record.
    pub fn new(mut inner: R) -> Result<Self, DecodeError> {
        let marker = read_marker(&mut inner)?;
        if marker != Marker::Version {
            return Err(DecodeError::MissingVersion(marker));
        }
        let version = inner.read_u32::<LE>()?;
        if version != FORMAT_VERSION {
            return Err(DecodeError::UnsupportedVersion(version));
        }
        Ok(Self { inner, version, done: false })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// The next record, or `None` once the end marker has been consumed.
    pub fn next_record(&mut self) -> Result<Option<Record>, DecodeError> {
        if self.done {
            return Ok(None);
        }
        match read_marker(&mut self.inner)? {
            Marker::End => {
                self.done = true;
                Ok(None)
            }
            marker => decode_payload(marker, &mut self.inner).map(Some),
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Iterator for Reader<R> {
    type Item = Result<Record, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_record() {
            Ok(rec) => rec.map(Ok),
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Decode a complete stream held in memory, returning every record after
/// the version record.
pub fn decode_all(buf: &[u8]) -> Result<Vec<Record>, DecodeError> {
    let mut cursor = Cursor::new(buf);
    let mut records = Vec::new();
    {
        let mut reader = Reader::new(&mut cursor)?;
        while let Some(rec) = reader.next_record()? {
            records.push(rec);
        }
    }
    match buf.len() - cursor.position() as usize {
        0 => Ok(records),
        n => Err(DecodeError::TrailingBytes(n)),
    }
}

fn read_marker(r: &mut impl Read) -> Result<Marker, DecodeError> {
    let raw = r.read_i32::<LE>()?;
    Marker::try_from(raw).map_err(|_| DecodeError::UnknownMarker(raw))
}

/// Validate that `count` entries of `entry_size` bytes fit the payload
/// limit.
fn checked_len(
    marker: Marker,
    count: u32,
    entry_size: usize,
) -> Result<usize, DecodeError> {
    let count = count as usize;
    match count.checked_mul(entry_size) {
        Some(len) if len <= MAX_BLOB => Ok(count),
        _ => Err(DecodeError::PayloadTooLarge {
            marker,
            len: count as u64 * entry_size as u64,
        }),
    }
}

fn read_bytes(r: &mut impl Read, len: usize) -> io::Result<Vec<u8>> {
    let mut data = vec![0u8; len];
    r.read_exact(&mut data)?;
    Ok(data)
}

fn read_blob(r: &mut impl Read, marker: Marker) -> Result<Vec<u8>, DecodeError> {
    let len = checked_len(marker, r.read_u32::<LE>()?, 1)?;
    Ok(read_bytes(r, len)?)
}

fn read_uuid(r: &mut impl Read) -> io::Result<Uuid> {
    let mut bytes = [0u8; 16];
    r.read_exact(&mut bytes)?;
    Ok(Uuid::from_bytes(bytes))
}

fn decode_payload(
    marker: Marker,
    r: &mut impl Read,
) -> Result<Record, DecodeError> {
    let rec = match marker {
        Marker::End => unreachable!("end marker carries no payload"),
        Marker::Version => Record::Version(r.read_u32::<LE>()?),
        Marker::VcpuInfo => {
            let max_vcpu_id = r.read_u32::<LE>()?;
            let online = read_blob(r, marker)?;
            Record::VcpuInfo(VcpuInfo { max_vcpu_id, online })
        }
        Marker::HvmIdentPt => Record::HvmIdentPt(r.read_u64::<LE>()?),
        Marker::HvmVm86Tss => Record::HvmVm86Tss(r.read_u64::<LE>()?),
        Marker::TscInfo => Record::TscInfo(TscInfo {
            mode: r.read_u32::<LE>()?,
            nsec: r.read_u64::<LE>()?,
            khz: r.read_u32::<LE>()?,
            incarnation: r.read_u32::<LE>()?,
        }),
        Marker::HvmConsolePfn => Record::HvmConsolePfn(r.read_u64::<LE>()?),
        Marker::HvmAcpiIoports => Record::HvmAcpiIoports(r.read_u64::<LE>()?),
        Marker::HvmViridian => Record::HvmViridian(r.read_u64::<LE>()?),
        Marker::HvmContext => Record::HvmContext(read_blob(r, marker)?),
        Marker::HvmDmState => Record::HvmDmState(read_blob(r, marker)?),
        Marker::DedupData => Record::DedupData(read_blob(r, marker)?),
        Marker::PageOffsets => {
            let count = checked_len(marker, r.read_u32::<LE>()?, 8)?;
            let offsets = (0..count)
                .map(|_| r.read_u64::<LE>())
                .collect::<io::Result<Vec<_>>>()?;
            Record::PageOffsets(offsets)
        }
        Marker::ZeroBitmap => {
            let nbits = r.read_u32::<LE>()? as usize;
            let raw_len = checked_len(marker, ((nbits + 7) / 8) as u32, 1)?;
            let packed = read_blob(r, marker)?;
            let raw = lz4_flex::block::decompress(&packed, raw_len)?;
            if raw.len() != raw_len {
                return Err(DecodeError::Io(io::Error::new(
                    ErrorKind::InvalidData,
                    format!(
                        "zero bitmap holds {} bytes, {raw_len} expected",
                        raw.len()
                    ),
                )));
            }
            Record::ZeroBitmap(ZeroBitmap::from_raw(raw, nbits))
        }
        Marker::PageFingerprints => {
            let count = checked_len(marker, r.read_u32::<LE>()?, 16)?;
            let fps = (0..count)
                .map(|_| {
                    Ok(PageFingerprint {
                        gfn: r.read_u64::<LE>()?,
                        hash: r.read_u64::<LE>()?,
                    })
                })
                .collect::<io::Result<Vec<_>>>()?;
            Record::PageFingerprints(fps)
        }
        Marker::VmUuid => Record::VmUuid(read_uuid(r)?),
        Marker::TemplateUuid => Record::TemplateUuid(read_uuid(r)?),
        Marker::TemplateFile => {
            let len = r.read_u16::<LE>()? as usize;
            let path = String::from_utf8(read_bytes(r, len)?)?;
            Record::TemplateFile(path)
        }
        Marker::Index => {
            let count = checked_len(marker, r.read_u32::<LE>()?, 12)?;
            let mut entries = Vec::with_capacity(count);
            for _ in 0..count {
                let marker = read_marker(r)?;
                let offset = r.read_u64::<LE>()?;
                entries.push(IndexEntry { marker, offset });
            }
            Record::Index(entries)
        }
    };
    Ok(rec)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::PAGE_SIZE;

    fn stream(records: &[Record]) -> Vec<u8> {
        let mut w = Writer::new(Vec::new(), FORMAT_VERSION).unwrap();
        for rec in records {
            w.write(rec).unwrap();
        }
        w.finish().unwrap()
    }

    #[test]
    fn fingerprint_table() {
        let fps: Vec<PageFingerprint> = (0..3u64)
            .map(|gfn| PageFingerprint::of(gfn, &vec![gfn as u8; PAGE_SIZE]))
            .collect();
        let buf = stream(&[Record::PageFingerprints(fps.clone())]);

        // marker + version, marker + count + 3 entries, end marker
        assert_eq!(buf.len(), 8 + 8 + 3 * 16 + 4);
        assert_eq!(&buf[..4], &(-1i32).to_le_bytes());
        assert_eq!(&buf[8..12], &(-24i32).to_le_bytes());
        assert_eq!(&buf[buf.len() - 4..], &0i32.to_le_bytes());

        let records = decode_all(&buf).unwrap();
        assert_eq!(records, vec![Record::PageFingerprints(fps)]);
    }

    #[test]
    fn full_stream_decodes() {
        let zero = vec![0u8; PAGE_SIZE];
        let data = vec![0x5au8; PAGE_SIZE];
        let bitmap =
            ZeroBitmap::from_pages([&zero[..], &data[..], &zero[..], &zero[..]]);

        let records = vec![
            Record::VmUuid(Uuid::new_v4()),
            Record::TemplateUuid(Uuid::new_v4()),
            Record::TemplateFile("/var/lib/templates/base.img".to_string()),
            Record::VcpuInfo(VcpuInfo { max_vcpu_id: 3, online: vec![0b1011] }),
            Record::TscInfo(TscInfo {
                mode: 1,
                nsec: 123_456_789,
                khz: 2_400_000,
                incarnation: 2,
            }),
            Record::HvmIdentPt(0xfeffc000),
            Record::HvmVm86Tss(0xfeffd000),
            Record::HvmConsolePfn(0xfeffe),
            Record::HvmAcpiIoports(1),
            Record::HvmViridian(0),
            Record::HvmContext(vec![1, 2, 3, 4]),
            Record::HvmDmState(Vec::new()),
            Record::PageOffsets(vec![0, 4096, 3 * 4096]),
            Record::ZeroBitmap(bitmap),
            Record::DedupData(vec![9; 100]),
        ];
        let decoded = decode_all(&stream(&records)).unwrap();
        assert_eq!(decoded, records);

        let Record::ZeroBitmap(bm) = &decoded[13] else {
            panic!("expected zero bitmap");
        };
        assert_eq!(bm.nonzero().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn index_points_at_records() {
        let mut w = Writer::new(Vec::new(), FORMAT_VERSION).unwrap().with_index();
        w.write(&Record::HvmIdentPt(1)).unwrap();
        w.write(&Record::HvmContext(vec![0; 33])).unwrap();
        w.write(&Record::VmUuid(Uuid::nil())).unwrap();
        let buf = w.finish().unwrap();

        let records = decode_all(&buf).unwrap();
        let Some(Record::Index(entries)) = records.last() else {
            panic!("expected trailing index");
        };
        assert_eq!(
            entries.iter().map(|e| e.marker).collect::<Vec<_>>(),
            vec![Marker::HvmIdentPt, Marker::HvmContext, Marker::VmUuid]
        );
        for entry in entries {
            let at = entry.offset as usize;
            let raw = i32::from_le_bytes(buf[at..at + 4].try_into().unwrap());
            assert_eq!(raw, i32::from(entry.marker));
        }
    }

    #[test]
    fn reader_iterates_to_end() {
        let buf = stream(&[Record::HvmViridian(1), Record::HvmViridian(2)]);
        let mut reader = Reader::new(&buf[..]).unwrap();
        assert_eq!(reader.version(), FORMAT_VERSION);
        let records: Vec<_> = reader.by_ref().collect::<Result<_, _>>().unwrap();
        assert_eq!(records.len(), 2);
        assert!(reader.next_record().unwrap().is_none());
    }

    #[test]
    fn unknown_marker() {
        let mut buf = stream(&[]);
        let end = buf.split_off(buf.len() - 4);
        buf.extend_from_slice(&(-5i32).to_le_bytes());
        buf.extend(end);
        assert!(matches!(decode_all(&buf), Err(DecodeError::UnknownMarker(-5))));
    }

    #[test]
    fn version_checks() {
        let buf = Writer::new(Vec::new(), 2).unwrap().finish().unwrap();
        assert!(matches!(
            decode_all(&buf),
            Err(DecodeError::UnsupportedVersion(2))
        ));

        let buf = 0i32.to_le_bytes();
        assert!(matches!(
            decode_all(&buf),
            Err(DecodeError::MissingVersion(Marker::End))
        ));
    }

    #[test]
    fn truncated_payload() {
        let buf = stream(&[Record::HvmContext(vec![7; 64])]);
        let res = decode_all(&buf[..buf.len() - 10]);
        match res {
            Err(DecodeError::Io(e)) => {
                assert_eq!(e.kind(), ErrorKind::UnexpectedEof)
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn trailing_bytes() {
        let mut buf = stream(&[Record::HvmIdentPt(3)]);
        buf.extend_from_slice(&[1, 2, 3]);
        assert!(matches!(decode_all(&buf), Err(DecodeError::TrailingBytes(3))));
    }

    #[test]
    fn oversized_payloads_rejected() {
        let mut buf = Writer::new(Vec::new(), FORMAT_VERSION)
            .unwrap()
            .into_inner_for_test();
        buf.extend_from_slice(&i32::from(Marker::HvmContext).to_le_bytes());
        buf.extend_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            decode_all(&buf),
            Err(DecodeError::PayloadTooLarge { marker: Marker::HvmContext, .. })
        ));

        let long = "x".repeat(u16::MAX as usize + 1);
        let mut w = Writer::new(Vec::new(), FORMAT_VERSION).unwrap();
        let err = w.write(&Record::TemplateFile(long)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn template_path_must_be_utf8() {
        let mut buf = Writer::new(Vec::new(), FORMAT_VERSION)
            .unwrap()
            .into_inner_for_test();
        buf.extend_from_slice(&i32::from(Marker::TemplateFile).to_le_bytes());
        buf.extend_from_slice(&2u16.to_le_bytes());
        buf.extend_from_slice(&[0xc3, 0x28]);
        buf.extend_from_slice(&0i32.to_le_bytes());
        assert!(matches!(decode_all(&buf), Err(DecodeError::BadUtf8(_))));
    }

    impl Writer<Vec<u8>> {
        /// The bytes written so far, without an end marker.
        fn into_inner_for_test(self) -> Vec<u8> {
            self.inner
        }
    }
}
