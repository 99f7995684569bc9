//! Write set: the atomic replication unit.
//!
//! A serialized write set is a fixed 64-byte header followed by the key set,
//! the data set, an optional unordered set and an optional annotation set.
//! All multibyte header fields are little-endian:
//!
//! ```text
//! offset  bytes  field
//!      0      1  magic byte 'G'
//!      1      1  (max version << 4) | min supported version
//!      2      1  header size (payload offset)
//!      3      1  (keyset ver << 4) | (dataset ver << 2) | unord << 1 | annot
//!    4-5      2  flags
//!    6-7      2  parallel-applying range
//!   8-15      8  last-seen seqno / global seqno after certification
//!  16-23      8  timestamp (nanoseconds)
//!  24-39     16  source node UUID
//!  40-47      8  connection id
//!  48-55      8  transaction id
//!  56-63      8  header checksum (64-bit fast hash over bytes 0..55)
//! ```
//!
//! The `certified` flag is set only once the receiving cluster has assigned
//! a global seqno; `pa_range` then conveys the dependency window.

use std::thread::JoinHandle;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use galena_crypto::fast_hash64;
use galena_types::SourceId;

use crate::dataset::{DataSetIn, DataSetOut, DataSetVersion};
use crate::keyset::{KeyData, KeySetIn, KeySetOut, KeySetVersion};
use crate::recordset::RecordSetVersion;
use crate::{WireError, WireResult};

/// Write-set format version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WriteSetVersion {
    V3 = 3,
    V4 = 4,
    V5 = 5,
}

impl WriteSetVersion {
    /// Maximum header version this implementation understands.
    pub const MAX: WriteSetVersion = WriteSetVersion::V5;

    pub fn from_raw(v: u8) -> WireResult<Self> {
        match v {
            3 => Ok(WriteSetVersion::V3),
            4 => Ok(WriteSetVersion::V4),
            5 => Ok(WriteSetVersion::V5),
            v => Err(WireError::VersionNotSupported {
                what: "write set",
                version: u32::from(v),
            }),
        }
    }
}

/// Wire-stable write-set flags.
///
/// These are fixed by the wire protocol and must never be renumbered.
pub mod flag {
    pub const COMMIT: u16 = 1 << 0;
    pub const ROLLBACK: u16 = 1 << 1;
    pub const TOI: u16 = 1 << 2;
    pub const PA_UNSAFE: u16 = 1 << 3;
    pub const COMMUTATIVE: u16 = 1 << 4;
    pub const NATIVE: u16 = 1 << 5;
    pub const BEGIN: u16 = 1 << 6;
    pub const PREPARE: u16 = 1 << 7;
    /// Set once the receiving cluster assigned a global seqno (VER5 and up).
    pub const CERTIFIED: u16 = 1 << 14;
    /// Preordered event (VER5 and up).
    pub const PREORDERED: u16 = 1 << 15;
}

/// Hard cap on the serialized size of a write set.
pub const MAX_SIZE: usize = 0x7fff_ffff;

/// Largest representable parallel-applying range.
pub const MAX_PA_RANGE: u16 = u16::MAX;

const MAGIC: u8 = b'G';

const VERS_OFF: usize = 1;
const HSIZE_OFF: usize = 2;
const SETS_OFF: usize = 3;
const FLAGS_OFF: usize = 4;
const PA_OFF: usize = 6;
const SEQNO_OFF: usize = 8; // last-seen before certification, seqno after
const TIMESTAMP_OFF: usize = 16;
const SOURCE_OFF: usize = 24;
const CONN_OFF: usize = 40;
const TRX_OFF: usize = 48;
const CRC_OFF: usize = 56;
const HEADER_SIZE: usize = 64;
const CHECKSUM_SIZE: usize = 8;

const SETS_ANNOT_FLAG: u8 = 0x01;
const SETS_UNORD_FLAG: u8 = 0x02;

/// Payload size beyond which checksum verification moves to a worker thread.
pub const CHECK_SIZE_THRESHOLD: usize = 1 << 22; // 4 MiB

/// Detects the write-set version of a raw buffer.
///
/// The header names both the writer's version and the minimum version able
/// to read it; a reader picks the highest version it understands inside
/// that window and rejects write sets requiring more than [`WriteSetVersion::MAX`].
pub fn sniff_version(buf: &[u8]) -> WireResult<WriteSetVersion> {
    if buf.len() >= 4
        && buf[0] == MAGIC
        && buf[VERS_OFF] >= ((WriteSetVersion::V3 as u8) << 4 | WriteSetVersion::V3 as u8)
        && buf[HSIZE_OFF] >= 32
    {
        let min_ver = buf[VERS_OFF] & 0x0f;
        let max_ver = buf[VERS_OFF] >> 4;

        if min_ver <= max_ver {
            if max_ver < WriteSetVersion::MAX as u8 {
                return WriteSetVersion::from_raw(max_ver);
            }
            if min_ver <= WriteSetVersion::MAX as u8 {
                return Ok(WriteSetVersion::MAX);
            }
            // minimum required version is above anything we know
            return Err(WireError::VersionNotSupported {
                what: "write set",
                version: u32::from(min_ver),
            });
        }
    } else if buf.len() >= 4 && buf[1] == 0 && buf[2] == 0 && buf[3] <= 2 {
        // header from 2.x and before
        return Err(WireError::VersionNotSupported {
            what: "write set",
            version: u32::from(buf[3]),
        });
    }

    Err(WireError::BadHeader)
}

fn write_u16(buf: &mut [u8], off: usize, value: u16) {
    buf[off..off + 2].copy_from_slice(&value.to_le_bytes());
}

fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes(buf[off..off + 2].try_into().expect("2 bytes"))
}

fn write_u64(buf: &mut [u8], off: usize, value: u64) {
    buf[off..off + 8].copy_from_slice(&value.to_le_bytes());
}

fn read_u64(buf: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(buf[off..off + 8].try_into().expect("8 bytes"))
}

fn update_header_checksum(header: &mut [u8]) {
    let crc = fast_hash64(&header[..CRC_OFF]);
    write_u64(header, CRC_OFF, crc);
}

fn monotonic_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

struct Gathered {
    bufs: Vec<Bytes>,
    total: usize,
}

/// Write-set builder.
///
/// Keys, data, unordered payloads and annotations are appended against a
/// total size budget; [`WriteSetOut::gather`] seals the record sets and
/// fills the header, [`WriteSetOut::finalize`] stamps last-seen, timestamp
/// and the header checksum, after which [`WriteSetOut::gather_vec`] yields
/// the scatter list to hand to the transport.
pub struct WriteSetOut {
    header: [u8; HEADER_SIZE],
    ver: WriteSetVersion,
    trx_id: u64,
    keys: Option<KeySetOut>,
    data: Option<DataSetOut>,
    unrd: Option<DataSetOut>,
    annt: Option<DataSetOut>,
    rsv: RecordSetVersion,
    left: usize,
    flags: u16,
    gathered: Option<Gathered>,
    finalized: bool,
}

impl WriteSetOut {
    /// Creates a builder.
    ///
    /// `reserve` is the initial build-buffer size, split 1/8 to the key set,
    /// 5/8 to the data set and 2/8 to the unordered set; `max_size` caps the
    /// total serialized size.
    pub fn new(
        trx_id: u64,
        kver: KeySetVersion,
        reserve: usize,
        flags: u16,
        rsv: RecordSetVersion,
        ver: WriteSetVersion,
        max_size: usize,
    ) -> Self {
        let eighth = reserve / 8;
        let keys = KeySetOut::new(kver, rsv, ver as u8, eighth, usize::MAX);
        let data = DataSetOut::new(rsv, eighth * 5, usize::MAX);
        let unrd = DataSetOut::new(rsv, eighth * 2, usize::MAX);

        tracing::debug!(trx_id, ?ver, "new write set");

        let left = max_size
            .saturating_sub(keys.size())
            .saturating_sub(data.size())
            .saturating_sub(unrd.size())
            .saturating_sub(HEADER_SIZE);

        Self {
            header: [0; HEADER_SIZE],
            ver,
            trx_id,
            keys: Some(keys),
            data: Some(data),
            unrd: Some(unrd),
            annt: None,
            rsv,
            left,
            flags,
            gathered: None,
            finalized: false,
        }
    }

    fn charge(&mut self, used: usize) -> WireResult<()> {
        if used > self.left {
            tracing::debug!(trx_id = self.trx_id, "write set size budget exceeded");
            let excess = used - self.left;
            self.left = 0;
            return Err(WireError::MsgTooLarge { excess });
        }
        self.left -= used;
        Ok(())
    }

    /// Appends a key, deduplicated against earlier keys.
    pub fn append_key(&mut self, kd: &KeyData<'_>) -> WireResult<()> {
        let used = self.keys.as_mut().expect("gathered").append(kd)?;
        self.charge(used)
    }

    /// Appends an ordered data payload.
    pub fn append_data(&mut self, data: Bytes, store: bool) -> WireResult<()> {
        let used = self.data.as_mut().expect("gathered").append(data, store)?;
        self.charge(used)
    }

    /// Appends an out-of-order payload.
    pub fn append_unordered(&mut self, data: Bytes, store: bool) -> WireResult<()> {
        let used = self.unrd.as_mut().expect("gathered").append(data, store)?;
        self.charge(used)
    }

    /// Appends a human-readable annotation; the annotation set is created
    /// lazily on first use.
    pub fn append_annotation(&mut self, data: Bytes, store: bool) -> WireResult<()> {
        if self.annt.is_none() {
            let annt = DataSetOut::new(self.rsv, 0, usize::MAX);
            self.charge(annt.size())?;
            self.annt = Some(annt);
        }
        let used = self.annt.as_mut().expect("just created").append(data, store)?;
        self.charge(used)
    }

    pub fn set_flags(&mut self, flags: u16) {
        self.flags = flags;
    }

    pub fn add_flags(&mut self, flags: u16) {
        self.flags |= flags;
    }

    pub fn mark_toi(&mut self) {
        self.flags |= flag::TOI;
    }

    pub fn mark_pa_unsafe(&mut self) {
        self.flags |= flag::PA_UNSAFE;
    }

    pub fn is_empty(&self) -> bool {
        let counts = self.keys.as_ref().map_or(0, KeySetOut::count)
            + self.data.as_ref().map_or(0, DataSetOut::count)
            + self.unrd.as_ref().map_or(0, DataSetOut::count)
            + self.annt.as_ref().map_or(0, DataSetOut::count);
        counts == 0
    }

    /// Seals the record sets and fills every header field except last-seen,
    /// timestamp and checksum. Returns the total serialized length.
    pub fn gather(&mut self, source: &SourceId, conn: u64, trx: u64) -> WireResult<usize> {
        assert!(self.gathered.is_none(), "write set already gathered");

        let keys = self.keys.take().expect("not gathered");
        let data = self.data.take().expect("not gathered");
        let unrd = self.unrd.take().expect("not gathered");
        let annt = self.annt.take();

        let kver = keys.version().map_or(0, |v| v as u8);
        let dver = data.version().map_or(0, |v| v as u8);
        let sets = (kver << 4)
            | (dver << 2)
            | (u8::from(!unrd.is_empty()) * SETS_UNORD_FLAG)
            | (u8::from(annt.is_some()) * SETS_ANNOT_FLAG);

        self.header[0] = MAGIC;
        self.header[VERS_OFF] = ((self.ver as u8) << 4) | WriteSetVersion::V3 as u8;
        self.header[HSIZE_OFF] = HEADER_SIZE as u8;
        self.header[SETS_OFF] = sets;
        write_u16(&mut self.header, FLAGS_OFF, self.flags);
        // certified write sets will have a dependency window of at least 1
        write_u16(&mut self.header, PA_OFF, 0);
        self.header[SOURCE_OFF..SOURCE_OFF + 16].copy_from_slice(source.as_bytes());
        write_u64(&mut self.header, CONN_OFF, conn);
        write_u64(&mut self.header, TRX_OFF, trx);

        let mut bufs = Vec::with_capacity(
            keys.page_count() + data.page_count() + unrd.page_count() + 2,
        );
        let mut total = HEADER_SIZE;
        total += keys.gather(&mut bufs);
        total += data.gather(&mut bufs);
        total += unrd.gather(&mut bufs);
        if let Some(annt) = annt {
            total += annt.gather(&mut bufs);
        }

        self.gathered = Some(Gathered { bufs, total });
        Ok(total)
    }

    /// Completes the header in place: last-seen seqno, timestamp and the
    /// header checksum.
    pub fn finalize(&mut self, last_seen: i64, pa_range: i32) {
        assert!(self.gathered.is_some(), "finalize before gather");

        let pa = pa_range.clamp(0, i32::from(u16::MAX)) as u16;
        write_u16(&mut self.header, PA_OFF, pa);
        write_u64(&mut self.header, SEQNO_OFF, last_seen as u64);
        write_u64(&mut self.header, TIMESTAMP_OFF, monotonic_nanos());
        update_header_checksum(&mut self.header);
        self.finalized = true;
    }

    /// Finalizes a preordered event: no last-seen, dependency window shifted
    /// by one so that 0 can mean "failed certification".
    pub fn finalize_preordered(&mut self, pa_range: u16) {
        self.finalize(0, i32::from(pa_range) + 1);
    }

    /// The finalized scatter list: header first, then the record sets.
    pub fn gather_vec(&self) -> Vec<Bytes> {
        assert!(self.finalized, "write set not finalized");
        let gathered = self.gathered.as_ref().expect("gathered");

        let mut out = Vec::with_capacity(1 + gathered.bufs.len());
        out.push(Bytes::copy_from_slice(&self.header));
        out.extend(gathered.bufs.iter().cloned());
        out
    }

    /// Serializes the whole write set into one buffer (test convenience).
    pub fn serialize(
        &mut self,
        source: &SourceId,
        conn: u64,
        trx: u64,
        last_seen: i64,
        pa_range: i32,
    ) -> WireResult<Vec<u8>> {
        let total = self.gather(source, conn, trx)?;
        self.finalize(last_seen, pa_range);

        let mut out = Vec::with_capacity(total);
        for buf in self.gather_vec() {
            out.extend_from_slice(&buf);
        }
        debug_assert_eq!(out.len(), total);
        Ok(out)
    }
}

enum CheckState {
    /// Verification running on a worker thread.
    Pending(JoinHandle<bool>),
    Done(bool),
}

/// Write-set reader.
pub struct WriteSetIn {
    buf: Bytes,
    header: Vec<u8>,
    ver: WriteSetVersion,
    hsize: usize,
    keys: KeySetIn,
    data: DataSetIn,
    unrd: DataSetIn,
    annt: Option<DataSetIn>,
    check: CheckState,
}

impl WriteSetIn {
    /// Parses a write set, verifying the header checksum immediately.
    ///
    /// Payload checksums of sets up to [`CHECK_SIZE_THRESHOLD`] are verified
    /// inline; larger write sets verify on a one-shot worker thread joined
    /// by [`WriteSetIn::verify_checksum`].
    pub fn parse(buf: Bytes) -> WireResult<Self> {
        Self::with_threshold(buf, CHECK_SIZE_THRESHOLD)
    }

    /// As [`WriteSetIn::parse`] with an explicit background-checksum
    /// threshold; 0 skips payload verification entirely.
    pub fn with_threshold(buf: Bytes, threshold: usize) -> WireResult<Self> {
        let ver = sniff_version(&buf)?;

        let hsize = usize::from(buf[HSIZE_OFF]);
        if hsize > buf.len() {
            return Err(WireError::SizeExceedsBuffer {
                size: hsize,
                buf_size: buf.len(),
            });
        }
        if hsize < HEADER_SIZE {
            return Err(WireError::BadHeader);
        }

        let computed = fast_hash64(&buf[..hsize - CHECKSUM_SIZE]);
        let found = read_u64(&buf, hsize - CHECKSUM_SIZE);
        if computed != found {
            return Err(WireError::HeaderCrcMismatch { computed, found });
        }

        let header = buf[..hsize].to_vec();
        let sets = header[SETS_OFF];

        let mut off = hsize;

        let keys = match KeySetVersion::from_bits(sets >> 4)? {
            Some(_kver) => {
                let ks = KeySetIn::parse(buf.slice(off..), false)?;
                off += ks.serial_size();
                ks
            }
            None => KeySetIn::default(),
        };

        let mut data = DataSetIn::default();
        let mut unrd = DataSetIn::default();
        let mut annt = None;

        if DataSetVersion::from_bits((sets >> 2) & 0x03)?.is_some() {
            data = DataSetIn::parse(buf.slice(off..), false)?;
            off += data.serial_size();

            if sets & SETS_UNORD_FLAG != 0 {
                unrd = DataSetIn::parse(buf.slice(off..), false)?;
                off += unrd.serial_size();
            }

            if sets & SETS_ANNOT_FLAG != 0 {
                annt = Some(DataSetIn::parse(buf.slice(off..), false)?);
            }
        }

        let check = if threshold == 0 {
            // checksum skipped by request
            CheckState::Done(true)
        } else if buf.len() >= threshold {
            // buffer too big, checksum in the background
            let (k, d, u) = (keys.clone(), data.clone(), unrd.clone());
            CheckState::Pending(std::thread::spawn(move || run_checksums(&k, &d, &u)))
        } else {
            if !run_checksums(&keys, &data, &unrd) {
                return Err(WireError::PayloadChecksumMismatch);
            }
            CheckState::Done(true)
        };

        Ok(Self {
            buf,
            header,
            ver,
            hsize,
            keys,
            data,
            unrd,
            annt,
            check,
        })
    }

    pub fn version(&self) -> WriteSetVersion {
        self.ver
    }

    /// Total serialized size.
    pub fn size(&self) -> usize {
        self.buf.len()
    }

    pub fn flags(&self) -> u16 {
        read_u16(&self.header, FLAGS_OFF)
    }

    pub fn is_toi(&self) -> bool {
        self.flags() & flag::TOI != 0
    }

    pub fn pa_unsafe(&self) -> bool {
        self.flags() & flag::PA_UNSAFE != 0
    }

    pub fn pa_range(&self) -> u16 {
        read_u16(&self.header, PA_OFF)
    }

    /// Whether certification has stamped this write set with a global seqno.
    pub fn certified(&self) -> bool {
        if self.ver >= WriteSetVersion::V5 {
            self.flags() & flag::CERTIFIED != 0
        } else {
            self.pa_range() != 0
        }
    }

    /// Last seen seqno as recorded by the originator.
    pub fn last_seen(&self) -> i64 {
        debug_assert!(self.pa_range() == 0 || self.ver >= WriteSetVersion::V5);
        self.seqno()
    }

    /// Global seqno (aliases the last-seen slot after certification).
    pub fn seqno(&self) -> i64 {
        read_u64(&self.header, SEQNO_OFF) as i64
    }

    pub fn timestamp(&self) -> u64 {
        read_u64(&self.header, TIMESTAMP_OFF)
    }

    pub fn source_id(&self) -> SourceId {
        SourceId::from_bytes(
            self.header[SOURCE_OFF..SOURCE_OFF + 16]
                .try_into()
                .expect("16 bytes"),
        )
    }

    pub fn conn_id(&self) -> u64 {
        read_u64(&self.header, CONN_OFF)
    }

    pub fn trx_id(&self) -> u64 {
        read_u64(&self.header, TRX_OFF)
    }

    pub fn keyset(&self) -> &KeySetIn {
        &self.keys
    }

    pub fn dataset(&self) -> &DataSetIn {
        &self.data
    }

    pub fn unrdset(&self) -> &DataSetIn {
        &self.unrd
    }

    pub fn annotated(&self) -> bool {
        self.annt.is_some()
    }

    /// Appends the annotation text to `out`.
    pub fn write_annotation(&self, out: &mut String) {
        if let Some(annt) = &self.annt {
            annt.rewind();
            for _ in 0..annt.count() {
                match annt.next() {
                    Ok(buf) => out.push_str(&String::from_utf8_lossy(&buf)),
                    Err(_) => break,
                }
            }
        }
    }

    /// Joins any background verification and raises on mismatch.
    ///
    /// Call right after the certification verdict is obtained and before the
    /// write set is consumed.
    pub fn verify_checksum(&mut self) -> WireResult<()> {
        if let CheckState::Pending(handle) = std::mem::replace(&mut self.check, CheckState::Done(false))
        {
            let ok = handle.join().unwrap_or(false);
            self.check = CheckState::Done(ok);
        }

        match self.check {
            CheckState::Done(true) => Ok(()),
            _ => Err(WireError::PayloadChecksumMismatch),
        }
    }

    /// The data-set digest; the only part guaranteed stable through the
    /// write set's lifetime, so it doubles as the write-set signature.
    pub fn stored_checksum(&self) -> u64 {
        self.data.stored_checksum()
    }

    /// Stamps the certification outcome: sets the certified flag, the global
    /// seqno and the dependency window, and recomputes the header checksum.
    pub fn set_seqno(&mut self, seqno: i64, pa_range: u32) {
        assert!(seqno > 0, "global seqno must be positive");

        // cap the dependency window at what the field can represent
        let pa = pa_range.min(u32::from(MAX_PA_RANGE)) as u16;

        let flags = read_u16(&self.header, FLAGS_OFF) | flag::CERTIFIED;
        write_u16(&mut self.header, FLAGS_OFF, flags);
        write_u16(&mut self.header, PA_OFF, pa);
        write_u64(&mut self.header, SEQNO_OFF, seqno as u64);
        update_header_checksum(&mut self.header);
    }

    /// Re-emits the write set, optionally without keys and/or the unordered
    /// set, so a certification-only peer can receive keys without data or
    /// vice versa. The header copy has the versions of excluded sets zeroed
    /// and its checksum recomputed.
    pub fn gather(&self, include_keys: bool, include_unrd: bool) -> (Vec<Bytes>, usize) {
        if include_keys && include_unrd {
            let bufs = vec![
                Bytes::copy_from_slice(&self.header),
                self.buf.slice(self.hsize..),
            ];
            let total = self.buf.len();
            return (bufs, total);
        }

        let mut header = self.header.clone();
        let mask = 0x0c
            | (u8::from(include_keys) * 0xf0)
            | (u8::from(include_unrd) * SETS_UNORD_FLAG);
        header[SETS_OFF] &= mask;
        update_header_checksum(&mut header);

        let mut total = header.len();
        let mut bufs = Vec::with_capacity(4);
        bufs.push(Bytes::from(header));

        if include_keys {
            let keys = self.keys.as_buf();
            total += keys.len();
            bufs.push(keys);
        }

        let data = self.data.as_buf();
        total += data.len();
        bufs.push(data);

        if include_unrd {
            let unrd = self.unrd.as_buf();
            total += unrd.len();
            bufs.push(unrd);
        }

        (bufs, total)
    }
}

impl Drop for WriteSetIn {
    fn drop(&mut self) {
        if let CheckState::Pending(handle) =
            std::mem::replace(&mut self.check, CheckState::Done(false))
        {
            let _ = handle.join();
        }
    }
}

fn run_checksums(keys: &KeySetIn, data: &DataSetIn, unrd: &DataSetIn) -> bool {
    let result = keys
        .verify_checksum()
        .and_then(|()| data.verify_checksum())
        .and_then(|()| unrd.verify_checksum());

    match result {
        Ok(()) => true,
        Err(err) => {
            tracing::error!("write set checksum failed: {err}");
            false
        }
    }
}
