//! Data set: an ordered container of opaque byte payloads.
//!
//! Each record is its payload prefixed by a ULEB128 length. No
//! deduplication, MMH128 payload digest.

use bytes::Bytes;

use crate::recordset::{CheckType, RecordSetIn, RecordSetOut, RecordSetVersion};
use crate::vlq::{uleb128_decode, uleb128_encode};
use crate::{WireError, WireResult};

/// Data set format version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSetVersion {
    V1 = 1,
}

impl DataSetVersion {
    pub const MAX: DataSetVersion = DataSetVersion::V1;

    /// Maps the two version bits of the write-set header sets byte.
    pub fn from_bits(bits: u8) -> WireResult<Option<Self>> {
        match bits {
            0 => Ok(None),
            1 => Ok(Some(DataSetVersion::V1)),
            v => Err(WireError::VersionNotSupported {
                what: "data set",
                version: u32::from(v),
            }),
        }
    }
}

/// Data set builder.
pub struct DataSetOut {
    rs: RecordSetOut,
}

impl DataSetOut {
    pub fn new(rsv: RecordSetVersion, reserve: usize, max_size: usize) -> Self {
        Self {
            rs: RecordSetOut::with_reserve(CheckType::Mmh128, rsv, reserve, max_size),
        }
    }

    /// Appends one payload record; returns the serialized size consumed
    /// (length prefix plus payload).
    ///
    /// With `store` the bytes are copied into the builder; otherwise the
    /// shared buffer itself is emitted as a scatter fragment at gather time.
    pub fn append(&mut self, data: Bytes, store: bool) -> WireResult<usize> {
        // 8 bytes encode up to 56 bits of length; larger is unreal
        let mut prefix = [0u8; 8];
        let prefix_size = uleb128_encode(data.len() as u64, &mut prefix);

        let total = prefix_size + data.len();
        self.rs.append_stored(&prefix[..prefix_size], true)?;
        if store {
            self.rs.append_stored(&data, false)?;
        } else {
            self.rs.append_external(data, false)?;
        }
        Ok(total)
    }

    pub fn count(&self) -> usize {
        self.rs.count()
    }

    pub fn size(&self) -> usize {
        self.rs.size()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub fn page_count(&self) -> usize {
        self.rs.page_count()
    }

    /// Data set version for the write-set header sets byte; `None` when
    /// nothing was appended.
    pub fn version(&self) -> Option<DataSetVersion> {
        if self.is_empty() {
            None
        } else {
            Some(DataSetVersion::V1)
        }
    }

    pub fn gather(self, out: &mut Vec<Bytes>) -> usize {
        self.rs.gather(out)
    }
}

/// Data set reader.
///
/// A default-constructed reader represents an absent set (count 0).
#[derive(Debug, Clone, Default)]
pub struct DataSetIn {
    rs: Option<RecordSetIn>,
}

impl DataSetIn {
    /// Parses a data set at the front of `buf` (which may extend past it).
    pub fn parse(buf: Bytes, verify_payload: bool) -> WireResult<Self> {
        Ok(Self {
            rs: Some(RecordSetIn::parse(buf, verify_payload)?),
        })
    }

    pub fn count(&self) -> usize {
        self.rs.as_ref().map_or(0, RecordSetIn::count)
    }

    pub fn size(&self) -> usize {
        self.rs.as_ref().map_or(0, RecordSetIn::size)
    }

    pub fn serial_size(&self) -> usize {
        self.rs.as_ref().map_or(0, RecordSetIn::serial_size)
    }

    pub fn rewind(&self) {
        if let Some(rs) = &self.rs {
            rs.rewind();
        }
    }

    pub fn verify_checksum(&self) -> WireResult<()> {
        self.rs.as_ref().map_or(Ok(()), RecordSetIn::verify_checksum)
    }

    /// The stored payload digest; the data set digest doubles as the
    /// write-set signature.
    pub fn stored_checksum(&self) -> u64 {
        self.rs.as_ref().map_or(0, RecordSetIn::stored_checksum)
    }

    /// The full serialized set for re-emission.
    pub fn as_buf(&self) -> Bytes {
        self.rs.as_ref().map_or_else(Bytes::new, RecordSetIn::as_buf)
    }

    /// Returns the next payload (without its length prefix).
    pub fn next(&self) -> WireResult<Bytes> {
        let rs = self.rs.as_ref().ok_or(WireError::EndOfSet)?;
        let record = rs.next_record(|buf| {
            let (len, prefix) = uleb128_decode(buf)?;
            let len = usize::try_from(len).map_err(|_| WireError::VlqOverflow)?;
            Ok(prefix + len)
        })?;
        let (_, prefix) = uleb128_decode(&record)?;
        Ok(record.slice(prefix..))
    }
}
