//! # galena-wire: the write-set codec
//!
//! Self-describing, checksum-protected binary containers carrying
//! transactional keys, data payloads and metadata between nodes:
//!
//! ```text
//! [WS header][   key set   ][         data set        ][ unordered ][ annotation ]
//! ```
//!
//! - [`RecordSetOut`] / [`RecordSetIn`] — length-prefixed, checksummed,
//!   aligned list of opaque records; the building block for everything else
//! - [`KeySetOut`] / [`KeySetIn`] — multi-part hierarchical keys with
//!   prefix-aware deduplication
//! - [`DataSetOut`] / [`DataSetIn`] — ordered byte-payload container
//! - [`WriteSetOut`] / [`WriteSetIn`] — the replication unit
//!
//! The wire layouts are bit-exact contracts between nodes; every constant in
//! this crate is load-bearing.

pub mod dataset;
pub mod keyset;
pub mod recordset;
pub mod vlq;
pub mod writeset;

use thiserror::Error;

pub use dataset::{DataSetIn, DataSetOut, DataSetVersion};
pub use keyset::{KeyData, KeyPart, KeySetIn, KeySetOut, KeySetVersion, KeyType};
pub use recordset::{CheckType, RecordSetIn, RecordSetOut, RecordSetVersion};
pub use writeset::{WriteSetIn, WriteSetOut, WriteSetVersion};

/// Result type for wire codec operations.
pub type WireResult<T> = Result<T, WireError>;

/// Errors raised by the wire codec.
///
/// Everything here indicates either a corrupt/incompatible input buffer or a
/// size-budget violation; invariant violations inside the codec are panics,
/// not errors.
#[derive(Debug, Error)]
pub enum WireError {
    /// Version byte outside the supported window.
    #[error("unsupported {what} version: {version}")]
    VersionNotSupported { what: &'static str, version: u32 },

    /// Checksum-type bits name an unknown or version-forbidden algorithm.
    #[error("unsupported record set checksum type: {0}")]
    CheckTypeNotSupported(u8),

    /// Write-set magic byte or fixed header fields are not recognizable.
    #[error("unrecognized write set header")]
    BadHeader,

    /// Declared size does not fit the supplied buffer.
    #[error("declared size {size} exceeds buffer size {buf_size}")]
    SizeExceedsBuffer { size: usize, buf_size: usize },

    /// Record count exceeds payload size; header is corrupt.
    #[error("corrupted record set header: count {count} exceeds size {size}")]
    CountExceedsSize { count: usize, size: usize },

    /// Header CRC mismatch.
    #[error("header checksum mismatch: computed {computed:#x}, found {found:#x}")]
    HeaderCrcMismatch { computed: u64, found: u64 },

    /// Payload checksum mismatch.
    #[error("payload checksum mismatch")]
    PayloadChecksumMismatch,

    /// A record's declared length runs past the set boundary.
    #[error("corrupted record set: record at {offset} extends beyond set boundary {size}")]
    RecordOverrun { offset: usize, size: usize },

    /// Forward cursor ran past the last record.
    #[error("access beyond record set end")]
    EndOfSet,

    /// Append would exceed the configured maximum serialized size.
    #[error("maximum write set size exceeded by {excess} bytes")]
    MsgTooLarge { excess: usize },

    /// VLQ value does not fit the target integer.
    #[error("VLQ value overflows 64 bits")]
    VlqOverflow,

    /// VLQ terminated by the end of the buffer.
    #[error("VLQ runs past end of buffer")]
    VlqTruncated,

    /// Key part prefix bits name an unknown certification level.
    #[error("unsupported key prefix: {0}")]
    BadKeyPrefix(u8),

    /// Attempt to match a key part with an empty (unversioned) key.
    #[error("attempt to match against an empty key")]
    EmptyKeyMatch,

    /// Buffer too short for the structure it claims to hold.
    #[error("buffer too short: expected {expected}, got {got}")]
    BufferTooShort { expected: usize, got: usize },
}
