//! # galena-crypto: hash and checksum kernels
//!
//! Integrity primitives for the Galena wire formats:
//!
//! - [`Mmh128`] — incremental MurmurHash3 x64-128, the record-set payload
//!   digest and the key-part hash
//! - [`fast_hash32`] / [`fast_hash64`] / [`fast_hash128`] — the header-hash
//!   family derived from it
//! - [`Crc32`] / [`Crc32c`] — incremental front-ends over `crc32fast` and
//!   `crc32c`, used by the transport framing
//!
//! All of these are format-defining: changing any of them breaks wire
//! compatibility between nodes.

pub mod crc;
pub mod mmh3;

pub use crc::{Crc32, Crc32c};
pub use mmh3::{mmh128, mmh32, mmh64, Mmh128};

/// 128-bit fast hash of a buffer, as 16 little-endian bytes.
pub fn fast_hash128(data: &[u8]) -> [u8; 16] {
    mmh128(data)
}

/// 64-bit fast hash of a buffer.
///
/// This is the write-set header checksum.
pub fn fast_hash64(data: &[u8]) -> u64 {
    mmh64(data)
}

/// 32-bit fast hash of a buffer.
///
/// This is the record-set header CRC.
pub fn fast_hash32(data: &[u8]) -> u32 {
    mmh32(data)
}
