//! Incremental CRC front-ends for the transport framing.
//!
//! The frame checksum is computed over discontiguous regions (a synthesized
//! length word, the frame header, then the payload), so both CRC kinds are
//! exposed with an append-style API.
//!
//! - [`Crc32`]: IEEE 802.3 polynomial, bit-compatible with the legacy
//!   (boost `crc_32_type`) checksum of older peers.
//! - [`Crc32c`]: Castagnoli polynomial.

/// Incremental CRC-32 (IEEE).
#[derive(Debug, Clone, Default)]
pub struct Crc32 {
    inner: crc32fast::Hasher,
}

impl Crc32 {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: crc32fast::Hasher::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    #[must_use]
    pub fn finalize(self) -> u32 {
        self.inner.finalize()
    }
}

/// Incremental CRC-32C (Castagnoli).
#[derive(Debug, Clone, Copy, Default)]
pub struct Crc32c {
    state: u32,
}

impl Crc32c {
    #[must_use]
    pub fn new() -> Self {
        Self { state: 0 }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.state = crc32c::crc32c_append(self.state, data);
    }

    #[must_use]
    pub fn finalize(self) -> u32 {
        self.state
    }
}
