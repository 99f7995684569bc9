//! Frame header and datagram container.
//!
//! Every frame on the wire starts with an 8-byte `NetHeader` of two
//! little-endian 32-bit words:
//!
//! ```text
//! | version(4) | reserved(2) | F_CRC32C | F_CRC32 | length(24) |
//! |                        CRC-32                              |
//! ```
//!
//! The length field counts the bytes after the header. When a checksum flag
//! is set, the second word carries a 32-bit CRC over the little-endian
//! length word followed by the frame body; otherwise it is zero.
//!
//! A [`Datagram`] carries a payload plus prepend headroom so each protocol
//! layer can push its own header without copying the payload.

use bytes::Bytes;

use galena_crypto::{Crc32, Crc32c};

use crate::{NetError, NetResult};

/// Serialized size of the frame header.
pub const NET_HEADER_SIZE: usize = 8;

const LEN_MASK: u32 = 0x00ff_ffff;
const FLAGS_MASK: u32 = 0x0f00_0000;
const FLAGS_SHIFT: u32 = 24;
const VERSION_MASK: u32 = 0xf000_0000;
const VERSION_SHIFT: u32 = 28;

const F_CRC32: u32 = 1 << 24; // backward compatible
const F_CRC32C: u32 = 1 << 25;

/// Frame checksum algorithm, selected by the `socket.checksum`
/// configuration index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumKind {
    None,
    Crc32,
    Crc32c,
}

impl ChecksumKind {
    /// Maps the configuration index; unknown values fall back to CRC-32
    /// with a warning, as the legacy implementation does.
    pub fn from_index(index: u8) -> Self {
        match index {
            0 => {
                tracing::info!("message checksums disabled");
                ChecksumKind::None
            }
            1 => {
                tracing::info!("using CRC-32 (backward-compatible) for message checksums");
                ChecksumKind::Crc32
            }
            2 => {
                tracing::info!("using CRC-32C for message checksums");
                ChecksumKind::Crc32c
            }
            other => {
                tracing::warn!("ignoring unknown checksum type: {other}, falling back to CRC-32");
                ChecksumKind::Crc32
            }
        }
    }
}

/// The 8-byte frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetHeader {
    len: u32,
    crc32: u32,
}

impl NetHeader {
    /// Creates a version-0 header for a frame body of `len` bytes.
    pub fn new(len: usize) -> NetResult<Self> {
        if len > LEN_MASK as usize {
            return Err(NetError::FrameTooLong { len });
        }
        Ok(Self {
            len: len as u32,
            crc32: 0,
        })
    }

    /// Frame body length.
    pub fn len(&self) -> usize {
        (self.len & LEN_MASK) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records the checksum value and sets the matching flag bit.
    pub fn set_crc32(&mut self, crc32: u32, kind: ChecksumKind) {
        match kind {
            ChecksumKind::Crc32 => self.len |= F_CRC32,
            ChecksumKind::Crc32c => self.len |= F_CRC32C,
            ChecksumKind::None => unreachable!("checksum kind none"),
        }
        self.crc32 = crc32;
    }

    pub fn has_crc32(&self) -> bool {
        self.len & F_CRC32 != 0
    }

    pub fn has_crc32c(&self) -> bool {
        self.len & F_CRC32C != 0
    }

    pub fn crc32(&self) -> u32 {
        self.crc32
    }

    pub fn version(&self) -> u8 {
        ((self.len & VERSION_MASK) >> VERSION_SHIFT) as u8
    }

    pub fn serialize(&self) -> [u8; NET_HEADER_SIZE] {
        let mut buf = [0u8; NET_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.len.to_le_bytes());
        buf[4..8].copy_from_slice(&self.crc32.to_le_bytes());
        buf
    }

    /// Parses and validates a header: only version 0 with at most one
    /// checksum flag is accepted.
    pub fn parse(buf: &[u8]) -> NetResult<Self> {
        assert!(buf.len() >= NET_HEADER_SIZE, "short header buffer");

        let len = u32::from_le_bytes(buf[0..4].try_into().expect("4 bytes"));
        let crc32 = u32::from_le_bytes(buf[4..8].try_into().expect("4 bytes"));
        let hdr = Self { len, crc32 };

        if hdr.version() != 0 {
            return Err(NetError::ProtocolVersion {
                version: hdr.version(),
            });
        }

        let flags = (len & FLAGS_MASK) >> FLAGS_SHIFT;
        let known = (F_CRC32 | F_CRC32C) >> FLAGS_SHIFT;
        if flags & !known != 0 || (hdr.has_crc32() && hdr.has_crc32c()) {
            return Err(NetError::InvalidFlags {
                flags: flags as u8,
            });
        }

        Ok(hdr)
    }
}

/// Headroom reserved in front of every datagram for protocol headers.
const HEADER_SPACE: usize = 128;

/// A buffer container for frames: prepend headroom plus a shared payload.
///
/// Layers push their headers in front of the payload without copying it;
/// `offset` marks how much of the start a receiving layer has already
/// consumed.
#[derive(Debug, Clone)]
pub struct Datagram {
    header: [u8; HEADER_SPACE],
    header_offset: usize,
    payload: Bytes,
    offset: usize,
}

impl Datagram {
    pub fn new(payload: Bytes) -> Self {
        Self {
            header: [0; HEADER_SPACE],
            header_offset: HEADER_SPACE,
            payload,
            offset: 0,
        }
    }

    /// A copy of `dgram` with the read offset at `offset`.
    pub fn with_offset(dgram: &Datagram, offset: usize) -> Self {
        assert!(offset <= dgram.len());
        Self {
            offset,
            ..dgram.clone()
        }
    }

    /// Prepends `bytes` to the header region.
    pub fn push_header(&mut self, bytes: &[u8]) {
        assert!(bytes.len() <= self.header_offset, "out of header space");
        let new_offset = self.header_offset - bytes.len();
        self.header[new_offset..self.header_offset].copy_from_slice(bytes);
        self.header_offset = new_offset;
    }

    /// The accumulated header bytes.
    pub fn header(&self) -> &[u8] {
        &self.header[self.header_offset..]
    }

    pub fn header_len(&self) -> usize {
        HEADER_SPACE - self.header_offset
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Total length: headers plus payload.
    pub fn len(&self) -> usize {
        self.header_len() + self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read offset for receiving layers.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Flattens headers and payload (minus the consumed offset) into a
    /// single contiguous payload with fresh headroom.
    pub fn normalize(&mut self) {
        let mut flat = Vec::with_capacity(self.len() - self.offset);
        if self.offset < self.header_len() {
            flat.extend_from_slice(&self.header()[self.offset..]);
            flat.extend_from_slice(&self.payload);
        } else {
            flat.extend_from_slice(&self.payload[self.offset - self.header_len()..]);
        }
        self.payload = Bytes::from(flat);
        self.header_offset = HEADER_SPACE;
        self.offset = 0;
    }
}

/// Computes the frame checksum of a datagram from `offset`: a little-endian
/// length word, then the header region, then the payload.
pub fn datagram_checksum(kind: ChecksumKind, dg: &Datagram, mut offset: usize) -> u32 {
    let len_bytes = ((dg.len() - offset) as u32).to_le_bytes();

    match kind {
        ChecksumKind::Crc32 => {
            let mut crc = Crc32::new();
            crc.update(&len_bytes);
            if offset < dg.header_len() {
                crc.update(&dg.header()[offset..]);
                offset = 0;
            } else {
                offset -= dg.header_len();
            }
            crc.update(&dg.payload()[offset..]);
            crc.finalize()
        }
        ChecksumKind::Crc32c => {
            let mut crc = Crc32c::new();
            crc.update(&len_bytes);
            if offset < dg.header_len() {
                crc.update(&dg.header()[offset..]);
                offset = 0;
            } else {
                offset -= dg.header_len();
            }
            crc.update(&dg.payload()[offset..]);
            crc.finalize()
        }
        ChecksumKind::None => unreachable!("checksum kind none"),
    }
}

/// Verifies a received frame body against its header; true means failure.
pub fn checksum_failed(hdr: &NetHeader, body: &Datagram) -> bool {
    if hdr.has_crc32c() {
        return datagram_checksum(ChecksumKind::Crc32c, body, 0) != hdr.crc32();
    }
    if hdr.has_crc32() {
        return datagram_checksum(ChecksumKind::Crc32, body, 0) != hdr.crc32();
    }
    hdr.crc32() != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let mut hdr = NetHeader::new(0xabcdef).unwrap();
        hdr.set_crc32(0x12345678, ChecksumKind::Crc32c);

        let parsed = NetHeader::parse(&hdr.serialize()).unwrap();
        assert_eq!(parsed.len(), 0xabcdef);
        assert!(parsed.has_crc32c());
        assert!(!parsed.has_crc32());
        assert_eq!(parsed.crc32(), 0x12345678);
        assert_eq!(parsed.version(), 0);
    }

    #[test]
    fn test_length_bounds() {
        assert!(NetHeader::new(0xff_ffff).is_ok());
        assert!(matches!(
            NetHeader::new(0x100_0000),
            Err(NetError::FrameTooLong { .. })
        ));
    }

    #[test]
    fn test_parse_rejects_bad_version() {
        let mut buf = NetHeader::new(10).unwrap().serialize();
        buf[3] |= 0x10; // version bits live in the top nibble
        assert!(matches!(
            NetHeader::parse(&buf),
            Err(NetError::ProtocolVersion { version: 1 })
        ));
    }

    #[test]
    fn test_parse_rejects_unknown_flags() {
        let mut buf = NetHeader::new(10).unwrap().serialize();
        buf[3] |= 0x04; // reserved flag bit
        assert!(matches!(
            NetHeader::parse(&buf),
            Err(NetError::InvalidFlags { .. })
        ));
    }

    #[test]
    fn test_parse_rejects_both_crc_flags() {
        let mut hdr = NetHeader::new(10).unwrap();
        hdr.set_crc32(1, ChecksumKind::Crc32);
        hdr.set_crc32(1, ChecksumKind::Crc32c);
        assert!(matches!(
            NetHeader::parse(&hdr.serialize()),
            Err(NetError::InvalidFlags { .. })
        ));
    }

    #[test]
    fn test_datagram_header_prepend() {
        let mut dg = Datagram::new(Bytes::from_static(b"payload"));
        dg.push_header(b"inner");
        dg.push_header(b"outer");
        assert_eq!(dg.header(), b"outerinner");
        assert_eq!(dg.len(), 10 + 7);
    }

    #[test]
    fn test_checksum_covers_header_and_payload() {
        let mut dg = Datagram::new(Bytes::from_static(b"some payload"));
        dg.push_header(b"hdr");
        let crc = datagram_checksum(ChecksumKind::Crc32c, &dg, 0);

        // a frame body carrying the same bytes contiguously must agree
        let mut flat = dg.clone();
        flat.normalize();
        assert_eq!(datagram_checksum(ChecksumKind::Crc32c, &flat, 0), crc);

        // any change to header or payload changes the checksum
        let mut other = Datagram::new(Bytes::from_static(b"some payloae"));
        other.push_header(b"hdr");
        assert_ne!(datagram_checksum(ChecksumKind::Crc32c, &other, 0), crc);
    }

    #[test]
    fn test_checksum_offset_skips_prefix() {
        let mut dg = Datagram::new(Bytes::from_static(b"abcdef"));
        dg.push_header(b"XY");
        // skipping the 2-byte header equals checksumming the bare payload
        let skipped = datagram_checksum(ChecksumKind::Crc32, &dg, 2);
        let bare = datagram_checksum(ChecksumKind::Crc32, &Datagram::new(Bytes::from_static(b"abcdef")), 0);
        assert_eq!(skipped, bare);
    }

    #[test]
    fn test_checksum_failed_on_flagless_nonzero_crc() {
        let mut hdr = NetHeader::new(4).unwrap();
        hdr.crc32 = 7; // no flag set
        let body = Datagram::new(Bytes::from_static(b"abcd"));
        assert!(checksum_failed(&hdr, &body));
    }

    #[test]
    fn test_normalize_with_consumed_offset() {
        let mut dg = Datagram::new(Bytes::from_static(b"tail"));
        dg.push_header(b"head");

        // offset inside the header region
        let mut consumed = Datagram::with_offset(&dg, 2);
        consumed.normalize();
        assert_eq!(consumed.payload().as_ref(), b"adtail");
        assert_eq!(consumed.header_len(), 0);
        assert_eq!(consumed.offset(), 0);

        // offset inside the payload
        let mut consumed = Datagram::with_offset(&dg, 6);
        consumed.normalize();
        assert_eq!(consumed.payload().as_ref(), b"il");
    }
}
