//! Key set: multi-part hierarchical keys with prefix-aware deduplication.
//!
//! A logical key is a sequence of parts `p1:p2:…:pn`. Each part is stored
//! as a hashed leaf — the first 8 or 16 bytes of a rolling MMH128 over all
//! parts from the root — whose first byte carries a 5-bit header:
//!
//! ```text
//! bits 0-1: prefix (certification strength)
//! bits 2-4: key set version
//! ```
//!
//! Annotated versions append the original part bytes after the hash so a
//! human can read conflicts out of a wire capture.
//!
//! Only the leaf of a multi-part key may carry a non-shared prefix; branch
//! parts are implicitly shared. Appending a key that duplicates an earlier
//! one keeps the stronger prefix: a weaker duplicate is absorbed, a stronger
//! one is stored alongside the original (which is already checksummed and
//! cannot be rewritten) and the lookup entry is redirected to it.

use std::collections::HashMap;

use bytes::Bytes;

use galena_crypto::Mmh128;

use crate::recordset::{CheckType, RecordSetIn, RecordSetOut, RecordSetVersion, StoredRef};
use crate::{WireError, WireResult};

const PREFIX_MASK: u8 = 0x03;
const VERSION_SHIFT: u8 = 2;
const VERSION_MASK: u8 = 0x07;
const HEADER_BITS: u32 = 5;
const HEADER_MASK: u8 = (1 << HEADER_BITS) - 1;

/// Key set format version: hash width and whether parts are annotated with
/// their original bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum KeySetVersion {
    Flat8 = 1,
    Flat8A = 2,
    Flat16 = 3,
    Flat16A = 4,
}

impl KeySetVersion {
    pub const MAX: KeySetVersion = KeySetVersion::Flat16A;

    /// Hash bytes stored per key part.
    pub fn key_size(self) -> usize {
        match self {
            KeySetVersion::Flat8 | KeySetVersion::Flat8A => 8,
            KeySetVersion::Flat16 | KeySetVersion::Flat16A => 16,
        }
    }

    /// Whether parts carry the original bytes after the hash.
    pub fn annotated(self) -> bool {
        matches!(self, KeySetVersion::Flat8A | KeySetVersion::Flat16A)
    }

    /// Decodes the key set nibble of the write-set header; 0 means the
    /// write set carries no keys.
    pub fn from_bits(bits: u8) -> WireResult<Option<Self>> {
        match bits {
            0 => Ok(None),
            1 => Ok(Some(KeySetVersion::Flat8)),
            2 => Ok(Some(KeySetVersion::Flat8A)),
            3 => Ok(Some(KeySetVersion::Flat16)),
            4 => Ok(Some(KeySetVersion::Flat16A)),
            v => Err(WireError::VersionNotSupported {
                what: "key set",
                version: u32::from(v),
            }),
        }
    }
}

impl std::str::FromStr for KeySetVersion {
    type Err = WireError;

    fn from_str(s: &str) -> WireResult<Self> {
        match s.to_ascii_uppercase().as_str() {
            "FLAT8" => Ok(KeySetVersion::Flat8),
            "FLAT8A" => Ok(KeySetVersion::Flat8A),
            "FLAT16" => Ok(KeySetVersion::Flat16),
            "FLAT16A" => Ok(KeySetVersion::Flat16A),
            _ => Err(WireError::VersionNotSupported {
                what: "key set",
                version: u32::MAX,
            }),
        }
    }
}

/// Certification strength of a key, as the application states it.
///
/// The two-bit wire prefix is version-dependent: VER3 write sets collapse
/// everything above shared into a single exclusive prefix, VER4 splits out
/// reference, VER5 splits update from exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum KeyType {
    Shared,
    Reference,
    Update,
    Exclusive,
}

impl KeyType {
    /// Maps this key type to its wire prefix under write-set version
    /// `ws_ver`. Prefix ordering encodes strength.
    pub fn prefix(self, ws_ver: u8) -> u8 {
        assert!((3..=5).contains(&ws_ver), "writeset version {ws_ver}");
        match self {
            KeyType::Shared => 0,
            KeyType::Reference => 1,
            KeyType::Update => match ws_ver {
                3..=4 => 1,
                _ => 2,
            },
            KeyType::Exclusive => match ws_ver {
                3 => 1,
                4 => 2,
                _ => 3,
            },
        }
    }

    /// Interprets a wire prefix under write-set version `ws_ver`.
    pub fn from_prefix(prefix: u8, ws_ver: u8) -> WireResult<Self> {
        match prefix {
            0 => Ok(KeyType::Shared),
            1 if ws_ver < 4 => Ok(KeyType::Exclusive),
            1 => Ok(KeyType::Reference),
            2 if ws_ver >= 5 => Ok(KeyType::Update),
            2 if ws_ver >= 4 => Ok(KeyType::Exclusive),
            3 if ws_ver >= 5 => Ok(KeyType::Exclusive),
            p => Err(WireError::BadKeyPrefix(p)),
        }
    }
}

/// A key to append: ordered parts, the strength of the leaf, and whether the
/// part buffers are volatile (they are snapshotted either way; the flag is
/// carried for callers that track buffer ownership).
#[derive(Debug, Clone, Copy)]
pub struct KeyData<'a> {
    pub parts: &'a [&'a [u8]],
    pub key_type: KeyType,
    pub copy: bool,
}

impl<'a> KeyData<'a> {
    pub fn new(parts: &'a [&'a [u8]], key_type: KeyType) -> Self {
        Self {
            parts,
            key_type,
            copy: true,
        }
    }
}

// ============================================================================
// Wire key part (receiver side)
// ============================================================================

/// A serialized key part as read from a key set.
#[derive(Debug, Clone)]
pub struct KeyPart {
    buf: Bytes,
}

impl KeyPart {
    /// Serialized size of the part at the front of `buf`.
    fn serial_size_of(buf: &[u8]) -> WireResult<usize> {
        if buf.is_empty() {
            return Err(WireError::BufferTooShort {
                expected: 8,
                got: 0,
            });
        }
        let version = KeySetVersion::from_bits((buf[0] >> VERSION_SHIFT) & VERSION_MASK)?
            .ok_or(WireError::VersionNotSupported {
                what: "key part",
                version: 0,
            })?;
        let base = version.key_size();
        if !version.annotated() {
            return Ok(base);
        }
        if buf.len() < base + 2 {
            return Err(WireError::BufferTooShort {
                expected: base + 2,
                got: buf.len(),
            });
        }
        let ann = u16::from_le_bytes(buf[base..base + 2].try_into().expect("2 bytes"));
        Ok(base + usize::from(ann))
    }

    /// Key set version encoded in the part header; `None` for an
    /// all-zeroes (empty) part.
    pub fn version(&self) -> Option<KeySetVersion> {
        KeySetVersion::from_bits((self.buf[0] >> VERSION_SHIFT) & VERSION_MASK).ok()?
    }

    /// The raw two-bit prefix.
    pub fn prefix(&self) -> u8 {
        self.buf[0] & PREFIX_MASK
    }

    /// The prefix interpreted under write-set version `ws_ver`.
    pub fn key_type(&self, ws_ver: u8) -> WireResult<KeyType> {
        KeyType::from_prefix(self.prefix(), ws_ver)
    }

    /// The serialized part bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Hash equality: the hash fields match after masking off the prefix and
    /// version header. Parts of different widths compare by the narrower
    /// width. Matching empty (unversioned) keys is an error.
    pub fn matches(&self, other: &KeyPart) -> WireResult<bool> {
        let va = self.version().ok_or(WireError::EmptyKeyMatch)?;
        let vb = other.version().ok_or(WireError::EmptyKeyMatch)?;

        let wide = va.key_size().min(vb.key_size()) == 16;
        if wide && self.buf[8..16] != other.buf[8..16] {
            return Ok(false);
        }

        let lhs = u64::from_le_bytes(self.buf[0..8].try_into().expect("8 bytes"));
        let rhs = u64::from_le_bytes(other.buf[0..8].try_into().expect("8 bytes"));
        Ok(lhs >> HEADER_BITS == rhs >> HEADER_BITS)
    }

    /// The annotation payload (length-prefixed original part bytes), if the
    /// part version carries one.
    pub fn annotation(&self) -> Option<Bytes> {
        let version = self.version()?;
        if !version.annotated() {
            return None;
        }
        let base = version.key_size();
        Some(self.buf.slice(base + 2..))
    }
}

// ============================================================================
// Builder-side hybrid lookup table
// ============================================================================

const INLINE_SIZE: usize = 64;
const INLINE_MASK: usize = INLINE_SIZE - 1;
const INLINE_DEPTH: usize = 3;

/// Canonical masked hash of a key part: header bits cleared, narrow parts
/// zero-extended. Two parts match iff their masked hashes are equal (all
/// parts in one builder share a version, so widths agree).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct MaskedHash([u8; 16]);

fn masked_hash(part: &[u8], key_size: usize) -> MaskedHash {
    let mut out = [0u8; 16];
    out[..key_size].copy_from_slice(&part[..key_size]);
    out[0] &= !HEADER_MASK;
    MaskedHash(out)
}

fn inline_index(part: &[u8]) -> usize {
    let word = u64::from_le_bytes(part[0..8].try_into().expect("8 bytes"));
    (word >> HEADER_BITS) as usize
}

/// A stable handle to an entry of the lookup table.
#[derive(Debug, Clone, Copy)]
enum SlotRef {
    Inline(usize),
    Heap(MaskedHash),
}

enum Probe {
    /// No matching part; a new one may be stored at this position.
    Vacant(SlotRef),
    /// A matching part is already present.
    Occupied(SlotRef),
}

/// A fixed 64-slot open-addressed table with probe depth 3, spilling to a
/// heap map when the inline neighborhood is full. Keeps duplicate detection
/// allocation-free for small transactions.
#[derive(Debug)]
struct KeyPartSet {
    inline: [Option<StoredRef>; INLINE_SIZE],
    heap: HashMap<MaskedHash, StoredRef>,
    key_size: usize,
}

impl KeyPartSet {
    fn new(key_size: usize) -> Self {
        Self {
            inline: [None; INLINE_SIZE],
            heap: HashMap::new(),
            key_size,
        }
    }

    fn probe(&self, candidate: &[u8], rs: &RecordSetOut) -> Probe {
        let mut idx = inline_index(candidate);
        for _ in 0..INLINE_DEPTH {
            idx &= INLINE_MASK;
            match self.inline[idx] {
                None => return Probe::Vacant(SlotRef::Inline(idx)),
                Some(stored) => {
                    if masked_hash(rs.stored(stored), self.key_size)
                        == masked_hash(candidate, self.key_size)
                    {
                        return Probe::Occupied(SlotRef::Inline(idx));
                    }
                }
            }
            idx += 1;
        }

        let key = masked_hash(candidate, self.key_size);
        if self.heap.contains_key(&key) {
            Probe::Occupied(SlotRef::Heap(key))
        } else {
            Probe::Vacant(SlotRef::Heap(key))
        }
    }

    fn occupy(&mut self, slot: SlotRef, stored: StoredRef, rs: &RecordSetOut) -> SlotRef {
        match slot {
            SlotRef::Inline(idx) => {
                debug_assert!(self.inline[idx].is_none());
                self.inline[idx] = Some(stored);
            }
            SlotRef::Heap(key) => {
                debug_assert_eq!(masked_hash(rs.stored(stored), self.key_size), key);
                self.heap.insert(key, stored);
            }
        }
        slot
    }

    /// Redirects an occupied entry to a stronger duplicate. The duplicate
    /// hashes identically, so lookup invariants are unaffected.
    fn redirect(&mut self, slot: SlotRef, stored: StoredRef) {
        match slot {
            SlotRef::Inline(idx) => self.inline[idx] = Some(stored),
            SlotRef::Heap(key) => {
                self.heap.insert(key, stored);
            }
        }
    }

    fn get(&self, slot: SlotRef) -> StoredRef {
        match slot {
            SlotRef::Inline(idx) => self.inline[idx].expect("occupied inline slot"),
            SlotRef::Heap(key) => self.heap[&key],
        }
    }

    #[cfg(test)]
    fn inline_len(&self) -> usize {
        self.inline.iter().filter(|s| s.is_some()).count()
    }

    #[cfg(test)]
    fn heap_len(&self) -> usize {
        self.heap.len()
    }
}

// ============================================================================
// Builder
// ============================================================================

/// A part of the previously appended key, cached so successive appends
/// sharing a prefix skip re-transmitting the common branch.
struct PrevPart {
    /// Rolling hash over all parts from the root through this one.
    hash: Mmh128,
    /// Lookup-table entry; `None` only for the root sentinel.
    slot: Option<SlotRef>,
    /// Original part bytes, owned.
    value: Vec<u8>,
}

/// Key set builder.
pub struct KeySetOut {
    rs: RecordSetOut,
    version: KeySetVersion,
    ws_ver: u8,
    added: KeyPartSet,
    prev: Vec<PrevPart>,
}

impl KeySetOut {
    pub fn new(
        version: KeySetVersion,
        rsv: RecordSetVersion,
        ws_ver: u8,
        reserve: usize,
        max_size: usize,
    ) -> Self {
        assert!((3..=5).contains(&ws_ver), "writeset version {ws_ver}");
        Self {
            rs: RecordSetOut::with_reserve(CheckType::Mmh128, rsv, reserve, max_size),
            version,
            ws_ver,
            added: KeyPartSet::new(version.key_size()),
            prev: vec![PrevPart {
                hash: Mmh128::new(),
                slot: None,
                value: Vec::new(),
            }],
        }
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

    /// Key set version for the write-set header sets nibble; `None` when no
    /// keys were appended.
    pub fn version(&self) -> Option<KeySetVersion> {
        if self.is_empty() {
            None
        } else {
            Some(self.version)
        }
    }

    pub fn gather(self, out: &mut Vec<Bytes>) -> usize {
        self.rs.gather(out)
    }

    fn prev_prefix(&self, i: usize) -> u8 {
        match self.prev[i].slot {
            Some(slot) => self.rs.stored(self.added.get(slot))[0] & PREFIX_MASK,
            None => 0,
        }
    }

    fn serialize_part(&self, hash: &Mmh128, prefix: u8, parts: &[&[u8]], part_num: usize) -> Vec<u8> {
        let key_size = self.version.key_size();
        let digest = hash.finalize128();
        let mut buf = digest[..key_size].to_vec();
        buf[0] = (buf[0] & !HEADER_MASK)
            | (prefix & PREFIX_MASK)
            | ((self.version as u8 & VERSION_MASK) << VERSION_SHIFT);

        if self.version.annotated() {
            store_annotation(&mut buf, parts, part_num, self.rs.alignment());
        }
        buf
    }

    /// Appends a key, deduplicating against everything appended before.
    ///
    /// Returns the number of serialized bytes the key added (0 when it was
    /// entirely absorbed by a previous key).
    pub fn append(&mut self, kd: &KeyData<'_>) -> WireResult<usize> {
        let parts = kd.parts;
        assert!(!parts.is_empty(), "key must have at least one part");

        // find the common ancestor with the previous key
        let mut i = 0;
        while i < parts.len() && i + 1 < self.prev.len() && self.prev[i + 1].value == parts[i] {
            i += 1;
        }

        let leaf_prefix = kd.key_type.prefix(self.ws_ver);

        if i > 0 {
            let anc_prefix = self.prev_prefix(i);
            let exclusive = KeyType::Exclusive.prefix(self.ws_ver);

            // matched ancestor already constrains at least as strongly
            if anc_prefix > leaf_prefix || anc_prefix == exclusive {
                return Ok(0);
            }

            if parts.len() == i {
                if anc_prefix == leaf_prefix {
                    // full duplicate of the previous key
                    return Ok(0);
                }
                // same key, stronger leaf: re-insert at leaf level
                i -= 1;
            }
        }

        let anc = i;
        let old_size = self.rs.size();
        let mut new_parts: Vec<PrevPart> = Vec::new();
        let mut duplicate = false;

        for idx in anc..parts.len() {
            let mut hash = match new_parts.last() {
                Some(p) => p.hash.clone(),
                None => self.prev[anc].hash.clone(),
            };
            hash.update(&(parts[idx].len() as u32).to_le_bytes());
            hash.update(parts[idx]);

            let leaf = idx + 1 == parts.len();
            let prefix = if leaf { leaf_prefix } else { 0 };

            let candidate = self.serialize_part(&hash, prefix, parts, idx);

            let slot = match self.added.probe(&candidate, &self.rs) {
                Probe::Vacant(slot) => {
                    let stored = self.rs.append_stored(&candidate, true)?;
                    self.added.occupy(slot, stored, &self.rs)
                }
                Probe::Occupied(slot) => {
                    let existing = self.rs.stored(self.added.get(slot))[0] & PREFIX_MASK;
                    if prefix > existing {
                        // the original is already checksummed and cannot be
                        // rewritten, so the stronger duplicate is stored and
                        // the entry redirected to it
                        let stored = self.rs.append_stored(&candidate, true)?;
                        self.added.redirect(slot, stored);
                        slot
                    } else if leaf || existing > prefix {
                        tracing::debug!(part = idx, "dropping duplicate key part");
                        duplicate = true;
                        break;
                    } else {
                        slot
                    }
                }
            };

            new_parts.push(PrevPart {
                hash,
                slot: Some(slot),
                value: parts[idx].to_vec(),
            });
        }

        if !duplicate {
            self.prev.truncate(anc + 1);
            self.prev.append(&mut new_parts);
            debug_assert_eq!(self.prev.len(), parts.len() + 1);
        }

        Ok(self.rs.size() - old_size)
    }

    #[cfg(test)]
    fn table_sizes(&self) -> (usize, usize) {
        (self.added.inline_len(), self.added.heap_len())
    }
}

fn store_annotation(buf: &mut Vec<u8>, parts: &[&[u8]], part_num: usize, alignment: usize) {
    const MAX_PART_LEN: usize = u8::MAX as usize;

    // largest multiple of the alignment representable in the u16 size field
    let max_ann = usize::from(u16::MAX) / alignment * alignment;

    let mut tmp_size = 2usize;
    for part in &parts[..=part_num] {
        tmp_size += 1 + part.len().min(MAX_PART_LEN);
    }

    let ann_size = ((tmp_size + alignment - 1) / alignment * alignment).min(max_ann);

    let start = buf.len();
    buf.extend_from_slice(&(ann_size as u16).to_le_bytes());
    let mut off = 2;

    for part in &parts[..=part_num] {
        if off >= ann_size {
            break;
        }
        let left = ann_size - off - 1;
        let part_len = part.len().min(left).min(MAX_PART_LEN);
        buf.push(part_len as u8);
        buf.extend_from_slice(&part[..part_len]);
        off += 1 + part_len;
    }

    // zero-pad to the declared size
    buf.resize(start + ann_size, 0);
}

// ============================================================================
// Reader
// ============================================================================

/// Key set reader.
///
/// A default-constructed reader represents an absent set (count 0).
#[derive(Debug, Clone, Default)]
pub struct KeySetIn {
    rs: Option<RecordSetIn>,
}

impl KeySetIn {
    /// Parses a key set at the front of `buf` (which may extend past it).
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

    /// The full serialized set for re-emission.
    pub fn as_buf(&self) -> Bytes {
        self.rs.as_ref().map_or_else(Bytes::new, RecordSetIn::as_buf)
    }

    /// Returns the next key part.
    pub fn next(&self) -> WireResult<KeyPart> {
        let rs = self.rs.as_ref().ok_or(WireError::EndOfSet)?;
        let buf = rs.next_record(KeyPart::serial_size_of)?;
        Ok(KeyPart { buf })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_out(version: KeySetVersion, ws_ver: u8) -> KeySetOut {
        KeySetOut::new(version, RecordSetVersion::V2, ws_ver, 0, usize::MAX)
    }

    fn key<'a>(parts: &'a [&'a [u8]], key_type: KeyType) -> KeyData<'a> {
        KeyData::new(parts, key_type)
    }

    fn gather_parse(ks: KeySetOut) -> KeySetIn {
        let mut out = Vec::new();
        ks.gather(&mut out);
        let flat: Vec<u8> = out.iter().flat_map(|b| b.iter().copied()).collect();
        KeySetIn::parse(Bytes::from(flat), true).unwrap()
    }

    #[test]
    fn test_single_key_parts_count() {
        let mut ks = new_out(KeySetVersion::Flat16, 3);
        ks.append(&key(&[b"a0", b"a1", b"a2"], KeyType::Exclusive)).unwrap();
        // one record per part
        assert_eq!(ks.count(), 3);

        let parsed = gather_parse(ks);
        assert_eq!(parsed.count(), 3);
        let p0 = parsed.next().unwrap();
        let p1 = parsed.next().unwrap();
        let p2 = parsed.next().unwrap();
        // branches are shared, the leaf carries the exclusive prefix
        assert_eq!(p0.prefix(), 0);
        assert_eq!(p1.prefix(), 0);
        assert_eq!(p2.prefix(), KeyType::Exclusive.prefix(3));
        assert!(!p0.matches(&p2).unwrap());
    }

    #[test]
    fn test_common_prefix_not_retransmitted() {
        let mut ks = new_out(KeySetVersion::Flat16, 5);
        ks.append(&key(&[b"table", b"row1"], KeyType::Shared)).unwrap();
        assert_eq!(ks.count(), 2);
        ks.append(&key(&[b"table", b"row2"], KeyType::Shared)).unwrap();
        // shared branch "table" is reused
        assert_eq!(ks.count(), 3);
    }

    #[test]
    fn test_full_duplicate_absorbed() {
        let mut ks = new_out(KeySetVersion::Flat16, 5);
        ks.append(&key(&[b"a0", b"a1"], KeyType::Shared)).unwrap();
        let added = ks.append(&key(&[b"a0", b"a1"], KeyType::Shared)).unwrap();
        assert_eq!(added, 0);
        assert_eq!(ks.count(), 2);
    }

    #[test]
    fn test_prefix_upgrade_stores_duplicate_leaf() {
        let mut ks = new_out(KeySetVersion::Flat16, 3);
        ks.append(&key(&[b"a0", b"a1"], KeyType::Shared)).unwrap();
        let added = ks.append(&key(&[b"a0", b"a1"], KeyType::Exclusive)).unwrap();
        assert!(added > 0);
        // two serialized entries for the leaf "a1"
        assert_eq!(ks.count(), 3);

        let parsed = gather_parse(ks);
        let parts: Vec<KeyPart> = (0..3).map(|_| parsed.next().unwrap()).collect();
        assert!(parts[1].matches(&parts[2]).unwrap());
        assert_eq!(parts[1].prefix(), 0);
        assert_eq!(parts[2].prefix(), KeyType::Exclusive.prefix(3));
    }

    #[test]
    fn test_weaker_duplicate_after_exclusive_ignored() {
        let mut ks = new_out(KeySetVersion::Flat16, 5);
        ks.append(&key(&[b"a0", b"a1"], KeyType::Exclusive)).unwrap();
        let count = ks.count();
        let size = ks.size();

        // weaker and equal duplicates leave the serialized form untouched
        for kt in [KeyType::Shared, KeyType::Update, KeyType::Exclusive] {
            let added = ks.append(&key(&[b"a0", b"a1"], kt)).unwrap();
            assert_eq!(added, 0, "{kt:?}");
            assert_eq!(ks.count(), count);
            assert_eq!(ks.size(), size);
        }
    }

    #[test]
    fn test_child_of_exclusive_branch_dropped() {
        let mut ks = new_out(KeySetVersion::Flat16, 5);
        ks.append(&key(&[b"a0", b"a1"], KeyType::Exclusive)).unwrap();
        // whole key dropped: its branch is already exclusively constrained
        let added = ks.append(&key(&[b"a0", b"a1", b"a2"], KeyType::Shared)).unwrap();
        assert_eq!(added, 0);
        assert_eq!(ks.count(), 2);
    }

    #[test]
    fn test_upgrade_seen_by_later_branch_walk() {
        let mut ks = new_out(KeySetVersion::Flat16, 5);
        ks.append(&key(&[b"a0", b"a1"], KeyType::Shared)).unwrap();
        ks.append(&key(&[b"a0", b"a1"], KeyType::Exclusive)).unwrap();
        // the cached previous key must observe the upgraded leaf prefix
        let added = ks.append(&key(&[b"a0", b"a1", b"a2"], KeyType::Shared)).unwrap();
        assert_eq!(added, 0);
    }

    #[test]
    fn test_prefix_tables_by_version() {
        assert_eq!(KeyType::Shared.prefix(3), 0);
        assert_eq!(KeyType::Reference.prefix(3), 1);
        assert_eq!(KeyType::Update.prefix(3), 1);
        assert_eq!(KeyType::Exclusive.prefix(3), 1);

        assert_eq!(KeyType::Reference.prefix(4), 1);
        assert_eq!(KeyType::Update.prefix(4), 1);
        assert_eq!(KeyType::Exclusive.prefix(4), 2);

        assert_eq!(KeyType::Reference.prefix(5), 1);
        assert_eq!(KeyType::Update.prefix(5), 2);
        assert_eq!(KeyType::Exclusive.prefix(5), 3);

        assert_eq!(KeyType::from_prefix(1, 3).unwrap(), KeyType::Exclusive);
        assert_eq!(KeyType::from_prefix(1, 4).unwrap(), KeyType::Reference);
        assert_eq!(KeyType::from_prefix(2, 5).unwrap(), KeyType::Update);
        assert_eq!(KeyType::from_prefix(3, 5).unwrap(), KeyType::Exclusive);
        assert!(KeyType::from_prefix(3, 4).is_err());
        assert!(KeyType::from_prefix(2, 3).is_err());
    }

    #[test]
    fn test_inline_table_spills_to_heap() {
        let mut ks = new_out(KeySetVersion::Flat8, 5);
        let keys: Vec<String> = (0..65).map(|i| format!("key-{i:03}")).collect();
        for k in &keys {
            ks.append(&key(&[k.as_bytes()], KeyType::Shared)).unwrap();
        }
        assert_eq!(ks.count(), 65);
        let (inline, heap) = ks.table_sizes();
        assert_eq!(inline + heap, 65);
        assert!(inline <= INLINE_SIZE);

        // duplicates are still detected wherever the entry landed
        for k in &keys {
            assert_eq!(ks.append(&key(&[k.as_bytes()], KeyType::Shared)).unwrap(), 0);
        }
        assert_eq!(ks.count(), 65);
    }

    #[test]
    fn test_annotated_parts_roundtrip() {
        let mut ks = new_out(KeySetVersion::Flat8A, 3);
        ks.append(&key(&[b"tbl", b"some-row-key"], KeyType::Exclusive)).unwrap();

        let parsed = gather_parse(ks);
        assert_eq!(parsed.count(), 2);
        let branch = parsed.next().unwrap();
        let leaf = parsed.next().unwrap();
        assert_eq!(branch.version(), Some(KeySetVersion::Flat8A));

        let ann = leaf.annotation().unwrap();
        // annotation carries length-prefixed original parts
        assert_eq!(usize::from(ann[0]), b"tbl".len());
        assert_eq!(&ann[1..4], b"tbl");
        assert_eq!(usize::from(ann[4]), b"some-row-key".len());
        assert_eq!(&ann[5..17], b"some-row-key");
    }

    #[test]
    fn test_serialized_form_independent_of_input_lifetime() {
        let build = || {
            let mut ks = new_out(KeySetVersion::Flat16, 5);
            {
                // input buffers live only for the append call
                let parts: Vec<Vec<u8>> = vec![b"volatile".to_vec(), b"buffers".to_vec()];
                let refs: Vec<&[u8]> = parts.iter().map(Vec::as_slice).collect();
                ks.append(&KeyData {
                    parts: &refs,
                    key_type: KeyType::Update,
                    copy: true,
                })
                .unwrap();
            }
            let mut out = Vec::new();
            ks.gather(&mut out);
            out.iter().flat_map(|b| b.iter().copied()).collect::<Vec<u8>>()
        };
        assert_eq!(build(), build());
    }

    #[test]
    fn test_matches_rejects_empty() {
        let a = KeyPart {
            buf: Bytes::from_static(&[0u8; 8]),
        };
        let b = KeyPart {
            buf: Bytes::from_static(&[0u8; 8]),
        };
        assert!(matches!(a.matches(&b), Err(WireError::EmptyKeyMatch)));
    }
}
