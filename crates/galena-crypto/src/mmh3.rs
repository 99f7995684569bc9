//! MurmurHash3 x64-128 implementation.
//!
//! This is Austin Appleby's public-domain MurmurHash3 in its 128-bit x64
//! variant, with a zero seed, extended with an incremental API so callers
//! can digest discontiguous regions (record payloads followed by headers)
//! without concatenating them first.
//!
//! The 64- and 32-bit variants are truncations of the 128-bit state and are
//! used where the wire format reserves fewer checksum bytes.

const C1: u64 = 0x87c3_7b91_1142_53d5;
const C2: u64 = 0x4cf5_ad43_2745_937f;

#[inline]
fn fmix64(mut h: u64) -> u64 {
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    h ^= h >> 33;
    h
}

/// Incremental MurmurHash3 x64-128 hasher.
///
/// ```
/// use galena_crypto::Mmh128;
///
/// let mut hasher = Mmh128::new();
/// hasher.update(b"hel");
/// hasher.update(b"lo");
/// assert_eq!(hasher.finalize128(), galena_crypto::mmh128(b"hello"));
/// ```
#[derive(Debug, Clone)]
pub struct Mmh128 {
    h1: u64,
    h2: u64,
    tail: [u8; 16],
    tail_len: usize,
    total: u64,
}

impl Mmh128 {
    pub fn new() -> Self {
        Self {
            h1: 0,
            h2: 0,
            tail: [0; 16],
            tail_len: 0,
            total: 0,
        }
    }

    /// Feeds `data` into the hash state.
    pub fn update(&mut self, data: &[u8]) {
        self.total += data.len() as u64;

        let mut rest = data;

        if self.tail_len > 0 {
            let take = rest.len().min(16 - self.tail_len);
            self.tail[self.tail_len..self.tail_len + take].copy_from_slice(&rest[..take]);
            self.tail_len += take;
            rest = &rest[take..];

            if self.tail_len < 16 {
                return;
            }
            let block = self.tail;
            self.process_block(&block);
            self.tail_len = 0;
        }

        let mut chunks = rest.chunks_exact(16);
        for block in &mut chunks {
            let block: [u8; 16] = block.try_into().expect("chunks_exact yields 16 bytes");
            self.process_block(&block);
        }

        let rem = chunks.remainder();
        self.tail[..rem.len()].copy_from_slice(rem);
        self.tail_len = rem.len();
    }

    #[inline]
    fn process_block(&mut self, block: &[u8; 16]) {
        let mut k1 = u64::from_le_bytes(block[0..8].try_into().expect("8 bytes"));
        let mut k2 = u64::from_le_bytes(block[8..16].try_into().expect("8 bytes"));

        k1 = k1.wrapping_mul(C1);
        k1 = k1.rotate_left(31);
        k1 = k1.wrapping_mul(C2);
        self.h1 ^= k1;

        self.h1 = self.h1.rotate_left(27).wrapping_add(self.h2);
        self.h1 = self.h1.wrapping_mul(5).wrapping_add(0x52dc_e729);

        k2 = k2.wrapping_mul(C2);
        k2 = k2.rotate_left(33);
        k2 = k2.wrapping_mul(C1);
        self.h2 ^= k2;

        self.h2 = self.h2.rotate_left(31).wrapping_add(self.h1);
        self.h2 = self.h2.wrapping_mul(5).wrapping_add(0x3849_5ab5);
    }

    /// Completes the hash and returns the full 128-bit digest as two words.
    fn finalize_words(&self) -> (u64, u64) {
        let mut h1 = self.h1;
        let mut h2 = self.h2;

        if self.tail_len > 0 {
            let tail = &self.tail[..self.tail_len];
            let mut k1: u64 = 0;
            let mut k2: u64 = 0;

            for i in (8..self.tail_len).rev() {
                k2 ^= u64::from(tail[i]) << ((i - 8) * 8);
            }
            if self.tail_len > 8 {
                k2 = k2.wrapping_mul(C2);
                k2 = k2.rotate_left(33);
                k2 = k2.wrapping_mul(C1);
                h2 ^= k2;
            }

            for i in (0..self.tail_len.min(8)).rev() {
                k1 ^= u64::from(tail[i]) << (i * 8);
            }
            k1 = k1.wrapping_mul(C1);
            k1 = k1.rotate_left(31);
            k1 = k1.wrapping_mul(C2);
            h1 ^= k1;
        }

        h1 ^= self.total;
        h2 ^= self.total;

        h1 = h1.wrapping_add(h2);
        h2 = h2.wrapping_add(h1);

        h1 = fmix64(h1);
        h2 = fmix64(h2);

        h1 = h1.wrapping_add(h2);
        h2 = h2.wrapping_add(h1);

        (h1, h2)
    }

    /// 128-bit digest as 16 little-endian bytes.
    #[must_use]
    pub fn finalize128(&self) -> [u8; 16] {
        let (h1, h2) = self.finalize_words();
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&h1.to_le_bytes());
        out[8..].copy_from_slice(&h2.to_le_bytes());
        out
    }

    /// 64-bit digest (low word of the 128-bit digest).
    #[must_use]
    pub fn finalize64(&self) -> u64 {
        self.finalize_words().0
    }

    /// 32-bit digest (low word folded onto itself).
    #[must_use]
    pub fn finalize32(&self) -> u32 {
        let h = self.finalize_words().0;
        (h ^ (h >> 32)) as u32
    }

    /// Writes the first `n` digest bytes into `out`. `n` must be 4, 8 or 16.
    pub fn gather(&self, out: &mut [u8]) {
        match out.len() {
            4 => out.copy_from_slice(&self.finalize32().to_le_bytes()),
            8 => out.copy_from_slice(&self.finalize64().to_le_bytes()),
            16 => out.copy_from_slice(&self.finalize128()),
            n => panic!("unsupported digest size: {n}"),
        }
    }
}

impl Default for Mmh128 {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot 128-bit MurmurHash3 digest.
pub fn mmh128(data: &[u8]) -> [u8; 16] {
    let mut hasher = Mmh128::new();
    hasher.update(data);
    hasher.finalize128()
}

/// One-shot 64-bit digest.
pub fn mmh64(data: &[u8]) -> u64 {
    let mut hasher = Mmh128::new();
    hasher.update(data);
    hasher.finalize64()
}

/// One-shot 32-bit digest.
pub fn mmh32(data: &[u8]) -> u32 {
    let mut hasher = Mmh128::new();
    hasher.update(data);
    hasher.finalize32()
}
