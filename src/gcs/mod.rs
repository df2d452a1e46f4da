//! Golomb-coded set (GCS): the compact probabilistic filter structure
//! used to test whether a wallet's elements appear among a block's
//! outputs without downloading the block (BIP158-style client-side
//! filtering).
//!
//! A filter is deterministic in `(P, M, key, sorted(dedup(elements)))`.
//! Construction hashes each element into `[0, N*M)` via SipHash-2-4
//! keyed by a 16-byte block-derived key, sorts the results, and
//! delta-encodes them with Golomb-Rice coding (quotient in unary,
//! remainder in `P` bits, MSB-first bit packing).

use sha2::{Digest, Sha256};
use siphasher::sip::SipHasher24;
use std::hash::Hasher;

use crate::common::{Error, Result};

/// Standard BIP158 basic-filter parameters.
pub const BASIC_FILTER_P: u8 = 19;
pub const BASIC_FILTER_M: u32 = 784_931;

/// An extended-filter parameter set carried by the original repository
/// alongside the BIP158 basic filter, covering element types the basic
/// filter omits (e.g. input prevout scripts).
pub const EXTENDED_FILTER_P: u8 = 19;
pub const EXTENDED_FILTER_M: u32 = 784_931;

/// A built, Golomb-Rice encoded compact filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GCSFilter {
    p: u8,
    m: u32,
    n: u32,
    key: [u8; 16],
    /// `CompactSize(N) ‖ golomb_rice_bytes`.
    encoded: Vec<u8>,
}

impl GCSFilter {
    pub fn p(&self) -> u8 {
        self.p
    }

    pub fn m(&self) -> u32 {
        self.m
    }

    pub fn n(&self) -> u32 {
        self.n
    }

    pub fn key(&self) -> &[u8; 16] {
        &self.key
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.encoded
    }

    /// Decode the filter's element hashes back into a sorted `Vec`.
    pub fn decoded_hashes(&self) -> Vec<u64> {
        let mut reader = BitReader::new(&self.encoded[compact_size_len(self.encoded_n_prefix())..]);
        golomb_decode(self.n, self.p, &mut reader)
    }

    fn encoded_n_prefix(&self) -> u64 {
        self.n as u64
    }
}

fn siphash(key: &[u8; 16], item: &[u8]) -> u64 {
    let k0 = u64::from_le_bytes(key[0..8].try_into().unwrap());
    let k1 = u64::from_le_bytes(key[8..16].try_into().unwrap());
    let mut hasher = SipHasher24::new_with_keys(k0, k1);
    hasher.write(item);
    hasher.finish()
}

fn hash_to_range(key: &[u8; 16], range: u64, item: &[u8]) -> u64 {
    ((siphash(key, item) as u128 * range as u128) >> 64) as u64
}

/// Build a filter over `elements`, keyed by `key` (must be exactly 16
/// bytes). Duplicate elements are deduplicated before encoding.
pub fn build(p: u8, m: u32, key: &[u8], elements: &[&[u8]]) -> Result<GCSFilter> {
    let key: [u8; 16] = key
        .try_into()
        .map_err(|_| Error::invalid_input("GCS key must be exactly 16 bytes"))?;

    let mut deduped: Vec<&[u8]> = elements.to_vec();
    deduped.sort_unstable();
    deduped.dedup();
    let n = deduped.len() as u32;
    let range = (n as u64).saturating_mul(m as u64);

    let mut hashed: Vec<u64> = deduped.iter().map(|e| hash_to_range(&key, range, e)).collect();
    hashed.sort_unstable();
    hashed.dedup();
    let n = hashed.len() as u32;

    let mut encoded = Vec::new();
    write_compact_size(n as u64, &mut encoded);

    let mut writer = BitWriter::new();
    let mut last = 0u64;
    for value in &hashed {
        let delta = value - last;
        if delta != 0 {
            golomb_encode(p, delta, &mut writer);
        } else {
            golomb_encode(p, 0, &mut writer);
        }
        last = *value;
    }
    encoded.extend_from_slice(&writer.finish());

    Ok(GCSFilter {
        p,
        m,
        n,
        key,
        encoded,
    })
}

/// For each target, report whether it is present in `filter`'s element
/// set.
pub fn match_any(filter: &GCSFilter, targets: &[&[u8]]) -> Vec<bool> {
    let decoded = filter.decoded_hashes();
    let range = (filter.n as u64).saturating_mul(filter.m as u64);

    targets
        .iter()
        .map(|t| {
            let hashed = hash_to_range(&filter.key, range, t);
            decoded.binary_search(&hashed).is_ok()
        })
        .collect()
}

/// Serialize a filter to its canonical wire form (already computed at
/// build time; this is a defensive copy for callers that want an
/// owned buffer distinct from [`GCSFilter::as_bytes`]).
pub fn encode(filter: &GCSFilter) -> Vec<u8> {
    filter.encoded.clone()
}

/// Parse a previously-encoded filter. `p`, `m`, and `key` must be
/// supplied out of band (the wire format only carries `N` and the
/// Rice-coded deltas).
pub fn decode(p: u8, m: u32, key: &[u8], encoded: &[u8]) -> Result<GCSFilter> {
    let key: [u8; 16] = key
        .try_into()
        .map_err(|_| Error::invalid_input("GCS key must be exactly 16 bytes"))?;

    let mut pos = 0usize;
    let n = read_compact_size(encoded, &mut pos)
        .ok_or_else(|| Error::invalid_input("truncated GCS compact-size prefix"))?;

    Ok(GCSFilter {
        p,
        m,
        n: n as u32,
        key,
        encoded: encoded.to_vec(),
    })
}

/// BIP157-style filter header: `dsha256(dsha256(filter) ‖ prev_header)`.
pub fn header(filter: &GCSFilter, prev_header: &[u8; 32]) -> [u8; 32] {
    let filter_hash = sha256d(&filter.encoded);
    let mut buf = Vec::with_capacity(64);
    buf.extend_from_slice(&filter_hash);
    buf.extend_from_slice(prev_header);
    sha256d(&buf)
}

fn sha256d(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    second.into()
}

// --- Golomb-Rice coding -----------------------------------------------

fn golomb_encode(p: u8, value: u64, writer: &mut BitWriter) {
    let remainder = value & bitmask(p);
    let mut quotient = value >> p;
    while quotient > 0 {
        writer.write_bits(1, 1);
        quotient -= 1;
    }
    writer.write_bits(1, 0);
    writer.write_bits(p, remainder);
}

fn golomb_decode(n: u32, p: u8, reader: &mut BitReader) -> Vec<u64> {
    let mut output = Vec::with_capacity(n as usize);
    let mut last = 0u64;
    for _ in 0..n {
        let mut quotient = 0u64;
        while reader.read_bits(1) == 1 {
            quotient += 1;
        }
        let remainder = reader.read_bits(p);
        let value = last + ((quotient << p) + remainder);
        output.push(value);
        last = value;
    }
    output
}

fn bitmask(p: u8) -> u64 {
    if p >= 64 {
        u64::MAX
    } else {
        (1u64 << p) - 1
    }
}

/// MSB-first bit writer.
struct BitWriter {
    bytes: Vec<u8>,
    bit_pos: u8,
}

impl BitWriter {
    fn new() -> Self {
        Self {
            bytes: vec![0u8],
            bit_pos: 0,
        }
    }

    fn write_bits(&mut self, count: u8, value: u64) {
        for i in (0..count).rev() {
            let bit = ((value >> i) & 1) as u8;
            let byte_idx = self.bytes.len() - 1;
            self.bytes[byte_idx] |= bit << (7 - self.bit_pos);
            self.bit_pos += 1;
            if self.bit_pos == 8 {
                self.bit_pos = 0;
                self.bytes.push(0);
            }
        }
    }

    fn finish(mut self) -> Vec<u8> {
        // `bytes` always carries one extra all-zero placeholder byte for
        // whatever bit gets written next; drop it when we ended exactly
        // on a byte boundary (including the case where nothing was ever
        // written at all).
        if self.bit_pos == 0 {
            self.bytes.pop();
        }
        self.bytes
    }
}

/// MSB-first bit reader.
struct BitReader<'a> {
    bytes: &'a [u8],
    bit_pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, bit_pos: 0 }
    }

    fn read_bits(&mut self, count: u8) -> u64 {
        let mut out = 0u64;
        for _ in 0..count {
            let byte_idx = self.bit_pos / 8;
            let bit_idx = 7 - (self.bit_pos % 8);
            let bit = if byte_idx < self.bytes.len() {
                (self.bytes[byte_idx] >> bit_idx) & 1
            } else {
                0
            };
            out = (out << 1) | bit as u64;
            self.bit_pos += 1;
        }
        out
    }
}

// --- CompactSize --------------------------------------------------------

fn write_compact_size(n: u64, out: &mut Vec<u8>) {
    if n < 0xfd {
        out.push(n as u8);
    } else if n <= 0xffff {
        out.push(0xfd);
        out.extend_from_slice(&(n as u16).to_le_bytes());
    } else if n <= 0xffff_ffff {
        out.push(0xfe);
        out.extend_from_slice(&(n as u32).to_le_bytes());
    } else {
        out.push(0xff);
        out.extend_from_slice(&n.to_le_bytes());
    }
}

fn compact_size_len(n: u64) -> usize {
    if n < 0xfd {
        1
    } else if n <= 0xffff {
        3
    } else if n <= 0xffff_ffff {
        5
    } else {
        9
    }
}

fn read_compact_size(bytes: &[u8], pos: &mut usize) -> Option<u64> {
    let tag = *bytes.get(*pos)?;
    *pos += 1;
    match tag {
        0xfd => {
            let v = u16::from_le_bytes(bytes.get(*pos..*pos + 2)?.try_into().ok()?);
            *pos += 2;
            Some(v as u64)
        }
        0xfe => {
            let v = u32::from_le_bytes(bytes.get(*pos..*pos + 4)?.try_into().ok()?);
            *pos += 4;
            Some(v as u64)
        }
        0xff => {
            let v = u64::from_le_bytes(bytes.get(*pos..*pos + 8)?.try_into().ok()?);
            *pos += 8;
            Some(v)
        }
        small => Some(small as u64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_filter_encodes_to_zero_compact_size() {
        let filter = build(BASIC_FILTER_P, BASIC_FILTER_M, &[0u8; 16], &[]).unwrap();
        assert_eq!(filter.as_bytes(), &[0u8]);
        assert_eq!(filter.n(), 0);
    }

    #[test]
    fn test_match_hits_and_misses() {
        let key = [0u8; 16];
        let elements: Vec<&[u8]> = vec![b"a", b"b", b"c"];
        let filter = build(BASIC_FILTER_P, BASIC_FILTER_M, &key, &elements).unwrap();

        let targets: Vec<&[u8]> = vec![b"b", b"d"];
        let results = match_any(&filter, &targets);
        assert_eq!(results, vec![true, false]);
    }

    #[test]
    fn test_decode_is_element_equal_to_input() {
        let key = [0xAA; 16];
        let elements: Vec<&[u8]> = vec![b"alpha", b"beta", b"gamma", b"delta"];
        let filter = build(BASIC_FILTER_P, BASIC_FILTER_M, &key, &elements).unwrap();

        let mut expected: Vec<u64> = elements
            .iter()
            .map(|e| hash_to_range(&key, (filter.n() as u64) * (filter.m() as u64), e))
            .collect();
        expected.sort_unstable();
        expected.dedup();

        assert_eq!(filter.decoded_hashes(), expected);
    }

    #[test]
    fn test_duplicates_are_deduped() {
        let key = [0u8; 16];
        let elements: Vec<&[u8]> = vec![b"x", b"x", b"y"];
        let filter = build(BASIC_FILTER_P, BASIC_FILTER_M, &key, &elements).unwrap();
        assert_eq!(filter.n(), 2);
    }

    #[test]
    fn test_invalid_key_length_rejected() {
        let err = build(BASIC_FILTER_P, BASIC_FILTER_M, &[0u8; 8], &[]).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_header_is_deterministic() {
        let filter = build(BASIC_FILTER_P, BASIC_FILTER_M, &[1u8; 16], &[b"a".as_slice()]).unwrap();
        let prev = [0u8; 32];
        let h1 = header(&filter, &prev);
        let h2 = header(&filter, &prev);
        assert_eq!(h1, h2);
    }
}
