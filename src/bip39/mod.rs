//! BIP39 mnemonic encoding/decoding, plus the PKT seed-recovery variant.
//!
//! Two independent directions are supported: [`entropy_to_words`] (and the
//! identical-algorithm [`seed_to_words`]) turn raw entropy into a checksummed
//! word list; [`words_to_seed`] turns a word list plus passphrase back into
//! root seed bytes, either via standard BIP39 PBKDF2 stretching or via the
//! PKT wallet-recovery variant (a fixed-size packed payload with its own
//! checksum, optionally XOR-"encrypted" under an Argon2id-derived key).

pub mod wordlist;

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use sha2::{Sha256, Sha512};
use zeroize::Zeroizing;

use crate::common::{Error, Result};

type Blake2b256 = Blake2b<U32>;

const BITS_PER_WORD: usize = 11;
const BYTE_BITS: usize = 8;
const ENTROPY_BIT_DIVISOR: usize = 32;
const VALID_WORD_MULTIPLE: usize = 3;
const PBKDF2_ROUNDS: u32 = 2048;
const PBKDF2_OUTPUT_LEN: usize = 64;
const PASSPHRASE_PREFIX: &str = "mnemonic";
const PKT_WORD_COUNT: usize = 15;
const PKT_PAYLOAD_LEN: usize = 21;
const PKT_ARGON2_SALT: &[u8] = b"pktwallet seed 0";
const PKT_KEY_LEN: usize = 19;

/// Supported mnemonic dictionaries. Only English is carried; the
/// original ships a dozen, none of which this crate's callers need.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    English,
}

/// Which seed-derivation algorithm to apply to a word list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedStyle {
    Bip39,
    Pkt,
}

/// Root seed bytes, zeroized on drop. Length varies by [`SeedStyle`]: 64
/// bytes for BIP39, 19 bytes for PKT.
pub struct Seed(Zeroizing<Vec<u8>>);

impl Seed {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Entropy of 16/20/24/28/32 bytes to a checksummed 12/15/18/21/24-word
/// mnemonic.
pub fn entropy_to_words(entropy: &[u8], lang: Language) -> Result<Vec<&'static str>> {
    match entropy.len() {
        16 | 20 | 24 | 28 | 32 => {}
        other => {
            return Err(Error::invalid_input(format!(
                "invalid entropy size: {other} bytes"
            )))
        }
    }

    let entropy_bits = entropy.len() * BYTE_BITS;
    let checksum_bits = entropy_bits / ENTROPY_BIT_DIVISOR;
    let total_bits = entropy_bits + checksum_bits;
    let word_count = total_bits / BITS_PER_WORD;

    if word_count % VALID_WORD_MULTIPLE != 0 || total_bits % BITS_PER_WORD != 0 {
        return Err(Error::invalid_input("entropy does not pack into whole words"));
    }

    let checksum = Sha256::digest(entropy);
    let mut extended = Vec::with_capacity(entropy.len() + checksum.len());
    extended.extend_from_slice(entropy);
    extended.extend_from_slice(&checksum);

    let mut words = Vec::with_capacity(word_count);
    for word_idx in 0..word_count {
        let mut index: u16 = 0;
        for bit in 0..BITS_PER_WORD {
            let bit_index = word_idx * BITS_PER_WORD + bit;
            let byte_index = bit_index / BYTE_BITS;
            let shift = BYTE_BITS - (bit_index % BYTE_BITS) - 1;
            let set = (extended[byte_index] >> shift) & 1 == 1;
            index = (index << 1) | (set as u16);
        }
        let word = match lang {
            Language::English => wordlist::word(index),
        }
        .ok_or_else(|| Error::invalid_input("dictionary index out of range"))?;
        words.push(word);
    }

    Ok(words)
}

/// Identical algorithm to [`entropy_to_words`]; named separately because
/// callers sometimes hold a pre-derived seed rather than fresh entropy.
pub fn seed_to_words(seed: &[u8], lang: Language) -> Result<Vec<&'static str>> {
    entropy_to_words(seed, lang)
}

/// Autocomplete suggestions for a word prefix. Empty prefix yields no
/// suggestions.
pub fn get_suggestions(lang: Language, prefix: &str) -> Vec<&'static str> {
    match lang {
        Language::English => wordlist::suggestions(prefix),
    }
}

/// Split a whitespace-separated mnemonic into dictionary indices.
///
/// Unknown words are silently dropped rather than rejected — this
/// matches behavior carried over from the original implementation. A
/// typo can therefore validate a different mnemonic than the one the
/// user actually typed; see the crate's design notes.
fn tokenize(lang: Language, words: &str) -> Vec<u16> {
    words
        .split_whitespace()
        .filter_map(|w| match lang {
            Language::English => wordlist::index_of(w),
        })
        .collect()
}

/// Derive root seed bytes from a mnemonic word list and optional
/// passphrase.
pub fn words_to_seed(
    style: SeedStyle,
    lang: Language,
    words: &str,
    passphrase: &str,
) -> Result<Seed> {
    match style {
        SeedStyle::Bip39 => words_to_root_bip39(words, passphrase),
        SeedStyle::Pkt => words_to_root_pkt(lang, words, passphrase),
    }
}

fn words_to_root_bip39(words: &str, passphrase: &str) -> Result<Seed> {
    let salt = format!("{PASSPHRASE_PREFIX}{passphrase}");
    let mut out = vec![0u8; PBKDF2_OUTPUT_LEN];
    pbkdf2::pbkdf2_hmac::<Sha512>(words.as_bytes(), salt.as_bytes(), PBKDF2_ROUNDS, &mut out);
    Ok(Seed(Zeroizing::new(out)))
}

/// Pack word indices LSB-first, 11 bits each, into a big-endian 21-byte
/// buffer (168 bits of capacity; 15 words only occupy the low 165).
fn pack_words_be(indices: &[u16]) -> [u8; PKT_PAYLOAD_LEN] {
    let mut buf = [0u8; PKT_PAYLOAD_LEN];
    for &value in indices.iter().rev() {
        shl11_or(&mut buf, value);
    }
    buf
}

fn shl11_or(buf: &mut [u8; PKT_PAYLOAD_LEN], value: u16) {
    let mut carry: u32 = 0;
    for byte in buf.iter_mut().rev() {
        let combined = ((*byte as u32) << 11) | carry;
        *byte = (combined & 0xFF) as u8;
        carry = combined >> 8;
    }
    let v = (value & 0x7FF) as u32;
    let last = buf.len() - 1;
    buf[last] |= (v & 0xFF) as u8;
    buf[last - 1] |= ((v >> 8) & 0xFF) as u8;
}

fn words_to_root_pkt(lang: Language, words: &str, passphrase: &str) -> Result<Seed> {
    let indices = tokenize(lang, words);
    if indices.len() != PKT_WORD_COUNT {
        return Err(Error::invalid_input(format!(
            "PKT mnemonics require {PKT_WORD_COUNT} words, got {}",
            indices.len()
        )));
    }

    let mut ent = pack_words_be(&indices);

    let version = (ent[0] >> 1) & 0x0f;
    if version != 0 {
        return Err(Error::invalid_input(format!(
            "unsupported PKT seed version: {version}"
        )));
    }
    let encrypted = ent[0] & 0x01 == 1;

    let checksum = ent[1];
    ent[0] &= 0x1f;
    ent[1] = 0;

    let calculated = Blake2b256::digest(&ent[..]);
    if checksum != calculated[0] {
        return Err(Error::invalid_input("PKT seed checksum mismatch"));
    }

    if encrypted {
        if passphrase.is_empty() {
            return Err(Error::invalid_input(
                "PKT seed is encrypted but no passphrase was supplied",
            ));
        }
        let mut key = [0u8; PKT_KEY_LEN];
        argon2::Argon2::default()
            .hash_password_into(passphrase.as_bytes(), PKT_ARGON2_SALT, &mut key)
            .map_err(|e| Error::invalid_input(format!("PKT key derivation failed: {e}")))?;
        for (b, k) in ent[2..].iter_mut().zip(key.iter()) {
            *b ^= k;
        }
    }

    Ok(Seed(Zeroizing::new(ent[2..].to_vec())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_golden_vector_english_zero_entropy() {
        let entropy = [0u8; 16];
        let words = entropy_to_words(&entropy, Language::English).unwrap();
        assert_eq!(
            words.join(" "),
            "abandon abandon abandon abandon abandon abandon abandon abandon \
             abandon abandon abandon about"
        );

        let seed = words_to_seed(SeedStyle::Bip39, Language::English, &words.join(" "), "").unwrap();
        assert_eq!(&seed.as_bytes()[..8], &[0xc5, 0x52, 0x57, 0xc3, 0x60, 0xc0, 0x7c, 0x72]);
    }

    #[test]
    fn test_all_entropy_lengths_round_trip() {
        for len in [16usize, 20, 24, 28, 32] {
            let entropy = vec![0xAB; len];
            let words = entropy_to_words(&entropy, Language::English).unwrap();
            let expected_word_count = match len {
                16 => 12,
                20 => 15,
                24 => 18,
                28 => 21,
                32 => 24,
                _ => unreachable!(),
            };
            assert_eq!(words.len(), expected_word_count);

            let seed1 = words_to_seed(SeedStyle::Bip39, Language::English, &words.join(" "), "").unwrap();
            let seed2 = words_to_seed(SeedStyle::Bip39, Language::English, &words.join(" "), "").unwrap();
            assert_eq!(seed1.as_bytes(), seed2.as_bytes());
        }
    }

    #[test]
    fn test_invalid_entropy_length_rejected() {
        let err = entropy_to_words(&[0u8; 17], Language::English).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_empty_prefix_yields_no_suggestions() {
        assert!(get_suggestions(Language::English, "").is_empty());
    }

    #[test]
    fn test_suggestions_prefix_match() {
        let suggestions = get_suggestions(Language::English, "aban");
        assert!(suggestions.contains(&"abandon"));
    }

    #[test]
    fn test_unknown_word_is_dropped_not_rejected() {
        let indices = tokenize(Language::English, "abandon notaword about");
        assert_eq!(indices.len(), 2);
    }

    #[test]
    fn test_pkt_wrong_word_count_rejected() {
        let err = words_to_seed(SeedStyle::Pkt, Language::English, "abandon abandon", "").unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
