//! English BIP39 wordlist.
//!
//! 2048 words, index = position in this array. Only the English list is
//! carried; other languages are out of scope (the original ships a dozen,
//! none of which this crate's callers need).

include!("wordlist_data.rs");

/// Look up a word by its 11-bit index.
pub fn word(index: u16) -> Option<&'static str> {
    WORDS.get(index as usize).copied()
}

/// Find the index of a word, if present.
pub fn index_of(word: &str) -> Option<u16> {
    WORDS.iter().position(|w| *w == word).map(|i| i as u16)
}

/// All words with the given prefix, for UI autocomplete.
pub fn suggestions(prefix: &str) -> Vec<&'static str> {
    if prefix.is_empty() {
        return Vec::new();
    }
    WORDS
        .iter()
        .filter(|w| w.starts_with(prefix))
        .copied()
        .collect()
}
