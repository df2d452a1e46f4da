//! Seed storage: persists mnemonic words encrypted under the process's
//! [`MasterSecret`], identified by a hash rather than by their words.
//!
//! A seed's id is `hex(sha256(seed_bytes))`. The BIP39/PKT word list is
//! never stored in plaintext — only the ChaCha20-Poly1305 ciphertext under
//! a key taken directly from the unlocked master secret (already 32 bytes
//! of high-entropy key material, so no additional KDF is needed here).

use std::sync::Arc;

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::bip39::{self, Language, Seed, SeedStyle};
use crate::common::{Error, Result};
use crate::secret::Secret;
use crate::storage::StorageBackend;

const STORAGE_BUCKET: &str = "seeds";
const NONCE_LEN: usize = 12;

fn seed_id_of(seed: &Seed) -> String {
    let digest = Sha256::digest(seed.as_bytes());
    hex::encode(digest)
}

fn encrypt(master: &Secret, plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(master.as_bytes().into());

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| Error::invalid_input(format!("seed encryption failed: {e}")))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn decrypt(master: &Secret, blob: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    if blob.len() < NONCE_LEN {
        return Err(Error::invalid_input("seed ciphertext too short"));
    }
    let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
    let cipher = ChaCha20Poly1305::new(master.as_bytes().into());
    let nonce = Nonce::from_slice(nonce_bytes);

    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| Error::unlock("seed decryption failed"))?;
    Ok(Zeroizing::new(plaintext))
}

/// Persists mnemonic words as ciphertext, addressed by the hash of the
/// seed they derive to.
pub struct SeedStore {
    storage: Arc<dyn StorageBackend>,
}

impl SeedStore {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    /// Derive a seed from a mnemonic, persist the words (encrypted under
    /// `master`), and return the seed id.
    pub async fn create(
        &self,
        master: &Secret,
        style: SeedStyle,
        lang: Language,
        words: &str,
        passphrase: &str,
    ) -> Result<String> {
        let seed = bip39::words_to_seed(style, lang, words, passphrase)?;
        let id = seed_id_of(&seed);

        let blob = encrypt(master, words.as_bytes())?;
        self.storage
            .put(STORAGE_BUCKET, &format!("{id}:words"), &blob)
            .await?;
        self.storage
            .put(
                STORAGE_BUCKET,
                &format!("{id}:meta"),
                format!("{}:{}", style_tag(style), lang_tag(lang)).as_bytes(),
            )
            .await?;

        Ok(id)
    }

    /// Re-derive the root seed bytes for a previously-created seed id.
    /// Requires the master secret to be unlocked.
    pub async fn seed_bytes(&self, master: &Secret, seed_id: &str) -> Result<Seed> {
        let words_blob = self
            .storage
            .get(STORAGE_BUCKET, &format!("{seed_id}:words"))
            .await?
            .ok_or_else(|| Error::out_of_range(format!("unknown seed id: {seed_id}")))?;
        let meta_blob = self
            .storage
            .get(STORAGE_BUCKET, &format!("{seed_id}:meta"))
            .await?
            .ok_or_else(|| Error::out_of_range(format!("unknown seed id: {seed_id}")))?;

        let words_plain = decrypt(master, &words_blob)?;
        let words = String::from_utf8(words_plain.to_vec())
            .map_err(|_| Error::invalid_input("stored mnemonic was not valid UTF-8"))?;

        let meta = String::from_utf8_lossy(&meta_blob).to_string();
        let (style, lang) = parse_meta(&meta)?;

        bip39::words_to_seed(style, lang, &words, "")
    }
}

fn style_tag(style: SeedStyle) -> &'static str {
    match style {
        SeedStyle::Bip39 => "bip39",
        SeedStyle::Pkt => "pkt",
    }
}

fn lang_tag(lang: Language) -> &'static str {
    match lang {
        Language::English => "en",
    }
}

fn parse_meta(meta: &str) -> Result<(SeedStyle, Language)> {
    let mut parts = meta.splitn(2, ':');
    let style = match parts.next() {
        Some("bip39") => SeedStyle::Bip39,
        Some("pkt") => SeedStyle::Pkt,
        _ => return Err(Error::invalid_input("corrupt seed metadata")),
    };
    let lang = match parts.next() {
        Some("en") => Language::English,
        _ => return Err(Error::invalid_input("corrupt seed metadata")),
    };
    Ok((style, lang))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;

    fn fixed_master() -> Secret {
        // Any 32-byte block works for tests; MasterSecret itself is
        // covered in `secret::tests`.
        Secret::from_bytes([7u8; 32])
    }

    #[tokio::test]
    async fn test_create_and_recover_round_trip() {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let store = SeedStore::new(storage);
        let master = fixed_master();

        let words = "abandon abandon abandon abandon abandon abandon abandon abandon \
                     abandon abandon abandon about";
        let id = store
            .create(&master, SeedStyle::Bip39, Language::English, words, "")
            .await
            .unwrap();

        let seed = store.seed_bytes(&master, &id).await.unwrap();
        assert_eq!(&seed.as_bytes()[..8], &[0xc5, 0x52, 0x57, 0xc3, 0x60, 0xc0, 0x7c, 0x72]);
    }

    #[tokio::test]
    async fn test_unknown_seed_id_rejected() {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let store = SeedStore::new(storage);
        let master = fixed_master();

        let err = store.seed_bytes(&master, "deadbeef").await.unwrap_err();
        assert!(matches!(err, Error::OutOfRange(_)));
    }
}
