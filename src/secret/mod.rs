//! MasterSecret: a password-gated, timeout-expiring symmetric key.
//!
//! Every private-key access in this crate is gated behind one process-wide
//! `MasterSecret`. The 32-byte plaintext secret is encrypted at rest under
//! a password-derived key (Argon2id -> ChaCha20-Poly1305) and is held in
//! memory only for as long as the configured idle timeout allows,
//! zeroized on drop per the secure-memory discipline of the original
//! implementation (no swappable, non-zeroed plaintext).

use std::sync::Mutex;
use std::time::{Duration, Instant};

use argon2::Argon2;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::storage::StorageBackend;

const SECRET_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const SALT: &[u8] = b"zbtc-core master secret salt v1";
const MAX_UNLOCK_ATTEMPTS: u32 = 3;
const STORAGE_BUCKET: &str = "master_secret";

/// Errors raised by [`MasterSecret`].
#[derive(Debug, Error)]
pub enum SecretError {
    #[error("password callback failed: {0}")]
    Callback(String),

    #[error("failed to unlock master secret: {0}")]
    Unlock(String),

    #[error("storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),

    #[error("crypto error: {0}")]
    Crypto(String),
}

/// Collaborator that prompts a user for a password. Implemented by the
/// embedding application; a headless/test implementation can return a
/// fixed string.
#[async_trait::async_trait]
pub trait PasswordPrompt: Send + Sync {
    /// Ask for a password once (used to decrypt existing ciphertext).
    async fn ask_once(&self, reason: &str) -> Result<String, SecretError>;

    /// Ask for a password twice, returning it only if both entries match
    /// (used the first time a profile is created).
    async fn ask_twice(&self, reason: &str) -> Result<String, SecretError>;
}

/// A [`PasswordPrompt`] that always returns an empty password. Useful for
/// headless tests; never acceptable for a crate embedding real funds.
pub struct NullPrompt;

#[async_trait::async_trait]
impl PasswordPrompt for NullPrompt {
    async fn ask_once(&self, _reason: &str) -> Result<String, SecretError> {
        Ok(String::new())
    }

    async fn ask_twice(&self, _reason: &str) -> Result<String, SecretError> {
        Ok(String::new())
    }
}

/// 32-byte secret material, zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Secret([u8; SECRET_LEN]);

impl Secret {
    pub fn as_bytes(&self) -> &[u8; SECRET_LEN] {
        &self.0
    }

    /// Wrap raw bytes as a `Secret`. Crate-internal: real secrets only
    /// ever come from [`MasterSecret::get_secret`]; this exists for
    /// fixtures in other modules' test suites.
    #[doc(hidden)]
    pub(crate) fn from_bytes(bytes: [u8; SECRET_LEN]) -> Self {
        Self(bytes)
    }
}

struct Unlocked {
    secret: Secret,
    last_access: Instant,
}

/// Password-gated, timeout-expiring master key.
///
/// All mutable state lives behind one mutex; the idle timer and any
/// caller thread both take it, so a key is never cleared mid-use.
pub struct MasterSecret {
    state: Mutex<Option<Unlocked>>,
    timeout: Mutex<Option<Duration>>,
    storage: std::sync::Arc<dyn StorageBackend>,
    profile_id: String,
}

impl MasterSecret {
    /// Construct a new gate for the given storage backend and profile
    /// id. `timeout` of `None` disables automatic expiry.
    pub fn new(
        storage: std::sync::Arc<dyn StorageBackend>,
        profile_id: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            state: Mutex::new(None),
            timeout: Mutex::new(timeout),
            storage,
            profile_id: profile_id.into(),
        }
    }

    /// Change the idle timeout. A negative/`None` value disables expiry.
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        *self.timeout.lock().unwrap() = timeout;
    }

    /// Retrieve the plaintext secret, unlocking it first if necessary.
    /// `ask_twice` is honored only the very first time this profile is
    /// ever unlocked (no ciphertext yet on disk).
    pub async fn get_secret(
        &self,
        prompt: &dyn PasswordPrompt,
        reason: &str,
    ) -> Result<Secret, SecretError> {
        self.expire_if_idle();

        {
            let mut guard = self.state.lock().unwrap();
            if let Some(unlocked) = guard.as_mut() {
                unlocked.last_access = Instant::now();
                return Ok(unlocked.secret.clone());
            }
        }

        let key = format!("{}:ciphertext", self.profile_id);
        let existing = self.storage.get(STORAGE_BUCKET, &key).await?;

        let secret = match existing {
            Some(blob) => self.unlock_existing(prompt, reason, &blob).await?,
            None => self.create_new(prompt, reason, &key).await?,
        };

        let mut guard = self.state.lock().unwrap();
        *guard = Some(Unlocked {
            secret: secret.clone(),
            last_access: Instant::now(),
        });

        Ok(secret)
    }

    async fn unlock_existing(
        &self,
        prompt: &dyn PasswordPrompt,
        reason: &str,
        blob: &[u8],
    ) -> Result<Secret, SecretError> {
        for attempt in 0..MAX_UNLOCK_ATTEMPTS {
            let password = prompt
                .ask_once(reason)
                .await
                .map_err(|e| SecretError::Callback(e.to_string()))?;

            match decrypt(&password, blob) {
                Ok(bytes) => return Ok(Secret(bytes)),
                Err(_) if attempt + 1 < MAX_UNLOCK_ATTEMPTS => continue,
                Err(e) => return Err(SecretError::Unlock(e.to_string())),
            }
        }
        unreachable!("loop always returns within MAX_UNLOCK_ATTEMPTS")
    }

    async fn create_new(
        &self,
        prompt: &dyn PasswordPrompt,
        reason: &str,
        storage_key: &str,
    ) -> Result<Secret, SecretError> {
        let password = prompt
            .ask_twice(reason)
            .await
            .map_err(|e| SecretError::Callback(e.to_string()))?;

        let mut bytes = [0u8; SECRET_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);

        let blob = encrypt(&password, &bytes).map_err(SecretError::Crypto)?;
        self.storage.put(STORAGE_BUCKET, storage_key, &blob).await?;

        Ok(Secret(bytes))
    }

    /// Explicitly clear the cached plaintext, regardless of timeout.
    pub fn lock(&self) {
        *self.state.lock().unwrap() = None;
    }

    /// Called periodically by the idle-timer background thread described
    /// in the concurrency model; clears the plaintext silently once the
    /// timeout has elapsed. A `None` timeout disables expiry.
    pub fn expire_if_idle(&self) {
        let timeout = *self.timeout.lock().unwrap();
        let Some(timeout) = timeout else { return };

        let mut guard = self.state.lock().unwrap();
        if let Some(unlocked) = guard.as_ref() {
            if unlocked.last_access.elapsed() >= timeout {
                *guard = None;
            }
        }
    }
}

fn derive_key(password: &str) -> Result<[u8; 32], String> {
    let mut key = [0u8; 32];
    Argon2::default()
        .hash_password_into(password.as_bytes(), SALT, &mut key)
        .map_err(|e| e.to_string())?;
    Ok(key)
}

fn encrypt(password: &str, plaintext: &[u8; SECRET_LEN]) -> Result<Vec<u8>, String> {
    let key = derive_key(password)?;
    let cipher = ChaCha20Poly1305::new((&key).into());

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_slice())
        .map_err(|e| e.to_string())?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn decrypt(password: &str, blob: &[u8]) -> Result<[u8; SECRET_LEN], String> {
    if blob.len() < NONCE_LEN {
        return Err("ciphertext too short".to_string());
    }
    let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);

    let key = derive_key(password)?;
    let cipher = ChaCha20Poly1305::new((&key).into());
    let nonce = Nonce::from_slice(nonce_bytes);

    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| "decryption failed (wrong password?)".to_string())?;

    plaintext
        .try_into()
        .map_err(|_| "unexpected plaintext length".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;
    use std::sync::Arc;

    struct FixedPrompt(&'static str);

    #[async_trait::async_trait]
    impl PasswordPrompt for FixedPrompt {
        async fn ask_once(&self, _reason: &str) -> Result<String, SecretError> {
            Ok(self.0.to_string())
        }
        async fn ask_twice(&self, _reason: &str) -> Result<String, SecretError> {
            Ok(self.0.to_string())
        }
    }

    #[tokio::test]
    async fn test_first_unlock_creates_and_persists() {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let gate = MasterSecret::new(storage.clone(), "profile-1", None);
        let prompt = FixedPrompt("hunter2");

        let secret1 = gate.get_secret(&prompt, "test").await.unwrap();

        gate.lock();
        let secret2 = gate.get_secret(&prompt, "test").await.unwrap();

        assert_eq!(secret1.as_bytes(), secret2.as_bytes());
    }

    #[tokio::test]
    async fn test_wrong_password_fails_after_retries() {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let gate = MasterSecret::new(storage.clone(), "profile-2", None);

        gate.get_secret(&FixedPrompt("correct-horse"), "test")
            .await
            .unwrap();
        gate.lock();

        let result = gate.get_secret(&FixedPrompt("wrong"), "test").await;
        assert!(matches!(result, Err(SecretError::Unlock(_))));
    }

    #[tokio::test]
    async fn test_idle_timeout_clears_plaintext() {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let gate = MasterSecret::new(
            storage.clone(),
            "profile-3",
            Some(Duration::from_millis(1)),
        );
        let prompt = FixedPrompt("pw");

        gate.get_secret(&prompt, "test").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.expire_if_idle();

        assert!(gate.state.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_negative_timeout_never_expires() {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let gate = MasterSecret::new(storage.clone(), "profile-4", None);
        let prompt = FixedPrompt("pw");

        gate.get_secret(&prompt, "test").await.unwrap();
        gate.expire_if_idle();

        assert!(gate.state.lock().unwrap().is_some());
    }
}
