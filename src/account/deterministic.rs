//! `DeterministicSubaccount`: single-seed BIP32 derivation with gap-limit
//! lookahead and reservation — the hot path of the account subsystem.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use bitcoin::hashes::{hash160, Hash};

use crate::bip32::{self, Curve, ExtendedKey, HDPath};
use crate::common::{Error, Result};
use crate::secret::{MasterSecret, PasswordPrompt};
use crate::seed::SeedStore;
use crate::storage::StorageBackend;

use super::element::{classify, CandidateOutcome, Element, Subchain};
use super::subaccount::SubaccountState;

/// Reservation window ("gap limit"). Matches `ZBTC_GAP_LIMIT`'s default.
pub const DEFAULT_WINDOW: u32 = 20;
/// One past the largest index a subchain may ever reach.
pub const MAX_INDEX: u32 = 1 << 31;
/// How long a reservation holds an index before it becomes recyclable.
pub const DEFAULT_RESERVATION_TTL_SECS: i64 = 24 * 3600;

fn subchain_tag(subchain: Subchain) -> Result<u32> {
    match subchain {
        Subchain::External => Ok(0),
        Subchain::Internal => Ok(1),
        other => Err(Error::out_of_range(format!(
            "{other:?} is not a deterministic subchain"
        ))),
    }
}

fn hash160_of(public_key: &[u8; 33]) -> [u8; 20] {
    hash160::Hash::hash(public_key).to_byte_array()
}

/// A Subaccount specialized for plain BIP32 derivation over `External`
/// (receive) and `Internal` (change) subchains.
///
/// Root-key material is decrypted lazily behind its own mutex; every
/// child derivation reuses the cached key instead of re-unlocking
/// `MasterSecret`, per the concurrency model (acquiring this mutex always
/// requires unlocking `MasterSecret` first, never the reverse).
pub struct DeterministicSubaccount {
    state: Mutex<SubaccountState>,
    root_path: HDPath,
    root_key: Mutex<Option<ExtendedKey>>,
    master: Arc<MasterSecret>,
    seeds: Arc<SeedStore>,
    storage: Arc<dyn StorageBackend>,
    window: AtomicU32,
    max_lookahead: u32,
    reservation_ttl_secs: i64,
}

impl DeterministicSubaccount {
    /// Construct a subaccount and immediately top up lookahead on both
    /// subchains (so `last_generated` reflects a full window before any
    /// caller ever reserves anything).
    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        subaccount_id: impl Into<String>,
        root_path: HDPath,
        master: Arc<MasterSecret>,
        seeds: Arc<SeedStore>,
        storage: Arc<dyn StorageBackend>,
        prompt: &dyn PasswordPrompt,
        window: u32,
        max_lookahead: u32,
    ) -> Result<Self> {
        let id = subaccount_id.into();
        let state = SubaccountState::new(id, &[Subchain::External, Subchain::Internal]);
        let sub = Self {
            state: Mutex::new(state),
            root_path,
            root_key: Mutex::new(None),
            master,
            seeds,
            storage,
            window: AtomicU32::new(window.max(1)),
            max_lookahead: max_lookahead.max(window.max(1)),
            reservation_ttl_secs: DEFAULT_RESERVATION_TTL_SECS,
        };
        sub.top_up_lookahead(Subchain::External, prompt, "initial lookahead")
            .await?;
        sub.top_up_lookahead(Subchain::Internal, prompt, "initial lookahead")
            .await?;
        sub.persist().await?;
        Ok(sub)
    }

    pub fn subaccount_id(&self) -> String {
        self.state.lock().unwrap().subaccount_id.clone()
    }

    pub fn is_poisoned(&self) -> bool {
        self.state.lock().unwrap().poisoned
    }

    pub fn balance_element(&self, subchain: Subchain, index: u32) -> Result<Element> {
        self.state
            .lock()
            .unwrap()
            .balance_element(subchain, index)
            .map(|e| e.clone())
    }

    pub fn last_generated(&self, subchain: Subchain) -> Result<Option<u32>> {
        self.state.lock().unwrap().last_generated(subchain)
    }

    pub fn floor(&self, subchain: Subchain) -> Result<Option<u32>> {
        self.state.lock().unwrap().floor(subchain)
    }

    pub fn scan_progress(&self, subchain: Subchain) -> Result<u64> {
        self.state.lock().unwrap().scan_progress(subchain)
    }

    pub async fn set_scan_progress(&self, subchain: Subchain, progress: u64) -> Result<()> {
        let snapshot = { self.state.lock().unwrap().clone() };
        {
            let mut guard = self.state.lock().unwrap();
            guard.check_not_poisoned()?;
            guard.set_scan_progress(subchain, progress)?;
        }
        self.persist_or_rollback(snapshot).await
    }

    pub async fn confirm(&self, subchain: Subchain, index: u32, txid: &str) -> Result<()> {
        let snapshot = { self.state.lock().unwrap().clone() };
        {
            let mut guard = self.state.lock().unwrap();
            guard.check_not_poisoned()?;
            guard.confirm(subchain, index, txid)?;
        }
        self.persist_or_rollback(snapshot).await
    }

    pub async fn unconfirm(&self, subchain: Subchain, index: u32, txid: &str) -> Result<()> {
        let snapshot = { self.state.lock().unwrap().clone() };
        {
            let mut guard = self.state.lock().unwrap();
            guard.check_not_poisoned()?;
            guard.unconfirm(subchain, index, txid)?;
        }
        self.persist_or_rollback(snapshot).await
    }

    /// Release a reservation (e.g. a `TransactionBuilder` abort path)
    /// without marking the index used.
    pub async fn release(&self, subchain: Subchain, index: u32) -> Result<()> {
        let snapshot = { self.state.lock().unwrap().clone() };
        {
            let mut guard = self.state.lock().unwrap();
            guard.release(subchain, index)?;
        }
        self.persist_or_rollback(snapshot).await
    }

    /// Reserve up to `batch_size` indices ascending via the gap-limit
    /// search below. `batch_size == 0` is a no-op.
    #[allow(clippy::too_many_arguments)]
    pub async fn reserve(
        &self,
        subchain: Subchain,
        batch_size: u32,
        prompt: &dyn PasswordPrompt,
        reason: &str,
        contact: Option<&str>,
        label: Option<&str>,
        timestamp: i64,
    ) -> Result<Vec<u32>> {
        if batch_size == 0 {
            return Ok(Vec::new());
        }

        let snapshot = {
            let guard = self.state.lock().unwrap();
            guard.check_not_poisoned()?;
            guard.clone()
        };

        self.maybe_grow_window(batch_size);

        let mut accepted = Vec::with_capacity(batch_size as usize);
        let mut cursor = snapshot.used_index(subchain)?;

        let outcome: Result<()> = async {
            for _ in 0..batch_size {
                let index = self
                    .find_one(subchain, prompt, reason, contact, label, timestamp, cursor)
                    .await?;
                self.accept(subchain, index, contact, label, timestamp)?;
                accepted.push(index);
                cursor = index + 1;
            }
            Ok(())
        }
        .await;

        if let Err(e) = outcome {
            *self.state.lock().unwrap() = snapshot;
            return Err(e);
        }

        if let Err(e) = self.persist().await {
            *self.state.lock().unwrap() = snapshot;
            return Err(e);
        }

        Ok(accepted)
    }

    /// Run the gap-limit search starting at
    /// `start_candidate`, returning the first acceptable index without
    /// writing any metadata — the caller commits via `accept`.
    async fn find_one(
        &self,
        subchain: Subchain,
        prompt: &dyn PasswordPrompt,
        reason: &str,
        contact: Option<&str>,
        label: Option<&str>,
        timestamp: i64,
        start_candidate: u32,
    ) -> Result<u32> {
        let mut candidate = start_candidate;
        let mut gap: u32 = 0;
        let mut fallback: Option<u32> = None;

        loop {
            if candidate >= MAX_INDEX {
                if let Some(idx) = fallback {
                    return Ok(idx);
                }
                return Err(Error::exhausted("reservation search reached max_index"));
            }

            let generated = { self.state.lock().unwrap().generated_index(subchain)? };
            if candidate >= generated {
                self.top_up_lookahead(subchain, prompt, reason).await?;
                return Ok(candidate);
            }

            let outcome = {
                let guard = self.state.lock().unwrap();
                let element = guard.balance_element(subchain, candidate)?;
                classify(element, contact, label, timestamp, self.reservation_ttl_secs)
            };

            match outcome {
                CandidateOutcome::NeverUsed | CandidateOutcome::Reissue => return Ok(candidate),
                CandidateOutcome::Used => {
                    gap = 0;
                    candidate += 1;
                }
                CandidateOutcome::MetadataConflict | CandidateOutcome::Reserved => {
                    gap += 1;
                    candidate += 1;
                }
                CandidateOutcome::StaleUnconfirmed => {
                    fallback.get_or_insert(candidate);
                    gap += 1;
                    candidate += 1;
                }
            }

            if gap >= self.window.load(Ordering::SeqCst) {
                if let Some(idx) = fallback {
                    return Ok(idx);
                }
                // No recyclable fallback: keep scanning past the window.
                // `candidate` will eventually reach `generated_index` and
                // fall into the lookahead-generation branch above.
            }
        }
    }

    fn accept(
        &self,
        subchain: Subchain,
        index: u32,
        contact: Option<&str>,
        label: Option<&str>,
        timestamp: i64,
    ) -> Result<()> {
        let mut guard = self.state.lock().unwrap();
        let element = guard.element_mut(subchain, index)?;
        element.reserved_at = Some(timestamp);
        element.contact_id = contact.map(ToString::to_string);
        element.label = label.map(ToString::to_string);
        Ok(())
    }

    fn maybe_grow_window(&self, batch_size: u32) {
        let mut window = self.window.load(Ordering::SeqCst);
        while batch_size > window {
            let doubled = window.saturating_mul(2);
            if doubled <= window || doubled > self.max_lookahead {
                break;
            }
            window = doubled;
        }
        self.window.store(window, Ordering::SeqCst);
    }

    /// Ensure `generated_index - used_index >= window` on `subchain`,
    /// generating fresh elements (deriving keys, persisting none of it
    /// until the caller calls `persist`) as needed.
    async fn top_up_lookahead(
        &self,
        subchain: Subchain,
        prompt: &dyn PasswordPrompt,
        reason: &str,
    ) -> Result<()> {
        let window = self.window.load(Ordering::SeqCst);
        loop {
            let (generated, used) = {
                let guard = self.state.lock().unwrap();
                guard.check_not_poisoned()?;
                (guard.generated_index(subchain)?, guard.used_index(subchain)?)
            };
            if generated.saturating_sub(used) >= window {
                return Ok(());
            }
            let element = self.generate(subchain, generated, prompt, reason).await?;
            let mut guard = self.state.lock().unwrap();
            guard.insert_element(subchain, element)?;
            guard.bump_generated(subchain)?;
        }
    }

    async fn generate(
        &self,
        subchain: Subchain,
        index: u32,
        prompt: &dyn PasswordPrompt,
        reason: &str,
    ) -> Result<Element> {
        if index >= MAX_INDEX {
            return Err(Error::AccountFull(index));
        }
        self.ensure_root_key(prompt, reason).await?;

        let chain_tag = subchain_tag(subchain)?;
        let subaccount_id = { self.state.lock().unwrap().subaccount_id.clone() };

        let child = {
            let guard = self.root_key.lock().unwrap();
            let root = guard.as_ref().expect("populated by ensure_root_key");
            bip32::derive_private(root, &[chain_tag, index])?
        };

        let public_key = *child.public_key();
        let pubkey_hash = hash160_of(&public_key);
        Ok(Element::new(subaccount_id, subchain, index, public_key, pubkey_hash))
    }

    /// The private key for a previously-generated element — required by
    /// [`crate::txbuilder`] to actually sign a spend, and to derive the
    /// BIP47 notification masking key off a freshly-reserved change
    /// element.
    pub async fn private_key(
        &self,
        subchain: Subchain,
        index: u32,
        prompt: &dyn PasswordPrompt,
        reason: &str,
    ) -> Result<[u8; 32]> {
        self.ensure_root_key(prompt, reason).await?;
        let chain_tag = subchain_tag(subchain)?;
        let guard = self.root_key.lock().unwrap();
        let root = guard.as_ref().expect("populated by ensure_root_key");
        let child = bip32::derive_private(root, &[chain_tag, index])?;
        child
            .private_key()
            .copied()
            .ok_or_else(|| Error::key_derivation("derived child unexpectedly has no private key"))
    }

    async fn ensure_root_key(&self, prompt: &dyn PasswordPrompt, reason: &str) -> Result<()> {
        if self.root_key.lock().unwrap().is_some() {
            return Ok(());
        }
        let secret = self
            .master
            .get_secret(prompt, reason)
            .await
            .map_err(|e| Error::unlock(e.to_string()))?;
        let seed = self.seeds.seed_bytes(&secret, &self.root_path.seed_id).await?;
        let key = bip32::derive_key(Curve::Secp256k1, seed.as_bytes(), &self.root_path)?;
        *self.root_key.lock().unwrap() = Some(key);
        Ok(())
    }

    async fn persist(&self) -> Result<()> {
        let snapshot = { self.state.lock().unwrap().clone() };
        let bytes = serde_json::to_vec(&snapshot)
            .map_err(|e| Error::invalid_input(format!("serialize subaccount: {e}")))?;
        self.storage
            .put("subaccounts", &snapshot.subaccount_id, &bytes)
            .await?;
        Ok(())
    }

    async fn persist_or_rollback(&self, snapshot: SubaccountState) -> Result<()> {
        if let Err(e) = self.persist().await {
            *self.state.lock().unwrap() = snapshot;
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bip39::{Language, SeedStyle};
    use crate::secret::NullPrompt;
    use crate::storage::MemoryBackend;

    async fn fixture() -> (DeterministicSubaccount, Arc<MasterSecret>, Arc<SeedStore>) {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let master = Arc::new(MasterSecret::new(storage.clone(), "profile-det", None));
        let seeds = Arc::new(SeedStore::new(storage.clone()));
        let prompt = NullPrompt;

        let secret = master.get_secret(&prompt, "test setup").await.unwrap();
        let words = "abandon abandon abandon abandon abandon abandon abandon abandon \
                     abandon abandon abandon about";
        let seed_id = seeds
            .create(&secret, SeedStyle::Bip39, Language::English, words, "")
            .await
            .unwrap();

        let path = HDPath::with_indices(seed_id, vec![bip32::HARDENED + 44, bip32::HARDENED, bip32::HARDENED]);
        let sub = DeterministicSubaccount::create(
            "acct-1",
            path,
            master.clone(),
            seeds.clone(),
            storage.clone(),
            &prompt,
            DEFAULT_WINDOW,
            1000,
        )
        .await
        .unwrap();

        (sub, master, seeds)
    }

    #[tokio::test]
    async fn test_fresh_account_lookahead_and_first_reserve() {
        let (sub, _master, _seeds) = fixture().await;
        let prompt = NullPrompt;

        assert_eq!(sub.last_generated(Subchain::External).unwrap(), Some(19));
        assert_eq!(sub.floor(Subchain::External).unwrap(), None);

        let reserved = sub
            .reserve(Subchain::External, 1, &prompt, "test", None, None, 1000)
            .await
            .unwrap();
        assert_eq!(reserved, vec![0]);
        assert!(sub.last_generated(Subchain::External).unwrap().unwrap() >= 19);
    }

    #[tokio::test]
    async fn test_batch_zero_is_noop() {
        let (sub, _master, _seeds) = fixture().await;
        let prompt = NullPrompt;
        let reserved = sub
            .reserve(Subchain::External, 0, &prompt, "test", None, None, 1000)
            .await
            .unwrap();
        assert!(reserved.is_empty());
    }

    #[tokio::test]
    async fn test_gap_limit_recycles_matching_contact() {
        let (sub, _master, _seeds) = fixture().await;
        let prompt = NullPrompt;

        // Reserve indices 0..20 under contact "alice", then confirm 0..5.
        let reserved = sub
            .reserve(Subchain::External, 20, &prompt, "test", Some("alice"), None, 500)
            .await
            .unwrap();
        assert_eq!(reserved.len(), 20);
        for i in 0..5u32 {
            sub.confirm(Subchain::External, i, &format!("tx{i}")).await.unwrap();
        }

        let second = sub
            .reserve(Subchain::External, 1, &prompt, "test", Some("alice"), None, 1000)
            .await
            .unwrap();
        assert_eq!(second.len(), 1);
        assert!(second[0] >= 5 && second[0] < 25);
    }

    #[tokio::test]
    async fn test_confirm_then_unconfirm_restores_floor() {
        let (sub, _master, _seeds) = fixture().await;
        sub.confirm(Subchain::External, 0, "tx0").await.unwrap();
        assert_eq!(sub.floor(Subchain::External).unwrap(), Some(1));

        sub.unconfirm(Subchain::External, 0, "tx0").await.unwrap();
        assert_eq!(sub.floor(Subchain::External).unwrap(), Some(0));
    }
}
