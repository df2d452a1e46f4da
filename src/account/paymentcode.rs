//! `PaymentCodeSubaccount`: BIP47 notification channels.
//!
//! A payment code is a single `(pubkey, chaincode)` pair a nym publishes;
//! once a notification transaction links two codes, each side derives an
//! unbounded stream of addresses from the other's code without any
//! further on-chain announcement. This module implements that derivation
//! (`outgoing`/`incoming`) plus the channel's notification-txid
//! bookkeeping.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use hmac::{Hmac, Mac};
use secp256k1::{PublicKey, Scalar, SecretKey, SECP256K1};
use sha2::{Digest, Sha256, Sha512};

use crate::bip32::{self, Curve, ExtendedKey, HDPath};
use crate::common::{Error, Result};
use crate::secret::{MasterSecret, PasswordPrompt};
use crate::seed::SeedStore;
use crate::storage::StorageBackend;

use super::deterministic::{DEFAULT_RESERVATION_TTL_SECS, DEFAULT_WINDOW, MAX_INDEX};
use super::element::{classify, CandidateOutcome, Element, Subchain};
use super::subaccount::SubaccountState;

type HmacSha512 = Hmac<Sha512>;

const PAYLOAD_LEN: usize = 80;
const SUPPORTED_PAYLOAD_VERSION: u8 = 1;
/// Minimum accepted notification-protocol version (the layer above the
/// raw BIP47 payload version byte). Kept as policy, not a gap — see
/// DESIGN.md.
pub const MIN_NOTIFICATION_PROTOCOL_VERSION: u8 = 3;
const BASE58_VERSION_BYTE: u8 = 0x47;

/// A counterparty's (or our own) BIP47 payment code: 80-byte payload of
/// version, features, a 33-byte public key, and a 32-byte chain code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentCode {
    pub public_key: [u8; 33],
    pub chain_code: [u8; 32],
}

impl PaymentCode {
    pub fn new(public_key: [u8; 33], chain_code: [u8; 32]) -> Self {
        Self { public_key, chain_code }
    }

    /// Stable id for this code, used as half of a channel's
    /// `subaccount_id` input.
    pub fn id(&self) -> String {
        hex::encode(Sha256::digest(self.serialize()))
    }

    pub fn serialize(&self) -> [u8; PAYLOAD_LEN] {
        let mut out = [0u8; PAYLOAD_LEN];
        out[0] = SUPPORTED_PAYLOAD_VERSION;
        out[1] = 0x00; // features: bitmessage-notification bit unused here
        out[2..35].copy_from_slice(&self.public_key);
        out[35..67].copy_from_slice(&self.chain_code);
        out
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != PAYLOAD_LEN {
            return Err(Error::invalid_input(format!(
                "payment code payload must be {PAYLOAD_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        if bytes[0] != SUPPORTED_PAYLOAD_VERSION {
            return Err(Error::invalid_input(format!(
                "unsupported payment code payload version: {}",
                bytes[0]
            )));
        }
        let mut public_key = [0u8; 33];
        public_key.copy_from_slice(&bytes[2..35]);
        PublicKey::from_slice(&public_key)
            .map_err(|e| Error::invalid_input(format!("invalid payment code public key: {e}")))?;
        let mut chain_code = [0u8; 32];
        chain_code.copy_from_slice(&bytes[35..67]);
        Ok(Self { public_key, chain_code })
    }

    pub fn to_base58(&self) -> String {
        let mut buf = Vec::with_capacity(1 + PAYLOAD_LEN);
        buf.push(BASE58_VERSION_BYTE);
        buf.extend_from_slice(&self.serialize());
        bitcoin::base58::encode_check(&buf)
    }

    pub fn from_base58(s: &str) -> Result<Self> {
        let data = bitcoin::base58::decode_check(s)
            .map_err(|e| Error::invalid_input(format!("bad base58check payment code: {e}")))?;
        if data.is_empty() || data[0] != BASE58_VERSION_BYTE {
            return Err(Error::invalid_input("not a payment code version byte"));
        }
        Self::parse(&data[1..])
    }
}

/// The raw x-coordinate of an ECDH shared point, per BIP47's
/// `secretPoint`.
fn shared_secret_x(local_priv: &SecretKey, remote_pub: &PublicKey) -> [u8; 32] {
    let point = secp256k1::ecdh::shared_secret_point(remote_pub, local_priv);
    let mut x = [0u8; 32];
    x.copy_from_slice(&point[..32]);
    x
}

/// `s = HMAC-SHA512(chain_code_of_receiver, secretPoint.x)[0..32]`, the
/// blinding tweak BIP47 applies to both sides of a channel.
fn blinding_scalar(receiver_chain_code: &[u8; 32], secret_x: &[u8; 32]) -> Result<Scalar> {
    let mut mac = HmacSha512::new_from_slice(receiver_chain_code).expect("any key length");
    mac.update(secret_x);
    let out = mac.finalize().into_bytes();
    Scalar::from_be_bytes(out[..32].try_into().unwrap())
        .map_err(|_| Error::key_derivation("BIP47 blinding scalar out of range"))
}

fn child_point(code: &PaymentCode, index: u32) -> Result<ExtendedKey> {
    let node = ExtendedKey::from_raw_public(Curve::Secp256k1, code.public_key, code.chain_code, "paymentcode");
    bip32::derive_public(&node, &[index])
}

/// Compute the address public key a sender pays the `index`-th incoming
/// address of `remote` under, given the sender's own root private key.
fn outgoing_public_key(local_root_priv: &SecretKey, remote: &PaymentCode, index: u32) -> Result<[u8; 33]> {
    let b_i = child_point(remote, index)?;
    let b_i_pub = PublicKey::from_slice(b_i.public_key())
        .map_err(|e| Error::key_derivation(format!("invalid derived payment-code point: {e}")))?;

    let secret_x = shared_secret_x(local_root_priv, &b_i_pub);
    let s = blinding_scalar(&remote.chain_code, &secret_x)?;

    let tweaked = b_i_pub
        .add_exp_tweak(SECP256K1, &s)
        .map_err(|_| Error::key_derivation("BIP47 point tweak produced infinity"))?;
    Ok(tweaked.serialize())
}

/// Compute the private key the receiver spends the `index`-th incoming
/// address with, given the sender's root public key.
fn incoming_private_key(
    local_root: &ExtendedKey,
    remote: &PaymentCode,
    index: u32,
) -> Result<[u8; 32]> {
    let b_i = bip32::derive_private(local_root, &[index])?;
    let b_i_priv = SecretKey::from_slice(
        b_i.private_key()
            .ok_or_else(|| Error::key_derivation("payment code root has no private key"))?,
    )
    .map_err(|e| Error::key_derivation(format!("invalid derived payment-code scalar: {e}")))?;

    let a0 = PublicKey::from_slice(&remote.public_key)
        .map_err(|e| Error::key_derivation(format!("invalid remote payment-code key: {e}")))?;

    let secret_x = shared_secret_x(&b_i_priv, &a0);
    let s = blinding_scalar(local_root.chaincode(), &secret_x)?;

    let tweaked = b_i_priv
        .add_tweak(&s)
        .map_err(|_| Error::key_derivation("BIP47 scalar tweak produced zero"))?;
    Ok(tweaked.secret_bytes())
}

/// Mask the 64 bytes of `payload` carrying the pubkey's x-coordinate byte
/// and the chain code (payload[3..67], per BIP47), XORing in an
/// HMAC-SHA512 stream keyed by the designated ECDH secret.
///
/// No verbatim masking algorithm was found anywhere in the retrieved
/// reference pack (only the call site survives, not a definition) — see
/// DESIGN.md for why this construction is the faithful reading of BIP47
/// given what `generate_notification_elements` actually receives.
fn mask_payload(secret_x: &[u8; 32], payload: &[u8; PAYLOAD_LEN]) -> [u8; PAYLOAD_LEN] {
    let mut mac = HmacSha512::new_from_slice(secret_x).expect("any key length");
    mac.update(b"bip47-notification-mask");
    let stream = mac.finalize().into_bytes();

    let mut masked = *payload;
    for i in 0..64 {
        masked[3 + i] ^= stream[i];
    }
    masked
}

fn hash160_of(public_key: &[u8; 33]) -> [u8; 20] {
    use bitcoin::hashes::{hash160, Hash};
    hash160::Hash::hash(public_key).to_byte_array()
}

fn subchain_tag(subchain: Subchain) -> Result<()> {
    match subchain {
        Subchain::Outgoing | Subchain::Incoming => Ok(()),
        other => Err(Error::out_of_range(format!(
            "{other:?} is not a payment-code subchain"
        ))),
    }
}

/// A Subaccount specialized for one BIP47 channel between a local nym's
/// payment code and one counterparty's.
pub struct PaymentCodeSubaccount {
    state: Mutex<SubaccountState>,
    local_path: HDPath,
    local_root: Mutex<Option<ExtendedKey>>,
    /// This nym's own payment code, as published to `remote` — needed at
    /// notification time, not just at channel-open time, so it's kept
    /// alongside the root key rather than recomputed.
    local_code: PaymentCode,
    remote: PaymentCode,
    master: Arc<MasterSecret>,
    seeds: Arc<SeedStore>,
    storage: Arc<dyn StorageBackend>,
    outgoing_notifications: Mutex<BTreeSet<String>>,
    incoming_notifications: Mutex<BTreeSet<String>>,
}

impl PaymentCodeSubaccount {
    /// `subaccount_id = H(chain_tag ‖ L.id ‖ R.id)`.
    pub fn channel_id(local: &PaymentCode, remote: &PaymentCode) -> String {
        let mut hasher = Sha256::new();
        hasher.update(b"paymentcode-channel-v1");
        hasher.update(local.id());
        hasher.update(remote.id());
        hex::encode(hasher.finalize())
    }

    /// Open (or resume) a channel: unlocks the local root key, computes
    /// the local payment code, and assigns the channel's id.
    pub async fn open(
        local_path: HDPath,
        remote: PaymentCode,
        notification_protocol_version: u8,
        master: Arc<MasterSecret>,
        seeds: Arc<SeedStore>,
        storage: Arc<dyn StorageBackend>,
        prompt: &dyn PasswordPrompt,
        reason: &str,
    ) -> Result<Self> {
        if notification_protocol_version < MIN_NOTIFICATION_PROTOCOL_VERSION {
            return Err(Error::invalid_input(format!(
                "payment-code notification protocol version {notification_protocol_version} \
                 is below the minimum accepted version {MIN_NOTIFICATION_PROTOCOL_VERSION}"
            )));
        }

        let secret = master
            .get_secret(prompt, reason)
            .await
            .map_err(|e| Error::unlock(e.to_string()))?;
        let seed = seeds.seed_bytes(&secret, &local_path.seed_id).await?;
        let root = bip32::derive_key(Curve::Secp256k1, seed.as_bytes(), &local_path)?;

        let local_code = PaymentCode::new(*root.public_key(), *root.chaincode());
        let id = Self::channel_id(&local_code, &remote);

        Ok(Self {
            state: Mutex::new(SubaccountState::new(id, &[Subchain::Outgoing, Subchain::Incoming])),
            local_path,
            local_root: Mutex::new(Some(root)),
            local_code,
            remote,
            master,
            seeds,
            storage,
            outgoing_notifications: Mutex::new(BTreeSet::new()),
            incoming_notifications: Mutex::new(BTreeSet::new()),
        })
    }

    pub fn subaccount_id(&self) -> String {
        self.state.lock().unwrap().subaccount_id.clone()
    }

    pub fn is_notified(&self) -> bool {
        !self.outgoing_notifications.lock().unwrap().is_empty()
    }

    /// Record an outgoing notification broadcast. Not rolled back to the
    /// caller on storage failure without restoring the in-memory set.
    pub async fn add_notification(&self, txid: impl Into<String>) -> Result<()> {
        let txid = txid.into();
        let inserted = self.outgoing_notifications.lock().unwrap().insert(txid.clone());
        if !inserted {
            return Ok(());
        }
        if let Err(e) = self.persist_notifications().await {
            self.outgoing_notifications.lock().unwrap().remove(&txid);
            return Err(e);
        }
        Ok(())
    }

    /// Undo a notification on reorg.
    pub async fn reorg_notification(&self, txid: &str) -> Result<()> {
        let removed = self.outgoing_notifications.lock().unwrap().remove(txid);
        if !removed {
            return Ok(());
        }
        if let Err(e) = self.persist_notifications().await {
            self.outgoing_notifications.lock().unwrap().insert(txid.to_string());
            return Err(e);
        }
        Ok(())
    }

    async fn persist_notifications(&self) -> Result<()> {
        let out: Vec<String> = self.outgoing_notifications.lock().unwrap().iter().cloned().collect();
        let inn: Vec<String> = self.incoming_notifications.lock().unwrap().iter().cloned().collect();
        let bytes = serde_json::to_vec(&(out, inn))
            .map_err(|e| Error::invalid_input(format!("serialize notifications: {e}")))?;
        self.storage
            .put("paymentcode_notifications", &self.subaccount_id(), &bytes)
            .await?;
        Ok(())
    }

    /// Derive the public key a payment at `index` on `Outgoing` would use
    /// (to pay the remote party), or the Element for `Incoming` once a
    /// payment has actually arrived.
    pub async fn derive_element(
        &self,
        subchain: Subchain,
        index: u32,
        prompt: &dyn PasswordPrompt,
        reason: &str,
    ) -> Result<Element> {
        subchain_tag(subchain)?;
        self.ensure_root(prompt, reason).await?;
        let subaccount_id = self.subaccount_id();

        let public_key = match subchain {
            Subchain::Outgoing => {
                let guard = self.local_root.lock().unwrap();
                let root = guard.as_ref().expect("populated by ensure_root");
                let priv_key = SecretKey::from_slice(
                    root.private_key()
                        .ok_or_else(|| Error::key_derivation("local payment code root has no private key"))?,
                )
                .map_err(|e| Error::key_derivation(format!("invalid local scalar: {e}")))?;
                outgoing_public_key(&priv_key, &self.remote, index)?
            }
            Subchain::Incoming => {
                let guard = self.local_root.lock().unwrap();
                let root = guard.as_ref().expect("populated by ensure_root");
                let priv_bytes = incoming_private_key(root, &self.remote, index)?;
                let sk = SecretKey::from_slice(&priv_bytes)
                    .map_err(|e| Error::key_derivation(format!("invalid incoming scalar: {e}")))?;
                PublicKey::from_secret_key(SECP256K1, &sk).serialize()
            }
            _ => unreachable!("validated by subchain_tag"),
        };

        let pubkey_hash = hash160_of(&public_key);
        let mut element = Element::new(subaccount_id, subchain, index, public_key, pubkey_hash);
        element.contact_id = Some(self.remote.id());
        Ok(element)
    }

    /// The private key for a previously-derived `Incoming` element —
    /// required to actually spend a received payment.
    pub async fn private_key(
        &self,
        subchain: Subchain,
        index: u32,
        prompt: &dyn PasswordPrompt,
        reason: &str,
    ) -> Result<[u8; 32]> {
        subchain_tag(subchain)?;
        self.ensure_root(prompt, reason).await?;
        match subchain {
            Subchain::Incoming => {
                let guard = self.local_root.lock().unwrap();
                let root = guard.as_ref().expect("populated by ensure_root");
                incoming_private_key(root, &self.remote, index)
            }
            Subchain::Outgoing => Err(Error::invalid_input(
                "outgoing elements pay the remote party; there is no local private key",
            )),
            _ => unreachable!("validated by subchain_tag"),
        }
    }

    /// The sender-side view of this channel: our own code and the
    /// counterparty's, as published between the two of them.
    pub fn local_code(&self) -> &PaymentCode {
        &self.local_code
    }

    pub fn remote_code(&self) -> &PaymentCode {
        &self.remote
    }

    /// Produce the three 33-byte pushes a BIP47 notification output's
    /// 1-of-3 bare multisig embeds.
    ///
    /// `push[0]` is our own unmasked designated public key (what the
    /// recipient needs to recompute the shared secret); `push[1]`/
    /// `push[2]` carry the masked payload split across two
    /// parity-prefixed 32-byte halves, matching [`mask_payload`]'s
    /// 64-byte masked region.
    pub async fn generate_notification_elements(
        &self,
        prompt: &dyn PasswordPrompt,
        reason: &str,
    ) -> Result<[[u8; 33]; 3]> {
        self.ensure_root(prompt, reason).await?;

        let (priv_key, designated_pubkey) = {
            let guard = self.local_root.lock().unwrap();
            let root = guard.as_ref().expect("populated by ensure_root");
            let priv_key = SecretKey::from_slice(
                root.private_key()
                    .ok_or_else(|| Error::key_derivation("local payment code root has no private key"))?,
            )
            .map_err(|e| Error::key_derivation(format!("invalid local scalar: {e}")))?;
            (priv_key, *root.public_key())
        };

        let remote_pub = PublicKey::from_slice(&self.remote.public_key)
            .map_err(|e| Error::key_derivation(format!("invalid remote payment-code key: {e}")))?;
        let secret_x = shared_secret_x(&priv_key, &remote_pub);
        let masked = mask_payload(&secret_x, &self.local_code.serialize());

        let mut push0 = [0u8; 33];
        push0.copy_from_slice(&designated_pubkey);

        let mut push1 = [0u8; 33];
        push1[0] = 0x02;
        push1[1..].copy_from_slice(&masked[3..35]);

        let mut push2 = [0u8; 33];
        push2[0] = 0x03;
        push2[1..].copy_from_slice(&masked[35..67]);

        Ok([push0, push1, push2])
    }

    async fn ensure_root(&self, prompt: &dyn PasswordPrompt, reason: &str) -> Result<()> {
        if self.local_root.lock().unwrap().is_some() {
            return Ok(());
        }
        let secret = self
            .master
            .get_secret(prompt, reason)
            .await
            .map_err(|e| Error::unlock(e.to_string()))?;
        let seed = self.seeds.seed_bytes(&secret, &self.local_path.seed_id).await?;
        let root = bip32::derive_key(Curve::Secp256k1, seed.as_bytes(), &self.local_path)?;
        *self.local_root.lock().unwrap() = Some(root);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bip39::{Language, SeedStyle};
    use crate::secret::NullPrompt;
    use crate::storage::MemoryBackend;

    /// Derive the payment code a nym with `words` would publish, without
    /// opening a channel.
    async fn code_for(words: &str) -> PaymentCode {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let master = MasterSecret::new(storage.clone(), format!("code-{words}"), None);
        let seeds = SeedStore::new(storage);
        let prompt = NullPrompt;
        let secret = master.get_secret(&prompt, "setup").await.unwrap();
        let seed_id = seeds
            .create(&secret, SeedStyle::Bip39, Language::English, words, "")
            .await
            .unwrap();
        let path = HDPath::with_indices(seed_id, vec![bip32::HARDENED + 47, bip32::HARDENED, bip32::HARDENED]);
        let seed = seeds.seed_bytes(&secret, &path.seed_id).await.unwrap();
        let root = bip32::derive_key(Curve::Secp256k1, seed.as_bytes(), &path).unwrap();
        PaymentCode::new(*root.public_key(), *root.chaincode())
    }

    async fn channel_for(words: &str, remote: PaymentCode) -> PaymentCodeSubaccount {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let master = Arc::new(MasterSecret::new(storage.clone(), format!("profile-{words}"), None));
        let seeds = Arc::new(SeedStore::new(storage.clone()));
        let prompt = NullPrompt;

        let secret = master.get_secret(&prompt, "setup").await.unwrap();
        let seed_id = seeds
            .create(&secret, SeedStyle::Bip39, Language::English, words, "")
            .await
            .unwrap();
        let path = HDPath::with_indices(seed_id, vec![bip32::HARDENED + 47, bip32::HARDENED, bip32::HARDENED]);

        PaymentCodeSubaccount::open(
            path,
            remote,
            MIN_NOTIFICATION_PROTOCOL_VERSION,
            master,
            seeds,
            storage,
            &prompt,
            "test",
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_channel_rejects_old_protocol_version() {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let master = Arc::new(MasterSecret::new(storage.clone(), "profile-reject", None));
        let seeds = Arc::new(SeedStore::new(storage.clone()));
        let prompt = NullPrompt;
        let secret = master.get_secret(&prompt, "setup").await.unwrap();
        let words = "abandon abandon abandon abandon abandon abandon abandon abandon \
                     abandon abandon abandon about";
        let seed_id = seeds
            .create(&secret, SeedStyle::Bip39, Language::English, words, "")
            .await
            .unwrap();
        let path = HDPath::with_indices(seed_id, vec![bip32::HARDENED + 47]);
        let remote = PaymentCode::new([2u8; 33], [0u8; 32]);

        let err = PaymentCodeSubaccount::open(path, remote, 2, master, seeds, storage, &prompt, "test")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_outgoing_and_incoming_agree_on_key() {
        // Alice pays into Bob's channel; Bob independently derives the
        // same spend key from his side. The ECDH commutes
        // (a0 * Bi == bi * A0), so both public keys must match.
        let alice_words = "abandon abandon abandon abandon abandon abandon abandon abandon \
                            abandon abandon abandon about";
        let bob_words = "zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo vote";

        let alice_code = code_for(alice_words).await;
        let bob_code = code_for(bob_words).await;

        let alice_sub = channel_for(alice_words, bob_code.clone()).await;
        let bob_sub = channel_for(bob_words, alice_code.clone()).await;

        let outgoing = alice_sub
            .derive_element(Subchain::Outgoing, 3, &NullPrompt, "test")
            .await
            .unwrap();
        let incoming = bob_sub
            .derive_element(Subchain::Incoming, 3, &NullPrompt, "test")
            .await
            .unwrap();

        assert_eq!(outgoing.public_key, incoming.public_key);

        let incoming_priv = bob_sub
            .private_key(Subchain::Incoming, 3, &NullPrompt, "test")
            .await
            .unwrap();
        let sk = SecretKey::from_slice(&incoming_priv).unwrap();
        assert_eq!(PublicKey::from_secret_key(SECP256K1, &sk).serialize(), outgoing.public_key);
    }

    #[tokio::test]
    async fn test_notification_tracking_round_trip() {
        let remote = code_for("zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo vote").await;
        let sub = channel_for(
            "abandon abandon abandon abandon abandon abandon abandon abandon \
             abandon abandon abandon about",
            remote,
        )
        .await;
        assert!(!sub.is_notified());
        sub.add_notification("tx-notify-1").await.unwrap();
        assert!(sub.is_notified());
        sub.reorg_notification("tx-notify-1").await.unwrap();
        assert!(!sub.is_notified());
    }
}
