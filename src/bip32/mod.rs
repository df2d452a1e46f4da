//! BIP32 hierarchical-deterministic key derivation.
//!
//! Supports two curves: secp256k1 (normal + hardened child derivation,
//! used by every Bitcoin-facing key in this crate) and ed25519
//! (hardened-only, per SLIP-0010 — normal derivation has no defined
//! meaning on ed25519 and is refused). Serialization follows the
//! standard 78-byte xprv/xpub layout, base58check-encoded.

use bitcoin::hashes::{hash160, Hash};
use hmac::{Hmac, Mac};
use secp256k1::{PublicKey, Scalar, SecretKey, SECP256K1};
use sha2::Sha512;
use zeroize::Zeroizing;

use crate::common::{Error, Result};

/// High bit marking a hardened child index.
pub const HARDENED: u32 = 0x8000_0000;

pub fn is_hardened(index: u32) -> bool {
    index >= HARDENED
}

type HmacSha512 = Hmac<Sha512>;

/// The curve a given [`ExtendedKey`] tree is derived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Curve {
    Secp256k1,
    Ed25519,
}

/// Network byte used for xprv/xpub version bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bip32Network {
    MainnetPrivate,
    MainnetPublic,
    TestnetPrivate,
    TestnetPublic,
}

impl Bip32Network {
    fn version_bytes(self) -> [u8; 4] {
        match self {
            Bip32Network::MainnetPrivate => [0x04, 0x88, 0xAD, 0xE4],
            Bip32Network::MainnetPublic => [0x04, 0x88, 0xB2, 0x1E],
            Bip32Network::TestnetPrivate => [0x04, 0x35, 0x83, 0x94],
            Bip32Network::TestnetPublic => [0x04, 0x35, 0x87, 0xCF],
        }
    }

    fn from_version_bytes(bytes: [u8; 4]) -> Result<Self> {
        match bytes {
            [0x04, 0x88, 0xAD, 0xE4] => Ok(Bip32Network::MainnetPrivate),
            [0x04, 0x88, 0xB2, 0x1E] => Ok(Bip32Network::MainnetPublic),
            [0x04, 0x35, 0x83, 0x94] => Ok(Bip32Network::TestnetPrivate),
            [0x04, 0x35, 0x87, 0xCF] => Ok(Bip32Network::TestnetPublic),
            other => Err(Error::invalid_input(format!(
                "unrecognized bip32 version bytes {other:02x?}"
            ))),
        }
    }

    pub fn is_private(self) -> bool {
        matches!(
            self,
            Bip32Network::MainnetPrivate | Bip32Network::TestnetPrivate
        )
    }
}

/// An ordered sequence of child indices, rooted at a named seed.
///
/// Hardened indices carry the high bit ([`HARDENED`]) set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HDPath {
    pub seed_id: String,
    pub indices: Vec<u32>,
}

impl HDPath {
    pub fn new(seed_id: impl Into<String>) -> Self {
        Self {
            seed_id: seed_id.into(),
            indices: Vec::new(),
        }
    }

    pub fn with_indices(seed_id: impl Into<String>, indices: Vec<u32>) -> Self {
        Self {
            seed_id: seed_id.into(),
            indices,
        }
    }

    /// Return a copy of this path with `index` appended.
    pub fn child(&self, index: u32) -> Self {
        let mut indices = self.indices.clone();
        indices.push(index);
        Self {
            seed_id: self.seed_id.clone(),
            indices,
        }
    }

    pub fn depth(&self) -> u8 {
        self.indices.len() as u8
    }

    pub fn last_index(&self) -> Option<u32> {
        self.indices.last().copied()
    }
}

/// A derived BIP32 key: chaincode plus a private and/or public
/// component, tagged with the path that produced it.
pub struct ExtendedKey {
    curve: Curve,
    private: Option<Zeroizing<[u8; 32]>>,
    chaincode: [u8; 32],
    /// secp256k1: 33-byte compressed point. ed25519: a leading 0x00 tag
    /// byte followed by the 32-byte raw verifying key (ed25519 has no
    /// native "compressed" encoding distinct from its point encoding;
    /// the tag keeps the field a fixed 33 bytes across curves).
    public: [u8; 33],
    path: HDPath,
    parent_fingerprint: u32,
}

impl ExtendedKey {
    pub fn curve(&self) -> Curve {
        self.curve
    }

    pub fn has_private(&self) -> bool {
        self.private.is_some()
    }

    pub fn private_key(&self) -> Option<&[u8; 32]> {
        self.private.as_deref()
    }

    pub fn chaincode(&self) -> &[u8; 32] {
        &self.chaincode
    }

    pub fn public_key(&self) -> &[u8; 33] {
        &self.public
    }

    pub fn path(&self) -> &HDPath {
        &self.path
    }

    pub fn parent_fingerprint(&self) -> u32 {
        self.parent_fingerprint
    }

    /// Fingerprint of *this* key, i.e. what a child of this key records
    /// as its parent fingerprint.
    pub fn fingerprint(&self) -> u32 {
        fingerprint_of(self.curve, &self.public)
    }

    /// Wrap externally-supplied public material (no known derivation
    /// history) as a watch-only node, so normal-child derivation can walk
    /// it the same way it walks a locally-derived key. Used to treat a
    /// counterparty's BIP47 payment code as a BIP32 node.
    pub fn from_raw_public(
        curve: Curve,
        public: [u8; 33],
        chaincode: [u8; 32],
        seed_id: impl Into<String>,
    ) -> Self {
        Self {
            curve,
            private: None,
            chaincode,
            public,
            path: HDPath::new(seed_id),
            parent_fingerprint: 0,
        }
    }
}

fn fingerprint_of(curve: Curve, public: &[u8; 33]) -> u32 {
    let digest = match curve {
        Curve::Secp256k1 => hash160::Hash::hash(public),
        Curve::Ed25519 => hash160::Hash::hash(&public[1..]),
    };
    let bytes = digest.to_byte_array();
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn hmac_sha512(key: &[u8], data: &[u8]) -> [u8; 64] {
    let mut mac = HmacSha512::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    let result = mac.finalize().into_bytes();
    let mut out = [0u8; 64];
    out.copy_from_slice(&result);
    out
}

/// Derive the master key for `seed` on `curve`, then walk every index in
/// `path` from there. All indices in `path` must be reachable with the
/// material available (hardened derivation from seed is always possible
/// since the seed yields a private key).
pub fn derive_key(curve: Curve, seed: &[u8], path: &HDPath) -> Result<ExtendedKey> {
    let mut key = master_key(curve, seed, path.seed_id.clone())?;
    for &index in &path.indices {
        key = ckd_priv(&key, index)?;
    }
    Ok(key)
}

fn master_key(curve: Curve, seed: &[u8], seed_id: String) -> Result<ExtendedKey> {
    let hmac_key: &[u8] = match curve {
        Curve::Secp256k1 => b"Bitcoin seed",
        Curve::Ed25519 => b"ed25519 seed",
    };
    let i = hmac_sha512(hmac_key, seed);
    let (il, ir) = i.split_at(32);

    let mut private = [0u8; 32];
    private.copy_from_slice(il);
    let mut chaincode = [0u8; 32];
    chaincode.copy_from_slice(ir);

    let public = public_from_private(curve, &private)?;

    Ok(ExtendedKey {
        curve,
        private: Some(Zeroizing::new(private)),
        chaincode,
        public,
        path: HDPath::new(seed_id),
        parent_fingerprint: 0,
    })
}

fn public_from_private(curve: Curve, private: &[u8; 32]) -> Result<[u8; 33]> {
    match curve {
        Curve::Secp256k1 => {
            let sk = SecretKey::from_slice(private)
                .map_err(|e| Error::key_derivation(format!("invalid secp256k1 scalar: {e}")))?;
            let pk = PublicKey::from_secret_key(SECP256K1, &sk);
            Ok(pk.serialize())
        }
        Curve::Ed25519 => {
            let signing = ed25519_dalek::SigningKey::from_bytes(private);
            let verifying = signing.verifying_key();
            let mut out = [0u8; 33];
            out[1..].copy_from_slice(verifying.as_bytes());
            Ok(out)
        }
    }
}

/// Derive `parent`'s child at `extra_path`, requiring a private
/// component at every step (so hardened indices are reachable).
pub fn derive_private(parent: &ExtendedKey, extra_path: &[u32]) -> Result<ExtendedKey> {
    let mut key_ref: ExtendedKey = clone_key(parent);
    for &index in extra_path {
        key_ref = ckd_priv(&key_ref, index)?;
    }
    Ok(key_ref)
}

/// Derive `parent`'s child at `extra_path` using only the public
/// component. Fails the moment a hardened index is encountered.
pub fn derive_public(parent: &ExtendedKey, extra_path: &[u32]) -> Result<ExtendedKey> {
    let mut key_ref = clone_key(parent);
    for &index in extra_path {
        key_ref = ckd_pub(&key_ref, index)?;
    }
    Ok(key_ref)
}

fn clone_key(key: &ExtendedKey) -> ExtendedKey {
    ExtendedKey {
        curve: key.curve,
        private: key.private.clone(),
        chaincode: key.chaincode,
        public: key.public,
        path: key.path.clone(),
        parent_fingerprint: key.parent_fingerprint,
    }
}

fn ckd_priv(parent: &ExtendedKey, index: u32) -> Result<ExtendedKey> {
    match parent.curve {
        Curve::Secp256k1 => ckd_priv_secp256k1(parent, index),
        Curve::Ed25519 => ckd_priv_ed25519(parent, index),
    }
}

fn ckd_pub(parent: &ExtendedKey, index: u32) -> Result<ExtendedKey> {
    if is_hardened(index) {
        return Err(Error::key_derivation(
            "hardened derivation requires a private key",
        ));
    }
    match parent.curve {
        Curve::Secp256k1 => ckd_pub_secp256k1(parent, index),
        Curve::Ed25519 => Err(Error::key_derivation(
            "normal derivation is not defined on ed25519",
        )),
    }
}

fn ckd_priv_secp256k1(parent: &ExtendedKey, index: u32) -> Result<ExtendedKey> {
    let parent_private = parent
        .private
        .as_ref()
        .ok_or_else(|| Error::key_derivation("hardened derivation requires a private key"))?;

    let mut data = Vec::with_capacity(37);
    if is_hardened(index) {
        data.push(0x00);
        data.extend_from_slice(&parent_private[..]);
    } else {
        data.extend_from_slice(&parent.public);
    }
    data.extend_from_slice(&index.to_be_bytes());

    let i = hmac_sha512(&parent.chaincode, &data);
    let (il, ir) = i.split_at(32);

    let tweak = Scalar::from_be_bytes(il.try_into().unwrap())
        .map_err(|_| Error::key_derivation("derived scalar out of range"))?;
    let parent_sk = SecretKey::from_slice(&parent_private[..])
        .map_err(|e| Error::key_derivation(format!("invalid parent scalar: {e}")))?;
    let child_sk = parent_sk
        .add_tweak(&tweak)
        .map_err(|_| Error::key_derivation("scalar addition produced zero"))?;

    let mut private = [0u8; 32];
    private.copy_from_slice(&child_sk.secret_bytes());
    let mut chaincode = [0u8; 32];
    chaincode.copy_from_slice(ir);

    let public = PublicKey::from_secret_key(SECP256K1, &child_sk).serialize();

    Ok(ExtendedKey {
        curve: Curve::Secp256k1,
        private: Some(Zeroizing::new(private)),
        chaincode,
        public,
        path: parent.path.child(index),
        parent_fingerprint: parent.fingerprint(),
    })
}

fn ckd_pub_secp256k1(parent: &ExtendedKey, index: u32) -> Result<ExtendedKey> {
    let mut data = Vec::with_capacity(37);
    data.extend_from_slice(&parent.public);
    data.extend_from_slice(&index.to_be_bytes());

    let i = hmac_sha512(&parent.chaincode, &data);
    let (il, ir) = i.split_at(32);

    let tweak = Scalar::from_be_bytes(il.try_into().unwrap())
        .map_err(|_| Error::key_derivation("derived scalar out of range"))?;
    let parent_pk = PublicKey::from_slice(&parent.public)
        .map_err(|e| Error::key_derivation(format!("invalid parent point: {e}")))?;
    let child_pk = parent_pk
        .add_exp_tweak(SECP256K1, &tweak)
        .map_err(|_| Error::key_derivation("point addition produced infinity"))?;

    let mut chaincode = [0u8; 32];
    chaincode.copy_from_slice(ir);

    Ok(ExtendedKey {
        curve: Curve::Secp256k1,
        private: None,
        chaincode,
        public: child_pk.serialize(),
        path: parent.path.child(index),
        parent_fingerprint: parent.fingerprint(),
    })
}

fn ckd_priv_ed25519(parent: &ExtendedKey, index: u32) -> Result<ExtendedKey> {
    if !is_hardened(index) {
        return Err(Error::key_derivation(
            "normal derivation is not defined on ed25519",
        ));
    }
    let parent_private = parent
        .private
        .as_ref()
        .ok_or_else(|| Error::key_derivation("hardened derivation requires a private key"))?;

    let mut data = Vec::with_capacity(37);
    data.push(0x00);
    data.extend_from_slice(&parent_private[..]);
    data.extend_from_slice(&index.to_be_bytes());

    let i = hmac_sha512(&parent.chaincode, &data);
    let (il, ir) = i.split_at(32);

    let mut private = [0u8; 32];
    private.copy_from_slice(il);
    let mut chaincode = [0u8; 32];
    chaincode.copy_from_slice(ir);

    let public = public_from_private(Curve::Ed25519, &private)?;

    Ok(ExtendedKey {
        curve: Curve::Ed25519,
        private: Some(Zeroizing::new(private)),
        chaincode,
        public,
        path: parent.path.child(index),
        parent_fingerprint: parent.fingerprint(),
    })
}

/// Serialize an extended private key (xprv) as base58check.
pub fn serialize_xprv(
    network: Bip32Network,
    depth: u8,
    parent_fp: u32,
    index: u32,
    chaincode: &[u8; 32],
    key: &[u8; 32],
) -> Result<String> {
    if !network.is_private() {
        return Err(Error::invalid_input("xprv serialization needs a private network tag"));
    }
    let mut buf = Vec::with_capacity(78);
    buf.extend_from_slice(&network.version_bytes());
    buf.push(depth);
    buf.extend_from_slice(&parent_fp.to_be_bytes());
    buf.extend_from_slice(&index.to_be_bytes());
    buf.extend_from_slice(chaincode);
    buf.push(0x00);
    buf.extend_from_slice(key);
    debug_assert_eq!(buf.len(), 78);
    Ok(bitcoin::base58::encode_check(&buf))
}

/// Serialize an extended public key (xpub) as base58check.
pub fn serialize_xpub(
    network: Bip32Network,
    depth: u8,
    parent_fp: u32,
    index: u32,
    chaincode: &[u8; 32],
    key: &[u8; 33],
) -> Result<String> {
    if network.is_private() {
        return Err(Error::invalid_input("xpub serialization needs a public network tag"));
    }
    let mut buf = Vec::with_capacity(78);
    buf.extend_from_slice(&network.version_bytes());
    buf.push(depth);
    buf.extend_from_slice(&parent_fp.to_be_bytes());
    buf.extend_from_slice(&index.to_be_bytes());
    buf.extend_from_slice(chaincode);
    buf.extend_from_slice(key);
    debug_assert_eq!(buf.len(), 78);
    Ok(bitcoin::base58::encode_check(&buf))
}

/// Decoded fields of a serialized xprv.
pub struct DecodedPrivate {
    pub network: Bip32Network,
    pub depth: u8,
    pub parent_fingerprint: u32,
    pub index: u32,
    pub chaincode: [u8; 32],
    pub key: [u8; 32],
}

pub fn deserialize_xprv(serialized: &str) -> Result<DecodedPrivate> {
    let data = bitcoin::base58::decode_check(serialized)
        .map_err(|e| Error::invalid_input(format!("bad base58check xprv: {e}")))?;
    if data.len() != 78 {
        return Err(Error::invalid_input("xprv must decode to 78 bytes"));
    }
    if data[45] != 0x00 {
        return Err(Error::invalid_input("xprv padding byte must be zero"));
    }
    let network = Bip32Network::from_version_bytes([data[0], data[1], data[2], data[3]])?;
    if !network.is_private() {
        return Err(Error::invalid_input("not an xprv version byte"));
    }
    let mut chaincode = [0u8; 32];
    chaincode.copy_from_slice(&data[13..45]);
    let mut key = [0u8; 32];
    key.copy_from_slice(&data[46..78]);
    Ok(DecodedPrivate {
        network,
        depth: data[4],
        parent_fingerprint: u32::from_be_bytes([data[5], data[6], data[7], data[8]]),
        index: u32::from_be_bytes([data[9], data[10], data[11], data[12]]),
        chaincode,
        key,
    })
}

/// Decoded fields of a serialized xpub.
pub struct DecodedPublic {
    pub network: Bip32Network,
    pub depth: u8,
    pub parent_fingerprint: u32,
    pub index: u32,
    pub chaincode: [u8; 32],
    pub key: [u8; 33],
}

pub fn deserialize_xpub(serialized: &str) -> Result<DecodedPublic> {
    let data = bitcoin::base58::decode_check(serialized)
        .map_err(|e| Error::invalid_input(format!("bad base58check xpub: {e}")))?;
    if data.len() != 78 {
        return Err(Error::invalid_input("xpub must decode to 78 bytes"));
    }
    let network = Bip32Network::from_version_bytes([data[0], data[1], data[2], data[3]])?;
    if network.is_private() {
        return Err(Error::invalid_input("not an xpub version byte"));
    }
    let mut chaincode = [0u8; 32];
    chaincode.copy_from_slice(&data[13..45]);
    let mut key = [0u8; 33];
    key.copy_from_slice(&data[45..78]);
    Ok(DecodedPublic {
        network,
        depth: data[4],
        parent_fingerprint: u32::from_be_bytes([data[5], data[6], data[7], data[8]]),
        index: u32::from_be_bytes([data[9], data[10], data[11], data[12]]),
        chaincode,
        key,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex32(s: &str) -> [u8; 32] {
        let v = hex::decode(s).unwrap();
        v.try_into().unwrap()
    }

    #[test]
    fn test_vector_1_m_0h() {
        let seed = hex::decode("000102030405060708090a0b0c0d0e0f").unwrap();
        let path = HDPath::with_indices("seed-1", vec![HARDENED]);
        let key = derive_key(Curve::Secp256k1, &seed, &path).unwrap();

        assert_eq!(
            *key.chaincode(),
            hex32("47fdacbd0f1097043b78c63c20c34ef4ed9a111d980047ad16282c7ae6236141")
        );

        let xprv = serialize_xprv(
            Bip32Network::MainnetPrivate,
            1,
            key.parent_fingerprint(),
            HARDENED,
            key.chaincode(),
            key.private_key().unwrap(),
        )
        .unwrap();
        assert!(xprv.starts_with("xprv9uHRZZ"));
    }

    #[test]
    fn test_xprv_roundtrip() {
        let seed = hex::decode("000102030405060708090a0b0c0d0e0f").unwrap();
        let path = HDPath::new("seed-1");
        let key = derive_key(Curve::Secp256k1, &seed, &path).unwrap();

        let xprv = serialize_xprv(
            Bip32Network::MainnetPrivate,
            0,
            0,
            0,
            key.chaincode(),
            key.private_key().unwrap(),
        )
        .unwrap();
        let decoded = deserialize_xprv(&xprv).unwrap();
        assert_eq!(decoded.chaincode, *key.chaincode());
        assert_eq!(&decoded.key, key.private_key().unwrap());
    }

    #[test]
    fn test_xpub_roundtrip() {
        let seed = hex::decode("000102030405060708090a0b0c0d0e0f").unwrap();
        let path = HDPath::new("seed-1");
        let key = derive_key(Curve::Secp256k1, &seed, &path).unwrap();

        let xpub = serialize_xpub(Bip32Network::MainnetPublic, 0, 0, 0, key.chaincode(), key.public_key())
            .unwrap();
        let decoded = deserialize_xpub(&xpub).unwrap();
        assert_eq!(&decoded.key, key.public_key());
    }

    #[test]
    fn test_ed25519_normal_derivation_fails() {
        let seed = hex::decode("000102030405060708090a0b0c0d0e0f").unwrap();
        let path = HDPath::new("seed-1");
        let key = derive_key(Curve::Ed25519, &seed, &path).unwrap();

        let err = derive_public(&key, &[0]).unwrap_err();
        assert!(matches!(err, Error::KeyDerivation(_)));
    }

    #[test]
    fn test_ed25519_hardened_derivation_succeeds() {
        let seed = hex::decode("000102030405060708090a0b0c0d0e0f").unwrap();
        let path = HDPath::new("seed-1");
        let key = derive_key(Curve::Ed25519, &seed, &path).unwrap();

        let child = derive_private(&key, &[HARDENED]).unwrap();
        assert!(child.has_private());
    }

    #[test]
    fn test_hardened_derivation_from_public_only_fails() {
        let seed = hex::decode("000102030405060708090a0b0c0d0e0f").unwrap();
        let path = HDPath::new("seed-1");
        let key = derive_key(Curve::Secp256k1, &seed, &path).unwrap();

        let mut stripped = clone_key(&key);
        stripped.private = None;
        let err = derive_private(&stripped, &[HARDENED]).unwrap_err();
        assert!(matches!(err, Error::KeyDerivation(_)));
    }
}
