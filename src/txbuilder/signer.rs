//! Phase 5 — signing.
//!
//! Dispatches per input on the chain family and the prevout's script
//! kind: BCH-family chains and BTC-family segwit inputs use the BIP143
//! preimage; BTC-family legacy inputs use the classic "blank every
//! other input's script" sighash. Taproot inputs are always key-path
//! spends — this builder never models script-path spends.

use bitcoin::hashes::{sha256d, Hash};
use bitcoin::sighash::{Prevouts, SighashCache, TapSighashType};
use bitcoin::{ScriptBuf, TapTweakHash, Transaction, TxOut, Witness, XOnlyPublicKey};
use secp256k1::{All, Keypair, Message, PublicKey, Secp256k1, SecretKey, SECP256K1};

use crate::common::{Error, Result};
use crate::secret::PasswordPrompt;

use super::builder::PreparedTx;
use super::proposal::{ChainFamily, UtxoOwner};
use super::script::{self, ScriptKind};

/// SIGHASH_ALL. This builder does not support the other sighash flags —
/// every proposal signs the whole transaction.
const SIGHASH_ALL: u32 = 0x01;

/// A fully-signed transaction, ready for broadcast by an external
/// collaborator.
#[derive(Debug, Clone)]
pub struct SignedTransaction {
    pub tx: Transaction,
    pub fee_sats: u64,
    pub is_segwit: bool,
}

impl SignedTransaction {
    pub fn txid(&self) -> String {
        self.tx.compute_txid().to_string()
    }
}

fn double_sha256(data: &[u8]) -> [u8; 32] {
    sha256d::Hash::hash(data).to_byte_array()
}

/// `scriptCode` for a P2WPKH input, per BIP143: the implied P2PKH script
/// of the witness program's 20-byte hash.
fn p2wpkh_script_code(pubkey_hash: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(26);
    out.push(0x19); // push 25 bytes
    out.push(0x76); // OP_DUP
    out.push(0xa9); // OP_HASH160
    out.push(0x14); // push 20 bytes
    out.extend_from_slice(pubkey_hash);
    out.push(0x88); // OP_EQUALVERIFY
    out.push(0xac); // OP_CHECKSIG
    out
}

fn compact_size(n: u64) -> Vec<u8> {
    bitcoin::consensus::encode::serialize(&bitcoin::VarInt(n))
}

/// BIP143 segwit v0 sighash. `script_code` is the scriptCode field
/// (already including its own length prefix, per BIP143).
#[allow(clippy::too_many_arguments)]
fn bip143_sighash(
    tx: &Transaction,
    input_index: usize,
    script_code: &[u8],
    value_sats: u64,
    hash_type: u32,
) -> [u8; 32] {
    let mut hash_prevouts = Vec::new();
    for input in &tx.input {
        hash_prevouts.extend_from_slice(&bitcoin::consensus::encode::serialize(&input.previous_output));
    }
    let hash_prevouts = double_sha256(&hash_prevouts);

    let mut hash_sequence = Vec::new();
    for input in &tx.input {
        hash_sequence.extend_from_slice(&input.sequence.0.to_le_bytes());
    }
    let hash_sequence = double_sha256(&hash_sequence);

    let mut hash_outputs = Vec::new();
    for output in &tx.output {
        hash_outputs.extend_from_slice(&bitcoin::consensus::encode::serialize(output));
    }
    let hash_outputs = double_sha256(&hash_outputs);

    let mut preimage = Vec::new();
    preimage.extend_from_slice(&tx.version.0.to_le_bytes());
    preimage.extend_from_slice(&hash_prevouts);
    preimage.extend_from_slice(&hash_sequence);
    preimage.extend_from_slice(&bitcoin::consensus::encode::serialize(
        &tx.input[input_index].previous_output,
    ));
    preimage.extend_from_slice(script_code);
    preimage.extend_from_slice(&value_sats.to_le_bytes());
    preimage.extend_from_slice(&tx.input[input_index].sequence.0.to_le_bytes());
    preimage.extend_from_slice(&hash_outputs);
    preimage.extend_from_slice(&tx.lock_time.to_consensus_u32().to_le_bytes());
    preimage.extend_from_slice(&hash_type.to_le_bytes());

    double_sha256(&preimage)
}

/// Legacy sighash: a transaction copy with every input's `script_sig`
/// blanked except the input being signed (set to the prevout's
/// script), the sighash type appended, double-SHA256'd.
fn legacy_sighash(tx: &Transaction, input_index: usize, subscript: &ScriptBuf, hash_type: u32) -> [u8; 32] {
    let mut copy = tx.clone();
    for (i, input) in copy.input.iter_mut().enumerate() {
        input.script_sig = if i == input_index {
            subscript.clone()
        } else {
            ScriptBuf::new()
        };
        input.witness = Witness::new();
    }
    let mut bytes = bitcoin::consensus::encode::serialize(&copy);
    bytes.extend_from_slice(&hash_type.to_le_bytes());
    double_sha256(&bytes)
}

fn sign_ecdsa(secp: &Secp256k1<All>, sighash: [u8; 32], secret_key: &SecretKey) -> Result<Vec<u8>> {
    let msg = Message::from_digest(sighash);
    let sig = secp.sign_ecdsa(&msg, secret_key);
    let mut out = sig.serialize_der().to_vec();
    out.push(SIGHASH_ALL as u8);
    Ok(out)
}

/// Recompute the BIP341 key-path tweaked output key for a raw
/// 33-byte-compressed public key, assuming no script-path merkle root —
/// the only shape this builder ever produces or spends.
fn taproot_output_key(secp: &Secp256k1<All>, raw_pubkey: &[u8; 33]) -> Result<[u8; 32]> {
    let pk = PublicKey::from_slice(raw_pubkey)
        .map_err(|e| Error::build_sign(format!("invalid public key for taproot output: {e}")))?;
    let (internal, _parity) = pk.x_only_public_key();
    let tweak = TapTweakHash::from_key_and_tweak(internal, None);
    let (tweaked, _parity) = internal
        .add_tweak(secp, &tweak.to_scalar())
        .map_err(|e| Error::build_sign(format!("taproot tweak failed: {e}")))?;
    Ok(tweaked.serialize())
}

/// One input's resolved signer, fetched from its [`UtxoOwner`] ahead of
/// the actual sighash loop so private-key decryption errors surface
/// before any signature is computed.
struct ResolvedSigner {
    secret_key: SecretKey,
    public_key: [u8; 33],
}

async fn resolve_owner(
    owner: &UtxoOwner,
    prompt: &dyn PasswordPrompt,
    reason: &str,
) -> Result<Vec<ResolvedSigner>> {
    match owner {
        UtxoOwner::Single { subaccount, subchain, index } => {
            let priv_bytes = subaccount.private_key(*subchain, *index, prompt, reason).await?;
            let secret_key = SecretKey::from_slice(&priv_bytes)
                .map_err(|e| Error::build_sign(format!("invalid signing scalar: {e}")))?;
            let public_key = PublicKey::from_secret_key(SECP256K1, &secret_key).serialize();
            Ok(vec![ResolvedSigner { secret_key, public_key }])
        }
        UtxoOwner::PaymentCode { subaccount, subchain, index } => {
            let priv_bytes = subaccount.private_key(*subchain, *index, prompt, reason).await?;
            let secret_key = SecretKey::from_slice(&priv_bytes)
                .map_err(|e| Error::build_sign(format!("invalid signing scalar: {e}")))?;
            let public_key = PublicKey::from_secret_key(SECP256K1, &secret_key).serialize();
            Ok(vec![ResolvedSigner { secret_key, public_key }])
        }
        UtxoOwner::Multisig { signers } => {
            let mut out = Vec::new();
            for s in signers {
                out.extend(Box::pin(resolve_owner(s, prompt, reason)).await?);
            }
            Ok(out)
        }
    }
}

/// Pre-sign validation: the resolved signer's public key must match
/// what the prevout's script actually commits to (by value for
/// P2PK/P2MS/P2TR, by HASH160 for P2PKH/P2WPKH). A mismatch indicates
/// key-store corruption and is fatal.
fn validate_owns_script(
    secp: &Secp256k1<All>,
    kind: ScriptKind,
    script: &ScriptBuf,
    signers: &[ResolvedSigner],
) -> Result<()> {
    match kind {
        ScriptKind::P2pkh => {
            let expected_hash = &script.as_bytes()[3..23];
            let hash = bitcoin::hashes::hash160::Hash::hash(&signers[0].public_key);
            if &hash.to_byte_array()[..] != expected_hash {
                return Err(Error::build_sign("derived public key does not match prevout hash160"));
            }
            Ok(())
        }
        ScriptKind::P2wpkh => {
            let expected_hash = &script.as_bytes()[2..22];
            let hash = bitcoin::hashes::hash160::Hash::hash(&signers[0].public_key);
            if &hash.to_byte_array()[..] != expected_hash {
                return Err(Error::build_sign("derived public key does not match prevout hash160"));
            }
            Ok(())
        }
        ScriptKind::P2pk => {
            let expected = &script.as_bytes()[1..34];
            if &signers[0].public_key[..] != expected {
                return Err(Error::build_sign("derived public key does not match prevout P2PK key"));
            }
            Ok(())
        }
        ScriptKind::P2tr => {
            let expected = &script.as_bytes()[2..34];
            let tweaked = taproot_output_key(secp, &signers[0].public_key)?;
            if &tweaked[..] != expected {
                return Err(Error::build_sign("derived key does not match prevout taproot output key"));
            }
            Ok(())
        }
        ScriptKind::Multisig => {
            let (_m, script_keys) = script::parse_multisig_script(script)?;
            for s in signers {
                if !script_keys.contains(&s.public_key) {
                    return Err(Error::build_sign(
                        "derived multisig signer's public key is not in the prevout's key list",
                    ));
                }
            }
            Ok(())
        }
        ScriptKind::P2sh | ScriptKind::P2wsh | ScriptKind::Raw => Ok(()),
    }
}

/// Sign every input of `prepared`, returning a finished [`SignedTransaction`].
pub async fn sign(
    prepared: PreparedTx,
    chain: ChainFamily,
    prompt: &dyn PasswordPrompt,
    reason: &str,
) -> Result<SignedTransaction> {
    let secp = Secp256k1::new();
    let mut tx = prepared.tx.clone();
    let mut is_segwit = false;

    let prevout_txouts: Vec<TxOut> = prepared
        .utxos
        .iter()
        .map(|u| TxOut {
            value: bitcoin::Amount::from_sat(u.value_sats),
            script_pubkey: u.script_pubkey.clone(),
        })
        .collect();

    for (i, utxo) in prepared.utxos.iter().enumerate() {
        let kind = script::classify(&utxo.script_pubkey);
        let signers = resolve_owner(&utxo.owner, prompt, reason).await?;
        if signers.is_empty() {
            return Err(Error::build_sign("no resolvable signer for input"));
        }
        validate_owns_script(&secp, kind, &utxo.script_pubkey, &signers)?;

        let use_bip143 = matches!(chain, ChainFamily::Bch)
            || matches!(kind, ScriptKind::P2wpkh | ScriptKind::P2wsh | ScriptKind::P2tr);

        match kind {
            ScriptKind::P2tr => {
                is_segwit = true;
                let mut cache = SighashCache::new(&tx);
                let sighash = cache
                    .taproot_key_spend_signature_hash(i, &Prevouts::All(&prevout_txouts), TapSighashType::Default)
                    .map_err(|e| Error::build_sign(format!("taproot sighash failed: {e}")))?;

                let keypair = Keypair::from_secret_key(&secp, &signers[0].secret_key);
                let (internal, _parity) = XOnlyPublicKey::from_keypair(&keypair);
                let tweak = TapTweakHash::from_key_and_tweak(internal, None);
                let tweaked = keypair
                    .add_xonly_tweak(&secp, &tweak.to_scalar())
                    .map_err(|e| Error::build_sign(format!("taproot tweak failed: {e}")))?;

                let msg = Message::from_digest(sighash.to_byte_array());
                let sig = secp.sign_schnorr(&msg, &tweaked);
                let witness_sig = bitcoin::taproot::Signature { signature: sig, sighash_type: TapSighashType::Default };
                tx.input[i].witness = Witness::from_slice(&[witness_sig.to_vec()]);
            }
            ScriptKind::P2wpkh => {
                is_segwit = true;
                let pubkey_hash = &utxo.script_pubkey.as_bytes()[2..22];
                let script_code = p2wpkh_script_code(pubkey_hash);
                let sighash = if use_bip143 {
                    bip143_sighash(&tx, i, &script_code, utxo.value_sats, SIGHASH_ALL)
                } else {
                    legacy_sighash(&tx, i, &utxo.script_pubkey, SIGHASH_ALL)
                };
                let der_sig = sign_ecdsa(&secp, sighash, &signers[0].secret_key)?;
                tx.input[i].witness = Witness::from_slice(&[der_sig, signers[0].public_key.to_vec()]);
            }
            ScriptKind::P2pkh => {
                let sighash = if use_bip143 {
                    // BCH-family legacy-shaped scripts still use the
                    // BIP143 preimage: scriptCode is the prevout script
                    // itself for non-segwit shapes under that family.
                    bip143_sighash(&tx, i, &length_prefixed(&utxo.script_pubkey), utxo.value_sats, SIGHASH_ALL)
                } else {
                    legacy_sighash(&tx, i, &utxo.script_pubkey, SIGHASH_ALL)
                };
                let der_sig = sign_ecdsa(&secp, sighash, &signers[0].secret_key)?;
                let script_sig = bitcoin::blockdata::script::Builder::new()
                    .push_slice(push(&der_sig)?)
                    .push_slice(push(&signers[0].public_key)?)
                    .into_script();
                tx.input[i].script_sig = script_sig;
            }
            ScriptKind::P2pk => {
                let sighash = if use_bip143 {
                    bip143_sighash(&tx, i, &length_prefixed(&utxo.script_pubkey), utxo.value_sats, SIGHASH_ALL)
                } else {
                    legacy_sighash(&tx, i, &utxo.script_pubkey, SIGHASH_ALL)
                };
                let der_sig = sign_ecdsa(&secp, sighash, &signers[0].secret_key)?;
                let script_sig = bitcoin::blockdata::script::Builder::new().push_slice(push(&der_sig)?).into_script();
                tx.input[i].script_sig = script_sig;
            }
            ScriptKind::Multisig => {
                let (m, script_keys) = script::parse_multisig_script(&utxo.script_pubkey)?;
                let sighash = if use_bip143 {
                    bip143_sighash(&tx, i, &length_prefixed(&utxo.script_pubkey), utxo.value_sats, SIGHASH_ALL)
                } else {
                    legacy_sighash(&tx, i, &utxo.script_pubkey, SIGHASH_ALL)
                };
                let mut sigs = Vec::new();
                for key in &script_keys {
                    if let Some(signer) = signers.iter().find(|s| &s.public_key == key) {
                        sigs.push(sign_ecdsa(&secp, sighash, &signer.secret_key)?);
                    }
                }
                if sigs.len() < m as usize {
                    return Err(Error::build_sign(format!(
                        "multisig input needs {m} signatures, only {} available",
                        sigs.len()
                    )));
                }
                let mut builder = bitcoin::blockdata::script::Builder::new().push_opcode(
                    bitcoin::blockdata::opcodes::all::OP_PUSHBYTES_0,
                );
                for sig in sigs.iter().take(m as usize) {
                    builder = builder.push_slice(push(sig)?);
                }
                tx.input[i].script_sig = builder.into_script();
            }
            ScriptKind::P2sh | ScriptKind::P2wsh | ScriptKind::Raw => {
                return Err(Error::build_sign(
                    "signing P2SH/P2WSH/raw inputs requires an explicit redeem/witness script, which this builder does not model",
                ));
            }
        }
    }

    let fee_sats = prepared.utxos.iter().map(|u| u.value_sats).sum::<u64>()
        - tx.output.iter().map(|o| o.value.to_sat()).sum::<u64>();

    Ok(SignedTransaction { tx, fee_sats, is_segwit })
}

fn push(buf: &[u8]) -> Result<bitcoin::script::PushBytesBuf> {
    bitcoin::script::PushBytesBuf::try_from(buf.to_vec())
        .map_err(|e| Error::build_sign(format!("signature push too large: {e}")))
}

/// A CompactSize-length-prefixed script, used as the BIP143 `scriptCode`
/// field for BCH-family legacy-shaped inputs.
fn length_prefixed(script: &ScriptBuf) -> Vec<u8> {
    let mut out = compact_size(script.len() as u64);
    out.extend_from_slice(script.as_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_p2wpkh_script_code_layout() {
        let hash = [0x11u8; 20];
        let code = p2wpkh_script_code(&hash);
        assert_eq!(code.len(), 26);
        assert_eq!(code[0], 0x19);
        assert_eq!(&code[1..4], &[0x76, 0xa9, 0x14]);
        assert_eq!(&code[4..24], &hash);
        assert_eq!(&code[24..], &[0x88, 0xac]);
    }

    #[test]
    fn test_length_prefixed_roundtrips_compact_size() {
        let script = ScriptBuf::from_bytes(vec![0xab; 200]);
        let prefixed = length_prefixed(&script);
        // 200 bytes needs a 3-byte CompactSize (0xfd prefix + u16 LE).
        assert_eq!(prefixed[0], 0xfd);
        assert_eq!(&prefixed[1..3], &200u16.to_le_bytes());
        assert_eq!(&prefixed[3..], script.as_bytes());
    }

    #[test]
    fn test_legacy_and_bip143_sighash_differ_for_same_input() {
        let tx = Transaction {
            version: bitcoin::transaction::Version::TWO,
            lock_time: bitcoin::absolute::LockTime::ZERO,
            input: vec![bitcoin::TxIn {
                previous_output: bitcoin::OutPoint::null(),
                script_sig: ScriptBuf::new(),
                sequence: bitcoin::Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::new(),
            }],
            output: vec![TxOut { value: bitcoin::Amount::from_sat(1_000), script_pubkey: ScriptBuf::new() }],
        };
        let script = ScriptBuf::from_bytes(vec![0x76, 0xa9, 0x14]);
        let legacy = legacy_sighash(&tx, 0, &script, SIGHASH_ALL);
        let segwit = bip143_sighash(&tx, 0, script.as_bytes(), 50_000, SIGHASH_ALL);
        assert_ne!(legacy, segwit);
    }

    #[test]
    fn test_sign_ecdsa_appends_sighash_byte() {
        let secp = Secp256k1::new();
        let secret_key = SecretKey::from_slice(&[0x07; 32]).unwrap();
        let sighash = [0x42u8; 32];
        let sig = sign_ecdsa(&secp, sighash, &secret_key).unwrap();
        assert_eq!(*sig.last().unwrap(), SIGHASH_ALL as u8);
        assert_eq!(sig[0], 0x30); // DER sequence tag
    }

    #[test]
    fn test_taproot_output_key_differs_from_internal_key() {
        let secp = Secp256k1::new();
        let secret_key = SecretKey::from_slice(&[0x09; 32]).unwrap();
        let public_key = PublicKey::from_secret_key(&secp, &secret_key).serialize();
        let tweaked = taproot_output_key(&secp, &public_key).unwrap();
        let (internal, _) = PublicKey::from_slice(&public_key).unwrap().x_only_public_key();
        assert_ne!(tweaked, internal.serialize());
    }

    #[test]
    fn test_validate_owns_script_rejects_wrong_p2pkh_key() {
        let secp = Secp256k1::new();
        let secret_key = SecretKey::from_slice(&[0x01; 32]).unwrap();
        let public_key = PublicKey::from_secret_key(&secp, &secret_key).serialize();
        let signer = ResolvedSigner { secret_key, public_key };

        let wrong_hash = [0xffu8; 20];
        let mut bytes = vec![0x76, 0xa9, 0x14];
        bytes.extend_from_slice(&wrong_hash);
        bytes.extend_from_slice(&[0x88, 0xac]);
        let script = ScriptBuf::from_bytes(bytes);

        let result = validate_owns_script(&secp, ScriptKind::P2pkh, &script, &[signer]);
        assert!(result.is_err());
    }
}
