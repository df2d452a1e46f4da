//! Script construction and classification.
//!
//! Scripts are built by hand from raw opcodes rather than through
//! higher-level `bitcoin` address helpers, so the exact byte layout the
//! sign phase expects (and re-derives for pre-sign validation) is never
//! in question.

use bitcoin::blockdata::opcodes::all::{
    OP_CHECKMULTISIG, OP_CHECKSIG, OP_DUP, OP_EQUAL, OP_EQUALVERIFY, OP_HASH160,
};
use bitcoin::script::{Builder, PushBytesBuf};
use bitcoin::ScriptBuf;

use crate::common::{Error, Result};

use super::proposal::ScriptTemplate;

/// The shape [`classify`] recognized a `script_pubkey` as, used to pick
/// a sighash/signing strategy for an input spending it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptKind {
    P2pkh,
    P2wpkh,
    P2sh,
    P2wsh,
    P2pk,
    P2tr,
    Multisig,
    Raw,
}

fn push(buf: &[u8]) -> Result<PushBytesBuf> {
    PushBytesBuf::try_from(buf.to_vec())
        .map_err(|e| Error::build_funding(format!("script push too large: {e}")))
}

/// Build the `script_pubkey` for one [`ScriptTemplate`]. Payment-code
/// targets are resolved by the caller before this is reached (see
/// `TransactionBuilder::create_outputs`) — this function only handles
/// already-concrete key material.
pub fn build_script(template: &ScriptTemplate) -> Result<ScriptBuf> {
    match template {
        ScriptTemplate::P2pkh { pubkey_hash } => Ok(Builder::new()
            .push_opcode(OP_DUP)
            .push_opcode(OP_HASH160)
            .push_slice(push(pubkey_hash)?)
            .push_opcode(OP_EQUALVERIFY)
            .push_opcode(OP_CHECKSIG)
            .into_script()),

        ScriptTemplate::P2wpkh { pubkey_hash } => {
            Ok(Builder::new().push_int(0).push_slice(push(pubkey_hash)?).into_script())
        }

        ScriptTemplate::P2sh { script_hash } => Ok(Builder::new()
            .push_opcode(OP_HASH160)
            .push_slice(push(script_hash)?)
            .push_opcode(OP_EQUAL)
            .into_script()),

        ScriptTemplate::P2wsh { script_hash } => {
            Ok(Builder::new().push_int(0).push_slice(push(script_hash)?).into_script())
        }

        ScriptTemplate::P2pk { public_key } => Ok(Builder::new()
            .push_slice(push(public_key)?)
            .push_opcode(OP_CHECKSIG)
            .into_script()),

        ScriptTemplate::P2tr { output_key } => {
            Ok(Builder::new().push_int(1).push_slice(push(output_key)?).into_script())
        }

        ScriptTemplate::Multisig { m, pubkeys } => build_multisig_script(*m, pubkeys),

        ScriptTemplate::Raw { script } => Ok(ScriptBuf::from_bytes(script.clone())),

        ScriptTemplate::PaymentCodeOutgoing { .. } => Err(Error::build_funding(
            "payment-code outputs must be resolved to a public key before building a script",
        )),
    }
}

/// Build a bare `m`-of-`n` multisig script in the supplied key order
/// (script-key order).
pub fn build_multisig_script(m: u8, pubkeys: &[[u8; 33]]) -> Result<ScriptBuf> {
    if pubkeys.is_empty() || pubkeys.len() > 16 || m == 0 || (m as usize) > pubkeys.len() {
        return Err(Error::build_funding(format!(
            "invalid multisig shape: {m}-of-{}",
            pubkeys.len()
        )));
    }
    let mut builder = Builder::new().push_int(m as i64);
    for pk in pubkeys {
        builder = builder.push_slice(push(pk)?);
    }
    builder = builder.push_int(pubkeys.len() as i64).push_opcode(OP_CHECKMULTISIG);
    Ok(builder.into_script())
}

/// Classify a `script_pubkey` by matching its exact byte layout, used to
/// choose a signing strategy for the input that spends it. Deliberately
/// independent of `bitcoin::Script`'s own `is_p2*` helpers so the
/// classification matches exactly what [`build_script`] above produces.
pub fn classify(script: &bitcoin::Script) -> ScriptKind {
    let b = script.as_bytes();

    if b.len() == 25 && b[0] == 0x76 && b[1] == 0xa9 && b[2] == 0x14 && b[23] == 0x88 && b[24] == 0xac {
        return ScriptKind::P2pkh;
    }
    if b.len() == 23 && b[0] == 0xa9 && b[1] == 0x14 && b[22] == 0x87 {
        return ScriptKind::P2sh;
    }
    if b.len() == 22 && b[0] == 0x00 && b[1] == 0x14 {
        return ScriptKind::P2wpkh;
    }
    if b.len() == 34 && b[0] == 0x00 && b[1] == 0x20 {
        return ScriptKind::P2wsh;
    }
    if b.len() == 34 && b[0] == 0x51 && b[1] == 0x20 {
        return ScriptKind::P2tr;
    }
    if b.len() == 35 && b[0] == 0x21 && b[34] == 0xac {
        return ScriptKind::P2pk;
    }
    if b.len() > 3 && *b.last().unwrap() == 0xae {
        return ScriptKind::Multisig;
    }
    ScriptKind::Raw
}

/// Parse the `m` and the ordered public keys out of a bare multisig
/// script built by [`build_multisig_script`].
pub fn parse_multisig_script(script: &bitcoin::Script) -> Result<(u8, Vec<[u8; 33]>)> {
    let b = script.as_bytes();
    if b.is_empty() || *b.last().unwrap() != 0xae {
        return Err(Error::build_sign("not a bare multisig script"));
    }
    let op_to_n = |op: u8| -> Option<u8> {
        match op {
            0x51..=0x60 => Some(op - 0x50),
            _ => None,
        }
    };
    let m = op_to_n(b[0]).ok_or_else(|| Error::build_sign("multisig script missing leading OP_m"))?;

    let mut pubkeys = Vec::new();
    let mut cursor = 1usize;
    while cursor < b.len() && b[cursor] == 0x21 {
        let start = cursor + 1;
        let end = start + 33;
        if end > b.len() {
            return Err(Error::build_sign("truncated multisig pubkey push"));
        }
        let mut key = [0u8; 33];
        key.copy_from_slice(&b[start..end]);
        pubkeys.push(key);
        cursor = end;
    }
    let n = op_to_n(*b.get(cursor).ok_or_else(|| Error::build_sign("multisig script missing OP_n"))?)
        .ok_or_else(|| Error::build_sign("multisig script missing trailing OP_n"))?;
    if n as usize != pubkeys.len() {
        return Err(Error::build_sign("multisig script key count mismatch"));
    }
    Ok((m, pubkeys))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_p2pkh_roundtrip_classification() {
        let script = build_script(&ScriptTemplate::P2pkh { pubkey_hash: [7u8; 20] }).unwrap();
        assert_eq!(classify(&script), ScriptKind::P2pkh);
    }

    #[test]
    fn test_p2wpkh_roundtrip_classification() {
        let script = build_script(&ScriptTemplate::P2wpkh { pubkey_hash: [1u8; 20] }).unwrap();
        assert_eq!(classify(&script), ScriptKind::P2wpkh);
    }

    #[test]
    fn test_p2tr_roundtrip_classification() {
        let script = build_script(&ScriptTemplate::P2tr { output_key: [9u8; 32] }).unwrap();
        assert_eq!(classify(&script), ScriptKind::P2tr);
    }

    #[test]
    fn test_multisig_script_roundtrip() {
        let pubkeys = vec![[2u8; 33], [3u8; 33], [4u8; 33]];
        let script = build_multisig_script(1, &pubkeys).unwrap();
        assert_eq!(classify(&script), ScriptKind::Multisig);
        let (m, parsed) = parse_multisig_script(&script).unwrap();
        assert_eq!(m, 1);
        assert_eq!(parsed, pubkeys);
    }

    #[test]
    fn test_invalid_multisig_shape_rejected() {
        let err = build_multisig_script(0, &[[2u8; 33]]).unwrap_err();
        assert!(matches!(err, Error::BuildFunding(_)));
    }
}
