//! Proposal, UTXO, and output-template types consumed by
//! [`super::builder::TransactionBuilder`].

use std::sync::Arc;

use bitcoin::{OutPoint, ScriptBuf};

use crate::account::paymentcode::PaymentCode;
use crate::account::{DeterministicSubaccount, PaymentCodeSubaccount, Subchain};

/// Which sighash family an input's chain belongs to. BCH-family chains
/// always use the BIP143 preimage, even for legacy-shaped scripts;
/// BTC-family chains use BIP143 only for segwit inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainFamily {
    Btc,
    Bch,
}

/// One element's worth of signing authority, attached to a [`Utxo`] so
/// the sign phase knows which subaccount(s) to pull private keys from.
#[derive(Clone)]
pub enum UtxoOwner {
    /// A single key controls this output (P2PKH/P2WPKH/P2PK/P2TR).
    Single {
        subaccount: Arc<DeterministicSubaccount>,
        subchain: Subchain,
        index: u32,
    },
    /// A payment-code channel's `Incoming` element controls this output.
    PaymentCode {
        subaccount: Arc<PaymentCodeSubaccount>,
        subchain: Subchain,
        index: u32,
    },
    /// A bare-multisig output (e.g. a previously-created BIP47
    /// notification change output) controlled by several elements at
    /// once. Signed by iterating every signer whose public key appears
    /// in the script's key list.
    Multisig { signers: Vec<UtxoOwner> },
}

/// A spendable output the caller feeds to [`super::builder::TransactionBuilder::add_input`].
///
/// The authoritative UTXO store (confirmation tracking, reorg handling)
/// is an external collaborator; this type is the caller-supplied,
/// already-resolved view of one entry from it.
#[derive(Clone)]
pub struct Utxo {
    pub outpoint: OutPoint,
    pub script_pubkey: ScriptBuf,
    pub value_sats: u64,
    pub owner: UtxoOwner,
    pub confirmations: u32,
}

impl Utxo {
    pub fn new(outpoint: OutPoint, script_pubkey: ScriptBuf, value_sats: u64, owner: UtxoOwner) -> Self {
        Self {
            outpoint,
            script_pubkey,
            value_sats,
            owner,
            confirmations: 0,
        }
    }
}

/// The shape of an output [`TransactionBuilder::create_outputs`] should
/// build, independent of whether it pays a plain script or a BIP47
/// channel's next outgoing address.
///
/// [`TransactionBuilder::create_outputs`]: super::builder::TransactionBuilder::create_outputs
#[derive(Clone)]
pub enum ScriptTemplate {
    P2pkh { pubkey_hash: [u8; 20] },
    P2wpkh { pubkey_hash: [u8; 20] },
    P2sh { script_hash: [u8; 20] },
    P2wsh { script_hash: [u8; 32] },
    P2pk { public_key: [u8; 33] },
    P2tr { output_key: [u8; 32] },
    /// Bare 1-of-N / M-of-N multisig, in script-key order.
    Multisig { m: u8, pubkeys: Vec<[u8; 33]> },
    /// An opaque, caller-supplied script (e.g. a non-standard or
    /// OP_RETURN output).
    Raw { script: Vec<u8> },
    /// Pay the next address on an outgoing BIP47 channel. Resolved
    /// during `create_outputs` by deriving `index` on `subaccount`'s
    /// `Outgoing` subchain.
    PaymentCodeOutgoing {
        subaccount: Arc<PaymentCodeSubaccount>,
        remote: PaymentCode,
        index: u32,
    },
}

/// One payee line item of a [`SpendProposal`].
#[derive(Clone)]
pub struct ProposedOutput {
    pub target: ScriptTemplate,
    pub amount_sats: u64,
    pub memo: Option<String>,
    pub contact_id: Option<String>,
}

/// A BIP47 notification to embed in this proposal's change output.
#[derive(Clone)]
pub struct NotificationRequest {
    pub channel: Arc<PaymentCodeSubaccount>,
}

/// Initiator nym id, payee list, and expiry of a spend — immutable once
/// submitted.
#[derive(Clone)]
pub struct SpendProposal {
    pub initiator_nym_id: String,
    pub outputs: Vec<ProposedOutput>,
    pub expires_at: i64,
    pub notification: Option<NotificationRequest>,
}

impl SpendProposal {
    pub fn total_amount_sats(&self) -> u64 {
        self.outputs.iter().map(|o| o.amount_sats).sum()
    }
}
